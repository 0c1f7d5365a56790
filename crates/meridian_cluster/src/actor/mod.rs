//! Actor-based RPC plane.
//!
//! Every addressable unit of game logic is an actor: a named, single-worker
//! mailbox living on some node. Calls address actors as
//! `nodeId.actorId[.childId]` and are either fire-and-forget ([`ActorSystem::call`])
//! or request/response ([`ActorSystem::call_wait`]). Local targets go
//! straight to the mailbox; remote targets are validated against the member
//! registry and shipped over the bus on `meridian.rpc.<nodeId>`.

mod path;
mod remote;
mod system;

pub use path::ActorPath;
pub use remote::{rpc_subject, spawn_rpc_responder, RemoteRequest, RemoteResponse};
pub use system::{ActorHandler, ActorSystem, DEFAULT_CALL_TIMEOUT};
