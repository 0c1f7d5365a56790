//! Library error types.
//!
//! These are the errors surfaced by cluster infrastructure APIs (bus,
//! registry, discovery, actor registration). They are distinct from the
//! numeric [`meridian_wire::Code`] taxonomy, which is what RPC call sites
//! and clients observe.

use std::time::Duration;

use meridian_wire::WireError;

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The bus client is closed (or never managed to connect).
    #[error("bus unavailable")]
    BusUnavailable,

    /// A bus request/reply exchange expired.
    #[error("bus request timed out after {0:?}")]
    BusTimeout(Duration),

    /// An `add` for an already-known node id with different fields, or a
    /// second self-declared master.
    #[error("member {0} conflicts with an existing registration")]
    MemberConflict(String),

    /// `register` called twice for the same actor id.
    #[error("actor {0} is already registered")]
    ActorAlreadyExists(String),

    /// Child registration against a parent that does not exist.
    #[error("parent actor {0} not found")]
    ParentActorNotFound(String),

    /// Profile file missing, unreadable, or failing validation.
    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),
}
