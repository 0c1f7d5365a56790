//! # Meridian Cluster Runtime
//!
//! The node-side runtime of a meridian game cluster: how processes discover
//! each other, address each other's actors, and serve long-lived client
//! sessions.
//!
//! ## Components
//!
//! * [`bus`] — named-subject publish/subscribe/request transport, with an
//!   embeddable broker so a cluster needs no external services.
//! * [`cluster`] — the member registry and the master/client discovery
//!   protocol that keeps it converged across nodes.
//! * [`actor`] — addressable mailboxes and the `nodeId.actorId.func` RPC
//!   dispatch, local or over the bus.
//! * [`session`] — per-connection agents: packet decoding, heartbeats,
//!   ordered writes, and command dispatch into the actor system.
//! * [`app`] — the facade tying one node's instances of the above together.
//!
//! ## A minimal node
//!
//! ```no_run
//! use meridian_cluster::app::ApplicationBuilder;
//! use meridian_cluster::config::Profile;
//! use meridian_cluster::session::Connector;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let profile = Profile::from_file("profile.toml")?;
//! let app = ApplicationBuilder::new(profile, "gate-1").start().await?;
//!
//! // gates additionally accept clients:
//! let _connector = Connector::bind_tcp("0.0.0.0:5100", app.agent_factory()).await?;
//! # Ok(())
//! # }
//! ```

pub mod actor;
pub mod app;
pub mod bus;
pub mod cluster;
pub mod config;
pub mod error;
pub mod logging;
pub mod session;

pub use app::{Application, ApplicationBuilder};
pub use error::ClusterError;

// The wire crate is part of the public API surface (codes, codecs,
// serializers); re-export it so applications depend on one crate.
pub use meridian_wire as wire;
