//! Client-facing session layer.
//!
//! Each accepted connection gets one [`Session`] (identity + state) and one
//! [`Agent`] (the reader/writer worker pair that owns the socket). Agents
//! decode the packet protocol, enforce heartbeats, keep outbound writes
//! strictly ordered, and hand inbound packets to [`Command`] implementations
//! — the seam where the session layer dispatches into the actor system.

mod agent;
mod command;
mod conn;
mod connector;
mod session;

pub use agent::{Agent, AgentOptions, MessageBody};
pub use command::{
    default_commands, Command, DataCommand, HandshakeAckCommand, HandshakeCommand,
    HeartbeatCommand,
};
pub use conn::{tcp_conn, ws_conn, AgentConn, ConnReader, ConnWriter};
pub use connector::{AgentFactory, Connector};
pub use session::{Session, SessionState, SessionTable, Sid};
