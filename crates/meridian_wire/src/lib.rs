//! # Meridian Wire Protocol
//!
//! The two layered codecs spoken between game clients and gate nodes, the
//! pluggable payload serializer, and the stable result-code taxonomy shared
//! by every node in a meridian cluster.
//!
//! ## Layering
//!
//! * **Packet** — the outer socket frame: `type:1 || length:3 (BE) || body`.
//!   See [`packet`].
//! * **Message** — the application unit carried inside `Data` packets:
//!   request/notify/response/push with a compact header. See [`message`].
//! * **Serializer** — how message payloads become bytes. JSON by default,
//!   swappable per application. See [`serialize`].
//! * **Code** — the closed numeric taxonomy surfaced to RPC call sites and,
//!   selectively, to clients. See [`code`].
//!
//! Both codecs are pure: encoding then decoding any well-formed value yields
//! the original value, and neither touches global state.

pub mod code;
pub mod message;
pub mod packet;
pub mod serialize;

pub use code::Code;
pub use message::{Message, MessageCodec, MessageType};
pub use packet::{Packet, PacketDecoder, PacketType, MAX_BODY_LEN};
pub use serialize::{JsonSerializer, Serializer};

/// Errors produced by the packet and message codecs.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// A frame declared a body longer than the configured maximum. Fatal for
    /// the connection that produced it.
    #[error("packet body of {got} bytes exceeds limit of {limit}")]
    PacketTooLarge { got: usize, limit: usize },

    /// The first byte of a frame did not name a known packet type.
    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),

    /// The message header named a type outside the taxonomy.
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    /// A message ended before its header said it would.
    #[error("message truncated while reading {0}")]
    Truncated(&'static str),

    /// A dictionary-compressed route index with no dictionary entry.
    #[error("route code {0} not present in dictionary")]
    RouteCodeUnknown(u16),

    /// An inline route that was not valid UTF-8.
    #[error("route is not valid utf-8")]
    RouteNotUtf8,

    /// Inline routes carry a one-byte length prefix.
    #[error("route of {0} bytes exceeds the 255 byte inline limit")]
    RouteTooLong(usize),

    /// Payload (de)serialization failure.
    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}
