//! Outer socket framing.
//!
//! Every frame on a client connection is `type:1 || length:3 (big-endian) ||
//! body:length`. The 24-bit length field bounds a frame at 16 MiB on the
//! wire; deployments clamp it further with [`PacketDecoder::with_body_limit`]
//! so a single client cannot force large allocations.

use crate::WireError;

/// Bytes of frame header preceding the body.
pub const HEADER_LEN: usize = 4;

/// Hard ceiling imposed by the 24-bit length field.
pub const MAX_BODY_LEN: usize = (1 << 24) - 1;

/// Default per-connection body limit. Generous for game traffic while small
/// enough that a hostile length prefix cannot balloon memory.
pub const DEFAULT_BODY_LIMIT: usize = 1 << 20;

/// Frame type tag, the first byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Client opening request, carries client metadata.
    Handshake = 1,
    /// Client acknowledgment of the handshake reply.
    HandshakeAck = 2,
    /// Keepalive in either direction.
    Heartbeat = 3,
    /// Application payload: the body is an encoded [`crate::Message`].
    Data = 4,
    /// Server-initiated disconnect with a reason payload.
    Kick = 5,
}

impl TryFrom<u8> for PacketType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        Ok(match value {
            1 => PacketType::Handshake,
            2 => PacketType::HandshakeAck,
            3 => PacketType::Heartbeat,
            4 => PacketType::Data,
            5 => PacketType::Kick,
            other => return Err(WireError::UnknownPacketType(other)),
        })
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub typ: PacketType,
    pub body: Vec<u8>,
}

impl Packet {
    pub fn new(typ: PacketType, body: Vec<u8>) -> Self {
        Self { typ, body }
    }

    /// Frame this packet for the wire.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        if self.body.len() > MAX_BODY_LEN {
            return Err(WireError::PacketTooLarge {
                got: self.body.len(),
                limit: MAX_BODY_LEN,
            });
        }

        let mut out = Vec::with_capacity(HEADER_LEN + self.body.len());
        out.push(self.typ as u8);
        let len = (self.body.len() as u32).to_be_bytes();
        out.extend_from_slice(&len[1..4]);
        out.extend_from_slice(&self.body);
        Ok(out)
    }
}

impl std::fmt::Display for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "packet[{:?}, {} bytes]", self.typ, self.body.len())
    }
}

/// Incremental frame decoder.
///
/// TCP reads hand back arbitrary byte slices: zero, one, or many frames, the
/// last possibly partial. The decoder accumulates across [`feed`] calls and
/// [`next_packet`] yields complete frames one at a time.
///
/// Error contract: [`WireError::PacketTooLarge`] is fatal — the stream can no
/// longer be trusted and the connection must be dropped. An unknown type tag
/// consumes exactly the offending frame, so the caller may log it and keep
/// pulling.
///
/// [`feed`]: PacketDecoder::feed
/// [`next_packet`]: PacketDecoder::next_packet
#[derive(Debug)]
pub struct PacketDecoder {
    buf: Vec<u8>,
    body_limit: usize,
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketDecoder {
    pub fn new() -> Self {
        Self::with_body_limit(DEFAULT_BODY_LIMIT)
    }

    /// Decoder with a custom body limit, clamped to the 24-bit ceiling.
    pub fn with_body_limit(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            body_limit: limit.min(MAX_BODY_LEN),
        }
    }

    /// Append raw bytes read from the connection.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pull the next complete frame, if any.
    pub fn next_packet(&mut self) -> Result<Option<Packet>, WireError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let body_len =
            ((self.buf[1] as usize) << 16) | ((self.buf[2] as usize) << 8) | self.buf[3] as usize;
        if body_len > self.body_limit {
            return Err(WireError::PacketTooLarge {
                got: body_len,
                limit: self.body_limit,
            });
        }

        if self.buf.len() < HEADER_LEN + body_len {
            return Ok(None);
        }

        let type_byte = self.buf[0];
        let frame: Vec<u8> = self.buf.drain(..HEADER_LEN + body_len).collect();
        let typ = PacketType::try_from(type_byte)?;

        Ok(Some(Packet {
            typ,
            body: frame[HEADER_LEN..].to_vec(),
        }))
    }

    /// Bytes currently buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(p: Packet) {
        let wire = p.encode().unwrap();
        let mut dec = PacketDecoder::new();
        dec.feed(&wire);
        let got = dec.next_packet().unwrap().unwrap();
        assert_eq!(got, p);
        assert!(dec.next_packet().unwrap().is_none());
        assert_eq!(dec.buffered(), 0);
    }

    #[test]
    fn encode_decode_round_trip() {
        round_trip(Packet::new(PacketType::Handshake, b"{\"sys\":{}}".to_vec()));
        round_trip(Packet::new(PacketType::Heartbeat, Vec::new()));
        round_trip(Packet::new(PacketType::Data, vec![0u8; 300]));
        round_trip(Packet::new(PacketType::Kick, b"maintenance".to_vec()));
    }

    #[test]
    fn header_layout_is_big_endian() {
        let wire = Packet::new(PacketType::Data, vec![7u8; 0x0102_03])
            .encode()
            .unwrap();
        assert_eq!(wire[0], 4);
        assert_eq!(&wire[1..4], &[0x01, 0x02, 0x03]);
    }

    #[test]
    fn partial_frames_accumulate() {
        let wire = Packet::new(PacketType::Data, b"abcdef".to_vec())
            .encode()
            .unwrap();
        let mut dec = PacketDecoder::new();
        for byte in &wire[..wire.len() - 1] {
            dec.feed(std::slice::from_ref(byte));
            assert!(dec.next_packet().unwrap().is_none());
        }
        dec.feed(&wire[wire.len() - 1..]);
        let got = dec.next_packet().unwrap().unwrap();
        assert_eq!(got.body, b"abcdef");
    }

    #[test]
    fn multiple_frames_in_one_chunk() {
        let mut wire = Packet::new(PacketType::Heartbeat, Vec::new())
            .encode()
            .unwrap();
        wire.extend(Packet::new(PacketType::Data, b"xy".to_vec()).encode().unwrap());

        let mut dec = PacketDecoder::new();
        dec.feed(&wire);
        assert_eq!(
            dec.next_packet().unwrap().unwrap().typ,
            PacketType::Heartbeat
        );
        assert_eq!(dec.next_packet().unwrap().unwrap().body, b"xy");
        assert!(dec.next_packet().unwrap().is_none());
    }

    #[test]
    fn oversize_length_is_fatal() {
        let mut dec = PacketDecoder::with_body_limit(16);
        // Claimed body of 17 bytes against a limit of 16.
        dec.feed(&[4, 0, 0, 17]);
        match dec.next_packet() {
            Err(WireError::PacketTooLarge { got: 17, limit: 16 }) => {}
            other => panic!("expected PacketTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn unknown_type_skips_one_frame() {
        let mut wire = vec![9u8, 0, 0, 2, 0xAA, 0xBB];
        wire.extend(Packet::new(PacketType::Heartbeat, Vec::new()).encode().unwrap());

        let mut dec = PacketDecoder::new();
        dec.feed(&wire);
        assert!(matches!(
            dec.next_packet(),
            Err(WireError::UnknownPacketType(9))
        ));
        // The bad frame was consumed; the stream stays usable.
        assert_eq!(
            dec.next_packet().unwrap().unwrap().typ,
            PacketType::Heartbeat
        );
    }

    #[test]
    fn encode_rejects_oversize_body() {
        let p = Packet::new(PacketType::Data, vec![0u8; MAX_BODY_LEN + 1]);
        assert!(matches!(p.encode(), Err(WireError::PacketTooLarge { .. })));
    }
}
