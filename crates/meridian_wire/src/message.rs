//! Application message codec.
//!
//! Messages ride inside `Data` packets. The header is compact: one byte of
//! `(type << 4) | flags`, then a varint correlation id for request/response
//! pairs, then the route for client-bound kinds, then the serialized payload.
//!
//! Routes appear either inline (length-prefixed UTF-8) or as a u16 index into
//! a dictionary negotiated at handshake. Encode and decode sides must hold
//! the same dictionary; the codec enforces nothing about *how* it was agreed.

use std::collections::HashMap;

use crate::WireError;

const FLAG_ROUTE_DICT: u8 = 0x01;
const FLAG_ERROR: u8 = 0x02;

/// Message kind, stored in the upper four bits of the header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Client-to-server call expecting a [`MessageType::Response`].
    Request = 0,
    /// Client-to-server call with no reply.
    Notify = 1,
    /// Server reply correlated to a request by id.
    Response = 2,
    /// Unsolicited server-to-client delivery.
    Push = 3,
}

impl MessageType {
    /// Request and Response carry the correlation id.
    pub fn has_id(self) -> bool {
        matches!(self, MessageType::Request | MessageType::Response)
    }

    /// Everything except Response carries a route.
    pub fn has_route(self) -> bool {
        !matches!(self, MessageType::Response)
    }
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        Ok(match value {
            0 => MessageType::Request,
            1 => MessageType::Notify,
            2 => MessageType::Response,
            3 => MessageType::Push,
            other => return Err(WireError::UnknownMessageType(other)),
        })
    }
}

/// A decoded application message.
///
/// Well-formed values keep `id` zero for kinds without one and `route` empty
/// for responses; the codec only writes the fields the kind carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub typ: MessageType,
    /// Per-session monotone counter correlating Request and Response.
    pub id: u32,
    pub route: String,
    pub data: Vec<u8>,
    /// Marks a Response whose payload is an error shape.
    pub error: bool,
}

impl Message {
    pub fn request(id: u32, route: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            typ: MessageType::Request,
            id,
            route: route.into(),
            data,
            error: false,
        }
    }

    pub fn notify(route: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            typ: MessageType::Notify,
            id: 0,
            route: route.into(),
            data,
            error: false,
        }
    }

    pub fn response(id: u32, data: Vec<u8>, error: bool) -> Self {
        Self {
            typ: MessageType::Response,
            id,
            route: String::new(),
            data,
            error,
        }
    }

    pub fn push(route: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            typ: MessageType::Push,
            id: 0,
            route: route.into(),
            data,
            error: false,
        }
    }
}

/// Encoder/decoder holding the optional route dictionary.
#[derive(Debug, Default, Clone)]
pub struct MessageCodec {
    route_to_code: HashMap<String, u16>,
    code_to_route: HashMap<u16, String>,
}

impl MessageCodec {
    /// Codec with no dictionary: every route travels inline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Codec using `dict` for route compression on both directions.
    pub fn with_dictionary(dict: HashMap<String, u16>) -> Self {
        let code_to_route = dict.iter().map(|(r, c)| (*c, r.clone())).collect();
        Self {
            route_to_code: dict,
            code_to_route,
        }
    }

    /// The route→code view, e.g. for shipping to clients at handshake.
    pub fn dictionary(&self) -> &HashMap<String, u16> {
        &self.route_to_code
    }

    pub fn encode(&self, msg: &Message) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::with_capacity(8 + msg.route.len() + msg.data.len());

        let dict_code = if msg.typ.has_route() {
            self.route_to_code.get(&msg.route).copied()
        } else {
            None
        };

        let mut flags = 0u8;
        if dict_code.is_some() {
            flags |= FLAG_ROUTE_DICT;
        }
        if msg.error {
            flags |= FLAG_ERROR;
        }
        out.push(((msg.typ as u8) << 4) | flags);

        if msg.typ.has_id() {
            encode_varint(msg.id, &mut out);
        }

        if msg.typ.has_route() {
            match dict_code {
                Some(code) => out.extend_from_slice(&code.to_be_bytes()),
                None => {
                    if msg.route.len() > u8::MAX as usize {
                        return Err(WireError::RouteTooLong(msg.route.len()));
                    }
                    out.push(msg.route.len() as u8);
                    out.extend_from_slice(msg.route.as_bytes());
                }
            }
        }

        out.extend_from_slice(&msg.data);
        Ok(out)
    }

    pub fn decode(&self, data: &[u8]) -> Result<Message, WireError> {
        let mut cursor = data;
        let head = take(&mut cursor, 1, "header")?[0];
        let typ = MessageType::try_from(head >> 4)?;
        let flags = head & 0x0F;

        let id = if typ.has_id() {
            decode_varint(&mut cursor)?
        } else {
            0
        };

        let route = if typ.has_route() {
            if flags & FLAG_ROUTE_DICT != 0 {
                let raw = take(&mut cursor, 2, "route code")?;
                let code = u16::from_be_bytes([raw[0], raw[1]]);
                self.code_to_route
                    .get(&code)
                    .cloned()
                    .ok_or(WireError::RouteCodeUnknown(code))?
            } else {
                let len = take(&mut cursor, 1, "route length")?[0] as usize;
                let raw = take(&mut cursor, len, "route")?;
                std::str::from_utf8(raw)
                    .map_err(|_| WireError::RouteNotUtf8)?
                    .to_string()
            }
        } else {
            String::new()
        };

        Ok(Message {
            typ,
            id,
            route,
            data: cursor.to_vec(),
            error: flags & FLAG_ERROR != 0,
        })
    }
}

fn take<'a>(cursor: &mut &'a [u8], n: usize, what: &'static str) -> Result<&'a [u8], WireError> {
    if cursor.len() < n {
        return Err(WireError::Truncated(what));
    }
    let (head, rest) = cursor.split_at(n);
    *cursor = rest;
    Ok(head)
}

/// 7-bit little-endian varint with continuation bit, as the client protocol
/// has always framed message ids.
fn encode_varint(mut value: u32, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn decode_varint(cursor: &mut &[u8]) -> Result<u32, WireError> {
    let mut value: u32 = 0;
    for shift in 0..5 {
        let byte = take(cursor, 1, "message id")?[0];
        value |= ((byte & 0x7F) as u32) << (shift * 7);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(WireError::Truncated("message id"))
}
