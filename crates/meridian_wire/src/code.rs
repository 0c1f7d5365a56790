//! Stable numeric result codes.
//!
//! These values travel across the bus and down to game clients, so they are
//! frozen: never renumber an existing entry, only append.

use serde::{Deserialize, Serialize};

/// Result code surfaced by RPC call sites and encoded into client-visible
/// error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
#[repr(i32)]
pub enum Code {
    /// Success.
    Ok = 0,
    /// Operation requires an authenticated (uid-bound) session.
    SessionUidNotBind = 10,
    /// Target node id not present in the member registry.
    DiscoveryNotFoundNode = 11,
    /// The application facade is shutting down.
    AppIsStop = 12,
    /// Bus request failed or timed out.
    NetError = 20,
    /// Response bytes could not be deserialized.
    UnmarshalError = 21,
    /// Request could not be serialized.
    MarshalError = 22,
    /// The remote handler returned an error.
    RemoteExecuteError = 23,
    /// Response did not match the expected shape.
    ReplyParamsError = 24,
    /// Actor path could not be parsed.
    RouteDecodeError = 25,
    /// Routing policy produced no target.
    RouteHashError = 26,
    /// Handler registered but not implemented.
    NotImplement = 27,
    /// Handler lookup failed (unknown actor or function).
    HandlerError = 28,
}

impl Code {
    pub fn is_ok(self) -> bool {
        self == Code::Ok
    }

    pub fn is_fail(self) -> bool {
        self != Code::Ok
    }
}

impl From<Code> for i32 {
    fn from(code: Code) -> i32 {
        code as i32
    }
}

impl TryFrom<i32> for Code {
    type Error = i32;

    fn try_from(value: i32) -> Result<Self, i32> {
        Ok(match value {
            0 => Code::Ok,
            10 => Code::SessionUidNotBind,
            11 => Code::DiscoveryNotFoundNode,
            12 => Code::AppIsStop,
            20 => Code::NetError,
            21 => Code::UnmarshalError,
            22 => Code::MarshalError,
            23 => Code::RemoteExecuteError,
            24 => Code::ReplyParamsError,
            25 => Code::RouteDecodeError,
            26 => Code::RouteHashError,
            27 => Code::NotImplement,
            28 => Code::HandlerError,
            other => return Err(other),
        })
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, *self as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_values_are_frozen() {
        assert_eq!(Code::Ok as i32, 0);
        assert_eq!(Code::SessionUidNotBind as i32, 10);
        assert_eq!(Code::DiscoveryNotFoundNode as i32, 11);
        assert_eq!(Code::AppIsStop as i32, 12);
        assert_eq!(Code::NetError as i32, 20);
        assert_eq!(Code::UnmarshalError as i32, 21);
        assert_eq!(Code::MarshalError as i32, 22);
        assert_eq!(Code::RemoteExecuteError as i32, 23);
        assert_eq!(Code::ReplyParamsError as i32, 24);
        assert_eq!(Code::RouteDecodeError as i32, 25);
        assert_eq!(Code::RouteHashError as i32, 26);
        assert_eq!(Code::NotImplement as i32, 27);
        assert_eq!(Code::HandlerError as i32, 28);
    }

    #[test]
    fn round_trips_through_i32() {
        for value in [0, 10, 11, 12, 20, 21, 22, 23, 24, 25, 26, 27, 28] {
            let code = Code::try_from(value).unwrap();
            assert_eq!(i32::from(code), value);
        }
        assert!(Code::try_from(99).is_err());
    }

    #[test]
    fn ok_helpers() {
        assert!(Code::Ok.is_ok());
        assert!(!Code::Ok.is_fail());
        assert!(Code::NetError.is_fail());
    }
}
