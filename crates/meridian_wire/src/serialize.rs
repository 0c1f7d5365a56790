//! Payload serializer abstraction.
//!
//! Application payloads cross two boundaries — the client protocol and the
//! cluster bus — and both sides of each boundary must agree on one format.
//! The trait is type-erased through `serde_json::Value` so it stays object
//! safe; typed call sites use the [`marshal`]/[`unmarshal`] helpers.
//!
//! [`marshal`]: crate::serialize::marshal
//! [`unmarshal`]: crate::serialize::unmarshal

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::WireError;

/// Object-safe serializer installed on the application facade.
pub trait Serializer: Send + Sync {
    /// Short format name for logs ("json", ...).
    fn name(&self) -> &'static str;

    fn serialize_value(&self, value: &serde_json::Value) -> Result<Vec<u8>, WireError>;

    fn deserialize_value(&self, data: &[u8]) -> Result<serde_json::Value, WireError>;
}

/// Marshal a typed payload through `serializer`.
pub fn marshal<T: Serialize>(serializer: &dyn Serializer, value: &T) -> Result<Vec<u8>, WireError> {
    let value = serde_json::to_value(value)?;
    serializer.serialize_value(&value)
}

/// Unmarshal bytes into a typed payload through `serializer`.
pub fn unmarshal<T: DeserializeOwned>(
    serializer: &dyn Serializer,
    data: &[u8],
) -> Result<T, WireError> {
    let value = serializer.deserialize_value(data)?;
    Ok(serde_json::from_value(value)?)
}

/// The default serializer: compact JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn serialize_value(&self, value: &serde_json::Value) -> Result<Vec<u8>, WireError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize_value(&self, data: &[u8]) -> Result<serde_json::Value, WireError> {
        // An empty payload reads as null so fire-and-forget calls can omit
        // their argument entirely.
        if data.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Login {
        account: String,
        token: String,
    }

    #[test]
    fn typed_round_trip() {
        let s = JsonSerializer;
        let login = Login {
            account: "bob".into(),
            token: "t0k".into(),
        };
        let bytes = marshal(&s, &login).unwrap();
        let back: Login = unmarshal(&s, &bytes).unwrap();
        assert_eq!(back, login);
    }

    #[test]
    fn empty_payload_is_null() {
        let s = JsonSerializer;
        let value: Option<i64> = unmarshal(&s, &[]).unwrap();
        assert_eq!(value, None);
    }

    #[test]
    fn garbage_is_rejected() {
        let s = JsonSerializer;
        assert!(unmarshal::<Login>(&s, b"\xFF\xFE").is_err());
    }
}
