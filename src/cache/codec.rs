//! Value Codec Module
//!
//! Closed set of value encodings and runtime type inference.

use std::fmt;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CacheError, Result};

// == Cache Value ==
/// A value that can be stored in the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    /// Raw bytes, stored verbatim
    Binary(Bytes),
    /// JSON-like data: objects, arrays, numbers, strings, booleans, null
    Structured(Value),
}

impl CacheValue {
    /// Serializes any `Serialize` type into a structured value.
    ///
    /// Fails with [`CacheError::Encoding`] for values JSON cannot
    /// represent, such as maps with non-string keys.
    pub fn structured<T: Serialize>(value: &T) -> Result<Self> {
        Ok(CacheValue::Structured(serde_json::to_value(value)?))
    }

    /// Deserializes a structured value into `T`.
    pub fn deserialize<T: DeserializeOwned>(self) -> Result<T> {
        match self {
            CacheValue::Structured(value) => Ok(serde_json::from_value(value)?),
            CacheValue::Binary(_) => Err(CacheError::Encoding(
                "cannot deserialize a binary value".to_string(),
            )),
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            CacheValue::Binary(bytes) => Some(bytes),
            CacheValue::Structured(_) => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            CacheValue::Structured(value) => Some(value),
            CacheValue::Binary(_) => None,
        }
    }

    pub fn type_name(&self) -> TypeName {
        TypeName::infer(self)
    }
}

impl From<Bytes> for CacheValue {
    fn from(bytes: Bytes) -> Self {
        CacheValue::Binary(bytes)
    }
}

impl From<Vec<u8>> for CacheValue {
    fn from(bytes: Vec<u8>) -> Self {
        CacheValue::Binary(Bytes::from(bytes))
    }
}

impl From<&'static [u8]> for CacheValue {
    fn from(bytes: &'static [u8]) -> Self {
        CacheValue::Binary(Bytes::from_static(bytes))
    }
}

impl From<Value> for CacheValue {
    fn from(value: Value) -> Self {
        CacheValue::Structured(value)
    }
}

impl From<&str> for CacheValue {
    fn from(value: &str) -> Self {
        CacheValue::Structured(Value::String(value.to_string()))
    }
}

impl From<String> for CacheValue {
    fn from(value: String) -> Self {
        CacheValue::Structured(Value::String(value))
    }
}

impl From<i64> for CacheValue {
    fn from(value: i64) -> Self {
        CacheValue::Structured(Value::from(value))
    }
}

impl From<bool> for CacheValue {
    fn from(value: bool) -> Self {
        CacheValue::Structured(Value::Bool(value))
    }
}

// == Type Name ==
/// Encoding recorded in an entry's metadata.
///
/// Wire names match the blob format written by earlier cache versions;
/// the descriptive names are accepted when reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeName {
    #[serde(rename = "buffer", alias = "binary")]
    Binary,
    #[serde(rename = "jsonish", alias = "structured")]
    Structured,
}

impl TypeName {
    /// Inference order. Earlier entries win, so anything that passes the
    /// binary test is stored as binary even if it could be structured.
    pub const PRIORITY: [TypeName; 2] = [TypeName::Binary, TypeName::Structured];

    /// Picks the first type in [`PRIORITY`](Self::PRIORITY) that accepts `value`.
    pub fn infer(value: &CacheValue) -> TypeName {
        Self::PRIORITY
            .into_iter()
            .find(|type_name| type_name.accepts(value))
            .unwrap_or(TypeName::Structured)
    }

    fn accepts(self, value: &CacheValue) -> bool {
        match self {
            TypeName::Binary => matches!(value, CacheValue::Binary(_)),
            TypeName::Structured => true,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TypeName::Binary => "buffer",
            TypeName::Structured => "jsonish",
        }
    }

    pub fn encode(self, value: &CacheValue) -> Result<Bytes> {
        match (self, value) {
            (TypeName::Binary, CacheValue::Binary(bytes)) => Ok(bytes.clone()),
            (TypeName::Structured, CacheValue::Structured(value)) => {
                Ok(Bytes::from(serde_json::to_vec(value)?))
            }
            (type_name, value) => Err(CacheError::Encoding(format!(
                "{} encoding cannot represent a {} value",
                type_name,
                value.type_name()
            ))),
        }
    }

    pub fn decode(self, bytes: Bytes) -> Result<CacheValue> {
        match self {
            TypeName::Binary => Ok(CacheValue::Binary(bytes)),
            TypeName::Structured => Ok(CacheValue::Structured(serde_json::from_slice(&bytes)?)),
        }
    }
}

impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_infer_binary_first() {
        assert_eq!(TypeName::infer(&CacheValue::from(vec![1u8, 2])), TypeName::Binary);
        assert_eq!(TypeName::infer(&CacheValue::from(json!([1, 2]))), TypeName::Structured);
        assert_eq!(TypeName::infer(&CacheValue::from("text")), TypeName::Structured);
    }

    #[test]
    fn test_binary_is_identity() {
        let bytes = Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]);
        let encoded = TypeName::Binary.encode(&CacheValue::Binary(bytes.clone())).unwrap();
        assert_eq!(encoded, bytes);
        assert_eq!(
            TypeName::Binary.decode(encoded).unwrap(),
            CacheValue::Binary(bytes)
        );
    }

    #[test]
    fn test_structured_round_trip() {
        let value = json!({"some": "object", "with": {"some": "random", "properties": true}});
        let encoded = TypeName::Structured
            .encode(&CacheValue::Structured(value.clone()))
            .unwrap();
        assert_eq!(
            TypeName::Structured.decode(encoded).unwrap(),
            CacheValue::Structured(value)
        );
    }

    #[test]
    fn test_mismatched_encoding_is_error() {
        let err = TypeName::Structured
            .encode(&CacheValue::from(vec![1u8]))
            .unwrap_err();
        assert!(matches!(err, CacheError::Encoding(_)));
    }

    #[test]
    fn test_decode_garbage_is_encoding_error() {
        let err = TypeName::Structured
            .decode(Bytes::from_static(b"{not json"))
            .unwrap_err();
        assert!(matches!(err, CacheError::Encoding(_)));
    }

    #[test]
    fn test_unserializable_value_is_encoding_error() {
        let mut map = HashMap::new();
        map.insert(vec![1u8], "tuple keys are not JSON");
        assert!(matches!(
            CacheValue::structured(&map),
            Err(CacheError::Encoding(_))
        ));
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(serde_json::to_string(&TypeName::Binary).unwrap(), "\"buffer\"");
        assert_eq!(serde_json::to_string(&TypeName::Structured).unwrap(), "\"jsonish\"");
        let alias: TypeName = serde_json::from_str("\"structured\"").unwrap();
        assert_eq!(alias, TypeName::Structured);
    }

    #[test]
    fn test_typed_deserialize() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Point {
            x: i32,
            y: i32,
        }

        let value = CacheValue::structured(&Point { x: 1, y: 2 }).unwrap();
        assert_eq!(value.deserialize::<Point>().unwrap(), Point { x: 1, y: 2 });
    }
}
