//! Typed wire values.
//!
//! A value record on the wire is `{"type":"%d","val":42}` or
//! `{"type":"%s","val":"..."}`. Integers are i64 end to end, so
//! `add2(1, 2147483647)` produces exactly 2147483648 with no wraparound.

use serde::de::{self, Deserialize, Deserializer};
use serde::ser::{Serialize, SerializeStruct, Serializer};
use std::fmt;

/// The two value types the protocol knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// `%d` — signed integer.
    Int,
    /// `%s` — UTF-8 string.
    Str,
}

impl ValueKind {
    /// The wire tag for this kind.
    pub fn code(self) -> &'static str {
        match self {
            ValueKind::Int => "%d",
            ValueKind::Str => "%s",
        }
    }

    /// Parse a wire tag back into a kind.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "%d" => Some(ValueKind::Int),
            "%s" => Some(ValueKind::Str),
            _ => None,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A single typed argument or return value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Str(String),
}

impl Value {
    /// The kind tag carried by this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Int(_) => ValueKind::Int,
            Value::Str(_) => ValueKind::Str,
        }
    }

    /// The integer payload, if this is an `Int`.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Str(_) => None,
        }
    }

    /// The string payload, if this is a `Str`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            Value::Int(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Str(v) => f.write_str(v),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut rec = serializer.serialize_struct("Value", 2)?;
        rec.serialize_field("type", self.kind().code())?;
        match self {
            Value::Int(v) => rec.serialize_field("val", v)?,
            Value::Str(v) => rec.serialize_field("val", v)?,
        }
        rec.end()
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(serde::Deserialize)]
        struct Raw {
            #[serde(rename = "type")]
            kind: String,
            val: serde_json::Value,
        }

        let raw = Raw::deserialize(deserializer)?;
        match ValueKind::from_code(&raw.kind) {
            Some(ValueKind::Int) => raw
                .val
                .as_i64()
                .map(Value::Int)
                .ok_or_else(|| de::Error::custom("expected integer val for %d record")),
            Some(ValueKind::Str) => match raw.val {
                serde_json::Value::String(s) => Ok(Value::Str(s)),
                _ => Err(de::Error::custom("expected string val for %s record")),
            },
            None => Err(de::Error::custom(format!(
                "unknown value type tag: {:?}",
                raw.kind
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_roundtrip() {
        let v = Value::Int(2147483648);
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, r#"{"type":"%d","val":2147483648}"#);
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn test_str_roundtrip() {
        let v = Value::Str("hello".to_string());
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, r#"{"type":"%s","val":"hello"}"#);
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn test_negative_int() {
        let back: Value = serde_json::from_str(r#"{"type":"%d","val":-1}"#).unwrap();
        assert_eq!(back, Value::Int(-1));
    }

    #[test]
    fn test_tag_payload_disagreement_rejected() {
        // Tag says integer but the payload is a string.
        let res: Result<Value, _> = serde_json::from_str(r#"{"type":"%d","val":"42"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let res: Result<Value, _> = serde_json::from_str(r#"{"type":"%f","val":1.5}"#);
        assert!(res.is_err());
    }
}
