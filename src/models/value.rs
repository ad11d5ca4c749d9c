//! The runtime value model shared by arguments and result rows.
//!
//! Every value crossing the adapter boundary is classified once into a
//! [`Value`] and matched exhaustively afterwards.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;

/// A single SQL value, as bound to a placeholder or read from a row.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Integers that arrive wider than a JS-safe number, e.g. `int8` columns.
    BigInt(i128),
    Text(String),
    DateTime(DateTime<Utc>),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    /// Structured object (anything that is not an array).
    Json(JsonValue),
}

/// Coarse runtime class of a scalar value, used when deciding whether a
/// column holds a single primitive type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveClass {
    Number,
    BigInt,
    Text,
    Boolean,
    /// Date-times and byte buffers: objects that are still treated as scalars.
    Object,
}

impl Value {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this value for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::BigInt(_) => "bigint",
            Self::Text(_) => "text",
            Self::DateTime(_) => "datetime",
            Self::Bytes(_) => "bytes",
            Self::Array(_) => "array",
            Self::Json(_) => "json",
        }
    }

    /// Scalar class of this value. `None` for null, arrays and structured objects.
    pub fn primitive_class(&self) -> Option<PrimitiveClass> {
        match self {
            Self::Bool(_) => Some(PrimitiveClass::Boolean),
            Self::Int(_) | Self::Float(_) => Some(PrimitiveClass::Number),
            Self::BigInt(_) => Some(PrimitiveClass::BigInt),
            Self::Text(_) => Some(PrimitiveClass::Text),
            Self::DateTime(_) | Self::Bytes(_) => Some(PrimitiveClass::Object),
            Self::Null | Self::Array(_) | Self::Json(_) => None,
        }
    }

    /// True for null, booleans, numbers and strings.
    pub fn is_plain_primitive(&self) -> bool {
        matches!(
            self,
            Self::Null | Self::Bool(_) | Self::Int(_) | Self::Float(_) | Self::BigInt(_) | Self::Text(_)
        )
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Convert to a `serde_json::Value` using the transport encoding.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Null => JsonValue::Null,
            Self::Bool(b) => JsonValue::Bool(*b),
            Self::Int(i) => JsonValue::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Self::BigInt(i) => JsonValue::String(i.to_string()),
            Self::Text(s) => JsonValue::String(s.clone()),
            Self::DateTime(dt) => JsonValue::String(iso_string(dt)),
            Self::Bytes(b) => {
                use base64::{Engine as _, engine::general_purpose::STANDARD};
                JsonValue::String(STANDARD.encode(b))
            }
            Self::Array(items) => JsonValue::Array(items.iter().map(Value::to_json).collect()),
            Self::Json(v) => v.clone(),
        }
    }
}

/// ISO-8601 text with millisecond precision and a `Z` suffix.
pub fn iso_string(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl From<JsonValue> for Value {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Self::BigInt(u as i128)
                } else {
                    Self::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            JsonValue::String(s) => Self::Text(s),
            JsonValue::Array(items) => Self::Array(items.into_iter().map(Value::from).collect()),
            obj @ JsonValue::Object(_) => Self::Json(obj),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(value as i64)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Self::DateTime(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        JsonValue::deserialize(deserializer).map(Value::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_from_json_classification() {
        assert_eq!(Value::from(json!(null)), Value::Null);
        assert_eq!(Value::from(json!(7)), Value::Int(7));
        assert_eq!(Value::from(json!(1.5)), Value::Float(1.5));
        assert_eq!(Value::from(json!("a")), Value::Text("a".into()));
        assert_eq!(
            Value::from(json!(u64::MAX)),
            Value::BigInt(u64::MAX as i128)
        );
        assert_eq!(
            Value::from(json!([1, "x"])),
            Value::Array(vec![Value::Int(1), Value::Text("x".into())])
        );
        assert!(matches!(Value::from(json!({"a": 1})), Value::Json(_)));
    }

    #[test]
    fn test_primitive_class() {
        assert_eq!(Value::Int(1).primitive_class(), Some(PrimitiveClass::Number));
        assert_eq!(
            Value::Float(1.5).primitive_class(),
            Some(PrimitiveClass::Number)
        );
        assert_eq!(
            Value::Bytes(vec![1]).primitive_class(),
            Some(PrimitiveClass::Object)
        );
        assert_eq!(Value::Null.primitive_class(), None);
        assert_eq!(Value::Array(vec![]).primitive_class(), None);
    }

    #[test]
    fn test_serialize_transport_encoding() {
        let dt = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let encoded = serde_json::to_value(vec![
            Value::BigInt(9007199254740993),
            Value::DateTime(dt),
            Value::Bytes(b"hi".to_vec()),
            Value::Float(f64::NAN),
        ])
        .unwrap();
        assert_eq!(
            encoded,
            json!(["9007199254740993", "2024-01-02T03:04:05.000Z", "aGk=", null])
        );
    }

    #[test]
    fn test_deserialize_from_json_args() {
        let args: Vec<Value> = serde_json::from_str(r#"[1, "two", [3], {"k": true}]"#).unwrap();
        assert_eq!(args.len(), 4);
        assert_eq!(args[1].as_str(), Some("two"));
        assert!(matches!(args[3], Value::Json(_)));
    }

    #[test]
    fn test_option_into_value() {
        let none: Option<i64> = None;
        assert_eq!(Value::from(none), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::Text("x".into()));
    }
}
