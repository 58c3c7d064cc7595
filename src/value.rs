use chrono::{DateTime, FixedOffset, SecondsFormat};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

use crate::document::{Blob, Subdocument};

/// A single property value.
///
/// `Map` is the detached form a caller hands in (or gets back from a
/// conflict resolver); assignment converts it into a `Dict`, the adopted
/// form whose identity and change tracking are tied to the owning document.
/// Dates carry no encoded type of their own: they are persisted as RFC-3339
/// strings and reparsed on read.
#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f32),
    Double(f64),
    String(String),
    Date(DateTime<FixedOffset>),
    Blob(Blob),
    Array(Vec<Value>),
    Dict(Subdocument),
    Map(HashMap<String, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Name of the variant, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Date(_) => "date",
            Value::Blob(_) => "blob",
            Value::Array(_) => "array",
            Value::Dict(_) => "dict",
            Value::Map(_) => "map",
        }
    }

    // ==================== Coercions ====================

    pub fn as_bool(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Double(d) => *d != 0.0,
            _ => false,
        }
    }

    pub fn as_i64(&self) -> i64 {
        match self {
            Value::Bool(b) => *b as i64,
            Value::Int(i) => *i,
            Value::Float(f) => *f as i64,
            Value::Double(d) => *d as i64,
            _ => 0,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            Value::Bool(b) => *b as i64 as f64,
            Value::Int(i) => *i as f64,
            Value::Float(f) => *f as f64,
            Value::Double(d) => *d,
            _ => 0.0,
        }
    }

    pub fn as_f32(&self) -> f32 {
        match self {
            Value::Bool(b) => *b as i64 as f32,
            Value::Int(i) => *i as f32,
            Value::Float(f) => *f,
            Value::Double(d) => *d as f32,
            _ => 0.0,
        }
    }

    pub fn as_string(&self) -> Option<String> {
        match self {
            Value::String(s) => Some(s.clone()),
            Value::Date(d) => Some(format_date(d)),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<DateTime<FixedOffset>> {
        match self {
            Value::Date(d) => Some(*d),
            Value::String(s) => parse_date(s),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<Blob> {
        match self {
            Value::Blob(b) => Some(b.clone()),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<Vec<Value>> {
        match self {
            Value::Array(items) => Some(items.clone()),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<Subdocument> {
        match self {
            Value::Dict(sub) => Some(sub.clone()),
            _ => None,
        }
    }

    // ==================== JSON bridge ====================

    /// Convert to a `serde_json::Value`. Blobs become their metadata dicts,
    /// dates their RFC-3339 strings, subdocuments their property snapshots.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Int(i) => JsonValue::Number((*i).into()),
            Value::Float(f) => serde_json::Number::from_f64(*f as f64)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::Double(d) => serde_json::Number::from_f64(*d)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::String(s) => JsonValue::String(s.clone()),
            Value::Date(d) => JsonValue::String(format_date(d)),
            Value::Blob(b) => b.json_properties(),
            Value::Array(items) => JsonValue::Array(items.iter().map(Value::to_json).collect()),
            Value::Dict(sub) => sub.to_json(),
            Value::Map(map) => JsonValue::Object(
                map.iter()
                    .filter(|(_, v)| !v.is_null())
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Build a value from parsed JSON. Objects come back as detached maps;
    /// assignment converts them into subdocuments (or blobs, for
    /// `_cbltype` metadata dicts).
    pub fn from_json(json: &JsonValue) -> Value {
        match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(*b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Double(n.as_f64().unwrap_or(0.0))
                }
            }
            JsonValue::String(s) => Value::String(s.clone()),
            JsonValue::Array(items) => Value::Array(items.iter().map(Value::from_json).collect()),
            JsonValue::Object(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Blob(a), Value::Blob(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Dict(a), Value::Dict(b)) => a.same_instance(b) || a.snapshot() == b.snapshot(),
            (Value::Dict(a), Value::Map(b)) | (Value::Map(b), Value::Dict(a)) => {
                map_eq(&a.snapshot(), b)
            }
            (Value::Map(a), Value::Map(b)) => map_eq(a, b),
            _ => false,
        }
    }
}

/// Key-wise equality ignoring null entries, matching the public
/// properties view in which a null value means "removed".
fn map_eq(a: &HashMap<String, Value>, b: &HashMap<String, Value>) -> bool {
    let live = |m: &HashMap<String, Value>| m.values().filter(|v| !v.is_null()).count();
    if live(a) != live(b) {
        return false;
    }
    a.iter()
        .filter(|(_, v)| !v.is_null())
        .all(|(k, v)| b.get(k).map_or(false, |other| v == other))
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f32> for Value {
    fn from(f: f32) -> Self {
        Value::Float(f)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<DateTime<FixedOffset>> for Value {
    fn from(d: DateTime<FixedOffset>) -> Self {
        Value::Date(d)
    }
}

impl From<DateTime<chrono::Utc>> for Value {
    fn from(d: DateTime<chrono::Utc>) -> Self {
        Value::Date(d.fixed_offset())
    }
}

impl From<Blob> for Value {
    fn from(b: Blob) -> Self {
        Value::Blob(b)
    }
}

impl From<Subdocument> for Value {
    fn from(s: Subdocument) -> Self {
        Value::Dict(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<HashMap<String, Value>> for Value {
    fn from(map: HashMap<String, Value>) -> Self {
        Value::Map(map)
    }
}

// ==================== Dates ====================

/// Format a date for persistence: RFC-3339 with full sub-second precision
/// and a numeric offset, so a parse of the output reproduces the instant.
pub fn format_date(date: &DateTime<FixedOffset>) -> String {
    date.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Parse an RFC-3339 date string; a non-parseable string yields None.
pub fn parse_date(s: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(s).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_date_roundtrip() {
        let now = Utc::now().fixed_offset();
        let encoded = format_date(&now);
        let decoded = parse_date(&encoded).expect("formatted date should parse back");
        assert_eq!(decoded, now);
    }

    #[test]
    fn test_parse_date_rejects_garbage() {
        assert!(parse_date("not a date").is_none());
        assert!(parse_date("2024-13-45T99:00:00Z").is_none());
        assert!(parse_date("").is_none());
    }

    #[test]
    fn test_numeric_coercion() {
        assert_eq!(Value::Int(2).as_f64(), 2.0);
        assert_eq!(Value::Double(1.9).as_i64(), 1);
        assert_eq!(Value::Float(1.2).as_f32(), 1.2f32);
        assert!(Value::Int(1).as_bool());
        assert!(!Value::Int(0).as_bool());
        assert_eq!(Value::Bool(true).as_i64(), 1);
        assert_eq!(Value::String("5".to_string()).as_i64(), 0);
    }

    #[test]
    fn test_zero_values_for_wrong_types() {
        let v = Value::String("str".to_string());
        assert!(!v.as_bool());
        assert_eq!(v.as_i64(), 0);
        assert_eq!(v.as_f64(), 0.0);
        assert!(v.as_blob().is_none());
        assert!(v.as_array().is_none());
        assert!(v.as_dict().is_none());
    }

    #[test]
    fn test_json_number_split() {
        let v = Value::from_json(&serde_json::json!(42));
        assert!(matches!(v, Value::Int(42)));
        let v = Value::from_json(&serde_json::json!(1.5));
        assert!(matches!(v, Value::Double(d) if d == 1.5));
    }

    #[test]
    fn test_map_equality_ignores_nulls() {
        let mut a = HashMap::new();
        a.insert("x".to_string(), Value::Int(1));
        a.insert("gone".to_string(), Value::Null);
        let mut b = HashMap::new();
        b.insert("x".to_string(), Value::Int(1));
        assert_eq!(Value::Map(a), Value::Map(b));
    }
}
