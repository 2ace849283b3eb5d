//! Conversion between plain JSON and Firestore's typed value encoding.
//!
//! | JSON | Firestore |
//! |------|-----------|
//! | `null` | `{"nullValue": null}` |
//! | `true` | `{"booleanValue": true}` |
//! | `42` | `{"integerValue": "42"}` |
//! | `1.5` | `{"doubleValue": 1.5}` |
//! | `"s"` | `{"stringValue": "s"}` |
//! | `[..]` | `{"arrayValue": {"values": [..]}}` |
//! | `{..}` | `{"mapValue": {"fields": {..}}}` |
//!
//! Timestamps, references and bytes decode to their string form; geo points
//! decode to `{"latitude", "longitude"}`. Fields named as timestamps encode
//! `YYYY-MM-DD` and RFC 3339 strings as `timestampValue`.

use chrono::{DateTime, NaiveDate};
use serde_json::{json, Map, Value};

use crate::error::{Error, Result};

pub fn encode(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Number(n) => match n.as_i64() {
            Some(i) => json!({ "integerValue": i.to_string() }),
            None => json!({ "doubleValue": n }),
        },
        Value::String(s) => json!({ "stringValue": s }),
        Value::Array(items) => {
            let values: Vec<Value> = items.iter().map(encode).collect();
            json!({ "arrayValue": { "values": values } })
        }
        Value::Object(map) => json!({ "mapValue": { "fields": encode_fields(map) } }),
    }
}

pub fn encode_fields(fields: &Map<String, Value>) -> Map<String, Value> {
    fields
        .iter()
        .map(|(name, value)| (name.clone(), encode(value)))
        .collect()
}

/// Like [`encode_fields`], writing the top-level fields in `timestamp_fields`
/// as timestamps.
pub fn encode_document(fields: &Map<String, Value>, timestamp_fields: &[String]) -> Map<String, Value> {
    fields
        .iter()
        .map(|(name, value)| {
            let encoded = if timestamp_fields.iter().any(|f| f == name) {
                encode_timestamp(value)
            } else {
                encode(value)
            };
            (name.clone(), encoded)
        })
        .collect()
}

/// A bare date becomes midnight UTC. Values that are not dates or RFC 3339
/// timestamps (including `null`) encode as usual.
pub fn encode_timestamp(value: &Value) -> Value {
    let Some(text) = value.as_str() else {
        return encode(value);
    };
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return json!({ "timestampValue": format!("{}T00:00:00Z", date.format("%Y-%m-%d")) });
    }
    if DateTime::parse_from_rfc3339(text).is_ok() {
        return json!({ "timestampValue": text });
    }
    encode(value)
}

pub fn decode(value: &Value) -> Result<Value> {
    let Some(object) = value.as_object() else {
        return Err(Error::Decode(format!("expected a typed value, got {value}")));
    };
    let Some((kind, inner)) = object.iter().next() else {
        return Err(Error::Decode("empty typed value".to_string()));
    };

    match kind.as_str() {
        "nullValue" => Ok(Value::Null),
        "booleanValue" => inner
            .as_bool()
            .map(Value::Bool)
            .ok_or_else(|| mismatch(kind, inner)),
        "integerValue" => {
            // Integers travel as strings to keep 64-bit precision.
            let parsed = match inner {
                Value::String(s) => s.parse::<i64>().ok(),
                other => other.as_i64(),
            };
            parsed.map(Value::from).ok_or_else(|| mismatch(kind, inner))
        }
        "doubleValue" => match inner {
            Value::Number(_) => Ok(inner.clone()),
            // NaN and infinities arrive as strings.
            Value::String(_) => Ok(Value::Null),
            _ => Err(mismatch(kind, inner)),
        },
        "stringValue" | "timestampValue" | "referenceValue" | "bytesValue" => inner
            .as_str()
            .map(|s| Value::String(s.to_string()))
            .ok_or_else(|| mismatch(kind, inner)),
        "geoPointValue" => Ok(json!({
            "latitude": inner.get("latitude").cloned().unwrap_or(Value::from(0.0)),
            "longitude": inner.get("longitude").cloned().unwrap_or(Value::from(0.0)),
        })),
        "arrayValue" => {
            let values = match inner.get("values") {
                Some(Value::Array(values)) => values.iter().map(decode).collect::<Result<Vec<_>>>()?,
                Some(other) => return Err(mismatch(kind, other)),
                None => Vec::new(),
            };
            Ok(Value::Array(values))
        }
        "mapValue" => {
            let fields = match inner.get("fields") {
                Some(Value::Object(fields)) => decode_fields(fields)?,
                Some(other) => return Err(mismatch(kind, other)),
                None => Map::new(),
            };
            Ok(Value::Object(fields))
        }
        other => Err(Error::Decode(format!("unsupported Firestore value type {other}"))),
    }
}

pub fn decode_fields(fields: &Map<String, Value>) -> Result<Map<String, Value>> {
    fields
        .iter()
        .map(|(name, value)| Ok((name.clone(), decode(value)?)))
        .collect()
}

fn mismatch(kind: &str, inner: &Value) -> Error {
    Error::Decode(format!("{kind} holds unexpected {inner}"))
}
