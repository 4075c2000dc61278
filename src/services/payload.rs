//! Decoding of inbound payloads into tag samples.
//!
//! Expected shape:
//!
//! ```json
//! { "d": [ { "tag": "AI.0", "value": 12.0 }, { "tag": "DI.0", "value": true } ],
//!   "ts": "2017-12-22T08:05:20+0000" }
//! ```
//!
//! Gateways in the field occasionally send trailing commas; those are repaired.
//! Anything that is still not JSON is kept as a raw string and yields no samples.

use crate::db::models::{DataType, ReadingValue};
use chrono::{DateTime, Utc};
use log::warn;
use serde_json::Value;

const BOM: char = '\u{feff}';

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedPayload {
    Json(Value),
    Raw(String),
}

/// One `{"tag": ..., "value": ...}` entry of the `d` list.
#[derive(Debug, Clone, PartialEq)]
pub struct TagSample {
    pub code: String,
    pub value: Value,
}

/// Never fails: invalid JSON degrades to [`DecodedPayload::Raw`].
pub fn decode_payload(payload: &str) -> DecodedPayload {
    let payload = payload.strip_prefix(BOM).unwrap_or(payload);
    let trimmed = payload.trim();
    if trimmed.is_empty() {
        return DecodedPayload::Raw(String::new());
    }

    let err = match serde_json::from_str(trimmed) {
        Ok(v) => return DecodedPayload::Json(v),
        Err(e) => e,
    };

    let sanitized = strip_trailing_commas(trimmed);
    if sanitized == trimmed {
        warn!("Payload is not valid JSON, using raw string: {}", err);
        return DecodedPayload::Raw(payload.to_string());
    }
    match serde_json::from_str(&sanitized) {
        Ok(v) => {
            warn!("Payload JSON repaired by removing trailing commas (original error: {})", err);
            DecodedPayload::Json(v)
        }
        Err(e) => {
            warn!("Payload JSON invalid after sanitize; using raw string: {}", e);
            DecodedPayload::Raw(payload.to_string())
        }
    }
}

/// Remove commas that are followed only by whitespace and a closing `}` or `]`,
/// repeating until nothing changes. String literals are left untouched.
pub fn strip_trailing_commas(json: &str) -> String {
    let mut current = json.to_string();
    loop {
        let next = strip_trailing_commas_once(&current);
        if next == current {
            return next;
        }
        current = next;
    }
}

fn strip_trailing_commas_once(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in json.char_indices() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            ',' if matches!(next_significant(&json[i + 1..]), Some('}' | ']')) => {}
            _ => out.push(ch),
        }
    }
    out
}

fn next_significant(rest: &str) -> Option<char> {
    rest.chars().find(|c| !c.is_whitespace())
}

/// Entries of the `d` list that carry both a `tag` and a `value` key.
///
/// A numeric `tag` is taken as its decimal text; other tag kinds are skipped.
/// A `value` of `null` is kept.
pub fn extract_samples(payload: &Value) -> Vec<TagSample> {
    let Some(entries) = payload.get("d").and_then(Value::as_array) else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| {
            let fields = entry.as_object()?;
            let code = match fields.get("tag")? {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => return None,
            };
            let value = fields.get("value")?.clone();
            Some(TagSample { code, value })
        })
        .collect()
}

/// integer -> integer, float -> double, bool -> boolean, string -> text,
/// array/object -> jsonb, null -> text.
///
/// Integers outside the i64 range can only be stored as float8 and are typed double.
pub fn infer_data_type(value: &Value) -> DataType {
    match value {
        Value::Number(n) if n.is_i64() => DataType::Integer,
        Value::Number(_) => DataType::Double,
        Value::Bool(_) => DataType::Boolean,
        Value::String(_) => DataType::Text,
        Value::Array(_) | Value::Object(_) => DataType::Jsonb,
        Value::Null => DataType::Text,
    }
}

pub fn to_reading_value(value: &Value) -> ReadingValue {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(i) => ReadingValue::Integer(i),
            None => ReadingValue::Double(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::Bool(b) => ReadingValue::Boolean(*b),
        Value::String(s) => ReadingValue::Text(Some(s.clone())),
        Value::Array(_) | Value::Object(_) => ReadingValue::Json(value.clone()),
        Value::Null => ReadingValue::Text(None),
    }
}

/// The optional `ts` field, as RFC 3339 or with a compact `+0000` offset.
pub fn payload_timestamp(payload: &Value) -> Option<DateTime<Utc>> {
    let raw = payload.get("ts")?.as_str()?.trim();
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z"))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
