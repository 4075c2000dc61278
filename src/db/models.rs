//! Diesel model structs for the metadata tables and the `tag_reading` hypertable,
//! plus the in-memory reading batch handed from the processor to the persister.
//!
//! Important: `tag_reading` is a TimescaleDB hypertable created by the migrations;
//! rows are append-only and never updated.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::schema;

/// Value type of a tag, stored as text in `tag.data_type` and `tag_reading.value_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Integer,
    Double,
    Boolean,
    Text,
    Jsonb,
}

impl DataType {
    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Integer => "integer",
            DataType::Double => "double",
            DataType::Boolean => "boolean",
            DataType::Text => "text",
            DataType::Jsonb => "jsonb",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "integer" => Ok(DataType::Integer),
            "double" => Ok(DataType::Double),
            "boolean" => Ok(DataType::Boolean),
            "text" => Ok(DataType::Text),
            "jsonb" => Ok(DataType::Jsonb),
            other => Err(format!("unknown tag data type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::gateway)]
pub struct Gateway {
    pub id: i32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Associations, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::device)]
#[diesel(belongs_to(Gateway))]
pub struct Device {
    pub id: i32,
    pub gateway_id: i32,
    pub code: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::device)]
pub struct NewDevice<'a> {
    pub gateway_id: i32,
    pub code: &'a str,
}

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Associations, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::tag)]
#[diesel(belongs_to(Device))]
pub struct Tag {
    pub id: i32,
    pub device_id: i32,
    pub code: String,
    pub data_type: String,
}

impl Tag {
    /// Stored type; unknown strings (written outside this pipeline) read as `None`.
    pub fn data_type(&self) -> Option<DataType> {
        self.data_type.parse().ok()
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::tag)]
pub struct NewTag<'a> {
    pub device_id: i32,
    pub code: &'a str,
    pub data_type: &'a str,
}

/// One observed value, already typed. The variant decides `value_type` and
/// which value column of `tag_reading` is populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReadingValue {
    Integer(i64),
    Double(f64),
    Boolean(bool),
    /// `None` for a JSON `null`, which is stored as text with every value column NULL.
    Text(Option<String>),
    Json(serde_json::Value),
}

impl ReadingValue {
    pub fn data_type(&self) -> DataType {
        match self {
            ReadingValue::Integer(_) => DataType::Integer,
            ReadingValue::Double(_) => DataType::Double,
            ReadingValue::Boolean(_) => DataType::Boolean,
            ReadingValue::Text(_) => DataType::Text,
            ReadingValue::Json(_) => DataType::Jsonb,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub device_id: i32,
    pub tag_id: i32,
    pub gateway_id: Option<i32>,
    pub value: ReadingValue,
}

/// Readings produced from one inbound message; they all share `time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedBatch {
    pub time: DateTime<Utc>,
    pub readings: Vec<Reading>,
}

impl NormalizedBatch {
    pub fn empty(time: DateTime<Utc>) -> Self {
        NormalizedBatch {
            time,
            readings: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }
}

// Hypertable: tag_reading
#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::tag_reading)]
pub struct TagReading {
    pub time: DateTime<Utc>,
    pub device_id: i32,
    pub tag_id: i32,
    pub gateway_id: Option<i32>,
    pub value_type: String,
    pub value_num: Option<f64>,
    pub value_bool: Option<bool>,
    pub value_text: Option<String>,
    pub value_json: Option<serde_json::Value>,
}

// NULLs are bound rather than rendered as DEFAULT so every row shares one INSERT text.
#[derive(Debug, Clone, PartialEq, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::tag_reading)]
#[diesel(treat_none_as_default_value = false)]
pub struct NewTagReading {
    pub time: DateTime<Utc>,
    pub device_id: i32,
    pub tag_id: i32,
    pub gateway_id: Option<i32>,
    pub value_type: String,
    pub value_num: Option<f64>,
    pub value_bool: Option<bool>,
    pub value_text: Option<String>,
    pub value_json: Option<serde_json::Value>,
}

impl NewTagReading {
    pub fn from_reading(time: DateTime<Utc>, reading: &Reading) -> Self {
        let mut row = NewTagReading {
            time,
            device_id: reading.device_id,
            tag_id: reading.tag_id,
            gateway_id: reading.gateway_id,
            value_type: reading.value.data_type().as_str().to_string(),
            value_num: None,
            value_bool: None,
            value_text: None,
            value_json: None,
        };
        match &reading.value {
            ReadingValue::Integer(v) => row.value_num = Some(*v as f64),
            ReadingValue::Double(v) => row.value_num = Some(*v),
            ReadingValue::Boolean(v) => row.value_bool = Some(*v),
            ReadingValue::Text(v) => row.value_text = v.clone(),
            ReadingValue::Json(v) => row.value_json = Some(v.clone()),
        }
        row
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn reading(value: ReadingValue) -> Reading {
        Reading {
            device_id: 3,
            tag_id: 11,
            gateway_id: Some(7),
            value,
        }
    }

    #[test]
    fn data_type_round_trips_through_its_column_text() {
        for ty in [
            DataType::Integer,
            DataType::Double,
            DataType::Boolean,
            DataType::Text,
            DataType::Jsonb,
        ] {
            assert_eq!(ty.as_str().parse::<DataType>(), Ok(ty));
        }
        assert!("double precision".parse::<DataType>().is_err());
    }

    #[test]
    fn each_value_populates_only_its_column() {
        let ts = Utc.with_ymd_and_hms(2025, 9, 5, 12, 0, 0).unwrap();

        let row = NewTagReading::from_reading(ts, &reading(ReadingValue::Integer(42)));
        assert_eq!(row.value_type, "integer");
        assert_eq!(row.value_num, Some(42.0));
        assert!(row.value_bool.is_none() && row.value_text.is_none() && row.value_json.is_none());

        let row = NewTagReading::from_reading(ts, &reading(ReadingValue::Double(12.5)));
        assert_eq!(row.value_type, "double");
        assert_eq!(row.value_num, Some(12.5));

        let row = NewTagReading::from_reading(ts, &reading(ReadingValue::Boolean(true)));
        assert_eq!(row.value_type, "boolean");
        assert_eq!(row.value_bool, Some(true));
        assert!(row.value_num.is_none());

        let row = NewTagReading::from_reading(ts, &reading(ReadingValue::Text(Some("on".into()))));
        assert_eq!(row.value_type, "text");
        assert_eq!(row.value_text.as_deref(), Some("on"));

        let row = NewTagReading::from_reading(ts, &reading(ReadingValue::Json(json!([1, 2]))));
        assert_eq!(row.value_type, "jsonb");
        assert_eq!(row.value_json, Some(json!([1, 2])));
        assert!(row.value_text.is_none());
    }

    #[test]
    fn null_value_is_text_with_no_columns_set() {
        let ts = Utc.with_ymd_and_hms(2025, 9, 5, 12, 0, 0).unwrap();
        let row = NewTagReading::from_reading(ts, &reading(ReadingValue::Text(None)));
        assert_eq!(row.value_type, "text");
        assert!(row.value_num.is_none());
        assert!(row.value_bool.is_none());
        assert!(row.value_text.is_none());
        assert!(row.value_json.is_none());
        assert_eq!(row.time, ts);
        assert_eq!(row.gateway_id, Some(7));
    }
}
