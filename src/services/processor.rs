use crate::db::metadata::{self, TagChange, TagSync};
use crate::db::models::{DataType, Device, Gateway, NormalizedBatch, Reading};
use crate::db::readings;
use crate::services::payload::{self, DecodedPayload};
use crate::services::queue::QueueMessage;
use crate::services::topic::{self, TopicError};
use core::fmt;
use diesel::PgConnection;
use diesel::prelude::*;
use log::{debug, info};
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Relational metadata the processor reads and auto-provisions.
pub trait MetadataStore {
    fn find_gateway(&mut self, gateway_id: i32) -> Result<Option<Gateway>, String>;

    /// Returns the device and whether this call created it.
    fn find_or_create_device(&mut self, gateway_id: i32, code: &str) -> Result<(Device, bool), String>;

    /// Create or retype every listed tag of one device in a single transaction.
    fn sync_tags(&mut self, device_id: i32, tags: &[(String, DataType)]) -> Result<Vec<TagSync>, String>;
}

/// Destination of normalized reading batches.
pub trait ReadingSink {
    fn persist_batch(&mut self, batch: &NormalizedBatch) -> Result<usize, String>;

    /// False when the underlying connection is gone and should be replaced.
    fn is_alive(&mut self) -> bool {
        true
    }
}

impl MetadataStore for PgConnection {
    fn find_gateway(&mut self, gateway_id: i32) -> Result<Option<Gateway>, String> {
        metadata::find_gateway(self, gateway_id)
    }

    fn find_or_create_device(&mut self, gateway_id: i32, code: &str) -> Result<(Device, bool), String> {
        metadata::find_or_create_device(self, gateway_id, code)
    }

    fn sync_tags(&mut self, device_id: i32, tags: &[(String, DataType)]) -> Result<Vec<TagSync>, String> {
        metadata::sync_tags(self, device_id, tags)
    }
}

impl ReadingSink for PgConnection {
    fn persist_batch(&mut self, batch: &NormalizedBatch) -> Result<usize, String> {
        readings::persist_batch(self, batch)
    }

    fn is_alive(&mut self) -> bool {
        diesel::sql_query("SELECT 1").execute(self).is_ok()
    }
}

/// Where the shared timestamp of a batch comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampSource {
    /// Time the broker client received the message
    #[default]
    Receipt,
    /// The payload's `ts` field, falling back to receipt time when absent or unparseable
    Payload,
}

impl FromStr for TimestampSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "receipt" => Ok(TimestampSource::Receipt),
            "payload" => Ok(TimestampSource::Payload),
            other => Err(format!("TIMESTAMP_SOURCE must be 'receipt' or 'payload', got '{}'", other)),
        }
    }
}

#[derive(Debug)]
pub enum ProcessError {
    MalformedTopic { topic: String, source: TopicError },
    /// Gateway segment is not a known gateway id; gateways are never auto-created
    UnknownGateway { gateway: String, device_code: String },
    /// Device or tag lookup/write failed; the message is abandoned
    Metadata(String),
    /// Time-series write failed and was rolled back; the batch is lost
    Persist(String),
}

impl Display for ProcessError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ProcessError::MalformedTopic { topic, source } => {
                write!(f, "unsupported topic format '{}': {}", topic, source)
            }
            ProcessError::UnknownGateway { gateway, device_code } => write!(
                f,
                "gateway '{}' not found; skipping message for device '{}'",
                gateway, device_code
            ),
            ProcessError::Metadata(e) => write!(f, "metadata update failed: {}", e),
            ProcessError::Persist(e) => write!(f, "failed to persist tag readings: {}", e),
        }
    }
}

impl Error for ProcessError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ProcessError::MalformedTopic { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Result of interpreting one message, before persistence.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub device: Device,
    pub device_created: bool,
    pub tags: Vec<TagSync>,
    pub batch: NormalizedBatch,
}

/// Turns one (topic, payload) unit into metadata updates and a reading batch.
/// Holds no state between messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct PayloadProcessor {
    pub timestamp_source: TimestampSource,
}

impl PayloadProcessor {
    pub fn new(timestamp_source: TimestampSource) -> Self {
        PayloadProcessor { timestamp_source }
    }

    /// Process then persist. Returns the number of readings written.
    pub fn handle<S>(&self, store: &mut S, msg: &QueueMessage) -> Result<usize, ProcessError>
    where
        S: MetadataStore + ReadingSink,
    {
        let outcome = self.process(store, msg)?;
        store.persist_batch(&outcome.batch).map_err(ProcessError::Persist)
    }

    /// Resolve gateway, device and tags for `msg` and build its batch.
    ///
    /// Device creation is committed on its own; all tag writes of the message
    /// are committed together before the batch is returned.
    pub fn process<S: MetadataStore>(&self, store: &mut S, msg: &QueueMessage) -> Result<ProcessOutcome, ProcessError> {
        debug!("MQTT message received on {} (retained={})", msg.topic, msg.retained);

        let addr = topic::parse_topic(&msg.topic).map_err(|source| ProcessError::MalformedTopic {
            topic: msg.topic.clone(),
            source,
        })?;
        let unknown_gateway = || ProcessError::UnknownGateway {
            gateway: addr.gateway.to_string(),
            device_code: addr.device_code.to_string(),
        };

        let gateway_id = addr.gateway_id().ok_or_else(unknown_gateway)?;
        let gateway = store
            .find_gateway(gateway_id)
            .map_err(ProcessError::Metadata)?
            .ok_or_else(unknown_gateway)?;

        let (device, device_created) = store
            .find_or_create_device(gateway.id, addr.device_code)
            .map_err(ProcessError::Metadata)?;
        if device_created {
            info!(
                "Device {} created and linked to gateway {} (id={})",
                device.code, gateway.id, device.id
            );
        }

        let decoded = payload::decode_payload(&msg.payload);
        let time = match (&decoded, self.timestamp_source) {
            (DecodedPayload::Json(v), TimestampSource::Payload) => {
                payload::payload_timestamp(v).unwrap_or(msg.received_at)
            }
            _ => msg.received_at,
        };
        let samples = match &decoded {
            DecodedPayload::Json(v) => payload::extract_samples(v),
            DecodedPayload::Raw(_) => Vec::new(),
        };

        // one entry per code, first-seen order, last inferred type wins
        let mut wanted: Vec<(String, DataType)> = Vec::new();
        let mut position: HashMap<&str, usize> = HashMap::new();
        for sample in &samples {
            let data_type = payload::infer_data_type(&sample.value);
            match position.get(sample.code.as_str()) {
                Some(&i) => wanted[i].1 = data_type,
                None => {
                    position.insert(sample.code.as_str(), wanted.len());
                    wanted.push((sample.code.clone(), data_type));
                }
            }
        }

        let tags = store.sync_tags(device.id, &wanted).map_err(ProcessError::Metadata)?;
        for synced in &tags {
            match &synced.change {
                TagChange::Created => info!(
                    "Tag {} created on device {} as {}",
                    synced.tag.code, device.code, synced.tag.data_type
                ),
                TagChange::Retyped { from } => info!(
                    "Tag {} on device {} changed type {} -> {}",
                    synced.tag.code, device.code, from, synced.tag.data_type
                ),
                TagChange::Unchanged => {}
            }
        }

        let tag_ids = tags
            .iter()
            .map(|s| (s.tag.code.as_str(), s.tag.id))
            .collect::<HashMap<_, _>>();
        let readings = samples
            .iter()
            .filter_map(|sample| {
                let tag_id = *tag_ids.get(sample.code.as_str())?;
                Some(Reading {
                    device_id: device.id,
                    tag_id,
                    gateway_id: Some(gateway.id),
                    value: payload::to_reading_value(&sample.value),
                })
            })
            .collect::<Vec<_>>();

        Ok(ProcessOutcome {
            device,
            device_created,
            tags,
            batch: NormalizedBatch { time, readings },
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MemoryStore;
    use super::*;
    use crate::db::models::ReadingValue;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    const SCENARIO: &str = r#"{"d":[{"tag":"AI.0","value":12.5},{"tag":"DI.0","value":true}]}"#;

    fn msg(topic: &str, payload: &str) -> QueueMessage {
        QueueMessage::new(topic, payload)
    }

    #[test]
    fn end_to_end_scenario_creates_metadata_and_two_readings() {
        let mut store = MemoryStore::with_gateways(&[7]);
        let written = PayloadProcessor::default()
            .handle(&mut store, &msg("gateways/7/PLC1", SCENARIO))
            .unwrap();
        assert_eq!(written, 2);

        assert_eq!(store.devices.len(), 1);
        assert_eq!(store.devices[0].code, "PLC1");
        assert_eq!(store.devices[0].gateway_id, 7);

        let types = store
            .tags
            .iter()
            .map(|t| (t.code.as_str(), t.data_type.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(types, vec![("AI.0", "double"), ("DI.0", "boolean")]);

        let batches = store.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.readings.len(), 2);
        assert_eq!(batch.readings[0].value, ReadingValue::Double(12.5));
        assert_eq!(batch.readings[1].value, ReadingValue::Boolean(true));
        assert!(batch.readings.iter().all(|r| r.gateway_id == Some(7)));
    }

    #[test]
    fn reprocessing_does_not_duplicate_metadata() {
        let mut store = MemoryStore::with_gateways(&[7]);
        let processor = PayloadProcessor::default();
        let first = processor.process(&mut store, &msg("gateways/7/PLC1", SCENARIO)).unwrap();
        let second = processor.process(&mut store, &msg("gateways/7/PLC1", SCENARIO)).unwrap();

        assert!(first.device_created);
        assert!(!second.device_created);
        assert_eq!(first.device, second.device);
        assert_eq!(store.devices.len(), 1);
        assert_eq!(store.tags.len(), 2);
        assert!(second.tags.iter().all(|t| t.change == TagChange::Unchanged));
    }

    #[test]
    fn changed_type_overwrites_stored_tag_type() {
        let mut store = MemoryStore::with_gateways(&[7]);
        let processor = PayloadProcessor::default();
        processor
            .handle(&mut store, &msg("gateways/7/PLC1", r#"{"d":[{"tag":"AI.0","value":12}]}"#))
            .unwrap();
        assert_eq!(store.tags[0].data_type, "integer");

        let outcome = processor
            .process(&mut store, &msg("gateways/7/PLC1", r#"{"d":[{"tag":"AI.0","value":"fault"}]}"#))
            .unwrap();
        assert_eq!(store.tags.len(), 1);
        assert_eq!(store.tags[0].data_type, "text");
        assert_eq!(
            outcome.tags[0].change,
            TagChange::Retyped {
                from: "integer".to_string()
            }
        );
        // earlier readings keep their own type
        let batches = store.batches.lock().unwrap();
        assert_eq!(batches[0].readings[0].value, ReadingValue::Integer(12));
    }

    #[test]
    fn unknown_gateway_is_dropped_without_side_effects() {
        let mut store = MemoryStore::with_gateways(&[7]);
        let err = PayloadProcessor::default()
            .handle(&mut store, &msg("gateways/999/X", SCENARIO))
            .unwrap_err();
        assert!(matches!(err, ProcessError::UnknownGateway { ref gateway, .. } if gateway == "999"));
        assert!(store.devices.is_empty());
        assert!(store.tags.is_empty());
        assert_eq!(store.stored_readings(), 0);
    }

    #[test]
    fn non_numeric_gateway_is_unknown() {
        let mut store = MemoryStore::with_gateways(&[7]);
        let err = PayloadProcessor::default()
            .process(&mut store, &msg("gateways/seven/PLC1", SCENARIO))
            .unwrap_err();
        assert!(matches!(err, ProcessError::UnknownGateway { .. }));
    }

    #[test]
    fn malformed_topic_is_dropped() {
        let mut store = MemoryStore::with_gateways(&[7]);
        for topic in ["gateways/7", "sites/7/PLC1", ""] {
            let err = PayloadProcessor::default()
                .process(&mut store, &msg(topic, SCENARIO))
                .unwrap_err();
            assert!(matches!(err, ProcessError::MalformedTopic { .. }), "{}", topic);
        }
        assert!(store.devices.is_empty());
    }

    #[test]
    fn raw_payload_creates_device_but_no_tags_or_readings() {
        let mut store = MemoryStore::with_gateways(&[7]);
        let written = PayloadProcessor::default()
            .handle(&mut store, &msg("gateways/7/PLC1", "ONLINE"))
            .unwrap();
        assert_eq!(written, 0);
        assert_eq!(store.devices.len(), 1);
        assert!(store.tags.is_empty());
        assert!(store.batches.lock().unwrap().is_empty());
    }

    #[test]
    fn repaired_payload_is_processed() {
        let mut store = MemoryStore::with_gateways(&[7]);
        let outcome = PayloadProcessor::default()
            .process(&mut store, &msg("gateways/7/PLC1", r#"{"d":[{"tag":"A","value":1},]}"#))
            .unwrap();
        assert_eq!(outcome.batch.readings.len(), 1);
        assert_eq!(outcome.batch.readings[0].value, ReadingValue::Integer(1));
    }

    #[test]
    fn tag_failure_stops_processing_of_the_message() {
        let mut store = MemoryStore::with_gateways(&[7]);
        store.fail_tag_sync = true;
        let err = PayloadProcessor::default()
            .handle(&mut store, &msg("gateways/7/PLC1", SCENARIO))
            .unwrap_err();
        assert!(matches!(err, ProcessError::Metadata(_)));
        assert_eq!(store.stored_readings(), 0);
    }

    #[test]
    fn persist_failure_is_reported() {
        let mut store = MemoryStore::with_gateways(&[7]);
        store.fail_persist = true;
        let err = PayloadProcessor::default()
            .handle(&mut store, &msg("gateways/7/PLC1", SCENARIO))
            .unwrap_err();
        assert!(matches!(err, ProcessError::Persist(_)));
        // metadata is committed before the batch write
        assert_eq!(store.tags.len(), 2);
    }

    #[test]
    fn repeated_tag_in_one_payload_uses_last_type() {
        let mut store = MemoryStore::with_gateways(&[7]);
        let outcome = PayloadProcessor::default()
            .process(
                &mut store,
                &msg("gateways/7/PLC1", r#"{"d":[{"tag":"A","value":1},{"tag":"A","value":1.5}]}"#),
            )
            .unwrap();
        assert_eq!(store.tags.len(), 1);
        assert_eq!(store.tags[0].data_type, "double");
        assert_eq!(outcome.batch.readings.len(), 2);
        assert!(outcome.batch.readings.iter().all(|r| r.tag_id == store.tags[0].id));
    }

    #[test]
    fn readings_share_receipt_time_by_default() {
        let mut store = MemoryStore::with_gateways(&[7]);
        let mut m = msg(
            "gateways/7/PLC1",
            r#"{"d":[{"tag":"A","value":1}],"ts":"2017-12-22T08:05:20+0000"}"#,
        );
        let received = Utc.with_ymd_and_hms(2025, 9, 5, 10, 0, 0).unwrap();
        m.received_at = received;

        let outcome = PayloadProcessor::default().process(&mut store, &m).unwrap();
        assert_eq!(outcome.batch.time, received);

        let outcome = PayloadProcessor::new(TimestampSource::Payload)
            .process(&mut store, &m)
            .unwrap();
        assert_eq!(outcome.batch.time, Utc.with_ymd_and_hms(2017, 12, 22, 8, 5, 20).unwrap());
    }

    #[test]
    fn payload_timestamp_falls_back_to_receipt_time() {
        let mut store = MemoryStore::with_gateways(&[7]);
        let mut m = msg("gateways/7/PLC1", r#"{"d":[{"tag":"A","value":1}],"ts":"soon"}"#);
        let received = Utc.with_ymd_and_hms(2025, 9, 5, 10, 0, 0).unwrap();
        m.received_at = received;
        let outcome = PayloadProcessor::new(TimestampSource::Payload)
            .process(&mut store, &m)
            .unwrap();
        assert_eq!(outcome.batch.time, received);
    }

    #[test]
    fn null_and_structured_values_map_to_text_and_jsonb() {
        let mut store = MemoryStore::with_gateways(&[7]);
        let outcome = PayloadProcessor::default()
            .process(
                &mut store,
                &msg(
                    "gateways/7/PLC1",
                    r#"{"d":[{"tag":"N","value":null},{"tag":"J","value":{"a":[1,2]}}]}"#,
                ),
            )
            .unwrap();
        let types = store
            .tags
            .iter()
            .map(|t| (t.code.as_str(), t.data_type.as_str()))
            .collect::<Vec<_>>();
        // tags are written in code order, readings keep payload order
        assert_eq!(types, vec![("J", "jsonb"), ("N", "text")]);
        assert_eq!(outcome.batch.readings[0].value, ReadingValue::Text(None));
        assert_eq!(outcome.batch.readings[1].value, ReadingValue::Json(json!({"a": [1, 2]})));
    }

    #[test]
    fn timestamp_source_parses_case_insensitively() {
        assert_eq!("Payload".parse::<TimestampSource>(), Ok(TimestampSource::Payload));
        assert_eq!(" receipt ".parse::<TimestampSource>(), Ok(TimestampSource::Receipt));
        assert!("ts".parse::<TimestampSource>().is_err());
    }
}
