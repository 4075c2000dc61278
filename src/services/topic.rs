use core::fmt;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Leading segment every ingestible topic must start with.
pub const TOPIC_NAMESPACE: &str = "gateways";

/// Gateway and device named by a `gateways/<gatewayId>/<deviceCode>[/...]` topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicAddress<'a> {
    pub gateway: &'a str,
    pub device_code: &'a str,
}

impl TopicAddress<'_> {
    /// Gateways are addressed by their numeric primary key.
    pub fn gateway_id(&self) -> Option<i32> {
        self.gateway.parse().ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicError {
    /// Fewer than three `/`-separated segments
    TooShort { segments: usize },
    /// First segment is not `gateways`
    WrongNamespace(String),
}

impl Display for TopicError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TopicError::TooShort { segments } => {
                write!(f, "expected at least 3 topic segments, got {}", segments)
            }
            TopicError::WrongNamespace(ns) => {
                write!(f, "expected topic namespace '{}', got '{}'", TOPIC_NAMESPACE, ns)
            }
        }
    }
}

impl Error for TopicError {}

pub fn parse_topic(topic: &str) -> Result<TopicAddress<'_>, TopicError> {
    let parts = topic.trim_matches('/').split('/').collect::<Vec<_>>();
    if parts.len() < 3 {
        return Err(TopicError::TooShort { segments: parts.len() });
    }
    if parts[0] != TOPIC_NAMESPACE {
        return Err(TopicError::WrongNamespace(parts[0].to_string()));
    }
    Ok(TopicAddress {
        gateway: parts[1],
        device_code: parts[2],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_gateway_and_device() {
        let addr = parse_topic("gateways/7/PLC1").unwrap();
        assert_eq!(addr.gateway, "7");
        assert_eq!(addr.device_code, "PLC1");
        assert_eq!(addr.gateway_id(), Some(7));
    }

    #[test]
    fn extra_segments_and_outer_slashes_are_ignored() {
        let addr = parse_topic("/gateways/12/boiler/status/").unwrap();
        assert_eq!(addr.gateway, "12");
        assert_eq!(addr.device_code, "boiler");
    }

    #[test]
    fn rejects_short_topics() {
        assert_eq!(parse_topic("gateways/7"), Err(TopicError::TooShort { segments: 2 }));
        assert_eq!(parse_topic("gateways"), Err(TopicError::TooShort { segments: 1 }));
    }

    #[test]
    fn rejects_other_namespaces() {
        assert_eq!(
            parse_topic("devices/7/PLC1"),
            Err(TopicError::WrongNamespace("devices".to_string()))
        );
        assert!(parse_topic("Gateways/7/PLC1").is_err());
    }

    #[test]
    fn non_numeric_gateway_has_no_id() {
        let addr = parse_topic("gateways/north/PLC1").unwrap();
        assert_eq!(addr.gateway_id(), None);
    }
}
