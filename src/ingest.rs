//! Consumer side of the pipeline: turns published telemetry messages into
//! time-series points.
//!
//! Topics have the shape `/<namespace>/<location>/<measurement>`, payloads
//! are flat JSON objects with a numeric `timestamp` member in seconds since
//! the Unix epoch. Messages that do not fit are dropped; see [`accept`].

use chrono::{DateTime, SecondsFormat, Utc};
use log::*;
use regex::Regex;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::LazyLock;

static TOPIC_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/(\w+)/(\w+)/(\w+)").expect("topic pattern is valid"));

/// Tag key carrying the location segment of the topic.
pub const LOCATION_TAG: &str = "location";
/// Payload member holding the capture time.
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// Why a message was not turned into a point.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IngestError {
    #[error("Topic '{0}' does not match /<namespace>/<location>/<measurement>")]
    MalformedTopic(String),
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
    #[error("Payload has no numeric '{TIMESTAMP_FIELD}' member")]
    MissingTimestamp,
    #[error("Timestamp {0} is not representable")]
    InvalidTimestamp(f64),
}

/// The three segments of a telemetry topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicKey<'a> {
    pub namespace: &'a str,
    pub location: &'a str,
    pub measurement: &'a str,
}

/// Splits a topic into namespace, location and measurement.
///
/// Only the beginning of the topic has to match; further segments are ignored.
pub fn parse_topic(topic: &str) -> Result<TopicKey<'_>, IngestError> {
    let captures = TOPIC_PATTERN
        .captures(topic)
        .ok_or_else(|| IngestError::MalformedTopic(topic.to_string()))?;
    let segment = |i| captures.get(i).map_or("", |m| m.as_str());
    Ok(TopicKey {
        namespace: segment(1),
        location: segment(2),
        measurement: segment(3),
    })
}

/// A field value as stored in the time-series database.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    Boolean(bool),
    Text(String),
}

impl FieldValue {
    /// Converts a JSON scalar; arrays, objects and `null` have no counterpart.
    fn from_json(value: Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(FieldValue::Boolean(b)),
            Value::String(s) => Some(FieldValue::Text(s)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Some(FieldValue::Integer(i)),
                None => n.as_f64().map(FieldValue::Float),
            },
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Integer(v) => write!(f, "{v}i"),
            FieldValue::Boolean(v) => write!(f, "{v}"),
            FieldValue::Text(v) => write!(f, "{v:?}"),
        }
    }
}

/// One point for the time-series store.
#[derive(Debug, Clone, PartialEq)]
pub struct StorePoint {
    pub measurement: String,
    pub location: String,
    pub time: DateTime<Utc>,
    pub fields: Vec<(String, FieldValue)>,
}

/// Converts epoch seconds to a UTC instant, keeping sub-second precision.
pub fn epoch_seconds_to_utc(seconds: f64) -> Result<DateTime<Utc>, IngestError> {
    if !seconds.is_finite() {
        return Err(IngestError::InvalidTimestamp(seconds));
    }
    let whole = seconds.floor();
    let nanos = (((seconds - whole) * 1e9).round() as u32).min(999_999_999);
    if whole < i64::MIN as f64 || whole > i64::MAX as f64 {
        return Err(IngestError::InvalidTimestamp(seconds));
    }
    DateTime::from_timestamp(whole as i64, nanos).ok_or(IngestError::InvalidTimestamp(seconds))
}

impl StorePoint {
    /// Builds a point from one transport message.
    pub fn from_message(topic: &str, payload: &[u8]) -> Result<Self, IngestError> {
        let key = parse_topic(topic)?;
        let mut object: Map<String, Value> = match serde_json::from_slice(payload) {
            Ok(Value::Object(object)) => object,
            Ok(other) => {
                return Err(IngestError::MalformedPayload(format!(
                    "expected a JSON object, got {other}"
                )))
            }
            Err(err) => return Err(IngestError::MalformedPayload(err.to_string())),
        };

        let timestamp = object
            .shift_remove(TIMESTAMP_FIELD)
            .and_then(|value| value.as_f64())
            .ok_or(IngestError::MissingTimestamp)?;
        let time = epoch_seconds_to_utc(timestamp)?;

        let mut fields = Vec::with_capacity(object.len());
        for (name, value) in object {
            match FieldValue::from_json(value) {
                Some(value) => fields.push((name, value)),
                None => warn!("Skipping non-scalar field '{name}' on topic {topic}"),
            }
        }
        if fields.is_empty() {
            return Err(IngestError::MalformedPayload("no storable fields".to_string()));
        }

        Ok(Self {
            measurement: key.measurement.to_string(),
            location: key.location.to_string(),
            time,
            fields,
        })
    }

    /// The point's time as RFC 3339 / ISO-8601 in UTC, e.g. `2023-11-14T22:13:20Z`.
    pub fn time_rfc3339(&self) -> String {
        self.time.to_rfc3339_opts(SecondsFormat::AutoSi, true)
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

impl fmt::Display for StorePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}={} ", self.measurement, LOCATION_TAG, self.location)?;
        for (i, (name, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{name}={value}")?;
        }
        write!(f, " {}", self.time_rfc3339())
    }
}

/// Best-effort ingestion: returns the point for a message, or logs why the
/// message is dropped and returns `None`. Never fails.
pub fn accept(topic: &str, payload: &[u8]) -> Option<StorePoint> {
    match StorePoint::from_message(topic, payload) {
        Ok(point) => {
            trace!("Accepted {point}");
            Some(point)
        }
        Err(err @ IngestError::MalformedTopic(_)) => {
            debug!("Dropping message: {err}");
            None
        }
        Err(err) => {
            warn!("Dropping message on {topic}: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn topic_segments() {
        assert_eq!(
            parse_topic("/dommu/kitchen/power"),
            Ok(TopicKey {
                namespace: "dommu",
                location: "kitchen",
                measurement: "power",
            })
        );
        // prefix match, trailing segments ignored
        assert_eq!(
            parse_topic("/dommu/common/energy/extra").unwrap().measurement,
            "energy"
        );
    }

    #[test]
    fn malformed_topics() {
        for topic in [
            "",
            "/dommu",
            "/dommu/kitchen",
            "dommu/kitchen/power",
            "/dommu//power",
            "/dommu/kit-chen/power",
        ] {
            assert_matches!(parse_topic(topic), Err(IngestError::MalformedTopic(_)), "{topic}");
        }
    }

    #[test]
    fn point_from_message() {
        let point = StorePoint::from_message(
            "/dommu/common/energy",
            br#"{"freq": 50.01, "total_active_energy": 1234.5, "timestamp": 1700000000.5}"#,
        )
        .unwrap();
        assert_eq!(point.measurement, "energy");
        assert_eq!(point.location, "common");
        assert_eq!(point.time_rfc3339(), "2023-11-14T22:13:20.500Z");
        assert_eq!(point.fields.len(), 2);
        assert_eq!(point.field("freq"), Some(&FieldValue::Float(50.01)));
        assert!(point.field("timestamp").is_none());
    }

    #[test]
    fn field_kinds() {
        let point = StorePoint::from_message(
            "/a/b/c",
            br#"{"n": 3, "ok": true, "s": "x", "nested": {"a": 1}, "nothing": null, "timestamp": 0}"#,
        )
        .unwrap();
        assert_eq!(
            point.fields,
            vec![
                ("n".to_string(), FieldValue::Integer(3)),
                ("ok".to_string(), FieldValue::Boolean(true)),
                ("s".to_string(), FieldValue::Text("x".to_string())),
            ]
        );
        assert_eq!(point.time_rfc3339(), "1970-01-01T00:00:00Z");
    }

    #[test]
    fn malformed_payloads() {
        assert_matches!(
            StorePoint::from_message("/a/b/c", b"not json"),
            Err(IngestError::MalformedPayload(_))
        );
        assert_matches!(
            StorePoint::from_message("/a/b/c", b"[1, 2]"),
            Err(IngestError::MalformedPayload(_))
        );
        assert_matches!(
            StorePoint::from_message("/a/b/c", br#"{"v": 1}"#),
            Err(IngestError::MissingTimestamp)
        );
        assert_matches!(
            StorePoint::from_message("/a/b/c", br#"{"v": 1, "timestamp": "yesterday"}"#),
            Err(IngestError::MissingTimestamp)
        );
        assert_matches!(
            StorePoint::from_message("/a/b/c", br#"{"timestamp": 1}"#),
            Err(IngestError::MalformedPayload(_))
        );
        assert_matches!(
            StorePoint::from_message("/a/b/c", br#"{"v": 1, "timestamp": 1e300}"#),
            Err(IngestError::InvalidTimestamp(_))
        );
    }

    #[test]
    fn accept_drops_silently() {
        assert!(accept("/dommu", br#"{"v": 1, "timestamp": 0}"#).is_none());
        assert!(accept("/dommu/kitchen/power", b"{").is_none());
        assert!(accept("/dommu/kitchen/power", br#"{"v": 1, "timestamp": 0}"#).is_some());
    }

    #[test]
    fn display_as_line() {
        let point = StorePoint::from_message(
            "/dommu/kitchen/power",
            br#"{"active_power": 120.5, "count": 2, "timestamp": 1700000000}"#,
        )
        .unwrap();
        assert_eq!(
            point.to_string(),
            "power,location=kitchen active_power=120.5,count=2i 2023-11-14T22:13:20Z"
        );
    }
}
