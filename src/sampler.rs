//! Telemetry sampling: one pass over the register table per poll cycle.

use crate::{
    bus::RegisterBus,
    protocol::{self as proto, NUMBER_OF_FIELDS},
    tokio_common::Result,
};
use log::*;
use serde_json::{Map, Value};
use std::fmt;

/// The decoded measurements of one poll cycle, in register table order.
///
/// Only [`sample`] builds records, so a record always carries every field of
/// [`proto::TELEMETRY_FIELDS`].
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRecord {
    values: Vec<(&'static str, f64)>,
}

impl TelemetryRecord {
    /// Field name and value pairs in read order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, f64)> + '_ {
        self.values.iter().copied()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Display for TelemetryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}={value:.3}")?;
        }
        Ok(())
    }
}

/// Reads and decodes every field of the register table, in order.
///
/// The first failing read aborts the sample; partial records are never
/// returned.
pub fn sample<B: RegisterBus + ?Sized>(bus: &mut B) -> Result<TelemetryRecord> {
    let mut values = Vec::with_capacity(NUMBER_OF_FIELDS);
    for field in &proto::TELEMETRY_FIELDS {
        let words = bus.read_holding_registers(field.address, field.width.quantity())?;
        let value = field.decode(&words)?;
        debug!("{} = {value:.3} {}", field.name, field.unit);
        values.push((field.name, value));
    }
    Ok(TelemetryRecord { values })
}

/// A record stamped with its capture time, ready to publish.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub record: TelemetryRecord,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
}

impl Reading {
    /// Name of the timestamp member in the published payload.
    pub const TIMESTAMP_FIELD: &'static str = "timestamp";

    pub fn new(record: TelemetryRecord, timestamp: f64) -> Self {
        Self { record, timestamp }
    }

    /// Stamps `record` with the current time.
    pub fn capture(record: TelemetryRecord) -> Self {
        let timestamp = chrono::Utc::now().timestamp_micros() as f64 / 1e6;
        Self::new(record, timestamp)
    }

    /// Flat JSON object: every record field followed by `timestamp`.
    pub fn to_json(&self) -> Value {
        let mut object = Map::with_capacity(self.record.len() + 1);
        for (name, value) in self.record.iter() {
            object.insert(name.to_string(), Value::from(value));
        }
        object.insert(Self::TIMESTAMP_FIELD.to_string(), Value::from(self.timestamp));
        Value::Object(object)
    }

    pub fn to_payload(&self) -> String {
        self.to_json().to_string()
    }
}
