//! Turns one raw sensor event into canonical readings.
//!
//! Producers disagree on naming and casing, so type names are matched case-insensitively
//! against the canonical set plus an explicit alias table. A bad entry only costs that entry.

use crate::models::reading::{Reading, SensorType};
use crate::utils::{coerce_finite, non_empty_str, parse_timestamp};
use chrono::{DateTime, Utc};
use log::debug;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};

/// The top-level event is not something the normalizer can read at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MalformedEventError {
    NotAnObject,
    MissingReadings,
    ReadingsNotAList,
}

impl Display for MalformedEventError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MalformedEventError::NotAnObject => write!(f, "sensor event is not a JSON object"),
            MalformedEventError::MissingReadings => write!(f, "sensor event has no readings"),
            MalformedEventError::ReadingsNotAList => write!(f, "sensor event readings is not a list"),
        }
    }
}

impl std::error::Error for MalformedEventError {}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NormalizedEvent {
    /// In input order.
    pub readings: Vec<Reading>,
    pub battery_level: Option<f64>,
    pub mac_address: Option<String>,
    pub phase: Option<String>,
    pub event_time: Option<DateTime<Utc>>,
    /// Entries discarded for an unknown type, a bad value, or a bad shape.
    pub dropped: usize,
}

#[derive(Debug, Clone)]
pub struct ReadingNormalizer {
    aliases: HashMap<String, SensorType>,
}

impl Default for ReadingNormalizer {
    fn default() -> Self {
        let mut aliases = HashMap::new();
        aliases.insert("soilph".to_string(), SensorType::Ph);
        ReadingNormalizer { aliases }
    }
}

impl ReadingNormalizer {
    /// Adds explicit aliases on top of the fixed `soilph -> ph` mapping.
    pub fn with_aliases<I, S>(aliases: I) -> Self
    where
        I: IntoIterator<Item = (S, SensorType)>,
        S: AsRef<str>,
    {
        let mut normalizer = ReadingNormalizer::default();
        for (name, sensor_type) in aliases {
            normalizer
                .aliases
                .insert(name.as_ref().trim().to_ascii_lowercase(), sensor_type);
        }
        normalizer
    }

    pub fn resolve_type(&self, raw: &str) -> Option<SensorType> {
        let key = raw.trim().to_ascii_lowercase();
        if let Some(t) = self.aliases.get(&key) {
            return Some(*t);
        }
        key.parse().ok()
    }

    /// Pure: output depends only on `event` and `ingested_at`.
    pub fn normalize(&self, event: &Value, ingested_at: DateTime<Utc>) -> Result<NormalizedEvent, MalformedEventError> {
        let obj = event.as_object().ok_or(MalformedEventError::NotAnObject)?;
        let entries = match obj.get("readings") {
            None | Some(Value::Null) => return Err(MalformedEventError::MissingReadings),
            Some(Value::Array(items)) => items,
            Some(_) => return Err(MalformedEventError::ReadingsNotAList),
        };

        let event_time = obj.get("timestamp").and_then(parse_timestamp);
        let default_time = event_time.unwrap_or(ingested_at);

        let mut out = NormalizedEvent {
            readings: Vec::with_capacity(entries.len()),
            battery_level: obj.get("batteryLevel").and_then(coerce_finite),
            mac_address: obj.get("macAddress").and_then(non_empty_str).map(str::to_string),
            phase: obj.get("phase").and_then(non_empty_str).map(str::to_string),
            event_time,
            dropped: 0,
        };

        for (index, entry) in entries.iter().enumerate() {
            match self.normalize_entry(entry, default_time) {
                Ok(reading) => out.readings.push(reading),
                Err(reason) => {
                    debug!("Dropping reading #{}: {}", index, reason);
                    out.dropped += 1;
                }
            }
        }

        Ok(out)
    }

    fn normalize_entry(&self, entry: &Value, default_time: DateTime<Utc>) -> Result<Reading, String> {
        let fields: &Map<String, Value> = entry.as_object().ok_or("entry is not an object")?;

        let raw_type = fields.get("type").and_then(Value::as_str).ok_or("entry has no type")?;
        let sensor_type = self
            .resolve_type(raw_type)
            .ok_or_else(|| format!("unmapped type {:?}", raw_type))?;

        let raw_value = fields.get("value").unwrap_or(&Value::Null);
        let value = coerce_finite(raw_value)
            .ok_or_else(|| format!("{} value {} is not a finite number", sensor_type, raw_value))?;

        let unit = fields.get("unit").and_then(Value::as_str).unwrap_or_default();
        let observed_at = fields
            .get("timestamp")
            .and_then(parse_timestamp)
            .unwrap_or(default_time);

        Reading::new(sensor_type, value, unit, observed_at).ok_or_else(|| format!("{} value is not finite", sensor_type))
    }
}
