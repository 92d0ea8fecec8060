use crate::models::reading::{OptimalRange, RangeStatus, Reading, SensorType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

/// A cultivated area; the aggregation key for sensor state.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldId(String);

/// Raised when a store call receives an empty or blank field id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidFieldIdError {
    pub given: String,
}

impl Display for InvalidFieldIdError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "invalid field id {:?}: must be non-empty", self.given)
    }
}

impl std::error::Error for InvalidFieldIdError {}

impl FieldId {
    pub fn new(raw: impl Into<String>) -> Result<Self, InvalidFieldIdError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(InvalidFieldIdError { given: raw });
        }
        Ok(FieldId(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for FieldId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for FieldId {
    type Error = InvalidFieldIdError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        FieldId::new(value)
    }
}

impl TryFrom<String> for FieldId {
    type Error = InvalidFieldIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        FieldId::new(value)
    }
}

impl From<FieldId> for String {
    fn from(value: FieldId) -> Self {
        value.0
    }
}

/// Latest reading for one sensor type plus the optimal range attached on first sight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorSlot {
    pub current: Reading,
    pub optimal: Option<OptimalRange>,
}

impl SensorSlot {
    /// `None` when the slot has no optimal range.
    pub fn status(&self) -> Option<RangeStatus> {
        self.optimal.map(|range| range.classify(self.current.value))
    }
}

/// Point-in-time state of one field. Published as `Arc<FieldState>` and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldState {
    pub field_id: FieldId,
    pub readings: BTreeMap<SensorType, SensorSlot>,
    pub battery_level: Option<f64>,
    pub mac_address: Option<String>,
    pub phase: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
    /// Number of merges applied so far; 0 for a field that never received data.
    pub revision: u64,
}

impl FieldState {
    pub fn empty(field_id: FieldId) -> Self {
        FieldState {
            field_id,
            readings: BTreeMap::new(),
            battery_level: None,
            mac_address: None,
            phase: None,
            last_updated: None,
            revision: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.revision == 0
    }

    pub fn slot(&self, sensor_type: SensorType) -> Option<&SensorSlot> {
        self.readings.get(&sensor_type)
    }

    pub fn current_value(&self, sensor_type: SensorType) -> Option<f64> {
        self.slot(sensor_type).map(|s| s.current.value)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
