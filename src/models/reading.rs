//! Canonical sensor readings and the static optimal-range lookup.
//!
//! Notes
//! - Sensor types serialize lowercase (`"ph"`, `"tds"`, ...).
//! - `unit` is display-only; nothing in the pipeline compares units.
//! - `RangeTable` is built once from configuration and never mutated afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorType {
    Temperature,
    Humidity,
    Moisture,
    Ph,
    Tds,
    Nitrogen,
    Phosphorus,
    Potassium,
    Lead,
    Mercury,
    Arsenic,
    Distance,
    Battery,
}

impl SensorType {
    pub const ALL: [SensorType; 13] = [
        SensorType::Temperature,
        SensorType::Humidity,
        SensorType::Moisture,
        SensorType::Ph,
        SensorType::Tds,
        SensorType::Nitrogen,
        SensorType::Phosphorus,
        SensorType::Potassium,
        SensorType::Lead,
        SensorType::Mercury,
        SensorType::Arsenic,
        SensorType::Distance,
        SensorType::Battery,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SensorType::Temperature => "temperature",
            SensorType::Humidity => "humidity",
            SensorType::Moisture => "moisture",
            SensorType::Ph => "ph",
            SensorType::Tds => "tds",
            SensorType::Nitrogen => "nitrogen",
            SensorType::Phosphorus => "phosphorus",
            SensorType::Potassium => "potassium",
            SensorType::Lead => "lead",
            SensorType::Mercury => "mercury",
            SensorType::Arsenic => "arsenic",
            SensorType::Distance => "distance",
            SensorType::Battery => "battery",
        }
    }

    pub fn is_heavy_metal(self) -> bool {
        matches!(self, SensorType::Lead | SensorType::Mercury | SensorType::Arsenic)
    }
}

impl Display for SensorType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownSensorType(pub String);

impl Display for UnknownSensorType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "unknown sensor type: {}", self.0)
    }
}

impl std::error::Error for UnknownSensorType {}

/// Case-insensitive match against the canonical names only. Aliases live in the normalizer.
impl FromStr for SensorType {
    type Err = UnknownSensorType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        SensorType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| UnknownSensorType(s.to_string()))
    }
}

/// One measured quantity at a point in time. `value` is always finite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub sensor_type: SensorType,
    pub value: f64,
    #[serde(default)]
    pub unit: String,
    pub observed_at: DateTime<Utc>,
}

impl Reading {
    /// Returns `None` for NaN or infinite values; those are never stored.
    pub fn new(
        sensor_type: SensorType,
        value: f64,
        unit: impl Into<String>,
        observed_at: DateTime<Utc>,
    ) -> Option<Self> {
        if !value.is_finite() {
            return None;
        }
        Some(Reading {
            sensor_type,
            value,
            unit: unit.into(),
            observed_at,
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimalRange {
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangeStatus {
    Below,
    Optimal,
    Above,
}

impl OptimalRange {
    pub const fn new(min: f64, max: f64) -> Self {
        OptimalRange { min, max }
    }

    /// Bounds are inclusive.
    pub fn classify(&self, value: f64) -> RangeStatus {
        if value < self.min {
            RangeStatus::Below
        } else if value > self.max {
            RangeStatus::Above
        } else {
            RangeStatus::Optimal
        }
    }
}

/// Errors raised while loading a range table from JSON.
#[derive(Debug)]
pub enum RangeFileError {
    Io(std::io::Error),
    Json(serde_path_to_error::Error<serde_json::Error>),
    UnknownKey { section: &'static str, key: String },
    InvertedRange { sensor_type: SensorType, min: f64, max: f64 },
    NonFinite(SensorType),
}

impl Display for RangeFileError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            RangeFileError::Io(e) => write!(f, "io error: {}", e),
            RangeFileError::Json(e) => write!(f, "invalid range file at {}: {}", e.path(), e.inner()),
            RangeFileError::UnknownKey { section, key } => {
                write!(f, "invalid range file at {}.{}: unknown sensor type", section, key)
            }
            RangeFileError::InvertedRange { sensor_type, min, max } => {
                write!(f, "range for {} has min {} above max {}", sensor_type, min, max)
            }
            RangeFileError::NonFinite(t) => write!(f, "range for {} contains a non-finite bound", t),
        }
    }
}

impl std::error::Error for RangeFileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RangeFileError::Io(e) => Some(e),
            RangeFileError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for RangeFileError {
    fn from(value: std::io::Error) -> Self {
        RangeFileError::Io(value)
    }
}

// Keys stay strings while decoding so a bad entry is reported as `optimal.ph.min`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RangeFile {
    #[serde(default)]
    optimal: BTreeMap<String, OptimalRange>,
    #[serde(default)]
    critical: BTreeMap<String, f64>,
}

fn sensor_key(section: &'static str, key: String) -> Result<SensorType, RangeFileError> {
    key.parse::<SensorType>().map_err(|_| RangeFileError::UnknownKey { section, key })
}

/// Static lookup of optimal ranges and critical limits, keyed by sensor type.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RangeTable {
    optimal: BTreeMap<SensorType, OptimalRange>,
    critical: BTreeMap<SensorType, f64>,
}

impl RangeTable {
    /// The ranges the dashboard ships with. Heavy-metal limits are mg/kg.
    pub fn defaults() -> Self {
        let optimal = BTreeMap::from([
            (SensorType::Temperature, OptimalRange::new(18.0, 24.0)),
            (SensorType::Humidity, OptimalRange::new(40.0, 70.0)),
            (SensorType::Moisture, OptimalRange::new(25.0, 35.0)),
            (SensorType::Ph, OptimalRange::new(5.8, 7.0)),
            (SensorType::Tds, OptimalRange::new(200.0, 400.0)),
            (SensorType::Nitrogen, OptimalRange::new(20.0, 30.0)),
            (SensorType::Phosphorus, OptimalRange::new(10.0, 20.0)),
            (SensorType::Potassium, OptimalRange::new(15.0, 25.0)),
        ]);
        let critical = BTreeMap::from([
            (SensorType::Lead, 0.1),
            (SensorType::Mercury, 0.05),
            (SensorType::Arsenic, 0.02),
        ]);
        RangeTable { optimal, critical }
    }

    pub fn empty() -> Self {
        RangeTable::default()
    }

    pub fn with_optimal(mut self, sensor_type: SensorType, range: OptimalRange) -> Self {
        self.optimal.insert(sensor_type, range);
        self
    }

    pub fn with_critical(mut self, sensor_type: SensorType, limit: f64) -> Self {
        self.critical.insert(sensor_type, limit);
        self
    }

    pub fn optimal(&self, sensor_type: SensorType) -> Option<OptimalRange> {
        self.optimal.get(&sensor_type).copied()
    }

    pub fn critical_limit(&self, sensor_type: SensorType) -> Option<f64> {
        self.critical.get(&sensor_type).copied()
    }

    /// Entries in `json` replace the defaults one by one; unmentioned types keep their default.
    pub fn from_json_str(json: &str) -> Result<Self, RangeFileError> {
        let de = &mut serde_json::Deserializer::from_str(json);
        let file: RangeFile = serde_path_to_error::deserialize(de).map_err(RangeFileError::Json)?;

        let mut table = RangeTable::defaults();
        for (key, range) in file.optimal {
            let sensor_type = sensor_key("optimal", key)?;
            if !range.min.is_finite() || !range.max.is_finite() {
                return Err(RangeFileError::NonFinite(sensor_type));
            }
            if range.min > range.max {
                return Err(RangeFileError::InvertedRange {
                    sensor_type,
                    min: range.min,
                    max: range.max,
                });
            }
            table.optimal.insert(sensor_type, range);
        }
        for (key, limit) in file.critical {
            let sensor_type = sensor_key("critical", key)?;
            if !limit.is_finite() {
                return Err(RangeFileError::NonFinite(sensor_type));
            }
            table.critical.insert(sensor_type, limit);
        }
        Ok(table)
    }

    pub fn load(path: &Path) -> Result<Self, RangeFileError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }
}
