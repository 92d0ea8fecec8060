use crate::models::field::FieldId;
use crate::models::reading::SensorType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DiagnosticKind {
    /// Not JSON, or not a JSON object.
    MalformedFrame,
    /// `sensor_data` present but unreadable.
    MalformedEvent,
    /// `recommandations` present but did not decode.
    MalformedRecommendation,
}

/// Non-fatal problem with one inbound frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub detail: String,
    pub excerpt: Option<String>,
    pub at: DateTime<Utc>,
}

const EXCERPT_CHARS: usize = 120;

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, detail: impl Into<String>, raw: Option<&str>) -> Self {
        Diagnostic {
            kind,
            detail: detail.into(),
            excerpt: raw.map(|r| r.chars().take(EXCERPT_CHARS).collect()),
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum AlertKind {
    #[serde(rename_all = "camelCase")]
    BatteryLow { level: f64, threshold: f64 },
    #[serde(rename_all = "camelCase")]
    CriticalLevel { sensor_type: SensorType, value: f64, limit: f64 },
}

/// Raised when a field crosses into a condition an operator should see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub field_id: FieldId,
    #[serde(flatten)]
    pub kind: AlertKind,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn message(&self) -> String {
        match &self.kind {
            AlertKind::BatteryLow { level, threshold } => {
                format!("field {}: sensor battery at {}% (below {}%)", self.field_id, level, threshold)
            }
            AlertKind::CriticalLevel {
                sensor_type,
                value,
                limit,
            } => format!(
                "field {}: {} at {} exceeds critical limit {}",
                self.field_id, sensor_type, value, limit
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn excerpt_is_truncated() {
        let raw = "x".repeat(500);
        let d = Diagnostic::new(DiagnosticKind::MalformedFrame, "bad json", Some(&raw));
        assert_eq!(d.excerpt.map(|e| e.len()), Some(EXCERPT_CHARS));
    }

    #[test]
    fn alert_serializes_flat_with_kind_tag() {
        let alert = Alert {
            field_id: FieldId::new("f1").unwrap(),
            kind: AlertKind::CriticalLevel {
                sensor_type: SensorType::Lead,
                value: 0.3,
                limit: 0.1,
            },
            raised_at: Utc::now(),
        };
        let value = serde_json::to_value(&alert).unwrap();
        assert_eq!(value["kind"], json!("criticalLevel"));
        assert_eq!(value["sensorType"], json!("lead"));
        assert_eq!(value["fieldId"], json!("f1"));
        assert_eq!(alert.message(), "field f1: lead at 0.3 exceeds critical limit 0.1");
    }
}
