//! Wire shapes for the inbound event stream and the outbound notifications.
//!
//! Inbound frames are decoded loosely: every known key is optional and unknown keys are
//! ignored. Sensor payloads stay as raw JSON until the normalizer looks at them.

use crate::models::field::{FieldId, FieldState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

pub const DEFAULT_RECOMMENDATION_ADVICE: &str = "Follow the recommendations to optimise your crop.";

/// One inbound frame from the event stream.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundFrame {
    #[serde(default)]
    pub sensor_data: Option<Value>,
    #[serde(default, rename = "batteryLevel")]
    pub battery_level: Option<Value>,
    #[serde(default)]
    pub recommendation_id: Option<Value>,
    #[serde(default)]
    pub recommandations: Option<Value>,
    #[serde(default)]
    pub evaluation: Option<Value>,
    #[serde(default, rename = "fieldId", alias = "field_id")]
    pub field_id: Option<Value>,
}

impl InboundFrame {
    pub fn is_sensor_event(&self) -> bool {
        self.sensor_data.is_some()
    }

    pub fn is_recommendation(&self) -> bool {
        self.recommandations.is_some() || self.recommendation_id.is_some()
    }
}

/// The `recommandations` body produced by the upstream recommendation service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecommendationBody {
    #[serde(default)]
    pub resume_vocal: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub recommandations: Vec<Value>,
    #[serde(default)]
    pub risques_detectes: Vec<String>,
    #[serde(default)]
    pub analyse_sol: Option<String>,
    #[serde(default)]
    pub faisabilite: Option<String>,
    #[serde(default)]
    pub rendement_estime: Option<Value>,
    #[serde(default)]
    pub priority: Option<Value>,
}

impl RecommendationBody {
    pub fn decode(value: &Value) -> Result<Self, serde_path_to_error::Error<serde_json::Error>> {
        serde_path_to_error::deserialize(value)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl FromStr for Priority {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            _ => Err(()),
        }
    }
}

/// A recommendation as delivered to the notification feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub id: String,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub actions: Vec<Value>,
    pub risks: Vec<String>,
    pub evaluation: Option<Value>,
    /// The raw `recommandations` body, untouched.
    pub details: Value,
    pub field_id: Option<FieldId>,
    pub derived_from_reading_snapshot: Option<Arc<FieldState>>,
    pub created_at: DateTime<Utc>,
}

/// Inputs for [`Recommendation::assemble`].
#[derive(Debug, Clone)]
pub struct RecommendationParts {
    pub id: Option<Value>,
    pub body: RecommendationBody,
    pub details: Value,
    pub evaluation: Option<Value>,
    pub phase: Option<String>,
    pub field_id: Option<FieldId>,
    pub snapshot: Option<Arc<FieldState>>,
    pub received_at: DateTime<Utc>,
}

impl Recommendation {
    pub fn assemble(parts: RecommendationParts) -> Self {
        let id = match parts.id {
            Some(Value::String(s)) if !s.trim().is_empty() => s,
            Some(Value::Number(n)) => n.to_string(),
            _ => parts.received_at.timestamp_millis().to_string(),
        };
        let title = format!("Recommendation for {}", parts.phase.as_deref().unwrap_or("crop"));
        let description = parts
            .body
            .resume_vocal
            .clone()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| parts.body.description.clone().filter(|s| !s.trim().is_empty()))
            .unwrap_or_else(|| DEFAULT_RECOMMENDATION_ADVICE.to_string());
        let priority = parts
            .body
            .priority
            .as_ref()
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();

        Recommendation {
            id,
            title,
            description,
            priority,
            actions: parts.body.recommandations,
            risks: parts.body.risques_detectes,
            evaluation: parts.evaluation,
            details: parts.details,
            field_id: parts.field_id,
            derived_from_reading_snapshot: parts.snapshot,
            created_at: parts.received_at,
        }
    }

    /// The line pushed into the chat feed.
    pub fn notification_text(&self) -> String {
        format!("New recommendation: {}. {}", self.title, self.description)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Error,
}

impl Display for ConnectionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// `{ "connectionStatus": "connected" }`
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMessage {
    pub connection_status: ConnectionStatus,
}

impl From<ConnectionStatus> for StatusMessage {
    fn from(value: ConnectionStatus) -> Self {
        StatusMessage {
            connection_status: value,
        }
    }
}
