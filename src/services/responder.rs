//! Answers operator chat questions from a field snapshot.
//!
//! The pipeline does not depend on how answers are produced; [`StatusResponder`] is the
//! keyword-matching strategy the binary ships with.

use crate::models::field::FieldState;
use crate::models::reading::{RangeStatus, RangeTable, SensorType};
use std::sync::Arc;

pub trait ResponderStrategy: Send + Sync {
    fn respond(&self, question: &str, state: &FieldState) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intent {
    Status,
    Temperature,
    Ph,
    Moisture,
    Nutrients,
    Metals,
}

// First matching row wins.
const INTENTS: [(Intent, &[&str]); 6] = [
    (Intent::Status, &["status", "state", "situation", "overview"]),
    (Intent::Temperature, &["temperature", "temp", "warm", "cold"]),
    (Intent::Ph, &["ph", "acidity", "acidic", "alkaline"]),
    (Intent::Moisture, &["moisture", "water", "watering", "irrigation", "irrigate", "dry"]),
    (
        Intent::Nutrients,
        &["nutrient", "nutrients", "npk", "nitrogen", "phosphorus", "potassium", "fertilizer"],
    ),
    (
        Intent::Metals,
        &["metal", "metals", "pollution", "toxic", "lead", "mercury", "arsenic"],
    ),
];

const NUTRIENTS: [SensorType; 3] = [SensorType::Nitrogen, SensorType::Phosphorus, SensorType::Potassium];
const METALS: [SensorType; 3] = [SensorType::Lead, SensorType::Mercury, SensorType::Arsenic];

pub struct StatusResponder {
    ranges: Arc<RangeTable>,
}

impl StatusResponder {
    pub fn new(ranges: Arc<RangeTable>) -> Self {
        StatusResponder { ranges }
    }

    fn intent(question: &str) -> Option<Intent> {
        let lowered = question.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        INTENTS
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|k| words.contains(k)))
            .map(|(intent, _)| *intent)
    }

    fn over_limit(&self, sensor_type: SensorType, value: f64) -> bool {
        self.ranges.critical_limit(sensor_type).is_some_and(|limit| value > limit)
    }

    fn status(&self, state: &FieldState) -> String {
        let mut good = Vec::new();
        let mut issues = Vec::new();

        for (sensor_type, low, high, fine) in [
            (SensorType::Temperature, "temperature too low", "temperature too high", "temperature normal"),
            (SensorType::Ph, "pH too acidic", "pH too alkaline", "pH optimal"),
            (SensorType::Moisture, "soil too dry", "soil too wet", "soil moisture fine"),
        ] {
            let Some(slot) = state.slot(sensor_type) else { continue };
            let value = slot.current.value;
            match slot.status() {
                Some(RangeStatus::Below) => issues.push(format!("{} ({})", low, value)),
                Some(RangeStatus::Above) => issues.push(format!("{} ({})", high, value)),
                Some(RangeStatus::Optimal) => good.push(format!("{} ({})", fine, value)),
                None => {}
            }
        }
        for metal in METALS {
            if let Some(value) = state.current_value(metal)
                && self.over_limit(metal, value)
            {
                issues.push(format!("critical {} level ({} mg/kg)", metal, value));
            }
        }

        let mut out = String::from("Current state of your crops: ");
        if !good.is_empty() {
            out.push_str(&format!("Looking good: {}. ", good.join(", ")));
        }
        if issues.is_empty() {
            out.push_str("All parameters are within their optimal ranges!");
        } else {
            out.push_str(&format!(
                "Needs attention: {}. Keep an eye on these parameters.",
                issues.join(", ")
            ));
        }
        out
    }

    fn ranged(&self, state: &FieldState, sensor_type: SensorType, unit: &str, advice: [&str; 3]) -> String {
        let Some(slot) = state.slot(sensor_type) else {
            return format!("No {} data available right now.", sensor_type);
        };
        let value = slot.current.value;
        let Some(range) = slot.optimal else {
            return format!("Current {} is {}{}.", sensor_type, value, unit);
        };
        let [below, above, optimal] = advice;
        let verdict = match range.classify(value) {
            RangeStatus::Below => below,
            RangeStatus::Above => above,
            RangeStatus::Optimal => optimal,
        };
        format!(
            "Current {} is {}{}. The optimal range is {}-{}{}. {}",
            sensor_type, value, unit, range.min, range.max, unit, verdict
        )
    }

    fn nutrients(&self, state: &FieldState) -> String {
        let levels: Vec<String> = NUTRIENTS
            .iter()
            .filter_map(|t| state.slot(*t).map(|s| format!("{}: {} {}", t, s.current.value, s.current.unit)))
            .map(|s| s.trim_end().to_string())
            .collect();
        if levels.is_empty() {
            return "Nutrient status: no nutrient data available right now.".to_string();
        }
        format!(
            "Nutrient status: {}. Make sure these levels match what your crops need.",
            levels.join(", ")
        )
    }

    fn metals(&self, state: &FieldState) -> String {
        let mut levels = Vec::new();
        let mut over = false;
        for metal in METALS {
            if let Some(value) = state.current_value(metal) {
                levels.push(format!("{}: {} mg/kg", metal, value));
                over |= self.over_limit(metal, value);
            }
        }
        if levels.is_empty() {
            return "No heavy metal data available right now.".to_string();
        }
        let verdict = if over {
            "WARNING: some levels exceed safety limits. Consult a soil remediation expert."
        } else {
            "All levels are within safety limits."
        };
        format!("Heavy metal levels: {}. {}", levels.join(", "), verdict)
    }
}

impl ResponderStrategy for StatusResponder {
    fn respond(&self, question: &str, state: &FieldState) -> String {
        match Self::intent(question) {
            Some(Intent::Status) => self.status(state),
            Some(Intent::Temperature) => self.ranged(
                state,
                SensorType::Temperature,
                "°C",
                [
                    "It is a bit cold; consider warming the soil.",
                    "It is a bit hot; consider shading or watering.",
                    "The temperature is ideal for your crops!",
                ],
            ),
            Some(Intent::Ph) => self.ranged(
                state,
                SensorType::Ph,
                "",
                [
                    "The soil is too acidic; add lime.",
                    "The soil is too alkaline; add sulphur or organic matter.",
                    "The pH suits most crops!",
                ],
            ),
            Some(Intent::Moisture) => self.ranged(
                state,
                SensorType::Moisture,
                "%",
                [
                    "The soil is too dry; increase watering.",
                    "The soil is too wet; reduce watering or improve drainage.",
                    "Soil moisture is ideal!",
                ],
            ),
            Some(Intent::Nutrients) => self.nutrients(state),
            Some(Intent::Metals) => self.metals(state),
            None => format!(
                "I understand your question about \"{}\". I can help with temperature, pH, soil \
                 moisture, nutrients and heavy metals. Try asking about one of those.",
                question.trim()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::field::{FieldId, SensorSlot};
    use crate::models::reading::Reading;
    use chrono::Utc;

    fn state_with(values: &[(SensorType, f64, &str)]) -> FieldState {
        let ranges = RangeTable::defaults();
        let mut state = FieldState::empty(FieldId::new("f1").unwrap());
        for (t, v, unit) in values {
            state.readings.insert(
                *t,
                SensorSlot {
                    current: Reading::new(*t, *v, *unit, Utc::now()).unwrap(),
                    optimal: ranges.optimal(*t),
                },
            );
        }
        state.revision = 1;
        state
    }

    fn responder() -> StatusResponder {
        StatusResponder::new(Arc::new(RangeTable::defaults()))
    }

    #[test]
    fn ph_question_reports_value_and_range() {
        let state = state_with(&[(SensorType::Ph, 5.2, "pH")]);
        let answer = responder().respond("What's the pH like?", &state);
        assert_eq!(
            answer,
            "Current ph is 5.2. The optimal range is 5.8-7. The soil is too acidic; add lime."
        );
    }

    #[test]
    fn phosphorus_is_not_mistaken_for_ph() {
        let state = state_with(&[(SensorType::Phosphorus, 14.0, "mg/kg")]);
        let answer = responder().respond("phosphorus levels?", &state);
        assert_eq!(
            answer,
            "Nutrient status: phosphorus: 14 mg/kg. Make sure these levels match what your crops need."
        );
    }

    #[test]
    fn status_lists_good_points_and_issues() {
        let state = state_with(&[
            (SensorType::Temperature, 21.0, "°C"),
            (SensorType::Moisture, 12.0, "%"),
            (SensorType::Lead, 0.3, "mg/kg"),
        ]);
        let answer = responder().respond("Give me the status", &state);
        assert!(answer.contains("Looking good: temperature normal (21)"));
        assert!(answer.contains("soil too dry (12)"));
        assert!(answer.contains("critical lead level (0.3 mg/kg)"));
    }

    #[test]
    fn missing_data_is_said_plainly() {
        let empty = FieldState::empty(FieldId::new("f1").unwrap());
        assert_eq!(
            responder().respond("temperature?", &empty),
            "No temperature data available right now."
        );
        assert_eq!(
            responder().respond("any toxic metals?", &empty),
            "No heavy metal data available right now."
        );
    }

    #[test]
    fn metals_over_limit_raise_a_warning() {
        let state = state_with(&[(SensorType::Mercury, 0.08, "mg/kg"), (SensorType::Arsenic, 0.01, "mg/kg")]);
        let answer = responder().respond("mercury?", &state);
        assert!(answer.starts_with("Heavy metal levels: mercury: 0.08 mg/kg, arsenic: 0.01 mg/kg."));
        assert!(answer.contains("WARNING"));
    }

    #[test]
    fn unknown_question_gets_the_fallback() {
        let empty = FieldState::empty(FieldId::new("f1").unwrap());
        let answer = responder().respond("  what about the weather  ", &empty);
        assert!(answer.starts_with("I understand your question about \"what about the weather\"."));
    }
}
