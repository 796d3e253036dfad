//! Structured output from the vision model for one keyframe.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::keyframe::Trigger;

fn default_trigger() -> Trigger {
    Trigger::Sample
}

/// `person_id` is stable across frames within one request. When a
/// reference image of category `people` matches, `person_id` equals that
/// reference's label.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct PersonDetail {
    pub person_id: String,
    pub appearance: String,
    pub details: String,
}

/// One per analysed keyframe, returned by the vision model's `analyze_frames`
/// call and carried alongside the source keyframe's metadata.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct FrameObservation {
    pub timestamp: f64,
    pub description: String,
    #[serde(skip, default = "default_trigger")]
    #[schemars(skip)]
    pub trigger: Trigger,
    #[serde(skip)]
    #[schemars(skip)]
    pub change_score: f64,
    #[serde(skip)]
    #[schemars(skip)]
    pub image_bytes: Vec<u8>,
    #[serde(default)]
    pub people: Vec<PersonDetail>,
}

impl Default for FrameObservation {
    fn default() -> Self {
        Self {
            timestamp: 0.0,
            description: String::new(),
            trigger: Trigger::Sample,
            change_score: 0.0,
            image_bytes: Vec::new(),
            people: Vec::new(),
        }
    }
}

impl FrameObservation {
    /// The set of `person_id`s seen in this observation, or `{"unknown"}`
    /// if none were detected.
    pub fn observed_person_ids(&self) -> Vec<String> {
        if self.people.is_empty() {
            vec!["unknown".to_string()]
        } else {
            self.people.iter().map(|p| p.person_id.clone()).collect()
        }
    }
}

/// One observation per frame returned by the model, only the fields the
/// model is responsible for filling in (used for JSON-schema enforcement on
/// the vision call; see `compliance-clients::vision`).
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct RawFrameObservation {
    pub timestamp: f64,
    pub description: String,
    #[serde(default)]
    pub people: Vec<PersonDetail>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observed_person_ids_defaults_to_unknown() {
        let obs = FrameObservation::default();
        assert_eq!(obs.observed_person_ids(), vec!["unknown".to_string()]);
    }

    #[test]
    fn observed_person_ids_lists_detected_people() {
        let mut obs = FrameObservation::default();
        obs.people.push(PersonDetail {
            person_id: "Person_A".into(),
            appearance: "blue jacket".into(),
            details: "standing near door".into(),
        });
        assert_eq!(obs.observed_person_ids(), vec!["Person_A".to_string()]);
    }
}
