//! The final output of one analysis request.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::observation::FrameObservation;
use crate::person::{PersonSummary, RawPersonSummary};
use crate::verdict::{RawVerdict, Verdict};

/// The strict schema a model call returns: no
/// keyframes, no transcript, no checklist bookkeeping — the reconciler adds
/// those when it turns this into a full [`Report`].
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct RawReport {
    pub summary: String,
    pub overall_compliant: bool,
    #[serde(default)]
    pub verdicts: Vec<RawVerdict>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub person_summaries: Vec<RawPersonSummary>,
}

impl RawReport {
    /// A fixed degraded report used whenever the model's JSON fails to
    /// parse.
    pub fn degraded(reason: &str) -> Self {
        Self {
            summary: format!("Failed to parse compliance report: {reason}"),
            overall_compliant: true,
            verdicts: Vec::new(),
            recommendations: Vec::new(),
            person_summaries: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Report {
    pub video_id: String,
    pub summary: String,
    pub overall_compliant: bool,
    /// Non-compliant verdicts, incident-mode only.
    pub incidents: Vec<Verdict>,
    pub all_verdicts: Vec<Verdict>,
    pub recommendations: Vec<String>,
    pub frame_observations: Vec<FrameObservation>,
    pub person_summaries: Vec<PersonSummary>,
    pub transcript: Option<String>,
    /// Null iff no checklist-mode verdict exists.
    pub checklist_fulfilled: Option<bool>,
    pub analyzed_at: chrono::DateTime<chrono::Utc>,
    pub total_frames_analyzed: usize,
    pub video_duration: f64,
}

impl Report {
    /// Holds iff overall_compliant agrees with "every incident-mode verdict is compliant".
    pub fn overall_compliant_is_consistent(&self) -> bool {
        let expected = self
            .all_verdicts
            .iter()
            .filter(|v| v.mode == crate::policy::Mode::Incident)
            .all(|v| v.compliant);
        self.overall_compliant == expected
    }

    /// Holds iff checklist_fulfilled is null exactly when no checklist-mode verdict exists.
    pub fn checklist_fulfilled_is_consistent(&self) -> bool {
        let has_checklist = self
            .all_verdicts
            .iter()
            .any(|v| v.mode == crate::policy::Mode::Checklist);
        has_checklist == self.checklist_fulfilled.is_some()
    }

    /// Holds iff every incident is non-compliant and incident-mode.
    pub fn incidents_are_valid(&self) -> bool {
        self.incidents.iter().all(|v| v.is_valid_incident())
    }
}
