//! Per-rule compliance judgement.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::policy::{Mode, RuleType, Severity};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecklistStatus {
    Pending,
    Compliant,
    Expired,
}

/// The verdict as returned by a model, before the reconciler attaches mode,
/// checklist_status and expires_at.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct RawVerdict {
    pub rule_type: RuleType,
    pub rule_description: String,
    pub compliant: bool,
    pub severity: Severity,
    pub reason: String,
    pub timestamp: Option<f64>,
}

/// Wire shape for a speech-rule evaluation call: one
/// [`RawVerdict`] per speech rule, wrapped so the JSON schema has a single
/// object root.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct SpeechVerdicts {
    pub verdicts: Vec<RawVerdict>,
}

/// The final, reconciled verdict attached to a Report.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Verdict {
    pub rule_type: RuleType,
    pub rule_description: String,
    pub compliant: bool,
    pub severity: Severity,
    pub reason: String,
    pub timestamp: Option<f64>,
    pub mode: Mode,
    pub checklist_status: Option<ChecklistStatus>,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Verdict {
    /// T1: every incident must be non-compliant and incident-mode.
    pub fn is_valid_incident(&self) -> bool {
        !self.compliant && self.mode == Mode::Incident
    }
}
