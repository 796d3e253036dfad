//! Aggregated per-subject record across one request.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The model-produced shape, before the reconciler attaches a thumbnail
///.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct RawPersonSummary {
    pub person_id: String,
    pub appearance: String,
    pub first_seen: f64,
    pub last_seen: f64,
    pub frames_seen: u32,
    pub compliant: bool,
    #[serde(default)]
    pub violations: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersonSummary {
    pub person_id: String,
    pub appearance: String,
    pub first_seen: f64,
    pub last_seen: f64,
    pub frames_seen: u32,
    pub compliant: bool,
    pub violations: Vec<String>,
    pub thumbnail_bytes: Vec<u8>,
}

impl PersonSummary {
    /// T4: first_seen <= last_seen, frames_seen >= 1.
    pub fn is_well_formed(&self) -> bool {
        self.first_seen <= self.last_seen && self.frames_seen >= 1
    }
}

impl From<RawPersonSummary> for PersonSummary {
    fn from(raw: RawPersonSummary) -> Self {
        Self {
            person_id: raw.person_id,
            appearance: raw.appearance,
            first_seen: raw.first_seen,
            last_seen: raw.last_seen,
            frames_seen: raw.frames_seen,
            compliant: raw.compliant,
            violations: raw.violations,
            thumbnail_bytes: Vec::new(),
        }
    }
}
