//! Durable per-subject checklist cache state.

use serde::{Deserialize, Serialize};

use crate::policy::PolicyRule;
use crate::verdict::ChecklistStatus;

/// Owned by the Checklist Tracker. Lifecycle: create-on-first-compliance,
/// mutate on each re-evaluation, garbage-collect on expiry, reset on
/// explicit session clear.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChecklistState {
    /// 8-hex digest of `rule.description`.
    pub rule_hash: String,
    pub person_id: String,
    pub status: ChecklistStatus,
    pub last_verified: Option<chrono::DateTime<chrono::Utc>>,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// One row of `checklist(person_id, rules, now)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub rule: PolicyRule,
    pub status: ChecklistStatus,
    pub last_verified: Option<chrono::DateTime<chrono::Utc>>,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
    pub time_remaining: u64,
}
