//! Durable per-subject checklist cache.
//!
//! A checklist-mode rule, once satisfied for a subject, stays satisfied for
//! `validity_duration` seconds so "show your badge" is only demanded once
//! per window. State lives in a single JSON document on disk and is
//! serialised through one lock, matching the Python original's
//! `threading.RLock`-guarded `ComplianceStateTracker`
//! (`examples/original_source/backend/services/compliance_state.py`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use compliance_schemas::{ChecklistItem, ChecklistState, ChecklistStatus, Mode, PolicyRule};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read checklist snapshot: {0}")]
    Read(#[source] std::io::Error),
    #[error("failed to write checklist snapshot: {0}")]
    Write(#[source] std::io::Error),
    #[error("malformed checklist snapshot: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The on-disk shape: `{ person_id: { rule_hash: {status, last_verified, expires_at} } }`,
/// timestamps ISO-8601 UTC.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SnapshotEntry {
    status: ChecklistStatus,
    last_verified: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
}

pub type Snapshot = HashMap<String, HashMap<String, SnapshotEntryPublic>>;

/// Public alias of the snapshot entry shape, re-exported so callers can
/// build/inspect snapshots without reaching into this crate's internals.
pub type SnapshotEntryPublic = SnapshotEntry;

/// 8-hex-char identity key for a rule, derived from its description.
/// Collisions within one policy are a configuration error, not a security
/// concern.
pub fn rule_hash(rule: &PolicyRule) -> String {
    let digest = Md5::digest(rule.description.as_bytes());
    let hex = format!("{digest:x}");
    hex[..8].to_string()
}

type PersonStates = HashMap<String, HashMap<String, ChecklistState>>;

pub struct ChecklistTracker {
    state_file: Option<PathBuf>,
    states: Mutex<PersonStates>,
}

impl ChecklistTracker {
    /// Loads persisted state from `state_file` if it exists; starts empty
    /// otherwise. Runs `clear_expired` once on construction.
    pub fn new(state_file: Option<PathBuf>) -> Self {
        let loaded = state_file
            .as_deref()
            .and_then(|path| Self::load_from_disk(path).ok())
            .unwrap_or_default();

        let tracker = Self {
            state_file,
            states: Mutex::new(loaded),
        };
        tracker.clear_expired(Utc::now());
        tracker
    }

    pub fn in_memory() -> Self {
        Self::new(None)
    }

    fn load_from_disk(path: &Path) -> Result<PersonStates> {
        if !path.exists() {
            return Ok(PersonStates::new());
        }
        let raw = std::fs::read_to_string(path).map_err(Error::Read)?;
        let snapshot: Snapshot = serde_json::from_str(&raw)?;
        Ok(Self::states_from_snapshot(snapshot))
    }

    fn states_from_snapshot(snapshot: Snapshot) -> PersonStates {
        snapshot
            .into_iter()
            .map(|(person_id, rules)| {
                let rules = rules
                    .into_iter()
                    .map(|(hash, entry)| {
                        (
                            hash.clone(),
                            ChecklistState {
                                rule_hash: hash,
                                person_id: person_id.clone(),
                                status: entry.status,
                                last_verified: entry.last_verified,
                                expires_at: entry.expires_at,
                            },
                        )
                    })
                    .collect();
                (person_id, rules)
            })
            .collect()
    }

    /// Best-effort synchronous write. Failures are logged, never propagated
    /// ("Write failures are logged and do not propagate").
    fn persist(&self, states: &PersonStates) {
        let Some(path) = &self.state_file else { return };
        if let Err(err) = self.try_persist(path, states) {
            tracing::warn!(error = %err, path = %path.display(), "failed to persist checklist state");
        }
    }

    fn try_persist(&self, path: &Path, states: &PersonStates) -> Result<()> {
        let snapshot = Self::snapshot_from_states(states);
        let json = serde_json::to_string_pretty(&snapshot)?;
        std::fs::write(path, json).map_err(Error::Write)
    }

    fn snapshot_from_states(states: &PersonStates) -> Snapshot {
        states
            .iter()
            .map(|(person_id, rules)| {
                let rules = rules
                    .iter()
                    .map(|(hash, state)| {
                        (
                            hash.clone(),
                            SnapshotEntry {
                                status: state.status,
                                last_verified: state.last_verified,
                                expires_at: state.expires_at,
                            },
                        )
                    })
                    .collect();
                (person_id.clone(), rules)
            })
            .collect()
    }

    /// `check(person_id, rule, now)`.
    pub fn check(
        &self,
        person_id: &str,
        rule: &PolicyRule,
        now: DateTime<Utc>,
    ) -> (bool, Option<ChecklistState>) {
        if rule.mode != Mode::Checklist {
            return (false, None);
        }
        let hash = rule_hash(rule);
        let mut guard = self.states.lock().expect("checklist lock poisoned");

        let Some(person_states) = guard.get_mut(person_id) else {
            return (false, None);
        };
        let Some(state) = person_states.get_mut(&hash) else {
            return (false, None);
        };

        if let Some(expires_at) = state.expires_at {
            if now > expires_at {
                state.status = ChecklistStatus::Expired;
                let snapshot = state.clone();
                self.persist(&guard);
                return (false, Some(snapshot));
            }
        }

        let compliant = state.status == ChecklistStatus::Compliant;
        (compliant, Some(state.clone()))
    }

    /// `update(person_id, rule, compliant, now)`.
    pub fn update(
        &self,
        person_id: &str,
        rule: &PolicyRule,
        compliant: bool,
        now: DateTime<Utc>,
    ) -> Option<ChecklistState> {
        if rule.mode != Mode::Checklist {
            return None;
        }
        let hash = rule_hash(rule);
        let mut guard = self.states.lock().expect("checklist lock poisoned");

        let entry = guard.entry(person_id.to_string()).or_default();
        let state = if compliant {
            let expires_at = rule
                .validity_duration
                .map(|secs| now + ChronoDuration::seconds(secs as i64));
            ChecklistState {
                rule_hash: hash.clone(),
                person_id: person_id.to_string(),
                status: ChecklistStatus::Compliant,
                last_verified: Some(now),
                expires_at,
            }
        } else {
            ChecklistState {
                rule_hash: hash.clone(),
                person_id: person_id.to_string(),
                status: ChecklistStatus::Pending,
                last_verified: None,
                expires_at: None,
            }
        };
        entry.insert(hash, state.clone());
        self.persist(&guard);
        Some(state)
    }

    /// `checklist(person_id, rules, now)`.
    pub fn checklist(
        &self,
        person_id: &str,
        rules: &[PolicyRule],
        now: DateTime<Utc>,
    ) -> Vec<ChecklistItem> {
        rules
            .iter()
            .filter(|r| r.mode == Mode::Checklist)
            .map(|rule| {
                let (_, state) = self.check(person_id, rule, now);
                let time_remaining = state
                    .as_ref()
                    .and_then(|s| s.expires_at)
                    .map(|expires_at| (expires_at - now).num_seconds().max(0) as u64)
                    .unwrap_or(0);
                ChecklistItem {
                    rule: rule.clone(),
                    status: state
                        .as_ref()
                        .map(|s| s.status)
                        .unwrap_or(ChecklistStatus::Pending),
                    last_verified: state.as_ref().and_then(|s| s.last_verified),
                    expires_at: state.as_ref().and_then(|s| s.expires_at),
                    time_remaining,
                }
            })
            .collect()
    }

    /// Sweep entries whose `expires_at < now`, drop empty person buckets.
    pub fn clear_expired(&self, now: DateTime<Utc>) {
        let mut guard = self.states.lock().expect("checklist lock poisoned");
        let mut removed = 0usize;
        for person_states in guard.values_mut() {
            let before = person_states.len();
            person_states.retain(|_, state| {
                state.expires_at.map(|exp| exp >= now).unwrap_or(true)
            });
            removed += before - person_states.len();
        }
        guard.retain(|_, rules| !rules.is_empty());
        if removed > 0 {
            tracing::info!(removed, "cleared expired checklist states");
            self.persist(&guard);
        }
    }

    /// Wipe all state.
    pub fn reset(&self) {
        let mut guard = self.states.lock().expect("checklist lock poisoned");
        guard.clear();
        self.persist(&guard);
    }

    /// Full snapshot export. Copies the map while holding the lock.
    pub fn export(&self) -> Snapshot {
        let guard = self.states.lock().expect("checklist lock poisoned");
        Self::snapshot_from_states(&guard)
    }

    /// Full round-trip import.
    pub fn import(&self, snapshot: Snapshot) {
        let mut guard = self.states.lock().expect("checklist lock poisoned");
        *guard = Self::states_from_snapshot(snapshot);
        self.persist(&guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use compliance_schemas::{Frequency, RuleType, Severity};

    fn checklist_rule(description: &str, validity_secs: Option<u64>) -> PolicyRule {
        PolicyRule {
            rule_type: RuleType::Badge,
            description: description.to_string(),
            severity: Severity::Medium,
            mode: Mode::Checklist,
            validity_duration: validity_secs,
            recheck_prompt: None,
            frequency: Frequency::AtLeastOnce,
            frequency_count: 1,
        }
    }

    fn incident_rule(description: &str) -> PolicyRule {
        PolicyRule {
            rule_type: RuleType::Ppe,
            description: description.to_string(),
            severity: Severity::Critical,
            mode: Mode::Incident,
            validity_duration: None,
            recheck_prompt: None,
            frequency: Frequency::Always,
            frequency_count: 1,
        }
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn incident_mode_rules_are_never_cached() {
        let tracker = ChecklistTracker::in_memory();
        let rule = incident_rule("Hard hat required");
        let (compliant, state) = tracker.check("Person_A", &rule, t(0));
        assert!(!compliant);
        assert!(state.is_none());
        // update() is also a no-op for incident rules.
        assert!(tracker.update("Person_A", &rule, true, t(0)).is_none());
    }

    #[test]
    fn badge_checklist_satisfied_then_remembered() {
        let tracker = ChecklistTracker::in_memory();
        let rule = checklist_rule("Must show ID badge", Some(300));

        let (compliant, _) = tracker.check("Person_A", &rule, t(0));
        assert!(!compliant, "nothing recorded yet");

        tracker.update("Person_A", &rule, true, t(0));
        let (compliant, state) = tracker.check("Person_A", &rule, t(60));
        assert!(compliant);
        assert_eq!(state.unwrap().status, ChecklistStatus::Compliant);
    }

    #[test]
    fn checklist_expires_after_validity_duration() {
        let tracker = ChecklistTracker::in_memory();
        let rule = checklist_rule("Must show ID badge", Some(300));
        tracker.update("Person_A", &rule, true, t(0));

        let (compliant, state) = tracker.check("Person_A", &rule, t(301));
        assert!(!compliant);
        assert_eq!(state.unwrap().status, ChecklistStatus::Expired);
    }

    #[test]
    fn forever_rule_never_expires() {
        let tracker = ChecklistTracker::in_memory();
        let rule = checklist_rule("Signed the waiver", None);
        tracker.update("Person_A", &rule, true, t(0));

        let (compliant, _) = tracker.check("Person_A", &rule, t(10_000_000));
        assert!(compliant);
    }

    #[test]
    fn clear_expired_drops_empty_person_buckets() {
        let tracker = ChecklistTracker::in_memory();
        let rule = checklist_rule("Must show ID badge", Some(10));
        tracker.update("Person_A", &rule, true, t(0));

        tracker.clear_expired(t(20));
        let snapshot = tracker.export();
        assert!(!snapshot.contains_key("Person_A"));
    }

    #[test]
    fn export_reset_import_round_trip_is_indistinguishable() {
        let tracker = ChecklistTracker::in_memory();
        let rule = checklist_rule("Must show ID badge", Some(300));
        tracker.update("Person_A", &rule, true, t(0));

        let snapshot = tracker.export();
        tracker.reset();
        assert!(tracker.export().is_empty());

        tracker.import(snapshot);
        let (compliant, _) = tracker.check("Person_A", &rule, t(60));
        assert!(compliant);
    }

    #[test]
    fn persists_to_disk_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checklist.json");
        let rule = checklist_rule("Must show ID badge", Some(300));

        {
            let tracker = ChecklistTracker::new(Some(path.clone()));
            tracker.update("Person_A", &rule, true, t(0));
        }

        let reloaded = ChecklistTracker::new(Some(path));
        let (compliant, _) = reloaded.check("Person_A", &rule, t(60));
        assert!(compliant);
    }

    #[test]
    fn rule_hash_is_eight_hex_chars() {
        let rule = checklist_rule("Must show ID badge", Some(300));
        let hash = rule_hash(&rule);
        assert_eq!(hash.len(), 8);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
