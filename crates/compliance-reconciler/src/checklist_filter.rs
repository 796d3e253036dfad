//! Dual-mode filtering: turns raw, mode-agnostic model verdicts
//! into final [`Verdict`]s, consulting [`ChecklistTracker`] for any
//! checklist-mode rule.

use chrono::{DateTime, Utc};

use compliance_checklist::ChecklistTracker;
use compliance_schemas::observation::FrameObservation;
use compliance_schemas::policy::{Mode, Policy, PolicyRule};
use compliance_schemas::verdict::{ChecklistStatus, RawVerdict, Verdict};

const PREVIOUSLY_VERIFIED_REASON: &str = "Previously verified (still valid)";

/// Expands a batch of [`RawVerdict`]s into final [`Verdict`]s, one per raw
/// verdict. A verdict whose rule can't be matched in the policy passes
/// through as incident-mode untouched.
pub fn apply_checklist_filter(
    raw_verdicts: Vec<RawVerdict>,
    observations: &[FrameObservation],
    policy: &Policy,
    checklist: &ChecklistTracker,
    now: DateTime<Utc>,
) -> Vec<Verdict> {
    raw_verdicts
        .into_iter()
        .map(|raw| resolve_one(raw, observations, policy, checklist, now))
        .collect()
}

fn resolve_one(
    raw: RawVerdict,
    observations: &[FrameObservation],
    policy: &Policy,
    checklist: &ChecklistTracker,
    now: DateTime<Utc>,
) -> Verdict {
    let Some(rule) = find_rule(policy, &raw) else {
        return as_incident_verdict(raw);
    };
    if rule.mode != Mode::Checklist {
        return as_incident_verdict(raw);
    }
    checklist_verdict(raw, rule, observations, checklist, now)
}

/// Checks every observed subject; a single cached
/// compliant pass overrides the model's read, a fresh compliant read caches
/// it for every observed subject, a fresh non-compliant read leaves state
/// untouched (checklist state only ever moves forward on success).
fn checklist_verdict(
    raw: RawVerdict,
    rule: &PolicyRule,
    observations: &[FrameObservation],
    checklist: &ChecklistTracker,
    now: DateTime<Utc>,
) -> Verdict {
    let person_ids = observed_person_ids_for(&raw, observations);

    let cached_compliant_state = person_ids
        .iter()
        .find_map(|person_id| match checklist.check(person_id, rule, now) {
            (true, state) => state,
            (false, _) => None,
        });

    let (compliant, reason, state) = if let Some(state) = cached_compliant_state {
        (true, PREVIOUSLY_VERIFIED_REASON.to_string(), Some(state))
    } else if raw.compliant {
        let mut last_state = None;
        for person_id in &person_ids {
            last_state = checklist.update(person_id, rule, true, now);
        }
        (true, raw.reason.clone(), last_state)
    } else {
        (false, raw.reason.clone(), None)
    };

    Verdict {
        rule_type: raw.rule_type,
        rule_description: raw.rule_description,
        compliant,
        severity: raw.severity,
        reason,
        timestamp: raw.timestamp,
        mode: Mode::Checklist,
        checklist_status: compliant.then_some(ChecklistStatus::Compliant),
        expires_at: state.and_then(|s| s.expires_at),
    }
}

fn as_incident_verdict(raw: RawVerdict) -> Verdict {
    Verdict {
        rule_type: raw.rule_type,
        rule_description: raw.rule_description,
        compliant: raw.compliant,
        severity: raw.severity,
        reason: raw.reason,
        timestamp: raw.timestamp,
        mode: Mode::Incident,
        checklist_status: None,
        expires_at: None,
    }
}

fn find_rule<'a>(policy: &'a Policy, raw: &RawVerdict) -> Option<&'a PolicyRule> {
    policy
        .rules
        .iter()
        .find(|r| r.rule_type == raw.rule_type && r.description == raw.rule_description)
}

/// The people observed in the keyframe nearest `raw.timestamp`, or
/// `["unknown"]` when the verdict carries no timestamp or no frame matches.
fn observed_person_ids_for(raw: &RawVerdict, observations: &[FrameObservation]) -> Vec<String> {
    let Some(ts) = raw.timestamp else {
        return vec!["unknown".to_string()];
    };
    observations
        .iter()
        .min_by(|a, b| (a.timestamp - ts).abs().partial_cmp(&(b.timestamp - ts).abs()).unwrap())
        .map(|obs| obs.observed_person_ids())
        .unwrap_or_else(|| vec!["unknown".to_string()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use compliance_schemas::keyframe::Trigger;
    use compliance_schemas::observation::PersonDetail;
    use compliance_schemas::policy::{Frequency, RuleType, Severity};

    fn badge_rule(validity_secs: Option<u64>) -> PolicyRule {
        PolicyRule {
            rule_type: RuleType::Badge,
            description: "Must show ID badge".to_string(),
            severity: Severity::Medium,
            mode: Mode::Checklist,
            validity_duration: validity_secs,
            recheck_prompt: None,
            frequency: Frequency::AtLeastOnce,
            frequency_count: 1,
        }
    }

    fn raw(compliant: bool, timestamp: Option<f64>) -> RawVerdict {
        RawVerdict {
            rule_type: RuleType::Badge,
            rule_description: "Must show ID badge".to_string(),
            compliant,
            severity: Severity::Medium,
            reason: "badge check".into(),
            timestamp,
        }
    }

    fn observation_with(ts: f64, person_id: &str) -> FrameObservation {
        FrameObservation {
            timestamp: ts,
            description: "desc".into(),
            trigger: Trigger::Sample,
            change_score: 0.1,
            image_bytes: vec![],
            people: vec![PersonDetail {
                person_id: person_id.to_string(),
                appearance: "".into(),
                details: "".into(),
            }],
        }
    }

    #[test]
    fn checklist_rule_with_no_matching_rule_in_policy_becomes_incident() {
        let policy = Policy::default();
        let checklist = ChecklistTracker::in_memory();
        let verdicts = apply_checklist_filter(
            vec![raw(false, Some(1.0))],
            &[],
            &policy,
            &checklist,
            Utc::now(),
        );
        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].mode, Mode::Incident);
    }

    #[test]
    fn first_compliant_read_caches_state_and_sets_expiry() {
        let policy = Policy { rules: vec![badge_rule(Some(300))], ..Default::default() };
        let checklist = ChecklistTracker::in_memory();
        let observations = vec![observation_with(0.0, "Person_A")];

        let verdicts = apply_checklist_filter(
            vec![raw(true, Some(0.0))],
            &observations,
            &policy,
            &checklist,
            Utc::now(),
        );
        assert!(verdicts[0].compliant);
        assert_eq!(verdicts[0].checklist_status, Some(ChecklistStatus::Compliant));
        assert!(verdicts[0].expires_at.is_some());
    }

    #[test]
    fn cached_compliant_state_overrides_a_later_miss() {
        let policy = Policy { rules: vec![badge_rule(Some(300))], ..Default::default() };
        let checklist = ChecklistTracker::in_memory();
        let observations = vec![observation_with(0.0, "Person_A"), observation_with(60.0, "Person_A")];

        let now = Utc::now();
        apply_checklist_filter(vec![raw(true, Some(0.0))], &observations, &policy, &checklist, now);

        let second = apply_checklist_filter(
            vec![raw(false, Some(60.0))],
            &observations,
            &policy,
            &checklist,
            now,
        );
        assert!(second[0].compliant);
        assert_eq!(second[0].reason, PREVIOUSLY_VERIFIED_REASON);
    }

    #[test]
    fn fresh_miss_with_no_cached_state_stays_non_compliant() {
        let policy = Policy { rules: vec![badge_rule(Some(300))], ..Default::default() };
        let checklist = ChecklistTracker::in_memory();
        let observations = vec![observation_with(0.0, "Person_A")];

        let verdicts = apply_checklist_filter(
            vec![raw(false, Some(0.0))],
            &observations,
            &policy,
            &checklist,
            Utc::now(),
        );
        assert!(!verdicts[0].compliant);
        assert_eq!(verdicts[0].checklist_status, None);
    }
}
