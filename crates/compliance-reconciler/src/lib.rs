//! Verdict Reconciler: turns raw model verdicts into a final
//! [`Report`], applying dual-mode (incident vs checklist) filtering,
//! checklist-state overrides, visual/speech merge rules, and person
//! thumbnail assignment.
//!
//! Every derived field (`overall_compliant`, `checklist_fulfilled`,
//! thumbnails) is computed once at finalization from the accumulated
//! `all_verdicts`/`person_summaries`, rather than threaded through mutation
//! order — this makes `finalize()` naturally idempotent.

mod checklist_filter;
mod merge;
mod thumbnails;

use chrono::Utc;

use compliance_checklist::ChecklistTracker;
use compliance_schemas::observation::FrameObservation;
use compliance_schemas::person::PersonSummary;
use compliance_schemas::policy::{Mode, Policy};
use compliance_schemas::report::{RawReport, Report};
use compliance_schemas::transcript::TranscriptResult;
use compliance_schemas::verdict::Verdict;

pub use checklist_filter::apply_checklist_filter;
pub use merge::merge_speech_into_visual;
pub use thumbnails::assign_person_thumbnails;

/// Builds the final [`Report`] from a visual [`RawReport`] (straight off
/// the vision model), the observations it was derived from, and the
/// policy's checklist-mode rules. This is the single entry point the
/// orchestrator calls after `evaluate_and_report` / the combined call
/// returns.
pub fn reconcile_visual(
    video_id: String,
    raw: RawReport,
    observations: &[FrameObservation],
    policy: &Policy,
    checklist: &ChecklistTracker,
    total_frames_analyzed: usize,
    video_duration: f64,
) -> Report {
    let now = Utc::now();
    let verdicts = apply_checklist_filter(raw.verdicts, observations, policy, checklist, now);

    let incidents = incidents_of(&verdicts);
    let overall_compliant = overall_compliant_of(&verdicts);
    let checklist_fulfilled = checklist_fulfilled_of(&verdicts);

    let mut person_summaries: Vec<PersonSummary> =
        raw.person_summaries.into_iter().map(PersonSummary::from).collect();
    assign_person_thumbnails(&mut person_summaries, observations);

    Report {
        video_id,
        summary: raw.summary,
        overall_compliant,
        incidents,
        all_verdicts: verdicts,
        recommendations: raw.recommendations,
        frame_observations: observations.to_vec(),
        person_summaries,
        transcript: None,
        checklist_fulfilled,
        analyzed_at: now,
        total_frames_analyzed,
        video_duration,
    }
}

/// A visual-only Report synthesized when a request carries only speech
/// rules and there is no visual report to start from.
pub fn synthetic_report(video_id: String, video_duration: f64) -> Report {
    Report {
        video_id,
        summary: String::new(),
        overall_compliant: true,
        incidents: Vec::new(),
        all_verdicts: Vec::new(),
        recommendations: Vec::new(),
        frame_observations: Vec::new(),
        person_summaries: Vec::new(),
        transcript: None,
        checklist_fulfilled: None,
        analyzed_at: Utc::now(),
        total_frames_analyzed: 0,
        video_duration,
    }
}

/// Merges speech verdicts and the combined transcript into an existing
/// Report, recomputing every derived field from scratch.
pub fn merge_speech(
    mut report: Report,
    speech_verdicts: Vec<Verdict>,
    transcript: Option<&TranscriptResult>,
) -> Report {
    merge::merge_speech_into_visual(&mut report, speech_verdicts);
    report.transcript = transcript.map(|t| t.full_text.clone());
    report.incidents = incidents_of(&report.all_verdicts);
    report.overall_compliant = overall_compliant_of(&report.all_verdicts);
    report.checklist_fulfilled = checklist_fulfilled_of(&report.all_verdicts);
    report
}

/// T1/I2: only non-compliant incident-mode verdicts become incidents;
/// checklist violations never do.
fn incidents_of(verdicts: &[Verdict]) -> Vec<Verdict> {
    verdicts.iter().filter(|v| v.is_valid_incident()).cloned().collect()
}

/// I2/T2: overall_compliant iff every incident-mode verdict is compliant.
fn overall_compliant_of(verdicts: &[Verdict]) -> bool {
    verdicts.iter().filter(|v| v.mode == Mode::Incident).all(|v| v.compliant)
}

/// I3/T3: null iff no checklist-mode verdict exists, else the conjunction.
fn checklist_fulfilled_of(verdicts: &[Verdict]) -> Option<bool> {
    let checklist_verdicts: Vec<&Verdict> = verdicts.iter().filter(|v| v.mode == Mode::Checklist).collect();
    if checklist_verdicts.is_empty() {
        None
    } else {
        Some(checklist_verdicts.iter().all(|v| v.compliant))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use compliance_schemas::keyframe::Trigger;
    use compliance_schemas::policy::{Frequency, PolicyRule, RuleType, Severity};
    use compliance_schemas::verdict::RawVerdict;

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

    fn observation(ts: f64, person_id: &str) -> FrameObservation {
        FrameObservation {
            timestamp: ts,
            description: "desc".into(),
            trigger: Trigger::Sample,
            change_score: 0.1,
            image_bytes: vec![1, 2, 3],
            people: vec![compliance_schemas::observation::PersonDetail {
                person_id: person_id.to_string(),
                appearance: "blue jacket".into(),
                details: String::new(),
            }],
        }
    }

    #[test]
    fn incident_violation_flows_through_to_incidents() {
        let policy = Policy { rules: vec![incident_rule("Hard hat required")], ..Default::default() };
        let raw = RawReport {
            summary: "found a violation".into(),
            overall_compliant: false,
            verdicts: vec![RawVerdict {
                rule_type: RuleType::Ppe,
                rule_description: "Hard hat required".into(),
                compliant: false,
                severity: Severity::Critical,
                reason: "no hat visible".into(),
                timestamp: Some(20.0),
            }],
            recommendations: vec![],
            person_summaries: vec![],
        };
        let checklist = ChecklistTracker::in_memory();
        let observations = vec![observation(20.0, "Person_A")];
        let report = reconcile_visual(
            "video123".into(),
            raw,
            &observations,
            &policy,
            &checklist,
            1,
            30.0,
        );

        assert_eq!(report.incidents.len(), 1);
        assert!(!report.overall_compliant);
        assert!(report.checklist_fulfilled.is_none());
    }

    #[test]
    fn reconciliation_is_idempotent_under_repeated_thumbnail_assignment() {
        let policy = Policy::default();
        let raw = RawReport::degraded("test");
        let checklist = ChecklistTracker::in_memory();
        let observations = vec![observation(0.0, "Person_A")];
        let mut report =
            reconcile_visual("v".into(), raw, &observations, &policy, &checklist, 1, 5.0);

        let before = report.person_summaries.clone();
        assign_person_thumbnails(&mut report.person_summaries, &observations);
        assert_eq!(
            before.iter().map(|p| &p.thumbnail_bytes).collect::<Vec<_>>(),
            report.person_summaries.iter().map(|p| &p.thumbnail_bytes).collect::<Vec<_>>()
        );
    }
}
