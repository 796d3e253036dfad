//! Visual/speech merge rules: a video with both visual
//! and speech rules produces one Report, not two.

use compliance_schemas::policy::Mode;
use compliance_schemas::report::Report;
use compliance_schemas::verdict::Verdict;

/// Folds speech verdicts into an already-built visual Report. Only extends
/// `all_verdicts` and the summary; the caller recomputes `incidents`,
/// `overall_compliant` and `checklist_fulfilled` from the merged
/// `all_verdicts` afterwards so every derived field stays a pure function of
/// that list.
pub fn merge_speech_into_visual(report: &mut Report, speech_verdicts: Vec<Verdict>) {
    let violations = speech_verdicts
        .iter()
        .filter(|v| v.mode == Mode::Incident && !v.compliant)
        .count();

    report.all_verdicts.extend(speech_verdicts);

    if violations > 0 {
        report.summary = format!(
            "{} Speech: {violations} audio violation(s).",
            report.summary.trim_end()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use compliance_schemas::policy::{RuleType, Severity};

    fn visual_report() -> Report {
        Report {
            video_id: "v1".into(),
            summary: "All clear".into(),
            overall_compliant: true,
            incidents: vec![],
            all_verdicts: vec![],
            recommendations: vec![],
            frame_observations: vec![],
            person_summaries: vec![],
            transcript: None,
            checklist_fulfilled: None,
            analyzed_at: Utc::now(),
            total_frames_analyzed: 0,
            video_duration: 10.0,
        }
    }

    fn speech_verdict(compliant: bool) -> Verdict {
        Verdict {
            rule_type: RuleType::Speech,
            rule_description: "Must say the safety phrase".into(),
            compliant,
            severity: Severity::High,
            reason: "phrase not detected".into(),
            timestamp: Some(3.0),
            mode: Mode::Incident,
            checklist_status: None,
            expires_at: None,
        }
    }

    #[test]
    fn non_compliant_speech_verdict_appends_summary_note() {
        let mut report = visual_report();
        merge_speech_into_visual(&mut report, vec![speech_verdict(false)]);
        assert_eq!(report.all_verdicts.len(), 1);
        assert!(report.summary.contains("Speech: 1 audio violation"));
    }

    #[test]
    fn compliant_speech_verdict_leaves_summary_untouched() {
        let mut report = visual_report();
        merge_speech_into_visual(&mut report, vec![speech_verdict(true)]);
        assert_eq!(report.summary, "All clear");
    }
}
