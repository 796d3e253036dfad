//! Person thumbnail assignment: each
//! [`PersonSummary`] gets the keyframe image nearest to its `first_seen`
//! timestamp in which that subject was actually observed, falling back to
//! the nearest frame with any image at all. Pure function of its inputs, so
//! re-running it on an already-assigned report is a no-op (T9 idempotence).

use compliance_schemas::observation::FrameObservation;
use compliance_schemas::person::PersonSummary;

pub fn assign_person_thumbnails(
    summaries: &mut [PersonSummary],
    observations: &[FrameObservation],
) {
    for summary in summaries.iter_mut() {
        if let Some(obs) = nearest_observation_for(summary, observations) {
            summary.thumbnail_bytes = obs.image_bytes.clone();
        }
    }
}

fn nearest_observation_for<'a>(
    summary: &PersonSummary,
    observations: &'a [FrameObservation],
) -> Option<&'a FrameObservation> {
    let matching = observations
        .iter()
        .filter(|o| !o.image_bytes.is_empty() && o.people.iter().any(|p| p.person_id == summary.person_id))
        .min_by(|a, b| distance(a, summary).partial_cmp(&distance(b, summary)).unwrap());

    matching.or_else(|| {
        observations
            .iter()
            .filter(|o| !o.image_bytes.is_empty())
            .min_by(|a, b| distance(a, summary).partial_cmp(&distance(b, summary)).unwrap())
    })
}

fn distance(observation: &FrameObservation, summary: &PersonSummary) -> f64 {
    (observation.timestamp - summary.first_seen).abs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use compliance_schemas::keyframe::Trigger;
    use compliance_schemas::observation::PersonDetail;

    fn observation(ts: f64, person_id: Option<&str>, image_bytes: Vec<u8>) -> FrameObservation {
        FrameObservation {
            timestamp: ts,
            description: "desc".into(),
            trigger: Trigger::Sample,
            change_score: 0.1,
            image_bytes,
            people: person_id
                .map(|id| vec![PersonDetail { person_id: id.to_string(), appearance: "".into(), details: "".into() }])
                .unwrap_or_default(),
        }
    }

    fn summary(person_id: &str, first_seen: f64) -> PersonSummary {
        PersonSummary {
            person_id: person_id.to_string(),
            appearance: "".into(),
            first_seen,
            last_seen: first_seen + 5.0,
            frames_seen: 1,
            compliant: true,
            violations: vec![],
            thumbnail_bytes: vec![],
        }
    }

    #[test]
    fn picks_nearest_frame_matching_person_id() {
        let observations = vec![
            observation(0.0, Some("Person_A"), vec![1]),
            observation(10.0, Some("Person_A"), vec![2]),
            observation(9.0, Some("Person_B"), vec![3]),
        ];
        let mut summaries = vec![summary("Person_A", 9.5)];
        assign_person_thumbnails(&mut summaries, &observations);
        assert_eq!(summaries[0].thumbnail_bytes, vec![2]);
    }

    #[test]
    fn falls_back_to_nearest_frame_with_any_image_when_no_person_match() {
        let observations = vec![observation(0.0, None, vec![9]), observation(100.0, None, vec![10])];
        let mut summaries = vec![summary("Person_A", 5.0)];
        assign_person_thumbnails(&mut summaries, &observations);
        assert_eq!(summaries[0].thumbnail_bytes, vec![9]);
    }

    #[test]
    fn repeated_assignment_is_idempotent() {
        let observations = vec![observation(0.0, Some("Person_A"), vec![7])];
        let mut summaries = vec![summary("Person_A", 0.0)];
        assign_person_thumbnails(&mut summaries, &observations);
        let first = summaries[0].thumbnail_bytes.clone();
        assign_person_thumbnails(&mut summaries, &observations);
        assert_eq!(summaries[0].thumbnail_bytes, first);
    }
}
