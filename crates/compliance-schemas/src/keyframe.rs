//! Keyframes emitted by the Change Detector.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    First,
    Change,
    MaxGap,
    Sample,
    Last,
    /// Path A (single frame / webcam) synthesizes a one-element keyframe
    /// sequence with this trigger.
    WebcamFrame,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyframeData {
    /// Seconds from the start of the source.
    pub timestamp: f64,
    pub frame_number: u64,
    /// In `[0, 1]`.
    pub change_score: f64,
    pub trigger: Trigger,
    /// JPEG bytes, resized to at most the configured max width.
    pub image_bytes: Vec<u8>,
}

impl KeyframeData {
    /// Holds iff change_score is in [0, 1].
    pub fn is_valid_score(&self) -> bool {
        (0.0..=1.0).contains(&self.change_score)
    }
}

/// Checks invariant I5 / T5 over a full sequence: timestamps non-decreasing,
/// at most one keyframe per frame_number, first trigger is `first` or `sample`.
pub fn validate_keyframe_sequence(frames: &[KeyframeData]) -> Result<(), String> {
    let mut seen_frame_numbers = std::collections::HashSet::new();
    let mut last_ts = f64::MIN;
    for (i, kf) in frames.iter().enumerate() {
        if kf.timestamp < last_ts {
            return Err(format!(
                "keyframe {i} timestamp {} is less than preceding {last_ts}",
                kf.timestamp
            ));
        }
        last_ts = kf.timestamp;
        if !seen_frame_numbers.insert(kf.frame_number) {
            return Err(format!("duplicate frame_number {}", kf.frame_number));
        }
        if !kf.is_valid_score() {
            return Err(format!("change_score {} out of [0,1]", kf.change_score));
        }
    }
    if let Some(first) = frames.first() {
        if !matches!(first.trigger, Trigger::First | Trigger::Sample) {
            return Err(format!("first keyframe trigger was {:?}, expected First or Sample", first.trigger));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kf(ts: f64, n: u64, trigger: Trigger) -> KeyframeData {
        KeyframeData { timestamp: ts, frame_number: n, change_score: 0.2, trigger, image_bytes: vec![] }
    }

    #[test]
    fn accepts_non_decreasing_sequence() {
        let frames = vec![kf(0.0, 0, Trigger::First), kf(1.2, 4, Trigger::Change)];
        assert!(validate_keyframe_sequence(&frames).is_ok());
    }

    #[test]
    fn rejects_decreasing_timestamp() {
        let frames = vec![kf(1.0, 0, Trigger::First), kf(0.5, 4, Trigger::Change)];
        assert!(validate_keyframe_sequence(&frames).is_err());
    }

    #[test]
    fn rejects_duplicate_frame_number() {
        let frames = vec![kf(0.0, 0, Trigger::First), kf(1.0, 0, Trigger::Change)];
        assert!(validate_keyframe_sequence(&frames).is_err());
    }

    #[test]
    fn rejects_wrong_first_trigger() {
        let frames = vec![kf(0.0, 0, Trigger::Change)];
        assert!(validate_keyframe_sequence(&frames).is_err());
    }
}
