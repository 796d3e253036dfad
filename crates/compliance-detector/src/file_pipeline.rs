//! File-mode detection: a threaded reader → detector → writer pipeline
//! ("File mode pipeline").

use std::path::Path;
use std::sync::mpsc;
use std::thread;

use compliance_schemas::keyframe::KeyframeData;

use crate::capture::{CaptureConfig, CaptureEngine, Frame};
use crate::error::Result;
use crate::video::FileFrameSource;

#[derive(Clone, Debug)]
pub struct FilePipelineConfig {
    pub sample_interval: f64,
    pub capture: CaptureConfig,
}

impl Default for FilePipelineConfig {
    fn default() -> Self {
        Self { sample_interval: 0.3, capture: CaptureConfig::default() }
    }
}

/// Runs the full file-mode pipeline: a reader thread decodes sequentially
/// and decimates by `floor(fps * sample_interval)`, pushing sampled frames
/// through a bounded channel to the main thread, which runs the comparator
/// and hands captures off to the background JPEG writer. Returns the
/// captured keyframes in ascending timestamp order.
///
/// An undecodable source produces zero keyframes rather than an error —
/// the caller (orchestrator) decides whether that's fatal.
pub fn detect_significant_changes(
    path: &Path,
    config: &FilePipelineConfig,
) -> Result<Vec<KeyframeData>> {
    let mut source = match FileFrameSource::open(path) {
        Ok(source) => source,
        Err(err) => {
            tracing::warn!(error = %err, path = %path.display(), "undecodable video source");
            return Ok(Vec::new());
        }
    };

    let fps = source.fps();
    let total_frames = source.total_frames();
    let sample_step = ((fps * config.sample_interval).floor() as u64).max(1);

    tracing::info!(
        path = %path.display(),
        fps,
        total_frames,
        sample_step,
        "starting file-mode change detection"
    );

    // Buffer ~30 sampled frames, matching the Python original's queue depth.
    let (sender, receiver) = mpsc::sync_channel::<(u64, Frame)>(30);
    let reader = thread::spawn(move || {
        let _ = source.for_each_sampled_frame(sample_step, move |idx, frame| {
            sender
                .send((idx, frame))
                .map_err(|_| crate::error::Error::Decode("frame consumer disconnected".into()))
        });
    });

    let mut engine = CaptureEngine::new(config.capture.clone());
    for (frame_idx, frame) in receiver {
        let timestamp = if fps > 0.0 { frame_idx as f64 / fps } else { frame_idx as f64 };
        engine.process_frame(&frame, timestamp, frame_idx);
    }

    if reader.join().is_err() {
        tracing::warn!(path = %path.display(), "reader thread panicked");
    }

    // EOF bookend: force-capture the true last frame if it wasn't already
    // captured.
    if total_frames > 0 {
        let last_frame_idx = total_frames - 1;
        if engine.last_frame_number() != Some(last_frame_idx) {
            match FileFrameSource::last_decodable_frame(path) {
                Ok(Some((idx, frame))) => {
                    let timestamp = if fps > 0.0 { idx as f64 / fps } else { idx as f64 };
                    engine.force_last(&frame, timestamp, idx);
                }
                Ok(None) => {}
                Err(err) => tracing::warn!(error = %err, "failed to read last frame for bookend capture"),
            }
        }
    }

    let keyframes = engine.finalize();
    if keyframes.is_empty() {
        tracing::warn!(path = %path.display(), "no keyframes captured");
    } else {
        tracing::info!(path = %path.display(), count = keyframes.len(), "file-mode detection complete");
    }
    Ok(keyframes)
}

/// Interval-sampling mode for short videos: the
/// orchestrator may request `min(N_max, total)` evenly spaced frames with no
/// change scoring at all, used for Path B short-video analysis.
pub fn sample_at_intervals(
    path: &Path,
    max_samples: u64,
    jpeg_quality: u8,
    max_width: u32,
) -> Result<Vec<KeyframeData>> {
    use compliance_schemas::keyframe::Trigger;

    let mut source = match FileFrameSource::open(path) {
        Ok(source) => source,
        Err(err) => {
            tracing::warn!(error = %err, path = %path.display(), "undecodable video source");
            return Ok(Vec::new());
        }
    };

    let fps = source.fps();
    let total_frames = source.total_frames().max(1);
    let wanted = max_samples.min(total_frames).max(1);
    let step = (total_frames / wanted).max(1);

    let mut keyframes = Vec::new();
    source.for_each_sampled_frame(step, |idx, frame| {
        if keyframes.len() as u64 >= wanted {
            return Ok(());
        }
        let timestamp = if fps > 0.0 { idx as f64 / fps } else { idx as f64 };
        let image_bytes = crate::video::resize_and_encode_jpeg(&frame, max_width, jpeg_quality)?;
        keyframes.push(KeyframeData {
            timestamp,
            frame_number: idx,
            change_score: 0.0,
            trigger: Trigger::Sample,
            image_bytes,
        });
        Ok(())
    })?;

    Ok(keyframes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_produces_zero_keyframes_not_an_error() {
        let config = FilePipelineConfig::default();
        let result = detect_significant_changes(Path::new("/nonexistent/video.mp4"), &config);
        assert!(result.is_ok());
        assert!(result.unwrap().is_empty());
    }
}
