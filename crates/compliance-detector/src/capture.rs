//! The stateful comparator + capture policy shared by file and streaming
//! modes ("Core: ChangeDetector"), plus its background JPEG
//! encoder thread.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use compliance_schemas::keyframe::{KeyframeData, Trigger};

use crate::preprocess::{compute_change_score, preprocess_frame, PreparedFrame};
use crate::video::resize_and_encode_jpeg;

pub type Frame = image::RgbImage;

#[derive(Clone, Debug)]
pub struct CaptureConfig {
    pub change_threshold: f64,
    pub min_change_interval: f64,
    pub max_gap: f64,
    pub jpeg_quality: u8,
    pub max_width: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            change_threshold: 0.10,
            min_change_interval: 0.5,
            max_gap: 10.0,
            jpeg_quality: 85,
            max_width: 768,
        }
    }
}

/// Lightweight capture notification fired synchronously at capture time.
/// Mirrors the Python original's callback event, which also carries only
/// metadata (a keyframe path, not pixel data) — the encoded bytes land
/// later, asynchronously, in the vector `finalize()` returns.
#[derive(Clone, Debug)]
pub struct CaptureEvent {
    pub index: usize,
    pub timestamp: f64,
    pub frame_number: u64,
    pub change_score: f64,
    pub trigger: Trigger,
}

pub type OnChangeCallback = Arc<dyn Fn(&CaptureEvent) + Send + Sync>;

struct EncodeJob {
    index: usize,
    frame: Frame,
    event: CaptureEvent,
}

/// Background JPEG encoder. The Rust analogue of the Python original's
/// threaded `KeyframeWriter`: resize-and-encode happens off the detection
/// loop's hot path, queued on an unbounded channel and drained at
/// `finalize()`.
struct KeyframeWriter {
    sender: Option<mpsc::Sender<EncodeJob>>,
    handle: Option<JoinHandle<()>>,
}

impl KeyframeWriter {
    fn spawn(results: Arc<Mutex<Vec<Option<KeyframeData>>>>, config: CaptureConfig) -> Self {
        let (sender, receiver) = mpsc::channel::<EncodeJob>();
        let handle = thread::spawn(move || {
            for job in receiver {
                let encoded =
                    resize_and_encode_jpeg(&job.frame, config.max_width, config.jpeg_quality);
                let mut guard = results.lock().expect("keyframe writer lock poisoned");
                if job.index >= guard.len() {
                    guard.resize(job.index + 1, None);
                }
                match encoded {
                    Ok(image_bytes) => {
                        guard[job.index] = Some(KeyframeData {
                            timestamp: job.event.timestamp,
                            frame_number: job.event.frame_number,
                            change_score: job.event.change_score,
                            trigger: job.event.trigger,
                            image_bytes,
                        });
                    }
                    Err(err) => {
                        // A write error is logged and the event is dropped
                        // without invalidating later events.
                        tracing::warn!(error = %err, index = job.index, "dropping keyframe: encode failed");
                    }
                }
            }
        });
        Self { sender: Some(sender), handle: Some(handle) }
    }

    fn submit(&self, job: EncodeJob) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(job);
        }
    }

    /// Idempotent: a second call is a no-op.
    fn finalize(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Stateful change detector shared by file-mode and streaming-mode pipelines
///. Holds the comparison state — previous captured frame's
/// derivatives and last capture time — so callers can feed it frames one at
/// a time from any source.
pub struct CaptureEngine {
    config: CaptureConfig,
    on_change: Option<OnChangeCallback>,
    prev_prep: Option<PreparedFrame>,
    last_capture_time: f64,
    last_frame_number: Option<u64>,
    next_index: usize,
    results: Arc<Mutex<Vec<Option<KeyframeData>>>>,
    writer: KeyframeWriter,
}

impl CaptureEngine {
    pub fn new(config: CaptureConfig) -> Self {
        Self::with_callback(config, None)
    }

    pub fn with_callback(config: CaptureConfig, on_change: Option<OnChangeCallback>) -> Self {
        let results = Arc::new(Mutex::new(Vec::new()));
        let writer = KeyframeWriter::spawn(results.clone(), config.clone());
        Self {
            config,
            on_change,
            prev_prep: None,
            last_capture_time: -999.0,
            last_frame_number: None,
            next_index: 0,
            results,
            writer,
        }
    }

    pub fn last_frame_number(&self) -> Option<u64> {
        self.last_frame_number
    }

    /// Core per-frame decision. Returns a
    /// lightweight event if this frame was captured.
    pub fn process_frame(
        &mut self,
        frame: &Frame,
        timestamp: f64,
        frame_number: u64,
    ) -> Option<CaptureEvent> {
        let prep = preprocess_frame(frame);

        let Some(prev) = &self.prev_prep else {
            return Some(self.capture(frame, prep, timestamp, frame_number, 1.0, Trigger::First));
        };

        let score = compute_change_score(&prep, prev);
        let time_since_last = timestamp - self.last_capture_time;

        let trigger = if score >= self.config.change_threshold
            && time_since_last >= self.config.min_change_interval
        {
            Some(Trigger::Change)
        } else if time_since_last >= self.config.max_gap {
            Some(Trigger::MaxGap)
        } else {
            None
        };

        trigger.map(|trigger| self.capture(frame, prep, timestamp, frame_number, score, trigger))
    }

    /// Force-captures a frame with `trigger = Last`, used by the file-mode
    /// pipeline at EOF when the final frame wasn't already captured
    ///.
    pub fn force_last(&mut self, frame: &Frame, timestamp: f64, frame_number: u64) -> CaptureEvent {
        let prep = preprocess_frame(frame);
        let score = self
            .prev_prep
            .as_ref()
            .map(|prev| compute_change_score(&prep, prev))
            .unwrap_or(1.0);
        self.capture(frame, prep, timestamp, frame_number, score, Trigger::Last)
    }

    fn capture(
        &mut self,
        frame: &Frame,
        prep: PreparedFrame,
        timestamp: f64,
        frame_number: u64,
        change_score: f64,
        trigger: Trigger,
    ) -> CaptureEvent {
        let index = self.next_index;
        self.next_index += 1;

        let event = CaptureEvent { index, timestamp, frame_number, change_score, trigger };

        self.writer.submit(EncodeJob { index, frame: frame.clone(), event: event.clone() });

        self.prev_prep = Some(prep);
        self.last_capture_time = timestamp;
        self.last_frame_number = Some(frame_number);

        if let Some(callback) = &self.on_change {
            callback(&event);
        }

        event
    }

    /// Drains pending encodes and returns the captured keyframes in capture
    /// order (ascending timestamp). Idempotent.
    pub fn finalize(&mut self) -> Vec<KeyframeData> {
        self.writer.finalize();
        let mut guard = self.results.lock().expect("keyframe writer lock poisoned");
        guard.drain(..).flatten().collect()
    }

    /// Resets comparison state for a new video/stream; keeps configuration.
    /// Implicitly finalizes any pending writes first.
    pub fn reset(&mut self) {
        self.writer.finalize();
        self.prev_prep = None;
        self.last_capture_time = -999.0;
        self.last_frame_number = None;
        self.next_index = 0;
        self.results = Arc::new(Mutex::new(Vec::new()));
        self.writer = KeyframeWriter::spawn(self.results.clone(), self.config.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(v: u8) -> Frame {
        Frame::from_pixel(32, 32, image::Rgb([v, v, v]))
    }

    #[test]
    fn first_frame_always_captures() {
        let mut engine = CaptureEngine::new(CaptureConfig::default());
        let event = engine.process_frame(&solid(10), 0.0, 0);
        assert!(matches!(event, Some(CaptureEvent { trigger: Trigger::First, .. })));
    }

    #[test]
    fn unchanged_frames_do_not_recapture_before_max_gap() {
        let mut engine = CaptureEngine::new(CaptureConfig::default());
        engine.process_frame(&solid(10), 0.0, 0);
        let event = engine.process_frame(&solid(10), 1.0, 3);
        assert!(event.is_none());
    }

    #[test]
    fn max_gap_forces_a_capture() {
        let mut engine = CaptureEngine::new(CaptureConfig::default());
        engine.process_frame(&solid(10), 0.0, 0);
        let event = engine.process_frame(&solid(10), 11.0, 30);
        assert!(matches!(event, Some(CaptureEvent { trigger: Trigger::MaxGap, .. })));
    }

    #[test]
    fn sharp_change_captures_before_max_gap() {
        let mut engine = CaptureEngine::new(CaptureConfig::default());
        engine.process_frame(&solid(0), 0.0, 0);
        let event = engine.process_frame(&solid(255), 1.0, 3);
        assert!(matches!(event, Some(CaptureEvent { trigger: Trigger::Change, .. })));
    }

    #[test]
    fn finalize_returns_encoded_bytes_in_capture_order() {
        let mut engine = CaptureEngine::new(CaptureConfig::default());
        engine.process_frame(&solid(0), 0.0, 0);
        engine.process_frame(&solid(255), 1.0, 3);
        let keyframes = engine.finalize();
        assert_eq!(keyframes.len(), 2);
        assert!(keyframes[0].timestamp <= keyframes[1].timestamp);
        assert!(!keyframes[0].image_bytes.is_empty());
    }

    #[test]
    fn finalize_is_idempotent() {
        let mut engine = CaptureEngine::new(CaptureConfig::default());
        engine.process_frame(&solid(10), 0.0, 0);
        let first = engine.finalize();
        let second = engine.finalize();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[test]
    fn reset_clears_state_but_keeps_config() {
        let mut engine = CaptureEngine::new(CaptureConfig::default());
        engine.process_frame(&solid(10), 0.0, 0);
        engine.reset();
        let event = engine.process_frame(&solid(10), 0.0, 0);
        assert!(matches!(event, Some(CaptureEvent { trigger: Trigger::First, .. })));
    }

    #[test]
    fn on_change_callback_fires_synchronously() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let callback: OnChangeCallback = Arc::new(move |event| {
            seen_clone.lock().unwrap().push(event.frame_number);
        });
        let mut engine = CaptureEngine::with_callback(CaptureConfig::default(), Some(callback));
        engine.process_frame(&solid(10), 0.0, 0);
        assert_eq!(*seen.lock().unwrap(), vec![0]);
    }
}
