//! Streaming-mode detection for webcam/RTSP sources: a grabber thread and a
//! sampler thread sharing a single-slot frame cell ("Streaming
//! mode").

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use compliance_schemas::keyframe::KeyframeData;
use image::RgbImage;

use crate::capture::{CaptureConfig, CaptureEngine, OnChangeCallback};
use crate::video::StreamFrameSource;

#[derive(Clone, Debug)]
pub struct StreamingConfig {
    pub sample_interval: f64,
    pub capture: CaptureConfig,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self { sample_interval: 0.3, capture: CaptureConfig::default() }
    }
}

/// A running webcam/RTSP capture. The grabber thread continuously
/// overwrites a single-slot cell — oldest reads drop silently, backpressure
/// by overwrite rather than by queue — so the sampler thread always sees
/// the most recent frame even when detection lags.
pub struct StreamingSession {
    stop: Arc<AtomicBool>,
    grabber_handle: Option<JoinHandle<()>>,
    sampler_handle: Option<JoinHandle<CaptureEngine>>,
}

impl StreamingSession {
    /// Non-blocking: spawns the grabber and sampler threads and returns
    /// immediately.
    pub fn start(source: String, config: StreamingConfig, on_change: Option<OnChangeCallback>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let latest_frame: Arc<Mutex<Option<RgbImage>>> = Arc::new(Mutex::new(None));
        let frame_number = Arc::new(AtomicU64::new(0));

        let grabber_handle = {
            let stop = stop.clone();
            let latest_frame = latest_frame.clone();
            let frame_number = frame_number.clone();
            thread::spawn(move || {
                let mut video_source = match StreamFrameSource::open(&source) {
                    Ok(source) => source,
                    Err(err) => {
                        tracing::error!(error = %err, source = %source, "could not open video source");
                        return;
                    }
                };
                let result = video_source.run_until_stopped(&stop, |frame| {
                    *latest_frame.lock().expect("frame cell poisoned") = Some(frame);
                    frame_number.fetch_add(1, Ordering::Relaxed);
                });
                if let Err(err) = result {
                    tracing::error!(error = %err, "streaming grabber stopped unexpectedly");
                }
            })
        };

        let sampler_handle = {
            let stop = stop.clone();
            let latest_frame = latest_frame.clone();
            let frame_number = frame_number.clone();
            let sample_interval = config.sample_interval;
            let capture_config = config.capture.clone();
            thread::spawn(move || {
                let mut engine = CaptureEngine::with_callback(capture_config, on_change);
                let start = Instant::now();
                while !stop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_secs_f64(sample_interval));

                    let frame = latest_frame.lock().expect("frame cell poisoned").clone();
                    let Some(frame) = frame else { continue };

                    let timestamp = start.elapsed().as_secs_f64();
                    let number = frame_number.load(Ordering::Relaxed);
                    engine.process_frame(&frame, timestamp, number);
                }
                engine
            })
        };

        tracing::info!("streaming detector started");
        Self {
            stop,
            grabber_handle: Some(grabber_handle),
            sampler_handle: Some(sampler_handle),
        }
    }

    /// Blocks until both threads finish, flushing pending keyframe writes.
    pub fn stop(mut self) -> Vec<KeyframeData> {
        self.stop.store(true, Ordering::Relaxed);

        if let Some(handle) = self.grabber_handle.take() {
            let _ = handle.join();
        }

        let keyframes = match self.sampler_handle.take().and_then(|h| h.join().ok()) {
            Some(mut engine) => engine.finalize(),
            None => Vec::new(),
        };
        tracing::info!(count = keyframes.len(), "streaming detector stopped");
        keyframes
    }
}

impl Drop for StreamingSession {
    /// A dropped session without an explicit `stop()` still signals both
    /// threads to exit; it just doesn't wait for them or return events.
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_source_stops_cleanly_with_no_keyframes() {
        let session = StreamingSession::start(
            "/dev/does-not-exist".to_string(),
            StreamingConfig { sample_interval: 0.01, capture: CaptureConfig::default() },
            None,
        );
        thread::sleep(Duration::from_millis(50));
        let keyframes = session.stop();
        assert!(keyframes.is_empty());
    }
}
