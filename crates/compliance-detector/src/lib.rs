//! Change detection and keyframe extraction.
//!
//! Two entry points: [`file_pipeline::detect_significant_changes`] for
//! known-duration files, and [`streaming::StreamingSession`] for live
//! webcam/RTSP sources. Both share the same comparator
//! ([`preprocess`]) and capture policy ([`capture::CaptureEngine`]).

pub mod capture;
pub mod error;
pub mod file_pipeline;
pub mod preprocess;
pub mod streaming;
pub mod video;

pub use capture::{CaptureConfig, CaptureEngine, CaptureEvent, Frame, OnChangeCallback};
pub use error::{Error, Result};
pub use file_pipeline::{detect_significant_changes, sample_at_intervals, FilePipelineConfig};
pub use streaming::{StreamingConfig, StreamingSession};
pub use video::{
    classify_aspect_ratio, generate_video_id, mux_jpegs_to_mp4, read_video_metadata,
    resize_and_encode_jpeg, FileFrameSource, StreamFrameSource, VideoMetadata,
};
