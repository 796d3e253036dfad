//! Request shapes the orchestrator's two entry points accept. The HTTP/multipart layer that builds these is out
//! of scope; these are just the data the orchestrator itself consumes.

use compliance_schemas::policy::Policy;

/// `provider` selects which analyzer backs Path A's combined call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Provider {
    #[default]
    Default,
    RemoteGpu,
}

/// Path A input: one JPEG, or a short burst of JPEGs captured
/// from a webcam, plus the policy and whatever speech context carried over
/// from a prior chunk of a live session.
#[derive(Clone, Debug)]
pub struct FrameAnalyzeRequest {
    /// At least one JPEG frame. A single still frame is the common case;
    /// a short burst (bounded by `DetectorConfig::max_webcam_frames`) lets
    /// a webcam client submit a few frames from one capture tick.
    pub frames: Vec<Vec<u8>>,
    pub policy: Policy,
    pub accumulated_transcript: Option<String>,
    pub provider: Provider,
}

impl FrameAnalyzeRequest {
    pub fn single_frame(jpeg: Vec<u8>, policy: Policy) -> Self {
        Self { frames: vec![jpeg], policy, accumulated_transcript: None, provider: Provider::Default }
    }
}
