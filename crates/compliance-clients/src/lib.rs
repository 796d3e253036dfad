//! External AI clients: a shared call envelope (rate check →
//! retry → usage accounting) wrapping three distinct capabilities —
//! vision/LLM, speech, and a remote GPU analyzer. Each client owns its own
//! [`envelope::CallEnvelope`]; there is no shared base class, since the
//! three capabilities differ enough in request/response shape that a
//! shared trait would mostly be downcasting.

pub mod envelope;
pub mod error;
pub mod parts;
pub mod rate_limit;
pub mod remote_gpu;
pub mod retry;
pub mod speech;
pub mod usage;
pub mod vision;

pub use envelope::CallEnvelope;
pub use error::{Error, Result};
pub use parts::{ImageDetail, Part, PartsBuilder};
pub use rate_limit::{RateLimitConfig, SlidingWindowLimiter};
pub use remote_gpu::{RemoteGpuClient, RemoteGpuConfig};
pub use retry::{is_retryable, run_with_retry, RetryConfig};
pub use speech::{SpeechClient, SpeechClientConfig};
pub use usage::{price_table, ModelPrice, UsageTotals, UsageTracker};
pub use vision::{VisionClient, VisionClientConfig};
