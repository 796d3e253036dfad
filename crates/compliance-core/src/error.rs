//! The orchestrator's error taxonomy: one variant per subsystem,
//! wrapping each downstream crate's error with `#[from]`, plus the
//! taxonomy's own request-shape errors.
//!
//! `PartialFailure` is deliberately not a variant here — a failed
//! Speech subtask is logged at `warn` and folded into the Report's summary
//! by the orchestrator, never surfaced as an `Err` (see DESIGN.md open
//! question (a)).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("policy JSON invalid or empty: {0}")]
    BadRequest(String),

    #[error("video source could not be decoded: {0}")]
    DecodeFailure(String),

    #[error("no keyframes could be extracted from the source")]
    NoKeyframes,

    #[error("model call failed and will not be retried: {0}")]
    ModelNonRetryable(String),

    #[error("model call failed after exhausting the retry budget: {0}")]
    ModelTransient(String),

    #[error("model response could not be parsed into the expected schema: {0}")]
    ModelStructuralInvalid(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("change detector error: {0}")]
    Detector(#[from] compliance_detector::Error),

    #[error("checklist tracker error: {0}")]
    Checklist(#[from] compliance_checklist::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// One-based pipeline stage this error occurred in, and a short name,
    /// used to build the `[Stage N:Name]` prefix on a top-level error
    /// response.
    fn stage(&self) -> (u32, &'static str) {
        match self {
            Error::BadRequest(_) => (0, "BadRequest"),
            Error::DecodeFailure(_) => (1, "ChangeDetector"),
            Error::NoKeyframes => (1, "ChangeDetector"),
            Error::ModelNonRetryable(_) | Error::ModelTransient(_) | Error::ModelStructuralInvalid(_) => {
                (2, "AIClients")
            }
            Error::Cancelled => (0, "Cancelled"),
            Error::Detector(_) => (1, "ChangeDetector"),
            Error::Checklist(_) => (3, "ChecklistTracker"),
        }
    }

    /// Renders `"[Stage N:Name] message"`, the exact shape a top-level
    /// `AnalyzeResponse{status:"error", ...}` carries.
    pub fn to_tagged_string(&self) -> String {
        let (stage, name) = self.stage();
        format!("[Stage {stage}:{name}] {self}")
    }
}

impl From<compliance_clients::Error> for Error {
    fn from(err: compliance_clients::Error) -> Self {
        match err {
            compliance_clients::Error::Cancelled => Error::Cancelled,
            compliance_clients::Error::NonRetryable(message) => Error::ModelNonRetryable(message),
            compliance_clients::Error::RetriesExhausted { source, .. } => Error::ModelTransient(source),
            compliance_clients::Error::MalformedResponse(message) => Error::ModelStructuralInvalid(message),
            other => Error::ModelTransient(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_string_carries_stage_and_name() {
        let err = Error::NoKeyframes;
        let tagged = err.to_tagged_string();
        assert!(tagged.starts_with("[Stage 1:ChangeDetector]"));
    }

    #[test]
    fn client_cancellation_maps_to_cancelled() {
        let err: Error = compliance_clients::Error::Cancelled.into();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn client_non_retryable_maps_through() {
        let err: Error = compliance_clients::Error::NonRetryable("invalid api key".into()).into();
        assert!(matches!(err, Error::ModelNonRetryable(_)));
    }
}
