//! Errors for the external AI client envelope.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("request cancelled")]
    Cancelled,

    #[error("provider call failed and is not retryable: {0}")]
    NonRetryable(String),

    #[error("provider call failed after {attempts} attempts: {source}")]
    RetriesExhausted { attempts: u32, source: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("provider reported an error: {0}")]
    Provider(String),

    #[error("malformed provider response: {0}")]
    MalformedResponse(String),

    #[error("external transcoder failed: {0}")]
    Transcode(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
