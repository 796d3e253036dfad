//! Errors for the Change Detector crate.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("could not open video source: {0}")]
    SourceUnavailable(String),

    #[error("video decode error: {0}")]
    Decode(String),

    #[error("failed to encode keyframe as JPEG: {0}")]
    Encode(#[from] image::ImageError),

    #[error("keyframe write error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
