//! Whisper-shaped transcript result. Every operation that touches speech
//! passes this shape around.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TranscriptResult {
    pub full_text: String,
    pub segments: Vec<TranscriptSegment>,
    pub language: String,
    pub duration: f64,
}

impl TranscriptResult {
    pub fn is_empty(&self) -> bool {
        self.full_text.trim().is_empty()
    }

    /// Concatenates prior-chunk transcript with this chunk's
    /// Path A/C ("accumulated_transcript").
    pub fn combined_with_prior(&self, accumulated: &str) -> String {
        if accumulated.trim().is_empty() {
            self.full_text.clone()
        } else if self.full_text.trim().is_empty() {
            accumulated.to_string()
        } else {
            format!("{accumulated} {}", self.full_text)
        }
    }
}
