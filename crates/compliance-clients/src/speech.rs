//! Speech client: extracts a mono 16kHz WAV from a video via
//! an external transcoder, then submits it to the speech provider for a
//! verbose, segment-timestamped transcript.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::{AudioInput, CreateTranscriptionRequestArgs, TimestampGranularity};
use async_openai::Client;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use compliance_schemas::transcript::{TranscriptResult, TranscriptSegment};

use crate::envelope::{now_seconds, CallEnvelope};
use crate::error::Result;
use crate::rate_limit::RateLimitConfig;
use crate::retry::RetryConfig;
use crate::usage::price_table;

/// An extracted file under this size is treated as "no audio".
const MIN_USABLE_AUDIO_BYTES: u64 = 1000;
/// ffmpeg extraction gets a 60s hard wall.
const EXTRACTION_TIMEOUT: Duration = Duration::from_secs(60);

pub struct SpeechClientConfig {
    pub model: String,
}

impl Default for SpeechClientConfig {
    fn default() -> Self {
        Self { model: "whisper-1".to_string() }
    }
}

pub struct SpeechClient {
    client: Client<OpenAIConfig>,
    config: SpeechClientConfig,
    envelope: CallEnvelope,
}

impl SpeechClient {
    pub fn new(client: Client<OpenAIConfig>, config: SpeechClientConfig) -> Self {
        Self::with_envelope(client, config, RetryConfig::default(), RateLimitConfig::default())
    }

    pub fn with_envelope(
        client: Client<OpenAIConfig>,
        config: SpeechClientConfig,
        retry: RetryConfig,
        rate_limit: RateLimitConfig,
    ) -> Self {
        Self { client, config, envelope: CallEnvelope::new(retry, rate_limit) }
    }

    /// Full two-phase pipeline: extract, then transcribe.
    /// Returns `None` for "no audio" — never an error, since a silent or
    /// audio-less video is a normal input, not a failure.
    pub async fn transcribe_video(
        &self,
        video_path: &Path,
        cancellation: &CancellationToken,
    ) -> Result<Option<TranscriptResult>> {
        let Some(wav_path) = extract_audio_wav(video_path).await? else {
            return Ok(None);
        };

        let result = self.transcribe_wav(&wav_path, cancellation).await;
        let _ = tokio::fs::remove_file(&wav_path).await;
        if let Ok(ref transcript) = result {
            self.record_usage(transcript.duration);
        }
        result.map(Some)
    }

    /// Whisper is priced per audio-minute rather than per token, so the only figure available after a
    /// transcription call is the source clip's duration.
    fn record_usage(&self, duration_secs: f64) {
        let price = price_table()
            .get(self.config.model.as_str())
            .copied()
            .unwrap_or(crate::usage::ModelPrice::audio(0.0));
        let minute = (now_seconds() / 60.0) as u64;
        self.envelope.usage.record_audio_call(minute, duration_secs / 60.0, price);
    }

    async fn transcribe_wav(
        &self,
        wav_path: &Path,
        cancellation: &CancellationToken,
    ) -> Result<TranscriptResult> {
        let model = self.config.model.clone();
        let wav_path = wav_path.to_path_buf();

        self.envelope
            .call(cancellation, || {
                let client = &self.client;
                let model = model.clone();
                let wav_path = wav_path.clone();
                async move {
                    let bytes = tokio::fs::read(&wav_path).await.map_err(|e| e.to_string())?;
                    let audio = AudioInput::from_vec_u8("audio.wav".to_string(), bytes);

                    let request = CreateTranscriptionRequestArgs::default()
                        .file(audio)
                        .model(model)
                        .timestamp_granularities(vec![TimestampGranularity::Segment])
                        .build()
                        .map_err(|e| e.to_string())?;

                    let response = client
                        .audio()
                        .transcribe_verbose_json(request)
                        .await
                        .map_err(|e| e.to_string())?;

                    let segments = response
                        .segments
                        .unwrap_or_default()
                        .into_iter()
                        .map(|seg| TranscriptSegment {
                            start: seg.start,
                            end: seg.end,
                            text: seg.text,
                        })
                        .collect();

                    Ok::<TranscriptResult, String>(TranscriptResult {
                        full_text: response.text.trim().to_string(),
                        segments,
                        language: response.language,
                        duration: response.duration.unwrap_or(0.0) as f64,
                    })
                }
            })
            .await
    }
}

/// `ffmpeg -i <video> -vn -acodec pcm_s16le -ar 16000 -ac 1 -y <wav>`, the
/// external transcoder invocation / the original's
/// `extract_audio`. Returns `None` ("no audio") if the transcoder fails,
/// times out, or the output is under 1000 bytes.
async fn extract_audio_wav(video_path: &Path) -> Result<Option<PathBuf>> {
    let wav_path = std::env::temp_dir().join(format!(
        "compliance-speech-{}.wav",
        uuid::Uuid::new_v4().simple()
    ));

    let mut command = Command::new("ffmpeg");
    command
        .arg("-i")
        .arg(video_path)
        .args(["-vn", "-acodec", "pcm_s16le", "-ar", "16000", "-ac", "1", "-y"])
        .arg(&wav_path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    let run = async {
        match command.spawn() {
            Ok(mut child) => child.wait().await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        }
    };

    let outcome = tokio::time::timeout(EXTRACTION_TIMEOUT, run).await;

    let exited_ok = matches!(outcome, Ok(Ok(status)) if status.success());
    if !exited_ok {
        tracing::warn!(path = %video_path.display(), "audio extraction failed or timed out");
        let _ = tokio::fs::remove_file(&wav_path).await;
        return Ok(None);
    }

    match tokio::fs::metadata(&wav_path).await {
        Ok(metadata) if metadata.len() >= MIN_USABLE_AUDIO_BYTES => Ok(Some(wav_path)),
        _ => {
            tracing::info!(path = %video_path.display(), "no usable audio track");
            let _ = tokio::fs::remove_file(&wav_path).await;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_source_yields_no_audio_not_an_error() {
        let result = extract_audio_wav(Path::new("/nonexistent/clip.mp4")).await;
        assert!(matches!(result, Ok(None)));
    }
}
