//! Container fallback: when the primary decoder can't read a single frame
//! out of a web-container upload (webm, mkv, …), shell out to `ffmpeg` once
//! to produce an mp4 copy and retry.
//! The Change Detector itself stays container-agnostic; this is purely an
//! orchestrator-level escape hatch, in the same spirit as the Speech
//! client's `extract_audio_wav` external-transcoder invocation.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

/// Web-container extensions common enough in browser uploads that the
/// primary (ffmpeg-next) decoder sometimes rejects them outright depending
/// on how they were muxed.
const WEB_CONTAINER_EXTENSIONS: &[&str] = &["webm", "mkv", "ogv"];

/// Generous relative to the 60s speech-extraction wall; a full remux of an
/// upload can legitimately take longer than pulling just the audio track.
const TRANSCODE_TIMEOUT: Duration = Duration::from_secs(120);

pub fn is_web_container(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| WEB_CONTAINER_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Re-muxes/transcodes `source` into an mp4 copy at a temp path. Returns
/// `None` (not an error) if ffmpeg fails or times out — the caller treats
/// that the same as a permanent decode failure.
pub async fn transcode_to_mp4(source: &Path) -> Option<PathBuf> {
    let output = std::env::temp_dir().join(format!(
        "compliance-transcode-{}.mp4",
        uuid::Uuid::new_v4().simple()
    ));

    let mut command = Command::new("ffmpeg");
    command
        .arg("-i")
        .arg(source)
        .args(["-c:v", "libx264", "-c:a", "aac", "-y"])
        .arg(&output)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    let run = async {
        match command.spawn() {
            Ok(mut child) => child.wait().await.map(|status| status.success()).unwrap_or(false),
            Err(_) => false,
        }
    };

    let succeeded = tokio::time::timeout(TRANSCODE_TIMEOUT, run).await.unwrap_or(false);
    if !succeeded {
        tracing::warn!(path = %source.display(), "container fallback transcode failed or timed out");
        let _ = tokio::fs::remove_file(&output).await;
        return None;
    }

    tracing::info!(path = %source.display(), output = %output.display(), "transcoded to mp4 for fallback decode");
    Some(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn recognizes_web_container_extensions() {
        assert!(is_web_container(&PathBuf::from("clip.webm")));
        assert!(is_web_container(&PathBuf::from("clip.WEBM")));
        assert!(!is_web_container(&PathBuf::from("clip.mp4")));
    }

    #[tokio::test]
    async fn missing_source_does_not_panic() {
        let result = transcode_to_mp4(Path::new("/nonexistent/clip.webm")).await;
        assert!(result.is_none());
    }
}
