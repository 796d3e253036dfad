//! Pipeline Orchestrator: dispatches a request to one of three
//! paths by shape of input, fanning vision/speech subtasks out as
//! cooperative tasks and handing their results to the Verdict Reconciler.
//!
//! One struct owns every downstream client and a single `Configuration`,
//! with `tracing::instrument`ed entry points. Fan-out uses `tokio::join!`
//! rather than a generic executor abstraction — direct futures composition
//! over a task-graph DSL.

use std::path::Path;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::Client;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use compliance_checklist::{ChecklistTracker, Snapshot};
use compliance_schemas::checklist::ChecklistItem;
use compliance_clients::rate_limit::RateLimitConfig as ClientRateLimitConfig;
use compliance_clients::retry::RetryConfig as ClientRetryConfig;
use compliance_clients::{
    RemoteGpuClient, RemoteGpuConfig, SpeechClient, SpeechClientConfig, VisionClient, VisionClientConfig,
};
use compliance_detector::capture::CaptureConfig;
use compliance_detector::file_pipeline::{detect_significant_changes, sample_at_intervals, FilePipelineConfig};
use compliance_detector::video::{generate_video_id, read_video_metadata, resize_and_encode_jpeg};
use compliance_reconciler::{apply_checklist_filter, merge_speech, reconcile_visual, synthetic_report};
use compliance_schemas::keyframe::{KeyframeData, Trigger};
use compliance_schemas::observation::{FrameObservation, PersonDetail};
use compliance_schemas::person::RawPersonSummary;
use compliance_schemas::policy::{Policy, PolicyRule};
use compliance_schemas::report::Report;
use compliance_schemas::transcript::TranscriptResult;

use crate::config::{Configuration, RateLimitConfig as CoreRateLimitConfig, RetryConfig as CoreRetryConfig, SHORT_VIDEO_THRESHOLD_SECS};
use crate::error::{Error, Result};
use crate::request::{FrameAnalyzeRequest, Provider};
use crate::transcode;

/// `min(N_max, total)` evenly spaced indices; the original's short-chunk
/// sampler used the same bound.
const PATH_B_MAX_SAMPLES: u64 = 10;

fn to_client_retry(core: &CoreRetryConfig) -> ClientRetryConfig {
    // The client envelope always applies jitter; `core.jitter`
    // exists for forward compatibility with a future non-jittered mode but
    // has no effect yet.
    ClientRetryConfig {
        base_delay: Duration::from_secs_f64(core.base_delay_secs),
        multiplier: 2.0,
        max_delay: Duration::from_secs_f64(core.cap_delay_secs),
        max_retries: core.max_retries,
    }
}

fn to_client_rate_limit(core: &CoreRateLimitConfig) -> ClientRateLimitConfig {
    ClientRateLimitConfig { per_minute: core.max_per_minute, per_hour: core.max_per_hour }
}

fn detector_file_config(config: &Configuration) -> FilePipelineConfig {
    FilePipelineConfig {
        sample_interval: config.detector.sample_interval,
        capture: CaptureConfig {
            change_threshold: config.detector.change_threshold,
            min_change_interval: config.detector.min_change_interval,
            max_gap: config.detector.max_gap,
            jpeg_quality: config.detector.file_jpeg_quality,
            max_width: config.detector.file_max_width,
        },
    }
}

/// Owns every downstream client and the checklist tracker for the lifetime
/// of the process ("the checklist tracker is the only long-lived
/// shared mutable state").
pub struct Orchestrator {
    config: Configuration,
    vision: VisionClient,
    speech: SpeechClient,
    remote_gpu: RemoteGpuClient,
    checklist: ChecklistTracker,
}

impl Orchestrator {
    pub fn new(config: Configuration, openai_client: Client<OpenAIConfig>) -> Self {
        let vision = VisionClient::with_envelope(
            openai_client.clone(),
            VisionClientConfig {
                model: config.vision_model.clone(),
                evaluator_model: config.evaluator_model.clone(),
                max_tokens: 2048,
            },
            to_client_retry(&config.retry),
            to_client_rate_limit(&config.vision_rate_limit),
        );
        let speech = SpeechClient::with_envelope(
            openai_client,
            SpeechClientConfig { model: config.speech_model.clone() },
            to_client_retry(&config.retry),
            to_client_rate_limit(&config.speech_rate_limit),
        );
        let remote_gpu = RemoteGpuClient::with_envelope(
            RemoteGpuConfig {
                proxy_url: config.remote_gpu.proxy_url.clone(),
                model_id: config.remote_gpu.model_id.clone(),
                timeout: config.remote_gpu.timeout(),
            },
            to_client_retry(&config.retry),
            to_client_rate_limit(&config.remote_gpu_rate_limit),
        );
        let checklist = ChecklistTracker::new(config.checklist_state_file.clone());

        Self { config, vision, speech, remote_gpu, checklist }
    }

    /// `analyze_video`: picks Path B
    /// for a short, visual-only request and Path C for everything else.
    #[tracing::instrument(skip(self, policy, cancellation), fields(path = %path.display()))]
    pub async fn analyze_video(
        &self,
        path: &Path,
        policy: &Policy,
        cancellation: &CancellationToken,
    ) -> Result<Report> {
        self.validate_policy(policy)?;

        let path_buf = path.to_path_buf();
        let video_id = tokio::task::spawn_blocking(move || generate_video_id(&path_buf))
            .await
            .map_err(|_| Error::DecodeFailure("video id thread panicked".into()))?
            .map_err(|e| Error::DecodeFailure(e.to_string()))?;

        let path_buf = path.to_path_buf();
        let metadata = tokio::task::spawn_blocking(move || read_video_metadata(&path_buf))
            .await
            .map_err(|_| Error::DecodeFailure("metadata read thread panicked".into()))??;

        let visual_only =
            !policy.visual_rules().is_empty() && policy.speech_rules().is_empty() && !policy.include_audio;

        if metadata.duration < SHORT_VIDEO_THRESHOLD_SECS && visual_only {
            self.path_b(path, policy, video_id, metadata.duration).await
        } else {
            self.path_c(path, policy, video_id, metadata.duration, cancellation).await
        }
    }

    /// Path A — single frame / webcam burst.
    #[tracing::instrument(skip(self, request, cancellation))]
    pub async fn analyze_frame(
        &self,
        request: FrameAnalyzeRequest,
        cancellation: &CancellationToken,
    ) -> Result<Report> {
        self.validate_policy(&request.policy)?;
        if request.frames.is_empty() {
            return Err(Error::BadRequest("at least one frame is required".into()));
        }

        let keyframes = self.encode_webcam_keyframes(&request.frames)?;

        let raw_report = match request.provider {
            Provider::Default => {
                self.vision
                    .analyze_and_evaluate_combined(&keyframes, &request.policy, cancellation)
                    .await?
            }
            Provider::RemoteGpu => {
                self.remote_gpu.analyze_batch(&keyframes, &request.policy, cancellation).await
            }
        };

        let observations = synthetic_observations(&keyframes, &raw_report.person_summaries);
        let mut report = reconcile_visual(
            "frame".to_string(),
            raw_report,
            &observations,
            &request.policy,
            &self.checklist,
            keyframes.len(),
            0.0,
        );

        let speech_rules = request.policy.speech_rules();
        if !speech_rules.is_empty() {
            if let Some(accumulated) =
                request.accumulated_transcript.as_deref().filter(|s| !s.trim().is_empty())
            {
                let transcript = TranscriptResult {
                    full_text: accumulated.to_string(),
                    segments: Vec::new(),
                    language: "unknown".to_string(),
                    duration: 0.0,
                };
                let speech_raw = self
                    .vision
                    .evaluate_speech(&transcript, &speech_rules, &request.policy.custom_prompt, cancellation)
                    .await;
                let speech_verdicts =
                    apply_checklist_filter(speech_raw, &observations, &request.policy, &self.checklist, Utc::now());
                report = merge_speech(report, speech_verdicts, Some(&transcript));
            }
        }

        Ok(report)
    }

    /// Path B — short (<15s), visual-only video.
    async fn path_b(&self, path: &Path, policy: &Policy, video_id: String, duration: f64) -> Result<Report> {
        let path_buf = path.to_path_buf();
        let jpeg_quality = self.config.detector.file_jpeg_quality;
        let max_width = self.config.detector.file_max_width;
        let keyframes = tokio::task::spawn_blocking(move || {
            sample_at_intervals(&path_buf, PATH_B_MAX_SAMPLES, jpeg_quality, max_width)
        })
        .await
        .map_err(|_| Error::DecodeFailure("interval sampler thread panicked".into()))??;

        if keyframes.is_empty() {
            return Err(Error::NoKeyframes);
        }

        let cancellation = CancellationToken::new();
        let raw_report = self.vision.analyze_and_evaluate_combined(&keyframes, policy, &cancellation).await?;
        let observations = synthetic_observations(&keyframes, &raw_report.person_summaries);

        Ok(reconcile_visual(video_id, raw_report, &observations, policy, &self.checklist, keyframes.len(), duration))
    }

    /// Path C — long/general video with parallel fan-out.
    async fn path_c(
        &self,
        path: &Path,
        policy: &Policy,
        video_id: String,
        duration: f64,
        cancellation: &CancellationToken,
    ) -> Result<Report> {
        // Step 1: change detector, with the container fallback.
        let keyframes = self.detect_keyframes_with_fallback(path).await?;
        if keyframes.is_empty() {
            return Err(Error::NoKeyframes);
        }
        self.persist_keyframes(&video_id, &keyframes).await;

        // Step 2: split rules.
        let visual_rules = policy.visual_rules();
        let speech_rules = policy.speech_rules();
        let has_visual = !visual_rules.is_empty();
        let has_speech = !speech_rules.is_empty() || policy.include_audio;

        // Step 3: parallel fan-out. A malformed-response batch inside
        // `analyze_frames` degrades silently to `[VLM ERROR]` placeholders;
        // a non-retryable or retry-exhausted Vision failure propagates as
        // `Err` and fails the whole request. Speech failures are already
        // non-fatal inside `transcribe_video` (it logs and returns
        // `Ok(None)`), proceeding transcript-less.
        let vision_fut = async {
            if has_visual {
                Some(self.vision.analyze_frames(&keyframes, policy, cancellation).await)
            } else {
                None
            }
        };
        let speech_fut = async {
            if has_speech {
                match self.speech.transcribe_video(path, cancellation).await {
                    Ok(transcript) => transcript,
                    Err(err) => {
                        tracing::warn!(error = %err, "speech transcription failed, proceeding transcript-less");
                        None
                    }
                }
            } else {
                None
            }
        };
        let (observations_result_opt, transcript) = tokio::join!(vision_fut, speech_fut);

        if cancellation.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut observations = match observations_result_opt {
            Some(result) => result?,
            None => Vec::new(),
        };
        observations.sort_by(|a, b| a.timestamp.partial_cmp(&b.timestamp).unwrap_or(std::cmp::Ordering::Equal));

        let combined_text = match &transcript {
            Some(t) => t.combined_with_prior(&policy.accumulated_transcript),
            None => policy.accumulated_transcript.clone(),
        };
        let combined_transcript = TranscriptResult {
            full_text: combined_text,
            segments: transcript.as_ref().map(|t| t.segments.clone()).unwrap_or_default(),
            language: transcript.as_ref().map(|t| t.language.clone()).unwrap_or_else(|| "unknown".to_string()),
            duration: transcript.as_ref().map(|t| t.duration).unwrap_or(0.0),
        };

        // Step 4: second parallel fan-out, visual evaluation + speech
        // evaluation. Same degrade/propagate split as step 3 applies to
        // the visual evaluation call.
        let observation_block = format_observation_block(&observations);
        let prior_context =
            (!policy.prior_context.trim().is_empty()).then(|| policy.prior_context.as_str());
        let transcript_block =
            (!combined_transcript.full_text.trim().is_empty()).then(|| combined_transcript.full_text.as_str());

        let visual_fut = async {
            if has_visual {
                Some(
                    self.vision
                        .evaluate_and_report(&observation_block, policy, transcript_block, prior_context, cancellation)
                        .await,
                )
            } else {
                None
            }
        };
        let speech_eval_fut = async {
            if !speech_rules.is_empty() && !combined_transcript.is_empty() {
                Some(
                    self.vision
                        .evaluate_speech(&combined_transcript, &speech_rules, &policy.custom_prompt, cancellation)
                        .await,
                )
            } else {
                None
            }
        };
        let (visual_raw_opt, speech_verdicts_raw_opt) = tokio::join!(visual_fut, speech_eval_fut);

        if cancellation.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // Step 5: merge, assign thumbnails, recompute checklist_fulfilled.
        let mut report = match visual_raw_opt {
            Some(result) => reconcile_visual(
                video_id,
                result?,
                &observations,
                policy,
                &self.checklist,
                keyframes.len(),
                duration,
            ),
            None => synthetic_report(video_id, duration),
        };

        if let Some(speech_raw) = speech_verdicts_raw_opt {
            let speech_verdicts = apply_checklist_filter(speech_raw, &observations, policy, &self.checklist, Utc::now());
            report = merge_speech(report, speech_verdicts, Some(&combined_transcript));
        }

        Ok(report)
    }

    /// Runs the change detector off the async executor (it blocks its
    /// calling thread on the reader/comparator loop) and, on an empty
    /// result from a web-container source, retries once against a
    /// transcoded mp4 copy ("Container fallback").
    async fn detect_keyframes_with_fallback(&self, path: &Path) -> Result<Vec<KeyframeData>> {
        let config = detector_file_config(&self.config);
        let keyframes = run_detector(path, config.clone()).await?;
        if !keyframes.is_empty() || !transcode::is_web_container(path) {
            return Ok(keyframes);
        }

        tracing::info!(path = %path.display(), "primary decode yielded no frames, attempting container fallback");
        let Some(transcoded) = transcode::transcode_to_mp4(path).await else {
            return Ok(Vec::new());
        };

        let result = run_detector(&transcoded, config).await;
        let _ = tokio::fs::remove_file(&transcoded).await;
        result
    }

    /// Writes each keyframe's JPEG under `keyframe_dir/<video_id>/`. The
    /// detector itself stays storage-agnostic; a write failure is logged
    /// and the rest proceed undisturbed, matching the detector's own "a
    /// write error ... does not invalidate later events" semantics.
    async fn persist_keyframes(&self, video_id: &str, keyframes: &[KeyframeData]) {
        let dir = self.config.keyframe_dir.join(video_id);
        if let Err(err) = tokio::fs::create_dir_all(&dir).await {
            tracing::warn!(error = %err, dir = %dir.display(), "failed to create keyframe directory");
            return;
        }

        for keyframe in keyframes {
            let prefix = match keyframe.trigger {
                Trigger::Sample => "sample",
                _ => "change",
            };
            let path = dir.join(format!("{prefix}_{:04}.jpg", keyframe.frame_number));
            if let Err(err) = tokio::fs::write(&path, &keyframe.image_bytes).await {
                tracing::warn!(error = %err, path = %path.display(), "failed to write keyframe");
            }
        }
    }

    fn encode_webcam_keyframes(&self, frames: &[Vec<u8>]) -> Result<Vec<KeyframeData>> {
        let quality = self.config.detector.webcam_jpeg_quality;
        let max_width = self.config.detector.webcam_max_width;

        frames
            .iter()
            .enumerate()
            .map(|(i, jpeg)| {
                let decoded = image::load_from_memory(jpeg)
                    .map_err(|e| Error::DecodeFailure(format!("invalid frame jpeg: {e}")))?
                    .to_rgb8();
                let image_bytes = resize_and_encode_jpeg(&decoded, max_width, quality)?;
                Ok(KeyframeData {
                    timestamp: 0.0,
                    frame_number: i as u64,
                    change_score: 1.0,
                    trigger: Trigger::WebcamFrame,
                    image_bytes,
                })
            })
            .collect()
    }

    fn validate_policy(&self, policy: &Policy) -> Result<()> {
        if policy.is_empty_request() {
            return Err(Error::BadRequest("policy has no rules and no custom prompt".into()));
        }
        for rule in &policy.rules {
            rule.validate().map_err(Error::BadRequest)?;
        }
        Ok(())
    }

    /// Wipes the checklist tracker, exposed for an operator-triggered
    /// session reset.
    pub fn reset_checklist(&self) {
        self.checklist.reset();
    }

    pub fn export_checklist(&self) -> Snapshot {
        self.checklist.export()
    }

    pub fn import_checklist(&self, snapshot: Snapshot) {
        self.checklist.import(snapshot);
    }

    /// `checklist(person_id, rules, now)`, exposed directly so a
    /// caller can inspect state without running a full analysis.
    pub fn checklist_for(&self, person_id: &str, rules: &[PolicyRule]) -> Vec<ChecklistItem> {
        self.checklist.checklist(person_id, rules, Utc::now())
    }
}

async fn run_detector(path: &Path, config: FilePipelineConfig) -> Result<Vec<KeyframeData>> {
    let path_buf = path.to_path_buf();
    tokio::task::spawn_blocking(move || detect_significant_changes(&path_buf, &config))
        .await
        .map_err(|_| Error::DecodeFailure("detector thread panicked".into()))?
        .map_err(Error::from)
}

/// Path A/B have no separate "observe batch" step — the combined call
/// returns a full Report directly — so there is no model-produced
/// per-frame observation to hand the reconciler. We synthesize one
/// [`FrameObservation`] per keyframe carrying the combined call's person
/// summaries, which is enough for checklist person-matching and thumbnail
/// assignment even though no per-frame description exists.
fn synthetic_observations(keyframes: &[KeyframeData], person_summaries: &[RawPersonSummary]) -> Vec<FrameObservation> {
    let people: Vec<PersonDetail> = person_summaries
        .iter()
        .map(|p| PersonDetail {
            person_id: p.person_id.clone(),
            appearance: p.appearance.clone(),
            details: String::new(),
        })
        .collect();

    keyframes
        .iter()
        .map(|kf| FrameObservation {
            timestamp: kf.timestamp,
            description: String::new(),
            trigger: kf.trigger,
            change_score: kf.change_score,
            image_bytes: kf.image_bytes.clone(),
            people: people.clone(),
        })
        .collect()
}

fn format_observation_block(observations: &[FrameObservation]) -> String {
    observations
        .iter()
        .map(|obs| {
            let people = obs
                .people
                .iter()
                .map(|p| format!("{} ({})", p.person_id, p.appearance))
                .collect::<Vec<_>>()
                .join(", ");
            format!("[t={:.2}s] {} | people: {}", obs.timestamp, obs.description, people)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_observations_carries_combined_people_onto_every_keyframe() {
        let keyframes = vec![KeyframeData {
            timestamp: 1.0,
            frame_number: 0,
            change_score: 1.0,
            trigger: Trigger::WebcamFrame,
            image_bytes: vec![1, 2, 3],
        }];
        let people = vec![RawPersonSummary {
            person_id: "Person_A".into(),
            appearance: "blue jacket".into(),
            first_seen: 0.0,
            last_seen: 0.0,
            frames_seen: 1,
            compliant: true,
            violations: vec![],
        }];
        let observations = synthetic_observations(&keyframes, &people);
        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].people[0].person_id, "Person_A");
    }

    #[test]
    fn format_observation_block_includes_timestamp_and_people() {
        let observations = vec![FrameObservation {
            timestamp: 2.5,
            description: "a person at a desk".into(),
            trigger: Trigger::Sample,
            change_score: 0.2,
            image_bytes: vec![],
            people: vec![PersonDetail { person_id: "Person_A".into(), appearance: "blue jacket".into(), details: String::new() }],
        }];
        let block = format_observation_block(&observations);
        assert!(block.contains("t=2.50s"));
        assert!(block.contains("Person_A"));
    }

    fn test_orchestrator(keyframe_dir: impl Into<std::path::PathBuf>) -> Orchestrator {
        let config = Configuration::default().with_keyframe_dir(keyframe_dir);
        Orchestrator::new(config, Client::new())
    }

    #[test]
    fn validate_policy_rejects_empty_request() {
        let orchestrator = test_orchestrator(std::env::temp_dir());
        let err = orchestrator.validate_policy(&Policy::default()).unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[tokio::test]
    async fn persist_keyframes_writes_one_file_per_keyframe() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path());
        let keyframes = vec![
            KeyframeData { timestamp: 0.0, frame_number: 0, change_score: 0.0, trigger: Trigger::First, image_bytes: vec![1] },
            KeyframeData { timestamp: 1.0, frame_number: 5, change_score: 0.3, trigger: Trigger::Sample, image_bytes: vec![2] },
        ];

        orchestrator.persist_keyframes("abc123", &keyframes).await;

        let video_dir = dir.path().join("abc123");
        assert!(video_dir.join("change_0000.jpg").exists());
        assert!(video_dir.join("sample_0005.jpg").exists());
    }

    #[test]
    fn encode_webcam_keyframes_rejects_invalid_jpeg() {
        let orchestrator = test_orchestrator(std::env::temp_dir());
        let result = orchestrator.encode_webcam_keyframes(&[vec![0, 1, 2, 3]]);
        assert!(matches!(result, Err(Error::DecodeFailure(_))));
    }
}
