//! Vision/LLM client: observe batch, combined short-chunk
//! analysis, and text-only policy evaluation.

use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImage,
    ChatCompletionRequestMessageContentPartText, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessage, ChatCompletionRequestUserMessageArgs,
    ChatCompletionRequestUserMessageContent, ChatCompletionRequestUserMessageContentPart,
    CreateChatCompletionRequestArgs, ImageDetail as OpenAiImageDetail, ImageUrlArgs,
    ResponseFormat, ResponseFormatJsonSchema,
};
use async_openai::Client;
use futures::future::join_all;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use compliance_schemas::keyframe::KeyframeData;
use compliance_schemas::observation::{FrameObservation, RawFrameObservation};
use compliance_schemas::policy::{MatchMode, Policy, PolicyRule, ReferenceImage};
use compliance_schemas::report::RawReport;
use compliance_schemas::transcript::TranscriptResult;
use compliance_schemas::verdict::{RawVerdict, SpeechVerdicts};

use crate::envelope::{now_seconds, CallEnvelope};
use crate::error::{Error, Result};
use crate::parts::{ImageDetail, Part, PartsBuilder};
use crate::rate_limit::RateLimitConfig;
use crate::retry::RetryConfig;
use crate::usage::price_table;

const SYSTEM_PROMPT: &str = "You are a factual compliance observer. Report only what is visibly \
present in each frame; never infer intent or speculate about anything outside the frame.";

pub struct VisionClientConfig {
    /// Multimodal model used for `analyze_frames` and the combined call.
    pub model: String,
    /// Small, cheap text model used for text-only evaluation calls
    /// (`evaluate_and_report`, `evaluate_speech`).
    pub evaluator_model: String,
    pub max_tokens: u32,
}

impl Default for VisionClientConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            evaluator_model: "gpt-4o-mini".to_string(),
            max_tokens: 2048,
        }
    }
}

const SPEECH_SYSTEM_PROMPT: &str = "You are an expert audio/speech compliance evaluator. You will \
receive a timestamped transcript and a set of speech compliance rules. Evaluate EACH rule, counting \
exact phrase occurrences when a rule requires it, and quote the transcript segments that support your \
reasoning. If the transcript is empty or too short to evaluate, mark rules as non-compliant with a note.";

pub struct VisionClient {
    client: Client<OpenAIConfig>,
    config: VisionClientConfig,
    envelope: CallEnvelope,
}

impl VisionClient {
    pub fn new(client: Client<OpenAIConfig>, config: VisionClientConfig) -> Self {
        Self::with_envelope(client, config, RetryConfig::default(), RateLimitConfig::default())
    }

    /// Same as [`VisionClient::new`] but with caller-supplied retry/rate
    /// knobs, used by the orchestrator to thread through its
    /// `compliance_core::Configuration`.
    pub fn with_envelope(
        client: Client<OpenAIConfig>,
        config: VisionClientConfig,
        retry: RetryConfig,
        rate_limit: RateLimitConfig,
    ) -> Self {
        Self { client, config, envelope: CallEnvelope::new(retry, rate_limit) }
    }

    /// Records token usage against the envelope's tracker once a response is
    /// in hand ("Usage accounting"). `model` must be a
    /// `price_table()` key; an unrecognized model (a caller typo in config)
    /// is priced at zero rather than panicking.
    fn record_usage(&self, model: &str, prompt_tokens: u32, completion_tokens: u32) {
        let price = price_table().get(model).copied().unwrap_or(crate::usage::ModelPrice::text(0.0, 0.0));
        let minute = (now_seconds() / 60.0) as u64;
        self.envelope.usage.record_call(minute, prompt_tokens as u64, completion_tokens as u64, price);
    }

    /// `analyze_frames`: batches keyframes by
    /// `B = max(1, 5 - |enabled_references|)` and submits batches
    /// concurrently. A batch whose response fails to parse degrades to
    /// `[VLM ERROR]` placeholders for that batch only; a non-retryable or
    /// retry-exhausted call failure propagates and fails the whole request.
    pub async fn analyze_frames(
        &self,
        keyframes: &[KeyframeData],
        policy: &Policy,
        cancellation: &CancellationToken,
    ) -> Result<Vec<FrameObservation>> {
        let references = policy.enabled_references();
        let batch_size = (5usize.saturating_sub(references.len())).max(1);

        let batches: Vec<&[KeyframeData]> = keyframes.chunks(batch_size).collect();
        let futures = batches
            .into_iter()
            .map(|batch| self.observe_batch(batch, policy, &references, cancellation));

        let mut observations = Vec::new();
        for result in join_all(futures).await {
            observations.extend(result?);
        }
        Ok(observations)
    }

    async fn observe_batch(
        &self,
        batch: &[KeyframeData],
        policy: &Policy,
        references: &[&ReferenceImage],
        cancellation: &CancellationToken,
    ) -> Result<Vec<FrameObservation>> {
        let mut parts = PartsBuilder::new().push_text(observe_preamble(policy, references));

        for reference in references {
            let label = match reference.match_mode {
                MatchMode::MustMatch => "AUTHORIZED",
                MatchMode::MustNotMatch => "UNAUTHORIZED",
            };
            parts = parts
                .push_text(format!("Reference ({label}): {}", reference.label))
                .push_image(
                    if reference.mime_type() == "image/png" { "image/png" } else { "image/jpeg" },
                    reference.image_bytes.clone(),
                    ImageDetail::Low,
                );
        }

        parts = parts.push_text("--- Frames to observe ---");
        for keyframe in batch {
            parts = parts
                .push_text(format!("[Frame at t={:.2}s]", keyframe.timestamp))
                .push_image("image/jpeg", keyframe.image_bytes.clone(), ImageDetail::Low);
        }

        let parts = parts.build();
        let model = self.config.model.clone();
        let max_tokens = self.config.max_tokens;

        let (content, usage) = self
            .envelope
            .call(cancellation, || call_chat_raw(&self.client, &model, max_tokens, &parts, None))
            .await?;
        self.record_usage(&model, usage.prompt_tokens, usage.completion_tokens);

        match parse_model_json::<Vec<RawFrameObservation>>(&content) {
            Ok(raw_observations) => Ok(zip_observations(batch, raw_observations)),
            Err(err) => {
                tracing::warn!(error = %err, "vision batch response malformed, degrading to placeholder observations");
                Ok(batch.iter().map(|keyframe| error_observation(keyframe, &err)).collect())
            }
        }
    }

    /// `analyze_and_evaluate_combined`: a single multimodal
    /// call returning the full Report schema directly. Used for short
    /// (<15s) visual-only chunks. A malformed response degrades to
    /// `RawReport::degraded`; a non-retryable or retry-exhausted call
    /// failure propagates.
    pub async fn analyze_and_evaluate_combined(
        &self,
        keyframes: &[KeyframeData],
        policy: &Policy,
        cancellation: &CancellationToken,
    ) -> Result<RawReport> {
        let references = policy.enabled_references();
        let detail = if references.is_empty() { ImageDetail::Low } else { ImageDetail::Auto };

        let mut parts = PartsBuilder::new().push_text(combined_preamble(policy, &references));
        for reference in &references {
            parts = parts.push_image(
                if reference.mime_type() == "image/png" { "image/png" } else { "image/jpeg" },
                reference.image_bytes.clone(),
                ImageDetail::Low,
            );
        }
        for keyframe in keyframes {
            parts = parts
                .push_text(format!("[Frame at t={:.2}s]", keyframe.timestamp))
                .push_image("image/jpeg", keyframe.image_bytes.clone(), detail);
        }
        let parts = parts.build();

        let model = self.config.model.clone();
        let max_tokens = self.config.max_tokens;
        let response_format = Some(json_schema_response_format::<RawReport>("compliance_report"));
        let (content, usage) = self
            .envelope
            .call(cancellation, || call_chat_raw(&self.client, &model, max_tokens, &parts, response_format.clone()))
            .await?;
        self.record_usage(&model, usage.prompt_tokens, usage.completion_tokens);

        Ok(parse_model_json::<RawReport>(&content).unwrap_or_else(|err| {
            tracing::warn!(error = %err, "combined vision response malformed, degrading to placeholder report");
            RawReport::degraded(&err.to_string())
        }))
    }

    /// `evaluate_and_report`: text-only policy evaluation over
    /// a previously-produced observation block. Same degrade/propagate
    /// split as [`VisionClient::analyze_and_evaluate_combined`].
    pub async fn evaluate_and_report(
        &self,
        observation_block: &str,
        policy: &Policy,
        transcript: Option<&str>,
        prior_context: Option<&str>,
        cancellation: &CancellationToken,
    ) -> Result<RawReport> {
        let mut prompt = String::new();
        prompt.push_str("Observations:\n");
        prompt.push_str(observation_block);
        prompt.push_str("\n\nPolicy:\n");
        prompt.push_str(&format_policy(policy));
        if let Some(transcript) = transcript {
            prompt.push_str("\n\nTranscript:\n");
            prompt.push_str(transcript);
        }
        if let Some(prior_context) = prior_context {
            prompt.push_str("\n\nPrior context:\n");
            prompt.push_str(prior_context);
        }

        let parts = PartsBuilder::new().push_text(prompt).build();
        let model = self.config.evaluator_model.clone();
        let max_tokens = self.config.max_tokens;

        let response_format = Some(json_schema_response_format::<RawReport>("compliance_report"));
        let (content, usage) = self
            .envelope
            .call(cancellation, || call_chat_raw(&self.client, &model, max_tokens, &parts, response_format.clone()))
            .await?;
        self.record_usage(&model, usage.prompt_tokens, usage.completion_tokens);

        Ok(parse_model_json::<RawReport>(&content).unwrap_or_else(|err| {
            tracing::warn!(error = %err, "evaluator response malformed, degrading to placeholder report");
            RawReport::degraded(&err.to_string())
        }))
    }

    /// `evaluate_speech`: text-only evaluation of speech
    /// rules against a transcript, grounded in the original's
    /// `speech_policy.py::evaluate_speech`. A missing or empty transcript is
    /// not a call at all — every rule comes back non-compliant with a fixed
    /// reason, matching the Python original's early return.
    pub async fn evaluate_speech(
        &self,
        transcript: &TranscriptResult,
        speech_rules: &[&PolicyRule],
        custom_prompt: &str,
        cancellation: &CancellationToken,
    ) -> Vec<RawVerdict> {
        if speech_rules.is_empty() {
            return Vec::new();
        }
        if transcript.is_empty() {
            tracing::warn!("no audio transcript available, marking all speech rules non-compliant");
            return speech_rules
                .iter()
                .map(|rule| no_transcript_verdict(rule))
                .collect();
        }

        let prompt = format!(
            "{}\n\n{}\n\nEvaluate each speech rule against this transcript. Be precise — count exact \
            phrase occurrences, quote relevant segments.",
            format_speech_rules(speech_rules, custom_prompt),
            format_transcript(transcript),
        );

        let parts = PartsBuilder::new().push_text(prompt).build();
        let model = self.config.evaluator_model.clone();
        let max_tokens = self.config.max_tokens;

        let response_format = Some(json_schema_response_format::<SpeechVerdicts>("compliance_report"));
        let call_result: Result<(String, TokenUsage)> = self
            .envelope
            .call(cancellation, || call_chat_raw(&self.client, &model, max_tokens, &parts, response_format.clone()))
            .await;

        match call_result {
            Ok((content, usage)) => {
                self.record_usage(&model, usage.prompt_tokens, usage.completion_tokens);
                match parse_model_json::<SpeechVerdicts>(&content) {
                    Ok(response) => response.verdicts,
                    Err(err) => {
                        tracing::error!(error = %err, "failed to parse speech evaluation response");
                        speech_rules.iter().map(|rule| failed_parse_verdict(rule)).collect()
                    }
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "speech evaluation call failed");
                speech_rules.iter().map(|rule| failed_parse_verdict(rule)).collect()
            }
        }
    }
}

fn no_transcript_verdict(rule: &PolicyRule) -> RawVerdict {
    RawVerdict {
        rule_type: rule.rule_type,
        rule_description: rule.description.clone(),
        compliant: false,
        severity: rule.severity,
        reason: "No audio transcript available. Cannot evaluate speech compliance.".to_string(),
        timestamp: None,
    }
}

fn failed_parse_verdict(rule: &PolicyRule) -> RawVerdict {
    RawVerdict {
        rule_type: rule.rule_type,
        rule_description: rule.description.clone(),
        compliant: false,
        severity: rule.severity,
        reason: "Failed to parse speech evaluation from LLM.".to_string(),
        timestamp: None,
    }
}

fn format_transcript(transcript: &TranscriptResult) -> String {
    let mut lines = vec![format!(
        "AUDIO TRANSCRIPT (language: {}, duration: {:.1}s):",
        transcript.language, transcript.duration
    )];
    if transcript.segments.is_empty() {
        lines.push(format!("  {}", transcript.full_text));
    } else {
        for segment in &transcript.segments {
            lines.push(format!("  [{:.1}s - {:.1}s] {}", segment.start, segment.end, segment.text.trim()));
        }
    }
    lines.join("\n")
}

fn format_speech_rules(rules: &[&PolicyRule], custom_prompt: &str) -> String {
    let mut lines = vec!["SPEECH COMPLIANCE RULES:".to_string()];
    for (i, rule) in rules.iter().enumerate() {
        lines.push(format!("  {}. [{:?}] {}", i + 1, rule.severity, rule.description));
    }
    if !custom_prompt.trim().is_empty() {
        lines.push(format!("\nADDITIONAL CONTEXT: {custom_prompt}"));
    }
    lines.join("\n")
}

fn observe_preamble(policy: &Policy, references: &[&ReferenceImage]) -> String {
    let mut text = String::from("Describe each frame factually. For every visible person, report \
        a stable person_id, their appearance, and any relevant details.\n\nPolicy rules:\n");
    for rule in policy.visual_rules() {
        text.push_str(&format_rule_line(rule));
        text.push('\n');
    }
    if !references.is_empty() {
        text.push_str("\nFor each reference image below, state whether it is present and matches \
            its authorization label.\n");
    }
    text
}

fn combined_preamble(policy: &Policy, references: &[&ReferenceImage]) -> String {
    let mut text = String::from(
        "Analyze the following frames against this compliance policy and return a full report.\n\nPolicy rules:\n",
    );
    for rule in policy.rules.iter() {
        text.push_str(&format_rule_line(rule));
        text.push('\n');
    }
    if !policy.custom_prompt.trim().is_empty() {
        text.push_str("\nAdditional instructions:\n");
        text.push_str(&policy.custom_prompt);
        text.push('\n');
    }
    if !references.is_empty() {
        text.push_str("\nReference images follow; each is labeled AUTHORIZED or UNAUTHORIZED.\n");
    }
    text
}

fn format_policy(policy: &Policy) -> String {
    policy.rules.iter().map(format_rule_line).collect::<Vec<_>>().join("\n")
}

fn format_rule_line(rule: &PolicyRule) -> String {
    format!(
        "- [{:?}/{:?}] {} (severity {:?}, frequency {:?})",
        rule.rule_type, rule.mode, rule.description, rule.severity, rule.frequency
    )
}

fn zip_observations(
    batch: &[KeyframeData],
    raw_observations: Vec<RawFrameObservation>,
) -> Vec<FrameObservation> {
    if raw_observations.len() != batch.len() {
        tracing::warn!(
            expected = batch.len(),
            got = raw_observations.len(),
            "vision response length mismatch, falling back to raw text per frame"
        );
    }

    batch
        .iter()
        .enumerate()
        .map(|(i, keyframe)| match raw_observations.get(i) {
            Some(raw) => FrameObservation {
                timestamp: keyframe.timestamp,
                description: raw.description.clone(),
                trigger: keyframe.trigger,
                change_score: keyframe.change_score,
                image_bytes: keyframe.image_bytes.clone(),
                people: raw.people.clone(),
            },
            None => FrameObservation {
                timestamp: keyframe.timestamp,
                description: "model returned fewer observations than frames submitted".to_string(),
                trigger: keyframe.trigger,
                change_score: keyframe.change_score,
                image_bytes: keyframe.image_bytes.clone(),
                people: Vec::new(),
            },
        })
        .collect()
}

fn error_observation(keyframe: &KeyframeData, err: &Error) -> FrameObservation {
    FrameObservation {
        timestamp: keyframe.timestamp,
        description: format!("[VLM ERROR] {err}"),
        trigger: keyframe.trigger,
        change_score: keyframe.change_score,
        image_bytes: keyframe.image_bytes.clone(),
        people: Vec::new(),
    }
}

fn content_parts_from(parts: &[Part]) -> Vec<ChatCompletionRequestUserMessageContentPart> {
    parts
        .iter()
        .map(|part| match part {
            Part::Text(text) => ChatCompletionRequestUserMessageContentPart::Text(
                ChatCompletionRequestMessageContentPartText { text: text.clone() },
            ),
            Part::Image { mime, bytes, detail } => {
                let url = Part::data_url(mime, bytes);
                let detail = match detail {
                    ImageDetail::Low => OpenAiImageDetail::Low,
                    ImageDetail::Auto => OpenAiImageDetail::Auto,
                };
                ChatCompletionRequestUserMessageContentPart::ImageUrl(
                    ChatCompletionRequestMessageContentPartImage {
                        image_url: ImageUrlArgs::default().url(url).detail(detail).build().expect(
                            "image url parts are always well-formed",
                        ),
                    },
                )
            }
            Part::VideoClip { mime, bytes } => {
                // async-openai has no first-class video content part; the
                // remote GPU client speaks raw HTTP instead (see
                // `remote_gpu.rs`). Frames that reach here as clips are
                // rendered back down to a descriptive text marker.
                let _ = (mime, bytes);
                ChatCompletionRequestUserMessageContentPart::Text(
                    ChatCompletionRequestMessageContentPartText {
                        text: "[video clip omitted: unsupported by this provider]".to_string(),
                    },
                )
            }
        })
        .collect()
}

/// Token counts off a chat completion response, used to feed
/// [`VisionClient::record_usage`]. `async-openai`'s `usage` field is
/// optional depending on provider/endpoint; a missing field costs nothing
/// rather than failing the call.
#[derive(Clone, Copy, Debug, Default)]
struct TokenUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

fn json_schema_response_format<T: JsonSchema>(name: &str) -> ResponseFormat {
    let schema = schemars::schema_for!(T);
    ResponseFormat::JsonSchema {
        json_schema: ResponseFormatJsonSchema {
            description: None,
            name: name.to_string(),
            schema: Some(serde_json::to_value(schema.schema).unwrap_or_default()),
            strict: Some(true),
        },
    }
}

/// Sends one chat-completion call and returns the raw response text
/// unparsed. JSON parsing is deliberately kept out of this (retried)
/// function: a malformed response is a content problem, not a transport
/// one, and must not be classified as retryable/non-retryable alongside
/// network and API failures.
async fn call_chat_raw(
    client: &Client<OpenAIConfig>,
    model: &str,
    max_tokens: u32,
    parts: &[Part],
    response_format: Option<ResponseFormat>,
) -> std::result::Result<(String, TokenUsage), String> {
    let user_message: ChatCompletionRequestUserMessage = ChatCompletionRequestUserMessageArgs::default()
        .content(ChatCompletionRequestUserMessageContent::Array(content_parts_from(parts)))
        .build()
        .map_err(|e| e.to_string())?;

    let mut request_builder = CreateChatCompletionRequestArgs::default();
    request_builder.model(model).max_tokens(max_tokens);
    if let Some(format) = response_format {
        request_builder.response_format(format);
    }
    let request = request_builder
        .messages(vec![
            ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(SYSTEM_PROMPT)
                    .build()
                    .map_err(|e| e.to_string())?,
            ),
            ChatCompletionRequestMessage::User(user_message),
        ])
        .build()
        .map_err(|e| e.to_string())?;

    let response = client.chat().create(request).await.map_err(|e| e.to_string())?;
    let usage = token_usage_of(&response);
    let content = response
        .choices
        .first()
        .and_then(|choice| choice.message.content.clone())
        .ok_or_else(|| "empty response from model".to_string())?;

    Ok((content, usage))
}

/// Parses model output into `T`, tagging failure as
/// [`Error::MalformedResponse`] so callers can degrade on it specifically
/// rather than treating it like a transport/API failure.
fn parse_model_json<T: DeserializeOwned>(content: &str) -> Result<T> {
    serde_json::from_str(content).map_err(|e| Error::MalformedResponse(format!("{e} (raw: {content})")))
}

fn token_usage_of(response: &async_openai::types::CreateChatCompletionResponse) -> TokenUsage {
    response
        .usage
        .as_ref()
        .map(|u| TokenUsage { prompt_tokens: u.prompt_tokens, completion_tokens: u.completion_tokens })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use compliance_schemas::keyframe::Trigger;

    fn keyframe(timestamp: f64, trigger: Trigger) -> KeyframeData {
        KeyframeData { timestamp, frame_number: 0, change_score: 0.1, trigger, image_bytes: vec![1, 2, 3] }
    }

    #[test]
    fn zip_observations_falls_back_on_length_mismatch() {
        let batch = vec![keyframe(0.0, Trigger::First), keyframe(1.0, Trigger::Change)];
        let raw = vec![RawFrameObservation {
            timestamp: 0.0,
            description: "a person at a desk".to_string(),
            people: vec![],
        }];
        let observations = zip_observations(&batch, raw);
        assert_eq!(observations.len(), 2);
        assert_eq!(observations[0].description, "a person at a desk");
        assert!(observations[1].description.contains("fewer observations"));
    }

    #[test]
    fn error_observation_is_tagged() {
        let kf = keyframe(2.0, Trigger::Sample);
        let observation = error_observation(&kf, &Error::NonRetryable("boom".to_string()));
        assert!(observation.description.starts_with("[VLM ERROR]"));
        assert_eq!(observation.timestamp, 2.0);
    }

    #[test]
    fn parse_model_json_tags_invalid_json_as_malformed() {
        let err = parse_model_json::<RawFrameObservation>("not json").unwrap_err();
        assert!(matches!(err, Error::MalformedResponse(_)));
    }

    #[test]
    fn parse_model_json_succeeds_on_well_formed_payload() {
        let raw: RawFrameObservation =
            parse_model_json(r#"{"timestamp":1.0,"description":"ok","people":[]}"#).unwrap();
        assert_eq!(raw.description, "ok");
    }
}
