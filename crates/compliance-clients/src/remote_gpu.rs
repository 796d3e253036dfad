//! Remote GPU analyzer client: packages a batch of JPEGs into
//! a 4-fps mp4, POSTs an OpenAI-compatible chat payload carrying a single
//! `video_url` content part, and parses the body's JSON *before* consulting
//! HTTP status — the proxy returns `{"error": ...}` bodies on 2xx when the
//! upstream vision model is down.

use std::time::Duration;

use base64::Engine;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use compliance_detector::mux_jpegs_to_mp4;
use compliance_schemas::keyframe::KeyframeData;
use compliance_schemas::policy::{Policy, PolicyRule, RuleType, Severity};
use compliance_schemas::person::RawPersonSummary;
use compliance_schemas::report::RawReport;
use compliance_schemas::verdict::RawVerdict;

use crate::envelope::{now_seconds, CallEnvelope};
use crate::error::{Error, Result};
use crate::rate_limit::RateLimitConfig;
use crate::retry::RetryConfig;
use crate::usage::ModelPrice;

/// Fixed frame rate for the mp4 container the proxy expects.
const MUX_FPS: u32 = 4;
/// Frames per submitted batch ("each batch of 4 frames").
pub const BATCH_SIZE: usize = 4;
/// Hard cap on concurrent submissions regardless of the caller's request:
/// at most M, capped at 5.
const MAX_CONCURRENT_BATCHES: usize = 5;

#[derive(Clone, Debug)]
pub struct RemoteGpuConfig {
    pub proxy_url: String,
    pub model_id: String,
    pub timeout: Duration,
}

impl Default for RemoteGpuConfig {
    fn default() -> Self {
        Self {
            proxy_url: "http://localhost:8100/v1/chat/completions".to_string(),
            model_id: "cosmos-nemotron".to_string(),
            timeout: Duration::from_secs(300),
        }
    }
}

pub struct RemoteGpuClient {
    http: reqwest::Client,
    config: RemoteGpuConfig,
    envelope: CallEnvelope,
}

impl RemoteGpuClient {
    pub fn new(config: RemoteGpuConfig) -> Self {
        Self::with_envelope(config, RetryConfig::default(), RateLimitConfig::default())
    }

    pub fn with_envelope(config: RemoteGpuConfig, retry: RetryConfig, rate_limit: RateLimitConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { http, config, envelope: CallEnvelope::new(retry, rate_limit) }
    }

    /// One batch of keyframes → one remote-GPU call → one [`RawReport`].
    /// Never fails the caller: upstream/transport errors degrade to a
    /// non-compliant report whose summary carries the specific reason
    /// (unreachable vs model-down vs timeout).
    pub async fn analyze_batch(
        &self,
        frames: &[KeyframeData],
        policy: &Policy,
        cancellation: &CancellationToken,
    ) -> RawReport {
        let jpegs: Vec<Vec<u8>> = frames.iter().map(|f| f.image_bytes.clone()).collect();

        let mp4 = match mux_jpegs_to_mp4(&jpegs, MUX_FPS) {
            Ok(bytes) => bytes,
            Err(err) => return degraded_report(&format!("failed to package frames for remote analysis: {err}")),
        };

        let payload = build_request_payload(&mp4, policy, &self.config.model_id);
        let result: Result<Value> = self
            .envelope
            .call(cancellation, || self.post_and_parse(&payload))
            .await;

        match result {
            Ok(body) => {
                // The proxy carries no per-token price contract;
                // a successful call still counts toward request-volume
                // introspection at zero token cost.
                let minute = (now_seconds() / 60.0) as u64;
                self.envelope.usage.record_call(minute, 0, 0, ModelPrice::text(0.0, 0.0));
                parse_remote_gpu_response(&body, policy)
            }
            Err(err) => degraded_report(&describe_transport_failure(&err)),
        }
    }

    /// Parallel batch operation: up to `max_concurrent` (capped at 5)
    /// batches submitted concurrently; the orchestrator is responsible for
    /// collapsing the resulting reports via the Verdict Reconciler's merge
    /// rules.
    pub async fn analyze_batches(
        &self,
        batches: &[Vec<KeyframeData>],
        max_concurrent: usize,
        policy: &Policy,
        cancellation: &CancellationToken,
    ) -> Vec<RawReport> {
        use futures::stream::{self, StreamExt};

        let concurrency = max_concurrent.min(MAX_CONCURRENT_BATCHES).max(1);
        stream::iter(batches.iter())
            .map(|batch| self.analyze_batch(batch, policy, cancellation))
            .buffer_unordered(concurrency)
            .collect()
            .await
    }

    async fn post_and_parse(&self, payload: &Value) -> std::result::Result<Value, String> {
        let response = self
            .http
            .post(&self.config.proxy_url)
            .json(payload)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        // Parse JSON *before* checking status: the proxy returns a JSON
        // error body on 2xx when Cosmos/Nemotron is down.
        let status = response.status();
        let text = response.text().await.map_err(|e| e.to_string())?;

        match serde_json::from_str::<Value>(&text) {
            Ok(body) => Ok(body),
            Err(_) if !status.is_success() => {
                Err(format!("remote GPU analyzer returned HTTP {status}: {}", truncate(&text, 200)))
            }
            Err(e) => Err(format!("remote GPU analyzer returned non-JSON response: {e}")),
        }
    }
}

fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        text
    } else {
        &text[..max]
    }
}

fn describe_transport_failure(err: &Error) -> String {
    match err {
        Error::Cancelled => "remote GPU analyzer call cancelled".to_string(),
        Error::RetriesExhausted { source, .. } if source.to_lowercase().contains("timed out") => {
            "DGX request timed out (300s limit). The Cosmos+Nemotron pipeline may be overloaded.".to_string()
        }
        Error::RetriesExhausted { source, .. } => format!("remote GPU analyzer error: {source}"),
        Error::NonRetryable(message) => format!("remote GPU analyzer error: {message}"),
        other => format!("remote GPU analyzer error: {other}"),
    }
}

fn degraded_report(summary: &str) -> RawReport {
    RawReport {
        summary: summary.to_string(),
        overall_compliant: false,
        verdicts: Vec::new(),
        recommendations: Vec::new(),
        person_summaries: Vec::new(),
    }
}

fn build_request_payload(mp4_bytes: &[u8], policy: &Policy, model_id: &str) -> Value {
    let video_b64 = base64::engine::general_purpose::STANDARD.encode(mp4_bytes);
    let prompt = build_prompt(policy);

    serde_json::json!({
        "model": model_id,
        "messages": [
            {
                "role": "user",
                "content": [
                    {
                        "type": "video_url",
                        "video_url": { "url": format!("data:video/mp4;base64,{video_b64}") }
                    },
                    { "type": "text", "text": prompt }
                ]
            }
        ],
        "max_tokens": 2048,
        "temperature": 0.6,
    })
}

fn build_prompt(policy: &Policy) -> String {
    let mut text = String::from(
        "You are a security camera AI compliance monitor.\n\nCOMPLIANCE RULES TO CHECK:\n",
    );
    for (i, rule) in policy.rules.iter().enumerate() {
        text.push_str(&format!(
            "  {}. [{:?}] ({:?}) {}\n",
            i + 1,
            rule.severity,
            rule.rule_type,
            rule.description
        ));
    }
    if !policy.custom_prompt.trim().is_empty() {
        text.push_str(&format!("\nADDITIONAL CONTEXT: {}\n", policy.custom_prompt));
    }
    text.push_str(
        "\nRespond with JSON: {\"overall_status\": \"compliant\"|\"non_compliant\", \
        \"summary\": string, \"verdicts\": [{\"rule_description\", \"compliant\", \"severity\", \"reason\"}], \
        \"people\": [{\"person_id\", \"appearance\", \"compliant\", \"violations\"}]}. Return ONLY the JSON.",
    );
    text
}

/// Mirrors the original's `_parse_dgx_response`: handles the
/// chat-completion envelope, markdown code fences around the JSON, and
/// falls back to building verdicts from the policy's rules + a flat
/// `violations` list when the proxy didn't return structured `verdicts`.
fn parse_remote_gpu_response(body: &Value, policy: &Policy) -> RawReport {
    if let Some(error) = body.get("error") {
        let message = error.as_str().map(str::to_string).unwrap_or_else(|| error.to_string());
        return degraded_report(&format!("remote GPU analyzer error: {message}"));
    }

    let content = body
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str);

    let data: Value = match content {
        Some(raw) => match serde_json::from_str(strip_code_fence(raw)) {
            Ok(parsed) => parsed,
            Err(_) => return degraded_report(raw),
        },
        None => body.clone(),
    };

    let overall_status = data.get("overall_status").and_then(Value::as_str).unwrap_or("unknown");
    let overall_compliant = matches!(overall_status.to_lowercase().as_str(), "compliant" | "clear" | "ok");
    let summary = data
        .get("summary")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("Remote GPU status: {}", overall_status.to_uppercase()));

    let verdicts_raw = data.get("verdicts").and_then(Value::as_array).cloned().unwrap_or_default();
    let violations_raw = data.get("violations").and_then(Value::as_array).cloned().unwrap_or_default();

    let verdicts = if !verdicts_raw.is_empty() {
        verdicts_raw.iter().map(|v| verdict_from_structured(v)).collect()
    } else {
        verdicts_from_policy_and_violations(policy, &violations_raw)
    };

    let person_summaries = data
        .get("people")
        .and_then(Value::as_array)
        .map(|people| people.iter().map(person_from_value).collect())
        .unwrap_or_default();

    RawReport { summary, overall_compliant, verdicts, recommendations: Vec::new(), person_summaries }
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    if let Some(stripped) = trimmed.strip_prefix("```") {
        let without_lang = stripped.trim_start_matches(|c: char| c.is_alphabetic());
        without_lang.trim_end_matches("```").trim()
    } else {
        trimmed
    }
}

fn verdict_from_structured(v: &Value) -> RawVerdict {
    RawVerdict {
        rule_type: parse_rule_type(v.get("rule_type").and_then(Value::as_str).unwrap_or("custom")),
        rule_description: v
            .get("rule_description")
            .or_else(|| v.get("rule"))
            .and_then(Value::as_str)
            .unwrap_or("Unknown rule")
            .to_string(),
        compliant: v.get("compliant").and_then(Value::as_bool).unwrap_or(true),
        severity: parse_severity(v.get("severity").and_then(Value::as_str).unwrap_or("medium")),
        reason: v
            .get("reason")
            .or_else(|| v.get("description"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        timestamp: Some(0.0),
    }
}

fn verdicts_from_policy_and_violations(policy: &Policy, violations_raw: &[Value]) -> Vec<RawVerdict> {
    let mut verdicts = Vec::new();
    for rule in &policy.rules {
        let matching = violations_raw.iter().find(|v| fuzzy_matches(rule, v));
        match matching {
            Some(v) => verdicts.push(RawVerdict {
                rule_type: rule.rule_type,
                rule_description: rule.description.clone(),
                compliant: false,
                severity: rule.severity,
                reason: format!(
                    "{}: {}",
                    v.get("subject").and_then(Value::as_str).unwrap_or("Unknown"),
                    v.get("description").and_then(Value::as_str).unwrap_or("")
                ),
                timestamp: Some(0.0),
            }),
            None => verdicts.push(RawVerdict {
                rule_type: rule.rule_type,
                rule_description: rule.description.clone(),
                compliant: true,
                severity: rule.severity,
                reason: "No violation detected by remote GPU analysis.".to_string(),
                timestamp: None,
            }),
        }
    }

    for v in violations_raw {
        let rule_text = v.get("rule").and_then(Value::as_str).unwrap_or("");
        let already_mapped = verdicts.iter().any(|verdict| {
            !verdict.compliant && verdict.reason.to_lowercase().contains(&rule_text.to_lowercase())
        });
        if !already_mapped && !rule_text.is_empty() {
            verdicts.push(RawVerdict {
                rule_type: RuleType::Custom,
                rule_description: rule_text.to_string(),
                compliant: false,
                severity: Severity::High,
                reason: format!(
                    "{}: {}",
                    v.get("subject").and_then(Value::as_str).unwrap_or("Unknown"),
                    v.get("description").and_then(Value::as_str).unwrap_or("")
                ),
                timestamp: Some(0.0),
            });
        }
    }

    verdicts
}

fn fuzzy_matches(rule: &PolicyRule, violation: &Value) -> bool {
    let Some(violation_rule) = violation.get("rule").and_then(Value::as_str) else { return false };
    let rule_lower = rule.description.to_lowercase();
    let violation_lower = violation_rule.to_lowercase();
    rule_lower.contains(&violation_lower) || violation_lower.contains(&rule_lower)
}

fn person_from_value(v: &Value) -> RawPersonSummary {
    RawPersonSummary {
        person_id: v
            .get("person_id")
            .or_else(|| v.get("person"))
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
            .to_string(),
        appearance: v
            .get("appearance")
            .or_else(|| v.get("description"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        first_seen: 0.0,
        last_seen: 0.0,
        frames_seen: 1,
        compliant: v.get("compliant").and_then(Value::as_bool).unwrap_or(true),
        violations: v
            .get("violations")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(|i| i.as_str().map(str::to_string)).collect())
            .unwrap_or_default(),
    }
}

fn parse_rule_type(raw: &str) -> RuleType {
    match raw.to_lowercase().as_str() {
        "badge" => RuleType::Badge,
        "ppe" => RuleType::Ppe,
        "presence" => RuleType::Presence,
        "action" => RuleType::Action,
        "environment" => RuleType::Environment,
        "speech" => RuleType::Speech,
        _ => RuleType::Custom,
    }
}

fn parse_severity(raw: &str) -> Severity {
    match raw.to_lowercase().as_str() {
        "low" => Severity::Low,
        "high" => Severity::High,
        "critical" => Severity::Critical,
        _ => Severity::Medium,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use compliance_schemas::policy::Mode;

    fn policy_with_rule(description: &str) -> Policy {
        Policy {
            rules: vec![PolicyRule {
                rule_type: RuleType::Ppe,
                description: description.to_string(),
                severity: Severity::Critical,
                mode: Mode::Incident,
                validity_duration: None,
                recheck_prompt: None,
                frequency: compliance_schemas::policy::Frequency::Always,
                frequency_count: 1,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn json_error_body_with_200_status_is_not_an_http_error() {
        let body: Value = serde_json::json!({ "error": "Cosmos unreachable" });
        let report = parse_remote_gpu_response(&body, &Policy::default());
        assert!(!report.overall_compliant);
        assert!(report.summary.contains("Cosmos"));
    }

    #[test]
    fn structured_verdicts_pass_through() {
        let body = serde_json::json!({
            "overall_status": "non_compliant",
            "summary": "one violation",
            "verdicts": [
                {"rule_description": "Hard hat required", "compliant": false, "severity": "critical", "reason": "none visible"}
            ]
        });
        let report = parse_remote_gpu_response(&body, &policy_with_rule("Hard hat required"));
        assert!(!report.overall_compliant);
        assert_eq!(report.verdicts.len(), 1);
        assert!(!report.verdicts[0].compliant);
    }

    #[test]
    fn violations_list_without_verdicts_maps_onto_policy_rules() {
        let body = serde_json::json!({
            "overall_status": "non_compliant",
            "violations": [
                {"subject": "Person 1", "rule": "Hard hat required", "description": "no helmet"}
            ]
        });
        let report = parse_remote_gpu_response(&body, &policy_with_rule("Hard hat required"));
        assert_eq!(report.verdicts.len(), 1);
        assert!(!report.verdicts[0].compliant);
        assert!(report.verdicts[0].reason.contains("no helmet"));
    }

    #[test]
    fn compliant_rule_with_no_matching_violation() {
        let body = serde_json::json!({ "overall_status": "compliant", "violations": [] });
        let report = parse_remote_gpu_response(&body, &policy_with_rule("Hard hat required"));
        assert_eq!(report.verdicts.len(), 1);
        assert!(report.verdicts[0].compliant);
    }

    #[test]
    fn strips_markdown_code_fence() {
        let raw = "```json\n{\"a\": 1}\n```";
        assert_eq!(strip_code_fence(raw), "{\"a\": 1}");
    }
}
