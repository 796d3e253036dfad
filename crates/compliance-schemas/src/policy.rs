//! The compliance policy a request is evaluated against.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// What a [`PolicyRule`] is checking for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Badge,
    Ppe,
    Presence,
    Action,
    Environment,
    Speech,
    Custom,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Incident-mode rules must hold at every observation; checklist-mode rules
/// are satisfied once per subject for `validity_duration` seconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Incident,
    Checklist,
}

/// How often a rule must hold, enforced by model prompt rather than code
/// paths. Kept alongside `Mode` per the
/// Open Question resolution in DESIGN.md (option (a)).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Always,
    AtLeastOnce,
    AtLeastN,
}

/// A single policy rule.
///
/// Invariant: `mode == Checklist` implies `frequency == AtLeastOnce`
/// semantically (enforced by [`PolicyRule::validate`], not by the type
/// system — the source policy JSON may still declare other combinations,
/// which we treat as a `BadRequest` at the orchestrator boundary).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyRule {
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    pub description: String,
    pub severity: Severity,
    pub mode: Mode,
    /// Seconds. `None` means "forever" once satisfied (checklist mode only).
    #[serde(default)]
    pub validity_duration: Option<u64>,
    #[serde(default)]
    pub recheck_prompt: Option<String>,
    #[serde(default = "default_frequency")]
    pub frequency: Frequency,
    #[serde(default = "default_frequency_count")]
    pub frequency_count: u32,
}

fn default_frequency() -> Frequency {
    Frequency::Always
}

fn default_frequency_count() -> u32 {
    1
}

impl PolicyRule {
    /// Checks the two cross-field invariants a rule must satisfy. Returns
    /// the first violated invariant as a human-readable message.
    pub fn validate(&self) -> Result<(), String> {
        if self.mode == Mode::Checklist && self.frequency != Frequency::AtLeastOnce {
            return Err(format!(
                "rule '{}' is mode=checklist but frequency={:?} (expected at_least_once)",
                self.description, self.frequency
            ));
        }
        if self.frequency == Frequency::AtLeastN && self.frequency_count < 1 {
            return Err(format!(
                "rule '{}' has frequency=at_least_n but frequency_count={}",
                self.description, self.frequency_count
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    MustMatch,
    MustNotMatch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceCategory {
    People,
    Badges,
    Objects,
}

/// A labeled exemplar image sent alongside keyframes, with per-reference
/// yes/no checks.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReferenceImage {
    pub id: String,
    pub label: String,
    /// Raw JPEG or PNG bytes. Mime is inferred at send time.
    #[serde(with = "bytes_as_base64")]
    pub image_bytes: Vec<u8>,
    pub match_mode: MatchMode,
    pub category: ReferenceCategory,
    #[serde(default)]
    pub checks: Vec<String>,
}

impl ReferenceImage {
    /// MIME type inferred from the magic bytes of the base64-decoded image,
    /// boundary case.
    pub fn mime_type(&self) -> &'static str {
        if self.image_bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
            "image/png"
        } else {
            "image/jpeg"
        }
    }
}

/// The full compliance policy supplied with a request.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    #[serde(default)]
    pub custom_prompt: String,
    #[serde(default)]
    pub include_audio: bool,
    #[serde(default)]
    pub reference_images: Vec<ReferenceImage>,
    #[serde(default)]
    pub enabled_reference_ids: std::collections::HashSet<String>,
    #[serde(default)]
    pub prior_context: String,
    #[serde(default)]
    pub accumulated_transcript: String,
}

impl Policy {
    /// Only references explicitly enabled should be sent to models.
    pub fn enabled_references(&self) -> Vec<&ReferenceImage> {
        self.reference_images
            .iter()
            .filter(|r| self.enabled_reference_ids.contains(&r.id))
            .collect()
    }

    pub fn visual_rules(&self) -> Vec<&PolicyRule> {
        self.rules.iter().filter(|r| r.rule_type != RuleType::Speech).collect()
    }

    pub fn speech_rules(&self) -> Vec<&PolicyRule> {
        self.rules.iter().filter(|r| r.rule_type == RuleType::Speech).collect()
    }

    pub fn checklist_rules(&self) -> Vec<&PolicyRule> {
        self.rules.iter().filter(|r| r.mode == Mode::Checklist).collect()
    }

    /// `BadRequest`: no rules and no custom prompt.
    pub fn is_empty_request(&self) -> bool {
        self.rules.is_empty() && self.custom_prompt.trim().is_empty()
    }
}

mod bytes_as_base64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checklist_rule_without_at_least_once_is_invalid() {
        let rule = PolicyRule {
            rule_type: RuleType::Badge,
            description: "Must show badge".into(),
            severity: Severity::Medium,
            mode: Mode::Checklist,
            validity_duration: Some(300),
            recheck_prompt: None,
            frequency: Frequency::Always,
            frequency_count: 1,
        };
        assert!(rule.validate().is_err());
    }

    #[test]
    fn at_least_n_requires_positive_count() {
        let rule = PolicyRule {
            rule_type: RuleType::Speech,
            description: "Say the phrase twice".into(),
            severity: Severity::High,
            mode: Mode::Incident,
            validity_duration: None,
            recheck_prompt: None,
            frequency: Frequency::AtLeastN,
            frequency_count: 0,
        };
        assert!(rule.validate().is_err());
    }

    #[test]
    fn reference_image_mime_detection() {
        let png = ReferenceImage {
            id: "r1".into(),
            label: "Badge".into(),
            image_bytes: vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a],
            match_mode: MatchMode::MustMatch,
            category: ReferenceCategory::Badges,
            checks: vec![],
        };
        assert_eq!(png.mime_type(), "image/png");

        let jpeg = ReferenceImage {
            image_bytes: vec![0xff, 0xd8, 0xff],
            ..png
        };
        assert_eq!(jpeg.mime_type(), "image/jpeg");
    }

    #[test]
    fn empty_policy_is_bad_request() {
        let policy = Policy::default();
        assert!(policy.is_empty_request());
    }

    #[test]
    fn enabled_references_filters_by_id() {
        let mut policy = Policy::default();
        policy.reference_images.push(ReferenceImage {
            id: "a".into(),
            label: "A".into(),
            image_bytes: vec![1, 2, 3],
            match_mode: MatchMode::MustMatch,
            category: ReferenceCategory::People,
            checks: vec![],
        });
        policy.reference_images.push(ReferenceImage {
            id: "b".into(),
            label: "B".into(),
            image_bytes: vec![4, 5, 6],
            match_mode: MatchMode::MustNotMatch,
            category: ReferenceCategory::Objects,
            checks: vec![],
        });
        policy.enabled_reference_ids.insert("a".to_string());

        let enabled = policy.enabled_references();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, "a");
    }
}
