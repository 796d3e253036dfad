//! Request/response/report data model for the compliance vision pipeline.
//!
//! This crate has no I/O and no async — it is the shared vocabulary that
//! `compliance-detector`, `compliance-clients`, `compliance-checklist`,
//! `compliance-reconciler` and `compliance-core` all build on.

pub mod checklist;
pub mod keyframe;
pub mod observation;
pub mod person;
pub mod policy;
pub mod report;
pub mod transcript;
pub mod verdict;

pub use checklist::{ChecklistItem, ChecklistState};
pub use keyframe::{validate_keyframe_sequence, KeyframeData, Trigger};
pub use observation::{FrameObservation, PersonDetail, RawFrameObservation};
pub use person::{PersonSummary, RawPersonSummary};
pub use policy::{
    Frequency, MatchMode, Mode, Policy, PolicyRule, ReferenceCategory, ReferenceImage, RuleType,
    Severity,
};
pub use report::{RawReport, Report};
pub use transcript::{TranscriptResult, TranscriptSegment};
pub use verdict::{ChecklistStatus, RawVerdict, SpeechVerdicts, Verdict};
