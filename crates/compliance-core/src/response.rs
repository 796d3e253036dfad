//! Top-level response envelope an orchestrator call resolves to:
//! `{status: "complete", report}` or `{status: "error", error}`, the latter
//! carrying the `[Stage N:Name]`-tagged message from [`crate::error::Error`].
//! A degraded-but-successful analysis ("partial/degraded success")
//! still reports `status: "complete"` — the degradation surfaces only in
//! `report.summary`.

use serde::{Deserialize, Serialize};

use compliance_schemas::report::Report;

use crate::error::Error;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AnalyzeResponse {
    Complete { report: Box<Report> },
    Error { error: String },
}

impl AnalyzeResponse {
    pub fn ok(report: Report) -> Self {
        Self::Complete { report: Box::new(report) }
    }

    pub fn error(err: &Error) -> Self {
        Self::Error { error: err.to_tagged_string() }
    }
}

impl From<crate::error::Result<Report>> for AnalyzeResponse {
    fn from(result: crate::error::Result<Report>) -> Self {
        match result {
            Ok(report) => Self::ok(report),
            Err(err) => Self::error(&err),
        }
    }
}
