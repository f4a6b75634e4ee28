//! Structured exit report.
//!
//! Opt-in JSON document written at run end. Fields for non-applicable data
//! are omitted via the summary's serde attributes.

use std::path::Path;

use serde::Serialize;

use quarry_model::{Envelope, EventType};

use crate::run::RunResultSummary;

/// Compressed view of the terminal event for the report.
#[derive(Debug, Clone, Serialize)]
pub struct TerminalSummary {
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<serde_json::Value>,
}

impl TerminalSummary {
    pub fn from_envelope(envelope: &Envelope) -> Self {
        match envelope.event_type {
            EventType::RunError => {
                let payload = envelope.run_error_payload().ok();
                Self {
                    event_type: envelope.event_type.as_str().to_string(),
                    error_type: payload.as_ref().map(|p| p.error_type.clone()),
                    message: payload.map(|p| p.message),
                    summary: None,
                }
            }
            _ => Self {
                event_type: envelope.event_type.as_str().to_string(),
                error_type: None,
                message: None,
                summary: envelope
                    .run_complete_payload()
                    .ok()
                    .and_then(|p| p.summary),
            },
        }
    }
}

/// Write the report JSON, creating parent directories as needed.
pub async fn write_report(path: &Path, summary: &RunResultSummary) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let body = serde_json::to_vec_pretty(summary).map_err(std::io::Error::other)?;
    tokio::fs::write(path, body).await
}
