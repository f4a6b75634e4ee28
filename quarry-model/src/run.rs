use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ModelError, Result};

/// Immutable metadata describing one run attempt. Created by the orchestrator
/// at spawn time; the worker never generates any of these identifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMeta {
    pub run_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<Uuid>,
    pub attempt: u32,
    pub source: String,
    pub category: String,
    /// Arbitrary job parameters handed to the worker verbatim.
    pub job_payload: serde_json::Value,
    /// Run start, UTC. Partition `day` derives from this, never from event
    /// timestamps.
    pub started_at: DateTime<Utc>,
}

impl RunMeta {
    /// Construct metadata for a fresh first attempt.
    pub fn new(source: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::now_v7(),
            job_id: None,
            parent_run_id: None,
            attempt: 1,
            source: source.into(),
            category: category.into(),
            job_payload: serde_json::Value::Object(serde_json::Map::new()),
            started_at: Utc::now(),
        }
    }

    /// Construct metadata for a retry of `parent`.
    pub fn retry_of(parent: &RunMeta) -> Self {
        Self {
            run_id: Uuid::now_v7(),
            job_id: parent.job_id.clone(),
            parent_run_id: Some(parent.run_id),
            attempt: parent.attempt + 1,
            source: parent.source.clone(),
            category: parent.category.clone(),
            job_payload: parent.job_payload.clone(),
            started_at: Utc::now(),
        }
    }

    /// Lineage and field validation. `attempt == 1` iff `parent_run_id` is
    /// absent; source and category must be non-empty and partition-safe.
    pub fn validate(&self) -> Result<()> {
        if self.attempt == 0 {
            return Err(ModelError::InvalidRunMeta("attempt must be >= 1".into()));
        }
        match (self.attempt, &self.parent_run_id) {
            (1, Some(_)) => {
                return Err(ModelError::InvalidRunMeta(
                    "attempt 1 must not carry a parent_run_id".into(),
                ));
            }
            (n, None) if n > 1 => {
                return Err(ModelError::InvalidRunMeta(format!(
                    "attempt {n} requires a parent_run_id"
                )));
            }
            _ => {}
        }
        validate_partition_component("source", &self.source)?;
        validate_partition_component("category", &self.category)?;
        if !self.job_payload.is_object() {
            return Err(ModelError::InvalidRunMeta(
                "job payload must be a JSON object".into(),
            ));
        }
        Ok(())
    }

    /// Partition `day` for this run, `YYYY-MM-DD` in UTC.
    pub fn day(&self) -> String {
        self.started_at.format("%Y-%m-%d").to_string()
    }
}

fn validate_partition_component(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(ModelError::InvalidRunMeta(format!("{field} must be non-empty")));
    }
    if value.contains('/') || value.contains('\\') || value.contains("..") || value.contains('=') {
        return Err(ModelError::InvalidRunMeta(format!(
            "{field} {value:?} contains path or partition separators"
        )));
    }
    Ok(())
}
