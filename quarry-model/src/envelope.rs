use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ModelError, Result};

/// Envelope contract version understood by this supervisor.
pub const CONTRACT_VERSION: u32 = 1;

/// The event types a worker may emit inside an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Item,
    Artifact,
    Checkpoint,
    Enqueue,
    RotateProxy,
    Log,
    RunError,
    RunComplete,
}

impl EventType {
    /// Terminal events end the run; at most one is emitted per run.
    pub fn is_terminal(self) -> bool {
        matches!(self, EventType::RunError | EventType::RunComplete)
    }

    /// Droppable events may be discarded by a policy under memory pressure.
    pub fn is_droppable(self) -> bool {
        matches!(
            self,
            EventType::Enqueue | EventType::RotateProxy | EventType::Log
        )
    }

    /// Stable wire/partition name for the type.
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Item => "item",
            EventType::Artifact => "artifact",
            EventType::Checkpoint => "checkpoint",
            EventType::Enqueue => "enqueue",
            EventType::RotateProxy => "rotate_proxy",
            EventType::Log => "log",
            EventType::RunError => "run_error",
            EventType::RunComplete => "run_complete",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fields wrapping every worker event.
///
/// `seq` is positive, strictly monotonic within a run, starts at 1 and has no
/// gaps. `payload` is the type-specific mapping; typed views are obtained via
/// the `*_payload` accessors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub contract_version: u32,
    pub event_id: String,
    pub run_id: Uuid,
    pub seq: u64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub ts: DateTime<Utc>,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<Uuid>,
    pub attempt: u32,
}

impl Envelope {
    /// Structural checks that do not depend on surrounding stream state.
    pub fn validate(&self) -> Result<()> {
        if self.event_id.is_empty() {
            return Err(ModelError::InvalidEnvelope("empty event_id".into()));
        }
        if self.seq == 0 {
            return Err(ModelError::InvalidEnvelope(format!(
                "event {} has seq 0; seq starts at 1",
                self.event_id
            )));
        }
        if self.attempt == 0 {
            return Err(ModelError::InvalidEnvelope(format!(
                "event {} has attempt 0; attempts start at 1",
                self.event_id
            )));
        }
        Ok(())
    }

    pub fn item_payload(&self) -> Result<ItemPayload> {
        self.typed_payload("item")
    }

    pub fn artifact_payload(&self) -> Result<ArtifactPayload> {
        self.typed_payload("artifact")
    }

    pub fn checkpoint_payload(&self) -> Result<CheckpointPayload> {
        self.typed_payload("checkpoint")
    }

    pub fn enqueue_payload(&self) -> Result<EnqueuePayload> {
        self.typed_payload("enqueue")
    }

    pub fn rotate_proxy_payload(&self) -> Result<RotateProxyPayload> {
        self.typed_payload("rotate_proxy")
    }

    pub fn log_payload(&self) -> Result<LogPayload> {
        self.typed_payload("log")
    }

    pub fn run_error_payload(&self) -> Result<RunErrorPayload> {
        self.typed_payload("run_error")
    }

    pub fn run_complete_payload(&self) -> Result<RunCompletePayload> {
        self.typed_payload("run_complete")
    }

    fn typed_payload<T: serde::de::DeserializeOwned>(&self, kind: &str) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|err| {
            ModelError::InvalidEnvelope(format!(
                "event {} carries a malformed {kind} payload: {err}",
                self.event_id
            ))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemPayload {
    pub item_type: String,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactPayload {
    pub artifact_id: String,
    pub name: String,
    pub content_type: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointPayload {
    pub checkpoint_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueuePayload {
    pub target: String,
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateProxyPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogPayload {
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<serde_json::Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunErrorPayload {
    pub error_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCompletePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Value>,
}
