use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::{Envelope, EventType};
use crate::run::RunMeta;

/// Discriminator carried by every persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Event,
    ArtifactEvent,
    ArtifactChunk,
    Metrics,
}

/// The Hive partition tuple that determines where a record lives. `day` is
/// derived from the run start time, so strict and buffered runs with the same
/// metadata land in the same directories.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    pub source: String,
    pub category: String,
    pub day: String,
    pub run_id: Uuid,
    pub event_type: String,
}

impl PartitionKey {
    pub fn for_event(meta: &RunMeta, event_type: EventType) -> Self {
        Self::with_type(meta, event_type.as_str())
    }

    /// Partition for the run-level metrics record.
    pub fn for_metrics(meta: &RunMeta) -> Self {
        Self::with_type(meta, "metrics")
    }

    fn with_type(meta: &RunMeta, event_type: &str) -> Self {
        Self {
            source: meta.source.clone(),
            category: meta.category.clone(),
            day: meta.day(),
            run_id: meta.run_id,
            event_type: event_type.to_string(),
        }
    }

    /// Directory for this partition relative to the dataset root, without the
    /// trailing separator.
    pub fn partition_dir(&self, dataset: &str) -> String {
        format!(
            "datasets/{dataset}/partitions/source={}/category={}/day={}/run_id={}/event_type={}",
            self.source, self.category, self.day, self.run_id, self.event_type
        )
    }

    /// Directory holding sidecar file uploads for this run.
    pub fn files_dir(&self, dataset: &str) -> String {
        format!(
            "datasets/{dataset}/partitions/source={}/category={}/day={}/run_id={}/files",
            self.source, self.category, self.day, self.run_id
        )
    }
}

/// Body of a persisted artifact chunk record. Payload bytes are stored
/// base64-encoded; `offset` is the artifact-relative byte offset assigned by
/// the sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub artifact_id: String,
    pub seq: u64,
    pub offset: u64,
    pub length: u64,
    pub is_last: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    pub data_base64: String,
}

/// One persisted record: the partition tuple plus a kind-specific body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord {
    pub record_kind: RecordKind,
    #[serde(flatten)]
    pub partition: PartitionKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<Envelope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<ChunkRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<serde_json::Value>,
}

impl StoredRecord {
    pub fn event(partition: PartitionKey, envelope: Envelope) -> Self {
        let record_kind = if envelope.event_type == EventType::Artifact {
            RecordKind::ArtifactEvent
        } else {
            RecordKind::Event
        };
        Self {
            record_kind,
            partition,
            event: Some(envelope),
            chunk: None,
            metrics: None,
        }
    }

    pub fn chunk(partition: PartitionKey, chunk: ChunkRecord) -> Self {
        Self {
            record_kind: RecordKind::ArtifactChunk,
            partition,
            event: None,
            chunk: Some(chunk),
            metrics: None,
        }
    }

    pub fn metrics(partition: PartitionKey, snapshot: serde_json::Value) -> Self {
        Self {
            record_kind: RecordKind::Metrics,
            partition,
            event: None,
            chunk: None,
            metrics: Some(snapshot),
        }
    }
}
