//! Storage sinks.
//!
//! A sink persists envelopes, artifact chunk records, sidecar files, and the
//! run metrics snapshot into the Hive-partitioned dataset layout:
//!
//! ```text
//! datasets/<dataset>/partitions/source=<s>/category=<c>/day=<d>/run_id=<r>/
//!   event_type=<t>/<append-only records>
//!   files/<filename>
//!   files/<filename>.meta.json
//! ```
//!
//! The layout is policy-independent; strict and buffered runs with the same
//! metadata produce the same directories and record shapes. On any write
//! failure no sink-side state mutates, so a failed batch can be retried from
//! an identical starting point.

mod error;
mod fs;
mod object;

pub use error::{classify_message, StorageError, StorageErrorKind};
pub use fs::FsSink;
pub use object::ObjectStoreSink;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};

use quarry_model::{
    ArtifactChunk, ChunkRecord, Envelope, PartitionKey, RunMeta, StoredRecord,
};

use crate::metrics::MetricsSnapshot;

/// Default dataset name when none is configured.
pub const DEFAULT_DATASET: &str = "quarry";

/// The storage-facing contract consumed by policies and the reader loop.
#[async_trait]
pub trait StorageSink: Send {
    async fn write_events(&mut self, events: &[Envelope]) -> Result<(), StorageError>;

    async fn write_chunks(&mut self, chunks: &[ArtifactChunk]) -> Result<(), StorageError>;

    async fn write_file(
        &mut self,
        filename: &str,
        content_type: &str,
        data: &[u8],
    ) -> Result<(), StorageError>;

    async fn write_metrics(
        &mut self,
        snapshot: &MetricsSnapshot,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    async fn close(&mut self) -> Result<(), StorageError>;
}

/// Sink handle shared between the reader loop and the policy. The mutex is
/// the serialized ingest pipeline; per-artifact sink state needs no further
/// locking.
pub type SharedSink = Arc<tokio::sync::Mutex<dyn StorageSink + Send>>;

pub fn shared(sink: impl StorageSink + 'static) -> SharedSink {
    Arc::new(tokio::sync::Mutex::new(sink))
}

/// Reject filenames that could escape the run's `files/` directory.
pub(crate) fn validate_filename(filename: &str) -> Result<(), StorageError> {
    let bad = filename.is_empty()
        || filename.contains('/')
        || filename.contains('\\')
        || filename.contains("..");
    if bad {
        return Err(StorageError::new(
            StorageErrorKind::Other,
            "write_file",
            filename.to_string(),
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid upload filename {filename:?}"),
            ),
        ));
    }
    Ok(())
}

/// Content-type sidecar written next to every uploaded file.
#[derive(Debug, serde::Serialize)]
pub(crate) struct FileMeta<'a> {
    pub content_type: &'a str,
    pub size_bytes: usize,
    pub written_at: DateTime<Utc>,
}

/// Builds JSONL record lines for both sink backends and stages per-artifact
/// offset advances so they can be committed only after a successful write.
#[derive(Debug)]
pub(crate) struct RecordEncoder {
    meta: RunMeta,
    dataset: String,
    artifact_offsets: HashMap<String, u64>,
}

/// One encoded batch: record lines grouped per partition directory, in write
/// order, plus the offset advances to apply on success.
#[derive(Debug, Default)]
pub(crate) struct EncodedBatch {
    pub groups: Vec<(String, Vec<u8>)>,
    pub staged_offsets: HashMap<String, u64>,
}

impl RecordEncoder {
    pub fn new(meta: RunMeta, dataset: String) -> Self {
        Self {
            meta,
            dataset,
            artifact_offsets: HashMap::new(),
        }
    }

    pub fn meta(&self) -> &RunMeta {
        &self.meta
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn files_dir(&self) -> String {
        PartitionKey::for_metrics(&self.meta).files_dir(&self.dataset)
    }

    /// Encode an event batch. Events are grouped by partition directory in
    /// first-seen order; within a group, arrival (and therefore `seq`) order
    /// is preserved.
    pub fn encode_events(&self, events: &[Envelope]) -> Result<EncodedBatch, StorageError> {
        let mut batch = EncodedBatch::default();
        for envelope in events {
            let key = PartitionKey::for_event(&self.meta, envelope.event_type);
            let dir = key.partition_dir(&self.dataset);
            let record = StoredRecord::event(key, envelope.clone());
            append_line(&mut batch.groups, dir, &record)?;
        }
        Ok(batch)
    }

    /// Encode a chunk batch, assigning artifact-relative byte offsets from
    /// the committed offset map. The returned staged offsets must be fed back
    /// through [`RecordEncoder::commit_offsets`] once the backend write
    /// succeeds; on failure the committed map is untouched and the batch can
    /// be retried verbatim.
    pub fn encode_chunks(&self, chunks: &[ArtifactChunk]) -> Result<EncodedBatch, StorageError> {
        let mut batch = EncodedBatch::default();
        let mut staged: HashMap<String, u64> = HashMap::new();
        for chunk in chunks {
            let offset = staged
                .get(&chunk.artifact_id)
                .copied()
                .or_else(|| self.artifact_offsets.get(&chunk.artifact_id).copied())
                .unwrap_or(0);
            let length = chunk.data.len() as u64;
            let digest = md5::compute(&chunk.data);
            let record = ChunkRecord {
                artifact_id: chunk.artifact_id.clone(),
                seq: chunk.seq,
                offset,
                length,
                is_last: chunk.is_last,
                md5: Some(format!("{digest:x}")),
                data_base64: base64::engine::general_purpose::STANDARD.encode(&chunk.data),
            };
            staged.insert(chunk.artifact_id.clone(), offset + length);

            let key = PartitionKey::for_event(&self.meta, quarry_model::EventType::Artifact);
            let dir = key.partition_dir(&self.dataset);
            let stored = StoredRecord::chunk(key, record);
            append_line(&mut batch.groups, dir, &stored)?;
        }
        batch.staged_offsets = staged;
        Ok(batch)
    }

    /// Encode the run metrics record.
    pub fn encode_metrics(
        &self,
        snapshot: &MetricsSnapshot,
        completed_at: DateTime<Utc>,
    ) -> Result<EncodedBatch, StorageError> {
        let key = PartitionKey::for_metrics(&self.meta);
        let dir = key.partition_dir(&self.dataset);
        let mut value = serde_json::to_value(snapshot)
            .map_err(|err| StorageError::encode("write_metrics", &dir, err))?;
        if let Some(map) = value.as_object_mut() {
            map.insert(
                "completed_at".to_string(),
                serde_json::Value::String(completed_at.to_rfc3339()),
            );
        }
        let record = StoredRecord::metrics(key, value);
        let mut batch = EncodedBatch::default();
        append_line(&mut batch.groups, dir, &record)?;
        Ok(batch)
    }

    /// Advance the committed per-artifact offsets. Called only after the
    /// backend write for the staged batch succeeded.
    pub fn commit_offsets(&mut self, staged: HashMap<String, u64>) {
        for (artifact_id, offset) in staged {
            self.artifact_offsets.insert(artifact_id, offset);
        }
    }
}

fn append_line(
    groups: &mut Vec<(String, Vec<u8>)>,
    dir: String,
    record: &StoredRecord,
) -> Result<(), StorageError> {
    let mut line = serde_json::to_vec(record)
        .map_err(|err| StorageError::encode("encode_record", &dir, err))?;
    line.push(b'\n');
    if let Some((_, buf)) = groups.iter_mut().find(|(d, _)| *d == dir) {
        buf.extend_from_slice(&line);
    } else {
        groups.push((dir, line));
    }
    Ok(())
}
