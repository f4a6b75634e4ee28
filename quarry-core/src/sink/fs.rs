//! Filesystem sink.
//!
//! Appends JSONL record lines under a root directory. Each partition
//! directory holds a single `records.jsonl`; sidecar uploads land under the
//! run's `files/` directory with a `.meta.json` content-type sidecar.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use quarry_model::{ArtifactChunk, Envelope, RunMeta};

use crate::metrics::MetricsSnapshot;
use crate::sink::{
    validate_filename, EncodedBatch, FileMeta, RecordEncoder, StorageError, StorageSink,
};

/// File name for record batches inside a partition directory.
const RECORDS_FILE: &str = "records.jsonl";

#[derive(Debug)]
pub struct FsSink {
    root: PathBuf,
    encoder: RecordEncoder,
}

impl FsSink {
    pub fn new(root: impl Into<PathBuf>, meta: RunMeta, dataset: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            encoder: RecordEncoder::new(meta, dataset.into()),
        }
    }

    /// Append every group of an encoded batch, then commit staged offsets.
    /// Batch bytes are fully staged before any write; offsets advance only
    /// after every group landed.
    async fn write_batch(
        &mut self,
        operation: &'static str,
        batch: EncodedBatch,
    ) -> Result<(), StorageError> {
        for (dir, buf) in &batch.groups {
            let dir_path = self.root.join(dir);
            let file_path = dir_path.join(RECORDS_FILE);
            append_all(operation, &dir_path, &file_path, buf).await?;
        }
        self.encoder.commit_offsets(batch.staged_offsets);
        Ok(())
    }
}

async fn append_all(
    operation: &'static str,
    dir: &Path,
    file: &Path,
    buf: &[u8],
) -> Result<(), StorageError> {
    let shown = file.display().to_string();
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|err| StorageError::io(operation, &shown, err))?;
    let mut handle = tokio::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(file)
        .await
        .map_err(|err| StorageError::io(operation, &shown, err))?;
    handle
        .write_all(buf)
        .await
        .map_err(|err| StorageError::io(operation, &shown, err))?;
    handle
        .flush()
        .await
        .map_err(|err| StorageError::io(operation, &shown, err))?;
    Ok(())
}

#[async_trait]
impl StorageSink for FsSink {
    async fn write_events(&mut self, events: &[Envelope]) -> Result<(), StorageError> {
        if events.is_empty() {
            return Ok(());
        }
        let batch = self.encoder.encode_events(events)?;
        self.write_batch("write_events", batch).await
    }

    async fn write_chunks(&mut self, chunks: &[ArtifactChunk]) -> Result<(), StorageError> {
        if chunks.is_empty() {
            return Ok(());
        }
        let batch = self.encoder.encode_chunks(chunks)?;
        self.write_batch("write_chunks", batch).await
    }

    async fn write_file(
        &mut self,
        filename: &str,
        content_type: &str,
        data: &[u8],
    ) -> Result<(), StorageError> {
        validate_filename(filename)?;
        let files_dir = self.root.join(self.encoder.files_dir());
        let target = files_dir.join(filename);
        let shown = target.display().to_string();
        tokio::fs::create_dir_all(&files_dir)
            .await
            .map_err(|err| StorageError::io("write_file", &shown, err))?;
        tokio::fs::write(&target, data)
            .await
            .map_err(|err| StorageError::io("write_file", &shown, err))?;

        let meta = FileMeta {
            content_type,
            size_bytes: data.len(),
            written_at: Utc::now(),
        };
        let meta_path = files_dir.join(format!("{filename}.meta.json"));
        let meta_shown = meta_path.display().to_string();
        let body = serde_json::to_vec(&meta)
            .map_err(|err| StorageError::encode("write_file", &meta_shown, err))?;
        tokio::fs::write(&meta_path, body)
            .await
            .map_err(|err| StorageError::io("write_file", &meta_shown, err))?;
        debug!(file = %shown, bytes = data.len(), "sidecar file written");
        Ok(())
    }

    async fn write_metrics(
        &mut self,
        snapshot: &MetricsSnapshot,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let batch = self.encoder.encode_metrics(snapshot, completed_at)?;
        self.write_batch("write_metrics", batch).await
    }

    async fn close(&mut self) -> Result<(), StorageError> {
        // Appends flush per batch; nothing is held open across writes.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_model::{EventType, StoredRecord, CONTRACT_VERSION};
    use serde_json::json;

    fn meta() -> RunMeta {
        let mut meta = RunMeta::new("shop", "default");
        meta.started_at = "2026-02-01T10:00:00Z".parse().expect("timestamp");
        meta
    }

    fn envelope(meta: &RunMeta, seq: u64) -> Envelope {
        Envelope {
            contract_version: CONTRACT_VERSION,
            event_id: format!("evt-{seq}"),
            run_id: meta.run_id,
            seq,
            event_type: EventType::Item,
            ts: Utc::now(),
            payload: json!({"item_type": "listing", "data": {"n": seq}}),
            job_id: None,
            parent_run_id: None,
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn events_append_in_order() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let meta = meta();
        let mut sink = FsSink::new(tmp.path(), meta.clone(), "quarry");

        sink.write_events(&[envelope(&meta, 1)]).await.expect("write 1");
        sink.write_events(&[envelope(&meta, 2), envelope(&meta, 3)])
            .await
            .expect("write 2");

        let path = tmp.path().join(format!(
            "datasets/quarry/partitions/source=shop/category=default/day=2026-02-01/run_id={}/event_type=item/records.jsonl",
            meta.run_id
        ));
        let text = std::fs::read_to_string(path).expect("records exist");
        let seqs: Vec<u64> = text
            .lines()
            .map(|line| {
                let record: StoredRecord = serde_json::from_str(line).expect("parse");
                record.event.expect("event body").seq
            })
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn file_upload_writes_content_and_meta_sidecar() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let meta = meta();
        let mut sink = FsSink::new(tmp.path(), meta.clone(), "quarry");

        sink.write_file("page.html", "text/html", b"<html/>")
            .await
            .expect("upload");

        let files_dir = tmp.path().join(format!(
            "datasets/quarry/partitions/source=shop/category=default/day=2026-02-01/run_id={}/files",
            meta.run_id
        ));
        let body = std::fs::read(files_dir.join("page.html")).expect("content");
        assert_eq!(body, b"<html/>");
        let sidecar =
            std::fs::read_to_string(files_dir.join("page.html.meta.json")).expect("sidecar");
        assert!(sidecar.contains("text/html"));
        assert!(sidecar.contains("\"size_bytes\":7"));
    }

    #[tokio::test]
    async fn traversal_filename_rejected_without_touching_disk() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let meta = meta();
        let mut sink = FsSink::new(tmp.path(), meta, "quarry");
        assert!(sink.write_file("../escape", "text/plain", b"x").await.is_err());
        assert!(std::fs::read_dir(tmp.path()).expect("dir").next().is_none());
    }

    #[tokio::test]
    async fn chunk_offsets_survive_across_batches() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let meta = meta();
        let mut sink = FsSink::new(tmp.path(), meta.clone(), "quarry");

        sink.write_chunks(&[ArtifactChunk {
            artifact_id: "art-1".into(),
            seq: 1,
            is_last: false,
            data: vec![1; 5],
        }])
        .await
        .expect("batch 1");
        sink.write_chunks(&[ArtifactChunk {
            artifact_id: "art-1".into(),
            seq: 2,
            is_last: true,
            data: vec![2; 7],
        }])
        .await
        .expect("batch 2");

        let path = tmp.path().join(format!(
            "datasets/quarry/partitions/source=shop/category=default/day=2026-02-01/run_id={}/event_type=artifact/records.jsonl",
            meta.run_id
        ));
        let text = std::fs::read_to_string(path).expect("records");
        let offsets: Vec<u64> = text
            .lines()
            .map(|line| {
                let record: StoredRecord = serde_json::from_str(line).expect("parse");
                record.chunk.expect("chunk body").offset
            })
            .collect();
        assert_eq!(offsets, vec![0, 5]);
    }

    #[tokio::test]
    async fn metrics_record_lands_in_metrics_partition() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let meta = meta();
        let mut sink = FsSink::new(tmp.path(), meta.clone(), "quarry");

        let snapshot = MetricsSnapshot {
            events_received: 3,
            ..MetricsSnapshot::default()
        };
        sink.write_metrics(&snapshot, Utc::now()).await.expect("metrics");

        let path = tmp.path().join(format!(
            "datasets/quarry/partitions/source=shop/category=default/day=2026-02-01/run_id={}/event_type=metrics/records.jsonl",
            meta.run_id
        ));
        let text = std::fs::read_to_string(path).expect("records");
        assert!(text.contains("\"events_received\":3"));
        assert!(text.contains("completed_at"));
    }
}
