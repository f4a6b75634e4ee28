//! Object storage sink.
//!
//! Object stores cannot append, so every successful record batch becomes one
//! immutable part object (`part-NNNNN.jsonl`) inside its partition
//! directory. The per-partition part counter is sink state and advances only
//! after the corresponding put succeeds, mirroring the filesystem sink's
//! offset discipline.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use tracing::debug;

use quarry_model::{ArtifactChunk, Envelope, RunMeta};

use crate::metrics::MetricsSnapshot;
use crate::sink::{
    validate_filename, EncodedBatch, FileMeta, RecordEncoder, StorageError, StorageSink,
};

pub struct ObjectStoreSink {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    encoder: RecordEncoder,
    part_counters: HashMap<String, u64>,
}

impl std::fmt::Debug for ObjectStoreSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreSink")
            .field("prefix", &self.prefix)
            .field("dataset", &self.encoder.dataset())
            .field("run_id", &self.encoder.meta().run_id)
            .finish()
    }
}

impl ObjectStoreSink {
    /// Wrap an arbitrary object store (used directly by tests with the
    /// in-memory backend).
    pub fn new(
        store: Arc<dyn ObjectStore>,
        prefix: impl Into<String>,
        meta: RunMeta,
        dataset: impl Into<String>,
    ) -> Self {
        Self {
            store,
            prefix: normalize_prefix(prefix.into()),
            encoder: RecordEncoder::new(meta, dataset.into()),
            part_counters: HashMap::new(),
        }
    }

    /// S3-compatible bucket. Credentials come from the environment; a custom
    /// endpoint switches on path-style addressing for S3 clones that need it.
    pub fn amazon_s3(
        bucket: &str,
        prefix: &str,
        region: Option<&str>,
        endpoint: Option<&str>,
        path_style: bool,
        meta: RunMeta,
        dataset: impl Into<String>,
    ) -> Result<Self, StorageError> {
        let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
        if let Some(region) = region {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }
        if path_style {
            builder = builder.with_virtual_hosted_style_request(false);
        }
        let store = builder
            .build()
            .map_err(|err| StorageError::object("configure", bucket.to_string(), err))?;
        Ok(Self::new(Arc::new(store), prefix, meta, dataset))
    }

    fn object_path(&self, relative: &str) -> ObjectPath {
        if self.prefix.is_empty() {
            ObjectPath::from(relative)
        } else {
            ObjectPath::from(format!("{}/{relative}", self.prefix))
        }
    }

    /// Put one part object per group, advancing each group's part counter as
    /// its put succeeds. Staged artifact offsets commit only once every group
    /// landed.
    async fn write_batch(
        &mut self,
        operation: &'static str,
        batch: EncodedBatch,
    ) -> Result<(), StorageError> {
        for (dir, buf) in &batch.groups {
            let part = self.part_counters.get(dir).copied().unwrap_or(0);
            let relative = format!("{dir}/part-{part:05}.jsonl");
            let path = self.object_path(&relative);
            self.store
                .put(&path, PutPayload::from(buf.clone()))
                .await
                .map_err(|err| StorageError::object(operation, relative.clone(), err))?;
            self.part_counters.insert(dir.clone(), part + 1);
            debug!(object = %relative, bytes = buf.len(), "part object written");
        }
        self.encoder.commit_offsets(batch.staged_offsets);
        Ok(())
    }
}

fn normalize_prefix(prefix: String) -> String {
    prefix.trim_matches('/').to_string()
}

#[async_trait]
impl StorageSink for ObjectStoreSink {
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
        let relative = format!("{}/{filename}", self.encoder.files_dir());
        let path = self.object_path(&relative);
        self.store
            .put(&path, PutPayload::from(data.to_vec()))
            .await
            .map_err(|err| StorageError::object("write_file", relative.clone(), err))?;

        let meta = FileMeta {
            content_type,
            size_bytes: data.len(),
            written_at: Utc::now(),
        };
        let meta_relative = format!("{relative}.meta.json");
        let body = serde_json::to_vec(&meta)
            .map_err(|err| StorageError::encode("write_file", &meta_relative, err))?;
        let meta_path = self.object_path(&meta_relative);
        self.store
            .put(&meta_path, PutPayload::from(body))
            .await
            .map_err(|err| StorageError::object("write_file", meta_relative, err))?;
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
        Ok(())
    }
}
