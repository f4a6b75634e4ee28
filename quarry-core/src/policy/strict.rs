//! Strict policy: synchronous, unbuffered write-through.

use std::sync::Arc;

use async_trait::async_trait;

use quarry_model::{ArtifactChunk, Envelope};

use crate::error::Result;
use crate::metrics::MetricsCollector;
use crate::policy::{IngestionPolicy, PolicyStats};
use crate::sink::SharedSink;

/// Every ingest call writes through to the sink and returns only after the
/// write completed or failed. Nothing is ever dropped; `flush` is a no-op.
pub struct StrictPolicy {
    sink: SharedSink,
    metrics: Arc<MetricsCollector>,
    stats: PolicyStats,
}

impl std::fmt::Debug for StrictPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrictPolicy").field("stats", &self.stats).finish()
    }
}

impl StrictPolicy {
    pub fn new(sink: SharedSink, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            sink,
            metrics,
            stats: PolicyStats::default(),
        }
    }
}

#[async_trait]
impl IngestionPolicy for StrictPolicy {
    async fn ingest_event(&mut self, envelope: Envelope) -> Result<()> {
        self.stats.events_received += 1;
        self.metrics.event_received();
        self.sink
            .lock()
            .await
            .write_events(std::slice::from_ref(&envelope))
            .await?;
        self.stats.events_persisted += 1;
        self.metrics.events_persisted(1);
        Ok(())
    }

    async fn ingest_chunk(&mut self, chunk: ArtifactChunk) -> Result<()> {
        self.stats.chunks_received += 1;
        self.metrics.chunk_received(chunk.data.len() as u64);
        self.sink
            .lock()
            .await
            .write_chunks(std::slice::from_ref(&chunk))
            .await?;
        self.stats.chunks_persisted += 1;
        self.metrics.chunks_persisted(1);
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn stats(&self) -> PolicyStats {
        self.stats.clone()
    }
}
