//! Buffered policy: bounded in-memory buffer with a configurable flush mode.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use quarry_model::{ArtifactChunk, Envelope};

use crate::error::{CoreError, Result};
use crate::metrics::{FlushTrigger, MetricsCollector};
use crate::policy::{IngestionPolicy, PolicyStats};
use crate::sink::SharedSink;

/// What a flush writes, and what a failed flush keeps buffered.
///
/// Every mode drains buffered chunks before buffered events; a commit event
/// can only follow its chunks on the wire, so chunks-before-events inside a
/// flush keeps every chunk record ahead of its artifact's commit record in
/// the persisted stream. Chunk batches that reached the sink are never
/// re-sent; the sink's offsets advanced for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// Events go out as one batch; any failure keeps the whole event buffer
    /// for the next flush. Events may be written more than once across
    /// retries, never lost.
    AtLeastOnce,
    /// Events go out one record at a time; a failure keeps exactly the
    /// unwritten suffix buffered, so nothing is ever written twice.
    ChunksFirst,
    /// The chunk phase must fully succeed before any event is attempted;
    /// events then go out one record at a time, so an event-phase failure
    /// retains only the unwritten events and the retry re-sends neither
    /// chunks nor already-landed events.
    TwoPhase,
}

pub struct BufferedPolicy {
    sink: SharedSink,
    metrics: Arc<MetricsCollector>,
    mode: FlushMode,
    max_events: Option<usize>,
    max_bytes: Option<usize>,
    events: VecDeque<(Envelope, usize)>,
    chunks: VecDeque<ArtifactChunk>,
    buffered_bytes: usize,
    stats: PolicyStats,
}

impl std::fmt::Debug for BufferedPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedPolicy")
            .field("mode", &self.mode)
            .field("buffered_events", &self.events.len())
            .field("buffered_chunks", &self.chunks.len())
            .field("buffered_bytes", &self.buffered_bytes)
            .finish()
    }
}

impl BufferedPolicy {
    pub fn new(
        sink: SharedSink,
        metrics: Arc<MetricsCollector>,
        max_events: Option<usize>,
        max_bytes: Option<usize>,
        mode: FlushMode,
    ) -> Self {
        Self {
            sink,
            metrics,
            mode,
            max_events,
            max_bytes,
            events: VecDeque::new(),
            chunks: VecDeque::new(),
            buffered_bytes: 0,
            stats: PolicyStats::default(),
        }
    }

    fn buffered_count(&self) -> usize {
        self.events.len() + self.chunks.len()
    }

    fn is_full(&self) -> bool {
        let count_full = self
            .max_events
            .is_some_and(|max| self.buffered_count() >= max);
        let bytes_full = self.max_bytes.is_some_and(|max| self.buffered_bytes >= max);
        count_full || bytes_full
    }

    /// Drain chunks, then events, per the flush mode. Retention on failure is
    /// mode-specific; successfully written batches always leave the buffer.
    async fn perform_flush(&mut self, trigger: FlushTrigger) -> Result<()> {
        if self.buffered_count() == 0 {
            return Ok(());
        }
        match trigger {
            FlushTrigger::Close => {
                self.stats.flushes_close += 1;
                self.metrics.flush(FlushTrigger::Close);
            }
            _ => {
                self.stats.flushes_count += 1;
                self.metrics.flush(FlushTrigger::Count);
            }
        }
        trace!(
            events = self.events.len(),
            chunks = self.chunks.len(),
            mode = ?self.mode,
            "buffered flush"
        );

        if !self.chunks.is_empty() {
            let chunks: Vec<ArtifactChunk> = self.chunks.iter().cloned().collect();
            match self.sink.lock().await.write_chunks(&chunks).await {
                Ok(()) => {
                    let n = chunks.len() as u64;
                    let bytes: usize = chunks.iter().map(|c| c.data.len()).sum();
                    self.chunks.clear();
                    self.buffered_bytes = self.buffered_bytes.saturating_sub(bytes);
                    self.stats.chunks_persisted += n;
                    self.metrics.chunks_persisted(n);
                }
                Err(err) => {
                    // Chunks and events both stay buffered; the sink promised
                    // no state advanced, so the retry is byte-identical.
                    return Err(CoreError::Storage(err));
                }
            }
        }

        match self.mode {
            FlushMode::AtLeastOnce => {
                if !self.events.is_empty() {
                    let batch: Vec<Envelope> =
                        self.events.iter().map(|(env, _)| env.clone()).collect();
                    match self.sink.lock().await.write_events(&batch).await {
                        Ok(()) => {
                            let n = batch.len() as u64;
                            let bytes: usize = self.events.iter().map(|(_, b)| *b).sum();
                            self.events.clear();
                            self.buffered_bytes = self.buffered_bytes.saturating_sub(bytes);
                            self.stats.events_persisted += n;
                            self.metrics.events_persisted(n);
                        }
                        Err(err) => return Err(CoreError::Storage(err)),
                    }
                }
            }
            // One envelope per sink call: a failure leaves exactly the
            // unwritten suffix buffered, so the retry never re-appends a
            // record that already landed.
            FlushMode::ChunksFirst | FlushMode::TwoPhase => {
                while let Some((envelope, weight)) = self.events.front() {
                    let weight = *weight;
                    let result = self
                        .sink
                        .lock()
                        .await
                        .write_events(std::slice::from_ref(envelope))
                        .await;
                    match result {
                        Ok(()) => {
                            self.events.pop_front();
                            self.buffered_bytes = self.buffered_bytes.saturating_sub(weight);
                            self.stats.events_persisted += 1;
                            self.metrics.events_persisted(1);
                        }
                        Err(err) => return Err(CoreError::Storage(err)),
                    }
                }
            }
        }
        Ok(())
    }

    /// Backpressure path for a non-droppable arrival into a full buffer: the
    /// producing call drains the buffer inline. If draining cannot make room
    /// the arrival is a fatal policy failure.
    async fn make_room(&mut self) -> Result<()> {
        debug!(buffered = self.buffered_count(), "buffer full, draining for non-droppable event");
        self.perform_flush(FlushTrigger::Count).await?;
        if self.buffered_count() > 0 && self.is_full() {
            return Err(CoreError::Policy(
                "buffer full and flush could not make room for a non-droppable event".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl IngestionPolicy for BufferedPolicy {
    async fn ingest_event(&mut self, envelope: Envelope) -> Result<()> {
        self.stats.events_received += 1;
        self.metrics.event_received();

        if self.is_full() {
            if envelope.event_type.is_droppable() {
                self.stats.events_dropped += 1;
                *self
                    .stats
                    .dropped_by_type
                    .entry(envelope.event_type.as_str().to_string())
                    .or_insert(0) += 1;
                self.metrics.event_dropped(envelope.event_type);
                trace!(event_type = %envelope.event_type, seq = envelope.seq, "dropped on full buffer");
                return Ok(());
            }
            self.make_room().await?;
        }

        let weight = serde_json::to_vec(&envelope)
            .map_err(|err| CoreError::Policy(format!("unencodable envelope: {err}")))?
            .len();
        self.buffered_bytes += weight;
        self.events.push_back((envelope, weight));
        Ok(())
    }

    async fn ingest_chunk(&mut self, chunk: ArtifactChunk) -> Result<()> {
        self.stats.chunks_received += 1;
        self.metrics.chunk_received(chunk.data.len() as u64);

        if self.is_full() {
            self.make_room().await?;
        }
        self.buffered_bytes += chunk.data.len();
        self.chunks.push_back(chunk);
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.perform_flush(FlushTrigger::Count).await
    }

    async fn close(&mut self) -> Result<()> {
        self.perform_flush(FlushTrigger::Close).await
    }

    fn stats(&self) -> PolicyStats {
        self.stats.clone()
    }
}
