//! Ingestion policies.
//!
//! A policy decides what to persist when. All three modes share the same
//! guarantees: envelope shape is never modified, per-run order is preserved
//! on persisted events, only droppable types (`log`, `enqueue`,
//! `rotate_proxy`) may ever be dropped, and dropped counts are recorded per
//! type.

mod buffered;
mod streaming;
mod strict;

pub use buffered::{BufferedPolicy, FlushMode};
pub use streaming::{StreamingFlushHandle, StreamingPolicy};
pub use strict::StrictPolicy;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use quarry_model::{ArtifactChunk, Envelope};

use crate::error::{CoreError, Result};
use crate::metrics::MetricsCollector;
use crate::sink::SharedSink;

/// Per-run policy counters, exposed through [`IngestionPolicy::stats`] and
/// embedded in the exit report.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct PolicyStats {
    pub events_received: u64,
    pub events_persisted: u64,
    pub events_dropped: u64,
    pub dropped_by_type: HashMap<String, u64>,
    pub chunks_received: u64,
    pub chunks_persisted: u64,
    pub flushes_count: u64,
    pub flushes_interval: u64,
    pub flushes_close: u64,
}

/// The buffering/durability strategy selected for a run.
#[async_trait]
pub trait IngestionPolicy: Send {
    async fn ingest_event(&mut self, envelope: Envelope) -> Result<()>;

    async fn ingest_chunk(&mut self, chunk: ArtifactChunk) -> Result<()>;

    /// Drain buffered work to the sink. A no-op under strict.
    async fn flush(&mut self) -> Result<()>;

    /// Final flush and teardown. Invoked exactly once, after the reader loop
    /// finishes.
    async fn close(&mut self) -> Result<()>;

    fn stats(&self) -> PolicyStats;
}

/// Resolved policy selection from the run configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyConfig {
    Strict,
    Buffered {
        max_events: Option<usize>,
        max_bytes: Option<usize>,
        flush_mode: FlushMode,
    },
    Streaming {
        flush_count: Option<usize>,
        flush_interval: Option<Duration>,
    },
}

impl PolicyConfig {
    /// Configuration-category validation, checked before any worker spawns.
    pub fn validate(&self) -> Result<()> {
        match self {
            PolicyConfig::Strict => Ok(()),
            PolicyConfig::Buffered {
                max_events,
                max_bytes,
                ..
            } => {
                let events_ok = max_events.is_some_and(|n| n > 0);
                let bytes_ok = max_bytes.is_some_and(|n| n > 0);
                if !events_ok && !bytes_ok {
                    return Err(CoreError::Config(
                        "buffered policy requires buffer_events > 0 or buffer_bytes > 0".into(),
                    ));
                }
                if max_events.is_some_and(|n| n == 0) || max_bytes.is_some_and(|n| n == 0) {
                    return Err(CoreError::Config(
                        "buffered policy bounds must be positive when given".into(),
                    ));
                }
                Ok(())
            }
            PolicyConfig::Streaming {
                flush_count,
                flush_interval,
            } => {
                let count_ok = flush_count.is_some_and(|n| n > 0);
                let interval_ok = flush_interval.is_some_and(|d| !d.is_zero());
                if !count_ok && !interval_ok {
                    return Err(CoreError::Config(
                        "streaming policy requires a flush count and/or a flush interval".into(),
                    ));
                }
                if flush_count.is_some_and(|n| n == 0) {
                    return Err(CoreError::Config("streaming flush count must be positive".into()));
                }
                if flush_interval.is_some_and(|d| d.is_zero()) {
                    return Err(CoreError::Config(
                        "streaming flush interval must be positive".into(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// The interval the orchestrator should tick a flush at, if any.
    pub fn flush_interval(&self) -> Option<Duration> {
        match self {
            PolicyConfig::Streaming { flush_interval, .. } => *flush_interval,
            _ => None,
        }
    }

    /// Build the policy over a shared sink. Streaming additionally yields the
    /// flush handle the orchestrator hands to its ticker task.
    pub fn build(
        &self,
        sink: SharedSink,
        metrics: Arc<MetricsCollector>,
    ) -> (Box<dyn IngestionPolicy>, Option<StreamingFlushHandle>) {
        match self {
            PolicyConfig::Strict => (Box::new(StrictPolicy::new(sink, metrics)), None),
            PolicyConfig::Buffered {
                max_events,
                max_bytes,
                flush_mode,
            } => (
                Box::new(BufferedPolicy::new(
                    sink,
                    metrics,
                    *max_events,
                    *max_bytes,
                    *flush_mode,
                )),
                None,
            ),
            PolicyConfig::Streaming { flush_count, .. } => {
                let policy = StreamingPolicy::new(sink, metrics, *flush_count);
                let handle = policy.flush_handle();
                (Box::new(policy), Some(handle))
            }
        }
    }
}
