//! Run metrics.
//!
//! Hot-path counters are lock-free atomics; the dropped-by-type map sits
//! behind a std mutex because drops are the cold path. A snapshot is taken
//! once at run end and persisted through the sink.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use quarry_model::EventType;

/// Shared counter set for one run.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    events_received: AtomicU64,
    events_persisted: AtomicU64,
    events_dropped: AtomicU64,
    chunks_received: AtomicU64,
    chunks_persisted: AtomicU64,
    chunk_bytes: AtomicU64,
    files_written: AtomicU64,
    file_bytes: AtomicU64,
    file_write_failures: AtomicU64,
    acks_sent: AtomicU64,
    flushes_count: AtomicU64,
    flushes_interval: AtomicU64,
    flushes_close: AtomicU64,
    dropped_by_type: Mutex<HashMap<&'static str, u64>>,
}

/// Which trigger fired a flush. Only the streaming policy distinguishes the
/// first two; buffered close-flushes count under `Close`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Count,
    Interval,
    Close,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn events_persisted(&self, n: u64) {
        self.events_persisted.fetch_add(n, Ordering::Relaxed);
    }

    pub fn event_dropped(&self, event_type: EventType) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
        let mut map = self.dropped_by_type.lock().expect("metrics mutex poisoned");
        *map.entry(event_type.as_str()).or_insert(0) += 1;
    }

    pub fn chunk_received(&self, bytes: u64) {
        self.chunks_received.fetch_add(1, Ordering::Relaxed);
        self.chunk_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn chunks_persisted(&self, n: u64) {
        self.chunks_persisted.fetch_add(n, Ordering::Relaxed);
    }

    pub fn file_written(&self, bytes: u64) {
        self.files_written.fetch_add(1, Ordering::Relaxed);
        self.file_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn file_write_failed(&self) {
        self.file_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ack_sent(&self) {
        self.acks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn flush(&self, trigger: FlushTrigger) {
        let counter = match trigger {
            FlushTrigger::Count => &self.flushes_count,
            FlushTrigger::Interval => &self.flushes_interval,
            FlushTrigger::Close => &self.flushes_close,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let dropped_by_type = self
            .dropped_by_type
            .lock()
            .expect("metrics mutex poisoned")
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();
        MetricsSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            events_persisted: self.events_persisted.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            chunks_persisted: self.chunks_persisted.load(Ordering::Relaxed),
            chunk_bytes: self.chunk_bytes.load(Ordering::Relaxed),
            files_written: self.files_written.load(Ordering::Relaxed),
            file_bytes: self.file_bytes.load(Ordering::Relaxed),
            file_write_failures: self.file_write_failures.load(Ordering::Relaxed),
            acks_sent: self.acks_sent.load(Ordering::Relaxed),
            flushes_count: self.flushes_count.load(Ordering::Relaxed),
            flushes_interval: self.flushes_interval.load(Ordering::Relaxed),
            flushes_close: self.flushes_close.load(Ordering::Relaxed),
            dropped_by_type,
        }
    }
}

/// Serializable copy of the run counters, persisted via the sink at run end
/// and embedded in the exit report.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub events_received: u64,
    pub events_persisted: u64,
    pub events_dropped: u64,
    pub chunks_received: u64,
    pub chunks_persisted: u64,
    pub chunk_bytes: u64,
    pub files_written: u64,
    pub file_bytes: u64,
    pub file_write_failures: u64,
    pub acks_sent: u64,
    pub flushes_count: u64,
    pub flushes_interval: u64,
    pub flushes_close: u64,
    pub dropped_by_type: HashMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let metrics = MetricsCollector::new();
        metrics.event_received();
        metrics.event_received();
        metrics.events_persisted(2);
        metrics.event_dropped(EventType::Log);
        metrics.event_dropped(EventType::Log);
        metrics.event_dropped(EventType::Enqueue);
        metrics.chunk_received(128);
        metrics.flush(FlushTrigger::Count);
        metrics.flush(FlushTrigger::Close);

        let snap = metrics.snapshot();
        assert_eq!(snap.events_received, 2);
        assert_eq!(snap.events_persisted, 2);
        assert_eq!(snap.events_dropped, 3);
        assert_eq!(snap.dropped_by_type.get("log"), Some(&2));
        assert_eq!(snap.dropped_by_type.get("enqueue"), Some(&1));
        assert_eq!(snap.chunks_received, 1);
        assert_eq!(snap.chunk_bytes, 128);
        assert_eq!(snap.flushes_count, 1);
        assert_eq!(snap.flushes_close, 1);
    }
}
