//! Shared fixtures for the integration tests: a recording sink with failure
//! injection, envelope builders, and a byte-level frame script builder that
//! plays the worker side of the wire.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use quarry_core::codec::encode_msgpack;
use quarry_core::{MetricsSnapshot, StorageError, StorageErrorKind, StorageSink};
use quarry_model::{
    ArtifactChunk, Envelope, EventType, RunMeta, RunResultStatus, CONTRACT_VERSION,
};

/// One observed sink operation, reduced to what assertions need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkOp {
    /// Event seqs, in write order.
    Events(Vec<u64>),
    /// (artifact_id, chunk seq, byte length) per chunk, in write order.
    Chunks(Vec<(String, u64, usize)>),
    File {
        filename: String,
        content_type: String,
        bytes: usize,
    },
    Metrics,
    Close,
}

#[derive(Debug, Default)]
pub struct RecordingState {
    pub ops: Vec<SinkOp>,
    /// 1-based write_events call number to fail once.
    pub fail_events_at: Option<usize>,
    /// 1-based write_chunks call number to fail once.
    pub fail_chunks_at: Option<usize>,
    pub fail_files: bool,
    pub events_calls: usize,
    pub chunks_calls: usize,
}

impl RecordingState {
    /// Every event seq that reached the sink, flattened in write order.
    pub fn event_seqs(&self) -> Vec<u64> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                SinkOp::Events(seqs) => Some(seqs.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn chunk_rows(&self) -> Vec<(String, u64, usize)> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                SinkOp::Chunks(rows) => Some(rows.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

/// In-memory sink that records operation order and can fail on demand.
#[derive(Debug)]
pub struct RecordingSink {
    state: Arc<Mutex<RecordingState>>,
}

impl RecordingSink {
    pub fn new() -> (Self, Arc<Mutex<RecordingState>>) {
        let state = Arc::new(Mutex::new(RecordingState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            state,
        )
    }

    fn injected_failure(operation: &'static str) -> StorageError {
        StorageError::new(
            StorageErrorKind::DiskFull,
            operation,
            "mem://recording",
            std::io::Error::new(std::io::ErrorKind::StorageFull, "injected failure"),
        )
    }
}

#[async_trait]
impl StorageSink for RecordingSink {
    async fn write_events(&mut self, events: &[Envelope]) -> Result<(), StorageError> {
        let mut state = self.state.lock().expect("recording state");
        state.events_calls += 1;
        if state.fail_events_at == Some(state.events_calls) {
            return Err(Self::injected_failure("write_events"));
        }
        let seqs = events.iter().map(|env| env.seq).collect();
        state.ops.push(SinkOp::Events(seqs));
        Ok(())
    }

    async fn write_chunks(&mut self, chunks: &[ArtifactChunk]) -> Result<(), StorageError> {
        let mut state = self.state.lock().expect("recording state");
        state.chunks_calls += 1;
        if state.fail_chunks_at == Some(state.chunks_calls) {
            return Err(Self::injected_failure("write_chunks"));
        }
        let rows = chunks
            .iter()
            .map(|chunk| (chunk.artifact_id.clone(), chunk.seq, chunk.data.len()))
            .collect();
        state.ops.push(SinkOp::Chunks(rows));
        Ok(())
    }

    async fn write_file(
        &mut self,
        filename: &str,
        content_type: &str,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock().expect("recording state");
        if state.fail_files {
            return Err(Self::injected_failure("write_file"));
        }
        state.ops.push(SinkOp::File {
            filename: filename.to_string(),
            content_type: content_type.to_string(),
            bytes: data.len(),
        });
        Ok(())
    }

    async fn write_metrics(
        &mut self,
        _snapshot: &MetricsSnapshot,
        _completed_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.state
            .lock()
            .expect("recording state")
            .ops
            .push(SinkOp::Metrics);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StorageError> {
        self.state
            .lock()
            .expect("recording state")
            .ops
            .push(SinkOp::Close);
        Ok(())
    }
}

pub fn run_meta() -> RunMeta {
    RunMeta::new("shop", "default")
}

pub fn envelope(meta: &RunMeta, seq: u64, event_type: EventType) -> Envelope {
    let payload = match event_type {
        EventType::Item => json!({"item_type": "listing", "data": {"n": seq}}),
        EventType::Log => json!({"level": "info", "message": format!("line {seq}")}),
        EventType::Enqueue => json!({"target": "detail", "params": {"n": seq}}),
        EventType::RotateProxy => json!({"reason": "blocked"}),
        EventType::Checkpoint => json!({"checkpoint_id": format!("cp-{seq}")}),
        EventType::RunError => {
            json!({"error_type": "ScriptRaised", "message": "boom"})
        }
        EventType::RunComplete => json!({"summary": {"pages": seq}}),
        EventType::Artifact => json!({
            "artifact_id": "art-unset",
            "name": "blob",
            "content_type": "application/octet-stream",
            "size_bytes": 0,
        }),
    };
    Envelope {
        contract_version: CONTRACT_VERSION,
        event_id: format!("evt-{seq}"),
        run_id: meta.run_id,
        seq,
        event_type,
        ts: Utc::now(),
        payload,
        job_id: meta.job_id.clone(),
        parent_run_id: meta.parent_run_id,
        attempt: meta.attempt,
    }
}

pub fn artifact_commit(meta: &RunMeta, seq: u64, artifact_id: &str, size_bytes: u64) -> Envelope {
    let mut env = envelope(meta, seq, EventType::Artifact);
    env.payload = json!({
        "artifact_id": artifact_id,
        "name": format!("{artifact_id}.bin"),
        "content_type": "application/octet-stream",
        "size_bytes": size_bytes,
    });
    env
}

#[derive(Serialize)]
struct ChunkWire<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    artifact_id: &'a str,
    seq: u64,
    is_last: bool,
    #[serde(with = "serde_bytes")]
    data: &'a [u8],
}

#[derive(Serialize)]
struct FileWriteWire<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    write_id: u32,
    filename: &'a str,
    content_type: &'a str,
    #[serde(with = "serde_bytes")]
    data: &'a [u8],
}

#[derive(Serialize)]
struct RunResultWire {
    #[serde(rename = "type")]
    kind: &'static str,
    outcome: RunResultOutcomeWire,
}

#[derive(Serialize)]
struct RunResultOutcomeWire {
    status: RunResultStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

/// Builds the byte stream a worker would put on its stdout.
#[derive(Debug, Default)]
pub struct FrameScript {
    buf: Vec<u8>,
}

impl FrameScript {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_payload(&mut self, payload: &[u8]) {
        self.buf
            .extend_from_slice(&(payload.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(payload);
    }

    pub fn event(mut self, envelope: &Envelope) -> Self {
        let payload = encode_msgpack(envelope).expect("encode envelope");
        self.push_payload(&payload);
        self
    }

    pub fn chunk(mut self, artifact_id: &str, seq: u64, is_last: bool, data: &[u8]) -> Self {
        let payload = encode_msgpack(&ChunkWire {
            kind: "artifact_chunk",
            artifact_id,
            seq,
            is_last,
            data,
        })
        .expect("encode chunk");
        self.push_payload(&payload);
        self
    }

    pub fn file_write(
        mut self,
        write_id: u32,
        filename: &str,
        content_type: &str,
        data: &[u8],
    ) -> Self {
        let payload = encode_msgpack(&FileWriteWire {
            kind: "file_write",
            write_id,
            filename,
            content_type,
            data,
        })
        .expect("encode file write");
        self.push_payload(&payload);
        self
    }

    pub fn run_result(mut self, status: RunResultStatus, message: Option<&str>) -> Self {
        let payload = encode_msgpack(&RunResultWire {
            kind: "run_result",
            outcome: RunResultOutcomeWire {
                status,
                message: message.map(str::to_string),
            },
        })
        .expect("encode run result");
        self.push_payload(&payload);
        self
    }

    /// Append raw bytes, for truncation and garbage scenarios.
    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Keep only the first `len` bytes of the script.
    pub fn truncated(mut self, len: usize) -> Self {
        self.buf.truncate(len);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// A fresh `run_id`-keyed uuid so parallel tests never collide.
pub fn unique_id() -> Uuid {
    Uuid::now_v7()
}
