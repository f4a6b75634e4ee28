//! Artifact reassembly state.
//!
//! Tracks per-artifact chunk progress across a run, enforcing the chunk
//! ordering and size invariants, and distinguishing committed artifacts from
//! orphans. The tracker validates; the caller forwards accepted chunks and
//! commit events to the ingestion policy, which preserves the
//! chunks-before-commit write ordering in the sink.

use std::collections::HashMap;

use serde::Serialize;
use tracing::warn;

use quarry_model::{ArtifactChunk, ArtifactPayload};

use crate::error::{CoreError, Result};

#[derive(Debug, Default)]
struct ArtifactState {
    next_expected_seq: u64,
    chunks_received: u64,
    total_bytes: u64,
    /// The `is_last` chunk has been seen.
    complete: bool,
    committed: bool,
    error_state: bool,
}

/// Run-level artifact statistics for the exit report.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct ArtifactStats {
    pub total: u64,
    pub committed: u64,
    pub orphaned: u64,
    pub chunks: u64,
    pub total_bytes: u64,
}

/// Reassembles chunked artifacts and enforces their invariants.
#[derive(Debug, Default)]
pub struct ArtifactTracker {
    artifacts: HashMap<String, ArtifactState>,
}

impl ArtifactTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and account one chunk. Chunk seq must be exactly the next
    /// expected value for its artifact; chunks after `is_last` or after the
    /// commit are invariant violations that fail the run.
    pub fn accept_chunk(&mut self, chunk: &ArtifactChunk) -> Result<()> {
        chunk
            .validate()
            .map_err(|err| CoreError::Artifact(err.to_string()))?;

        let state = self
            .artifacts
            .entry(chunk.artifact_id.clone())
            .or_insert_with(|| ArtifactState {
                next_expected_seq: 1,
                ..ArtifactState::default()
            });

        if state.committed {
            state.error_state = true;
            return Err(CoreError::Artifact(format!(
                "artifact {} received chunk seq {} after its commit",
                chunk.artifact_id, chunk.seq
            )));
        }
        if state.complete {
            state.error_state = true;
            return Err(CoreError::Artifact(format!(
                "artifact {} received chunk seq {} after is_last",
                chunk.artifact_id, chunk.seq
            )));
        }
        if chunk.seq != state.next_expected_seq {
            state.error_state = true;
            return Err(CoreError::Artifact(format!(
                "artifact {} chunk seq {} out of order, expected {}",
                chunk.artifact_id, chunk.seq, state.next_expected_seq
            )));
        }

        state.next_expected_seq += 1;
        state.chunks_received += 1;
        state.total_bytes += chunk.data.len() as u64;
        if chunk.is_last {
            state.complete = true;
        }
        Ok(())
    }

    /// Validate and account an artifact commit event. Fails on duplicate
    /// commits and on a size mismatch against the accumulated chunk bytes.
    pub fn accept_commit(&mut self, payload: &ArtifactPayload) -> Result<()> {
        let state = self
            .artifacts
            .entry(payload.artifact_id.clone())
            .or_insert_with(|| ArtifactState {
                next_expected_seq: 1,
                ..ArtifactState::default()
            });

        if state.committed {
            state.error_state = true;
            return Err(CoreError::Artifact(format!(
                "artifact {} committed twice",
                payload.artifact_id
            )));
        }
        if state.chunks_received > 0 && state.total_bytes != payload.size_bytes {
            state.error_state = true;
            return Err(CoreError::Artifact(format!(
                "artifact {} commit declares {} bytes but {} chunk bytes arrived",
                payload.artifact_id, payload.size_bytes, state.total_bytes
            )));
        }
        if state.chunks_received > 0 && !state.complete {
            state.error_state = true;
            return Err(CoreError::Artifact(format!(
                "artifact {} committed before its is_last chunk",
                payload.artifact_id
            )));
        }

        state.committed = true;
        Ok(())
    }

    /// Statistics over everything seen so far. Orphans are artifacts with
    /// chunk bytes on disk but no commit; their chunk records stay persisted
    /// and downstream readers spot them by the missing commit record.
    pub fn stats(&self) -> ArtifactStats {
        let mut stats = ArtifactStats::default();
        for (id, state) in &self.artifacts {
            stats.total += 1;
            stats.chunks += state.chunks_received;
            stats.total_bytes += state.total_bytes;
            if state.committed {
                stats.committed += 1;
            } else if state.chunks_received > 0 {
                stats.orphaned += 1;
                warn!(artifact_id = %id, chunks = state.chunks_received, "artifact never committed");
            }
        }
        stats
    }
}
