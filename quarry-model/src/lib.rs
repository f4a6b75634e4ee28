//! Core data model definitions shared across Quarry crates.
#![allow(missing_docs)]

pub mod envelope;
pub mod error;
pub mod frames;
pub mod outcome;
pub mod prelude;
pub mod record;
pub mod run;

// Intentionally curated re-exports for downstream consumers.
pub use envelope::{
    ArtifactPayload, CheckpointPayload, EnqueuePayload, Envelope, EventType,
    ItemPayload, LogLevel, LogPayload, RotateProxyPayload, RunCompletePayload,
    RunErrorPayload, CONTRACT_VERSION,
};
pub use error::{ModelError, Result as ModelResult};
pub use frames::{
    ArtifactChunk, FileWrite, FileWriteAck, RunResult, RunResultOutcome,
    RunResultStatus, MAX_CHUNK_DATA_BYTES, MAX_FRAME_BYTES,
};
pub use outcome::{RunOutcome, EXIT_EXECUTOR_CRASH, EXIT_POLICY_FAILURE, EXIT_SCRIPT_ERROR, EXIT_SUCCESS};
pub use record::{ChunkRecord, PartitionKey, RecordKind, StoredRecord};
pub use run::RunMeta;
