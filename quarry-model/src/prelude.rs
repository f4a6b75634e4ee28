//! Convenience re-exports for consumers that want the whole model surface.

pub use crate::envelope::{
    ArtifactPayload, CheckpointPayload, EnqueuePayload, Envelope, EventType,
    ItemPayload, LogLevel, LogPayload, RotateProxyPayload, RunCompletePayload,
    RunErrorPayload, CONTRACT_VERSION,
};
pub use crate::error::{ModelError, Result as ModelResult};
pub use crate::frames::{
    ArtifactChunk, FileWrite, FileWriteAck, RunResult, RunResultOutcome,
    RunResultStatus, MAX_CHUNK_DATA_BYTES, MAX_FRAME_BYTES,
};
pub use crate::outcome::RunOutcome;
pub use crate::record::{ChunkRecord, PartitionKey, RecordKind, StoredRecord};
pub use crate::run::RunMeta;
