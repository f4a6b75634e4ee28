use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// Maximum total frame size on the wire, length prefix included.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Maximum raw byte payload inside an artifact chunk or file write frame.
pub const MAX_CHUNK_DATA_BYTES: usize = 8 * 1024 * 1024;

/// One chunk of a streamed artifact. Chunk `seq` starts at 1 per artifact and
/// does not consume the event `seq` space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactChunk {
    pub artifact_id: String,
    pub seq: u64,
    pub is_last: bool,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl ArtifactChunk {
    pub fn validate(&self) -> Result<()> {
        if self.artifact_id.is_empty() {
            return Err(ModelError::InvalidFrame("artifact_chunk with empty artifact_id".into()));
        }
        if self.seq == 0 {
            return Err(ModelError::InvalidFrame(format!(
                "artifact {} chunk has seq 0; chunk seq starts at 1",
                self.artifact_id
            )));
        }
        if self.data.len() > MAX_CHUNK_DATA_BYTES {
            return Err(ModelError::InvalidFrame(format!(
                "artifact {} chunk carries {} bytes, above the {} byte cap",
                self.artifact_id,
                self.data.len(),
                MAX_CHUNK_DATA_BYTES
            )));
        }
        Ok(())
    }
}

/// A sidecar file write from the worker. Bypasses event `seq` and the policy
/// pipeline; acknowledged per write over the worker's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileWrite {
    pub write_id: u32,
    pub filename: String,
    pub content_type: String,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl FileWrite {
    pub fn validate(&self) -> Result<()> {
        if self.write_id == 0 {
            return Err(ModelError::InvalidFrame(
                "file_write with write_id 0; write ids start at 1".into(),
            ));
        }
        if self.data.len() > MAX_CHUNK_DATA_BYTES {
            return Err(ModelError::InvalidFrame(format!(
                "file_write {} carries {} bytes, above the {} byte cap",
                self.write_id,
                self.data.len(),
                MAX_CHUNK_DATA_BYTES
            )));
        }
        Ok(())
    }
}

/// Supervisor-to-worker acknowledgement for one file write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileWriteAck {
    pub write_id: u32,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunResultStatus {
    Completed,
    Error,
    Crash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResultOutcome {
    pub status: RunResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Trailing control frame summarizing the worker's own view of the run. Does
/// not consume event `seq`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub outcome: RunResultOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_used: Option<String>,
}
