use quarry_model::RunOutcome;
use thiserror::Error;

use crate::sink::StorageError;

/// Errors surfaced by the core runtime. The orchestrator is the sole place
/// that maps these onto a run outcome.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("worker spawn failed: {0}")]
    Spawn(#[source] std::io::Error),

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error("artifact invariant violated: {0}")]
    Artifact(String),

    #[error("ingest protocol violated: {0}")]
    Protocol(String),

    #[error("policy failure: {0}")]
    Policy(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("envelope contract_version {found} does not match supported version {expected}")]
    VersionMismatch { expected: u32, found: u32 },
}

impl CoreError {
    /// The outcome this error implies when it aborts a run. IPC breakage with
    /// no terminal event reads as an executor crash; everything ingest-side is
    /// a policy failure.
    pub fn implied_outcome(&self) -> RunOutcome {
        match self {
            CoreError::VersionMismatch { .. } => RunOutcome::VersionMismatch,
            CoreError::Ipc(_) | CoreError::Spawn(_) => RunOutcome::ExecutorCrash,
            CoreError::Artifact(_)
            | CoreError::Protocol(_)
            | CoreError::Policy(_)
            | CoreError::Storage(_) => RunOutcome::PolicyFailure,
            // Configuration errors fail before spawn and never classify a run.
            CoreError::Config(_) => RunOutcome::PolicyFailure,
        }
    }
}

/// Stream-level failures from the frame codec. All are fatal to the run; the
/// codec never resynchronizes.
#[derive(Error, Debug)]
pub enum IpcError {
    #[error("stream ended mid-frame after {got} of {want} bytes")]
    Truncated { got: usize, want: usize },

    #[error("declared frame length {declared} exceeds the {max} byte cap")]
    Oversized { declared: usize, max: usize },

    #[error("frame payload is not a decodable msgpack map: {0}")]
    Decode(String),

    #[error("io error on frame stream: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
