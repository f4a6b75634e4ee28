use std::fmt::{self, Display};

/// Errors produced by model constructors and validation routines.
#[derive(Debug)]
pub enum ModelError {
    /// Run metadata failed lineage or field validation.
    InvalidRunMeta(String),
    /// An envelope is malformed or its payload lacks required fields.
    InvalidEnvelope(String),
    /// A stream-level frame violates its contract.
    InvalidFrame(String),
}

impl Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::InvalidRunMeta(msg) => write!(f, "invalid run metadata: {msg}"),
            ModelError::InvalidEnvelope(msg) => write!(f, "invalid envelope: {msg}"),
            ModelError::InvalidFrame(msg) => write!(f, "invalid frame: {msg}"),
        }
    }
}

impl std::error::Error for ModelError {}

pub type Result<T> = std::result::Result<T, ModelError>;
