//! Structured storage errors.
//!
//! Every sink failure carries the operation, the path it touched, and a kind
//! derived first from typed error interfaces and then from known provider
//! message patterns. Callers use the kind to decide whether a run outcome is
//! a policy failure; nothing at this layer retries.

use thiserror::Error;

/// Failure categories for storage writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    PermissionDenied,
    NotFound,
    DiskFull,
    Timeout,
    RateLimited,
    AuthFailed,
    AccessDenied,
    Network,
    Other,
}

impl StorageErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageErrorKind::PermissionDenied => "permission-denied",
            StorageErrorKind::NotFound => "not-found",
            StorageErrorKind::DiskFull => "disk-full",
            StorageErrorKind::Timeout => "timeout",
            StorageErrorKind::RateLimited => "rate-limited",
            StorageErrorKind::AuthFailed => "auth-failed",
            StorageErrorKind::AccessDenied => "access-denied",
            StorageErrorKind::Network => "network",
            StorageErrorKind::Other => "other",
        }
    }
}

impl std::fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified storage failure. The message always carries both the
/// operation and the path.
#[derive(Error, Debug)]
#[error("storage {kind} during {operation} at {path}: {source}")]
pub struct StorageError {
    pub kind: StorageErrorKind,
    pub operation: &'static str,
    pub path: String,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

impl StorageError {
    /// Wrap an io error, classifying by [`std::io::ErrorKind`] first and the
    /// message second.
    pub fn io(operation: &'static str, path: impl Into<String>, err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
            std::io::ErrorKind::NotFound => StorageErrorKind::NotFound,
            std::io::ErrorKind::TimedOut => StorageErrorKind::Timeout,
            std::io::ErrorKind::StorageFull | std::io::ErrorKind::QuotaExceeded => {
                StorageErrorKind::DiskFull
            }
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::HostUnreachable
            | std::io::ErrorKind::NetworkUnreachable
            | std::io::ErrorKind::NetworkDown => StorageErrorKind::Network,
            _ => classify_message(&err.to_string()),
        };
        Self {
            kind,
            operation,
            path: path.into(),
            source: Box::new(err),
        }
    }

    /// Wrap an object-store error, classifying typed variants first and the
    /// provider message second.
    pub fn object(
        operation: &'static str,
        path: impl Into<String>,
        err: object_store::Error,
    ) -> Self {
        let kind = match &err {
            object_store::Error::NotFound { .. } => StorageErrorKind::NotFound,
            object_store::Error::Unauthenticated { .. } => StorageErrorKind::AuthFailed,
            // 403-style responses surface here, not as filesystem permissions.
            object_store::Error::PermissionDenied { .. } => StorageErrorKind::AccessDenied,
            _ => classify_message(&err.to_string()),
        };
        Self {
            kind,
            operation,
            path: path.into(),
            source: Box::new(err),
        }
    }

    /// Wrap an already-classified failure.
    pub fn new(
        kind: StorageErrorKind,
        operation: &'static str,
        path: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            operation,
            path: path.into(),
            source: Box::new(source),
        }
    }

    /// Wrap a serialization failure that occurred while staging a record.
    pub fn encode(
        operation: &'static str,
        path: impl Into<String>,
        err: serde_json::Error,
    ) -> Self {
        Self {
            kind: StorageErrorKind::Other,
            operation,
            path: path.into(),
            source: Box::new(err),
        }
    }
}

/// Pattern classification over provider messages. Order matters: access
/// denied is checked before permission denied so 403-style responses classify
/// as access-denied rather than the filesystem flavor.
pub fn classify_message(message: &str) -> StorageErrorKind {
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("access denied") || lowered.contains("accessdenied") {
        return StorageErrorKind::AccessDenied;
    }
    if lowered.contains("permission denied") || lowered.contains("forbidden") {
        return StorageErrorKind::PermissionDenied;
    }
    if lowered.contains("invalidaccesskeyid")
        || lowered.contains("signaturedoesnotmatch")
        || lowered.contains("expired token")
        || lowered.contains("invalid credential")
        || lowered.contains("authorization")
    {
        return StorageErrorKind::AuthFailed;
    }
    if lowered.contains("slowdown")
        || lowered.contains("slow down")
        || lowered.contains("too many requests")
        || lowered.contains("rate limit")
        || lowered.contains("throttl")
    {
        return StorageErrorKind::RateLimited;
    }
    if lowered.contains("timed out") || lowered.contains("timeout") {
        return StorageErrorKind::Timeout;
    }
    if lowered.contains("no space left")
        || lowered.contains("disk full")
        || lowered.contains("quota exceeded")
    {
        return StorageErrorKind::DiskFull;
    }
    if lowered.contains("not found") || lowered.contains("no such file") {
        return StorageErrorKind::NotFound;
    }
    if lowered.contains("connection")
        || lowered.contains("network")
        || lowered.contains("dns")
        || lowered.contains("broken pipe")
    {
        return StorageErrorKind::Network;
    }
    StorageErrorKind::Other
}
