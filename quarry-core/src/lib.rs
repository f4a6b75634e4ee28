//! Quarry core runtime.
//!
//! A single supervising process spawns one scripted worker per run, ingests a
//! strictly ordered stream of events and binary artifact chunks over a framed
//! pipe, applies an ingestion policy, and persists the results into an
//! append-only Hive-partitioned dataset. Sidecar file writes are routed to
//! storage and acknowledged per write; outbound proxy endpoints are selected
//! from declared pools.

pub mod ack;
pub mod artifact;
pub mod codec;
pub mod error;
pub mod metrics;
pub mod policy;
pub mod proxy;
pub mod reader;
pub mod run;
pub mod sink;

pub use ack::{AckSender, AckWriter};
pub use artifact::{ArtifactStats, ArtifactTracker};
pub use error::{CoreError, IpcError, Result};
pub use metrics::{FlushTrigger, MetricsCollector, MetricsSnapshot};
pub use policy::{
    BufferedPolicy, FlushMode, IngestionPolicy, PolicyConfig, PolicyStats,
    StreamingFlushHandle, StreamingPolicy, StrictPolicy,
};
pub use proxy::{
    Endpoint, EndpointSelection, PoolWarning, ProxyPool, ProxyProtocol,
    ProxySelector, ProxyStrategy, SelectRequest, StickyConfig, StickyScope,
};
pub use reader::ReaderOutcome;
pub use run::{run_once, RunConfig, RunResultSummary, SinkConfig, TerminalSummary};
pub use sink::{FsSink, ObjectStoreSink, SharedSink, StorageError, StorageErrorKind, StorageSink};
