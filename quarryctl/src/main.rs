//! # quarryctl
//!
//! Configures and supervises one extraction run: resolves run metadata, the
//! ingestion policy, the storage backend, and an optional proxy pool, then
//! spawns the scripted worker and exits with the run outcome's code.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use uuid::Uuid;

use quarry_core::{
    run_once, FlushMode, PolicyConfig, ProxyPool, ProxySelector, ProxyStrategy,
    RunConfig, SelectRequest, SinkConfig,
};
use quarry_model::RunMeta;

/// Exit code for configuration failures. Distinct from the run outcome codes
/// (0..=3); nothing was spawned and no outcome record exists.
const EXIT_CONFIG: i32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StorageBackend {
    Fs,
    S3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PolicyKind {
    Strict,
    Buffered,
    Streaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FlushModeArg {
    AtLeastOnce,
    ChunksFirst,
    TwoPhase,
}

impl From<FlushModeArg> for FlushMode {
    fn from(mode: FlushModeArg) -> Self {
        match mode {
            FlushModeArg::AtLeastOnce => FlushMode::AtLeastOnce,
            FlushModeArg::ChunksFirst => FlushMode::ChunksFirst,
            FlushModeArg::TwoPhase => FlushMode::TwoPhase,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StrategyArg {
    RoundRobin,
    Random,
    Sticky,
}

impl From<StrategyArg> for ProxyStrategy {
    fn from(strategy: StrategyArg) -> Self {
        match strategy {
            StrategyArg::RoundRobin => ProxyStrategy::RoundRobin,
            StrategyArg::Random => ProxyStrategy::Random,
            StrategyArg::Sticky => ProxyStrategy::Sticky,
        }
    }
}

/// Command line arguments for one extraction run.
#[derive(Parser, Debug)]
#[command(name = "quarryctl")]
#[command(about = "Run a scripted extraction worker against partitioned storage")]
struct Args {
    /// Worker script to spawn.
    script: PathBuf,

    /// Run id; generated (UUIDv7) when omitted.
    #[arg(long)]
    run_id: Option<Uuid>,

    /// Logical source feeding the partition layout.
    #[arg(long, env = "QUARRY_SOURCE")]
    source: String,

    /// Partition category.
    #[arg(long, env = "QUARRY_CATEGORY", default_value = "default")]
    category: String,

    /// Attempt number; attempts above 1 require --parent-run-id.
    #[arg(long, default_value_t = 1)]
    attempt: u32,

    /// Stable id of the logical work unit across retries.
    #[arg(long)]
    job_id: Option<String>,

    /// Run id of the previous attempt.
    #[arg(long)]
    parent_run_id: Option<Uuid>,

    /// Job payload handed to the worker, as a JSON object.
    #[arg(long, default_value = "{}")]
    job: String,

    /// Storage backend.
    #[arg(long, value_enum, default_value_t = StorageBackend::Fs)]
    storage: StorageBackend,

    /// Root directory for the fs backend.
    #[arg(long, env = "QUARRY_STORAGE_PATH")]
    storage_path: Option<PathBuf>,

    /// Bucket for the s3 backend.
    #[arg(long)]
    bucket: Option<String>,

    /// Key prefix inside the bucket.
    #[arg(long, default_value = "")]
    prefix: String,

    /// Region for the s3 backend.
    #[arg(long)]
    region: Option<String>,

    /// Custom endpoint for S3-compatible stores.
    #[arg(long)]
    endpoint: Option<String>,

    /// Use path-style addressing against the endpoint.
    #[arg(long)]
    path_style: bool,

    /// Dataset name inside the storage layout.
    #[arg(long, default_value = "quarry")]
    dataset: String,

    /// Ingestion policy.
    #[arg(long, value_enum, default_value_t = PolicyKind::Strict)]
    policy: PolicyKind,

    /// Buffered policy: event-count bound.
    #[arg(long)]
    buffer_events: Option<usize>,

    /// Buffered policy: byte-size bound.
    #[arg(long)]
    buffer_bytes: Option<usize>,

    /// Buffered policy: flush mode.
    #[arg(long, value_enum)]
    flush_mode: Option<FlushModeArg>,

    /// Streaming policy: flush once this many entries are buffered.
    #[arg(long)]
    flush_count: Option<usize>,

    /// Streaming policy: flush every this many milliseconds.
    #[arg(long)]
    flush_interval_ms: Option<u64>,

    /// Proxy pool document (JSON).
    #[arg(long, env = "QUARRY_POOLS")]
    pools: Option<PathBuf>,

    /// Pool to select the outbound endpoint from.
    #[arg(long)]
    proxy_pool: Option<String>,

    /// Override the pool's declared strategy.
    #[arg(long, value_enum)]
    proxy_strategy: Option<StrategyArg>,

    /// Explicit sticky key.
    #[arg(long)]
    sticky_key: Option<String>,

    /// Domain for domain-scoped sticky selection.
    #[arg(long)]
    domain: Option<String>,

    /// Origin (scheme://host:port) for origin-scoped sticky selection.
    #[arg(long)]
    origin: Option<String>,

    /// Write a structured exit report to this path.
    #[arg(long)]
    exit_report: Option<PathBuf>,
}

/// Top-level shape of the proxy pool document.
#[derive(Debug, serde::Deserialize)]
struct PoolDocument {
    pools: Vec<ProxyPool>,
}

fn build_run_config(args: &Args) -> anyhow::Result<RunConfig> {
    let job_payload: serde_json::Value =
        serde_json::from_str(&args.job).context("--job must be a JSON object")?;
    if !job_payload.is_object() {
        anyhow::bail!("--job must be a JSON object, got {job_payload}");
    }

    let mut meta = RunMeta::new(args.source.clone(), args.category.clone());
    if let Some(run_id) = args.run_id {
        meta.run_id = run_id;
    }
    meta.attempt = args.attempt;
    meta.job_id = args.job_id.clone();
    meta.parent_run_id = args.parent_run_id;
    meta.job_payload = job_payload;

    let policy = match args.policy {
        PolicyKind::Strict => PolicyConfig::Strict,
        PolicyKind::Buffered => PolicyConfig::Buffered {
            max_events: args.buffer_events,
            max_bytes: args.buffer_bytes,
            flush_mode: args
                .flush_mode
                .context("buffered policy requires --flush-mode")?
                .into(),
        },
        PolicyKind::Streaming => PolicyConfig::Streaming {
            flush_count: args.flush_count,
            flush_interval: args.flush_interval_ms.map(Duration::from_millis),
        },
    };

    let sink = match args.storage {
        StorageBackend::Fs => SinkConfig::Filesystem {
            root: args
                .storage_path
                .clone()
                .context("fs storage requires --storage-path")?,
            dataset: args.dataset.clone(),
        },
        StorageBackend::S3 => SinkConfig::ObjectStore {
            bucket: args.bucket.clone().context("s3 storage requires --bucket")?,
            prefix: args.prefix.clone(),
            region: args.region.clone(),
            endpoint: args.endpoint.clone(),
            path_style: args.path_style,
            dataset: args.dataset.clone(),
        },
    };

    let proxy = args.proxy_pool.as_ref().map(|pool| SelectRequest {
        pool: pool.clone(),
        strategy_override: args.proxy_strategy.map(Into::into),
        sticky_key: args.sticky_key.clone(),
        domain: args.domain.clone(),
        origin: args.origin.clone(),
        job_id: args.job_id.clone(),
    });

    Ok(RunConfig {
        script_path: args.script.clone(),
        meta,
        policy,
        sink,
        proxy,
        exit_report_path: args.exit_report.clone(),
    })
}

fn load_pools(path: &PathBuf) -> anyhow::Result<ProxySelector> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("reading pool document {}", path.display()))?;
    let document: PoolDocument = serde_json::from_str(&body)
        .with_context(|| format!("parsing pool document {}", path.display()))?;
    let (selector, warnings) = ProxySelector::new(document.pools)
        .with_context(|| format!("validating pool document {}", path.display()))?;
    for warning in warnings {
        warn!(pool = %warning.pool, "{}", warning.message);
    }
    Ok(selector)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quarryctl=info,quarry_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match build_run_config(&args) {
        Ok(config) => config,
        Err(err) => {
            error!("configuration error: {err:#}");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let selector = match &args.pools {
        Some(path) => match load_pools(path) {
            Ok(selector) => Some(selector),
            Err(err) => {
                error!("configuration error: {err:#}");
                std::process::exit(EXIT_CONFIG);
            }
        },
        None => None,
    };

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling run");
            signal_cancel.cancel();
        }
    });

    match run_once(config, selector.as_ref(), cancel).await {
        Ok(summary) => {
            info!(
                run_id = %summary.run_id,
                outcome = %summary.outcome,
                exit_code = summary.exit_code,
                "run complete"
            );
            std::process::exit(summary.exit_code);
        }
        Err(err) => {
            error!("configuration error: {err}");
            std::process::exit(EXIT_CONFIG);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args(extra: &[&str]) -> Args {
        let mut argv = vec![
            "quarryctl",
            "worker.sh",
            "--source",
            "shop",
            "--storage-path",
            "/tmp/lake",
        ];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn defaults_resolve_to_strict_fs_run() {
        let args = base_args(&[]);
        let config = build_run_config(&args).expect("config");
        assert_eq!(config.policy, PolicyConfig::Strict);
        assert_eq!(config.meta.category, "default");
        assert_eq!(config.meta.attempt, 1);
        assert!(config.proxy.is_none());
        match &config.sink {
            SinkConfig::Filesystem { dataset, .. } => assert_eq!(dataset, "quarry"),
            other => panic!("expected fs sink, got {other:?}"),
        }
    }

    #[test]
    fn buffered_requires_flush_mode() {
        let args = base_args(&["--policy", "buffered", "--buffer-events", "64"]);
        assert!(build_run_config(&args).is_err());

        let args = base_args(&[
            "--policy",
            "buffered",
            "--buffer-events",
            "64",
            "--flush-mode",
            "two-phase",
        ]);
        let config = build_run_config(&args).expect("config");
        assert_eq!(
            config.policy,
            PolicyConfig::Buffered {
                max_events: Some(64),
                max_bytes: None,
                flush_mode: FlushMode::TwoPhase,
            }
        );
    }

    #[test]
    fn job_must_be_a_json_object() {
        let args = base_args(&["--job", "[1,2,3]"]);
        assert!(build_run_config(&args).is_err());
    }

    #[test]
    fn proxy_request_carries_job_id_for_sticky_scope() {
        let args = base_args(&[
            "--proxy-pool",
            "residential",
            "--job-id",
            "job-7",
            "--proxy-strategy",
            "sticky",
        ]);
        let config = build_run_config(&args).expect("config");
        let proxy = config.proxy.expect("proxy request");
        assert_eq!(proxy.pool, "residential");
        assert_eq!(proxy.strategy_override, Some(ProxyStrategy::Sticky));
        assert_eq!(proxy.job_id.as_deref(), Some("job-7"));
    }
}
