//! The run orchestrator.
//!
//! Given a fully resolved run configuration, performs one run: validates,
//! resolves a proxy endpoint, spawns the worker, supervises the per-stream
//! tasks (stderr drain, frame reader, ack writer, streaming flush ticker),
//! flushes the policy on exit, persists the metrics snapshot, and classifies
//! the outcome. Configuration failures surface as errors before any worker
//! spawns; everything after spawn resolves to a summary with an outcome.

mod report;

pub use report::{write_report, TerminalSummary};

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use quarry_model::{EventType, RunMeta, RunOutcome, RunResult};

use crate::ack::AckWriter;
use crate::artifact::{ArtifactStats, ArtifactTracker};
use crate::error::{CoreError, Result};
use crate::metrics::{FlushTrigger, MetricsCollector, MetricsSnapshot};
use crate::policy::{PolicyConfig, PolicyStats};
use crate::proxy::{ProxySelector, SelectRequest};
use crate::reader::run_reader;
use crate::sink::{shared, FsSink, ObjectStoreSink, SharedSink};

/// Bounded stderr capture per worker.
const STDERR_CAP: usize = 64 * 1024;

/// Storage backend selection for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkConfig {
    Filesystem {
        root: PathBuf,
        dataset: String,
    },
    ObjectStore {
        bucket: String,
        prefix: String,
        region: Option<String>,
        endpoint: Option<String>,
        path_style: bool,
        dataset: String,
    },
}

impl SinkConfig {
    fn build(&self, meta: RunMeta) -> Result<SharedSink> {
        match self {
            SinkConfig::Filesystem { root, dataset } => {
                Ok(shared(FsSink::new(root.clone(), meta, dataset.clone())))
            }
            SinkConfig::ObjectStore {
                bucket,
                prefix,
                region,
                endpoint,
                path_style,
                dataset,
            } => Ok(shared(ObjectStoreSink::amazon_s3(
                bucket,
                prefix,
                region.as_deref(),
                endpoint.as_deref(),
                *path_style,
                meta,
                dataset.clone(),
            )?)),
        }
    }
}

/// Everything one run needs, resolved ahead of spawn.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub script_path: PathBuf,
    pub meta: RunMeta,
    pub policy: PolicyConfig,
    pub sink: SinkConfig,
    pub proxy: Option<SelectRequest>,
    pub exit_report_path: Option<PathBuf>,
}

impl RunConfig {
    /// Configuration-category validation. Fails before spawn; no outcome
    /// record is produced for these.
    pub fn validate(&self) -> Result<()> {
        self.meta
            .validate()
            .map_err(|err| CoreError::Config(err.to_string()))?;
        self.policy.validate()?;
        if !self.script_path.is_file() {
            return Err(CoreError::Config(format!(
                "worker script {} does not exist",
                self.script_path.display()
            )));
        }
        Ok(())
    }
}

/// Result structure returned for every spawned run.
#[derive(Debug, Clone, Serialize)]
pub struct RunResultSummary {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub events_seen: u64,
    pub policy: PolicyStats,
    pub artifacts: ArtifactStats,
    pub metrics: MetricsSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal: Option<TerminalSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_result: Option<RunResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// Perform one extraction run.
///
/// The cancellation token kills the worker best-effort, drains in-flight
/// flushes, closes the sink, and classifies `executor_crash` when no
/// terminal frame was observed.
pub async fn run_once(
    config: RunConfig,
    selector: Option<&ProxySelector>,
    cancel: CancellationToken,
) -> Result<RunResultSummary> {
    let started = Instant::now();
    config.validate()?;

    // Resolve the endpoint before spawn; the worker sees the credentialed
    // URL, the run record keeps only the redacted form.
    let selection = match &config.proxy {
        Some(request) => {
            let selector = selector.ok_or_else(|| {
                CoreError::Config("run requests a proxy pool but no pools are loaded".into())
            })?;
            Some(selector.select(request)?)
        }
        None => None,
    };

    let sink = config.sink.build(config.meta.clone())?;
    let metrics = Arc::new(MetricsCollector::new());
    let (mut policy, flush_handle) = config.policy.build(sink.clone(), metrics.clone());
    let mut tracker = ArtifactTracker::new();

    let mut child = spawn_worker(&config, selection.as_ref().map(|s| s.url.as_str()))?;
    info!(
        run_id = %config.meta.run_id,
        script = %config.script_path.display(),
        attempt = config.meta.attempt,
        proxy = selection.as_ref().map(|s| s.redacted.as_str()).unwrap_or("none"),
        "worker spawned"
    );

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| CoreError::Spawn(std::io::Error::other("worker stdout not piped")))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| CoreError::Spawn(std::io::Error::other("worker stdin not piped")))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| CoreError::Spawn(std::io::Error::other("worker stderr not piped")))?;

    let mut stderr_task = tokio::spawn(capture_stderr(stderr));
    let (ack_tx, ack_handle) = AckWriter::spawn(stdin, metrics.clone());

    // Streaming interval ticker. It stops once asked and reports the first
    // flush failure back to the classifier.
    let ticker_cancel = CancellationToken::new();
    let ticker_error: Arc<std::sync::Mutex<Option<CoreError>>> =
        Arc::new(std::sync::Mutex::new(None));
    let ticker = match (flush_handle, config.policy.flush_interval()) {
        (Some(handle), Some(period)) => {
            let stop = ticker_cancel.clone();
            let slot = Arc::clone(&ticker_error);
            Some(tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = interval.tick() => {
                            if let Err(err) = handle.flush(FlushTrigger::Interval).await {
                                error!(error = %err, "interval flush failed");
                                *slot.lock().expect("ticker slot poisoned") = Some(err);
                                break;
                            }
                        }
                    }
                }
            }))
        }
        _ => None,
    };

    let reader_outcome = run_reader(
        stdout,
        &mut tracker,
        policy.as_mut(),
        &sink,
        &ack_tx,
        &metrics,
        &cancel,
    )
    .await;
    drop(ack_tx);

    // Teardown: kill the worker on fatal errors or cancellation, then wait.
    if reader_outcome.error.is_some() || reader_outcome.cancelled {
        if let Err(err) = child.start_kill() {
            debug!(error = %err, "worker kill failed, likely already exited");
        }
    }
    let status = child.wait().await;
    // A worker that leaked its stderr fd to a grandchild could hold the pipe
    // open indefinitely; the capture is bounded in time as well as size.
    let stderr_text =
        match tokio::time::timeout(std::time::Duration::from_secs(5), &mut stderr_task).await {
            Ok(text) => text.unwrap_or_default(),
            Err(_) => {
                stderr_task.abort();
                String::from("[stderr drain timed out]")
            }
        };

    // Stop the ticker and let any in-flight flush drain to completion.
    ticker_cancel.cancel();
    if let Some(handle) = ticker {
        let _ = handle.await;
    }
    let _ = ack_handle.await;

    let close_result = policy.close().await;

    let snapshot = metrics.snapshot();
    let sink_end = {
        let mut guard = sink.lock().await;
        let metrics_write = guard.write_metrics(&snapshot, Utc::now()).await;
        let close = guard.close().await;
        metrics_write.and(close)
    };

    // Classification. Precedence: version_mismatch > policy_failure >
    // executor_crash > script_error > success.
    let mut outcome = RunOutcome::Success;
    let mut failure: Option<String> = None;
    let terminal_type = reader_outcome.terminal.as_ref().map(|env| env.event_type);

    if terminal_type == Some(EventType::RunError) {
        outcome = outcome.merge(RunOutcome::ScriptError);
    }
    match &status {
        Ok(st) if st.success() => {
            if terminal_type.is_none() && reader_outcome.error.is_none() {
                // Clean exit without a terminal event is still a crash.
                outcome = outcome.merge(RunOutcome::ExecutorCrash);
            }
        }
        Ok(st) => {
            if terminal_type.is_none() {
                let merged = if st.code().is_some() {
                    RunOutcome::ScriptError
                } else {
                    RunOutcome::ExecutorCrash
                };
                outcome = outcome.merge(merged);
            }
        }
        Err(err) => {
            warn!(error = %err, "could not reap worker");
            outcome = outcome.merge(RunOutcome::ExecutorCrash);
        }
    }
    if reader_outcome.cancelled && terminal_type.is_none() {
        outcome = outcome.merge(RunOutcome::ExecutorCrash);
    }
    if let Some(err) = &reader_outcome.error {
        // An IPC break after the terminal event leaves the terminal
        // classification in charge; every other fatal error merges.
        let after_terminal_ipc =
            matches!(err, CoreError::Ipc(_)) && terminal_type.is_some();
        if !after_terminal_ipc {
            outcome = outcome.merge(err.implied_outcome());
            failure = Some(err.to_string());
        }
    }
    if let Some(err) = ticker_error.lock().expect("ticker slot poisoned").take() {
        outcome = outcome.merge(RunOutcome::PolicyFailure);
        failure.get_or_insert(err.to_string());
    }
    if let Err(err) = &close_result {
        outcome = outcome.merge(RunOutcome::PolicyFailure);
        failure.get_or_insert(err.to_string());
    }
    if let Err(err) = &sink_end {
        outcome = outcome.merge(RunOutcome::PolicyFailure);
        failure.get_or_insert(err.to_string());
    }

    let summary = RunResultSummary {
        run_id: config.meta.run_id,
        outcome,
        exit_code: outcome.exit_code(),
        duration_ms: started.elapsed().as_millis() as u64,
        events_seen: reader_outcome.events_seen,
        policy: policy.stats(),
        artifacts: tracker.stats(),
        metrics: snapshot,
        terminal: reader_outcome
            .terminal
            .as_ref()
            .map(TerminalSummary::from_envelope),
        worker_result: reader_outcome.run_result,
        proxy: selection.map(|s| s.redacted),
        stderr: stderr_text,
        failure,
    };

    info!(
        run_id = %summary.run_id,
        outcome = %summary.outcome,
        events = summary.events_seen,
        dropped = summary.policy.events_dropped,
        artifacts = summary.artifacts.total,
        duration_ms = summary.duration_ms,
        "run finished"
    );

    if let Some(path) = &config.exit_report_path {
        if let Err(err) = write_report(path, &summary).await {
            warn!(path = %path.display(), error = %err, "exit report not written");
        }
    }

    Ok(summary)
}

fn spawn_worker(config: &RunConfig, proxy_url: Option<&str>) -> Result<tokio::process::Child> {
    let meta = &config.meta;
    let job_json = serde_json::to_string(&meta.job_payload)
        .map_err(|err| CoreError::Config(format!("unencodable job payload: {err}")))?;

    let mut cmd = Command::new(&config.script_path);
    cmd.arg("--run-id")
        .arg(meta.run_id.to_string())
        .arg("--attempt")
        .arg(meta.attempt.to_string())
        .arg("--source")
        .arg(&meta.source)
        .arg("--category")
        .arg(&meta.category)
        .arg("--job")
        .arg(job_json);
    if let Some(job_id) = &meta.job_id {
        cmd.arg("--job-id").arg(job_id);
    }
    if let Some(parent) = &meta.parent_run_id {
        cmd.arg("--parent-run-id").arg(parent.to_string());
    }
    if let Some(url) = proxy_url {
        cmd.env("QUARRY_PROXY_URL", url);
    }
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    cmd.spawn().map_err(CoreError::Spawn)
}

/// Drain worker stderr into a bounded buffer. Overflow truncates and keeps
/// draining so the worker never blocks on a full pipe.
async fn capture_stderr(stderr: tokio::process::ChildStderr) -> String {
    let mut stderr = stderr;
    let mut captured: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    let mut truncated = false;
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if captured.len() < STDERR_CAP {
                    let room = STDERR_CAP - captured.len();
                    let take = room.min(n);
                    captured.extend_from_slice(&chunk[..take]);
                    if take < n {
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            }
            Err(err) => {
                debug!(error = %err, "stderr drain stopped");
                break;
            }
        }
    }
    let mut text = String::from_utf8_lossy(&captured).into_owned();
    if truncated {
        warn!("worker stderr exceeded {STDERR_CAP} bytes, truncated");
        text.push_str("\n[stderr truncated]");
    }
    text
}
