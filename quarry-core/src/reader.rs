//! The IPC reader loop.
//!
//! Consumes frames from the worker's stdout, enforces stream-level
//! invariants (event seq contiguity, contract version, single terminal),
//! and dispatches: artifact chunks and commits through the tracker, file
//! writes through the sink's file path with an ack per write, everything
//! else into the ingestion policy. The trailing `run_result` control frame
//! is captured for the orchestrator and consumes no seq.

use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use quarry_model::{Envelope, EventType, FileWriteAck, RunResult, CONTRACT_VERSION};

use crate::ack::AckSender;
use crate::artifact::ArtifactTracker;
use crate::codec::{FrameReader, WorkerFrame};
use crate::error::CoreError;
use crate::metrics::MetricsCollector;
use crate::policy::IngestionPolicy;
use crate::sink::SharedSink;

/// What the reader loop saw before it stopped. `error` is the fatal
/// condition that ended the loop early, if any; the orchestrator folds it
/// into the outcome classification.
#[derive(Debug, Default)]
pub struct ReaderOutcome {
    pub terminal: Option<Envelope>,
    pub run_result: Option<RunResult>,
    pub events_seen: u64,
    pub cancelled: bool,
    pub error: Option<CoreError>,
}

/// Run the reader loop to stream end, fatal error, or cancellation.
#[allow(clippy::too_many_arguments)]
pub async fn run_reader<R>(
    stream: R,
    tracker: &mut ArtifactTracker,
    policy: &mut dyn IngestionPolicy,
    sink: &SharedSink,
    acks: &AckSender,
    metrics: &MetricsCollector,
    cancel: &CancellationToken,
) -> ReaderOutcome
where
    R: AsyncRead + Unpin,
{
    let mut reader = FrameReader::new(stream);
    let mut state = ReaderState::default();
    let mut outcome = ReaderOutcome::default();

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("reader cancelled");
                outcome.cancelled = true;
                break;
            }
            frame = reader.next_frame() => frame,
        };
        match frame {
            Ok(Some(frame)) => {
                if let Err(err) =
                    dispatch(frame, &mut state, &mut outcome, tracker, policy, sink, acks, metrics)
                        .await
                {
                    outcome.error = Some(err);
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                outcome.error = Some(CoreError::Ipc(err));
                break;
            }
        }
    }
    outcome
}

#[derive(Debug, Default)]
struct ReaderState {
    next_seq: u64,
    last_write_id: u32,
}

#[allow(clippy::too_many_arguments)]
async fn dispatch(
    frame: WorkerFrame,
    state: &mut ReaderState,
    outcome: &mut ReaderOutcome,
    tracker: &mut ArtifactTracker,
    policy: &mut dyn IngestionPolicy,
    sink: &SharedSink,
    acks: &AckSender,
    metrics: &MetricsCollector,
) -> crate::error::Result<()> {
    match frame {
        WorkerFrame::Event(envelope) => {
            envelope
                .validate()
                .map_err(|err| CoreError::Protocol(err.to_string()))?;
            if envelope.contract_version != CONTRACT_VERSION {
                return Err(CoreError::VersionMismatch {
                    expected: CONTRACT_VERSION,
                    found: envelope.contract_version,
                });
            }
            if outcome.terminal.is_some() {
                return Err(CoreError::Protocol(format!(
                    "event {} (seq {}) arrived after the terminal event",
                    envelope.event_id, envelope.seq
                )));
            }
            let expected = state.next_seq + 1;
            if envelope.seq != expected {
                return Err(CoreError::Protocol(format!(
                    "event seq {} out of order, expected {expected}",
                    envelope.seq
                )));
            }
            state.next_seq = envelope.seq;
            outcome.events_seen += 1;

            if envelope.event_type == EventType::Artifact {
                let payload = envelope
                    .artifact_payload()
                    .map_err(|err| CoreError::Protocol(err.to_string()))?;
                tracker.accept_commit(&payload)?;
            }
            if envelope.event_type.is_terminal() {
                outcome.terminal = Some(envelope.clone());
            }
            policy.ingest_event(envelope).await
        }
        WorkerFrame::ArtifactChunk(chunk) => {
            if outcome.terminal.is_some() {
                return Err(CoreError::Protocol(format!(
                    "artifact {} chunk arrived after the terminal event",
                    chunk.artifact_id
                )));
            }
            tracker.accept_chunk(&chunk)?;
            policy.ingest_chunk(chunk).await
        }
        WorkerFrame::FileWrite(write) => {
            if outcome.terminal.is_some() {
                return Err(CoreError::Protocol(format!(
                    "file_write {} arrived after the terminal event",
                    write.write_id
                )));
            }
            write
                .validate()
                .map_err(|err| CoreError::Protocol(err.to_string()))?;
            if write.write_id <= state.last_write_id {
                // Redundant delivery is locally recoverable: log, discard.
                warn!(
                    write_id = write.write_id,
                    last = state.last_write_id,
                    "non-monotonic file_write id, discarding"
                );
                return Ok(());
            }
            state.last_write_id = write.write_id;

            let result = sink
                .lock()
                .await
                .write_file(&write.filename, &write.content_type, &write.data)
                .await;
            let ack = match &result {
                Ok(()) => {
                    metrics.file_written(write.data.len() as u64);
                    FileWriteAck {
                        write_id: write.write_id,
                        ok: true,
                        error: None,
                    }
                }
                Err(err) => {
                    metrics.file_write_failed();
                    FileWriteAck {
                        write_id: write.write_id,
                        ok: false,
                        error: Some(err.to_string()),
                    }
                }
            };
            // The ack goes out only after the sink write resolved, and it
            // goes out for failures too; the storage error then fails the
            // run below.
            acks.send(ack).await;
            result.map_err(CoreError::Storage)
        }
        WorkerFrame::RunResult(run_result) => {
            if outcome.run_result.is_some() {
                warn!("duplicate run_result control frame, keeping the first");
            } else {
                outcome.run_result = Some(run_result);
            }
            Ok(())
        }
    }
}
