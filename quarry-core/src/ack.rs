//! File-write acknowledgements.
//!
//! A single writer task owns the worker's stdin and serializes one framed
//! msgpack ack per queue entry. The queue is bounded: a worker that drains
//! acks slowly backpressures the file-write path instead of growing memory.
//! If the worker closes its stdin early, undelivered acks are dropped and
//! outstanding file writes become fire-and-forget; the sink result stays
//! authoritative for the run outcome.

use std::sync::Arc;

use serde::Serialize;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use quarry_model::FileWriteAck;

use crate::codec::FrameWriter;
use crate::metrics::MetricsCollector;

/// Bounded depth of the ack queue.
const ACK_QUEUE_DEPTH: usize = 64;

/// Producer half handed to the reader loop.
#[derive(Debug, Clone)]
pub struct AckSender {
    tx: mpsc::Sender<FileWriteAck>,
}

impl AckSender {
    /// Enqueue one ack. Suspends while the queue is full; returns once the
    /// writer task owns the entry. A closed queue means the writer already
    /// gave up on the worker's stdin, and the ack is dropped silently.
    pub async fn send(&self, ack: FileWriteAck) {
        if self.tx.send(ack).await.is_err() {
            trace!("ack writer gone, dropping ack");
        }
    }
}

/// Wire shape of one ack frame.
#[derive(Debug, Serialize)]
struct AckWire<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    write_id: u32,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

/// The stdin-owning writer task.
#[derive(Debug)]
pub struct AckWriter;

impl AckWriter {
    /// Spawn the writer over the worker's stdin. The task exits when every
    /// sender is dropped and the queue drains.
    pub fn spawn<W>(stdin: W, metrics: Arc<MetricsCollector>) -> (AckSender, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<FileWriteAck>(ACK_QUEUE_DEPTH);
        let handle = tokio::spawn(async move {
            let mut writer = FrameWriter::new(stdin);
            let mut stdin_open = true;
            while let Some(ack) = rx.recv().await {
                if !stdin_open {
                    // Keep draining so producers never block on a dead pipe.
                    trace!(write_id = ack.write_id, "dropping ack, worker stdin closed");
                    continue;
                }
                let wire = AckWire {
                    kind: "file_write_ack",
                    write_id: ack.write_id,
                    ok: ack.ok,
                    error: ack.error.as_deref(),
                };
                match writer.write_frame(&wire).await {
                    Ok(()) => {
                        metrics.ack_sent();
                        trace!(write_id = ack.write_id, ok = ack.ok, "ack written");
                    }
                    Err(err) => {
                        debug!(write_id = ack.write_id, error = %err, "worker stdin closed, remaining acks dropped");
                        stdin_open = false;
                    }
                }
            }
        });
        (AckSender { tx }, handle)
    }
}
