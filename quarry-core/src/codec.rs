//! Length-prefixed msgpack frame codec for the worker pipe.
//!
//! Wire format: a 4-byte unsigned big-endian length prefix followed by a
//! msgpack-encoded map. The decoder discriminates frames by peeking the map's
//! `type` field before committing to a full decode.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use quarry_model::{ArtifactChunk, Envelope, FileWrite, RunResult, MAX_FRAME_BYTES};

use crate::error::IpcError;

/// Length prefix size on the wire.
pub const LEN_PREFIX_BYTES: usize = 4;

/// Maximum payload size: the frame cap minus the prefix.
pub const MAX_PAYLOAD_BYTES: usize = MAX_FRAME_BYTES - LEN_PREFIX_BYTES;

/// A decoded worker frame.
#[derive(Debug, Clone)]
pub enum WorkerFrame {
    Event(Envelope),
    ArtifactChunk(ArtifactChunk),
    FileWrite(FileWrite),
    RunResult(RunResult),
}

/// Encode a value as a msgpack map with string keys and human-readable
/// scalar encodings (uuids and timestamps as strings, matching the worker
/// side of the contract).
pub fn encode_msgpack<T: Serialize>(value: &T) -> Result<Vec<u8>, IpcError> {
    let mut buf = Vec::new();
    let mut ser = rmp_serde::Serializer::new(&mut buf)
        .with_struct_map()
        .with_human_readable();
    value
        .serialize(&mut ser)
        .map_err(|err| IpcError::Decode(err.to_string()))?;
    Ok(buf)
}

/// Decode a msgpack map produced by [`encode_msgpack`] or the worker.
pub fn decode_msgpack<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, IpcError> {
    let mut de =
        rmp_serde::Deserializer::new(std::io::Cursor::new(bytes)).with_human_readable();
    T::deserialize(&mut de).map_err(|err| IpcError::Decode(err.to_string()))
}

/// Minimal probe used to discriminate frame types without a full unmarshal.
#[derive(Debug, Deserialize)]
struct FrameProbe {
    #[serde(rename = "type")]
    kind: String,
}

/// Decode one frame payload into its typed form.
///
/// Stream-level frame types are matched first; anything else must be an event
/// envelope. Malformed msgpack and unknown types are decode errors, which the
/// reader loop treats as fatal.
pub fn decode_frame(bytes: &[u8]) -> Result<WorkerFrame, IpcError> {
    let probe: FrameProbe = decode_msgpack(bytes)?;
    match probe.kind.as_str() {
        "artifact_chunk" => Ok(WorkerFrame::ArtifactChunk(decode_msgpack(bytes)?)),
        "file_write" => Ok(WorkerFrame::FileWrite(decode_msgpack(bytes)?)),
        "run_result" => Ok(WorkerFrame::RunResult(decode_msgpack(bytes)?)),
        _ => Ok(WorkerFrame::Event(decode_msgpack(bytes)?)),
    }
}

/// Reads length-prefixed frames from a byte stream. The stream is wrapped in
/// a [`BufReader`] to amortize syscalls over the pipe.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(stream: R) -> Self {
        Self {
            inner: BufReader::new(stream),
        }
    }

    /// Read the next frame payload. `Ok(None)` is a clean EOF after the last
    /// complete frame; a stream that ends mid-prefix or mid-payload is a
    /// fatal [`IpcError::Truncated`].
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, IpcError> {
        let mut prefix = [0u8; LEN_PREFIX_BYTES];
        let got = read_full(&mut self.inner, &mut prefix).await?;
        if got == 0 {
            return Ok(None);
        }
        if got < LEN_PREFIX_BYTES {
            return Err(IpcError::Truncated {
                got,
                want: LEN_PREFIX_BYTES,
            });
        }

        let declared = u32::from_be_bytes(prefix) as usize;
        if declared > MAX_PAYLOAD_BYTES {
            return Err(IpcError::Oversized {
                declared,
                max: MAX_PAYLOAD_BYTES,
            });
        }

        let mut payload = vec![0u8; declared];
        let got = read_full(&mut self.inner, &mut payload).await?;
        if got < declared {
            return Err(IpcError::Truncated { got, want: declared });
        }
        Ok(Some(payload))
    }

    /// Read and decode the next frame in one step.
    pub async fn next_frame(&mut self) -> Result<Option<WorkerFrame>, IpcError> {
        match self.read_frame().await? {
            Some(bytes) => Ok(Some(decode_frame(&bytes)?)),
            None => Ok(None),
        }
    }
}

/// Fill `buf` from the stream, returning how many bytes were read before EOF.
async fn read_full<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<usize, IpcError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Writes length-prefixed msgpack frames onto a byte stream. Used for the
/// supervisor-to-worker ack channel and by test fixtures building worker
/// output.
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(stream: W) -> Self {
        Self { inner: stream }
    }

    pub async fn write_frame<T: Serialize>(&mut self, value: &T) -> Result<(), IpcError> {
        let payload = encode_msgpack(value)?;
        self.write_payload(&payload).await
    }

    pub async fn write_payload(&mut self, payload: &[u8]) -> Result<(), IpcError> {
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(IpcError::Oversized {
                declared: payload.len(),
                max: MAX_PAYLOAD_BYTES,
            });
        }
        let prefix = (payload.len() as u32).to_be_bytes();
        self.inner.write_all(&prefix).await?;
        self.inner.write_all(payload).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
