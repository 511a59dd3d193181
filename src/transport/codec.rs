//! Wire framing
//!
//! Messages travel as `Content-Length: N\r\n\r\n{json}` frames, the JSON-RPC
//! base-protocol convention, over whichever byte stream the transport layer
//! provides. [`FrameReader`] and [`FrameWriter`] handle one direction each;
//! both can tee a human-readable record of every frame into a shared
//! [`MessageLog`] for `--rpc-trace`.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::{EngineError, Result};

/// Frames larger than this are rejected rather than buffered.
const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

fn transport(message: impl Into<String>) -> EngineError {
    EngineError::Transport(message.into())
}

/// Append-only record of the frames that crossed one connection.
///
/// Writes never block frame traffic for long; the mutex only guards the
/// buffer append.
#[derive(Clone, Default)]
pub struct MessageLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl MessageLog {
    pub fn record(&self, direction: &str, frame: &serde_json::Value) {
        self.entries.lock().push(format!("{direction} {frame}"));
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }
}

/// Decodes frames from a byte stream.
pub struct FrameReader<R> {
    stream: BufReader<R>,
    log: Option<MessageLog>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(stream: R) -> Self {
        Self {
            stream: BufReader::new(stream),
            log: None,
        }
    }

    pub fn with_log(mut self, log: MessageLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Next frame, or `None` when the peer closed the stream between frames.
    pub async fn read_frame(&mut self) -> Result<Option<serde_json::Value>> {
        let Some(length) = self.read_headers().await? else {
            return Ok(None);
        };
        if length > MAX_FRAME_BYTES {
            return Err(transport(format!("frame of {length} bytes is too large")));
        }

        let mut body = vec![0u8; length];
        self.stream
            .read_exact(&mut body)
            .await
            .map_err(|e| transport(format!("reading frame body: {e}")))?;
        let frame: serde_json::Value = serde_json::from_slice(&body)
            .map_err(|e| transport(format!("frame is not valid JSON: {e}")))?;
        if let Some(log) = &self.log {
            log.record("<-", &frame);
        }
        Ok(Some(frame))
    }

    /// Consume header lines up to the blank separator and return the
    /// announced body length. `None` means a clean EOF before any header
    /// byte; EOF inside a header block is an error.
    async fn read_headers(&mut self) -> Result<Option<usize>> {
        let mut length = None;
        let mut line = String::new();
        let mut started = false;
        loop {
            line.clear();
            let n = self
                .stream
                .read_line(&mut line)
                .await
                .map_err(|e| transport(format!("reading frame header: {e}")))?;
            if n == 0 {
                if started {
                    return Err(transport("connection closed mid-header"));
                }
                return Ok(None);
            }
            started = true;

            let line = line.trim();
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                if name.eq_ignore_ascii_case("Content-Length") {
                    length = Some(value.trim().parse().map_err(|e| {
                        transport(format!("bad Content-Length {:?}: {e}", value.trim()))
                    })?);
                }
                // Content-Type and anything else: accepted and ignored.
            }
        }
        length
            .map(Some)
            .ok_or_else(|| transport("frame headers carry no Content-Length"))
    }
}

/// Encodes frames onto a byte stream.
pub struct FrameWriter<W> {
    stream: W,
    log: Option<MessageLog>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(stream: W) -> Self {
        Self { stream, log: None }
    }

    pub fn with_log(mut self, log: MessageLog) -> Self {
        self.log = Some(log);
        self
    }

    pub async fn write_frame(&mut self, frame: &serde_json::Value) -> Result<()> {
        let body = serde_json::to_vec(frame)
            .map_err(|e| transport(format!("encoding frame: {e}")))?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());
        self.stream
            .write_all(header.as_bytes())
            .await
            .map_err(|e| transport(format!("writing frame header: {e}")))?;
        self.stream
            .write_all(&body)
            .await
            .map_err(|e| transport(format!("writing frame body: {e}")))?;
        self.stream
            .flush()
            .await
            .map_err(|e| transport(format!("flushing frame: {e}")))?;
        if let Some(log) = &self.log {
            log.record("->", frame);
        }
        Ok(())
    }
}
