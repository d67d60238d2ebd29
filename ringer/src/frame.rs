//! Newline-delimited frame codec.
//!
//! Every frame on the wire is either `type\n` or `type~json\n`. Readers
//! accumulate raw chunks in a [`FrameBuffer`], which hands back complete
//! lines and keeps the trailing partial segment for the next read.

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

const TYPE_SEPARATOR: char = '~';

/// A decoded frame: the message type plus an optional JSON payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: String,
    pub payload: Option<Value>,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid utf-8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("invalid json payload {payload:?}: {source}")]
    Json {
        payload: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("bad payload for {kind}: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("message type {0} requires a payload")]
    MissingPayload(String),
}

impl Frame {
    pub fn new(kind: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Parses one complete line (without its trailing newline).
    pub fn parse(line: &str) -> Result<Self, FrameError> {
        let line = line.trim_end_matches('\r');
        match line.split_once(TYPE_SEPARATOR) {
            None => Ok(Frame::new(line, None)),
            Some((kind, json)) => {
                let payload = serde_json::from_str(json).map_err(|source| FrameError::Json {
                    payload: json.to_string(),
                    source,
                })?;
                Ok(Frame::new(kind, Some(payload)))
            }
        }
    }

    /// Encodes the frame including its newline terminator.
    pub fn encode(&self) -> Vec<u8> {
        let mut encoded = self.kind.clone().into_bytes();
        if let Some(payload) = &self.payload {
            encoded.push(TYPE_SEPARATOR as u8);
            // Value serialization cannot fail: map keys are always strings.
            encoded.extend_from_slice(payload.to_string().as_bytes());
        }
        encoded.push(b'\n');
        encoded
    }
}

/// Reassembles newline-delimited frames from arbitrarily split reads.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    pending: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and returns every line it completed, in order.
    ///
    /// Each returned entry is either the line text or the error for a line
    /// that was not valid UTF-8, so one bad line never hides its neighbours.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<String, FrameError>> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            let line = self.pending[start..end].to_vec();
            start = end + 1;
            if line.is_empty() {
                continue;
            }
            lines.push(String::from_utf8(line).map_err(FrameError::from));
        }
        self.pending.drain(..start);
        lines
    }

    /// Bytes held back waiting for a newline.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Writes one frame and flushes so peers see it promptly.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame.encode()).await?;
    writer.flush().await
}
