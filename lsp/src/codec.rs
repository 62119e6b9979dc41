//! JSON-RPC framing codec for language server communication.
//!
//! Messages travel as `Content-Length: N\r\n\r\n{json}` over the child's
//! stdin/stdout. [`FrameReader`] buffers arbitrary chunk boundaries until a
//! full header block and body are available; [`FrameWriter`] emits one frame
//! per call and flushes it.
//!
//! A body that fails to parse is consumed in full before the error is
//! reported, so the next frame still starts at the right byte offset.

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Maximum frame size (16 MiB) to prevent unbounded memory allocation.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        source: io::Error,
    },
    #[error("unexpected EOF while reading {0}")]
    UnexpectedEof(&'static str),
    #[error("missing Content-Length header")]
    MissingContentLength,
    #[error("invalid Content-Length value: {0:?}")]
    InvalidContentLength(String),
    #[error("Content-Length {0} exceeds maximum {MAX_FRAME_BYTES}")]
    Oversized(usize),
    #[error("invalid JSON-RPC body: {0}")]
    InvalidBody(serde_json::Error),
    #[error("serializing JSON-RPC frame: {0}")]
    Serialize(serde_json::Error),
}

impl CodecError {
    /// Whether the stream is still aligned on a frame boundary after this error.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::InvalidBody(_) | Self::Oversized(_))
    }
}

/// Reads JSON-RPC frames from an async reader.
pub struct FrameReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
        }
    }

    /// Read the next JSON-RPC frame.
    ///
    /// Returns `Ok(None)` on EOF at a frame boundary (clean shutdown).
    /// Recoverable errors (see [`CodecError::is_recoverable`]) leave the
    /// reader positioned at the start of the following frame.
    pub async fn read_frame(&mut self) -> Result<Option<serde_json::Value>, CodecError> {
        let Some(content_length) = self.read_headers().await? else {
            return Ok(None);
        };

        if content_length > MAX_FRAME_BYTES {
            self.discard(content_length).await?;
            return Err(CodecError::Oversized(content_length));
        }

        let mut body = vec![0u8; content_length];
        self.reader
            .read_exact(&mut body)
            .await
            .map_err(|source| match source.kind() {
                io::ErrorKind::UnexpectedEof => CodecError::UnexpectedEof("frame body"),
                _ => CodecError::Io {
                    context: "reading frame body",
                    source,
                },
            })?;

        serde_json::from_slice(&body)
            .map(Some)
            .map_err(CodecError::InvalidBody)
    }

    async fn discard(&mut self, len: usize) -> Result<(), CodecError> {
        let mut limited = (&mut self.reader).take(len as u64);
        let copied = tokio::io::copy(&mut limited, &mut tokio::io::sink())
            .await
            .map_err(|source| CodecError::Io {
                context: "discarding oversized frame",
                source,
            })?;
        if copied < len as u64 {
            return Err(CodecError::UnexpectedEof("frame body"));
        }
        Ok(())
    }

    /// Parse headers until the empty line separator.
    ///
    /// Returns the `Content-Length` value, or `None` on EOF.
    async fn read_headers(&mut self) -> Result<Option<usize>, CodecError> {
        let mut content_length: Option<usize> = None;
        let mut line = String::new();
        let mut saw_any_header_bytes = false;

        loop {
            line.clear();
            let bytes_read =
                self.reader
                    .read_line(&mut line)
                    .await
                    .map_err(|source| CodecError::Io {
                        context: "reading header line",
                        source,
                    })?;

            if bytes_read == 0 {
                // EOF is only a clean shutdown before any header byte of this frame.
                if !saw_any_header_bytes {
                    return Ok(None);
                }
                return Err(CodecError::UnexpectedEof("headers"));
            }
            saw_any_header_bytes = true;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                break;
            }

            if let Some((key, value)) = trimmed.split_once(':')
                && key.trim().eq_ignore_ascii_case("Content-Length")
            {
                let value = value.trim();
                let len = value
                    .parse()
                    .map_err(|_| CodecError::InvalidContentLength(value.to_string()))?;
                content_length = Some(len);
            }
            // Other headers (e.g. Content-Type) are ignored.
        }

        content_length
            .map(Some)
            .ok_or(CodecError::MissingContentLength)
    }
}

/// Writes JSON-RPC frames to an async writer.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write a JSON-RPC frame with `Content-Length` header.
    ///
    /// Header and body go out in a single buffer so a frame is never split
    /// across two writes.
    pub async fn write_frame(&mut self, msg: &serde_json::Value) -> Result<(), CodecError> {
        let body = serde_json::to_vec(msg).map_err(CodecError::Serialize)?;
        let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
        frame.extend_from_slice(&body);

        self.writer
            .write_all(&frame)
            .await
            .map_err(|source| CodecError::Io {
                context: "writing frame",
                source,
            })?;
        self.writer.flush().await.map_err(|source| CodecError::Io {
            context: "flushing frame",
            source,
        })
    }

    /// Flush and close the underlying writer.
    pub async fn close(&mut self) -> Result<(), CodecError> {
        self.writer
            .shutdown()
            .await
            .map_err(|source| CodecError::Io {
                context: "closing writer",
                source,
            })
    }
}
