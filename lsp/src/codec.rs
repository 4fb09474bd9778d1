//! JSON-RPC framing codec.
//!
//! LSP uses `Content-Length: N\r\n\r\n{json}` framing regardless of transport.
//! [`FrameReader`] and [`FrameWriter`] work over any async byte stream, so the
//! same codec serves stdio pipes, local sockets and TCP.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Maximum frame size (4 MiB) to prevent unbounded memory allocation.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        source: std::io::Error,
    },
    #[error("unexpected EOF while reading headers")]
    TruncatedHeaders,
    #[error("missing Content-Length header")]
    MissingContentLength,
    #[error("invalid Content-Length value '{0}'")]
    InvalidContentLength(String),
    #[error("Content-Length {0} exceeds maximum {MAX_FRAME_BYTES}")]
    FrameTooLarge(usize),
    #[error("invalid JSON-RPC frame: {0}")]
    Json(#[from] serde_json::Error),
}

fn io_error(context: &'static str) -> impl FnOnce(std::io::Error) -> CodecError {
    move |source| CodecError::Io { context, source }
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

    /// Read the next frame. `Ok(None)` is a clean EOF between frames.
    pub async fn read_frame(&mut self) -> Result<Option<serde_json::Value>, CodecError> {
        let Some(content_length) = self.read_headers().await? else {
            return Ok(None);
        };

        if content_length > MAX_FRAME_BYTES {
            return Err(CodecError::FrameTooLarge(content_length));
        }

        let mut body = vec![0u8; content_length];
        self.reader
            .read_exact(&mut body)
            .await
            .map_err(io_error("reading frame body"))?;

        Ok(Some(serde_json::from_slice(&body)?))
    }

    async fn read_headers(&mut self) -> Result<Option<usize>, CodecError> {
        let mut content_length: Option<usize> = None;
        let mut line = String::new();
        let mut saw_any_header_bytes = false;

        loop {
            line.clear();
            let bytes_read = self
                .reader
                .read_line(&mut line)
                .await
                .map_err(io_error("reading header line"))?;

            if bytes_read == 0 {
                // EOF is only clean before the first header byte of a frame.
                if !saw_any_header_bytes {
                    return Ok(None);
                }
                return Err(CodecError::TruncatedHeaders);
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

    pub async fn write_frame(&mut self, msg: &serde_json::Value) -> Result<(), CodecError> {
        let body = serde_json::to_string(msg)?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());

        self.writer
            .write_all(header.as_bytes())
            .await
            .map_err(io_error("writing frame header"))?;
        self.writer
            .write_all(body.as_bytes())
            .await
            .map_err(io_error("writing frame body"))?;
        self.writer
            .flush()
            .await
            .map_err(io_error("flushing frame"))?;

        Ok(())
    }

    /// Shut down the write half so the peer sees EOF.
    pub async fn close(&mut self) -> Result<(), CodecError> {
        self.writer
            .shutdown()
            .await
            .map_err(io_error("closing writer"))
    }
}
