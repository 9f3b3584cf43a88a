//! Content-Length message framing
//!
//! Codec for the LSP wire format:
//!
//! Content-Length: <length>\r\n\r\n<content>
//!
//! The header block is ASCII `Name: Value` lines terminated by an empty CRLF
//! line; only `Content-Length` matters and other headers are ignored. The
//! payload is UTF-8 JSON. Reading and writing are split so the receive and
//! send loops each own exactly one half of the stream pair.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Maximum frame size to prevent memory exhaustion
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const READ_CHUNK: usize = 8 * 1024;

/// Error types for message framing
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("transport closed before a complete frame")]
    TransportClosed,

    #[error("missing Content-Length header")]
    MissingContentLength,

    #[error("invalid Content-Length: {0}")]
    InvalidContentLength(String),

    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Reading
// ============================================================================

/// Decodes frames from the server-to-client byte stream.
pub struct FrameReader<R> {
    reader: R,

    /// Bytes received but not yet consumed by a complete frame
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
        }
    }

    /// Read one frame and return its JSON text.
    ///
    /// `Ok(None)` means the stream ended cleanly at a frame boundary.
    /// End-of-stream inside a frame is `FramingError::TransportClosed`.
    pub async fn read_frame(&mut self) -> Result<Option<String>, FramingError> {
        loop {
            if let Some(payload) = self.try_take_frame()? {
                trace!("decoded frame ({} bytes)", payload.len());
                return Ok(Some(payload));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(FramingError::TransportClosed);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Extract one complete frame from the buffer, if present.
    fn try_take_frame(&mut self) -> Result<Option<String>, FramingError> {
        let Some(header_end) = find_subslice(&self.buf, HEADER_TERMINATOR) else {
            return Ok(None);
        };

        let content_length = parse_content_length(&self.buf[..header_end])?;
        if content_length > MAX_FRAME_SIZE {
            return Err(FramingError::FrameTooLarge {
                size: content_length,
                max: MAX_FRAME_SIZE,
            });
        }

        let content_start = header_end + HEADER_TERMINATOR.len();
        if self.buf.len() < content_start + content_length {
            return Ok(None);
        }

        let payload = self.buf[content_start..content_start + content_length].to_vec();
        self.buf.drain(..content_start + content_length);
        Ok(Some(String::from_utf8(payload)?))
    }
}

/// Scan the header block for `Content-Length`.
///
/// Lines split on the first `:` only; names compare case-insensitively;
/// malformed lines and unknown headers are skipped.
fn parse_content_length(header: &[u8]) -> Result<usize, FramingError> {
    let header = String::from_utf8_lossy(header);
    for line in header.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            let value = value.trim();
            return value
                .parse::<usize>()
                .map_err(|_| FramingError::InvalidContentLength(value.to_string()));
        }
    }
    Err(FramingError::MissingContentLength)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

// ============================================================================
// Writing
// ============================================================================

/// Encodes frames onto the client-to-server byte stream.
///
/// Each write is atomic per message: the single-consumer send loop is the
/// only writer, so frames never interleave.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Frame and write one JSON payload, then flush.
    pub async fn write_frame(&mut self, payload: &str) -> Result<(), FramingError> {
        trace!("encoding frame ({} bytes)", payload.len());

        let header = format!("Content-Length: {}\r\n\r\n", payload.len());
        self.writer.write_all(header.as_bytes()).await?;
        self.writer.write_all(payload.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_from(bytes: &[u8]) -> Result<Option<String>, FramingError> {
        let mut reader = FrameReader::new(bytes);
        reader.read_frame().await
    }

    fn framed(payload: &str) -> Vec<u8> {
        format!("Content-Length: {}\r\n\r\n{}", payload.len(), payload).into_bytes()
    }

    #[tokio::test]
    async fn write_produces_canonical_header() {
        let payload = r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#;
        let mut out = Vec::new();
        FrameWriter::new(&mut out).write_frame(payload).await.unwrap();
        assert_eq!(out, framed(payload));
    }

    #[tokio::test]
    async fn round_trip_preserves_json_bytes() {
        let payload = r#"{"jsonrpc":"2.0","id":1,"result":{"text":"héllo 世界"}}"#;
        let mut out = Vec::new();
        FrameWriter::new(&mut out).write_frame(payload).await.unwrap();

        let decoded = read_from(&out).await.unwrap().unwrap();
        assert_eq!(decoded, payload);
    }

    #[tokio::test]
    async fn partial_delivery_assembles_frame() {
        let payload = r#"{"jsonrpc":"2.0","id":1,"result":{}}"#;
        let bytes = framed(payload);

        // Feed through a duplex so the frame arrives in two chunks.
        let (mut tx, rx) = tokio::io::duplex(256);
        let (split_at, rest) = bytes.split_at(10);
        let (split_at, rest) = (split_at.to_vec(), rest.to_vec());
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            tx.write_all(&split_at).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            tx.write_all(&rest).await.unwrap();
        });

        let mut reader = FrameReader::new(rx);
        let decoded = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(decoded, payload);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn multiple_frames_in_one_buffer() {
        let first = r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#;
        let second = r#"{"jsonrpc":"2.0","id":2,"method":"shutdown"}"#;
        let mut bytes = framed(first);
        bytes.extend_from_slice(&framed(second));

        let mut reader = FrameReader::new(bytes.as_slice());
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), first);
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), second);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn header_lookup_is_case_insensitive_and_tolerant() {
        let payload = r#"{"jsonrpc":"2.0","method":"m"}"#;
        let bytes = format!(
            "X-Trace: on\r\nnot a header line\r\ncontent-length: {}\r\nContent-Type: application/vscode-jsonrpc\r\n\r\n{}",
            payload.len(),
            payload
        );
        let decoded = read_from(bytes.as_bytes()).await.unwrap().unwrap();
        assert_eq!(decoded, payload);
    }

    #[tokio::test]
    async fn missing_content_length_is_rejected() {
        let bytes = b"Content-Type: application/vscode-jsonrpc\r\n\r\n{}";
        match read_from(bytes).await {
            Err(FramingError::MissingContentLength) => {}
            other => panic!("expected MissingContentLength, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_content_length_is_rejected() {
        let bytes = b"Content-Length: invalid\r\n\r\n{}";
        match read_from(bytes).await {
            Err(FramingError::InvalidContentLength(v)) => assert_eq!(v, "invalid"),
            other => panic!("expected InvalidContentLength, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let size = MAX_FRAME_SIZE + 1;
        let bytes = format!("Content-Length: {size}\r\n\r\n");
        match read_from(bytes.as_bytes()).await {
            Err(FramingError::FrameTooLarge { size: s, max }) => {
                assert_eq!(s, size);
                assert_eq!(max, MAX_FRAME_SIZE);
            }
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn eof_mid_frame_is_transport_closed() {
        let bytes = b"Content-Length: 100\r\n\r\n{\"partial\":";
        match read_from(bytes).await {
            Err(FramingError::TransportClosed) => {}
            other => panic!("expected TransportClosed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn clean_eof_is_none() {
        assert!(read_from(b"").await.unwrap().is_none());
    }
}
