//! Length-prefixed message framing for the editor command channel.
//!
//! Every message is a UTF-8 JSON document preceded by its byte length as a
//! 4-byte big-endian signed integer. This keeps message boundaries intact
//! over the TCP byte stream.
//!
//! # Wire Format
//!
//! ```text
//! +----------------+---------------------------+
//! | len: i32 (BE)  | body: len bytes of JSON   |
//! +----------------+---------------------------+
//! ```
//!
//! Older editor builds and test harnesses sometimes reply with a bare JSON
//! line instead of a frame. A header whose first byte is `{` is therefore
//! read as a newline-terminated unframed message, and one starting with `[`
//! as an editor log line to skip.

use anyhow::{anyhow, bail, Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Maximum inbound message size (1 MiB), matching the editor's own limit.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Size of the length prefix in bytes.
const HEADER_LEN: usize = 4;

/// Read one message body from the stream.
///
/// Editor log lines (text starting with `[`, such as `[Unity] ...`) that
/// land on the socket between messages are logged and skipped.
///
/// # Errors
///
/// Returns an error if:
/// - The stream is closed before a complete header arrives
/// - The length prefix is negative or exceeds [`MAX_FRAME_SIZE`]
/// - An unframed line runs past [`MAX_FRAME_SIZE`] without a newline
/// - The stream closes in the middle of a body
///
/// Any of these leaves the stream desynchronized, so callers treat them as
/// fatal for the connection. Whether the body is valid JSON is not checked
/// here.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let header = loop {
        let header = read_header(reader).await?;
        if header[0] != b'[' {
            break header;
        }
        let line = read_unframed(reader, &header).await?;
        debug!("Editor log: {}", String::from_utf8_lossy(&line));
    };

    if header[0] == b'{' {
        return read_unframed(reader, &header).await;
    }

    let declared = i32::from_be_bytes(header);
    if declared < 0 {
        bail!("Invalid frame length {}", declared);
    }
    let size = declared as usize;
    if size > MAX_FRAME_SIZE {
        bail!(
            "Frame size {} exceeds maximum {} bytes",
            size,
            MAX_FRAME_SIZE
        );
    }

    let mut body = vec![0u8; size];
    reader
        .read_exact(&mut body)
        .await
        .with_context(|| format!("Failed to read {}-byte frame body", size))?;

    Ok(body)
}

async fn read_header<R>(reader: &mut R) -> Result<[u8; HEADER_LEN]>
where
    R: AsyncBufRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    if let Err(e) = reader.read_exact(&mut header).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(anyhow!("Connection closed by editor"));
        }
        return Err(e).context("Failed to read frame header");
    }
    Ok(header)
}

/// Read the remainder of an unframed line whose first bytes were consumed
/// as a header.
///
/// At most [`MAX_FRAME_SIZE`] bytes plus a CRLF are buffered.
async fn read_unframed<R>(reader: &mut R, prefix: &[u8]) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = prefix.to_vec();
    let budget = (MAX_FRAME_SIZE + 2).saturating_sub(prefix.len()) as u64;
    (&mut *reader)
        .take(budget)
        .read_until(b'\n', &mut line)
        .await
        .context("Failed to read unframed message")?;

    while matches!(line.last(), Some(b'\n' | b'\r')) {
        line.pop();
    }

    if line.len() > MAX_FRAME_SIZE {
        bail!(
            "Unframed message exceeds maximum {} bytes",
            MAX_FRAME_SIZE
        );
    }

    Ok(line)
}

/// Build a complete frame (header + body) in one buffer.
///
/// # Errors
///
/// Returns an error if the body does not fit in a signed 32-bit length.
pub fn encode_frame(body: &[u8]) -> Result<Vec<u8>> {
    let len = i32::try_from(body.len()).context("Request payload too large")?;
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Write one framed message and flush.
///
/// # Errors
///
/// Returns an error if the body is too large to frame or the write fails.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(body)?;

    writer
        .write_all(&frame)
        .await
        .context("Failed to write frame")?;

    writer.flush().await.context("Failed to flush frame")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{duplex, BufReader, DuplexStream};
    use tokio::time::timeout;

    /// Test timeout to prevent hanging tests.
    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// In-memory pipe: bytes written to the first end are read from the second.
    fn pipe() -> (DuplexStream, BufReader<DuplexStream>) {
        let (writer, reader) = duplex(64 * 1024);
        (writer, BufReader::new(reader))
    }

    #[tokio::test]
    async fn test_write_read_frame() {
        let (mut writer, mut reader) = pipe();
        let message = br#"{"id":"1","type":"ping","params":{}}"#;

        write_frame(&mut writer, message).await.expect("Write failed");

        let received = timeout(TEST_TIMEOUT, read_frame(&mut reader))
            .await
            .expect("Test timed out")
            .expect("Read failed");

        assert_eq!(received, message);
    }

    #[test]
    fn test_header_is_big_endian() {
        let frame = encode_frame(b"{}").unwrap();
        assert_eq!(&frame[..4], &[0, 0, 0, 2]);
        assert_eq!(&frame[4..], b"{}");
    }

    #[tokio::test]
    async fn test_consecutive_frames_keep_boundaries() {
        let (mut writer, mut reader) = pipe();

        let mut raw = encode_frame(br#"{"id":"1"}"#).unwrap();
        raw.extend(encode_frame(br#"{"id":"2"}"#).unwrap());
        writer.write_all(&raw).await.expect("Write failed");

        let first = read_frame(&mut reader).await.expect("first frame");
        let second = read_frame(&mut reader).await.expect("second frame");

        assert_eq!(first, br#"{"id":"1"}"#);
        assert_eq!(second, br#"{"id":"2"}"#);
    }

    #[tokio::test]
    async fn test_unframed_json_line_is_accepted() {
        let (mut writer, mut reader) = pipe();

        writer
            .write_all(b"{\"status\":\"success\"}\r\n")
            .await
            .expect("Write failed");

        let received = timeout(TEST_TIMEOUT, read_frame(&mut reader))
            .await
            .expect("Test timed out")
            .expect("Read failed");

        assert_eq!(received, br#"{"status":"success"}"#);
    }

    #[tokio::test]
    async fn test_unframed_then_framed() {
        let (mut writer, mut reader) = pipe();

        let mut raw = b"{\"a\":1}\n".to_vec();
        raw.extend(encode_frame(br#"{"b":2}"#).unwrap());
        writer.write_all(&raw).await.expect("Write failed");

        assert_eq!(read_frame(&mut reader).await.unwrap(), br#"{"a":1}"#);
        assert_eq!(read_frame(&mut reader).await.unwrap(), br#"{"b":2}"#);
    }

    #[tokio::test]
    async fn test_editor_log_lines_are_skipped() {
        let (mut writer, mut reader) = pipe();

        let mut raw = b"[Unity] Domain reload complete\n".to_vec();
        raw.extend(b"[Bridge] listening on 6400\r\n");
        raw.extend(encode_frame(br#"{"id":"7"}"#).unwrap());
        writer.write_all(&raw).await.expect("Write failed");

        let received = timeout(TEST_TIMEOUT, read_frame(&mut reader))
            .await
            .expect("Test timed out")
            .expect("Read failed");

        assert_eq!(received, br#"{"id":"7"}"#);
    }

    #[tokio::test]
    async fn test_unterminated_unframed_line_is_bounded() {
        let (mut writer, reader) = duplex(64 * 1024);
        let mut reader = BufReader::new(reader);

        let feed = tokio::spawn(async move {
            let mut raw = b"{\"blob\":\"".to_vec();
            raw.resize(MAX_FRAME_SIZE + 64, b'x');
            // The reader stops early, so the tail of this write may fail.
            let _ = writer.write_all(&raw).await;
            writer
        });

        let result = timeout(TEST_TIMEOUT, read_frame(&mut reader))
            .await
            .expect("Test timed out");

        let err_msg = result.unwrap_err().to_string();
        assert!(
            err_msg.contains("exceeds maximum"),
            "Expected size error, got: {}",
            err_msg
        );
        drop(reader);
        let _ = feed.await;
    }

    #[tokio::test]
    async fn test_read_rejects_oversized_frame() {
        let (mut writer, mut reader) = pipe();

        let len = (MAX_FRAME_SIZE + 1) as i32;
        writer
            .write_all(&len.to_be_bytes())
            .await
            .expect("Write failed");

        let result = timeout(TEST_TIMEOUT, read_frame(&mut reader))
            .await
            .expect("Test timed out");

        let err_msg = result.unwrap_err().to_string();
        assert!(
            err_msg.contains("exceeds maximum"),
            "Expected size error, got: {}",
            err_msg
        );
    }

    #[tokio::test]
    async fn test_read_rejects_negative_length() {
        let (mut writer, mut reader) = pipe();

        writer
            .write_all(&(-5i32).to_be_bytes())
            .await
            .expect("Write failed");

        let err_msg = read_frame(&mut reader).await.unwrap_err().to_string();
        assert!(err_msg.contains("Invalid frame length"), "got: {}", err_msg);
    }

    #[tokio::test]
    async fn test_connection_closed_returns_error() {
        let (writer, mut reader) = pipe();
        drop(writer);

        let result = timeout(TEST_TIMEOUT, read_frame(&mut reader))
            .await
            .expect("Test timed out");

        let err_msg = result.unwrap_err().to_string();
        assert!(
            err_msg.contains("closed"),
            "Expected connection closed error, got: {}",
            err_msg
        );
    }

    #[tokio::test]
    async fn test_truncated_body_returns_error() {
        let (mut writer, mut reader) = pipe();

        writer
            .write_all(&10i32.to_be_bytes())
            .await
            .expect("Write failed");
        writer.write_all(b"{\"a\"").await.expect("Write failed");
        drop(writer);

        let result = timeout(TEST_TIMEOUT, read_frame(&mut reader))
            .await
            .expect("Test timed out");

        let err_msg = format!("{:#}", result.unwrap_err());
        assert!(err_msg.contains("frame body"), "got: {}", err_msg);
    }
}
