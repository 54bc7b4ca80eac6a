//! Frame codec.
//!
//! Frames are laid out as:
//! - 1 byte: protocol version (ASCII digit)
//! - 2 bytes: message tag
//! - 2 bytes: source name length
//! - 2 bytes: destination name length
//! - 2 bytes: content length
//! - source name, destination name, content
//!
//! All integers are big-endian.

use crate::network::error::{ProtocolError, ProtocolResult};
use crate::network::protocol::{Message, MessageWrapper};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

pub const VERSION: u8 = b'1';
pub const HEADER_SIZE: usize = 9;
/// Largest value a length field can carry
pub const MAX_FIELD_LEN: usize = u16::MAX as usize;
/// Fixed delay before retrying an operation that would have blocked
pub const RETRY_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub tag: u16,
    pub src_len: u16,
    pub dst_len: u16,
    pub content_len: u16,
}

impl FrameHeader {
    /// Bytes that follow the header
    pub fn body_len(&self) -> usize {
        self.src_len as usize + self.dst_len as usize + self.content_len as usize
    }

    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.body_len()
    }
}

fn field_len(field: &'static str, bytes: &[u8]) -> ProtocolResult<u16> {
    u16::try_from(bytes.len()).map_err(|_| ProtocolError::FrameTooLarge {
        field,
        len: bytes.len(),
        max: MAX_FIELD_LEN,
    })
}

/// Encode a message addressed from `src` to `dst` into a single frame
pub fn encode(msg: &Message, src: &str, dst: &str) -> ProtocolResult<Vec<u8>> {
    let content = msg.serialize()?;
    let header = FrameHeader {
        version: VERSION,
        tag: msg.tag(),
        src_len: field_len("src", src.as_bytes())?,
        dst_len: field_len("dst", dst.as_bytes())?,
        content_len: field_len("content", &content)?,
    };

    let mut out = Vec::with_capacity(header.frame_len());
    out.push(header.version);
    out.extend_from_slice(&header.tag.to_be_bytes());
    out.extend_from_slice(&header.src_len.to_be_bytes());
    out.extend_from_slice(&header.dst_len.to_be_bytes());
    out.extend_from_slice(&header.content_len.to_be_bytes());
    out.extend_from_slice(src.as_bytes());
    out.extend_from_slice(dst.as_bytes());
    out.extend_from_slice(&content);

    if out.len() != header.frame_len() {
        // Header lengths must describe exactly the bytes written
        return Err(ProtocolError::Decode(format!(
            "encoded {} bytes, header declares {}",
            out.len(),
            header.frame_len()
        )));
    }
    Ok(out)
}

/// Parse the fixed-size header. The version byte is checked before anything else is read.
pub fn decode_header(bytes: &[u8]) -> ProtocolResult<FrameHeader> {
    if bytes.len() < HEADER_SIZE {
        return Err(ProtocolError::Decode(format!(
            "invalid message header of length {}",
            bytes.len()
        )));
    }
    let version = bytes[0];
    if version != VERSION {
        return Err(ProtocolError::Version { found: version });
    }
    let read_u16 = |at: usize| u16::from_be_bytes([bytes[at], bytes[at + 1]]);
    Ok(FrameHeader {
        version,
        tag: read_u16(1),
        src_len: read_u16(3),
        dst_len: read_u16(5),
        content_len: read_u16(7),
    })
}

/// Decode the body regions that follow `header`
pub fn decode_body(header: &FrameHeader, body: &[u8]) -> ProtocolResult<MessageWrapper> {
    if body.len() != header.body_len() {
        return Err(ProtocolError::Decode(format!(
            "frame body is {} bytes, header declares {}",
            body.len(),
            header.body_len()
        )));
    }
    let (src, rest) = body.split_at(header.src_len as usize);
    let (dst, content) = rest.split_at(header.dst_len as usize);
    let msg = Message::deserialize(header.tag, content)?;
    Ok(MessageWrapper {
        msg,
        src: String::from_utf8(src.to_vec())?,
        dst: String::from_utf8(dst.to_vec())?,
    })
}

/// Decode one complete frame
pub fn decode(frame: &[u8]) -> ProtocolResult<MessageWrapper> {
    let header = decode_header(frame)?;
    let end = frame.len().min(header.frame_len());
    decode_body(&header, &frame[HEADER_SIZE..end])
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Back off before retrying a transient failure, or propagate anything else
pub(crate) async fn retry_or_fail(e: io::Error, working: &CancellationToken) -> ProtocolResult<()> {
    if !is_transient(&e) {
        return Err(e.into());
    }
    if working.is_cancelled() {
        return Err(ProtocolError::Stopped);
    }
    sleep(RETRY_INTERVAL).await;
    Ok(())
}

/// Read exactly `len` bytes, accumulating partial reads.
///
/// A zero-length read before `len` bytes arrived means the remote side closed.
pub async fn read_exact_len<R>(
    reader: &mut R,
    len: usize,
    working: &CancellationToken,
) -> ProtocolResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; len];
    let mut read = 0;
    while read < len {
        if working.is_cancelled() {
            return Err(ProtocolError::Stopped);
        }
        let result = tokio::select! {
            _ = working.cancelled() => return Err(ProtocolError::Stopped),
            r = reader.read(&mut buf[read..]) => r,
        };
        match result {
            Ok(0) => return Err(ProtocolError::ConnectionTerminated),
            Ok(n) => read += n,
            Err(e) => retry_or_fail(e, working).await?,
        }
    }
    Ok(buf)
}

/// Read one frame: header first, then exactly the declared body
pub async fn read_frame<R>(reader: &mut R, working: &CancellationToken) -> ProtocolResult<MessageWrapper>
where
    R: AsyncRead + Unpin,
{
    let header_bytes = read_exact_len(reader, HEADER_SIZE, working).await?;
    let header = decode_header(&header_bytes)?;
    let body = read_exact_len(reader, header.body_len(), working).await?;
    decode_body(&header, &body)
}

/// Write all of `data`, accumulating partial writes.
///
/// Writes are not interrupted by a stop request once started; only the retry loop
/// observes the working flag.
pub async fn write_all<W>(writer: &mut W, data: &[u8], working: &CancellationToken) -> ProtocolResult<usize>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut sent = 0;
    while sent < data.len() {
        match writer.write(&data[sent..]).await {
            Ok(0) => return Err(ProtocolError::ConnectionTerminated),
            Ok(n) => sent += n,
            Err(e) => retry_or_fail(e, working).await?,
        }
    }
    loop {
        match writer.flush().await {
            Ok(()) => return Ok(sent),
            Err(e) => retry_or_fail(e, working).await?,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::MessageKind;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    /// Fails the first read and the first write with WouldBlock, then passes through
    struct Flaky<T> {
        inner: T,
        read_failed: bool,
        write_failed: bool,
        failures: usize,
    }

    impl<T> Flaky<T> {
        fn new(inner: T) -> Self {
            Self {
                inner,
                read_failed: false,
                write_failed: false,
                failures: 0,
            }
        }
    }

    fn would_block() -> io::Error {
        io::Error::new(io::ErrorKind::WouldBlock, "not ready")
    }

    impl<T: AsyncRead + Unpin> AsyncRead for Flaky<T> {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if !self.read_failed {
                self.read_failed = true;
                self.failures += 1;
                return Poll::Ready(Err(would_block()));
            }
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl<T: AsyncWrite + Unpin> AsyncWrite for Flaky<T> {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if !self.write_failed {
                self.write_failed = true;
                self.failures += 1;
                return Poll::Ready(Err(would_block()));
            }
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::Hello {
                name: "node-a".to_string(),
            },
            Message::GetAddress,
            Message::Address {
                address: "QmXoypizjW3WknFiJnKLwHCnL72vedxjQkDDP1mXWo6uco".to_string(),
            },
            Message::GetResources,
            Message::Resources {
                hashes: vec!["h1".to_string(), "h2".to_string(), "h3".to_string()],
            },
            Message::Result {
                hash: "h4".to_string(),
            },
        ]
    }

    #[test]
    fn test_roundtrip_all_messages() {
        for msg in sample_messages() {
            let frame = encode(&msg, "client", "srv").unwrap();
            let wrapper = decode(&frame).unwrap();
            assert_eq!(wrapper, MessageWrapper::new(msg, "client", "srv"));
        }
    }

    #[test]
    fn test_header_layout() {
        let frame = encode(&Message::GetResources, "ab", "").unwrap();
        assert_eq!(frame, vec![b'1', 0, 20, 0, 2, 0, 0, 0, 0, b'a', b'b']);
    }

    #[test]
    fn test_lengths_count_bytes_not_chars() {
        let name = "węzeł";
        let frame = encode(&Message::Hello { name: name.to_string() }, name, "").unwrap();
        let header = decode_header(&frame).unwrap();
        assert_eq!(header.src_len as usize, name.len());
        assert_eq!(header.content_len as usize, name.len());
        assert_eq!(frame.len(), header.frame_len());
        assert_eq!(decode(&frame).unwrap().src, name);
    }

    #[test]
    fn test_unsupported_version() {
        let mut frame = encode(&Message::GetAddress, "a", "b").unwrap();
        frame[0] = b'2';
        // Corrupt the lengths too; they must never be looked at
        frame[7] = 0xFF;
        frame[8] = 0xFF;
        assert!(matches!(
            decode_header(&frame),
            Err(ProtocolError::Version { found: b'2' })
        ));
    }

    #[test]
    fn test_unknown_tag() {
        let mut frame = encode(&Message::GetAddress, "", "").unwrap();
        frame[1] = 0x12;
        frame[2] = 0x34;
        assert!(matches!(
            decode(&frame),
            Err(ProtocolError::UnknownMessage(0x1234))
        ));
    }

    #[test]
    fn test_short_header() {
        assert!(matches!(
            decode_header(&[b'1', 0, 1]),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn test_field_too_large() {
        let long = "x".repeat(MAX_FIELD_LEN + 1);
        let result = encode(&Message::Result { hash: long }, "", "");
        assert!(matches!(
            result,
            Err(ProtocolError::FrameTooLarge { field: "content", .. })
        ));
    }

    #[tokio::test]
    async fn test_read_frame_across_partial_reads() {
        let frame = encode(
            &Message::Address {
                address: "abc".to_string(),
            },
            "srv",
            "client",
        )
        .unwrap();
        let (head, tail) = frame.split_at(5);
        let mut reader = tokio_test::io::Builder::new()
            .read(head)
            .read(&tail[..4])
            .read(&tail[4..])
            .build();

        let working = CancellationToken::new();
        let wrapper = read_frame(&mut reader, &working).await.unwrap();
        assert_eq!(wrapper.msg.kind(), MessageKind::Address);
        assert_eq!(wrapper.src, "srv");
        assert_eq!(wrapper.dst, "client");
    }

    #[tokio::test]
    async fn test_truncated_content_is_connection_terminated() {
        let mut header = vec![VERSION];
        header.extend_from_slice(&MessageKind::Result.tag().to_be_bytes());
        header.extend_from_slice(&0u16.to_be_bytes());
        header.extend_from_slice(&0u16.to_be_bytes());
        header.extend_from_slice(&100u16.to_be_bytes());
        let mut reader = tokio_test::io::Builder::new()
            .read(&header)
            .read(&[b'x'; 40])
            .build();

        let working = CancellationToken::new();
        let result = read_frame(&mut reader, &working).await;
        assert!(matches!(result, Err(ProtocolError::ConnectionTerminated)));
    }

    #[tokio::test]
    async fn test_transient_read_error_is_retried() {
        let frame = encode(&Message::GetAddress, "c", "s").unwrap();
        let mut reader = Flaky::new(tokio_test::io::Builder::new().read(&frame).build());

        let working = CancellationToken::new();
        let wrapper = read_frame(&mut reader, &working).await.unwrap();
        assert_eq!(wrapper.msg, Message::GetAddress);
        assert_eq!(reader.failures, 1);
    }

    #[tokio::test]
    async fn test_retry_or_fail() {
        let working = CancellationToken::new();
        let interrupted = io::Error::new(io::ErrorKind::Interrupted, "signal");
        assert!(retry_or_fail(interrupted, &working).await.is_ok());

        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(retry_or_fail(reset, &working).await, Err(ProtocolError::Io(_))));

        working.cancel();
        let would_block = io::Error::new(io::ErrorKind::WouldBlock, "not ready");
        assert!(matches!(
            retry_or_fail(would_block, &working).await,
            Err(ProtocolError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_stopped_engine_does_not_read() {
        let mut reader = tokio_test::io::Builder::new().build();
        let working = CancellationToken::new();
        working.cancel();
        let result = read_frame(&mut reader, &working).await;
        assert!(matches!(result, Err(ProtocolError::Stopped)));
    }

    #[tokio::test]
    async fn test_write_all_partial_writes() {
        let frame = encode(&Message::GetResources, "client", "srv").unwrap();
        let mock = tokio_test::io::Builder::new()
            .write(&frame[..3])
            .write(&frame[3..])
            .build();
        let mut writer = Flaky::new(mock);
        let working = CancellationToken::new();
        let sent = write_all(&mut writer, &frame, &working).await.unwrap();
        assert_eq!(sent, frame.len());
        assert_eq!(writer.failures, 1);
    }
}
