//! Length-prefixed framing over byte streams.
//!
//! Frame layout: `[len: u32 BE][payload: len bytes]`. Frame boundaries are
//! determined solely by the length prefix, so payloads may contain arbitrary
//! bytes. A size cap bounds memory per frame.
//!
//! The decode side is split in two: [`FrameDecoder`] is a pure incremental
//! parser over an internal buffer (fuzzable, no I/O), and [`FrameReader`]
//! drives it from any [`AsyncRead`] with an optional deadline. The write
//! side is [`write_frame`]. A zero timeout means no deadline.

use std::future::Future;
use std::io;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix preceding every frame.
pub const LEN_PREFIX_SIZE: usize = 4;

/// Maximum payload size per frame (16 MB).
///
/// Frames larger than this are rejected to bound memory per connection.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Framing error types.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    /// Frame payload exceeds the configured size cap.
    #[error("frame too large: {size} bytes (max {max})")]
    TooLarge {
        /// Declared payload size.
        size: usize,
        /// Configured cap.
        max: usize,
    },

    /// The stream ended cleanly at a frame boundary.
    #[error("stream closed")]
    Closed,

    /// The supplied deadline elapsed before the operation completed.
    #[error("deadline exceeded")]
    Timeout,

    /// Underlying I/O failure, including truncation mid-frame.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Encode one frame: length prefix followed by the payload.
///
/// # Errors
///
/// Fails with [`FramingError::TooLarge`] when the payload exceeds
/// [`MAX_FRAME_SIZE`].
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, FramingError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(FramingError::TooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let len = u32::try_from(payload.len()).map_err(|_| FramingError::TooLarge {
        size: payload.len(),
        max: MAX_FRAME_SIZE,
    })?;
    let mut buf = BytesMut::with_capacity(LEN_PREFIX_SIZE + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf.freeze())
}

/// Incremental frame parser.
///
/// Feed arbitrary chunks with [`push`](Self::push);
/// [`next_frame`](Self::next_frame) yields complete payloads as they become
/// available. Bytes belonging to a following frame stay buffered.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_size: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Decoder with the default [`MAX_FRAME_SIZE`] cap.
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Decoder with a custom per-frame size cap.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_size,
        }
    }

    /// Append received bytes to the internal buffer.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of bytes buffered but not yet consumed as frames.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete frame payload, if one is buffered.
    ///
    /// # Errors
    ///
    /// Fails with [`FramingError::TooLarge`] when a length prefix declares a
    /// payload over the cap; the decoder is unusable afterwards since the
    /// stream position is corrupt.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, FramingError> {
        if self.buf.len() < LEN_PREFIX_SIZE {
            return Ok(None);
        }
        let mut prefix = [0u8; LEN_PREFIX_SIZE];
        prefix.copy_from_slice(&self.buf[..LEN_PREFIX_SIZE]);
        let len = u32::from_be_bytes(prefix) as usize;
        if len > self.max_frame_size {
            return Err(FramingError::TooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }
        if self.buf.len() < LEN_PREFIX_SIZE + len {
            return Ok(None);
        }
        self.buf.advance(LEN_PREFIX_SIZE);
        Ok(Some(self.buf.split_to(len).freeze()))
    }
}

/// Run a framing future under an optional deadline; zero means no deadline.
async fn with_deadline<T, F>(timeout: Duration, fut: F) -> Result<T, FramingError>
where
    F: Future<Output = Result<T, FramingError>>,
{
    if timeout.is_zero() {
        fut.await
    } else {
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(FramingError::Timeout),
        }
    }
}

/// Write one frame to the stream, honoring an optional write deadline.
///
/// # Errors
///
/// Propagates encode failures, I/O errors, and [`FramingError::Timeout`]
/// when the deadline elapses. No retries happen in this layer.
pub async fn write_frame<W>(
    io: &mut W,
    payload: &[u8],
    timeout: Duration,
) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(payload)?;
    with_deadline(timeout, async move {
        io.write_all(&frame).await?;
        io.flush().await?;
        Ok(())
    })
    .await
}

/// Buffered frame reader over any [`AsyncRead`].
///
/// Owns the read half and the decode buffer; bytes read past the current
/// frame are retained for the next call.
#[derive(Debug)]
pub struct FrameReader<R> {
    io: R,
    decoder: FrameDecoder,
    chunk: Vec<u8>,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Reader with the given read chunk size and per-frame cap.
    pub fn new(io: R, chunk_size: usize, max_frame_size: usize) -> Self {
        Self {
            io,
            decoder: FrameDecoder::with_max_frame_size(max_frame_size),
            chunk: vec![0u8; chunk_size.max(1)],
        }
    }

    /// Read until one complete frame is available, honoring an optional
    /// deadline.
    ///
    /// # Errors
    ///
    /// - [`FramingError::Timeout`] when the deadline elapses first
    /// - [`FramingError::Closed`] when the stream ends at a frame boundary
    /// - [`FramingError::Io`] with `UnexpectedEof` when it ends mid-frame
    pub async fn read_frame(&mut self, timeout: Duration) -> Result<Bytes, FramingError> {
        let decoder = &mut self.decoder;
        let io = &mut self.io;
        let chunk = &mut self.chunk;
        with_deadline(timeout, async move {
            loop {
                if let Some(frame) = decoder.next_frame()? {
                    return Ok(frame);
                }
                let n = io.read(chunk.as_mut_slice()).await?;
                if n == 0 {
                    if decoder.buffered_len() == 0 {
                        return Err(FramingError::Closed);
                    }
                    return Err(FramingError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream ended mid-frame",
                    )));
                }
                decoder.push(&chunk[..n]);
            }
        })
        .await
    }

    /// Consume the reader, returning the underlying stream.
    pub fn into_inner(self) -> R {
        self.io
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn decoder_round_trips_empty_payload() {
        let frame = encode_frame(b"").unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.push(&frame);
        let payload = decoder.next_frame().unwrap().unwrap();
        assert!(payload.is_empty());
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn decoder_handles_split_delivery() {
        let frame = encode_frame(b"hello world").unwrap();
        let mut decoder = FrameDecoder::new();
        // Byte-at-a-time delivery must not produce partial frames.
        for byte in &frame[..frame.len() - 1] {
            decoder.push(&[*byte]);
            assert!(decoder.next_frame().unwrap().is_none());
        }
        decoder.push(&frame[frame.len() - 1..]);
        let payload = decoder.next_frame().unwrap().unwrap();
        assert_eq!(&payload[..], b"hello world");
    }

    #[test]
    fn decoder_separates_back_to_back_frames() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&encode_frame(b"first").unwrap());
        wire.extend_from_slice(&encode_frame(b"second").unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.push(&wire);
        assert_eq!(&decoder.next_frame().unwrap().unwrap()[..], b"first");
        assert_eq!(&decoder.next_frame().unwrap().unwrap()[..], b"second");
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn decoder_rejects_oversize_prefix() {
        let mut decoder = FrameDecoder::with_max_frame_size(8);
        decoder.push(&1024u32.to_be_bytes());
        assert!(matches!(
            decoder.next_frame(),
            Err(FramingError::TooLarge { size: 1024, .. })
        ));
    }

    #[test]
    fn encode_rejects_oversize_payload() {
        let payload = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            encode_frame(&payload),
            Err(FramingError::TooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn reader_round_trips_large_payload() {
        // Much larger than the 16-byte chunk size to force many read calls.
        let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
        let mut wire = Vec::new();
        write_frame(&mut wire, &payload, Duration::ZERO).await.unwrap();

        let mut reader = FrameReader::new(wire.as_slice(), 16, MAX_FRAME_SIZE);
        let decoded = reader.read_frame(Duration::ZERO).await.unwrap();
        assert_eq!(&decoded[..], payload.as_slice());
    }

    #[tokio::test]
    async fn reader_reports_clean_close() {
        let mut reader = FrameReader::new(&[][..], 16, MAX_FRAME_SIZE);
        assert!(matches!(
            reader.read_frame(Duration::ZERO).await,
            Err(FramingError::Closed)
        ));
    }

    #[tokio::test]
    async fn reader_reports_truncation_mid_frame() {
        let frame = encode_frame(b"hello").unwrap();
        let truncated = &frame[..frame.len() - 2];
        let mut reader = FrameReader::new(truncated, 16, MAX_FRAME_SIZE);
        assert!(matches!(
            reader.read_frame(Duration::ZERO).await,
            Err(FramingError::Io(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn reader_times_out_on_silent_stream() {
        let (_tx, rx) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(rx, 16, MAX_FRAME_SIZE);
        assert!(matches!(
            reader.read_frame(Duration::from_millis(50)).await,
            Err(FramingError::Timeout)
        ));
    }
}
