//! Pluggable frame decoders.

use crate::frame::parse_header;
use crate::{DecodeError, Frame, FrameKind, DEFAULT_IO_TIMEOUT, FRAME_HEADER_LEN, MAX_FRAME_SIZE};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

/// Size of the buffer [`RawDecoder`] reads into (5 KiB).
pub const RAW_BUFFER_SIZE: usize = 5 * 1024;

/// Turns bytes read off a connection into frames.
#[async_trait]
pub trait Decoder: Send + Sync + 'static {
    /// Reads exactly one frame from `reader`.
    async fn decode(
        &self,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<Frame, DecodeError>;
}

/// Decoder for length-prefixed frames (see [`Frame::encode`]).
///
/// Waiting for a header is unbounded so idle connections stay open; once a
/// header has arrived the body must follow within the body timeout.
#[derive(Debug, Clone, Copy)]
pub struct FramedDecoder {
    body_timeout: Duration,
}

impl FramedDecoder {
    /// Creates a decoder with the default body timeout.
    #[must_use]
    pub fn new() -> Self {
        Self {
            body_timeout: DEFAULT_IO_TIMEOUT,
        }
    }

    /// Sets how long a frame body may take to arrive.
    #[must_use]
    pub fn with_body_timeout(mut self, body_timeout: Duration) -> Self {
        self.body_timeout = body_timeout;
        self
    }

    async fn skip(
        &self,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        len: usize,
    ) -> Result<(), DecodeError> {
        let mut body = reader.take(len as u64);
        match timeout(self.body_timeout, tokio::io::copy(&mut body, &mut tokio::io::sink())).await {
            Ok(Ok(skipped)) if skipped == len as u64 => Ok(()),
            Ok(Ok(_)) => Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(DecodeError::Timeout(self.body_timeout)),
        }
    }
}

impl Default for FramedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Decoder for FramedDecoder {
    async fn decode(
        &self,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<Frame, DecodeError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        reader.read_exact(&mut header).await?;
        let (kind, len) = parse_header(&header)?;

        if len > MAX_FRAME_SIZE {
            self.skip(reader, len).await?;
            return Err(DecodeError::TooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }

        let Some(kind) = FrameKind::from_byte(kind) else {
            self.skip(reader, len).await?;
            return Err(DecodeError::UnknownKind(kind));
        };

        let mut payload = vec![0u8; len];
        match timeout(self.body_timeout, reader.read_exact(&mut payload)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(DecodeError::Timeout(self.body_timeout)),
        }

        Ok(Frame {
            kind,
            payload: Bytes::from(payload),
        })
    }
}

/// Decoder that treats whatever a single read returns, up to
/// [`RAW_BUFFER_SIZE`] bytes, as one whole control message.
///
/// There is no framing: longer messages are split across several frames and
/// back-to-back messages may be merged into one. Only use it with peers that
/// send small, unframed messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawDecoder;

#[async_trait]
impl Decoder for RawDecoder {
    async fn decode(
        &self,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<Frame, DecodeError> {
        let mut buf = vec![0u8; RAW_BUFFER_SIZE];
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        buf.truncate(n);
        Ok(Frame::message(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    async fn decode_all(decoder: &dyn Decoder, data: Vec<u8>) -> Vec<Result<Frame, DecodeError>> {
        let mut reader = data.as_slice();
        let mut out = Vec::new();
        loop {
            let result = decoder.decode(&mut reader).await;
            let stop = matches!(&result, Err(e) if e.is_fatal());
            out.push(result);
            if stop {
                return out;
            }
        }
    }

    #[tokio::test]
    async fn framed_decodes_sequence() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&Frame::message(&b"meta"[..]).encode().unwrap());
        wire.extend_from_slice(&Frame::stream(&b"payload"[..]).encode().unwrap());

        let results = decode_all(&FramedDecoder::new(), wire).await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap(), &Frame::message(&b"meta"[..]));
        assert_eq!(results[1].as_ref().unwrap(), &Frame::stream(&b"payload"[..]));
        assert!(matches!(&results[2], Err(e) if e.is_closed()));
    }

    #[tokio::test]
    async fn framed_payload_that_looks_like_a_frame() {
        // A stream body containing a complete encoded frame must come back
        // as opaque bytes.
        let inner = Frame::message(&b"not a real message"[..]).encode().unwrap();
        let mut wire = Vec::new();
        wire.extend_from_slice(&Frame::stream(inner.clone()).encode().unwrap());
        wire.extend_from_slice(&Frame::message(&b"next"[..]).encode().unwrap());

        let results = decode_all(&FramedDecoder::new(), wire).await;
        let first = results[0].as_ref().unwrap();
        assert_eq!(first.kind, FrameKind::Stream);
        assert_eq!(first.payload, inner);
        assert_eq!(results[1].as_ref().unwrap(), &Frame::message(&b"next"[..]));
    }

    #[tokio::test]
    async fn framed_skips_unknown_kind() {
        let mut wire = Vec::new();
        wire.put_slice(b"HRDF");
        wire.put_u8(42);
        wire.put_u32(3);
        wire.put_slice(b"???");
        wire.extend_from_slice(&Frame::message(&b"after"[..]).encode().unwrap());

        let results = decode_all(&FramedDecoder::new(), wire).await;
        assert!(matches!(results[0], Err(DecodeError::UnknownKind(42))));
        assert_eq!(results[1].as_ref().unwrap(), &Frame::message(&b"after"[..]));
    }

    #[tokio::test]
    async fn framed_skips_oversized_body() {
        let len = MAX_FRAME_SIZE + 1;
        let mut wire = Vec::with_capacity(len + 64);
        wire.put_slice(b"HRDF");
        wire.put_u8(FrameKind::Stream as u8);
        wire.put_u32(len as u32);
        wire.resize(FRAME_HEADER_LEN + len, 0xAB);
        wire.extend_from_slice(&Frame::message(&b"after"[..]).encode().unwrap());

        let results = decode_all(&FramedDecoder::new(), wire).await;
        assert!(matches!(results[0], Err(DecodeError::TooLarge { .. })));
        assert_eq!(results[1].as_ref().unwrap(), &Frame::message(&b"after"[..]));
    }

    #[tokio::test]
    async fn framed_bad_magic_is_not_fatal() {
        let mut wire = b"GARBAGE!!".to_vec();
        wire.extend_from_slice(&Frame::message(&b"ok"[..]).encode().unwrap());

        let results = decode_all(&FramedDecoder::new(), wire).await;
        assert!(matches!(results[0], Err(DecodeError::InvalidMagic(_))));
        assert_eq!(results[1].as_ref().unwrap(), &Frame::message(&b"ok"[..]));
    }

    #[tokio::test]
    async fn framed_truncated_body_is_fatal() {
        let encoded = Frame::message(&b"truncated"[..]).encode().unwrap();
        let wire = encoded[..encoded.len() - 3].to_vec();

        let results = decode_all(&FramedDecoder::new(), wire).await;
        assert_eq!(results.len(), 1);
        assert!(matches!(&results[0], Err(e) if e.is_closed()));
    }

    #[tokio::test]
    async fn framed_body_timeout() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let encoded = Frame::message(&b"slow body"[..]).encode().unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut client, &encoded[..FRAME_HEADER_LEN + 2])
            .await
            .unwrap();

        let decoder = FramedDecoder::new().with_body_timeout(Duration::from_millis(50));
        let result = decoder.decode(&mut server).await;
        assert!(matches!(result, Err(DecodeError::Timeout(_))));
        drop(client);
    }

    #[tokio::test]
    async fn raw_reads_single_chunk() {
        let results = decode_all(&RawDecoder, b"hello raw".to_vec()).await;
        assert_eq!(results[0].as_ref().unwrap(), &Frame::message(&b"hello raw"[..]));
        assert!(matches!(&results[1], Err(e) if e.is_closed()));
    }

    #[tokio::test]
    async fn raw_truncates_at_buffer_size() {
        let data = vec![9u8; RAW_BUFFER_SIZE + 100];
        let results = decode_all(&RawDecoder, data).await;
        assert_eq!(results[0].as_ref().unwrap().payload.len(), RAW_BUFFER_SIZE);
        assert_eq!(results[1].as_ref().unwrap().payload.len(), 100);
    }
}
