//! Encoder for HTTP message bodies.
//!
//! The framing is decided once the head has been written: a declared Content-Length is
//! enforced byte for byte, chunked bodies are framed, and bodies delimited by connection close
//! are written as they come.

use crate::codec::body::chunked_encoder::ChunkedEncoder;
use crate::protocol::{PayloadItem, PayloadSize, SendError};
use bytes::{Buf, BytesMut};

use tokio_util::codec::Encoder;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadEncoder {
    kind: Kind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Kind {
    Length { expected: u64, written: u64 },

    Chunked(ChunkedEncoder),

    UntilClose { eof: bool },

    NoBody,
}

impl PayloadEncoder {
    pub fn empty() -> Self {
        Self { kind: Kind::NoBody }
    }

    pub fn chunked() -> Self {
        Self { kind: Kind::Chunked(ChunkedEncoder::new()) }
    }

    pub fn fix_length(size: u64) -> Self {
        Self { kind: Kind::Length { expected: size, written: 0 } }
    }

    pub fn until_close() -> Self {
        Self { kind: Kind::UntilClose { eof: false } }
    }

    pub fn is_chunked(&self) -> bool {
        matches!(self.kind, Kind::Chunked(_))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.kind, Kind::NoBody)
    }

    /// True once the body has been completely written.
    pub fn is_finish(&self) -> bool {
        match &self.kind {
            Kind::Length { expected, written } => written == expected,
            Kind::Chunked(encoder) => encoder.is_finish(),
            Kind::UntilClose { eof } => *eof,
            Kind::NoBody => true,
        }
    }
}

impl From<PayloadSize> for PayloadEncoder {
    fn from(size: PayloadSize) -> Self {
        match size {
            PayloadSize::Length(n) => Self::fix_length(n),
            PayloadSize::Chunked => Self::chunked(),
            PayloadSize::UntilClose => Self::until_close(),
            PayloadSize::Empty => Self::empty(),
        }
    }
}

impl<D: Buf> Encoder<PayloadItem<D>> for PayloadEncoder {
    type Error = SendError;

    fn encode(&mut self, item: PayloadItem<D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match &mut self.kind {
            Kind::Length { expected, written } => match item {
                PayloadItem::Chunk(bytes) => {
                    let len = bytes.remaining() as u64;
                    if *written + len > *expected {
                        return Err(SendError::ContentLengthMismatch { expected: *expected, actual: *written + len });
                    }
                    put_buf(bytes, dst);
                    *written += len;
                    Ok(())
                }
                PayloadItem::Eof if written < expected => {
                    Err(SendError::ContentLengthMismatch { expected: *expected, actual: *written })
                }
                PayloadItem::Eof => Ok(()),
            },
            Kind::Chunked(encoder) => encoder.encode(item, dst),
            Kind::UntilClose { eof } => {
                match item {
                    PayloadItem::Chunk(bytes) if !*eof => put_buf(bytes, dst),
                    PayloadItem::Chunk(_) => {}
                    PayloadItem::Eof => *eof = true,
                }
                Ok(())
            }
            Kind::NoBody => match item {
                PayloadItem::Chunk(bytes) if bytes.has_remaining() => {
                    Err(SendError::ContentLengthMismatch { expected: 0, actual: bytes.remaining() as u64 })
                }
                _ => Ok(()),
            },
        }
    }
}

fn put_buf<D: Buf>(mut bytes: D, dst: &mut BytesMut) {
    dst.reserve(bytes.remaining());
    while bytes.has_remaining() {
        let chunk = bytes.chunk();
        let n = chunk.len();
        dst.extend_from_slice(chunk);
        bytes.advance(n);
    }
}
