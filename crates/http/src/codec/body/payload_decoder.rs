//! Decoder for HTTP message bodies.
//!
//! One [`PayloadDecoder`] per message, picked from the framing computed for its head:
//! - Content-Length: exactly N bytes
//! - chunked transfer encoding, trailers included
//! - read until the peer closes (responses only)
//! - no body at all

use crate::codec::body::chunked_decoder::ChunkedDecoder;
use crate::protocol::{ParseError, PayloadItem, PayloadSize};
use bytes::BytesMut;
use http::HeaderMap;
use tokio_util::codec::Decoder;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadDecoder {
    kind: Kind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Kind {
    /// Bytes still expected
    Length(u64),

    Chunked(ChunkedDecoder),

    UntilClose { eof: bool },

    NoBody,
}

impl PayloadDecoder {
    pub fn empty() -> Self {
        Self { kind: Kind::NoBody }
    }

    pub fn chunked() -> Self {
        Self { kind: Kind::Chunked(ChunkedDecoder::new()) }
    }

    pub fn fix_length(size: u64) -> Self {
        Self { kind: Kind::Length(size) }
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

    /// Trailer fields of a chunked body, once the body has been fully decoded.
    pub fn take_trailers(&mut self) -> Option<HeaderMap> {
        match &mut self.kind {
            Kind::Chunked(decoder) => decoder.take_trailers(),
            _ => None,
        }
    }
}

impl From<PayloadSize> for PayloadDecoder {
    fn from(size: PayloadSize) -> Self {
        match size {
            PayloadSize::Length(n) => Self::fix_length(n),
            PayloadSize::Chunked => Self::chunked(),
            PayloadSize::UntilClose => Self::until_close(),
            PayloadSize::Empty => Self::empty(),
        }
    }
}

impl Decoder for PayloadDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match &mut self.kind {
            Kind::Length(0) => Ok(Some(PayloadItem::Eof)),
            Kind::Length(remaining) => {
                if src.is_empty() {
                    return Ok(None);
                }
                let len = usize::try_from(*remaining).unwrap_or(usize::MAX).min(src.len());
                *remaining -= len as u64;
                trace!(len, remaining = *remaining, "read fixed length bytes");
                Ok(Some(PayloadItem::Chunk(src.split_to(len).freeze())))
            }
            Kind::Chunked(decoder) => decoder.decode(src),
            Kind::UntilClose { eof: true } => Ok(Some(PayloadItem::Eof)),
            Kind::UntilClose { eof: false } => {
                if src.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(PayloadItem::Chunk(src.split().freeze())))
                }
            }
            Kind::NoBody => Ok(Some(PayloadItem::Eof)),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match &mut self.kind {
            Kind::UntilClose { eof } => {
                if src.is_empty() {
                    *eof = true;
                    Ok(Some(PayloadItem::Eof))
                } else {
                    Ok(Some(PayloadItem::Chunk(src.split().freeze())))
                }
            }
            // a truncated body surfaces as a closed stream
            _ => self.decode(src),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_length_stops_at_boundary() {
        let mut buffer: BytesMut = BytesMut::from(&b"101234567890abcdef\r\n\r\n"[..]);

        let mut decoder = PayloadDecoder::fix_length(10);
        let payload = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(&payload.as_bytes().unwrap()[..], b"1012345678");
        assert_eq!(&buffer[..], b"90abcdef\r\n\r\n");

        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_eof());
    }

    #[test]
    fn fixed_length_across_fragments() {
        let mut decoder = PayloadDecoder::from(PayloadSize::Length(6));
        let mut buffer = BytesMut::from(&b"abc"[..]);

        assert_eq!(&decoder.decode(&mut buffer).unwrap().unwrap().into_bytes().unwrap()[..], b"abc");
        assert!(decoder.decode(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(b"defGET");
        assert_eq!(&decoder.decode(&mut buffer).unwrap().unwrap().into_bytes().unwrap()[..], b"def");
        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_eof());
        assert_eq!(&buffer[..], b"GET");
    }

    #[test]
    fn truncated_fixed_length_yields_nothing_at_eof() {
        let mut decoder = PayloadDecoder::fix_length(6);
        let mut buffer = BytesMut::new();
        assert!(decoder.decode_eof(&mut buffer).unwrap().is_none());
    }

    #[test]
    fn until_close_drains_then_ends() {
        let mut decoder = PayloadDecoder::until_close();
        let mut buffer = BytesMut::from(&b"partial"[..]);

        assert_eq!(&decoder.decode(&mut buffer).unwrap().unwrap().into_bytes().unwrap()[..], b"partial");
        assert!(decoder.decode(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(b"tail");
        assert_eq!(&decoder.decode_eof(&mut buffer).unwrap().unwrap().into_bytes().unwrap()[..], b"tail");
        assert!(decoder.decode_eof(&mut buffer).unwrap().unwrap().is_eof());
        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_eof());
    }

    #[test]
    fn no_body_is_immediately_done() {
        let mut decoder = PayloadDecoder::from(PayloadSize::Empty);
        let mut buffer = BytesMut::from(&b"GET / HTTP/1.1\r\n"[..]);
        assert!(decoder.is_empty());
        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_eof());
        assert_eq!(buffer.len(), 16);
    }

    #[test]
    fn chunked_exposes_trailers() {
        let mut decoder = PayloadDecoder::chunked();
        let mut buffer = BytesMut::from(&b"3\r\nabc\r\n0\r\nX-Sum: 1\r\n\r\n"[..]);
        assert!(decoder.is_chunked());

        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_chunk());
        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_eof());
        assert_eq!(decoder.take_trailers().unwrap().get("x-sum").unwrap(), "1");
    }
}
