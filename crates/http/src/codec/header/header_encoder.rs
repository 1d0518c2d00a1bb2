//! Serializes the head of an HTTP/1.x message: start line, header fields, blank line.
//!
//! The encoder writes exactly what it is given. Framing headers (`Content-Length`,
//! `Transfer-Encoding`, `Connection`) are settled by the connection before encoding.

use crate::codec::FastWrite;
use crate::protocol::{SendError, StartLine};

use bytes::{BufMut, BytesMut};

use http::HeaderMap;
use std::io::Write;
use tokio_util::codec::Encoder;

/// Initial buffer size allocated for header serialization
const INIT_HEADER_SIZE: usize = 4 * 1024;

/// Encoder for message heads implementing the [`Encoder`] trait.
///
/// Both roles always speak HTTP/1.1 on the wire.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeadEncoder;

impl Encoder<(&StartLine, &HeaderMap)> for HeadEncoder {
    type Error = SendError;

    fn encode(&mut self, item: (&StartLine, &HeaderMap), dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (start_line, headers) = item;

        dst.reserve(INIT_HEADER_SIZE);
        match start_line {
            StartLine::Request(line) => write!(FastWrite(dst), "{} {} HTTP/1.1\r\n", line.method, line.path)?,
            StartLine::Response(line) => write!(FastWrite(dst), "HTTP/1.1 {} {}\r\n", line.code.as_str(), line.reason)?,
        }

        for (header_name, header_value) in headers {
            dst.put_slice(header_name.as_ref());
            dst.put_slice(b": ");
            dst.put_slice(header_value.as_ref());
            dst.put_slice(b"\r\n");
        }
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RequestStartLine, ResponseStartLine};
    use http::header::{CONTENT_LENGTH, HOST};
    use http::{HeaderValue, Method, StatusCode};

    #[test]
    fn encodes_response_head() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from(5));
        let start_line = StartLine::from(ResponseStartLine::new(StatusCode::OK));

        let mut dst = BytesMut::new();
        HeadEncoder.encode((&start_line, &headers), &mut dst).unwrap();
        assert_eq!(&dst[..], b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\n");
    }

    #[test]
    fn encodes_request_head() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("example.com"));
        let start_line = StartLine::from(RequestStartLine::new(Method::GET, "/chat"));

        let mut dst = BytesMut::new();
        HeadEncoder.encode((&start_line, &headers), &mut dst).unwrap();
        assert_eq!(&dst[..], b"GET /chat HTTP/1.1\r\nhost: example.com\r\n\r\n");
    }
}
