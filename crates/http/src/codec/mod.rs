//! HTTP/1.x codecs.
//!
//! The connection reads and writes through these [`Decoder`](tokio_util::codec::Decoder) and
//! [`Encoder`](tokio_util::codec::Encoder) implementations, run directly against the buffers of
//! an [`IoStream`](crate::iostream::IoStream):
//!
//! - heads via [`RequestHeadDecoder`], [`ResponseHeadDecoder`] and [`HeadEncoder`]
//! - bodies via [`PayloadDecoder`] and [`PayloadEncoder`], framed per [`body_framing`]
//!
//! # Example
//!
//! ```
//! use bytes::BytesMut;
//! use gale_http::codec::{PayloadDecoder, RequestHeadDecoder, body_framing};
//! use tokio_util::codec::Decoder;
//!
//! let mut buffer = BytesMut::from(&b"POST /echo HTTP/1.1\r\nContent-Length: 2\r\n\r\nhi"[..]);
//! let (start_line, headers) = RequestHeadDecoder::default().decode(&mut buffer).unwrap().unwrap();
//! assert_eq!(start_line.path, "/echo");
//!
//! let mut body = PayloadDecoder::from(body_framing(&headers, None, u64::MAX).unwrap());
//! let chunk = body.decode(&mut buffer).unwrap().unwrap();
//! assert_eq!(chunk.as_bytes().unwrap().as_ref(), b"hi");
//! ```

use std::io;

use bytes::{BufMut, BytesMut};

mod body;
mod header;

pub use body::PayloadDecoder;
pub use body::PayloadEncoder;
pub use header::DEFAULT_MAX_HEADER_SIZE;
pub use header::HeadEncoder;
pub use header::RequestHeadDecoder;
pub use header::ResponseHeadDecoder;
pub use header::body_framing;

/// `io::Write` adapter appending straight into a `BytesMut`.
pub(crate) struct FastWrite<'a>(pub(crate) &'a mut BytesMut);

impl io::Write for FastWrite<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.put_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
