use std::io::Write;
use std::mem;

use async_trait::async_trait;
use bytes::Bytes;
use flate2::write::GzDecoder;
use http::header::CONTENT_ENCODING;
use http::{HeaderMap, HeaderName};
use tracing::trace;

use super::{Disposition, Http1Connection, HttpMessageDelegate};
use crate::protocol::{HttpError, ParseError, StartLine};

static X_CONSUMED_CONTENT_ENCODING: HeaderName = HeaderName::from_static("x-consumed-content-encoding");

/// Wraps a delegate so it only ever sees inflated bodies of `Content-Encoding: gzip` messages.
///
/// The inflated size is held to `max_body_size` as well, not just the bytes on the wire.
pub(crate) struct GzipMessageDelegate<'a> {
    inner: &'a mut dyn HttpMessageDelegate,
    chunk_size: usize,
    max_body_size: u64,
    inflated: u64,
    decoder: Option<GzDecoder<Vec<u8>>>,
}

impl<'a> GzipMessageDelegate<'a> {
    pub(crate) fn new(inner: &'a mut dyn HttpMessageDelegate, chunk_size: usize, max_body_size: u64) -> Self {
        Self { inner, chunk_size, max_body_size, inflated: 0, decoder: None }
    }

    /// Forwards whatever the decoder produced so far, at most `chunk_size` bytes at a time.
    async fn forward(&mut self, conn: &mut Http1Connection) -> Result<Disposition, HttpError> {
        let Some(decoder) = self.decoder.as_mut() else {
            return Ok(Disposition::Continue);
        };
        let mut inflated = Bytes::from(mem::take(decoder.get_mut()));
        self.inflated += inflated.len() as u64;
        if self.inflated > self.max_body_size {
            return Err(ParseError::TooLargeBody { max_size: self.max_body_size }.into());
        }
        while !inflated.is_empty() {
            let piece = inflated.split_to(inflated.len().min(self.chunk_size));
            if self.inner.data_received(conn, piece).await? == Disposition::Finished {
                return Ok(Disposition::Finished);
            }
        }
        Ok(Disposition::Continue)
    }
}

#[async_trait]
impl HttpMessageDelegate for GzipMessageDelegate<'_> {
    async fn headers_received(
        &mut self,
        conn: &mut Http1Connection,
        start_line: &StartLine,
        headers: &HeaderMap,
    ) -> Result<Disposition, HttpError> {
        let gzipped = headers
            .get(CONTENT_ENCODING)
            .is_some_and(|encoding| encoding.as_bytes().eq_ignore_ascii_case(b"gzip"));
        if !gzipped {
            return self.inner.headers_received(conn, start_line, headers).await;
        }

        trace!("inflating gzip body");
        self.decoder = Some(GzDecoder::new(Vec::new()));
        let mut headers = headers.clone();
        if let Some(encoding) = headers.remove(CONTENT_ENCODING) {
            headers.insert(X_CONSUMED_CONTENT_ENCODING.clone(), encoding);
        }
        self.inner.headers_received(conn, start_line, &headers).await
    }

    async fn data_received(&mut self, conn: &mut Http1Connection, chunk: Bytes) -> Result<Disposition, HttpError> {
        let Some(decoder) = self.decoder.as_mut() else {
            return self.inner.data_received(conn, chunk).await;
        };
        decoder.write_all(&chunk).map_err(|e| ParseError::invalid_body(format!("gzip: {e}")))?;
        self.forward(conn).await
    }

    async fn finish(&mut self, conn: &mut Http1Connection) -> Result<(), HttpError> {
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.try_finish().map_err(|e| ParseError::invalid_body(format!("gzip: {e}")))?;
            self.forward(conn).await?;
        }
        self.inner.finish(conn).await
    }

    fn on_connection_close(&mut self) {
        self.inner.on_connection_close();
    }
}
