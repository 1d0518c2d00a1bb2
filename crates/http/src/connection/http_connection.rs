use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, EXPECT, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue, Method, StatusCode, Version};
use tracing::{debug, info, trace, warn};

use super::gzip::GzipMessageDelegate;
use super::{ConnectionContext, Disposition, Http1ConnectionParameters, HttpMessageDelegate};
use crate::codec::{HeadEncoder, PayloadDecoder, PayloadEncoder, RequestHeadDecoder, ResponseHeadDecoder, body_framing};
use crate::concurrent::with_timeout;
use crate::iostream::{IoStream, StreamCloser, StreamError};
use crate::protocol::headers::{contains_token, is_chunked};
use crate::protocol::{HttpError, ParseError, PayloadItem, PayloadSize, RequestStartLine, SendError, StartLine};

const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 (Continue)\r\n\r\n";

/// Where a connection is in the message it is currently reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingStartLine,
    ReadingHeaders,
    ReadingFixedBody,
    ReadingChunkedBody,
    ReadingUntilClose,
    NoBody,
    Finished,
    Closed,
    Detached,
}

impl From<PayloadSize> for ConnectionState {
    fn from(size: PayloadSize) -> Self {
        match size {
            PayloadSize::Length(0) | PayloadSize::Empty => Self::NoBody,
            PayloadSize::Length(_) => Self::ReadingFixedBody,
            PayloadSize::Chunked => Self::ReadingChunkedBody,
            PayloadSize::UntilClose => Self::ReadingUntilClose,
        }
    }
}

/// One HTTP/1.x connection, in the server or the client role.
///
/// Reading is driven by [`read_response`](Self::read_response), which feeds one message to a
/// [`HttpMessageDelegate`]. Writing goes through [`write_headers`](Self::write_headers),
/// [`write`](Self::write) and [`finish`](Self::finish), normally called by that delegate.
#[derive(Debug)]
pub struct Http1Connection {
    stream: Option<IoStream>,
    params: Http1ConnectionParameters,
    context: ConnectionContext,
    is_client: bool,
    state: ConnectionState,

    // the request being answered on a server, the request sent on a client
    request_start_line: Option<RequestStartLine>,
    request_wants_keep_alive: bool,
    trailers: Option<HeaderMap>,

    disconnect_on_finish: bool,
    read_finished: bool,
    write_finished: bool,
    payload_encoder: Option<PayloadEncoder>,
}

impl Http1Connection {
    pub fn server(stream: IoStream, params: Http1ConnectionParameters, context: ConnectionContext) -> Self {
        Self::new(stream, params, context, false)
    }

    pub fn client(stream: IoStream, params: Http1ConnectionParameters) -> Self {
        let context = ConnectionContext::new(stream.peer_addr(), stream.is_secure());
        Self::new(stream, params, context, true)
    }

    fn new(stream: IoStream, params: Http1ConnectionParameters, context: ConnectionContext, is_client: bool) -> Self {
        Self {
            stream: Some(stream),
            params,
            context,
            is_client,
            state: ConnectionState::AwaitingStartLine,
            request_start_line: None,
            request_wants_keep_alive: false,
            trailers: None,
            disconnect_on_finish: false,
            read_finished: false,
            write_finished: false,
            payload_encoder: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.context
    }

    pub fn params(&self) -> &Http1ConnectionParameters {
        &self.params
    }

    pub fn is_client(&self) -> bool {
        self.is_client
    }

    /// Trailer fields that followed the last chunk of the message being read.
    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.trailers.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.stream.as_ref().is_none_or(IoStream::is_closed)
    }

    /// A handle that closes the underlying stream from outside the connection.
    pub fn closer(&self) -> Option<StreamCloser> {
        self.stream.as_ref().map(IoStream::closer)
    }

    /// Closes the stream. Pending reads and writes fail with [`StreamError::Closed`].
    pub fn close(&mut self) {
        if let Some(stream) = &self.stream {
            stream.close();
        }
        if self.state != ConnectionState::Detached {
            self.state = ConnectionState::Closed;
        }
    }

    /// Takes the stream away from the connection, typically for a protocol upgrade.
    ///
    /// The connection stops processing messages once the current callback returns.
    pub fn detach(&mut self) -> Result<IoStream, HttpError> {
        let stream = self.stream.take().ok_or(HttpError::Detached)?;
        debug!(peer = %self.context, "connection detached");
        self.state = ConnectionState::Detached;
        Ok(stream)
    }

    /// Reads one message and hands it to `delegate`.
    ///
    /// Returns `Ok(true)` when the connection can carry another message and `Ok(false)` when it
    /// was closed in an orderly way or detached. Errors are returned after the connection has
    /// been closed.
    pub async fn read_response(&mut self, delegate: &mut dyn HttpMessageDelegate) -> Result<bool, HttpError> {
        if self.params.decompress {
            let mut gzip = GzipMessageDelegate::new(delegate, self.params.chunk_size, self.params.max_body_size);
            self.read_message(&mut gzip).await
        } else {
            self.read_message(delegate).await
        }
    }

    async fn read_message(&mut self, delegate: &mut dyn HttpMessageDelegate) -> Result<bool, HttpError> {
        let mut need_delegate_close = false;
        let result = self.do_read_message(delegate, &mut need_delegate_close).await;

        if need_delegate_close {
            delegate.on_connection_close();
        }
        if !self.is_client && self.context.xheaders() {
            self.context.unapply_xheaders();
        }

        match result {
            Ok(keep_alive) => Ok(keep_alive),
            Err(e) => self.on_read_error(e).await,
        }
    }

    async fn do_read_message(
        &mut self,
        delegate: &mut dyn HttpMessageDelegate,
        need_delegate_close: &mut bool,
    ) -> Result<bool, HttpError> {
        self.reset_message();

        let Some((start_line, headers)) = self.read_head().await? else {
            return Ok(false);
        };
        self.state = ConnectionState::ReadingHeaders;

        let framing = match &start_line {
            StartLine::Request(request) => {
                self.disconnect_on_finish = !self.can_keep_alive(request, &headers);
                self.request_wants_keep_alive = request.version == Version::HTTP_10
                    && contains_token(&headers, CONNECTION, "keep-alive");
                self.request_start_line = Some(request.clone());
                if self.context.xheaders() {
                    self.context.apply_xheaders(&headers);
                }
                body_framing(&headers, None, self.params.max_body_size)?
            }
            StartLine::Response(response) => {
                self.disconnect_on_finish = false;
                let head_request = self.request_start_line.as_ref().is_some_and(|line| line.method == Method::HEAD);
                if head_request || response.code == StatusCode::NOT_MODIFIED || response.code.is_informational() {
                    PayloadSize::Empty
                } else {
                    body_framing(&headers, Some(response.code), self.params.max_body_size)?
                }
            }
        };
        self.read_finished = framing.is_empty();

        let expect_continue = !self.is_client
            && start_line.version() == Version::HTTP_11
            && contains_token(&headers, EXPECT, "100-continue");

        *need_delegate_close = true;
        let mut disposition = delegate.headers_received(self, &start_line, &headers).await?;
        if self.stream.is_none() {
            *need_delegate_close = false;
            return Ok(false);
        }

        if disposition == Disposition::Continue && !self.read_finished {
            if expect_continue && !self.write_finished {
                trace!("sending 100-continue");
                self.stream_mut()?.write(CONTINUE_RESPONSE).await?;
            }

            self.state = ConnectionState::from(framing);
            let body_timeout = self.params.body_timeout;
            disposition = match with_timeout(body_timeout, self.read_body(framing, delegate)).await {
                Ok(disposition) => disposition?,
                Err(timeout) => {
                    info!(peer = %self.context, "timeout reading body");
                    self.close();
                    return Err(timeout.into());
                }
            };
            if self.stream.is_none() {
                *need_delegate_close = false;
                return Ok(false);
            }
            self.read_finished = disposition == Disposition::Continue;
        }

        if !self.read_finished {
            // the rest of the body is still on the wire
            self.disconnect_on_finish = true;
        }

        self.state = ConnectionState::Finished;
        *need_delegate_close = false;
        delegate.finish(self).await?;

        if self.stream.is_none() {
            return Ok(false);
        }
        if !self.is_client && !self.write_finished {
            warn!(peer = %self.context, "message delegate finished without finishing the response");
            self.close();
            return Ok(false);
        }
        if self.disconnect_on_finish || self.is_closed() {
            self.close();
            return Ok(false);
        }

        self.state = ConnectionState::AwaitingStartLine;
        Ok(true)
    }

    async fn read_head(&mut self) -> Result<Option<(StartLine, HeaderMap)>, HttpError> {
        let timeout = if self.is_client {
            self.params.header_timeout
        } else {
            self.params.header_timeout.or(self.params.idle_connection_timeout)
        };
        let max_header_size = self.params.max_header_size;
        let is_client = self.is_client;

        loop {
            let stream = self.stream_mut()?;
            let head = if is_client {
                let mut decoder = ResponseHeadDecoder::new(max_header_size);
                let read = stream.read_frame(&mut decoder);
                with_timeout(timeout, read).await.map(|head| head.map(|(line, headers)| (StartLine::from(line), headers)))
            } else {
                let mut decoder = RequestHeadDecoder::new(max_header_size);
                let read = stream.read_frame(&mut decoder);
                with_timeout(timeout, read).await.map(|head| head.map(|(line, headers)| (StartLine::from(line), headers)))
            };

            let Ok(head) = head else {
                debug!(peer = %self.context, "timed out waiting for a message head");
                self.close();
                return Ok(None);
            };
            let (start_line, headers) = head?;

            // interim responses other than 101 are skipped; 101 goes to the delegate which detaches
            if let StartLine::Response(response) = &start_line
                && response.code.is_informational()
                && response.code != StatusCode::SWITCHING_PROTOCOLS
            {
                if headers.contains_key(CONTENT_LENGTH) || headers.contains_key(TRANSFER_ENCODING) {
                    return Err(ParseError::UnexpectedBody { status: response.code }.into());
                }
                trace!(status = %response.code, "skipping interim response");
                continue;
            }

            return Ok(Some((start_line, headers)));
        }
    }

    async fn read_body(
        &mut self,
        framing: PayloadSize,
        delegate: &mut dyn HttpMessageDelegate,
    ) -> Result<Disposition, HttpError> {
        let mut decoder = PayloadDecoder::from(framing);
        let max_body_size = self.params.max_body_size;
        let chunk_size = self.params.chunk_size;
        let mut received: u64 = 0;

        loop {
            let item = self.stream_mut()?.read_frame(&mut decoder).await?;
            match item {
                PayloadItem::Chunk(mut chunk) => {
                    received += chunk.len() as u64;
                    if received > max_body_size {
                        return Err(ParseError::TooLargeBody { max_size: max_body_size }.into());
                    }

                    while !chunk.is_empty() {
                        let piece = chunk.split_to(chunk.len().min(chunk_size));
                        if delegate.data_received(self, piece).await? == Disposition::Finished {
                            return Ok(Disposition::Finished);
                        }
                        if self.stream.is_none() {
                            return Ok(Disposition::Finished);
                        }
                    }
                }
                PayloadItem::Eof => {
                    if let Some(trailers) = decoder.take_trailers() {
                        self.trailers.get_or_insert_with(HeaderMap::new).extend(trailers);
                    }
                    return Ok(Disposition::Continue);
                }
            }
        }
    }

    async fn on_read_error(&mut self, e: HttpError) -> Result<bool, HttpError> {
        match &e {
            // the peer went away between messages
            HttpError::Stream(StreamError::Closed { .. }) if self.state == ConnectionState::AwaitingStartLine => {
                self.close();
                return Ok(false);
            }
            HttpError::Input { source } => {
                info!(peer = %self.context, cause = %source, "malformed HTTP message");
                let status = source.status_code();
                self.write_error_response(status).await;
            }
            HttpError::Delegate(cause) => {
                warn!(peer = %self.context, cause = %cause, "message delegate failed");
                self.write_error_response(StatusCode::INTERNAL_SERVER_ERROR).await;
            }
            HttpError::Output { source } => {
                warn!(peer = %self.context, cause = %source, "failed to write message");
            }
            HttpError::Stream(_) | HttpError::Timeout(_) | HttpError::Detached => {
                debug!(peer = %self.context, cause = %e, "connection lost");
            }
        }
        self.close();
        Err(e)
    }

    /// Best effort: only a server that has not written anything yet answers.
    async fn write_error_response(&mut self, status: StatusCode) {
        if self.is_client || self.payload_encoder.is_some() {
            return;
        }
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        let response = format!(
            "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("Error")
        );
        if let Err(e) = stream.write(response.as_bytes()).await {
            debug!(cause = %e, "failed to write error response");
        }
    }

    fn reset_message(&mut self) {
        self.state = ConnectionState::AwaitingStartLine;
        self.trailers = None;
        self.read_finished = false;
        // a client has already sent the request this message answers
        if !self.is_client {
            self.write_finished = false;
            self.payload_encoder = None;
            self.request_start_line = None;
            self.request_wants_keep_alive = false;
        }
    }

    fn can_keep_alive(&self, request: &RequestStartLine, headers: &HeaderMap) -> bool {
        if self.params.no_keep_alive {
            return false;
        }
        if request.version == Version::HTTP_11 {
            return !contains_token(headers, CONNECTION, "close");
        }
        let self_delimited = headers.contains_key(CONTENT_LENGTH)
            || is_chunked(headers)
            || request.method == Method::HEAD
            || request.method == Method::GET;
        self_delimited && contains_token(headers, CONNECTION, "keep-alive")
    }

    fn stream_mut(&mut self) -> Result<&mut IoStream, HttpError> {
        self.stream.as_mut().ok_or(HttpError::Detached)
    }

    /// Writes the start line and headers of an outgoing message and picks its body framing.
    ///
    /// A server answering an HTTP/1.1 request without `Content-Length` gets chunked encoding;
    /// a response that can't be delimited at all closes the connection after `finish`.
    pub async fn write_headers<L: Into<StartLine>>(&mut self, start_line: L, mut headers: HeaderMap) -> Result<(), HttpError> {
        if self.payload_encoder.is_some() {
            return Err(SendError::HeadersAlreadyWritten.into());
        }
        let start_line = start_line.into();
        let declared_length = match headers.get(CONTENT_LENGTH) {
            Some(value) => Some(
                value
                    .to_str()
                    .ok()
                    .and_then(|value| value.trim().parse::<u64>().ok())
                    .ok_or_else(|| SendError::invalid_header("invalid content-length"))?,
            ),
            None => None,
        };
        let has_transfer_encoding = headers.contains_key(TRANSFER_ENCODING);

        let encoder = match &start_line {
            StartLine::Request(request) => {
                let chunking = matches!(request.method, Method::POST | Method::PUT | Method::PATCH)
                    && declared_length.is_none()
                    && !has_transfer_encoding;
                if chunking {
                    headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
                }
                self.request_start_line = Some(request.clone());

                match declared_length {
                    Some(length) => PayloadEncoder::fix_length(length),
                    None if is_chunked(&headers) => PayloadEncoder::chunked(),
                    None => PayloadEncoder::empty(),
                }
            }
            StartLine::Response(response) => {
                let request_version = self.request_start_line.as_ref().map_or(Version::HTTP_11, |line| line.version);
                let head_request = self.request_start_line.as_ref().is_some_and(|line| line.method == Method::HEAD);
                let code = response.code;
                let bodyless = code.is_informational() || code == StatusCode::NO_CONTENT || code == StatusCode::NOT_MODIFIED;

                let chunking =
                    request_version == Version::HTTP_11 && !bodyless && declared_length.is_none() && !has_transfer_encoding;
                if chunking {
                    headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
                }

                let encoder = if bodyless || head_request {
                    PayloadEncoder::empty()
                } else if let Some(length) = declared_length {
                    PayloadEncoder::fix_length(length)
                } else if is_chunked(&headers) {
                    PayloadEncoder::chunked()
                } else {
                    // not self-delimiting: the body ends when the connection does
                    self.disconnect_on_finish = true;
                    PayloadEncoder::until_close()
                };

                if request_version == Version::HTTP_11 && self.disconnect_on_finish {
                    headers.insert(CONNECTION, HeaderValue::from_static("close"));
                } else if request_version == Version::HTTP_10 && self.request_wants_keep_alive && !self.disconnect_on_finish {
                    headers.insert(CONNECTION, HeaderValue::from_static("Keep-Alive"));
                }
                encoder
            }
        };

        trace!(start_line = %start_line, "writing headers");
        let stream = self.stream_mut()?;
        stream.encode(&mut HeadEncoder, (&start_line, &headers))?;
        stream.flush().await?;
        self.payload_encoder = Some(encoder);
        Ok(())
    }

    /// Writes a piece of the body. `write_headers` must have been called first.
    pub async fn write<B: Into<Bytes>>(&mut self, chunk: B) -> Result<(), HttpError> {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return Ok(());
        }
        self.encode_body(PayloadItem::Chunk(chunk))?;
        self.stream_mut()?.flush().await?;
        Ok(())
    }

    /// Completes the outgoing message.
    ///
    /// Fails with [`SendError::ContentLengthMismatch`] and closes the stream when fewer bytes
    /// than the declared `Content-Length` were written.
    pub async fn finish(&mut self) -> Result<(), HttpError> {
        self.encode_body(PayloadItem::Eof)?;
        self.stream_mut()?.flush().await?;
        self.write_finished = true;
        if !self.read_finished {
            self.disconnect_on_finish = true;
        }
        Ok(())
    }

    fn encode_body(&mut self, item: PayloadItem) -> Result<(), HttpError> {
        let stream = self.stream.as_mut().ok_or(HttpError::Detached)?;
        let encoder = self.payload_encoder.as_mut().ok_or(SendError::HeadersNotWritten)?;
        if let Err(e) = stream.encode(encoder, item) {
            stream.close();
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::mem;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::iostream::StreamConfig;
    use crate::protocol::ResponseStartLine;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Headers(String),
        Data(Vec<u8>),
        Finish(Option<String>),
        Close,
    }

    /// Records callbacks and answers every request in `finish` with its collected body.
    #[derive(Default)]
    struct Recorder {
        events: Arc<Mutex<Vec<Event>>>,
        body: Vec<u8>,
        stop_after_headers: bool,
    }

    impl Recorder {
        fn events(&self) -> Arc<Mutex<Vec<Event>>> {
            Arc::clone(&self.events)
        }

        fn push(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[async_trait]
    impl HttpMessageDelegate for Recorder {
        async fn headers_received(
            &mut self,
            _conn: &mut Http1Connection,
            start_line: &StartLine,
            _headers: &HeaderMap,
        ) -> Result<Disposition, HttpError> {
            self.push(Event::Headers(start_line.to_string()));
            if self.stop_after_headers { Ok(Disposition::Finished) } else { Ok(Disposition::Continue) }
        }

        async fn data_received(&mut self, _conn: &mut Http1Connection, chunk: Bytes) -> Result<Disposition, HttpError> {
            self.push(Event::Data(chunk.to_vec()));
            self.body.extend_from_slice(&chunk);
            Ok(Disposition::Continue)
        }

        async fn finish(&mut self, conn: &mut Http1Connection) -> Result<(), HttpError> {
            let trailer = conn
                .trailers()
                .and_then(|trailers| trailers.get("x-checksum"))
                .map(|value| value.to_str().unwrap().to_owned());
            self.push(Event::Finish(trailer));

            if conn.is_client() {
                return Ok(());
            }
            let mut headers = HeaderMap::new();
            headers.insert(CONTENT_LENGTH, HeaderValue::from(self.body.len()));
            conn.write_headers(ResponseStartLine::new(StatusCode::OK), headers).await?;
            conn.write(mem::take(&mut self.body)).await?;
            conn.finish().await
        }

        fn on_connection_close(&mut self) {
            self.push(Event::Close);
        }
    }

    fn server(params: Http1ConnectionParameters) -> (Http1Connection, DuplexStream) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let stream = IoStream::new(local, StreamConfig::default());
        (Http1Connection::server(stream, params, ConnectionContext::new(None, false)), remote)
    }

    async fn read_available(peer: &mut DuplexStream) -> String {
        let mut buf = vec![0; 64 * 1024];
        let n = peer.read(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[tokio::test]
    async fn get_keeps_connection_alive() {
        let (mut conn, mut peer) = server(Http1ConnectionParameters::default());
        peer.write_all(b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n").await.unwrap();

        let mut delegate = Recorder::default();
        let events = delegate.events();
        assert!(conn.read_response(&mut delegate).await.unwrap());
        assert_eq!(conn.state(), ConnectionState::AwaitingStartLine);
        assert_eq!(
            *events.lock().unwrap(),
            vec![Event::Headers("GET /x HTTP/1.1".into()), Event::Finish(None)]
        );

        let response = read_available(&mut peer).await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("content-length: 0\r\n"));
        assert!(!response.contains("connection: close"));
    }

    #[tokio::test]
    async fn fixed_length_body_is_split_by_chunk_size() {
        let (mut conn, mut peer) = server(Http1ConnectionParameters::default().chunk_size(4));
        peer.write_all(b"POST /echo HTTP/1.1\r\nContent-Length: 10\r\n\r\n0123456789").await.unwrap();

        let mut delegate = Recorder::default();
        let events = delegate.events();
        assert!(conn.read_response(&mut delegate).await.unwrap());
        let events = events.lock().unwrap().clone();
        assert_eq!(events[1], Event::Data(b"0123".to_vec()));
        assert_eq!(events[2], Event::Data(b"4567".to_vec()));
        assert_eq!(events[3], Event::Data(b"89".to_vec()));
        assert_eq!(events[4], Event::Finish(None));

        let response = read_available(&mut peer).await;
        assert!(response.ends_with("\r\n\r\n0123456789"));
    }

    #[tokio::test]
    async fn chunked_body_with_trailers() {
        let (mut conn, mut peer) = server(Http1ConnectionParameters::default());
        let request = concat!(
            "POST /upload HTTP/1.1\r\n",
            "Transfer-Encoding: chunked\r\n\r\n",
            "5\r\nhello\r\n",
            "6;ext=1\r\n world\r\n",
            "0\r\nX-Checksum: abc\r\n\r\n",
        );
        peer.write_all(request.as_bytes()).await.unwrap();

        let mut delegate = Recorder::default();
        let events = delegate.events();
        assert!(conn.read_response(&mut delegate).await.unwrap());
        let events = events.lock().unwrap().clone();
        assert_eq!(events[1], Event::Data(b"hello".to_vec()));
        assert_eq!(events[2], Event::Data(b" world".to_vec()));
        assert_eq!(events[3], Event::Finish(Some("abc".into())));
    }

    #[tokio::test]
    async fn expect_continue_is_answered_before_body() {
        let (mut conn, mut peer) = server(Http1ConnectionParameters::default());
        peer.write_all(b"PUT /f HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 2\r\n\r\n").await.unwrap();

        let reader = tokio::spawn(async move {
            let mut delegate = Recorder::default();
            let keep_alive = conn.read_response(&mut delegate).await.unwrap();
            (conn, keep_alive)
        });

        let interim = read_available(&mut peer).await;
        assert_eq!(interim, "HTTP/1.1 100 (Continue)\r\n\r\n");
        peer.write_all(b"ok").await.unwrap();

        let (_conn, keep_alive) = reader.await.unwrap();
        assert!(keep_alive);
        assert!(read_available(&mut peer).await.ends_with("\r\n\r\nok"));
    }

    #[tokio::test]
    async fn http10_closes_without_keep_alive() {
        let (mut conn, mut peer) = server(Http1ConnectionParameters::default());
        peer.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();

        let mut delegate = Recorder::default();
        assert!(!conn.read_response(&mut delegate).await.unwrap());
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn http10_keep_alive_is_echoed() {
        let (mut conn, mut peer) = server(Http1ConnectionParameters::default());
        peer.write_all(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n").await.unwrap();

        let mut delegate = Recorder::default();
        assert!(conn.read_response(&mut delegate).await.unwrap());
        let response = read_available(&mut peer).await;
        assert!(response.contains("connection: Keep-Alive\r\n"));
    }

    #[tokio::test]
    async fn malformed_request_gets_400() {
        let (mut conn, mut peer) = server(Http1ConnectionParameters::default());
        peer.write_all(b"GET / HTTP/1.1\r\nbad header\r\n\r\n").await.unwrap();

        let mut delegate = Recorder::default();
        let events = delegate.events();
        let err = conn.read_response(&mut delegate).await.unwrap_err();
        assert!(matches!(err, HttpError::Input { .. }));
        assert!(events.lock().unwrap().is_empty());
        assert!(read_available(&mut peer).await.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn oversized_head_gets_431() {
        let (mut conn, mut peer) = server(Http1ConnectionParameters::default().max_header_size(64));
        let request = format!("GET / HTTP/1.1\r\nX-Long: {}\r\n\r\n", "a".repeat(200));
        peer.write_all(request.as_bytes()).await.unwrap();

        let mut delegate = Recorder::default();
        let err = conn.read_response(&mut delegate).await.unwrap_err();
        assert!(matches!(err, HttpError::Input { source: ParseError::TooLargeHeader { .. } }));
        assert!(read_available(&mut peer).await.starts_with("HTTP/1.1 431 "));
    }

    #[tokio::test]
    async fn body_over_limit_is_rejected() {
        let (mut conn, mut peer) = server(Http1ConnectionParameters::default().max_body_size(4));
        peer.write_all(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\n0123456789").await.unwrap();

        let mut delegate = Recorder::default();
        let err = conn.read_response(&mut delegate).await.unwrap_err();
        assert!(matches!(err, HttpError::Input { source: ParseError::TooLargeBody { max_size: 4 } }));
    }

    #[tokio::test]
    async fn chunked_body_over_limit_is_rejected_while_reading() {
        let (mut conn, mut peer) = server(Http1ConnectionParameters::default().max_body_size(4));
        peer.write_all(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n3\r\ndef\r\n0\r\n\r\n")
            .await
            .unwrap();

        let mut delegate = Recorder::default();
        let err = conn.read_response(&mut delegate).await.unwrap_err();
        assert!(matches!(err, HttpError::Input { source: ParseError::TooLargeBody { max_size: 4 } }));
    }

    #[tokio::test]
    async fn peer_closing_mid_body_notifies_delegate() {
        let (mut conn, mut peer) = server(Http1ConnectionParameters::default());
        peer.write_all(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\n0123").await.unwrap();
        drop(peer);

        let mut delegate = Recorder::default();
        let events = delegate.events();
        let err = conn.read_response(&mut delegate).await.unwrap_err();
        assert!(matches!(err, HttpError::Stream(_)));
        assert_eq!(events.lock().unwrap().last(), Some(&Event::Close));
    }

    #[tokio::test]
    async fn peer_closing_between_requests_is_orderly() {
        let (mut conn, peer) = server(Http1ConnectionParameters::default());
        drop(peer);

        let mut delegate = Recorder::default();
        let events = delegate.events();
        assert!(!conn.read_response(&mut delegate).await.unwrap());
        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn idle_timeout_closes() {
        let params = Http1ConnectionParameters::default().idle_connection_timeout(Some(Duration::from_millis(50)));
        let (mut conn, _peer) = server(params);

        let mut delegate = Recorder::default();
        assert!(!conn.read_response(&mut delegate).await.unwrap());
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn finished_disposition_skips_body_and_disconnects() {
        let (mut conn, mut peer) = server(Http1ConnectionParameters::default());
        peer.write_all(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\n0123456789").await.unwrap();

        let mut delegate = Recorder { stop_after_headers: true, ..Recorder::default() };
        let events = delegate.events();
        assert!(!conn.read_response(&mut delegate).await.unwrap());
        let events = events.lock().unwrap().clone();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], Event::Finish(None));
        assert!(read_available(&mut peer).await.contains("connection: close\r\n"));
    }

    #[tokio::test]
    async fn response_without_length_is_chunked() {
        let (mut conn, mut peer) = server(Http1ConnectionParameters::default());
        peer.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut head = RequestHeadDecoder::default();
        let (line, _) = conn.stream_mut().unwrap().read_frame(&mut head).await.unwrap();
        conn.request_start_line = Some(line);

        conn.write_headers(ResponseStartLine::new(StatusCode::OK), HeaderMap::new()).await.unwrap();
        conn.write(Bytes::from_static(b"hello")).await.unwrap();
        conn.finish().await.unwrap();

        let response = read_available(&mut peer).await;
        assert!(response.contains("transfer-encoding: chunked\r\n"));
        assert!(response.ends_with("\r\n\r\n5\r\nhello\r\n0\r\n\r\n"));
    }

    #[tokio::test]
    async fn content_length_is_enforced() {
        let (mut conn, _peer) = server(Http1ConnectionParameters::default());
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("3"));
        conn.write_headers(ResponseStartLine::new(StatusCode::OK), headers).await.unwrap();

        let err = conn.write(Bytes::from_static(b"toolong")).await.unwrap_err();
        assert!(matches!(err, HttpError::Output { source: SendError::ContentLengthMismatch { expected: 3, .. } }));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn short_body_fails_finish() {
        let (mut conn, _peer) = server(Http1ConnectionParameters::default());
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("3"));
        conn.write_headers(ResponseStartLine::new(StatusCode::OK), headers).await.unwrap();
        conn.write(Bytes::from_static(b"a")).await.unwrap();

        let err = conn.finish().await.unwrap_err();
        assert!(matches!(err, HttpError::Output { source: SendError::ContentLengthMismatch { .. } }));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn headers_twice_is_an_error() {
        let (mut conn, _peer) = server(Http1ConnectionParameters::default());
        conn.write_headers(ResponseStartLine::new(StatusCode::NO_CONTENT), HeaderMap::new()).await.unwrap();
        let err = conn.write_headers(ResponseStartLine::new(StatusCode::OK), HeaderMap::new()).await.unwrap_err();
        assert!(matches!(err, HttpError::Output { source: SendError::HeadersAlreadyWritten }));
    }

    #[tokio::test]
    async fn client_reads_response_after_interim() {
        let (local, mut remote) = tokio::io::duplex(64 * 1024);
        let mut conn = Http1Connection::client(IoStream::new(local, StreamConfig::default()), Http1ConnectionParameters::default());

        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("example.com"));
        conn.write_headers(RequestStartLine::new(Method::GET, "/index"), headers).await.unwrap();
        conn.finish().await.unwrap();
        assert_eq!(read_available(&mut remote).await, "GET /index HTTP/1.1\r\nhost: example.com\r\n\r\n");

        remote
            .write_all(b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nbody")
            .await
            .unwrap();
        let mut delegate = Recorder::default();
        let events = delegate.events();
        assert!(conn.read_response(&mut delegate).await.unwrap());
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                Event::Headers("HTTP/1.1 200 OK".into()),
                Event::Data(b"body".to_vec()),
                Event::Finish(None)
            ]
        );
    }

    #[tokio::test]
    async fn client_reads_until_close() {
        let (local, mut remote) = tokio::io::duplex(64 * 1024);
        let mut conn = Http1Connection::client(IoStream::new(local, StreamConfig::default()), Http1ConnectionParameters::default());
        conn.write_headers(RequestStartLine::new(Method::GET, "/"), HeaderMap::new()).await.unwrap();
        conn.finish().await.unwrap();

        remote.write_all(b"HTTP/1.0 200 OK\r\n\r\nstreamed").await.unwrap();
        drop(remote);

        let mut delegate = Recorder::default();
        let events = delegate.events();
        assert!(!conn.read_response(&mut delegate).await.unwrap());
        let events = events.lock().unwrap().clone();
        assert_eq!(events[1], Event::Data(b"streamed".to_vec()));
        assert_eq!(events[2], Event::Finish(None));
    }

    #[tokio::test]
    async fn detach_hands_over_the_stream() {
        struct Upgrade(Option<IoStream>);

        #[async_trait]
        impl HttpMessageDelegate for Upgrade {
            async fn headers_received(
                &mut self,
                conn: &mut Http1Connection,
                _start_line: &StartLine,
                _headers: &HeaderMap,
            ) -> Result<Disposition, HttpError> {
                self.0 = Some(conn.detach()?);
                Ok(Disposition::Finished)
            }

            async fn finish(&mut self, _conn: &mut Http1Connection) -> Result<(), HttpError> {
                unreachable!("detached connections do not finish");
            }
        }

        let (mut conn, mut peer) = server(Http1ConnectionParameters::default());
        peer.write_all(b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\n\r\nframe").await.unwrap();

        let mut delegate = Upgrade(None);
        assert!(!conn.read_response(&mut delegate).await.unwrap());
        assert_eq!(conn.state(), ConnectionState::Detached);

        let mut stream = delegate.0.take().unwrap();
        assert_eq!(stream.read_bytes(5).await.unwrap().as_ref(), b"frame");
    }
}
