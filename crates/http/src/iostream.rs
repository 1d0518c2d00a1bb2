//! Buffered, closeable byte stream.
//!
//! [`IoStream`] wraps any boxed duplex transport with a read buffer, a write buffer and a shared
//! close state. Reads are expressed as [`Decoder`]s run against the read buffer: the built-in
//! ones cover exact lengths, partial reads, delimiters and read-until-close, and the HTTP and
//! WebSocket codecs plug into the same [`ReadStream::read_frame`] loop.
//!
//! Every read takes `&mut self`, so at most one read is pending per stream.
//!
//! The stream can be [`split`](IoStream::split) into a [`ReadStream`] and a [`WriteStream`].
//! Both halves share one close state: closing either one fails pending operations on both and
//! fires the close callback exactly once.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Any transport the stream can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

type BoxedStream = Box<dyn AsyncStream>;
type CloseCallback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Error, Debug, Clone)]
pub enum StreamError {
    #[error("stream is closed")]
    Closed {
        #[source]
        real_error: Option<Arc<io::Error>>,
    },

    #[error("delimiter not found within {max_bytes} bytes")]
    UnsatisfiableRead { max_bytes: usize },

    #[error("buffer reached its maximum size {max_size}")]
    BufferFull { max_size: usize },
}

impl StreamError {
    pub fn closed() -> Self {
        Self::Closed { real_error: None }
    }

    /// The I/O error that caused the stream to close, if any.
    pub fn real_error(&self) -> Option<&io::Error> {
        match self {
            Self::Closed { real_error } => real_error.as_deref(),
            _ => None,
        }
    }
}

impl From<io::Error> for StreamError {
    fn from(e: io::Error) -> Self {
        Self::Closed { real_error: Some(Arc::new(e)) }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StreamConfig {
    /// Largest amount of unread data the read buffer may hold.
    pub max_buffer_size: usize,
    /// How much buffer space is reserved before each socket read.
    pub read_chunk_size: usize,
    /// Largest amount of unflushed data the write buffer may hold, `None` is unbounded.
    pub max_write_buffer_size: Option<usize>,
    /// Disables Nagle's algorithm on TCP sockets wrapped by [`IoStream::from_tcp`].
    pub nodelay: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self { max_buffer_size: 100 * 1024 * 1024, read_chunk_size: 64 * 1024, max_write_buffer_size: None, nodelay: true }
    }
}

impl StreamConfig {
    pub fn max_buffer_size(mut self, max_buffer_size: usize) -> Self {
        self.max_buffer_size = max_buffer_size;
        self
    }

    pub fn read_chunk_size(mut self, read_chunk_size: usize) -> Self {
        self.read_chunk_size = read_chunk_size;
        self
    }

    pub fn max_write_buffer_size(mut self, max_write_buffer_size: Option<usize>) -> Self {
        self.max_write_buffer_size = max_write_buffer_size;
        self
    }

    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

struct CloseState {
    token: CancellationToken,
    callback: Mutex<Option<CloseCallback>>,
    error: Mutex<Option<Arc<io::Error>>>,
}

impl CloseState {
    fn new() -> Arc<Self> {
        Arc::new(Self { token: CancellationToken::new(), callback: Mutex::new(None), error: Mutex::new(None) })
    }

    fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    fn close(&self, error: Option<Arc<io::Error>>) {
        if self.token.is_cancelled() {
            return;
        }
        if let Some(error) = error {
            debug!(cause = %error, "closing stream after I/O error");
            self.error.lock().unwrap_or_else(PoisonError::into_inner).get_or_insert(error);
        }
        self.token.cancel();
        self.run_callback();
    }

    fn set_callback(&self, callback: CloseCallback) {
        *self.callback.lock().unwrap_or_else(PoisonError::into_inner) = Some(callback);
        if self.is_closed() {
            self.run_callback();
        }
    }

    fn run_callback(&self) {
        let callback = self.callback.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn closed_error(&self) -> StreamError {
        StreamError::Closed { real_error: self.error.lock().unwrap_or_else(PoisonError::into_inner).clone() }
    }
}

/// A cloneable handle that can close a stream from anywhere, e.g. a timer callback.
#[derive(Clone)]
pub struct StreamCloser {
    state: Arc<CloseState>,
}

impl fmt::Debug for StreamCloser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamCloser").field("closed", &self.is_closed()).finish()
    }
}

impl StreamCloser {
    pub fn close(&self) {
        self.state.close(None);
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Resolves once the stream has been closed, locally or by the peer.
    pub async fn closed(&self) {
        self.state.token.cancelled().await;
    }
}

/// The reading half of a stream.
pub struct ReadStream {
    io: ReadHalf<BoxedStream>,
    buffer: BytesMut,
    state: Arc<CloseState>,
    config: StreamConfig,
    eof: bool,
}

impl fmt::Debug for ReadStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadStream")
            .field("buffered", &self.buffer.len())
            .field("eof", &self.eof)
            .field("closed", &self.state.is_closed())
            .finish_non_exhaustive()
    }
}

impl ReadStream {
    /// Runs `decoder` against the read buffer, reading from the transport until it yields an item.
    ///
    /// Buffered data is still served after the stream closed. Once no more data can arrive the
    /// decoder gets a last chance through [`Decoder::decode_eof`]; if it has nothing to give the
    /// read fails with [`StreamError::Closed`].
    pub async fn read_frame<D>(&mut self, decoder: &mut D) -> Result<D::Item, D::Error>
    where
        D: Decoder,
        D::Error: From<StreamError>,
    {
        loop {
            if let Some(item) = decoder.decode(&mut self.buffer)? {
                return Ok(item);
            }

            if self.eof || self.state.is_closed() {
                return match decoder.decode_eof(&mut self.buffer)? {
                    Some(item) => Ok(item),
                    None => Err(self.state.closed_error().into()),
                };
            }

            if self.buffer.len() >= self.config.max_buffer_size {
                self.state.close(None);
                return Err(StreamError::BufferFull { max_size: self.config.max_buffer_size }.into());
            }

            self.fill_buffer().await?;
        }
    }

    async fn fill_buffer(&mut self) -> Result<(), StreamError> {
        self.buffer.reserve(self.config.read_chunk_size);
        let read = tokio::select! {
            biased;
            () = self.state.token.cancelled() => return Err(self.state.closed_error()),
            read = self.io.read_buf(&mut self.buffer) => read,
        };

        match read {
            Ok(0) => {
                trace!("peer closed the stream");
                self.eof = true;
                self.state.close(None);
                Ok(())
            }
            Ok(n) => {
                trace!(len = n, "read from transport");
                Ok(())
            }
            Err(e) => {
                let e = Arc::new(e);
                self.state.close(Some(Arc::clone(&e)));
                Err(StreamError::Closed { real_error: Some(e) })
            }
        }
    }

    /// Reads exactly `num_bytes` bytes.
    pub async fn read_bytes(&mut self, num_bytes: usize) -> Result<Bytes, StreamError> {
        self.read_frame(&mut ExactBytes(num_bytes)).await
    }

    /// Reads between 1 and `num_bytes` bytes, whatever is available first.
    pub async fn read_bytes_partial(&mut self, num_bytes: usize) -> Result<Bytes, StreamError> {
        self.read_frame(&mut PartialBytes(num_bytes)).await
    }

    /// Reads up to and including `delimiter`.
    ///
    /// When the delimiter does not show up within `max_bytes` the stream is closed and
    /// [`StreamError::UnsatisfiableRead`] is returned.
    pub async fn read_until(&mut self, delimiter: &[u8], max_bytes: usize) -> Result<Bytes, StreamError> {
        let mut decoder = Delimited { delimiter, max_bytes, searched: 0 };
        let result = self.read_frame(&mut decoder).await;
        if let Err(StreamError::UnsatisfiableRead { max_bytes }) = &result {
            debug!(max_bytes, "delimiter not found, closing stream");
            self.state.close(None);
        }
        result
    }

    /// Reads everything until the peer closes the stream.
    pub async fn read_until_close(&mut self) -> Result<Bytes, StreamError> {
        self.read_frame(&mut UntilClose).await
    }

    pub fn set_close_callback<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.state.set_callback(Box::new(callback));
    }

    pub fn close(&self) {
        self.state.close(None);
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    pub fn closer(&self) -> StreamCloser {
        StreamCloser { state: Arc::clone(&self.state) }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// The writing half of a stream.
pub struct WriteStream {
    io: WriteHalf<BoxedStream>,
    buffer: BytesMut,
    state: Arc<CloseState>,
    config: StreamConfig,
}

impl fmt::Debug for WriteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteStream")
            .field("pending", &self.buffer.len())
            .field("closed", &self.state.is_closed())
            .finish_non_exhaustive()
    }
}

impl WriteStream {
    /// Appends `data` to the write buffer without flushing.
    pub fn write_buffered(&mut self, data: &[u8]) -> Result<(), StreamError> {
        self.ensure_open()?;
        self.buffer.extend_from_slice(data);
        self.check_buffer_size()
    }

    /// Encodes `item` straight into the write buffer without flushing.
    pub fn encode<E, I>(&mut self, encoder: &mut E, item: I) -> Result<(), E::Error>
    where
        E: Encoder<I>,
        E::Error: From<StreamError>,
    {
        self.ensure_open()?;
        encoder.encode(item, &mut self.buffer)?;
        Ok(self.check_buffer_size()?)
    }

    /// Appends `data` and flushes the whole write buffer.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), StreamError> {
        self.write_buffered(data)?;
        self.flush().await
    }

    /// Resolves once every buffered byte has been handed to the transport.
    pub async fn flush(&mut self) -> Result<(), StreamError> {
        while self.buffer.has_remaining() {
            let written = tokio::select! {
                biased;
                () = self.state.token.cancelled() => return Err(self.state.closed_error()),
                written = self.io.write_buf(&mut self.buffer) => written,
            };

            match written {
                Ok(0) => return Err(self.fail(io::Error::from(io::ErrorKind::WriteZero))),
                Ok(n) => trace!(len = n, "wrote to transport"),
                Err(e) => return Err(self.fail(e)),
            }
        }

        self.io.flush().await.map_err(|e| self.fail(e))
    }

    /// Flushes what is buffered, then shuts the transport's write side down and closes the stream.
    pub async fn shutdown(&mut self) -> Result<(), StreamError> {
        let flushed = self.flush().await;
        let shutdown = self.io.shutdown().await;
        self.state.close(None);
        flushed?;
        shutdown.map_err(StreamError::from)
    }

    pub fn set_close_callback<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.state.set_callback(Box::new(callback));
    }

    pub fn close(&self) {
        self.state.close(None);
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    pub fn closer(&self) -> StreamCloser {
        StreamCloser { state: Arc::clone(&self.state) }
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn ensure_open(&self) -> Result<(), StreamError> {
        if self.state.is_closed() { Err(self.state.closed_error()) } else { Ok(()) }
    }

    fn check_buffer_size(&mut self) -> Result<(), StreamError> {
        match self.config.max_write_buffer_size {
            Some(max_size) if self.buffer.len() > max_size => {
                debug!(max_size, pending = self.buffer.len(), "write buffer full, closing stream");
                self.buffer.clear();
                self.state.close(None);
                Err(StreamError::BufferFull { max_size })
            }
            _ => Ok(()),
        }
    }

    fn fail(&self, e: io::Error) -> StreamError {
        let e = Arc::new(e);
        self.state.close(Some(Arc::clone(&e)));
        StreamError::Closed { real_error: Some(e) }
    }
}

/// A buffered duplex stream.
pub struct IoStream {
    reader: ReadStream,
    writer: WriteStream,
    peer_addr: Option<SocketAddr>,
    secure: bool,
}

impl fmt::Debug for IoStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoStream")
            .field("peer_addr", &self.peer_addr)
            .field("secure", &self.secure)
            .field("reader", &self.reader)
            .field("writer", &self.writer)
            .finish()
    }
}

impl IoStream {
    pub fn new<S: AsyncStream>(io: S, config: StreamConfig) -> Self {
        let boxed: BoxedStream = Box::new(io);
        let (read_half, write_half) = tokio::io::split(boxed);
        let state = CloseState::new();
        Self {
            reader: ReadStream {
                io: read_half,
                buffer: BytesMut::with_capacity(config.read_chunk_size),
                state: Arc::clone(&state),
                config,
                eof: false,
            },
            writer: WriteStream { io: write_half, buffer: BytesMut::new(), state, config },
            peer_addr: None,
            secure: false,
        }
    }

    /// Wraps an accepted or connected TCP socket. Nagle's algorithm is disabled unless
    /// [`StreamConfig::nodelay`] is turned off.
    pub fn from_tcp(tcp: TcpStream, config: StreamConfig) -> io::Result<Self> {
        configure_tcp(&tcp, &config)?;
        let peer_addr = tcp.peer_addr().ok();
        Ok(Self::new(tcp, config).with_peer_addr(peer_addr))
    }

    pub fn with_peer_addr(mut self, peer_addr: Option<SocketAddr>) -> Self {
        self.peer_addr = peer_addr;
        self
    }

    /// Marks the transport as encrypted. TLS itself is set up by whoever builds the transport.
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub async fn read_frame<D>(&mut self, decoder: &mut D) -> Result<D::Item, D::Error>
    where
        D: Decoder,
        D::Error: From<StreamError>,
    {
        self.reader.read_frame(decoder).await
    }

    pub async fn read_bytes(&mut self, num_bytes: usize) -> Result<Bytes, StreamError> {
        self.reader.read_bytes(num_bytes).await
    }

    pub async fn read_bytes_partial(&mut self, num_bytes: usize) -> Result<Bytes, StreamError> {
        self.reader.read_bytes_partial(num_bytes).await
    }

    pub async fn read_until(&mut self, delimiter: &[u8], max_bytes: usize) -> Result<Bytes, StreamError> {
        self.reader.read_until(delimiter, max_bytes).await
    }

    pub async fn read_until_close(&mut self) -> Result<Bytes, StreamError> {
        self.reader.read_until_close().await
    }

    pub fn write_buffered(&mut self, data: &[u8]) -> Result<(), StreamError> {
        self.writer.write_buffered(data)
    }

    pub fn encode<E, I>(&mut self, encoder: &mut E, item: I) -> Result<(), E::Error>
    where
        E: Encoder<I>,
        E::Error: From<StreamError>,
    {
        self.writer.encode(encoder, item)
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<(), StreamError> {
        self.writer.write(data).await
    }

    pub async fn flush(&mut self) -> Result<(), StreamError> {
        self.writer.flush().await
    }

    pub async fn shutdown(&mut self) -> Result<(), StreamError> {
        self.writer.shutdown().await
    }

    /// Registers the callback fired once the stream closes. Runs it right away if already closed.
    pub fn set_close_callback<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.reader.set_close_callback(callback);
    }

    /// Marks the stream closed. Idempotent. The transport is released when the stream is dropped.
    pub fn close(&self) {
        self.reader.close();
    }

    pub fn is_closed(&self) -> bool {
        self.reader.is_closed()
    }

    pub fn closer(&self) -> StreamCloser {
        self.reader.closer()
    }

    pub fn split(self) -> (ReadStream, WriteStream) {
        (self.reader, self.writer)
    }
}

struct ExactBytes(usize);

impl Decoder for ExactBytes {
    type Item = Bytes;
    type Error = StreamError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() >= self.0 { Ok(Some(src.split_to(self.0).freeze())) } else { Ok(None) }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decode(src)
    }
}

struct PartialBytes(usize);

impl Decoder for PartialBytes {
    type Item = Bytes;
    type Error = StreamError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() && self.0 > 0 {
            return Ok(None);
        }
        let len = src.len().min(self.0);
        Ok(Some(src.split_to(len).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decode(src)
    }
}

struct Delimited<'a> {
    delimiter: &'a [u8],
    max_bytes: usize,
    searched: usize,
}

impl Decoder for Delimited<'_> {
    type Item = Bytes;
    type Error = StreamError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let delimiter_len = self.delimiter.len();
        if delimiter_len == 0 {
            return Ok(Some(Bytes::new()));
        }

        let found = src[self.searched..].windows(delimiter_len).position(|window| window == self.delimiter);
        match found {
            Some(offset) => {
                let end = self.searched + offset + delimiter_len;
                if end > self.max_bytes {
                    return Err(StreamError::UnsatisfiableRead { max_bytes: self.max_bytes });
                }
                self.searched = 0;
                Ok(Some(src.split_to(end).freeze()))
            }
            None if src.len() >= self.max_bytes => Err(StreamError::UnsatisfiableRead { max_bytes: self.max_bytes }),
            None => {
                // the delimiter may straddle the end of what has been read so far
                self.searched = src.len().saturating_sub(delimiter_len - 1);
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decode(src)
    }
}

struct UntilClose;

impl Decoder for UntilClose {
    type Item = Bytes;
    type Error = StreamError;

    fn decode(&mut self, _src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(Some(src.split().freeze()))
    }
}

fn configure_tcp(tcp: &TcpStream, config: &StreamConfig) -> io::Result<()> {
    tcp.set_nodelay(config.nodelay)
}
