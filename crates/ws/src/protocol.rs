//! The WebSocket engine: one task reads frames and drives the handler, another owns the write
//! half and serializes everything that goes out.
//!
//! Closing follows RFC 6455 section 7. Whoever sends the first close frame waits up to
//! [`WebSocketOptions::close_timeout`] for the peer's answer before dropping the connection; the
//! side receiving it echoes the status code and closes right away.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use gale_http::concurrent::with_timeout;
use gale_http::ioloop::{LoopHandle, TimeoutHandle};
use gale_http::iostream::{IoStream, ReadStream, StreamCloser, StreamError, WriteStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::compression::{Deflater, Inflater, PerMessageDeflate};
use crate::frame::{CloseCode, Frame, FrameEncoder, FrameReader, MAX_CONTROL_PAYLOAD, OpCode, Role};
use crate::{CloseStatus, Message, WebSocketError, WebSocketHandler};

/// Limits and timers of one WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WebSocketOptions {
    /// Largest accepted message, after reassembly and inflation.
    pub max_message_size: usize,
    /// How long to wait for the peer's close frame after sending ours.
    pub close_timeout: Duration,
    /// Send a ping whenever nothing was received for this long.
    pub ping_interval: Option<Duration>,
}

impl Default for WebSocketOptions {
    fn default() -> Self {
        Self { max_message_size: 10 * 1024 * 1024, close_timeout: Duration::from_secs(5), ping_interval: None }
    }
}

impl WebSocketOptions {
    pub fn max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    pub fn close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }

    pub fn ping_interval(mut self, ping_interval: Option<Duration>) -> Self {
        self.ping_interval = ping_interval;
        self
    }
}

/// Byte counters of a connection. Message bytes are payloads as the application sees them,
/// wire bytes include frame headers and reflect compression.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WebSocketStats {
    pub message_bytes_in: u64,
    pub message_bytes_out: u64,
    pub wire_bytes_in: u64,
    pub wire_bytes_out: u64,
}

#[derive(Debug, Default)]
struct Counters {
    message_bytes_in: AtomicU64,
    message_bytes_out: AtomicU64,
    wire_bytes_in: AtomicU64,
    wire_bytes_out: AtomicU64,
}

enum Command {
    Message { message: Message, done: oneshot::Sender<Result<(), WebSocketError>> },
    Ping(Bytes),
    Pong(Bytes),
    Close { code: Option<CloseCode>, reason: Option<String> },
    /// Both close frames are out: drop the connection.
    Shutdown,
}

struct Shared {
    closer: StreamCloser,
    close_sent: AtomicBool,
    close_received: AtomicBool,
    status: Mutex<CloseStatus>,
    counters: Counters,
}

/// Sending side of a WebSocket, cheap to clone.
#[derive(Clone)]
pub struct WebSocketConnection {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl fmt::Debug for WebSocketConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketConnection")
            .field("closing", &self.is_closing())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl WebSocketConnection {
    /// Sends `message` as a single frame. Resolves once it has been written to the transport.
    ///
    /// Fails with [`WebSocketError::ConnectionClosed`] once the close handshake has started.
    pub async fn write_message<M: Into<Message>>(&self, message: M) -> Result<(), WebSocketError> {
        if self.is_closing() {
            return Err(WebSocketError::ConnectionClosed);
        }
        let (done, written) = oneshot::channel();
        self.send(Command::Message { message: message.into(), done })?;
        written.await.map_err(|_| WebSocketError::ConnectionClosed)?
    }

    /// Queues a ping. The payload must fit a control frame.
    pub fn ping<B: Into<Bytes>>(&self, data: B) -> Result<(), WebSocketError> {
        let data = data.into();
        if data.len() > MAX_CONTROL_PAYLOAD {
            return Err(WebSocketError::PayloadTooLarge(data.len()));
        }
        if self.is_closing() {
            return Err(WebSocketError::ConnectionClosed);
        }
        self.send(Command::Ping(data))
    }

    /// Starts the close handshake. A reason without a code is sent as a normal closure.
    ///
    /// The connection is dropped when the peer answers or after the close timeout. Calling this
    /// again, or after the connection is gone, does nothing.
    pub fn close(&self, code: Option<CloseCode>, reason: Option<&str>) {
        if self.shared.closer.is_closed() {
            return;
        }
        self.send_close(code, reason.map(str::to_owned));
    }

    /// Drops the connection without a close handshake.
    pub fn abort(&self) {
        self.shared.closer.close();
    }

    /// Status code of the close frame the peer sent.
    pub fn close_code(&self) -> Option<CloseCode> {
        self.status().code
    }

    pub fn close_reason(&self) -> Option<String> {
        self.status().reason
    }

    /// A close frame went out or came in, or the connection is already gone.
    pub fn is_closing(&self) -> bool {
        self.shared.close_sent.load(Ordering::Acquire)
            || self.shared.close_received.load(Ordering::Acquire)
            || self.shared.closer.is_closed()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closer.is_closed()
    }

    pub fn stats(&self) -> WebSocketStats {
        let counters = &self.shared.counters;
        WebSocketStats {
            message_bytes_in: counters.message_bytes_in.load(Ordering::Relaxed),
            message_bytes_out: counters.message_bytes_out.load(Ordering::Relaxed),
            wire_bytes_in: counters.wire_bytes_in.load(Ordering::Relaxed),
            wire_bytes_out: counters.wire_bytes_out.load(Ordering::Relaxed),
        }
    }

    fn status(&self) -> CloseStatus {
        self.shared.status.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn send(&self, command: Command) -> Result<(), WebSocketError> {
        self.commands.send(command).map_err(|_| WebSocketError::ConnectionClosed)
    }

    /// Queues our close frame unless one was queued before.
    fn send_close(&self, code: Option<CloseCode>, reason: Option<String>) {
        if !self.shared.close_sent.swap(true, Ordering::AcqRel) {
            let _ = self.send(Command::Close { code, reason });
        }
    }
}

/// A message being reassembled from fragments.
struct Fragments {
    opcode: OpCode,
    compressed: bool,
    buffer: BytesMut,
}

/// The receiving side of a connection. Created on an upgraded stream, it spawns the writer task
/// right away; [`run`](Self::run) then reads until the connection is closed.
pub(crate) struct WebSocketProtocol {
    conn: WebSocketConnection,
    reader: ReadStream,
    frames: FrameReader,
    inflater: Option<Inflater>,
    options: WebSocketOptions,
    fragments: Option<Fragments>,
}

impl WebSocketProtocol {
    pub(crate) fn new(stream: IoStream, role: Role, options: WebSocketOptions, deflate: Option<PerMessageDeflate>) -> Self {
        let (reader, writer) = stream.split();
        let (deflater, inflater) = deflate.map(PerMessageDeflate::into_parts).unzip();
        let shared = Arc::new(Shared {
            closer: reader.closer(),
            close_sent: AtomicBool::new(false),
            close_received: AtomicBool::new(false),
            status: Mutex::new(CloseStatus::default()),
            counters: Counters::default(),
        });

        let (commands, receiver) = mpsc::unbounded_channel();
        let handle = LoopHandle::current();
        let frame_writer = FrameWriter {
            stream: writer,
            encoder: FrameEncoder::new(role),
            deflater,
            shared: Arc::clone(&shared),
            commands: receiver,
            handle: handle.clone(),
            close_timeout: options.close_timeout,
            close_timer: None,
            close_written: false,
        };
        handle.spawn(frame_writer.run());

        let frames = FrameReader::new(role, inflater.is_some(), options.max_message_size);
        Self { conn: WebSocketConnection { commands, shared }, reader, frames, inflater, options, fragments: None }
    }

    pub(crate) fn connection(&self) -> WebSocketConnection {
        self.conn.clone()
    }

    /// Feeds incoming messages to `handler` until the connection is closed, then reports the
    /// close to it.
    pub(crate) async fn run<H: WebSocketHandler + ?Sized>(mut self, handler: &mut H) {
        if let Err(e) = self.receive(handler).await {
            self.fail(&e);
        }

        let closer = self.conn.shared.closer.clone();
        if with_timeout(Some(self.options.close_timeout), closer.closed()).await.is_err() {
            debug!("connection still open after the close timeout, dropping it");
        }
        closer.close();

        let status = self.conn.status();
        debug!(code = ?status.code, reason = ?status.reason, "websocket closed");
        handler.on_close(&status);
    }

    async fn receive<H: WebSocketHandler + ?Sized>(&mut self, handler: &mut H) -> Result<(), WebSocketError> {
        loop {
            let frame = match self.next_frame().await {
                Ok(frame) => frame,
                Err(WebSocketError::Stream(StreamError::Closed { .. })) => {
                    trace!("stream closed while reading frames");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            self.conn.shared.counters.wire_bytes_in.store(self.frames.wire_bytes(), Ordering::Relaxed);

            let Frame { header, payload } = frame;
            match header.opcode {
                OpCode::Ping => {
                    let _ = self.conn.send(Command::Pong(payload.clone()));
                    handler.on_ping(payload).await.map_err(WebSocketError::Handler)?;
                }
                OpCode::Pong => handler.on_pong(payload).await.map_err(WebSocketError::Handler)?,
                OpCode::Close => {
                    self.close_received(&payload)?;
                    return Ok(());
                }
                OpCode::Continuation => {
                    let fragments = self.fragments.as_mut().ok_or(WebSocketError::UnexpectedContinuation)?;
                    let size = fragments.buffer.len() + payload.len();
                    if size > self.options.max_message_size {
                        return Err(WebSocketError::MessageTooBig {
                            size: size as u64,
                            max_size: self.options.max_message_size,
                        });
                    }
                    fragments.buffer.extend_from_slice(&payload);
                    if header.fin
                        && let Some(fragments) = self.fragments.take()
                    {
                        let data = fragments.buffer.freeze();
                        self.deliver(fragments.opcode, fragments.compressed, data, handler).await?;
                    }
                }
                OpCode::Text | OpCode::Binary => {
                    if self.fragments.is_some() {
                        return Err(WebSocketError::InterleavedMessage);
                    }
                    if header.fin {
                        self.deliver(header.opcode, header.rsv1, payload, handler).await?;
                    } else {
                        let buffer = BytesMut::from(payload);
                        self.fragments = Some(Fragments { opcode: header.opcode, compressed: header.rsv1, buffer });
                    }
                }
            }
        }
    }

    async fn next_frame(&mut self) -> Result<Frame, WebSocketError> {
        let Some(interval) = self.options.ping_interval else {
            return self.frames.read_frame(&mut self.reader).await;
        };
        loop {
            // reading is resumable, so giving up on an idle read loses nothing
            match with_timeout(Some(interval), self.frames.read_frame(&mut self.reader)).await {
                Ok(frame) => return frame,
                Err(_) => {
                    trace!(?interval, "connection idle, sending ping");
                    self.conn.send(Command::Ping(Bytes::new()))?;
                }
            }
        }
    }

    async fn deliver<H: WebSocketHandler + ?Sized>(
        &mut self,
        opcode: OpCode,
        compressed: bool,
        data: Bytes,
        handler: &mut H,
    ) -> Result<(), WebSocketError> {
        let data = match (compressed, self.inflater.as_mut()) {
            (true, Some(inflater)) => inflater.decompress(&data, self.options.max_message_size)?,
            (true, None) => return Err(WebSocketError::ReservedBits(0b100)),
            (false, _) => data,
        };
        self.conn.shared.counters.message_bytes_in.fetch_add(data.len() as u64, Ordering::Relaxed);

        let message = match opcode {
            OpCode::Text => {
                let text = std::str::from_utf8(&data).map_err(|_| WebSocketError::InvalidUtf8)?;
                Message::Text(text.to_owned())
            }
            _ => Message::Binary(data),
        };
        trace!(len = message.len(), text = message.is_text(), "message received");
        handler.on_message(message).await.map_err(WebSocketError::Handler)
    }

    /// Records the peer's close frame, echoes its code and asks the writer to drop the connection
    /// once our own close frame is out.
    fn close_received(&mut self, payload: &[u8]) -> Result<(), WebSocketError> {
        let status = parse_close_payload(payload)?;
        debug!(code = ?status.code, reason = ?status.reason, "close frame received");

        let shared = &self.conn.shared;
        shared.close_received.store(true, Ordering::Release);
        let code = status.code;
        *shared.status.lock().unwrap_or_else(PoisonError::into_inner) = status;

        self.conn.send_close(code, None);
        let _ = self.conn.send(Command::Shutdown);
        Ok(())
    }

    fn fail(&self, e: &WebSocketError) {
        match e.close_code() {
            Some(code) => {
                debug!(cause = %e, %code, "websocket protocol violation");
                self.conn.send_close(Some(code), None);
                if self.conn.send(Command::Shutdown).is_err() {
                    self.conn.abort();
                }
            }
            None => {
                if matches!(e, WebSocketError::Handler(_)) {
                    warn!(cause = %e, "websocket handler failed, aborting connection");
                } else {
                    debug!(cause = %e, "websocket connection failed");
                }
                self.conn.abort();
            }
        }
    }
}

fn parse_close_payload(payload: &[u8]) -> Result<CloseStatus, WebSocketError> {
    match payload {
        [] => Ok(CloseStatus::default()),
        [_] => Err(WebSocketError::InvalidCloseFrame("one byte payload")),
        [high, low, reason @ ..] => {
            let code = CloseCode(u16::from_be_bytes([*high, *low]));
            if !code.is_sendable() {
                return Err(WebSocketError::InvalidCloseFrame("status code may not be sent"));
            }
            let reason = std::str::from_utf8(reason).map_err(|_| WebSocketError::InvalidCloseFrame("reason is not utf-8"))?;
            Ok(CloseStatus { code: Some(code), reason: (!reason.is_empty()).then(|| reason.to_owned()) })
        }
    }
}

/// Owns the write half. Commands are handled in order, each frame flushed before the next.
struct FrameWriter {
    stream: WriteStream,
    encoder: FrameEncoder,
    deflater: Option<Deflater>,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    handle: LoopHandle,
    close_timeout: Duration,
    close_timer: Option<TimeoutHandle>,
    close_written: bool,
}

impl FrameWriter {
    async fn run(mut self) {
        let closer = self.shared.closer.clone();
        loop {
            let command = tokio::select! {
                biased;
                () = closer.closed() => break,
                command = self.commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };

            match command {
                Command::Message { message, done } => {
                    let result = self.write_message(message).await;
                    let _ = done.send(result);
                }
                Command::Ping(data) => self.write_control(Frame::ping(data)).await,
                Command::Pong(data) => self.write_control(Frame::pong(data)).await,
                Command::Close { code, reason } => {
                    self.write_control(Frame::close(code, reason.as_deref())).await;
                    self.close_written = true;
                    if !self.shared.close_received.load(Ordering::Acquire) {
                        self.start_close_timer();
                    }
                }
                Command::Shutdown => break,
            }
        }

        if let Some(timer) = self.close_timer.take() {
            self.handle.remove_timeout(&timer);
        }
        if let Err(e) = self.stream.shutdown().await {
            trace!(cause = %e, "shutdown after close");
        }
        closer.close();
    }

    async fn write_message(&mut self, message: Message) -> Result<(), WebSocketError> {
        if self.close_written {
            return Err(WebSocketError::ConnectionClosed);
        }
        let opcode = if message.is_text() { OpCode::Text } else { OpCode::Binary };
        let data = message.into_bytes();
        self.shared.counters.message_bytes_out.fetch_add(data.len() as u64, Ordering::Relaxed);

        let frame = match self.deflater.as_mut() {
            Some(deflater) => Frame::new(true, opcode, true, deflater.compress(&data)?),
            None => Frame::new(true, opcode, false, data),
        };
        self.write_frame(frame).await
    }

    async fn write_control(&mut self, frame: Frame) {
        if self.close_written {
            trace!(opcode = ?frame.header.opcode, "dropping control frame after close");
            return;
        }
        if let Err(e) = self.write_frame(frame).await {
            debug!(cause = %e, "failed to write control frame");
            self.shared.closer.close();
        }
    }

    async fn write_frame(&mut self, frame: Frame) -> Result<(), WebSocketError> {
        let before = self.stream.pending();
        self.stream.encode(&mut self.encoder, frame)?;
        let written = self.stream.pending().saturating_sub(before);
        self.shared.counters.wire_bytes_out.fetch_add(written as u64, Ordering::Relaxed);
        self.stream.flush().await?;
        Ok(())
    }

    fn start_close_timer(&mut self) {
        if self.close_timer.is_some() {
            return;
        }
        let closer = self.shared.closer.clone();
        let timeout = self.close_timeout;
        self.close_timer = Some(self.handle.call_later(timeout, move || {
            debug!(?timeout, "no close frame from the peer, dropping connection");
            closer.close();
        }));
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use flate2::Compression;
    use gale_http::iostream::StreamConfig;
    use gale_http::protocol::BoxError;
    use tokio::io::DuplexStream;

    use super::*;
    use crate::compression::DeflateParams;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Message(Message),
        Ping(Bytes),
        Pong(Bytes),
        Close(CloseStatus),
    }

    struct Recorder {
        events: mpsc::UnboundedSender<Event>,
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl WebSocketHandler for Recorder {
        async fn on_message(&mut self, message: Message) -> Result<(), BoxError> {
            if self.fail_on.is_some_and(|text| message.as_text() == Some(text)) {
                return Err("refused".into());
            }
            let _ = self.events.send(Event::Message(message));
            Ok(())
        }

        async fn on_ping(&mut self, data: Bytes) -> Result<(), BoxError> {
            let _ = self.events.send(Event::Ping(data));
            Ok(())
        }

        async fn on_pong(&mut self, data: Bytes) -> Result<(), BoxError> {
            let _ = self.events.send(Event::Pong(data));
            Ok(())
        }

        fn on_close(&mut self, status: &CloseStatus) {
            let _ = self.events.send(Event::Close(status.clone()));
        }
    }

    fn start(
        io: DuplexStream,
        role: Role,
        options: WebSocketOptions,
        deflate: Option<PerMessageDeflate>,
    ) -> (WebSocketConnection, mpsc::UnboundedReceiver<Event>) {
        let (events, received) = mpsc::unbounded_channel();
        let protocol = WebSocketProtocol::new(IoStream::new(io, StreamConfig::default()), role, options, deflate);
        let conn = protocol.connection();
        tokio::spawn(async move {
            let mut recorder = Recorder { events, fail_on: Some("fail") };
            protocol.run(&mut recorder).await;
        });
        (conn, received)
    }

    /// The far end of a connection, speaking raw frames.
    struct Peer {
        reader: ReadStream,
        writer: WriteStream,
        frames: FrameReader,
        encoder: FrameEncoder,
    }

    impl Peer {
        fn new(io: DuplexStream, role: Role) -> Self {
            let (reader, writer) = IoStream::new(io, StreamConfig::default()).split();
            Self { reader, writer, frames: FrameReader::new(role, false, 1 << 20), encoder: FrameEncoder::new(role) }
        }

        async fn send(&mut self, frame: Frame) {
            self.writer.encode(&mut self.encoder, frame).unwrap();
            self.writer.flush().await.unwrap();
        }

        async fn recv(&mut self) -> Frame {
            self.frames.read_frame(&mut self.reader).await.unwrap()
        }

        async fn expect_close(&mut self, code: CloseCode) {
            let frame = self.recv().await;
            assert_eq!(frame.header.opcode, OpCode::Close);
            assert_eq!(&frame.payload[..2], &code.0.to_be_bytes());
            assert!(self.frames.read_frame(&mut self.reader).await.is_err());
        }
    }

    fn server_and_peer(options: WebSocketOptions) -> (WebSocketConnection, mpsc::UnboundedReceiver<Event>, Peer) {
        let (local, remote) = tokio::io::duplex(1 << 20);
        let (conn, events) = start(local, Role::Server, options, None);
        (conn, events, Peer::new(remote, Role::Client))
    }

    fn text(fin: bool, opcode: OpCode, payload: &'static str) -> Frame {
        Frame::new(fin, opcode, false, Bytes::from_static(payload.as_bytes()))
    }

    async fn next(events: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn fragments_are_reassembled_around_control_frames() {
        let (_conn, mut events, mut peer) = server_and_peer(WebSocketOptions::default());

        peer.send(text(false, OpCode::Text, "Hello, ")).await;
        peer.send(text(false, OpCode::Continuation, "World")).await;
        peer.send(Frame::ping(Bytes::from_static(b"p"))).await;
        peer.send(text(true, OpCode::Continuation, "!")).await;

        let pong = peer.recv().await;
        assert_eq!(pong.header.opcode, OpCode::Pong);
        assert_eq!(&pong.payload[..], b"p");

        assert_eq!(next(&mut events).await, Event::Ping(Bytes::from_static(b"p")));
        assert_eq!(next(&mut events).await, Event::Message(Message::from("Hello, World!")));
    }

    #[tokio::test]
    async fn messages_go_out_as_single_unmasked_frames() {
        let (conn, _events, mut peer) = server_and_peer(WebSocketOptions::default());

        conn.write_message("hi").await.unwrap();
        conn.write_message(vec![1u8, 2, 3]).await.unwrap();

        let first = peer.recv().await;
        assert!(first.header.fin);
        assert_eq!(first.header.opcode, OpCode::Text);
        assert_eq!(first.header.mask, None);
        assert_eq!(&first.payload[..], b"hi");
        assert_eq!(peer.recv().await.payload, Bytes::from_static(&[1, 2, 3]));

        let stats = conn.stats();
        assert_eq!(stats.message_bytes_out, 5);
        assert_eq!(stats.wire_bytes_out, 9);
    }

    #[tokio::test]
    async fn close_handshake_is_symmetric() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (client, mut client_events) = start(a, Role::Client, WebSocketOptions::default(), None);
        let (server, mut server_events) = start(b, Role::Server, WebSocketOptions::default(), None);

        client.close(Some(CloseCode::NORMAL), Some("bye"));
        assert!(client.is_closing());
        assert!(matches!(client.write_message("late").await, Err(WebSocketError::ConnectionClosed)));

        let expected = CloseStatus { code: Some(CloseCode::NORMAL), reason: Some("bye".to_owned()) };
        assert_eq!(next(&mut server_events).await, Event::Close(expected));
        assert_eq!(server.close_reason().as_deref(), Some("bye"));

        // the echo arrives well before the close timeout
        let echoed = CloseStatus { code: Some(CloseCode::NORMAL), reason: None };
        assert_eq!(next(&mut client_events).await, Event::Close(echoed));
        assert!(client.is_closed());
        assert_eq!(client.close_code(), Some(CloseCode::NORMAL));
    }

    #[tokio::test]
    async fn silent_peer_is_dropped_after_the_close_timeout() {
        let options = WebSocketOptions::default().close_timeout(Duration::from_millis(100));
        let (conn, mut events, mut peer) = server_and_peer(options);

        conn.close(None, None);
        let frame = peer.recv().await;
        assert_eq!(frame.header.opcode, OpCode::Close);
        assert!(frame.payload.is_empty());

        assert_eq!(next(&mut events).await, Event::Close(CloseStatus::default()));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn peer_initiated_close_is_echoed() {
        let (conn, mut events, mut peer) = server_and_peer(WebSocketOptions::default());

        peer.send(Frame::close(Some(CloseCode::GOING_AWAY), None)).await;
        peer.expect_close(CloseCode::GOING_AWAY).await;

        let status = CloseStatus { code: Some(CloseCode::GOING_AWAY), reason: None };
        assert_eq!(next(&mut events).await, Event::Close(status));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn invalid_utf8_closes_with_1007() {
        let (_conn, mut events, mut peer) = server_and_peer(WebSocketOptions::default());

        peer.send(Frame::new(true, OpCode::Text, false, Bytes::from_static(&[0xff, 0xfe]))).await;
        peer.expect_close(CloseCode::INVALID_PAYLOAD).await;
        assert_eq!(next(&mut events).await, Event::Close(CloseStatus::default()));
    }

    #[tokio::test]
    async fn unmasked_client_frame_closes_with_1002() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let (_conn, mut events) = start(local, Role::Server, WebSocketOptions::default(), None);

        tokio::io::AsyncWriteExt::write_all(&mut remote, &[0x81, 0x02, b'h', b'i']).await.unwrap();
        let mut peer = Peer::new(remote, Role::Client);
        peer.expect_close(CloseCode::PROTOCOL_ERROR).await;
        assert_eq!(next(&mut events).await, Event::Close(CloseStatus::default()));
    }

    #[tokio::test]
    async fn continuation_without_a_message_is_a_protocol_error() {
        let (_conn, _events, mut peer) = server_and_peer(WebSocketOptions::default());
        peer.send(text(true, OpCode::Continuation, "stray")).await;
        peer.expect_close(CloseCode::PROTOCOL_ERROR).await;
    }

    #[tokio::test]
    async fn oversized_fragmented_message_closes_with_1009() {
        let options = WebSocketOptions::default().max_message_size(8);
        let (_conn, _events, mut peer) = server_and_peer(options);

        peer.send(text(false, OpCode::Binary, "12345")).await;
        peer.send(text(true, OpCode::Continuation, "67890")).await;
        peer.expect_close(CloseCode::MESSAGE_TOO_BIG).await;
    }

    #[tokio::test]
    async fn bad_close_code_is_a_protocol_error() {
        let (_conn, _events, mut peer) = server_and_peer(WebSocketOptions::default());
        peer.send(Frame::new(true, OpCode::Close, false, Bytes::from_static(&[0x03, 0xed]))).await;
        peer.expect_close(CloseCode::PROTOCOL_ERROR).await;
    }

    #[tokio::test]
    async fn ping_and_pong() {
        let (conn, mut events, mut peer) = server_and_peer(WebSocketOptions::default());

        assert!(matches!(conn.ping(vec![0u8; 126]), Err(WebSocketError::PayloadTooLarge(126))));
        conn.ping(Bytes::from_static(b"are you there")).unwrap();
        let ping = peer.recv().await;
        assert_eq!(ping.header.opcode, OpCode::Ping);

        peer.send(Frame::pong(ping.payload)).await;
        assert_eq!(next(&mut events).await, Event::Pong(Bytes::from_static(b"are you there")));
    }

    #[tokio::test]
    async fn idle_connection_is_pinged() {
        let options = WebSocketOptions::default().ping_interval(Some(Duration::from_millis(50)));
        let (_conn, _events, mut peer) = server_and_peer(options);

        let frame = peer.recv().await;
        assert_eq!(frame.header.opcode, OpCode::Ping);
        assert!(frame.payload.is_empty());
    }

    #[tokio::test]
    async fn handler_error_aborts_without_close_frame() {
        let (conn, mut events, mut peer) = server_and_peer(WebSocketOptions::default());

        peer.send(text(true, OpCode::Text, "fail")).await;
        assert_eq!(next(&mut events).await, Event::Close(CloseStatus::default()));
        assert!(conn.is_closed());
        assert!(peer.frames.read_frame(&mut peer.reader).await.is_err());
    }

    #[tokio::test]
    async fn compressed_messages_round_trip() {
        let params = DeflateParams::default();
        let (a, b) = tokio::io::duplex(1 << 20);
        let client_deflate = PerMessageDeflate::new(Role::Client, &params, Compression::default());
        let server_deflate = PerMessageDeflate::new(Role::Server, &params, Compression::default());
        let (client, _client_events) = start(a, Role::Client, WebSocketOptions::default(), Some(client_deflate));
        let (_server, mut server_events) = start(b, Role::Server, WebSocketOptions::default(), Some(server_deflate));

        let text = "compress me ".repeat(1000);
        client.write_message(text.as_str()).await.unwrap();
        client.write_message(text.as_str()).await.unwrap();

        assert_eq!(next(&mut server_events).await, Event::Message(Message::Text(text.clone())));
        assert_eq!(next(&mut server_events).await, Event::Message(Message::Text(text.clone())));

        let stats = client.stats();
        assert_eq!(stats.message_bytes_out, 2 * text.len() as u64);
        assert!(stats.wire_bytes_out < stats.message_bytes_out / 10);
    }

    #[test]
    fn close_payloads() {
        assert_eq!(parse_close_payload(&[]).unwrap(), CloseStatus::default());
        assert!(parse_close_payload(&[0x03]).is_err());
        assert!(parse_close_payload(&[0x03, 0xee]).is_err());
        assert!(parse_close_payload(&[0x03, 0xe8, 0xff]).is_err());

        let status = parse_close_payload(b"\x0f\xa0app").unwrap();
        assert_eq!(status.code, Some(CloseCode(4000)));
        assert_eq!(status.reason.as_deref(), Some("app"));
    }
}
