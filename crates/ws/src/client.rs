//! Client side: [`websocket_connect`] opens a connection and performs the opening handshake.
//!
//! Incoming messages are queued for [`WebSocketClientConnection::read_message`], which yields
//! `None` once the connection is closed. A callback set with [`ClientOptions::on_message`]
//! receives them instead, followed by a final `None`.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use gale_http::concurrent::with_timeout;
use gale_http::connection::{Disposition, Http1Connection, Http1ConnectionParameters, HttpMessageDelegate};
use gale_http::ioloop::LoopHandle;
use gale_http::iostream::{IoStream, StreamConfig};
use gale_http::protocol::{BoxError, HttpError, RequestStartLine, StartLine};
use http::header::{
    CONNECTION, HOST, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL,
    SEC_WEBSOCKET_VERSION, UPGRADE,
};
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::compression::{CompressionOptions, DeflateParams, PerMessageDeflate, accept_client, client_offer, parse_extensions};
use crate::frame::{CloseCode, Role};
use crate::handshake::{accept_key, generate_key, is_connection_upgrade, is_websocket_upgrade};
use crate::protocol::WebSocketProtocol;
use crate::{CloseStatus, Message, WebSocketConnection, WebSocketError, WebSocketHandler, WebSocketOptions, WebSocketStats};

type MessageCallback = Box<dyn FnMut(Option<Message>) + Send + 'static>;

/// How to connect and what to ask the server for.
#[derive(Default)]
pub struct ClientOptions {
    pub connect_timeout: Option<Duration>,
    /// Offered in `Sec-WebSocket-Protocol`, in order of preference.
    pub subprotocols: Vec<String>,
    /// `Some` offers `permessage-deflate`.
    pub compression: Option<CompressionOptions>,
    /// Sent along with the upgrade request. The handshake headers themselves can't be overridden.
    pub headers: HeaderMap,
    pub websocket: WebSocketOptions,
    pub stream_config: StreamConfig,
    on_message: Option<MessageCallback>,
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("connect_timeout", &self.connect_timeout)
            .field("subprotocols", &self.subprotocols)
            .field("compression", &self.compression)
            .field("headers", &self.headers)
            .field("websocket", &self.websocket)
            .field("on_message", &self.on_message.is_some())
            .finish_non_exhaustive()
    }
}

impl ClientOptions {
    pub fn connect_timeout(mut self, connect_timeout: Option<Duration>) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn subprotocols<I, S>(mut self, subprotocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subprotocols = subprotocols.into_iter().map(Into::into).collect();
        self
    }

    pub fn compression(mut self, compression: Option<CompressionOptions>) -> Self {
        self.compression = compression;
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn websocket(mut self, websocket: WebSocketOptions) -> Self {
        self.websocket = websocket;
        self
    }

    pub fn stream_config(mut self, stream_config: StreamConfig) -> Self {
        self.stream_config = stream_config;
        self
    }

    /// Delivers messages to `callback` instead of the read queue. `None` marks the close.
    pub fn on_message<F>(mut self, callback: F) -> Self
    where
        F: FnMut(Option<Message>) + Send + 'static,
    {
        self.on_message = Some(Box::new(callback));
        self
    }
}

/// An open client WebSocket.
#[derive(Debug)]
pub struct WebSocketClientConnection {
    conn: WebSocketConnection,
    messages: mpsc::UnboundedReceiver<Message>,
    protocol: Option<String>,
    extensions: Option<DeflateParams>,
}

impl WebSocketClientConnection {
    /// The next message, or `None` once the connection is closed.
    pub async fn read_message(&mut self) -> Option<Message> {
        self.messages.recv().await
    }

    pub async fn write_message<M: Into<Message>>(&self, message: M) -> Result<(), WebSocketError> {
        self.conn.write_message(message).await
    }

    pub fn ping<B: Into<Bytes>>(&self, data: B) -> Result<(), WebSocketError> {
        self.conn.ping(data)
    }

    pub fn close(&self, code: Option<CloseCode>, reason: Option<&str>) {
        self.conn.close(code, reason);
    }

    pub fn close_code(&self) -> Option<CloseCode> {
        self.conn.close_code()
    }

    pub fn close_reason(&self) -> Option<String> {
        self.conn.close_reason()
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    pub fn stats(&self) -> WebSocketStats {
        self.conn.stats()
    }

    /// The subprotocol the server selected.
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// The agreed `permessage-deflate` parameters.
    pub fn compression(&self) -> Option<&DeflateParams> {
        self.extensions.as_ref()
    }

    /// A sending handle that can be moved to other tasks.
    pub fn connection(&self) -> WebSocketConnection {
        self.conn.clone()
    }
}

/// Opens a WebSocket to `url` (`ws://` or `http://`).
pub async fn websocket_connect(url: &str, mut options: ClientOptions) -> Result<WebSocketClientConnection, WebSocketError> {
    let target = Target::parse(url)?;
    debug!(host = %target.host, port = target.port, path = %target.path, "connecting websocket");

    let connect = TcpStream::connect((target.host.as_str(), target.port));
    let tcp = with_timeout(options.connect_timeout, connect).await.map_err(|_| WebSocketError::ConnectTimeout)??;
    let stream = IoStream::from_tcp(tcp, options.stream_config)?;
    let mut conn = Http1Connection::client(stream, Http1ConnectionParameters::default());

    let key = generate_key();
    let mut headers = std::mem::take(&mut options.headers);
    headers.insert(HOST, HeaderValue::try_from(target.authority()).map_err(WebSocketError::handshake)?);
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(SEC_WEBSOCKET_KEY, HeaderValue::try_from(key.as_str()).map_err(WebSocketError::handshake)?);
    headers.insert(SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
    if !options.subprotocols.is_empty() {
        let offered = options.subprotocols.join(", ");
        headers.insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::try_from(offered).map_err(WebSocketError::handshake)?);
    }
    if let Some(compression) = &options.compression {
        headers.insert(SEC_WEBSOCKET_EXTENSIONS, HeaderValue::try_from(client_offer(compression)).map_err(WebSocketError::handshake)?);
    }

    conn.write_headers(RequestStartLine::new(Method::GET, target.path.clone()), headers).await?;
    conn.finish().await?;

    let mut handshake = HandshakeResponse {
        key,
        offered_protocols: std::mem::take(&mut options.subprotocols),
        compression_requested: options.compression.is_some(),
        outcome: None,
    };
    let read = conn.read_response(&mut handshake).await;
    let accepted = match (handshake.outcome, read) {
        (Some(outcome), _) => outcome?,
        (None, Err(e)) => return Err(e.into()),
        (None, Ok(_)) => return Err(WebSocketError::handshake("connection closed before the handshake completed")),
    };
    info!(host = %target.host, path = %target.path, protocol = ?accepted.protocol, "websocket connected");

    let level = options.compression.map(|compression| compression.level).unwrap_or_default();
    let deflate = accepted.extensions.as_ref().map(|params| PerMessageDeflate::new(Role::Client, params, level));
    let protocol = WebSocketProtocol::new(accepted.stream, Role::Client, options.websocket, deflate);
    let conn = protocol.connection();

    let (queue, messages) = mpsc::unbounded_channel();
    let mut receiver = match options.on_message.take() {
        Some(callback) => Receiver::Callback(callback),
        None => Receiver::Queue(queue),
    };
    LoopHandle::current().spawn(async move { protocol.run(&mut receiver).await });

    Ok(WebSocketClientConnection { conn, messages, protocol: accepted.protocol, extensions: accepted.extensions })
}

/// Where a `ws://` url points.
#[derive(Debug, PartialEq, Eq)]
struct Target {
    host: String,
    port: u16,
    path: String,
}

impl Target {
    fn parse(url: &str) -> Result<Self, WebSocketError> {
        let uri: Uri = url.parse().map_err(|e: http::uri::InvalidUri| WebSocketError::InvalidUrl(e.to_string()))?;
        match uri.scheme_str() {
            Some("ws" | "http") => {}
            Some("wss" | "https") => return Err(WebSocketError::InvalidUrl(format!("{url}: TLS is not supported"))),
            _ => return Err(WebSocketError::InvalidUrl(format!("{url}: expected a ws:// url"))),
        }
        let host = uri.host().ok_or_else(|| WebSocketError::InvalidUrl(format!("{url}: missing host")))?;
        let host = host.trim_start_matches('[').trim_end_matches(']').to_owned();
        let port = uri.port_u16().unwrap_or(80);
        let path = uri.path_and_query().map_or_else(|| "/".to_owned(), |path| path.as_str().to_owned());
        let path = if path.is_empty() { "/".to_owned() } else { path };
        Ok(Self { host, port, path })
    }

    /// The `Host` header value: the port is left out when it is the default.
    fn authority(&self) -> String {
        let host = if self.host.contains(':') { format!("[{}]", self.host) } else { self.host.clone() };
        if self.port == 80 { host } else { format!("{host}:{}", self.port) }
    }
}

struct Accepted {
    stream: IoStream,
    protocol: Option<String>,
    extensions: Option<DeflateParams>,
}

/// Checks the server's answer to the upgrade request and takes the stream over on success.
struct HandshakeResponse {
    key: String,
    offered_protocols: Vec<String>,
    compression_requested: bool,
    outcome: Option<Result<Accepted, WebSocketError>>,
}

impl HandshakeResponse {
    fn validate(&self, status: StatusCode, headers: &HeaderMap) -> Result<(Option<String>, Option<DeflateParams>), WebSocketError> {
        if status != StatusCode::SWITCHING_PROTOCOLS {
            return Err(WebSocketError::handshake(format!("non-websocket response: {status}")));
        }
        if !is_websocket_upgrade(headers) || !is_connection_upgrade(headers) {
            return Err(WebSocketError::handshake("missing upgrade headers in response"));
        }
        let accept = headers.get(SEC_WEBSOCKET_ACCEPT).and_then(|value| value.to_str().ok());
        if accept != Some(accept_key(&self.key).as_str()) {
            return Err(WebSocketError::handshake("invalid Sec-WebSocket-Accept"));
        }

        let protocol = match headers.get(SEC_WEBSOCKET_PROTOCOL).map(HeaderValue::to_str) {
            Some(Ok(protocol)) if self.offered_protocols.iter().any(|offered| offered == protocol) => Some(protocol.to_owned()),
            Some(_) => return Err(WebSocketError::handshake("server selected a subprotocol that was not offered")),
            None => None,
        };

        let values = headers.get_all(SEC_WEBSOCKET_EXTENSIONS).iter().filter_map(|value| value.to_str().ok());
        let extensions = accept_client(&parse_extensions(values), self.compression_requested)?;
        Ok((protocol, extensions))
    }
}

#[async_trait]
impl HttpMessageDelegate for HandshakeResponse {
    async fn headers_received(
        &mut self,
        conn: &mut Http1Connection,
        start_line: &StartLine,
        headers: &HeaderMap,
    ) -> Result<Disposition, HttpError> {
        let Some(response) = start_line.as_response() else {
            return Err(HttpError::delegate("expected a response"));
        };
        let outcome = match self.validate(response.code, headers) {
            Ok((protocol, extensions)) => conn.detach().map(|stream| Accepted { stream, protocol, extensions }).map_err(Into::into),
            Err(e) => Err(e),
        };
        self.outcome = Some(outcome);
        Ok(Disposition::Finished)
    }

    async fn finish(&mut self, _conn: &mut Http1Connection) -> Result<(), HttpError> {
        Ok(())
    }
}

/// Hands incoming messages to the application.
enum Receiver {
    Queue(mpsc::UnboundedSender<Message>),
    Callback(MessageCallback),
}

#[async_trait]
impl WebSocketHandler for Receiver {
    async fn on_message(&mut self, message: Message) -> Result<(), BoxError> {
        match self {
            Self::Queue(queue) => {
                // a dropped receiver just means nobody reads anymore
                let _ = queue.send(message);
            }
            Self::Callback(callback) => callback(Some(message)),
        }
        Ok(())
    }

    fn on_close(&mut self, _status: &CloseStatus) {
        if let Self::Callback(callback) = self {
            callback(None);
        }
    }
}
