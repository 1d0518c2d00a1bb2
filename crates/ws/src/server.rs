//! Server side of the opening handshake.
//!
//! [`WebSocketUpgrade`] is the message delegate for a request that should become a WebSocket.
//! Requests that can't be upgraded are answered with a plain HTTP error; an accepted upgrade
//! detaches the stream from the HTTP connection and runs the WebSocket on it until it closes.

use async_trait::async_trait;
use gale_http::codec::HeadEncoder;
use gale_http::connection::{ConnectionContext, Disposition, Http1Connection, HttpMessageDelegate};
use gale_http::iostream::IoStream;
use gale_http::protocol::{HttpError, ResponseStartLine, StartLine};
use http::header::{
    CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION, UPGRADE,
};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use tracing::{debug, info, warn};

use crate::compression::{PerMessageDeflate, negotiate_server, parse_extensions};
use crate::frame::Role;
use crate::handshake::{accept_key, is_connection_upgrade, is_supported_version, is_websocket_upgrade, origin, subprotocols};
use crate::protocol::WebSocketProtocol;
use crate::{UpgradeRequest, WebSocketHandler, WebSocketOptions};

const UPGRADE_REQUIRED: &[u8] = b"HTTP/1.1 426 Upgrade Required\r\nSec-WebSocket-Version: 7, 8, 13\r\n\r\n";

/// Answers a request that can't be upgraded. The connection stays usable for HTTP.
async fn reject(conn: &mut Http1Connection, status: StatusCode, message: &'static str) -> Result<Disposition, HttpError> {
    info!(peer = %conn.context(), %status, reason = message, "websocket upgrade refused");
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(message.len()));
    conn.write_headers(ResponseStartLine::new(status), headers).await?;
    conn.write(message).await?;
    conn.finish().await?;
    Ok(Disposition::Finished)
}

/// Turns one request into a WebSocket served by `H`.
#[derive(Debug)]
pub struct WebSocketUpgrade<H> {
    handler: H,
    options: WebSocketOptions,
}

impl<H: WebSocketHandler> WebSocketUpgrade<H> {
    pub fn new(handler: H) -> Self {
        Self { handler, options: WebSocketOptions::default() }
    }

    pub fn options(mut self, options: WebSocketOptions) -> Self {
        self.options = options;
        self
    }

    /// Everything after the stream has been detached: the remaining checks, the `101` response
    /// and the connection itself.
    async fn accept(&mut self, mut stream: IoStream, request: UpgradeRequest) -> Result<(), HttpError> {
        let headers = &request.headers;
        let version = headers.get(SEC_WEBSOCKET_VERSION).and_then(|value| value.to_str().ok());
        if !version.is_some_and(is_supported_version) {
            debug!(peer = %request.context, ?version, "unsupported websocket version");
            stream.write(UPGRADE_REQUIRED).await?;
            stream.close();
            return Ok(());
        }

        let key = headers.get(SEC_WEBSOCKET_KEY).and_then(|value| value.to_str().ok());
        let (Some(key), true) = (key, headers.contains_key(HOST)) else {
            debug!(peer = %request.context, "missing required websocket headers");
            stream.close();
            return Ok(());
        };

        let mut response = HeaderMap::new();
        response.insert(UPGRADE, HeaderValue::from_static("websocket"));
        response.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        response.insert(SEC_WEBSOCKET_ACCEPT, HeaderValue::try_from(accept_key(key.trim())).map_err(HttpError::delegate)?);

        let offered = subprotocols(headers);
        if !offered.is_empty() {
            match self.handler.select_subprotocol(&offered) {
                Some(selected) if offered.contains(&selected) => {
                    response.insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::try_from(selected).map_err(HttpError::delegate)?);
                }
                Some(selected) => warn!(%selected, "handler picked a subprotocol the client did not offer, ignoring it"),
                None => {}
            }
        }

        let mut deflate = None;
        if let Some(options) = self.handler.compression_options() {
            let values = headers.get_all(SEC_WEBSOCKET_EXTENSIONS).iter().filter_map(|value| value.to_str().ok());
            if let Some(agreed) = negotiate_server(&parse_extensions(values), &options) {
                debug!(extension = %agreed, "permessage-deflate negotiated");
                response.insert(SEC_WEBSOCKET_EXTENSIONS, HeaderValue::try_from(agreed.to_string()).map_err(HttpError::delegate)?);
                deflate = Some(PerMessageDeflate::new(Role::Server, &agreed, options.level));
            }
        }

        let start_line = StartLine::from(ResponseStartLine::new(StatusCode::SWITCHING_PROTOCOLS));
        stream.encode(&mut HeadEncoder, (&start_line, &response)).map_err(HttpError::from)?;
        stream.flush().await?;
        info!(peer = %request.context, path = %request.path, "websocket opened");

        let protocol = WebSocketProtocol::new(stream, Role::Server, self.options, deflate);
        if let Err(e) = self.handler.open(protocol.connection(), &request).await {
            warn!(cause = %e, "websocket open failed, aborting connection");
            protocol.connection().abort();
        }
        protocol.run(&mut self.handler).await;
        Ok(())
    }
}

#[async_trait]
impl<H: WebSocketHandler> HttpMessageDelegate for WebSocketUpgrade<H> {
    async fn headers_received(
        &mut self,
        conn: &mut Http1Connection,
        start_line: &StartLine,
        headers: &HeaderMap,
    ) -> Result<Disposition, HttpError> {
        let Some(request_line) = start_line.as_request() else {
            return Err(HttpError::delegate("websocket upgrade delegate used on a client connection"));
        };
        if request_line.method != Method::GET {
            return reject(conn, StatusCode::METHOD_NOT_ALLOWED, "WebSocket upgrades must use GET").await;
        }
        if !is_websocket_upgrade(headers) {
            return reject(conn, StatusCode::BAD_REQUEST, "Can \"Upgrade\" only to \"WebSocket\".").await;
        }
        if !is_connection_upgrade(headers) {
            return reject(conn, StatusCode::BAD_REQUEST, "\"Connection\" must be \"Upgrade\".").await;
        }

        let request =
            UpgradeRequest { path: request_line.path.clone(), headers: headers.clone(), context: conn.context().clone() };
        if let Some(origin) = origin(headers)
            && !self.handler.check_origin(origin, &request)
        {
            return reject(conn, StatusCode::FORBIDDEN, "Cross origin websockets not allowed").await;
        }

        let stream = conn.detach()?;
        self.accept(stream, request).await?;
        Ok(Disposition::Finished)
    }

    async fn finish(&mut self, _conn: &mut Http1Connection) -> Result<(), HttpError> {
        // the response went out in headers_received, or the stream was taken over
        Ok(())
    }
}

/// A server connection delegate answering every request with a WebSocket upgrade, each served
/// by a handler fresh from `factory`.
pub fn websocket_delegate<F, H>(
    factory: F,
    options: WebSocketOptions,
) -> impl Fn(&ConnectionContext) -> Box<dyn HttpMessageDelegate> + Send + Sync + 'static
where
    F: Fn() -> H + Send + Sync + 'static,
    H: WebSocketHandler,
{
    move |_: &ConnectionContext| -> Box<dyn HttpMessageDelegate> { Box::new(WebSocketUpgrade::new(factory()).options(options)) }
}
