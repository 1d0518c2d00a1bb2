use async_trait::async_trait;
use bytes::Bytes;
use gale_http::connection::ConnectionContext;
use gale_http::protocol::BoxError;
use http::HeaderMap;

use crate::compression::CompressionOptions;
use crate::handshake::same_origin;
use crate::{CloseStatus, Message, WebSocketConnection};

/// The request that asked for the upgrade.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    pub path: String,
    pub headers: HeaderMap,
    pub context: ConnectionContext,
}

/// Application side of a WebSocket.
///
/// Callbacks run one at a time on the connection's task, in the order frames arrive. Outgoing
/// traffic goes through the [`WebSocketConnection`] handed to [`open`](Self::open), which may be
/// cloned and used from anywhere. An error returned from a callback is logged and the connection
/// is dropped without a close handshake.
#[async_trait]
pub trait WebSocketHandler: Send + 'static {
    /// Decides whether a cross-origin upgrade is allowed. Requests without an origin header are
    /// always accepted.
    fn check_origin(&self, origin: &str, request: &UpgradeRequest) -> bool {
        same_origin(origin, &request.headers)
    }

    /// Picks one of the subprotocols the client offered, or none.
    fn select_subprotocol(&mut self, offered: &[String]) -> Option<String> {
        let _ = offered;
        None
    }

    /// `Some` enables `permessage-deflate` when the client offers it.
    fn compression_options(&self) -> Option<CompressionOptions> {
        None
    }

    async fn open(&mut self, conn: WebSocketConnection, request: &UpgradeRequest) -> Result<(), BoxError> {
        let _ = (conn, request);
        Ok(())
    }

    async fn on_message(&mut self, message: Message) -> Result<(), BoxError>;

    /// Called after the pong has been queued.
    async fn on_ping(&mut self, data: Bytes) -> Result<(), BoxError> {
        let _ = data;
        Ok(())
    }

    async fn on_pong(&mut self, data: Bytes) -> Result<(), BoxError> {
        let _ = data;
        Ok(())
    }

    /// Called once when the connection is gone. `status` holds what the peer's close frame
    /// carried, if it sent one.
    fn on_close(&mut self, status: &CloseStatus) {
        let _ = status;
    }
}
