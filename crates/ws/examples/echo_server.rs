use async_trait::async_trait;
use gale_http::ioloop::IoLoop;
use gale_http::protocol::BoxError;
use gale_http::server::HttpServer;
use gale_ws::{
    CloseStatus, CompressionOptions, Message, UpgradeRequest, WebSocketConnection, WebSocketHandler, WebSocketOptions,
    websocket_delegate,
};
use std::time::Duration;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

#[derive(Default)]
struct Echo {
    conn: Option<WebSocketConnection>,
    peer: String,
}

#[async_trait]
impl WebSocketHandler for Echo {
    fn compression_options(&self) -> Option<CompressionOptions> {
        Some(CompressionOptions::default())
    }

    async fn open(&mut self, conn: WebSocketConnection, request: &UpgradeRequest) -> Result<(), BoxError> {
        self.peer = request.context.to_string();
        info!(peer = %self.peer, path = %request.path, "websocket opened");
        self.conn = Some(conn);
        Ok(())
    }

    async fn on_message(&mut self, message: Message) -> Result<(), BoxError> {
        if let Some(conn) = &self.conn {
            conn.write_message(message).await?;
        }
        Ok(())
    }

    fn on_close(&mut self, status: &CloseStatus) {
        let stats = self.conn.as_ref().map(WebSocketConnection::stats).unwrap_or_default();
        info!(peer = %self.peer, code = ?status.code, reason = ?status.reason, ?stats, "websocket closed");
    }
}

fn main() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let io_loop = match IoLoop::new() {
        Ok(io_loop) => io_loop,
        Err(e) => {
            error!(cause = %e, "failed to create the event loop");
            return;
        }
    };

    let options = WebSocketOptions::default().ping_interval(Some(Duration::from_secs(30)));
    let server = HttpServer::builder().address(([127, 0, 0, 1], 8888)).build(websocket_delegate(Echo::default, options));

    info!(port = 8888, "start listening");
    if let Err(e) = io_loop.run_sync(|| async move { server.listen().await }) {
        error!(cause = %e, "server error");
    }
}
