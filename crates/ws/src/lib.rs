//! RFC 6455 WebSockets on top of `gale-http`.
//!
//! A server upgrades an HTTP/1.1 request with [`WebSocketUpgrade`], usually through
//! [`websocket_delegate`], and talks to the peer through a [`WebSocketHandler`]. A client opens
//! a connection with [`websocket_connect`]. Both sides support `permessage-deflate` (RFC 7692).
//!
//! # Example
//!
//! ```no_run
//! use async_trait::async_trait;
//! use gale_http::ioloop::IoLoop;
//! use gale_http::protocol::BoxError;
//! use gale_http::server::HttpServer;
//! use gale_ws::{Message, UpgradeRequest, WebSocketConnection, WebSocketHandler, WebSocketOptions, websocket_delegate};
//!
//! #[derive(Default)]
//! struct Echo(Option<WebSocketConnection>);
//!
//! #[async_trait]
//! impl WebSocketHandler for Echo {
//!     async fn open(&mut self, conn: WebSocketConnection, _request: &UpgradeRequest) -> Result<(), BoxError> {
//!         self.0 = Some(conn);
//!         Ok(())
//!     }
//!
//!     async fn on_message(&mut self, message: Message) -> Result<(), BoxError> {
//!         if let Some(conn) = &self.0 {
//!             conn.write_message(message).await?;
//!         }
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> std::io::Result<()> {
//!     let io_loop = IoLoop::new()?;
//!     let server = HttpServer::builder()
//!         .address(([127, 0, 0, 1], 8888))
//!         .build(websocket_delegate(Echo::default, WebSocketOptions::default()));
//!     io_loop.run_sync(|| async move { server.listen().await }).map_err(std::io::Error::other)
//! }
//! ```

pub mod client;
pub mod compression;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod server;

mod error;
mod handler;
mod message;
mod protocol;

pub use client::{ClientOptions, WebSocketClientConnection, websocket_connect};
pub use compression::CompressionOptions;
pub use error::WebSocketError;
pub use frame::CloseCode;
pub use handler::{UpgradeRequest, WebSocketHandler};
pub use message::{CloseStatus, Message};
pub use protocol::{WebSocketConnection, WebSocketOptions, WebSocketStats};
pub use server::{WebSocketUpgrade, websocket_delegate};
