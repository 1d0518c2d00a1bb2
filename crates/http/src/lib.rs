//! An asynchronous HTTP/1.x engine built around a single-threaded event loop.
//!
//! The crate is layered bottom-up:
//!
//! - [`ioloop`]: the event loop, with thread-safe callback scheduling and timers
//! - [`iostream`]: a buffered byte stream with delimiter, exact-size and until-close reads
//! - [`codec`] and [`protocol`]: message heads, body framing and the error types
//! - [`connection`]: the HTTP/1.x connection state machine, driving a per-message delegate
//! - [`server`]: accepts TCP connections and serves each on its own task
//! - [`concurrent`]: small helpers for one-shot results and timeouts
//!
//! # Example
//!
//! ```no_run
//! use async_trait::async_trait;
//! use gale_http::connection::{ConnectionContext, Disposition, Http1Connection, HttpMessageDelegate};
//! use gale_http::ioloop::IoLoop;
//! use gale_http::protocol::{HttpError, ResponseStartLine, StartLine};
//! use gale_http::server::HttpServer;
//! use http::header::CONTENT_LENGTH;
//! use http::{HeaderMap, HeaderValue, StatusCode};
//!
//! struct HelloWorld;
//!
//! #[async_trait]
//! impl HttpMessageDelegate for HelloWorld {
//!     async fn headers_received(
//!         &mut self,
//!         _conn: &mut Http1Connection,
//!         _start_line: &StartLine,
//!         _headers: &HeaderMap,
//!     ) -> Result<Disposition, HttpError> {
//!         Ok(Disposition::Continue)
//!     }
//!
//!     async fn finish(&mut self, conn: &mut Http1Connection) -> Result<(), HttpError> {
//!         let body = "Hello World!\r\n";
//!         let mut headers = HeaderMap::new();
//!         headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
//!         conn.write_headers(ResponseStartLine::new(StatusCode::OK), headers).await?;
//!         conn.write(body).await?;
//!         conn.finish().await
//!     }
//! }
//!
//! fn main() -> std::io::Result<()> {
//!     let io_loop = IoLoop::new()?;
//!     let server = HttpServer::builder()
//!         .address(([127, 0, 0, 1], 8080))
//!         .build(|_: &ConnectionContext| -> Box<dyn HttpMessageDelegate> { Box::new(HelloWorld) });
//!     io_loop.run_sync(|| async move { server.listen().await }).map_err(std::io::Error::other)
//! }
//! ```

pub mod codec;
pub mod concurrent;
pub mod connection;
pub mod ioloop;
pub mod iostream;
pub mod protocol;
pub mod server;

mod utils;
pub(crate) use utils::ensure;
