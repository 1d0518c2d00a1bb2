//! HTTP/1.x connections.
//!
//! - [`Http1Connection`]: reads one message at a time into a [`HttpMessageDelegate`] and writes
//!   the outgoing message, in either the server or the client role
//! - [`Http1ServerConnection`]: the request loop of a server connection, with keep-alive
//! - [`ConnectionContext`]: the peer as seen by delegates, optionally rewritten from proxy headers
//! - [`Http1ConnectionParameters`]: limits and timeouts

mod context;
mod delegate;
mod gzip;
mod http_connection;
mod params;
mod server_connection;

pub use context::ConnectionContext;
pub use delegate::Disposition;
pub use delegate::HttpMessageDelegate;
pub use delegate::HttpServerConnectionDelegate;
pub use http_connection::ConnectionState;
pub use http_connection::Http1Connection;
pub use params::Http1ConnectionParameters;
pub use server_connection::Http1ServerConnection;
