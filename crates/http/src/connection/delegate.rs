use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;

use super::{ConnectionContext, Http1Connection};
use crate::protocol::{HttpError, StartLine};

/// What the connection should do after a delegate callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Keep delivering the message.
    Continue,
    /// The delegate is done early: no more `data_received`, `finish` is still called.
    ///
    /// A body that has not been read completely makes the connection close after the message.
    Finished,
}

/// Receives one HTTP message, request on a server, response on a client.
///
/// Callbacks arrive in order: `headers_received` once, `data_received` zero or more times, then
/// `finish` once. When the peer goes away mid-message `on_connection_close` is called instead of
/// `finish`. Each callback gets the connection, which is how a server writes its response and
/// how an upgrade takes the stream over with [`Http1Connection::detach`].
#[async_trait]
pub trait HttpMessageDelegate: Send {
    async fn headers_received(
        &mut self,
        conn: &mut Http1Connection,
        start_line: &StartLine,
        headers: &HeaderMap,
    ) -> Result<Disposition, HttpError>;

    async fn data_received(&mut self, conn: &mut Http1Connection, chunk: Bytes) -> Result<Disposition, HttpError> {
        let _ = (conn, chunk);
        Ok(Disposition::Continue)
    }

    async fn finish(&mut self, conn: &mut Http1Connection) -> Result<(), HttpError>;

    fn on_connection_close(&mut self) {}
}

/// Creates a message delegate for every request read by a server connection.
pub trait HttpServerConnectionDelegate: Send + Sync + 'static {
    fn start_request(&self, context: &ConnectionContext) -> Box<dyn HttpMessageDelegate>;

    /// Called once when a connection stops serving.
    fn on_close(&self, context: &ConnectionContext) {
        let _ = context;
    }
}

impl<F> HttpServerConnectionDelegate for F
where
    F: Fn(&ConnectionContext) -> Box<dyn HttpMessageDelegate> + Send + Sync + 'static,
{
    fn start_request(&self, context: &ConnectionContext) -> Box<dyn HttpMessageDelegate> {
        self(context)
    }
}
