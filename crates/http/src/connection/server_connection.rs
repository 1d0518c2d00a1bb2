use tracing::{debug, info, trace};

use super::{Http1Connection, HttpServerConnectionDelegate};
use crate::protocol::HttpError;

/// Serves requests on one connection until it closes, detaches or fails.
#[derive(Debug)]
pub struct Http1ServerConnection {
    conn: Http1Connection,
}

impl Http1ServerConnection {
    pub fn new(conn: Http1Connection) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &Http1Connection {
        &self.conn
    }

    pub async fn start_serving(mut self, delegate: &dyn HttpServerConnectionDelegate) {
        loop {
            let mut request_delegate = delegate.start_request(self.conn.context());
            match self.conn.read_response(request_delegate.as_mut()).await {
                Ok(true) => {
                    trace!(peer = %self.conn.context(), "connection ready for the next request");
                    // let other connections make progress between pipelined requests
                    tokio::task::yield_now().await;
                }
                Ok(false) => break,
                Err(HttpError::Stream(e)) => {
                    debug!(peer = %self.conn.context(), cause = %e, "connection closed while serving");
                    break;
                }
                Err(e) => {
                    info!(peer = %self.conn.context(), cause = %e, "stop serving connection");
                    break;
                }
            }
        }
        delegate.on_close(self.conn.context());
    }
}
