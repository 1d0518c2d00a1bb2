use std::time::Duration;

use crate::codec::DEFAULT_MAX_HEADER_SIZE;

/// Tuning knobs of an [`Http1Connection`](super::Http1Connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Http1ConnectionParameters {
    /// Close the connection after every message.
    pub no_keep_alive: bool,
    /// Largest body piece handed to `data_received` at once.
    pub chunk_size: usize,
    /// Largest accepted start line plus header block.
    pub max_header_size: usize,
    /// How long to wait for a complete head.
    pub header_timeout: Option<Duration>,
    /// How long a server waits for the next request on an idle connection, used when no
    /// `header_timeout` is set.
    pub idle_connection_timeout: Option<Duration>,
    /// Largest accepted body.
    pub max_body_size: u64,
    /// How long reading one body may take.
    pub body_timeout: Option<Duration>,
    /// Inflate `Content-Encoding: gzip` bodies before they reach the delegate.
    pub decompress: bool,
}

impl Default for Http1ConnectionParameters {
    fn default() -> Self {
        Self {
            no_keep_alive: false,
            chunk_size: 64 * 1024,
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            header_timeout: None,
            idle_connection_timeout: Some(Duration::from_secs(3600)),
            max_body_size: 100 * 1024 * 1024,
            body_timeout: None,
            decompress: false,
        }
    }
}

impl Http1ConnectionParameters {
    pub fn no_keep_alive(mut self, no_keep_alive: bool) -> Self {
        self.no_keep_alive = no_keep_alive;
        self
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn max_header_size(mut self, max_header_size: usize) -> Self {
        self.max_header_size = max_header_size;
        self
    }

    pub fn header_timeout(mut self, header_timeout: Option<Duration>) -> Self {
        self.header_timeout = header_timeout;
        self
    }

    pub fn idle_connection_timeout(mut self, idle_connection_timeout: Option<Duration>) -> Self {
        self.idle_connection_timeout = idle_connection_timeout;
        self
    }

    pub fn max_body_size(mut self, max_body_size: u64) -> Self {
        self.max_body_size = max_body_size;
        self
    }

    pub fn body_timeout(mut self, body_timeout: Option<Duration>) -> Self {
        self.body_timeout = body_timeout;
        self
    }

    pub fn decompress(mut self, decompress: bool) -> Self {
        self.decompress = decompress;
        self
    }
}
