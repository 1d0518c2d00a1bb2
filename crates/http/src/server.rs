//! A TCP server running one [`Http1ServerConnection`] per accepted socket.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::connection::{ConnectionContext, Http1Connection, Http1ConnectionParameters, Http1ServerConnection, HttpServerConnectionDelegate};
use crate::iostream::{IoStream, StreamCloser, StreamConfig};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("address must be set")]
    MissingAddress,
    #[error("failed to bind {address}: {source}")]
    Bind { address: SocketAddr, source: io::Error },
}

pub struct HttpServerBuilder {
    address: Option<SocketAddr>,
    params: Http1ConnectionParameters,
    xheaders: bool,
    trusted_downstream: Vec<IpAddr>,
    stream_config: StreamConfig,
}

impl HttpServerBuilder {
    fn new() -> Self {
        Self {
            address: None,
            params: Http1ConnectionParameters::default(),
            xheaders: false,
            trusted_downstream: Vec::new(),
            stream_config: StreamConfig::default(),
        }
    }

    pub fn address<A: Into<SocketAddr>>(mut self, address: A) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn params(mut self, params: Http1ConnectionParameters) -> Self {
        self.params = params;
        self
    }

    /// Honor `X-Real-Ip`, `X-Forwarded-For`, `X-Scheme` and `X-Forwarded-Proto`.
    pub fn xheaders(mut self, xheaders: bool) -> Self {
        self.xheaders = xheaders;
        self
    }

    pub fn trusted_downstream<I: IntoIterator<Item = IpAddr>>(mut self, trusted: I) -> Self {
        self.trusted_downstream = trusted.into_iter().collect();
        self
    }

    pub fn stream_config(mut self, stream_config: StreamConfig) -> Self {
        self.stream_config = stream_config;
        self
    }

    pub fn build<D: HttpServerConnectionDelegate>(self, delegate: D) -> HttpServer {
        HttpServer {
            inner: Arc::new(Inner {
                address: self.address,
                params: self.params,
                xheaders: self.xheaders,
                trusted_downstream: self.trusted_downstream,
                stream_config: self.stream_config,
                delegate: Arc::new(delegate),
                connections: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }
}

struct Inner {
    address: Option<SocketAddr>,
    params: Http1ConnectionParameters,
    xheaders: bool,
    trusted_downstream: Vec<IpAddr>,
    stream_config: StreamConfig,
    delegate: Arc<dyn HttpServerConnectionDelegate>,
    connections: Mutex<HashMap<u64, StreamCloser>>,
    next_id: AtomicU64,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

/// Cloning gives another handle to the same server.
#[derive(Clone)]
pub struct HttpServer {
    inner: Arc<Inner>,
}

impl HttpServer {
    pub fn builder() -> HttpServerBuilder {
        HttpServerBuilder::new()
    }

    /// Binds the configured address and serves until [`stop`](Self::stop) is called.
    pub async fn listen(&self) -> Result<(), ServerError> {
        let address = self.inner.address.ok_or(ServerError::MissingAddress)?;
        let listener = TcpListener::bind(address).await.map_err(|source| {
            error!(cause = %source, %address, "bind server error");
            ServerError::Bind { address, source }
        })?;
        self.serve(listener).await;
        Ok(())
    }

    /// Accepts connections from `listener` until [`stop`](Self::stop) is called.
    pub async fn serve(&self, listener: TcpListener) {
        info!(address = ?listener.local_addr().ok(), "start listening");
        loop {
            let accepted = tokio::select! {
                biased;
                () = self.inner.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((tcp_stream, _remote_addr)) => self.handle_tcp_stream(tcp_stream),
                Err(e) => warn!(cause = %e, "failed to accept"),
            }
        }
        info!("stop listening");
    }

    fn handle_tcp_stream(&self, tcp_stream: TcpStream) {
        match IoStream::from_tcp(tcp_stream, self.inner.stream_config) {
            Ok(stream) => self.handle_stream(stream),
            Err(e) => warn!(cause = %e, "failed to set up accepted socket"),
        }
    }

    /// Serves an already established stream, e.g. one wrapped in TLS by the caller.
    pub fn handle_stream(&self, stream: IoStream) {
        let context = ConnectionContext::new(stream.peer_addr(), stream.is_secure())
            .with_xheaders(self.inner.xheaders)
            .with_trusted_downstream(self.inner.trusted_downstream.iter().copied());
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.connections().insert(id, stream.closer());

        debug!(peer = %context, "connection accepted");
        let conn = Http1Connection::server(stream, self.inner.params, context);
        let inner = Arc::clone(&self.inner);
        self.inner.tracker.spawn(async move {
            Http1ServerConnection::new(conn).start_serving(inner.delegate.as_ref()).await;
            inner.connections.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
        });
    }

    /// Stops accepting new connections. Open connections keep being served.
    pub fn stop(&self) {
        self.inner.shutdown.cancel();
    }

    /// Closes every open connection and waits for their tasks to end.
    pub async fn close_all_connections(&self) {
        let closers: Vec<StreamCloser> = self.connections().drain().map(|(_, closer)| closer).collect();
        debug!(count = closers.len(), "closing all connections");
        for closer in closers {
            closer.close();
        }
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.tracker.reopen();
    }

    pub fn connection_count(&self) -> usize {
        self.connections().len()
    }

    fn connections(&self) -> std::sync::MutexGuard<'_, HashMap<u64, StreamCloser>> {
        self.inner.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
