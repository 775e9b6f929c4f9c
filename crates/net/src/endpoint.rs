//! The listening side: accept loop, HTTP sniffing and command dispatch.

use crate::error::NetError;
use crate::protocol::{read_command, read_frame, write_frame, Command};
use bytes::Bytes;
use futures::future::BoxFuture;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// How long an inbound peer connection may wait between reads.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Reply bytes for commands that answer, `None` for those that don't.
pub type HandlerResult = Result<Option<Vec<u8>>, NetError>;

type Handler = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Serves requests that were sniffed as HTTP.
#[async_trait::async_trait]
pub trait HttpHandler: Send + Sync + 'static {
    async fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>>;
}

/// Method tokens that mark a connection as HTTP.
const HTTP_METHODS: [&[u8]; 7] = [
    b"GET ",
    b"PUT ",
    b"POST ",
    b"DELETE ",
    b"HEAD ",
    b"OPTIONS ",
    b"PATCH ",
];

/// Whether the first bytes of a connection look like an HTTP request line.
/// A short peek matches if it is a prefix of some method token.
pub fn looks_like_http(peeked: &[u8]) -> bool {
    !peeked.is_empty()
        && HTTP_METHODS.iter().any(|m| {
            let n = peeked.len().min(m.len());
            peeked[..n] == m[..n]
        })
}

/// Command dispatch table plus an optional HTTP handler, shared by every
/// inbound connection.
pub struct Endpoint {
    routes: RwLock<HashMap<Command, Handler>>,
    http: RwLock<Option<Arc<dyn HttpHandler>>>,
    idle_timeout: Duration,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            routes: RwLock::default(),
            http: RwLock::default(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let routes: Vec<&'static str> = self.routes.read().keys().map(|c| c.as_str()).collect();
        f.debug_struct("Endpoint")
            .field("routes", &routes)
            .field("http", &self.http.read().is_some())
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

impl Endpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop peer connections that send nothing for `idle`.
    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.idle_timeout = idle;
        self
    }

    async fn bounded<T>(&self, read: impl Future<Output = Result<T, NetError>>) -> Result<T, NetError> {
        tokio::time::timeout(self.idle_timeout, read)
            .await
            .map_err(|_| NetError::Timeout)?
    }

    /// Register the handler for a command, replacing any previous one.
    pub fn register<F, Fut>(&self, cmd: Command, f: F)
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: Handler =
            Arc::new(move |payload| -> BoxFuture<'static, HandlerResult> { Box::pin(f(payload)) });
        self.routes.write().insert(cmd, handler);
    }

    pub fn set_http(&self, handler: Arc<dyn HttpHandler>) {
        *self.http.write() = Some(handler);
    }

    fn route(&self, cmd: Command) -> Option<Handler> {
        self.routes.read().get(&cmd).cloned()
    }

    /// Accept connections forever, one task per connection.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), NetError> {
        tracing::info!(addr = ?listener.local_addr().ok(), "endpoint listening");
        loop {
            let (stream, remote) = listener.accept().await?;
            let endpoint = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = endpoint.handle_connection(stream).await {
                    tracing::debug!(%remote, error = %e, "connection closed with error");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<(), NetError> {
        let mut first = [0u8; 8];
        let n = self
            .bounded(async { stream.peek(&mut first).await.map_err(NetError::from) })
            .await?;
        if n == 0 {
            return Ok(());
        }
        if looks_like_http(&first[..n]) {
            self.serve_http(stream).await
        } else {
            self.serve_peer(stream).await
        }
    }

    async fn serve_http(&self, stream: TcpStream) -> Result<(), NetError> {
        let Some(handler) = self.http.read().clone() else {
            tracing::debug!("HTTP request but no HTTP handler installed");
            return Ok(());
        };
        let service = service_fn(move |req| {
            let handler = Arc::clone(&handler);
            async move { Ok::<_, std::convert::Infallible>(handler.handle(req).await) }
        });
        http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .await?;
        Ok(())
    }

    /// Loop over commands until the peer closes the connection. Unknown
    /// commands and undecodable payloads drop the connection without reply,
    /// and so does a peer that stays silent past the idle timeout.
    async fn serve_peer(&self, stream: TcpStream) -> Result<(), NetError> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        while let Some(name) = self.bounded(read_command(&mut reader)).await? {
            let Some(cmd) = Command::parse(&name) else {
                tracing::warn!(command = %name, "unknown peer command; dropping connection");
                return Err(NetError::UnknownCommand(name));
            };
            let payload = if cmd.has_payload() {
                self.bounded(read_frame(&mut reader)).await?
            } else {
                Vec::new()
            };
            shardkv_metrics::metrics()
                .peer_received
                .with_label_values(&[cmd.as_str()])
                .inc();

            let handler = self.route(cmd).ok_or(NetError::NoHandler(cmd.as_str()))?;
            if let Some(reply) = handler(payload).await? {
                write_frame(&mut write_half, &reply).await?;
                write_half.flush().await?;
            }
        }
        Ok(())
    }
}
