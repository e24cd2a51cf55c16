//! Connection pool for backend HTTP connections
//!
//! A single pooled client carries every forwarded request to the execution
//! address. The client is internally synchronized, so the gateway shares it
//! through an `Arc` without any extra locking.
//!
//! Concurrent backend connections are capped by a semaphore. A permit is
//! taken before the request goes out and travels with the response body, so
//! a slot frees up only once the body has finished or been dropped.

use crate::config::HostAddress;
use crate::error::MuxError;
use crate::headers;
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Connect timeout for backend connections; responses themselves are unbounded
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Error type for connection pool operations
#[derive(Debug)]
pub enum PoolError {
    /// Error from the HTTP client
    Client(hyper_util::client::legacy::Error),
    /// Error building a request
    RequestBuild(String),
    /// The connection limiter was shut down
    Closed,
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Client(e) => write!(f, "Client error: {}", e),
            PoolError::RequestBuild(s) => write!(f, "Request build error: {}", s),
            PoolError::Closed => write!(f, "Connection pool closed"),
        }
    }
}

impl std::error::Error for PoolError {}

impl From<hyper_util::client::legacy::Error> for PoolError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        PoolError::Client(err)
    }
}

impl From<PoolError> for MuxError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Client(e) => MuxError::UpstreamUnavailable(e.to_string()),
            other => MuxError::ProxyIo(other.to_string()),
        }
    }
}

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Requests whose upstream response headers were received
    pub forwarded: AtomicU64,
    /// Requests that failed before upstream response headers arrived
    pub failed: AtomicU64,
}

impl PoolStats {
    pub fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub fn get_failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum backend connections in use at once; further requests wait
    pub max_connections: usize,
    /// Maximum idle connections kept to the backend
    pub max_idle_per_host: usize,
    /// Idle connection lifetime
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 128,
            max_idle_per_host: 128,
            idle_timeout: Duration::from_secs(120),
        }
    }
}

/// Upstream response body holding its connection slot until it is done
pub struct PooledBody {
    inner: Incoming,
    _permit: OwnedSemaphorePermit,
}

impl Body for PooledBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, hyper::Error>>> {
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// A pooled, streaming HTTP client to the execution backend
pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    limiter: Arc<Semaphore>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    /// Create a new connection pool with the given configuration
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);
        connector.set_connect_timeout(Some(CONNECT_TIMEOUT));

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        // A zero cap would stall every request
        let max_connections = config.max_connections.max(1);

        debug!(
            max_connections,
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            limiter: Arc::new(Semaphore::new(max_connections)),
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    /// Get the pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get pool statistics
    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Connection slots not currently held by a request or response body
    pub fn available_connections(&self) -> usize {
        self.limiter.available_permits()
    }

    /// Forward a request to `target`, keeping its method, path and query.
    ///
    /// The inbound body is handed to the client as-is, so it streams to the
    /// backend. Resolves once the upstream response headers are in; the
    /// response body is still streaming when this returns. Waits for a free
    /// connection slot when the cap is reached.
    pub async fn forward(
        &self,
        req: Request<Incoming>,
        target: &HostAddress,
    ) -> Result<Response<PooledBody>, PoolError> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let uri = target
            .join(path_and_query)
            .parse::<Uri>()
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        let (parts, body) = req.into_parts();
        let mut outbound = Request::new(body);
        *outbound.method_mut() = parts.method;
        *outbound.uri_mut() = uri;
        *outbound.headers_mut() = headers::forwarded_request_headers(&parts.headers);

        let permit = Arc::clone(&self.limiter)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;

        match self.client.request(outbound).await {
            Ok(response) => {
                self.stats.record_forwarded();
                Ok(response.map(|inner| PooledBody {
                    inner,
                    _permit: permit,
                }))
            }
            Err(e) => {
                self.stats.record_failed();
                Err(e.into())
            }
        }
    }
}
