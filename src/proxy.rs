use crate::config::{HostAddress, MuxConfig};
use crate::error::{text_error_response, MuxError, ProxyErrorCode};
use crate::headers::{self, CorsGrant};
use crate::health::{health_path, health_response, is_health_request};
use crate::pool::ConnectionPool;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Pause after a failed accept so a persistent error (e.g. fd exhaustion) can't spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// The gateway listening on the public address
pub struct ProxyServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    execution: Arc<HostAddress>,
    health_path: Arc<str>,
    shutdown_rx: watch::Receiver<bool>,
    pool: Arc<ConnectionPool>,
}

impl ProxyServer {
    /// Bind the public address.
    ///
    /// A port that is already taken means another gateway won a race we could
    /// not see through the lock, so it is reported as `StartupRace` rather than
    /// as a raw bind error.
    pub async fn bind(config: &MuxConfig, shutdown_rx: watch::Receiver<bool>) -> Result<Self, MuxError> {
        let public = &config.hosts.public;
        let listener = TcpListener::bind(public.bind_target())
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AddrInUse => {
                    MuxError::startup_race(public.to_string(), format!("address already in use ({})", e))
                }
                _ => MuxError::Io(e),
            })?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            execution: Arc::new(config.hosts.execution.clone()),
            health_path: Arc::from(health_path(public)),
            shutdown_rx,
            pool: Arc::new(ConnectionPool::new(config.pool.clone())),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            addr = %self.local_addr,
            execution = %self.execution,
            "Gateway listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let pool = Arc::clone(&self.pool);
                            let execution = Arc::clone(&self.execution);
                            let health_path = Arc::clone(&self.health_path);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, pool, execution, health_path).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        let stats = self.pool.stats();
        info!(
            forwarded = stats.get_forwarded(),
            failed = stats.get_failed(),
            "Gateway stopped"
        );
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    pool: Arc<ConnectionPool>,
    execution: Arc<HostAddress>,
    health_path: Arc<str>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let pool = Arc::clone(&pool);
        let execution = Arc::clone(&execution);
        let health_path = Arc::clone(&health_path);
        async move { handle_request(req, pool, execution, &health_path).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    pool: Arc<ConnectionPool>,
    execution: Arc<HostAddress>,
    health_path: &str,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let started = Instant::now();
    let rid = request_id();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    if is_health_request(&req, health_path) {
        debug!(rid, "Health probe answered");
        return Ok(health_response());
    }

    let cors = CorsGrant::from_request(req.headers());

    if method == Method::OPTIONS {
        let mut response = Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid response with StatusCode enum");
        if let Some(grant) = &cors {
            grant.apply(response.headers_mut());
        }
        debug!(rid, path, cors = cors.is_some(), "Preflight answered locally");
        return Ok(response);
    }

    let response = match pool.forward(req, &execution).await {
        Ok(upstream) => {
            let (mut parts, body) = upstream.into_parts();
            headers::strip_response_headers(&mut parts.headers);
            if let Some(grant) = &cors {
                grant.apply(&mut parts.headers);
            }

            // Headers are already on their way; a failure from here on can only close the connection
            let stream_rid = rid.clone();
            let body = body
                .map_err(move |e| {
                    let failure = MuxError::ProxyIo(e.to_string());
                    debug!(rid = %stream_rid, error = %failure, "Response body stream failed");
                    e
                })
                .boxed();
            Response::from_parts(parts, body)
        }
        Err(e) => {
            let failure = MuxError::from(e);
            warn!(rid, method = %method, path, error = %failure, "Failed to forward request to backend");
            text_error_response(ProxyErrorCode::for_error(&failure))
        }
    };

    debug!(
        rid,
        method = %method,
        path,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Request proxied"
    );
    Ok(response)
}

/// Short id correlating the log lines of one request
fn request_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_shape() {
        let id = request_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(request_id(), request_id());
    }
}
