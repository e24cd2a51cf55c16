//! Gateway health endpoint and the probe used to detect a running gateway
//!
//! The ack token appears in both the probe and the response, so a healthy
//! answer proves that this multiplexer, and not some unrelated service, owns
//! the public address.

use crate::config::HostAddress;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Shared identifier proving the responder is an ollamamux gateway
pub const ACK_TOKEN: &str = "2FE6FFE6-C2AC-4DC0-BFAD-2371B47AAE71";

/// Reserved health endpoint (GET only; everything else is forwarded)
pub const HEALTH_PATH: &str = "/__mux/health";

/// Header carrying the ack token on probe requests
pub const ACK_HEADER: &str = "x-mux-ack";

const MAX_PROBE_BODY: usize = 64 * 1024;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Body of a health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthAck {
    pub acknowledged: bool,
    pub ack: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

impl HealthAck {
    pub fn current() -> Self {
        Self {
            acknowledged: true,
            ack: ACK_TOKEN.to_string(),
            name: PKG_NAME.to_string(),
            version: VERSION.to_string(),
        }
    }

    /// Whether this body confirms one of our gateways
    pub fn is_ours(&self) -> bool {
        self.acknowledged && self.ack.eq_ignore_ascii_case(ACK_TOKEN)
    }
}

/// Health endpoint path on a gateway whose public address is `public`.
///
/// Matches what [`probe_gateway`] requests, so a public address with a path
/// prefix still acknowledges its own health checks.
pub fn health_path(public: &HostAddress) -> String {
    format!("{}{}", public.path(), HEALTH_PATH.trim_start_matches('/'))
}

/// Whether a request targets the reserved health endpoint at `path`
pub fn is_health_request<B>(req: &Request<B>, path: &str) -> bool {
    req.method() == Method::GET && req.uri().path() == path
}

/// The gateway's answer to a health probe
pub fn health_response() -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = serde_json::to_string(&HealthAck::current()).unwrap_or_else(|_| {
        format!(r#"{{"acknowledged":true,"ack":"{}"}}"#, ACK_TOKEN)
    });

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static header")
}

/// Probe `address` for a healthy gateway, giving up after `timeout`.
///
/// Connection failures, timeouts, non-2xx statuses and bodies without the
/// ack marker all count as "no gateway".
pub async fn probe_gateway(address: &HostAddress, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, fetch_ack(address)).await {
        Ok(Ok(ack)) => {
            let ours = ack.is_ours();
            debug!(address = %address, acknowledged = ours, "Gateway probe answered");
            ours
        }
        Ok(Err(e)) => {
            debug!(address = %address, error = %e, "Gateway probe failed");
            false
        }
        Err(_) => {
            debug!(address = %address, timeout_ms = timeout.as_millis() as u64, "Gateway probe timed out");
            false
        }
    }
}

async fn fetch_ack(address: &HostAddress) -> anyhow::Result<HealthAck> {
    let client: Client<_, Empty<Bytes>> = Client::builder(TokioExecutor::new()).build_http();

    let req = Request::builder()
        .method(Method::GET)
        .uri(address.join(HEALTH_PATH))
        .header(ACK_HEADER, ACK_TOKEN)
        .body(Empty::<Bytes>::new())?;

    let response = client.request(req).await?;
    if !response.status().is_success() {
        anyhow::bail!("unexpected status {}", response.status());
    }

    let body = read_limited(response.into_body()).await?;
    Ok(serde_json::from_slice(&body)?)
}

async fn read_limited(body: Incoming) -> anyhow::Result<Bytes> {
    let collected = Limited::new(body, MAX_PROBE_BODY)
        .collect()
        .await
        .map_err(|e| anyhow::anyhow!("failed to read probe body: {}", e))?;
    Ok(collected.to_bytes())
}

/// Whether anything accepts TCP connections on `address` within `timeout`
pub async fn is_listening(address: &HostAddress, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(address.probe_authority())).await,
        Ok(Ok(_))
    )
}
