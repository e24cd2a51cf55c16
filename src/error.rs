//! Error taxonomy for the multiplexer and plain-text error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use thiserror::Error;

/// Errors surfaced by the coordinator, supervisor and gateway.
///
/// Only startup-level variants ever reach the process exit path. Per-request
/// failures are turned into HTTP responses inside the request handler.
#[derive(Debug, Error)]
pub enum MuxError {
    /// Malformed address override or config file (recovered by falling back to defaults)
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Public and execution address resolve to the same endpoint
    #[error("public address {0} and execution address are identical; the gateway would proxy to itself")]
    HostLoop(String),

    /// Lock unavailable and no healthy gateway answered in time
    #[error("could not acquire or confirm a gateway on {address}: {reason}")]
    StartupRace { address: String, reason: String },

    /// Backend could not be reached for a request
    #[error("backend unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Backend executable missing or exited during its startup grace window
    #[error("failed to launch backend: {reason}. {hint}")]
    BackendLaunchFailure { reason: String, hint: &'static str },

    /// Failure while streaming a proxied body
    #[error("proxy transfer failed: {0}")]
    ProxyIo(String),

    /// The gateway accept loop stopped with an error
    #[error("gateway stopped: {0}")]
    Gateway(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Remediation hint attached to launch failures
pub const INSTALL_HINT: &str = "Please ensure Ollama is installed and in your PATH.";

impl MuxError {
    pub fn launch_failure(reason: impl Into<String>) -> Self {
        MuxError::BackendLaunchFailure {
            reason: reason.into(),
            hint: INSTALL_HINT,
        }
    }

    pub fn startup_race(address: impl Into<String>, reason: impl Into<String>) -> Self {
        MuxError::StartupRace {
            address: address.into(),
            reason: reason.into(),
        }
    }
}

/// Error codes reported by the gateway in the X-Proxy-Error header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    /// Failed to connect to or receive headers from the backend
    UpstreamUnavailable,
    /// Could not build the outbound request
    InternalError,
}

impl ProxyErrorCode {
    /// Code reported for a request that failed with `err`
    pub fn for_error(err: &MuxError) -> Self {
        match err {
            MuxError::UpstreamUnavailable(_) => ProxyErrorCode::UpstreamUnavailable,
            _ => ProxyErrorCode::InternalError,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::BAD_GATEWAY,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Create a minimal plain-text error response with X-Proxy-Error header
pub fn text_error_response(code: ProxyErrorCode) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "text/plain; charset=utf-8")
        .header("X-Proxy-Error", code.as_header_value())
        .body(
            Full::new(Bytes::from_static(b"Proxy error"))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::UpstreamUnavailable.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyErrorCode::InternalError.status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_error_code_for_request_failures() {
        assert_eq!(
            ProxyErrorCode::for_error(&MuxError::UpstreamUnavailable("connection refused".into())),
            ProxyErrorCode::UpstreamUnavailable
        );
        assert_eq!(
            ProxyErrorCode::for_error(&MuxError::ProxyIo("bad uri".into())),
            ProxyErrorCode::InternalError
        );
    }

    #[tokio::test]
    async fn test_text_error_response() {
        let response = text_error_response(ProxyErrorCode::UpstreamUnavailable);

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "text/plain; charset=utf-8"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "UPSTREAM_UNAVAILABLE"
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Proxy error");
    }

    #[test]
    fn test_launch_failure_carries_hint() {
        let err = MuxError::launch_failure("'ollama' not found");
        let message = err.to_string();
        assert!(message.contains("'ollama' not found"));
        assert!(message.contains(INSTALL_HINT));
    }

    #[test]
    fn test_startup_race_message() {
        let err = MuxError::startup_race("http://127.0.0.1:11434/", "probe timed out");
        assert_eq!(
            err.to_string(),
            "could not acquire or confirm a gateway on http://127.0.0.1:11434/: probe timed out"
        );
    }
}
