//! Header rules for forwarding through the gateway
//!
//! Hop-by-hop headers only describe a single transport hop and are never
//! relayed. `Host` and `Accept-Encoding` are regenerated by the outbound
//! client, and the framing headers of a response are regenerated by the
//! inbound connection. `HeaderName`s are always lowercase, so every
//! comparison here is case-insensitive with respect to the wire.

use hyper::header::{
    HeaderMap, HeaderValue, ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS,
    ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE,
    ACCESS_CONTROL_REQUEST_HEADERS, CONNECTION, ORIGIN, VARY,
};

/// Headers meaningful for a single transport hop
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "proxy-connection",
];

/// Request headers the outbound client regenerates for the target
pub const REQUEST_REGENERATED: &[&str] = &["host", "accept-encoding"];

/// Response headers the inbound connection regenerates
pub const RESPONSE_REGENERATED: &[&str] = &[
    "content-length",
    "transfer-encoding",
    "connection",
    "keep-alive",
    "server",
    "date",
    "proxy-connection",
];

pub const ALLOWED_METHODS: &str = "GET, POST, OPTIONS";
pub const PREFLIGHT_MAX_AGE: &str = "86400";

/// Lowercased header names listed in `Connection` values
fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

/// Copy inbound request headers for the outbound request
pub fn forwarded_request_headers(src: &HeaderMap) -> HeaderMap {
    let listed = connection_tokens(src);
    let mut dst = HeaderMap::with_capacity(src.len());

    for (name, value) in src.iter() {
        let name_str = name.as_str();
        if HOP_BY_HOP.contains(&name_str)
            || REQUEST_REGENERATED.contains(&name_str)
            || listed.iter().any(|token| token == name_str)
        {
            continue;
        }
        dst.append(name.clone(), value.clone());
    }

    dst
}

/// Remove upstream response headers that must not be relayed downstream
pub fn strip_response_headers(headers: &mut HeaderMap) {
    for token in connection_tokens(headers) {
        headers.remove(token.as_str());
    }
    for name in HOP_BY_HOP.iter().chain(RESPONSE_REGENERATED) {
        headers.remove(*name);
    }
}

/// CORS grant derived from a request carrying an `Origin` header
#[derive(Debug, Clone)]
pub struct CorsGrant {
    origin: HeaderValue,
    request_headers: Option<HeaderValue>,
}

impl CorsGrant {
    /// Returns `None` when the request has no usable `Origin`
    pub fn from_request(headers: &HeaderMap) -> Option<Self> {
        let origin = headers.get(ORIGIN).filter(|v| !v.is_empty())?.clone();
        let request_headers = headers
            .get(ACCESS_CONTROL_REQUEST_HEADERS)
            .filter(|v| !v.is_empty())
            .cloned();
        Some(Self {
            origin,
            request_headers,
        })
    }

    /// Write the CORS response headers, replacing any set upstream
    pub fn apply(&self, headers: &mut HeaderMap) {
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, self.origin.clone());
        headers.insert(VARY, HeaderValue::from_static("Origin"));
        headers.insert(
            ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(ALLOWED_METHODS),
        );
        headers.insert(
            ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
        headers.insert(
            ACCESS_CONTROL_MAX_AGE,
            HeaderValue::from_static(PREFLIGHT_MAX_AGE),
        );
        if let Some(ref requested) = self.request_headers {
            headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
        }
    }
}
