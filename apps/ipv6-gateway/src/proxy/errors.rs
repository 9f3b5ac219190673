//! Proxy error types.

use super::ProxyBody;
use bytes::Bytes;
use core_rotation::DialError;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use hyper_util::client::legacy;
use std::error::Error as StdError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("dial failed: {0}")]
    Dial(#[from] DialError),

    #[error("TLS handshake with {host} failed: {source}")]
    Tls {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS handshake with {host} timed out after {timeout_secs}s")]
    TlsTimeout { host: String, timeout_secs: u64 },

    #[error("invalid upstream server name '{0}'")]
    ServerName(String),

    #[error("no usable root certificates: {0}")]
    Roots(String),

    #[error("upstream request failed: {}", describe(.0))]
    Upstream(#[from] legacy::Error),

    #[error("cannot rewrite request: {0}")]
    Request(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Dial(e) if e.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::TlsTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Upstream(e) => connect_cause(e)
                .map_or(StatusCode::BAD_GATEWAY, GatewayError::status_code),
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    /// Get type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            GatewayError::Dial(e) => e.type_name(),
            GatewayError::Tls { .. } => "tls",
            GatewayError::TlsTimeout { .. } => "tls_timeout",
            GatewayError::ServerName(_) => "server_name",
            GatewayError::Roots(_) => "roots",
            GatewayError::Upstream(e) => connect_cause(e).map_or("upstream", GatewayError::type_name),
            GatewayError::Request(_) => "request",
        }
    }

    /// Short plain-text response for the client. Details stay in the logs.
    pub fn to_response(&self) -> Response<ProxyBody> {
        let status = self.status_code();
        let text = format!("{}\n", status.canonical_reason().unwrap_or("Bad Gateway"));
        let body = Full::new(Bytes::from(text))
            .map_err(|never| match never {})
            .boxed();
        let mut resp = Response::new(body);
        *resp.status_mut() = status;
        resp.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        resp
    }
}

/// The connector failure behind a pooled-client error, if that is what it was.
fn connect_cause(err: &legacy::Error) -> Option<&GatewayError> {
    let mut cause = err.source();
    while let Some(e) = cause {
        if let Some(gw) = e.downcast_ref::<GatewayError>() {
            return Some(gw);
        }
        cause = e.source();
    }
    None
}

fn describe(err: &legacy::Error) -> String {
    let mut text = err.to_string();
    let mut cause = err.source();
    while let Some(e) = cause {
        text.push_str(": ");
        text.push_str(&e.to_string());
        cause = e.source();
    }
    text
}

pub type Result<T> = std::result::Result<T, GatewayError>;
