//! Request forwarding through the pooled upstream client.
//!
//! Flow:
//! 1. Rewrite the request for the upstream (absolute URI on the pinned host, no hop headers)
//! 2. Reuse an idle upstream connection, or open one through the rotating connector
//! 3. HTTP/2 when the upstream negotiates it, HTTP/1.1 otherwise; the response body streams back as it arrives

use super::connector::RotatingConnector;
use super::errors::{GatewayError, Result};
use super::redact::redact_query;
use super::ProxyBody;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::header::{HeaderMap, CONNECTION, HOST};
use hyper::{Request, Response, Uri, Version};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::error::Error as StdError;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{enabled, error, info, Level};

type BoxError = Box<dyn StdError + Send + Sync>;
type UpstreamBody = BoxBody<Bytes, BoxError>;

const HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub struct Forwarder {
    client: Client<RotatingConnector, UpstreamBody>,
    base: String,
}

impl Forwarder {
    pub fn new(connector: RotatingConnector, idle_timeout: Duration, max_idle_per_host: usize) -> Self {
        let base = match connector.port() {
            443 => format!("https://{}", connector.host()),
            port => format!("https://{}:{}", connector.host(), port),
        };
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(idle_timeout)
            .pool_max_idle_per_host(max_idle_per_host)
            .pool_timer(TokioTimer::new())
            .timer(TokioTimer::new())
            .build(connector);
        Self { client, base }
    }

    /// Serve one client request. Never fails: errors become a 502/504 response.
    pub async fn handle<B>(&self, req: Request<B>, remote: SocketAddr) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        let started = Instant::now();
        let method = req.method().clone();
        let uri = req.uri().clone();

        // If the client disconnects, hyper drops this future and nothing is logged.
        let response = match self.forward(req).await {
            Ok(resp) => resp,
            Err(e) => {
                let url = uri.to_string();
                error!(
                    error = %e,
                    kind = e.type_name(),
                    %method,
                    url = %redact_query(&url),
                    "proxy error"
                );
                e.to_response()
            }
        };

        if enabled!(Level::INFO) {
            let url = uri.to_string();
            info!(
                status = response.status().as_u16(),
                %method,
                url = %redact_query(&url),
                %remote,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "request"
            );
        }
        response
    }

    pub async fn forward<B>(&self, req: Request<B>) -> Result<Response<ProxyBody>>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        let req = rewrite_request(req, &self.base)?.map(upstream_body);
        let mut resp = self.client.request(req).await?;
        strip_hop_headers(resp.headers_mut());
        Ok(resp.map(|body| body.boxed()))
    }
}

fn upstream_body<B>(body: B) -> UpstreamBody
where
    B: Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(Into::into).boxed()
}

/// Point the request at `base` (`https://host[:port]`). The client fills in
/// Host from the URI, so the inbound one is dropped.
pub(crate) fn rewrite_request<B>(mut req: Request<B>, base: &str) -> Result<Request<B>> {
    let path = req.uri().path_and_query().map_or("/", |pq| pq.as_str());
    let uri: Uri = format!("{base}{path}")
        .parse()
        .map_err(|e| GatewayError::Request(format!("{e}")))?;
    *req.uri_mut() = uri;
    *req.version_mut() = Version::HTTP_11;

    let headers = req.headers_mut();
    strip_hop_headers(headers);
    headers.remove("x-forwarded-for");
    headers.remove(HOST);
    Ok(req)
}

/// Remove hop-by-hop headers, including any named in `Connection`.
pub(crate) fn strip_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();
    for name in &listed {
        headers.remove(name.as_str());
    }
    for name in HOP_HEADERS {
        headers.remove(*name);
    }
}
