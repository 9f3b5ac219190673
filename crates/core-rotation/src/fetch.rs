//! Destination list retrieval.

use crate::pool::DestinationSet;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Upper bound on a downloaded list body.
pub const MAX_LIST_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http status: {0}")]
    Status(u16),

    #[error("request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("read error: {0}")]
    Read(#[source] reqwest::Error),

    #[error("empty valid IP list")]
    Empty,

    #[error("list larger than {limit} bytes")]
    TooLarge { limit: usize },

    #[error("client setup failed: {0}")]
    Client(#[source] reqwest::Error),
}

impl FetchError {
    /// Short name for structured logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            FetchError::Status(_) => "status",
            FetchError::Timeout { .. } => "timeout",
            FetchError::Transport(_) => "transport",
            FetchError::Read(_) => "read",
            FetchError::Empty => "empty",
            FetchError::TooLarge { .. } => "too_large",
            FetchError::Client(_) => "client",
        }
    }
}

/// Somewhere a fresh destination set can be obtained from.
#[async_trait]
pub trait ListSource: Send + Sync {
    async fn fetch(&self) -> Result<DestinationSet, FetchError>;
}

/// Downloads the plain-text destination list over HTTP(S).
#[derive(Debug, Clone)]
pub struct ListFetcher {
    client: reqwest::Client,
    url: Url,
    timeout: Duration,
    max_bytes: usize,
}

impl ListFetcher {
    pub fn new(url: Url, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .build()
            .map_err(FetchError::Client)?;
        Ok(Self {
            client,
            url,
            timeout,
            max_bytes: MAX_LIST_BYTES,
        })
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn classify(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout {
                timeout_secs: self.timeout.as_secs(),
            }
        } else {
            FetchError::Transport(err)
        }
    }

    fn read_error(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            self.classify(err)
        } else {
            FetchError::Read(err)
        }
    }

    /// Read the body chunk by chunk, giving up once it passes `max_bytes`.
    async fn read_capped(&self, mut resp: reqwest::Response) -> Result<Vec<u8>, FetchError> {
        let limit = self.max_bytes;
        if resp.content_length().is_some_and(|len| len > limit as u64) {
            return Err(FetchError::TooLarge { limit });
        }
        let mut body = Vec::new();
        while let Some(chunk) = resp.chunk().await.map_err(|e| self.read_error(e))? {
            if body.len() + chunk.len() > limit {
                return Err(FetchError::TooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

#[async_trait]
impl ListSource for ListFetcher {
    async fn fetch(&self) -> Result<DestinationSet, FetchError> {
        let resp = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let body = self.read_capped(resp).await?;
        let body = String::from_utf8_lossy(&body);

        let set = DestinationSet::parse_list(&body);
        debug!(
            url = %self.url,
            lines = body.lines().count(),
            valid = set.len(),
            "destination list downloaded"
        );
        if set.is_empty() {
            return Err(FetchError::Empty);
        }
        Ok(set)
    }
}
