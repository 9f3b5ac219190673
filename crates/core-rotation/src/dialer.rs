//! Rotating dialer: the dial hook handed to the forwarding layer.
//!
//! Flow for a connection to the protected host:
//! 1. Draw a source address from the subnet (skip binding if that fails)
//! 2. Draw a destination from the pool
//! 3. Empty pool: resolve the host via DNS, keep only IPv6 answers
//! 4. Otherwise: connect straight to `[dest]:port`, no DNS
//!
//! TLS is not done here. The caller wraps the returned stream and always
//! authenticates the configured host name, whichever address was dialed.

use crate::pool::DestinationPicker;
use crate::subnet::SourceAddressGenerator;
use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, enabled, warn, Level};

#[derive(Debug, Error)]
pub enum DialError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("bind to source {addr} failed: {source}")]
    Bind {
        addr: Ipv6Addr,
        #[source]
        source: io::Error,
    },

    #[error("DNS resolution failed for host '{host}': {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("no IPv6 address found for host '{host}'")]
    NoIpv6Address { host: String },

    #[error("dial timeout after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl DialError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, DialError::Timeout { .. })
    }

    /// Short name for structured logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            DialError::Connect { .. } => "connect",
            DialError::Bind { .. } => "bind",
            DialError::Resolve { .. } => "resolve",
            DialError::NoIpv6Address { .. } => "no_ipv6",
            DialError::Timeout { .. } => "timeout",
            DialError::Io(_) => "io",
        }
    }
}

/// The single capability the forwarding layer needs: open a TCP connection to
/// `host:port`. Dropping the returned future cancels the dial.
#[async_trait]
pub trait DialHook: Send + Sync {
    async fn dial(&self, target: &str) -> Result<TcpStream, DialError>;
}

#[derive(Debug, Clone)]
pub struct DialerConfig {
    /// The only host whose connections are rotated.
    pub upstream_host: String,
    pub upstream_port: u16,
    /// Deadline for one intercepted dial, DNS fallback included.
    pub connect_timeout: Duration,
    /// Deadline for pass-through dials.
    pub passthrough_timeout: Duration,
    pub keepalive: Duration,
}

impl DialerConfig {
    pub fn new(upstream_host: impl Into<String>) -> Self {
        Self {
            upstream_host: upstream_host.into(),
            upstream_port: 443,
            connect_timeout: Duration::from_secs(10),
            passthrough_timeout: Duration::from_secs(30),
            keepalive: Duration::from_secs(30),
        }
    }
}

/// Where an intercepted connection will go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Literal(Ipv6Addr),
    /// Pool was empty; resolve the upstream host name instead.
    DnsFallback,
}

/// Everything drawn for one intercepted dial.
#[derive(Debug, Clone)]
pub struct ConnectionAttempt {
    pub host: String,
    pub port: u16,
    pub source: Option<Ipv6Addr>,
    pub destination: Destination,
    pub deadline: Instant,
}

pub struct RotatingDialer {
    config: DialerConfig,
    sources: Arc<dyn SourceAddressGenerator>,
    destinations: Arc<dyn DestinationPicker>,
}

impl RotatingDialer {
    pub fn new(
        config: DialerConfig,
        sources: Arc<dyn SourceAddressGenerator>,
        destinations: Arc<dyn DestinationPicker>,
    ) -> Self {
        Self {
            config,
            sources,
            destinations,
        }
    }

    pub fn config(&self) -> &DialerConfig {
        &self.config
    }

    /// Whether `target` (`host:port`, `[v6]:port` or a bare host) names the
    /// protected upstream.
    pub fn intercepts(&self, target: &str) -> bool {
        let host = split_host(target).trim_end_matches('.');
        host.eq_ignore_ascii_case(self.config.upstream_host.trim_end_matches('.'))
    }

    /// Draw source and destination for `target`; `None` means pass-through.
    pub fn plan(&self, target: &str) -> Option<ConnectionAttempt> {
        if !self.intercepts(target) {
            return None;
        }
        let source = self.sources.generate();
        let destination = match self.destinations.pick() {
            Some(ip) => Destination::Literal(ip),
            None => Destination::DnsFallback,
        };
        Some(ConnectionAttempt {
            host: self.config.upstream_host.clone(),
            port: self.config.upstream_port,
            source,
            destination,
            deadline: Instant::now() + self.config.connect_timeout,
        })
    }

    /// Carry out a planned attempt.
    pub async fn connect(&self, attempt: &ConnectionAttempt) -> Result<TcpStream, DialError> {
        if enabled!(Level::DEBUG) {
            let src = attempt
                .source
                .map_or_else(|| "system".to_string(), |ip| ip.to_string());
            match attempt.destination {
                Destination::Literal(ip) => debug!(source = %src, destination = %ip, "dial"),
                Destination::DnsFallback => {
                    debug!(source = %src, host = %attempt.host, "dial via DNS fallback")
                }
            }
        }

        let timeout_secs = self.config.connect_timeout.as_secs();
        let result = timeout_at(attempt.deadline, self.connect_inner(attempt))
            .await
            .map_err(|_| DialError::Timeout { timeout_secs })?;

        if let (Err(e), Destination::Literal(ip)) = (&result, attempt.destination) {
            warn!(destination = %ip, error = %e, "Dial failed");
        }
        result
    }

    async fn connect_inner(&self, attempt: &ConnectionAttempt) -> Result<TcpStream, DialError> {
        let remotes = match attempt.destination {
            Destination::Literal(ip) => {
                vec![SocketAddr::V6(SocketAddrV6::new(ip, attempt.port, 0, 0))]
            }
            Destination::DnsFallback => resolve_ipv6(&attempt.host, attempt.port).await?,
        };

        let mut last_err = None;
        for remote in remotes {
            match connect_from(attempt.source, remote, self.config.keepalive).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(%remote, error = %e, "candidate address failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| DialError::NoIpv6Address {
            host: attempt.host.clone(),
        }))
    }

    async fn pass_through(&self, target: &str) -> Result<TcpStream, DialError> {
        let limit = self.config.passthrough_timeout;
        timeout(limit, TcpStream::connect(target))
            .await
            .map_err(|_| DialError::Timeout {
                timeout_secs: limit.as_secs(),
            })?
            .map_err(DialError::Io)
    }
}

#[async_trait]
impl DialHook for RotatingDialer {
    async fn dial(&self, target: &str) -> Result<TcpStream, DialError> {
        match self.plan(target) {
            Some(attempt) => self.connect(&attempt).await,
            None => self.pass_through(target).await,
        }
    }
}

async fn resolve_ipv6(host: &str, port: u16) -> Result<Vec<SocketAddr>, DialError> {
    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|source| DialError::Resolve {
            host: host.to_string(),
            source,
        })?
        .filter(SocketAddr::is_ipv6)
        .collect();
    if addrs.is_empty() {
        return Err(DialError::NoIpv6Address {
            host: host.to_string(),
        });
    }
    Ok(addrs)
}

async fn connect_from(
    source: Option<Ipv6Addr>,
    remote: SocketAddr,
    keepalive: Duration,
) -> Result<TcpStream, DialError> {
    let socket = TcpSocket::new_v6()?;
    if let Some(ip) = source {
        socket
            .bind(SocketAddr::V6(SocketAddrV6::new(ip, 0, 0, 0)))
            .map_err(|source| DialError::Bind { addr: ip, source })?;
    }
    if !keepalive.is_zero() {
        SockRef::from(&socket).set_tcp_keepalive(&TcpKeepalive::new().with_time(keepalive))?;
    }
    socket
        .connect(remote)
        .await
        .map_err(|source| DialError::Connect {
            addr: remote,
            source,
        })
}

/// Host part of `host:port`, `[v6]:port`, `[v6]` or a bare host / v6 literal.
fn split_host(target: &str) -> &str {
    if let Some(rest) = target.strip_prefix('[') {
        return rest.split_once(']').map_or(rest, |(host, _)| host);
    }
    match target.rsplit_once(':') {
        // More than one colon without brackets: a bare IPv6 literal.
        Some((host, _)) if !host.contains(':') => host,
        _ => target,
    }
}
