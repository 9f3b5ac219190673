//! Gateway configuration.
//!
//! Layered: built-in defaults, then an optional TOML file, then environment
//! variables, then command-line flags.

use anyhow::{bail, Context, Result};
use clap::Parser;
use core_rotation::DialerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const DEFAULT_LIST_URL: &str =
    "https://raw.githubusercontent.com/ccbkkb/ipv6-googleapis/refs/heads/main/valid_ips.txt";

#[derive(Parser, Debug, Default)]
#[command(name = "ipv6-gateway", version, about = "Reverse proxy rotating IPv6 source and destination addresses")]
pub struct Cli {
    /// Optional TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Address to listen on
    #[arg(long)]
    pub listen: Option<String>,
    /// Manual IPv6 CIDR (e.g. 2001:db8::/48)
    #[arg(long)]
    pub cidr: Option<String>,
    /// Log level: DEBUG, INFO, WARN, ERROR
    #[arg(long)]
    pub log_level: Option<String>,
    /// Path to log file
    #[arg(long)]
    pub log_file: Option<PathBuf>,
    /// URL of the destination IPv6 list
    #[arg(long)]
    pub list_url: Option<String>,
    /// Seconds between destination list refreshes
    #[arg(long)]
    pub update_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    // Upstream
    pub target_host: String,
    pub upstream_port: u16,

    // Listener
    pub listen_addr: String,

    // Destination list
    pub ipv6_list_url: String,
    pub update_interval_secs: u64,
    pub fetch_timeout_secs: u64,

    // Source subnet; auto-detected when unset
    pub manual_cidr: Option<String>,

    // Timeouts (seconds)
    pub connect_timeout_secs: u64,
    pub passthrough_timeout_secs: u64,
    pub keepalive_secs: u64,
    pub tls_handshake_timeout_secs: u64,

    // Upstream connection pool
    pub pool_idle_timeout_secs: u64,
    pub pool_max_idle_per_host: usize,

    // Logging
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            target_host: String::from("generativelanguage.googleapis.com"),
            upstream_port: 443,
            listen_addr: String::from(":8080"),
            ipv6_list_url: String::from(DEFAULT_LIST_URL),
            update_interval_secs: 60 * 60,
            fetch_timeout_secs: 15,
            manual_cidr: None,
            connect_timeout_secs: 10,
            passthrough_timeout_secs: 30,
            keepalive_secs: 30,
            tls_handshake_timeout_secs: 10,
            pool_idle_timeout_secs: 90,
            pool_max_idle_per_host: 1000,
            log_level: String::from("ERROR"),
            log_file: None,
        }
    }
}

impl GatewayConfig {
    /// Resolve the full configuration for a run.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.apply_cli(cli);
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Environment overrides. `lookup` is `std::env::var` in production.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = get("TARGET_HOST") {
            self.target_host = v;
        }
        if let Some(v) = get("LISTEN_ADDR") {
            self.listen_addr = v;
        }
        if let Some(v) = get("IPV6_CIDR") {
            self.manual_cidr = Some(v);
        }
        if let Some(v) = get("IPV6_LIST_URL") {
            self.ipv6_list_url = v;
        }
        if let Some(v) = get("UPDATE_INTERVAL_SECS") {
            self.update_interval_secs = v
                .trim()
                .parse()
                .with_context(|| format!("UPDATE_INTERVAL_SECS: invalid number '{v}'"))?;
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = get("LOG_FILE") {
            self.log_file = Some(PathBuf::from(v));
        }
        Ok(())
    }

    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(v) = &cli.listen {
            self.listen_addr = v.clone();
        }
        if let Some(v) = &cli.cidr {
            self.manual_cidr = Some(v.clone());
        }
        if let Some(v) = &cli.log_level {
            self.log_level = v.clone();
        }
        if let Some(v) = &cli.log_file {
            self.log_file = Some(v.clone());
        }
        if let Some(v) = &cli.list_url {
            self.ipv6_list_url = v.clone();
        }
        if let Some(v) = cli.update_interval_secs {
            self.update_interval_secs = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let host = self.target_host.trim();
        if host.is_empty() {
            bail!("target host must not be empty");
        }
        if host.contains(|c: char| matches!(c, '/' | ':' | ' ')) {
            bail!("target host '{host}' must be a bare host name");
        }
        if self.update_interval_secs == 0 {
            bail!("update interval must be at least one second");
        }
        if self.fetch_timeout_secs == 0
            || self.connect_timeout_secs == 0
            || self.passthrough_timeout_secs == 0
            || self.tls_handshake_timeout_secs == 0
        {
            bail!("timeouts must be non-zero");
        }
        if self.keepalive_secs == 0 {
            bail!("TCP keepalive must be at least one second");
        }
        self.list_url()?;
        Ok(())
    }

    pub fn list_url(&self) -> Result<Url> {
        let url = Url::parse(&self.ipv6_list_url)
            .with_context(|| format!("invalid list URL '{}'", self.ipv6_list_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!("list URL must be http or https, got '{}'", url.scheme());
        }
        Ok(url)
    }

    /// Socket address to bind. A bare `:port` means every interface, IPv6 and
    /// IPv4 alike; the listener is opened dual-stack for the `[::]` wildcard.
    pub fn bind_addr(&self) -> String {
        match self.listen_addr.strip_prefix(':') {
            Some(port) => format!("[::]:{port}"),
            None => self.listen_addr.clone(),
        }
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn tls_handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.tls_handshake_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }

    pub fn dialer_config(&self) -> DialerConfig {
        DialerConfig {
            upstream_host: self.target_host.clone(),
            upstream_port: self.upstream_port,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            passthrough_timeout: Duration::from_secs(self.passthrough_timeout_secs),
            keepalive: Duration::from_secs(self.keepalive_secs),
        }
    }
}
