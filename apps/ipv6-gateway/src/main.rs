mod config;
mod logging;
mod proxy;

use anyhow::{Context, Result};
use clap::Parser;
use config::{Cli, GatewayConfig};
use core_rotation::{
    detect_local_subnet, DialHook, DestinationPool, ListFetcher, RefreshScheduler,
    RotatingDialer, Subnet,
};
use proxy::{Forwarder, RotatingConnector, UpstreamTls};
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = GatewayConfig::load(&cli)?;
    let _log_guard = logging::init(&cfg.log_level, cfg.log_file.as_deref())?;

    let subnet = init_subnet(&cfg).await?;
    info!(%subnet, "source subnet ready");

    let pool = Arc::new(DestinationPool::new());
    let fetcher = ListFetcher::new(cfg.list_url()?, cfg.fetch_timeout())
        .context("build destination list client")?;
    let scheduler = RefreshScheduler::new(fetcher, Arc::clone(&pool), cfg.update_interval());
    if let Err(e) = scheduler.refresh_once().await {
        warn!(error = %e, kind = e.type_name(), "initial destination list load failed, using DNS until the next refresh");
    }
    let refresh = scheduler.spawn();

    let dialer: Arc<dyn DialHook> = Arc::new(RotatingDialer::new(
        cfg.dialer_config(),
        Arc::new(subnet),
        pool,
    ));
    let tls = UpstreamTls::native(&cfg.target_host, cfg.tls_handshake_timeout())
        .context("upstream TLS setup")?;
    let connector = RotatingConnector::new(dialer, Arc::new(tls), cfg.upstream_port);
    let forwarder = Arc::new(Forwarder::new(
        connector,
        cfg.pool_idle_timeout(),
        cfg.pool_max_idle_per_host,
    ));

    let bind = cfg.bind_addr();
    let listener = proxy::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    println!(
        "ipv6-gateway listening on {} -> {} (log level {})",
        cfg.listen_addr, cfg.target_host, cfg.log_level
    );

    let server = tokio::spawn(proxy::serve(listener, forwarder));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        j = server => {
            if let Err(e) = j {
                error!(error = %e, "server task failed");
            }
        }
    }

    refresh.abort();
    Ok(())
}

/// Manual CIDR when configured, otherwise the first routed block on the host.
async fn init_subnet(cfg: &GatewayConfig) -> Result<Subnet> {
    match &cfg.manual_cidr {
        Some(cidr) => cidr
            .parse()
            .with_context(|| format!("invalid IPv6 CIDR '{cidr}'")),
        None => detect_local_subnet()
            .await
            .context("no IPv6 subnet detected; set IPV6_CIDR or --cidr"),
    }
}
