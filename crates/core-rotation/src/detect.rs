//! Subnet auto-detection from the local IPv6 routing table.
//!
//! Hosts that route a whole block to themselves (`ip -6 route add local
//! 2001:db8::/48 dev lo`) expose it in the `local` table; the first such
//! non-link-local route is taken as the source subnet.

use crate::subnet::{Subnet, SubnetError};
use tokio::process::Command;
use tracing::{debug, info};

/// Run `ip -6 route show table local` and pick the first usable block.
pub async fn detect_local_subnet() -> Result<Subnet, SubnetError> {
    let output = Command::new("ip")
        .args(["-6", "route", "show", "table", "local"])
        .output()
        .await
        .map_err(|e| SubnetError::Detection(format!("failed to run ip: {e}")))?;

    if !output.status.success() {
        return Err(SubnetError::Detection(format!(
            "ip exited with {}",
            output.status
        )));
    }

    let routes = String::from_utf8_lossy(&output.stdout);
    debug!(lines = routes.lines().count(), "read local route table");
    let subnet = parse_local_routes(&routes).ok_or(SubnetError::NotFound)?;
    info!(%subnet, "auto-detected subnet");
    Ok(subnet)
}

/// First CIDR token in the route listing that parses as a unicast, non-link-local
/// IPv6 block.
pub fn parse_local_routes(routes: &str) -> Option<Subnet> {
    routes
        .lines()
        .filter_map(|line| line.split_whitespace().find(|tok| tok.contains('/')))
        .filter_map(|tok| tok.parse::<Subnet>().ok())
        .find(|subnet| !is_link_local(subnet) && !subnet.network().is_multicast())
}

fn is_link_local(subnet: &Subnet) -> bool {
    subnet.network().segments()[0] & 0xffc0 == 0xfe80
}
