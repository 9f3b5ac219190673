//! Integration tests for dial routing: which connections rotate and which
//! pass straight through.

use core_rotation::{
    DestinationPool, DestinationSet, DialError, DialHook, DialerConfig, RotatingDialer, Subnet,
};
use std::net::Ipv6Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn dialer(host: &str, port: u16, pool: Arc<DestinationPool>) -> RotatingDialer {
    let mut config = DialerConfig::new(host);
    config.upstream_port = port;
    config.connect_timeout = Duration::from_secs(5);
    let subnet: Subnet = "::1/128".parse().unwrap();
    RotatingDialer::new(config, Arc::new(subnet), pool)
}

#[tokio::test]
async fn other_hosts_pass_through_untouched() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut s, _) = listener.accept().await.unwrap();
        s.write_all(b"plain").await.unwrap();
    });

    // The pool holds an address nobody listens on; pass-through must not use it.
    let pool = Arc::new(DestinationPool::with_set(
        ["2001:db8::dead"].iter().map(|a| a.parse().unwrap()).collect(),
    ));
    let d = dialer("api.example.com", 443, pool);

    let mut stream = d.dial(&addr.to_string()).await.unwrap();
    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"plain");
    assert!(stream.peer_addr().unwrap().is_ipv4());
}

#[tokio::test]
async fn upstream_host_is_routed_to_pool_member() {
    let Ok(listener) = TcpListener::bind("[::1]:0").await else {
        eprintln!("skipping: no IPv6 loopback");
        return;
    };
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut s, _)) = listener.accept().await {
            let _ = s.write_all(b"rotated").await;
        }
    });

    let pool = Arc::new(DestinationPool::with_set(DestinationSet::new(vec![
        Ipv6Addr::LOCALHOST,
    ])));
    let d = dialer("upstream.invalid", port, pool);

    // Port in the target is ignored in favor of the configured upstream port.
    let mut stream = d.dial("UPSTREAM.invalid:8443").await.unwrap();
    let mut buf = [0u8; 7];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"rotated");
}

#[tokio::test]
async fn empty_pool_falls_back_to_dns() {
    let d = dialer("upstream.invalid", 443, Arc::new(DestinationPool::new()));
    let attempt = d.plan("upstream.invalid:443").unwrap();
    assert_eq!(attempt.destination, core_rotation::Destination::DnsFallback);
    assert_eq!(attempt.source, Some(Ipv6Addr::LOCALHOST));

    // `.invalid` never resolves.
    let err = d.dial("upstream.invalid:443").await.unwrap_err();
    assert!(
        matches!(
            err,
            DialError::Resolve { .. } | DialError::NoIpv6Address { .. } | DialError::Timeout { .. }
        ),
        "{err}"
    );
}
