//! Integration tests for destination list refresh.
//!
//! A failed refresh must leave the previous list in place and dials must keep
//! using it.

use core_rotation::{
    DestinationPool, DestinationSet, DialHook, DialerConfig, FetchError, ListFetcher,
    RefreshScheduler, RotatingDialer, Subnet,
};
use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use url::Url;

/// Serves one canned HTTP response per connection, in order.
async fn list_server(responses: Vec<(&'static str, &'static str)>) -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        for (status, body) in responses {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let mut buf = vec![0u8; 4096];
            let _ = stream.read(&mut buf).await;
            let resp = format!(
                "HTTP/1.1 {}\r\nContent-Length: {}\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            let _ = stream.write_all(resp.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    });
    Url::parse(&format!("http://{addr}/valid_ips.txt")).unwrap()
}

fn set(addrs: &[&str]) -> DestinationSet {
    addrs.iter().map(|a| a.parse().unwrap()).collect()
}

#[tokio::test]
async fn successful_refresh_swaps_the_set() {
    let url = list_server(vec![
        ("200 OK", "2001:db8::1\n2001:db8::2\n"),
        ("200 OK", "# rotated\n2001:db8::3\n"),
    ])
    .await;
    let pool = Arc::new(DestinationPool::new());
    let fetcher = ListFetcher::new(url, Duration::from_secs(5)).unwrap();
    let scheduler = RefreshScheduler::new(fetcher, Arc::clone(&pool), Duration::from_secs(3600));

    assert_eq!(scheduler.refresh_once().await.unwrap(), 2);
    assert_eq!(*pool.snapshot(), set(&["2001:db8::1", "2001:db8::2"]));

    assert_eq!(scheduler.refresh_once().await.unwrap(), 1);
    assert_eq!(*pool.snapshot(), set(&["2001:db8::3"]));
}

#[tokio::test]
async fn failed_refresh_keeps_previous_set_and_dialing_works() {
    let Ok(upstream) = TcpListener::bind("[::1]:0").await else {
        eprintln!("skipping: no IPv6 loopback");
        return;
    };
    let port = upstream.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((_s, _)) = upstream.accept().await {}
    });

    let url = list_server(vec![
        ("200 OK", "::1\n"),
        ("503 Service Unavailable", "maintenance\n"),
        ("200 OK", "not-an-address\n10.0.0.1\n"),
    ])
    .await;
    let pool = Arc::new(DestinationPool::new());
    let fetcher = ListFetcher::new(url, Duration::from_secs(5)).unwrap();
    let scheduler = RefreshScheduler::new(fetcher, Arc::clone(&pool), Duration::from_secs(3600));

    assert_eq!(scheduler.refresh_once().await.unwrap(), 1);
    let before = pool.snapshot();

    assert!(matches!(scheduler.refresh_once().await, Err(FetchError::Status(503))));
    assert!(matches!(scheduler.refresh_once().await, Err(FetchError::Empty)));
    assert_eq!(*pool.snapshot(), *before);

    let source: Subnet = "::1/128".parse().unwrap();
    let mut config = DialerConfig::new("upstream.invalid");
    config.upstream_port = port;
    let dialer = RotatingDialer::new(config, Arc::new(source), pool);

    for _ in 0..3 {
        let stream = dialer.dial("upstream.invalid:443").await.unwrap();
        assert_eq!(stream.peer_addr().unwrap().port(), port);
        assert_eq!(
            stream.local_addr().unwrap().ip(),
            IpAddr::V6(Ipv6Addr::LOCALHOST)
        );
    }
}
