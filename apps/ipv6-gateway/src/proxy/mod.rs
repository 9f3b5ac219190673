//! Reverse proxy in front of the protected upstream.
//!
//! Inbound requests are served over HTTP/1.1 and forwarded through a pooled
//! upstream client. Every new upstream connection is opened through the rotating
//! dial hook, so each one gets its own source/destination draw; idle connections
//! are reused until they expire.

mod connector;
mod errors;
mod handler;
mod redact;
mod tls;

pub use connector::RotatingConnector;
pub use errors::GatewayError;
pub use handler::Forwarder;
pub use tls::UpstreamTls;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use socket2::SockRef;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, TcpListener, TcpSocket};
use tracing::{debug, warn};

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

const LISTEN_BACKLOG: u32 = 1024;

/// Open the client-facing listener. The IPv6 wildcard accepts IPv4 clients too.
pub async fn bind(addr: &str) -> io::Result<TcpListener> {
    let addr = lookup_host(addr).await?.next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("no address for {addr}"))
    })?;
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(v6) => {
            let socket = TcpSocket::new_v6()?;
            if v6.ip().is_unspecified() {
                SockRef::from(&socket).set_only_v6(false)?;
            }
            socket
        }
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

/// Accept loop. Runs until the surrounding task is dropped.
pub async fn serve(listener: TcpListener, forwarder: Arc<Forwarder>) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let _ = stream.set_nodelay(true);

        let forwarder = Arc::clone(&forwarder);
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let forwarder = Arc::clone(&forwarder);
                async move { Ok::<_, Infallible>(forwarder.handle(req, remote).await) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!(%remote, error = %e, "client connection ended with error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn wildcard_listener_accepts_ipv4_and_ipv6_clients() {
        if TcpListener::bind("[::1]:0").await.is_err() {
            eprintln!("skipping: no IPv6 loopback");
            return;
        }
        let listener = bind("[::]:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { while listener.accept().await.is_ok() {} });

        TcpStream::connect(("::1", port)).await.unwrap();
        TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    }

    #[tokio::test]
    async fn explicit_ipv4_address_is_honored() {
        let listener = bind("127.0.0.1:0").await.unwrap();
        assert!(listener.local_addr().unwrap().is_ipv4());
    }
}
