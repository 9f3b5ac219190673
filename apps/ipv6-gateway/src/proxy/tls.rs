//! Upstream TLS. The server name is pinned to the configured host no matter
//! which literal address the dialer picked.

use super::errors::{GatewayError, Result};
use rustls::{ClientConfig, RootCertStore, ServerName};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

pub const ALPN_H2: &[u8] = b"h2";
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

pub struct UpstreamTls {
    connector: TlsConnector,
    server_name: ServerName,
    host: String,
    handshake_timeout: Duration,
}

impl UpstreamTls {
    /// Verify against the platform's root store.
    pub fn native(host: &str, handshake_timeout: Duration) -> Result<Self> {
        let certs = rustls_native_certs::load_native_certs()
            .map_err(|e| GatewayError::Roots(e.to_string()))?;
        let der: Vec<Vec<u8>> = certs.into_iter().map(|cert| cert.0).collect();

        let mut roots = RootCertStore::empty();
        let (added, ignored) = roots.add_parsable_certificates(&der);
        debug!(added, ignored, "loaded native root certificates");
        if roots.is_empty() {
            return Err(GatewayError::Roots("platform store is empty".into()));
        }
        Self::with_roots(host, roots, handshake_timeout)
    }

    pub fn with_roots(host: &str, roots: RootCertStore, handshake_timeout: Duration) -> Result<Self> {
        let server_name = ServerName::try_from(host)
            .map_err(|_| GatewayError::ServerName(host.to_string()))?;
        Ok(Self {
            connector: TlsConnector::from(Arc::new(client_config(roots))),
            server_name,
            host: host.to_string(),
            handshake_timeout,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub async fn connect(&self, tcp: TcpStream) -> Result<TlsStream<TcpStream>> {
        let handshake = self.connector.connect(self.server_name.clone(), tcp);
        tokio::time::timeout(self.handshake_timeout, handshake)
            .await
            .map_err(|_| GatewayError::TlsTimeout {
                host: self.host.clone(),
                timeout_secs: self.handshake_timeout.as_secs(),
            })?
            .map_err(|source| GatewayError::Tls {
                host: self.host.clone(),
                source,
            })
    }
}

fn client_config(roots: RootCertStore) -> ClientConfig {
    let mut cfg = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    cfg.alpn_protocols = vec![ALPN_H2.to_vec(), ALPN_HTTP11.to_vec()];
    cfg
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    const HANDSHAKE: Duration = Duration::from_secs(5);

    #[test]
    fn offers_h2_then_http1() {
        let cfg = client_config(RootCertStore::empty());
        assert_eq!(cfg.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }

    #[test]
    fn rejects_invalid_server_name() {
        let err = UpstreamTls::with_roots("not a host", RootCertStore::empty(), HANDSHAKE)
            .err()
            .unwrap();
        assert!(matches!(err, GatewayError::ServerName(_)));
        assert!(UpstreamTls::with_roots("api.example.com", RootCertStore::empty(), HANDSHAKE).is_ok());
    }

    #[tokio::test]
    async fn handshake_with_non_tls_peer_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let _ = s.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
        });

        let tls = UpstreamTls::with_roots("api.example.com", RootCertStore::empty(), HANDSHAKE).unwrap();
        let tcp = TcpStream::connect(addr).await.unwrap();
        let err = tls.connect(tcp).await.err().unwrap();
        assert_eq!(err.type_name(), "tls");
        assert_eq!(tls.host(), "api.example.com");
    }

    #[tokio::test]
    async fn silent_peer_hits_handshake_deadline() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Accept and hold the socket open without answering.
            let (_s, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let tls = UpstreamTls::with_roots(
            "api.example.com",
            RootCertStore::empty(),
            Duration::from_millis(200),
        )
        .unwrap();
        let tcp = TcpStream::connect(addr).await.unwrap();
        let err = tls.connect(tcp).await.err().unwrap();
        assert_eq!(err.type_name(), "tls_timeout");
        assert_eq!(err.status_code(), hyper::StatusCode::GATEWAY_TIMEOUT);
    }
}
