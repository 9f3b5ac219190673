//! Connector for the pooled upstream client.
//!
//! The client calls this only when it has no idle connection to reuse, and
//! each call goes through the dial hook, so every fresh connection gets its
//! own source and destination draw.

use super::errors::{GatewayError, Result};
use super::tls::{UpstreamTls, ALPN_H2};
use core_rotation::DialHook;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper::Uri;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tracing::debug;

#[derive(Clone)]
pub struct RotatingConnector {
    dialer: Arc<dyn DialHook>,
    tls: Arc<UpstreamTls>,
    port: u16,
}

impl RotatingConnector {
    pub fn new(dialer: Arc<dyn DialHook>, tls: Arc<UpstreamTls>, port: u16) -> Self {
        Self { dialer, tls, port }
    }

    pub fn host(&self) -> &str {
        self.tls.host()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    async fn open(self) -> Result<UpstreamStream> {
        let target = format!("{}:{}", self.tls.host(), self.port);
        let tcp = self.dialer.dial(&target).await?;
        let tls = self.tls.connect(tcp).await?;
        let stream = UpstreamStream(TokioIo::new(tls));
        debug!(h2 = stream.is_h2(), "upstream connection established");
        Ok(stream)
    }
}

impl tower::Service<Uri> for RotatingConnector {
    type Response = UpstreamStream;
    type Error = GatewayError;
    type Future = Pin<Box<dyn Future<Output = Result<UpstreamStream>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    // The request URI always names the pinned upstream; the dial target comes
    // from the connector's own host and port.
    fn call(&mut self, _dst: Uri) -> Self::Future {
        Box::pin(self.clone().open())
    }
}

/// A TLS connection to the upstream, as handed to the pooled client.
pub struct UpstreamStream(TokioIo<TlsStream<TcpStream>>);

impl UpstreamStream {
    pub fn is_h2(&self) -> bool {
        let (_, session) = self.0.inner().get_ref();
        session.alpn_protocol() == Some(ALPN_H2)
    }
}

impl Connection for UpstreamStream {
    fn connected(&self) -> Connected {
        let connected = Connected::new();
        if self.is_h2() {
            connected.negotiated_h2()
        } else {
            connected
        }
    }
}

impl Read for UpstreamStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl Write for UpstreamStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.0.is_write_vectored()
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.0).poll_write_vectored(cx, bufs)
    }
}
