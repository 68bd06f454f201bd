//! Transport abstraction: how raw byte streams to an instance are opened

use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

/// Byte stream a transport dialer can return
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Stream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Type-erased raw stream
pub type BoxedStream = Box<dyn Stream>;

/// Opens raw connections; replaceable for proxies, Unix sockets or tests
///
/// The network is always TCP-like and the address is `host:port`. There is
/// no deadline parameter: the caller wraps `dial` in the dial timeout and
/// cancellation, so implementations may simply block until connected.
#[async_trait]
pub trait TransportDialer: Send + Sync + 'static {
    /// Connect to `addr` (`host:port`)
    async fn dial(&self, addr: &str) -> io::Result<BoxedStream>;
}

/// Plain TCP transport
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

#[async_trait]
impl TransportDialer for TcpDialer {
    async fn dial(&self, addr: &str) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Transport backed by a closure
pub struct FnDialer<F> {
    f: F,
}

impl<F> FnDialer<F> {
    /// Wrap a dial function
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> fmt::Debug for FnDialer<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnDialer(<fn>)")
    }
}

#[async_trait]
impl<F, Fut, S> TransportDialer for FnDialer<F>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = io::Result<S>> + Send,
    S: Stream,
{
    async fn dial(&self, addr: &str) -> io::Result<BoxedStream> {
        let stream = (self.f)(addr.to_string()).await?;
        Ok(Box::new(stream))
    }
}

/// Established, mutually authenticated stream to an instance
///
/// Reads and writes go straight through the TLS session; no framing is added.
pub struct InstanceStream {
    inner: TlsStream<BoxedStream>,
    instance: String,
}

impl InstanceStream {
    pub(crate) fn new(inner: TlsStream<BoxedStream>, instance: String) -> Self {
        crate::metrics::gauges::connection_opened(&instance);
        Self { inner, instance }
    }

    /// Connection name of the instance this stream talks to
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// DER-encoded certificates presented by the server
    pub fn peer_certificates(&self) -> Option<&[rustls_pki_types::CertificateDer<'static>]> {
        let (_raw, session) = self.inner.get_ref();
        session.peer_certificates()
    }
}

impl fmt::Debug for InstanceStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceStream")
            .field("instance", &self.instance)
            .field("inner", &"TlsStream")
            .finish()
    }
}

impl Drop for InstanceStream {
    fn drop(&mut self) {
        crate::metrics::gauges::connection_closed(&self.instance);
    }
}

impl AsyncRead for InstanceStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for InstanceStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
