//! One transport connection: plain TCP or TLS over TCP.
//!
//! A [`Peer`] owns at most one live stream. [`Peer::swap`] exchanges the
//! streams of two peers so migration can hand an authenticated shadow
//! connection to a live channel; the shutdown flag stays with the
//! object it was created for.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use futures::task::AtomicWaker;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::client::TlsStream;
use tracing::{debug, warn};

use crate::error::SpiceError;

// ── I/O classification ───────────────────────────────────────────

/// How a failed read or write should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoClass {
    /// Not ready yet; retry when the socket is.
    WouldBlock,
    /// Retry immediately.
    Interrupted,
    /// The peer went away.
    Disconnected,
    /// Anything else; surfaced as a connection error.
    Fatal,
}

impl IoClass {
    /// rustls surfaces its own retry conditions as `WouldBlock`, so TLS
    /// and plain sockets classify the same way.
    pub fn classify(err: &io::Error) -> Self {
        use io::ErrorKind::*;
        match err.kind() {
            WouldBlock => IoClass::WouldBlock,
            Interrupted => IoClass::Interrupted,
            UnexpectedEof | ConnectionReset | ConnectionAborted | BrokenPipe | NotConnected => {
                IoClass::Disconnected
            }
            _ => IoClass::Fatal,
        }
    }
}

/// Map an I/O error on an established connection onto [`SpiceError`].
pub fn io_error(err: io::Error) -> SpiceError {
    match IoClass::classify(&err) {
        IoClass::Disconnected => SpiceError::Disconnected,
        _ => SpiceError::Connection(err),
    }
}

// ── ShutdownHandle ───────────────────────────────────────────────

#[derive(Debug, Default)]
struct ShutdownInner {
    shut: AtomicBool,
    waker: AtomicWaker,
}

/// Marks a [`Peer`] as shut down from any task. Pending reads and
/// writes wake up and fail with `NotConnected`; the socket itself is
/// released only by [`Peer::close`].
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    inner: Arc<ShutdownInner>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.inner.shut.store(true, Ordering::SeqCst);
        self.inner.waker.wake();
    }

    pub fn is_shut(&self) -> bool {
        self.inner.shut.load(Ordering::SeqCst)
    }

    fn enable(&self) {
        self.inner.shut.store(false, Ordering::SeqCst);
    }

    fn poll_shut(&self, cx: &mut Context<'_>) -> bool {
        if self.is_shut() {
            return true;
        }
        self.inner.waker.register(cx.waker());
        self.is_shut()
    }
}

// ── Peer ─────────────────────────────────────────────────────────

pub enum PeerStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl std::fmt::Debug for PeerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerStream::Plain(_) => f.write_str("Plain"),
            PeerStream::Tls(_) => f.write_str("Tls"),
        }
    }
}

#[derive(Debug, Default)]
pub struct Peer {
    stream: Option<PeerStream>,
    shut: ShutdownHandle,
}

impl Peer {
    /// A peer with no connection.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_stream(stream: PeerStream) -> Self {
        Self {
            stream: Some(stream),
            shut: ShutdownHandle::default(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn is_secure(&self) -> bool {
        matches!(self.stream, Some(PeerStream::Tls(_)))
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shut.clone()
    }

    /// Mark the peer so blocked operations observe a disconnect.
    pub fn shutdown(&self) {
        self.shut.shutdown();
    }

    /// Clear a previous shutdown so the peer can be reused.
    pub fn enable(&self) {
        self.shut.enable();
    }

    /// Release the connection immediately.
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!("peer closed");
        }
    }

    /// Exchange live connections with `other`.
    pub fn swap(&mut self, other: &mut Peer) {
        std::mem::swap(&mut self.stream, &mut other.stream);
    }

    /// Write all of `buf`, retrying interrupted writes.
    pub async fn send(&mut self, buf: &[u8]) -> Result<(), SpiceError> {
        let mut pos = 0;
        while pos < buf.len() {
            match self.write(&buf[pos..]).await {
                Ok(0) => return Err(SpiceError::Disconnected),
                Ok(n) => pos += n,
                Err(e) => match IoClass::classify(&e) {
                    IoClass::Interrupted | IoClass::WouldBlock => continue,
                    _ => return Err(io_error(e)),
                },
            }
        }
        self.flush().await.map_err(io_error)
    }

    /// Fill all of `buf`, retrying interrupted reads.
    pub async fn receive(&mut self, buf: &mut [u8]) -> Result<(), SpiceError> {
        let mut pos = 0;
        while pos < buf.len() {
            match self.read(&mut buf[pos..]).await {
                Ok(0) => return Err(SpiceError::Disconnected),
                Ok(n) => pos += n,
                Err(e) => match IoClass::classify(&e) {
                    IoClass::Interrupted | IoClass::WouldBlock => continue,
                    _ => return Err(io_error(e)),
                },
            }
        }
        Ok(())
    }

    fn stream_or_closed(&mut self, cx: &mut Context<'_>) -> io::Result<Pin<&mut PeerStream>> {
        if self.shut.poll_shut(cx) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "peer shut down"));
        }
        match self.stream.as_mut() {
            Some(s) => Ok(Pin::new(s)),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "peer not connected")),
        }
    }
}

impl AsyncRead for PeerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PeerStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            PeerStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for PeerStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            PeerStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            PeerStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PeerStream::Plain(s) => Pin::new(s).poll_flush(cx),
            PeerStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PeerStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            PeerStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

impl AsyncRead for Peer {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().stream_or_closed(cx) {
            Ok(s) => s.poll_read(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl AsyncWrite for Peer {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut().stream_or_closed(cx) {
            Ok(s) => s.poll_write(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream_or_closed(cx) {
            Ok(s) => s.poll_flush(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream.as_mut() {
            Some(s) => Pin::new(s).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

// ── TCP connect ──────────────────────────────────────────────────

/// Resolve `host` and connect to the first address that accepts.
pub async fn connect_tcp(host: &str, port: u16) -> Result<TcpStream, SpiceError> {
    let addrs: Vec<_> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| SpiceError::AddressResolution(format!("{host}: {e}")))?
        .collect();
    if addrs.is_empty() {
        return Err(SpiceError::AddressResolution(host.to_string()));
    }

    let mut last_err = None;
    for addr in addrs {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(SpiceError::SocketCreate)?;

        match socket.connect(addr).await {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!(%addr, "set_nodelay failed: {e}");
                }
                debug!(%addr, "tcp connected");
                return Ok(stream);
            }
            Err(e) => {
                debug!(%addr, "connect failed: {e}");
                last_err = Some((addr, e));
            }
        }
    }

    match last_err {
        Some((addr, source)) => Err(SpiceError::ConnectFailed {
            addr: addr.to_string(),
            source,
        }),
        None => Err(SpiceError::AddressResolution(host.to_string())),
    }
}
