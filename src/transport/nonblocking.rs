//! Event-loop socket.
//!
//! TLS is terminated by `tokio-rustls`. The handshake future is created at
//! accept time and only polled from [`AsyncSocket::do_handshake`], so the
//! caller decides how long a silent peer may hold the connection.

use super::{handshake_error, Transport, TransportError, TransportResult};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::{Accept, TlsAcceptor};

/// A plain or TLS socket owned by the event loop.
pub struct AsyncSocket {
    io: Io,
    peer_addr: SocketAddr,
}

enum Io {
    Plain(TcpStream),
    /// `None` once the handshake has failed.
    Handshaking(Option<Accept<TcpStream>>),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncSocket {
    /// Wrap an accepted stream without TLS.
    pub fn plain(tcp: TcpStream) -> io::Result<Self> {
        let peer_addr = tcp.peer_addr()?;
        tcp.set_nodelay(true)?;
        Ok(Self {
            io: Io::Plain(tcp),
            peer_addr,
        })
    }

    /// Wrap an accepted stream as the server side of a TLS session.
    ///
    /// The handshake is not run until [`do_handshake`](Self::do_handshake).
    pub fn tls(tcp: TcpStream, acceptor: &TlsAcceptor) -> io::Result<Self> {
        let peer_addr = tcp.peer_addr()?;
        tcp.set_nodelay(true)?;
        Ok(Self {
            io: Io::Handshaking(Some(acceptor.accept(tcp))),
            peer_addr,
        })
    }

    pub fn transport(&self) -> Transport {
        match self.io {
            Io::Plain(_) => Transport::Plain,
            Io::Handshaking(_) | Io::Tls(_) => Transport::Tls,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Protocol chosen through ALPN, once the handshake is complete.
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        match &self.io {
            Io::Tls(stream) => stream.get_ref().1.alpn_protocol(),
            _ => None,
        }
    }

    /// Complete the TLS handshake within `timeout`. No-op for plain sockets.
    pub async fn do_handshake(&mut self, timeout: Duration) -> TransportResult<()> {
        let Io::Handshaking(slot) = &mut self.io else {
            return Ok(());
        };
        let Some(accept) = slot.as_mut() else {
            return Err(TransportError::Handshake("handshake already failed".to_string()));
        };
        match tokio::time::timeout(timeout, accept).await {
            Ok(Ok(stream)) => {
                self.io = Io::Tls(Box::new(stream));
                Ok(())
            }
            Ok(Err(e)) => {
                *slot = None;
                Err(handshake_error(e))
            }
            Err(_) => Err(TransportError::HandshakeTimeout),
        }
    }

    /// Read up to `buf.len()` bytes. Zero means the peer shut down.
    pub async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> TransportResult<usize> {
        match tokio::time::timeout(timeout, AsyncReadExt::read(&mut *self, buf)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    /// Write some of `buf`, returning how much was accepted.
    pub async fn write(&mut self, buf: &[u8], timeout: Duration) -> TransportResult<usize> {
        let write = async {
            let n = AsyncWriteExt::write(&mut *self, buf).await?;
            self.flush().await?;
            Ok::<_, io::Error>(n)
        };
        match tokio::time::timeout(timeout, write).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    /// Write all of `buf` within `timeout`.
    pub async fn write_all(&mut self, buf: &[u8], timeout: Duration) -> TransportResult<()> {
        let write = async {
            AsyncWriteExt::write_all(&mut *self, buf).await?;
            self.flush().await
        };
        match tokio::time::timeout(timeout, write).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    /// Best-effort orderly shutdown.
    pub async fn close(&mut self) {
        let _ = tokio::time::timeout(Duration::from_millis(100), self.shutdown()).await;
    }
}

impl std::fmt::Debug for AsyncSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncSocket")
            .field("peer_addr", &self.peer_addr)
            .field("transport", &self.transport())
            .finish()
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "TLS handshake not complete")
}

impl AsyncRead for AsyncSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().io {
            Io::Plain(tcp) => Pin::new(tcp).poll_read(cx, buf),
            Io::Tls(stream) => match Pin::new(&mut **stream).poll_read(cx, buf) {
                // TLS peers that drop the TCP connection without close_notify
                Poll::Ready(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    Poll::Ready(Ok(()))
                }
                other => other,
            },
            Io::Handshaking(_) => Poll::Ready(Err(not_connected())),
        }
    }
}

impl AsyncWrite for AsyncSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().io {
            Io::Plain(tcp) => Pin::new(tcp).poll_write(cx, buf),
            Io::Tls(stream) => Pin::new(&mut **stream).poll_write(cx, buf),
            Io::Handshaking(_) => Poll::Ready(Err(not_connected())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().io {
            Io::Plain(tcp) => Pin::new(tcp).poll_flush(cx),
            Io::Tls(stream) => Pin::new(&mut **stream).poll_flush(cx),
            Io::Handshaking(_) => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().io {
            Io::Plain(tcp) => Pin::new(tcp).poll_shutdown(cx),
            Io::Tls(stream) => Pin::new(&mut **stream).poll_shutdown(cx),
            Io::Handshaking(_) => Poll::Ready(Ok(())),
        }
    }
}
