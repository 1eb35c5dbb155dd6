//! Blocking socket for worker threads.
//!
//! Plain TCP uses per-call socket timeouts. TLS sessions live in an
//! [`AsyncSocket`] and each call blocks the worker on the runtime handle, so
//! the TLS state never has to change hands when a connection moves to the
//! event loop.

use super::{AsyncSocket, Transport, TransportResult};
use bytes::Bytes;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_rustls::TlsAcceptor;

/// Socket timeouts of zero are rejected by the OS, so clamp to this.
const MIN_TIMEOUT: Duration = Duration::from_millis(1);

/// A plain or TLS socket for blocking workers.
pub struct BlockingSocket {
    io: Io,
    peer_addr: SocketAddr,
}

enum Io {
    Plain(TcpStream),
    Tls { socket: AsyncSocket, runtime: Handle },
}

impl BlockingSocket {
    /// Wrap an accepted stream without TLS.
    pub fn plain(tcp: TcpStream) -> io::Result<Self> {
        let peer_addr = tcp.peer_addr()?;
        tcp.set_nonblocking(false)?;
        tcp.set_nodelay(true)?;
        Ok(Self {
            io: Io::Plain(tcp),
            peer_addr,
        })
    }

    /// Wrap an accepted stream as the server side of a TLS session.
    ///
    /// The stream is registered with `runtime`; the handshake is not run
    /// until [`do_handshake`](Self::do_handshake).
    pub fn tls(tcp: TcpStream, acceptor: &TlsAcceptor, runtime: Handle) -> io::Result<Self> {
        let peer_addr = tcp.peer_addr()?;
        tcp.set_nonblocking(true)?;
        let socket = {
            let _entered = runtime.enter();
            AsyncSocket::tls(tokio::net::TcpStream::from_std(tcp)?, acceptor)?
        };
        Ok(Self {
            io: Io::Tls { socket, runtime },
            peer_addr,
        })
    }

    pub fn transport(&self) -> Transport {
        match self.io {
            Io::Plain(_) => Transport::Plain,
            Io::Tls { .. } => Transport::Tls,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Protocol chosen through ALPN, once the handshake is complete.
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        match &self.io {
            Io::Plain(_) => None,
            Io::Tls { socket, .. } => socket.alpn_protocol(),
        }
    }

    /// Complete the TLS handshake within `timeout`. No-op for plain sockets.
    pub fn do_handshake(&mut self, timeout: Duration) -> TransportResult<()> {
        match &mut self.io {
            Io::Plain(_) => Ok(()),
            Io::Tls { socket, runtime } => runtime.block_on(socket.do_handshake(timeout)),
        }
    }

    /// Read up to `buf.len()` bytes. Zero means the peer shut down.
    pub fn read(&mut self, buf: &mut [u8], timeout: Duration) -> TransportResult<usize> {
        match &mut self.io {
            Io::Plain(tcp) => {
                tcp.set_read_timeout(Some(timeout.max(MIN_TIMEOUT)))?;
                Ok(tcp.read(buf)?)
            }
            Io::Tls { socket, runtime } => runtime.block_on(socket.read(buf, timeout)),
        }
    }

    /// Read up to `max_bytes` into a fresh buffer.
    pub fn read_bytes(&mut self, max_bytes: usize, timeout: Duration) -> TransportResult<Bytes> {
        let mut buf = vec![0u8; max_bytes];
        let n = self.read(&mut buf, timeout)?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    /// Write some of `buf`, returning how much was accepted.
    pub fn write(&mut self, buf: &[u8], timeout: Duration) -> TransportResult<usize> {
        match &mut self.io {
            Io::Plain(tcp) => {
                tcp.set_write_timeout(Some(timeout.max(MIN_TIMEOUT)))?;
                Ok(tcp.write(buf)?)
            }
            Io::Tls { socket, runtime } => runtime.block_on(socket.write(buf, timeout)),
        }
    }

    /// Write all of `buf`, each step bounded by `timeout`.
    pub fn write_all(&mut self, mut buf: &[u8], timeout: Duration) -> TransportResult<()> {
        while !buf.is_empty() {
            match self.write(buf, timeout)? {
                0 => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                n => buf = &buf[n..],
            }
        }
        Ok(())
    }

    /// Best-effort orderly shutdown.
    pub fn close(&mut self) {
        match &mut self.io {
            Io::Plain(tcp) => {
                let _ = tcp.shutdown(Shutdown::Both);
            }
            Io::Tls { socket, runtime } => runtime.block_on(socket.close()),
        }
    }

    /// Move the socket, TLS state included, onto the event loop.
    ///
    /// Must be called from within a tokio runtime context.
    pub fn into_async(self) -> io::Result<AsyncSocket> {
        match self.io {
            Io::Plain(tcp) => {
                tcp.set_read_timeout(None)?;
                tcp.set_write_timeout(None)?;
                tcp.set_nonblocking(true)?;
                AsyncSocket::plain(tokio::net::TcpStream::from_std(tcp)?)
            }
            Io::Tls { socket, .. } => Ok(socket),
        }
    }
}

impl std::fmt::Debug for BlockingSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingSocket")
            .field("peer_addr", &self.peer_addr)
            .field("transport", &self.transport())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use std::net::TcpListener;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (server, client)
    }

    #[test]
    fn test_plain_read_write() {
        let (server, mut client) = pair();
        let mut socket = BlockingSocket::plain(server).unwrap();
        assert_eq!(socket.transport(), Transport::Plain);
        assert!(socket.alpn_protocol().is_none());

        client.write_all(b"hello").unwrap();
        let data = socket.read_bytes(16, Duration::from_secs(1)).unwrap();
        assert_eq!(&data[..], b"hello");

        socket.write_all(b"world", Duration::from_secs(1)).unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn test_read_timeout() {
        let (server, _client) = pair();
        let mut socket = BlockingSocket::plain(server).unwrap();
        let mut buf = [0u8; 8];
        let err = socket.read(&mut buf, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
    }

    #[test]
    fn test_orderly_shutdown_reads_zero() {
        let (server, client) = pair();
        let mut socket = BlockingSocket::plain(server).unwrap();
        drop(client);
        let mut buf = [0u8; 8];
        assert_eq!(socket.read(&mut buf, Duration::from_secs(1)).unwrap(), 0);
    }

    #[test]
    fn test_plain_handshake_is_noop() {
        let (server, _client) = pair();
        let mut socket = BlockingSocket::plain(server).unwrap();
        socket.do_handshake(Duration::from_millis(1)).unwrap();
    }

    #[test]
    fn test_silent_peer_hits_handshake_timeout() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let (certs, key) = crate::transport::tls::self_signed();
        let acceptor = TlsAcceptor::from(crate::transport::tls::server_config(certs, key, true).unwrap());

        let (server, _client) = pair();
        let mut socket = BlockingSocket::tls(server, &acceptor, runtime.handle().clone()).unwrap();
        assert_eq!(socket.transport(), Transport::Tls);
        let err = socket.do_handshake(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, TransportError::HandshakeTimeout), "{err}");
    }
}
