//! Pluggable synchronous transport.
//!
//! Every worker and the client core read and write through the [`Stream`]
//! trait rather than a concrete socket type, so TLS (behind the `tls`
//! feature) and plain TCP/Unix sockets share one interface. Deliberately
//! blocking/synchronous rather than `AsyncRead`/`AsyncWrite`: the blocking
//! worker calls straight through on a blocking socket, and the nonblocking
//! worker only calls in once its reactor has reported the socket readable, at
//! which point a read on a nonblocking socket behaves identically to this
//! trait's contract (`WouldBlock` once the socket runs dry).

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::io::RawFd;
#[cfg(unix)]
use std::os::unix::net::UnixStream;

/// Identifies the far end of a connection for logging and the `Handler`
/// interface; Unix-domain peers have no socket address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddr {
    Tcp(SocketAddr),
    Unix,
}

impl std::fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerAddr::Tcp(addr) => write!(f, "{addr}"),
            PeerAddr::Unix => write!(f, "<unix socket>"),
        }
    }
}

/// A connected, byte-oriented transport.
pub trait Stream: Read + Write + Send {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
    fn peer_addr(&self) -> io::Result<PeerAddr>;
    fn shutdown(&self) -> io::Result<()>;

    /// The raw descriptor backing this transport, for `mio` readiness
    /// registration in the nonblocking worker. Defaults to `-1`, a value no
    /// real socket returns; test doubles that never run under the
    /// nonblocking worker can rely on the default instead of implementing
    /// this themselves.
    #[cfg(unix)]
    fn as_raw_fd(&self) -> RawFd {
        -1
    }
}

impl Stream for TcpStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        TcpStream::set_nonblocking(self, nonblocking)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_write_timeout(self, timeout)
    }

    fn peer_addr(&self) -> io::Result<PeerAddr> {
        TcpStream::peer_addr(self).map(PeerAddr::Tcp)
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }

    #[cfg(unix)]
    fn as_raw_fd(&self) -> RawFd {
        std::os::unix::io::AsRawFd::as_raw_fd(self)
    }
}

#[cfg(unix)]
impl Stream for UnixStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        UnixStream::set_nonblocking(self, nonblocking)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        UnixStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        UnixStream::set_write_timeout(self, timeout)
    }

    fn peer_addr(&self) -> io::Result<PeerAddr> {
        Ok(PeerAddr::Unix)
    }

    fn shutdown(&self) -> io::Result<()> {
        UnixStream::shutdown(self, Shutdown::Both)
    }

    fn as_raw_fd(&self) -> RawFd {
        std::os::unix::io::AsRawFd::as_raw_fd(self)
    }
}

/// TLS transport, feature-gated since it pulls in the `rustls` stack. Two
/// thin wrappers around `rustls::StreamOwned` (client and server sides carry
/// different connection-state types) delegating everything but read/write to
/// the wrapped socket.
#[cfg(feature = "tls")]
pub mod tls {
    use super::{PeerAddr, Stream};
    use std::io::{self, Read, Write};
    use std::time::Duration;

    pub struct TlsServerStream<S: Stream> {
        inner: rustls::StreamOwned<rustls::ServerConnection, S>,
    }

    impl<S: Stream> TlsServerStream<S> {
        pub fn new(conn: rustls::ServerConnection, sock: S) -> Self {
            Self { inner: rustls::StreamOwned::new(conn, sock) }
        }
    }

    impl<S: Stream> Read for TlsServerStream<S> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.inner.read(buf)
        }
    }

    impl<S: Stream> Write for TlsServerStream<S> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.inner.write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            self.inner.flush()
        }
    }

    impl<S: Stream> Stream for TlsServerStream<S> {
        fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
            self.inner.sock.set_nonblocking(nonblocking)
        }
        fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
            self.inner.sock.set_read_timeout(timeout)
        }
        fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
            self.inner.sock.set_write_timeout(timeout)
        }
        fn peer_addr(&self) -> io::Result<PeerAddr> {
            self.inner.sock.peer_addr()
        }
        fn shutdown(&self) -> io::Result<()> {
            self.inner.sock.shutdown()
        }
        #[cfg(unix)]
        fn as_raw_fd(&self) -> super::RawFd {
            self.inner.sock.as_raw_fd()
        }
    }

    pub struct TlsClientStream<S: Stream> {
        inner: rustls::StreamOwned<rustls::ClientConnection, S>,
    }

    impl<S: Stream> TlsClientStream<S> {
        pub fn new(conn: rustls::ClientConnection, sock: S) -> Self {
            Self { inner: rustls::StreamOwned::new(conn, sock) }
        }
    }

    impl<S: Stream> Read for TlsClientStream<S> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.inner.read(buf)
        }
    }

    impl<S: Stream> Write for TlsClientStream<S> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.inner.write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            self.inner.flush()
        }
    }

    impl<S: Stream> Stream for TlsClientStream<S> {
        fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
            self.inner.sock.set_nonblocking(nonblocking)
        }
        fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
            self.inner.sock.set_read_timeout(timeout)
        }
        fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
            self.inner.sock.set_write_timeout(timeout)
        }
        fn peer_addr(&self) -> io::Result<PeerAddr> {
            self.inner.sock.peer_addr()
        }
        fn shutdown(&self) -> io::Result<()> {
            self.inner.sock.shutdown()
        }
        #[cfg(unix)]
        fn as_raw_fd(&self) -> super::RawFd {
            self.inner.sock.as_raw_fd()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn tcp_stream_reports_peer_addr_and_toggles_nonblocking() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        assert!(matches!(Stream::peer_addr(&server), Ok(PeerAddr::Tcp(_))));
        assert!(Stream::set_nonblocking(&client, true).is_ok());
    }
}
