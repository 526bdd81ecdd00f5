//! Server entry point and the blocking (thread-per-connection) worker, per
//! §4.6. The nonblocking, readiness-driven worker lives in
//! [`crate::nonblocking`]; both share the same `ServerConfig`, buffer
//! provider, handshake pool and handler factory.

use std::io::{self, Read, Write};
use std::net::TcpListener;
#[cfg(unix)]
use std::os::unix::net::UnixListener;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use slab::Slab;

use crate::buffer::{BufferProvider, BufferProviderConfig};
use crate::config::ServerConfig;
use crate::connection::{Connection, IoMode};
use crate::error::Error;
use crate::handler::{self, Handler, Handshake};
use crate::handshake::{self, HandshakePool};
use crate::message::MessageReader;
use crate::stream::Stream;

/// Builds the application handler for a freshly upgraded connection. Any
/// state the application wants every handler to share (a database pool, a
/// registry of peers) is whatever this closure captures; there is no
/// separate "context" parameter because a closure already is one.
pub type HandlerFactory<H> = Arc<dyn Fn(&Handshake, Arc<Connection>) -> Result<H, Error> + Send + Sync>;

const HANDSHAKE_READ_CHUNK: usize = 4096;

/// `MessageReader::fill` is generic over `Read` and therefore needs a sized
/// type; `dyn Stream` isn't one. This is the sized adapter that lets the
/// read loop hand a trait-object stream to it.
struct StreamRef<'a>(&'a mut dyn Stream);

impl Read for StreamRef<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

/// §7's `preHandOffWrite`: a best-effort `400` reply naming the failure, sent
/// before the connection that never upgraded is torn down. Five-second write
/// timeout so a peer that stops reading can't hang the worker thread; any
/// write error (including `WouldBlock` under that timeout) is swallowed,
/// since the connection is closing either way.
pub(crate) fn write_handshake_error_response(stream: &mut dyn Stream, err: &Error) {
    let _ = stream.set_write_timeout(Some(Duration::from_secs(5)));
    let response = handshake::reject_response(400, &err.to_string());
    let _ = stream.write_all(&response);
}

pub(crate) struct Shared {
    pub(crate) config: ServerConfig,
    pub(crate) buffer_provider: Arc<BufferProvider>,
    pub(crate) handshake_pool: Arc<HandshakePool>,
    connections: Mutex<Slab<Arc<Connection>>>,
    pub(crate) connection_count: AtomicUsize,
    pub(crate) shutting_down: AtomicBool,
    pub(crate) shutdown_signal: Condvar,
    pub(crate) shutdown_lock: Mutex<()>,
}

/// Owns the listening socket(s) and the shared state every accepted
/// connection's worker thread reads from.
pub struct Server<H: Handler> {
    shared: Arc<Shared>,
    factory: HandlerFactory<H>,
}

impl<H: Handler> Server<H> {
    pub fn new(config: ServerConfig, factory: HandlerFactory<H>) -> Self {
        let buffer_provider = Arc::new(BufferProvider::new(BufferProviderConfig {
            large_buffer_size: config.large_buffers.size,
            large_buffer_count: config.large_buffers.count,
            max_message_size: config.max_message_size,
        }));
        let handshake_pool = Arc::new(HandshakePool::new(config.handshake.pool_count, config.handshake.max_size));
        let shared = Arc::new(Shared {
            config,
            buffer_provider,
            handshake_pool,
            connections: Mutex::new(Slab::new()),
            connection_count: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
            shutdown_signal: Condvar::new(),
            shutdown_lock: Mutex::new(()),
        });
        Server { shared, factory }
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connection_count.load(Ordering::Acquire)
    }

    /// Runs the readiness-driven (kqueue/epoll) worker on the calling
    /// thread: one reactor plus a bounded thread pool, per §4.7. Unix-only,
    /// matching the platforms `mio`'s readiness backend actually covers here.
    #[cfg(unix)]
    pub fn run_nonblocking(&self) -> Result<(), Error> {
        crate::nonblocking::run(self.shared.clone(), self.factory.clone())
    }

    /// Signals every accept loop and the shutdown policy to tear down.
    /// Doesn't block; `run_blocking`/the nonblocking reactor observe this
    /// flag and return once their current iteration finishes.
    pub fn shutdown(&self) {
        self.shared.shutting_down.store(true, Ordering::Release);
        let _guard = self.shared.shutdown_lock.lock().expect("shutdown mutex poisoned");
        self.shared.shutdown_signal.notify_all();

        if self.shared.config.shutdown.close_socket {
            let conns: Vec<Arc<Connection>> = self.shared.connections.lock().expect("connection slab poisoned").iter().map(|(_, c)| c.clone()).collect();
            for conn in conns {
                if self.shared.config.shutdown.notify_client {
                    let _ = conn.write_close();
                }
                conn.close();
            }
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::Acquire)
    }

    /// Runs the thread-per-connection worker on the calling thread. Returns
    /// once `shutdown()` has been called and the accept loop notices it.
    pub fn run_blocking(&self) -> Result<(), Error> {
        if let Some(path) = self.shared.config.unix_path.clone() {
            #[cfg(unix)]
            {
                let _ = std::fs::remove_file(&path);
                let listener = UnixListener::bind(&path).map_err(Error::Io)?;
                listener.set_nonblocking(true).map_err(Error::Io)?;
                return self.accept_loop_unix(listener);
            }
            #[cfg(not(unix))]
            {
                let _ = path;
                panic!("unix_path configured on a non-Unix target");
            }
        }

        let port = self.shared.config.port.unwrap_or(0);
        let listener = TcpListener::bind(format!("{}:{port}", self.shared.config.address)).map_err(Error::Io)?;
        listener.set_nonblocking(true).map_err(Error::Io)?;
        self.accept_loop_tcp(listener)
    }

    fn accept_loop_tcp(&self, listener: TcpListener) -> Result<(), Error> {
        info!(target: "wsendpoint::server", "blocking worker listening on {:?}", listener.local_addr());
        loop {
            if self.is_shutting_down() {
                return Ok(());
            }
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!(target: "wsendpoint::server", "accepted {peer}");
                    let _ = stream.set_nodelay(true);
                    self.spawn_connection(Box::new(stream));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => self.wait_or_poll(),
                Err(e) => {
                    warn!(target: "wsendpoint::server", "accept error: {e}");
                    self.wait_or_poll();
                }
            }
        }
    }

    #[cfg(unix)]
    fn accept_loop_unix(&self, listener: UnixListener) -> Result<(), Error> {
        info!(target: "wsendpoint::server", "blocking worker listening on unix socket");
        loop {
            if self.is_shutting_down() {
                return Ok(());
            }
            match listener.accept() {
                Ok((stream, _)) => self.spawn_connection(Box::new(stream)),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => self.wait_or_poll(),
                Err(e) => {
                    warn!(target: "wsendpoint::server", "accept error: {e}");
                    self.wait_or_poll();
                }
            }
        }
    }

    /// Parks the accept loop on the shutdown condvar for a short interval
    /// rather than busy-spinning; `shutdown()` wakes it immediately.
    fn wait_or_poll(&self) {
        let guard = self.shared.shutdown_lock.lock().expect("shutdown mutex poisoned");
        let _ = self.shared.shutdown_signal.wait_timeout(guard, Duration::from_millis(50));
    }

    fn spawn_connection(&self, stream: Box<dyn Stream>) {
        let shared = self.shared.clone();
        let factory = self.factory.clone();
        thread::spawn(move || {
            if let Err(e) = serve_blocking_connection(shared, factory, stream) {
                if !e.is_quiet_transport_close() {
                    debug!(target: "wsendpoint::server", "connection ended: {e}");
                }
            }
        });
    }
}

fn serve_blocking_connection<H: Handler>(shared: Arc<Shared>, factory: HandlerFactory<H>, stream: Box<dyn Stream>) -> Result<(), Error> {
    let conn = Arc::new(Connection::new(stream, IoMode::Blocking)?);
    let key = shared.connections.lock().expect("connection slab poisoned").insert(conn.clone());
    shared.connection_count.fetch_add(1, Ordering::AcqRel);

    let result = run_connection(&shared, &factory, &conn);

    conn.close();
    shared.connections.lock().expect("connection slab poisoned").try_remove(key);
    shared.connection_count.fetch_sub(1, Ordering::AcqRel);
    result
}

fn run_connection<H: Handler>(shared: &Arc<Shared>, factory: &HandlerFactory<H>, conn: &Arc<Connection>) -> Result<(), Error> {
    conn.with_stream(|s| s.set_read_timeout(shared.config.handshake.timeout)).map_err(Error::Io)?;

    let mut hs = shared.handshake_pool.acquire();
    let (parsed, consumed) = loop {
        let outcome = match conn.with_stream(|s| read_some(s, &mut hs.buf, HANDSHAKE_READ_CHUNK)) {
            Ok(o) => o,
            Err(e) => {
                shared.handshake_pool.release(hs);
                return Err(e);
            }
        };
        if hs.buf.len() > shared.config.handshake.max_size {
            conn.with_stream(|s| write_handshake_error_response(s, &Error::RequestTooLarge));
            shared.handshake_pool.release(hs);
            return Err(Error::RequestTooLarge);
        }
        match handshake::parse_request(&hs.buf, shared.config.handshake.max_headers) {
            Ok(Some(result)) => break result,
            Ok(None) => {}
            Err(e) => {
                conn.with_stream(|s| write_handshake_error_response(s, &e));
                shared.handshake_pool.release(hs);
                return Err(e);
            }
        }
        match outcome {
            ReadOutcome::Data(_) => {}
            ReadOutcome::Eof => {
                shared.handshake_pool.release(hs);
                return Err(Error::Io(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "peer closed during handshake")));
            }
            ReadOutcome::WouldBlock => {
                if let Some(deadline) = shared.config.handshake.timeout {
                    if hs.started_at.elapsed() >= deadline {
                        conn.with_stream(|s| write_handshake_error_response(s, &Error::Timeout));
                        shared.handshake_pool.release(hs);
                        return Err(Error::Timeout);
                    }
                }
            }
        }
    };

    let subprotocol = shared.config.subprotocols.iter().find(|p| parsed.subprotocols.contains(p)).cloned();
    let handshake_info = Handshake { path: parsed.path, subprotocol: subprotocol.clone() };

    let mut handler = match factory(&handshake_info, conn.clone()) {
        Ok(h) => h,
        Err(e) => {
            conn.with_stream(|s| match H::handshake_error_response(&e) {
                Some(response) => {
                    let _ = s.set_write_timeout(Some(Duration::from_secs(5)));
                    let _ = s.write_all(&response);
                }
                None => write_handshake_error_response(s, &e),
            });
            shared.handshake_pool.release(hs);
            return Err(Error::HandshakeRejected);
        }
    };

    let response = handshake::accept_response(&parsed.key, subprotocol.as_deref());
    conn.with_stream(|s| s.write_all(&response)).map_err(Error::Io)?;

    conn.with_stream(|s| s.set_read_timeout(Some(connection_read_timeout()))).map_err(Error::Io)?;

    handler.after_init(conn);

    let leftover = hs.buf[consumed..].to_vec();
    shared.handshake_pool.release(hs);

    let mut reader = MessageReader::new(shared.config.connection_buffer_size, shared.config.max_message_size, shared.buffer_provider.clone());
    let result = read_loop(&mut reader, &mut handler, conn, &leftover);
    handler.close(conn);
    result
}

/// How long a post-handshake blocking read blocks before giving a concurrent
/// writer a chance at the connection's mutex (see `connection.rs`'s module
/// doc-comment for why this bounds writer starvation rather than eliminating
/// it with a second mutex).
fn connection_read_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Distinguishes "no more bytes yet" from "peer closed its write half",
/// which a bare byte count can't: both look like zero new bytes to a caller
/// that only checks `n == 0`, but only one of them should ever be read as
/// the handshake deadline per §5 ("compare wall-clock timestamps after each
/// partial read").
enum ReadOutcome {
    Data(usize),
    WouldBlock,
    Eof,
}

fn read_some(stream: &mut dyn Stream, buf: &mut Vec<u8>, chunk: usize) -> Result<ReadOutcome, Error> {
    let mut scratch = vec![0u8; chunk];
    loop {
        match std::io::Read::read(stream, &mut scratch) {
            Ok(0) => return Ok(ReadOutcome::Eof),
            Ok(n) => {
                buf.extend_from_slice(&scratch[..n]);
                return Ok(ReadOutcome::Data(n));
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => return Ok(ReadOutcome::WouldBlock),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io(e)),
        }
    }
}

fn read_loop<H: Handler>(reader: &mut MessageReader, handler: &mut H, conn: &Arc<Connection>, leftover: &[u8]) -> Result<(), Error> {
    let mut seed = std::io::Cursor::new(leftover.to_vec());
    reader.fill(&mut seed)?;

    loop {
        if conn.is_closed() {
            return Ok(());
        }
        let (has_more, event) = match reader.read() {
            Ok(r) => r,
            Err(e) => {
                let _ = conn.write_close_with_code(e.close_code(), b"");
                return Err(e);
            }
        };

        if let Some(ev) = event {
            let should_close = handler::dispatch(handler, conn, ev).unwrap_or_else(|e| {
                warn!(target: "wsendpoint::server", "handler error: {e}");
                true
            });
            reader.done();
            if should_close {
                return Ok(());
            }
        }

        if !has_more {
            conn.with_stream(|s| reader.fill(&mut StreamRef(s)))?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;

    struct NoopHandler;
    impl Handler for NoopHandler {
        fn handle_message(&mut self, _conn: &Connection, _data: Vec<u8>, _kind: MessageKind) -> Result<(), Error> {
            Ok(())
        }
    }

    #[test]
    fn new_server_starts_with_no_connections() {
        let factory: HandlerFactory<NoopHandler> = Arc::new(|_hs, _conn| Ok(NoopHandler));
        let server = Server::new(ServerConfig::default(), factory);
        assert_eq!(server.connection_count(), 0);
        assert!(!server.is_shutting_down());
    }

    #[test]
    fn shutdown_sets_the_shared_flag() {
        let factory: HandlerFactory<NoopHandler> = Arc::new(|_hs, _conn| Ok(NoopHandler));
        let server = Server::new(ServerConfig::default(), factory);
        server.shutdown();
        assert!(server.is_shutting_down());
    }
}
