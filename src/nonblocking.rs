//! Readiness-driven nonblocking worker, per §4.7: a single reactor thread
//! polling kqueue (BSD/macOS) or epoll (Linux) through `mio`, dispatching
//! ready sockets to a bounded thread pool. Unix-only, since both backends
//! `mio` wraps here are unix readiness primitives and there is no Windows
//! worker to keep at parity with.
//!
//! The oneshot/dispatch semantics §4.7 asks for (EV_DISPATCH / EPOLLONESHOT,
//! "at most one worker thread ever holds a given HandlerConn") aren't a
//! built-in `mio` mode; they're built by hand here: deregister a socket's fd
//! the moment its readiness event is observed (nothing more can be delivered
//! for it), hand the connection to the pool, and only `reregister` once the
//! pool worker has drained it to `WouldBlock`. Registration goes through
//! [`mio::unix::SourceFd`] against the *raw* fd rather than through `mio`'s
//! own socket types, so the actual reads and writes can keep going through
//! the same [`Stream`] trait object the blocking worker and client use.
//! `SourceFd` exists precisely for "I already own this socket elsewhere,
//! just let me drive its readiness".

use std::io::{self, Read};
use std::net::TcpListener;
#[cfg(unix)]
use std::os::unix::io::{AsRawFd, RawFd};
#[cfg(unix)]
use std::os::unix::net::UnixListener;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;

use crate::connection::{Connection, IoMode};
use crate::error::Error;
use crate::handler::{self, Handler, Handshake};
use crate::handshake::HandshakeState;
use crate::message::MessageReader;
use crate::server::{write_handshake_error_response, HandlerFactory, Shared};
use crate::stream::Stream;

/// How often the reactor wakes even without a readiness event, purely to
/// sweep connections whose handshake deadline has elapsed without another
/// byte ever arriving (a silent peer produces no `EPOLLIN`/`EVFILT_READ` to
/// recheck the deadline against otherwise).
const HANDSHAKE_SWEEP_INTERVAL: Duration = Duration::from_millis(250);

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);
const TOKEN_OFFSET: usize = 2;

fn token_for(slab_key: usize) -> Token {
    Token(slab_key + TOKEN_OFFSET)
}

fn slab_key_for(token: Token) -> usize {
    token.0 - TOKEN_OFFSET
}

enum Phase<H: Handler> {
    Handshaking(HandshakeState),
    Active { handler: H, reader: MessageReader },
}

/// One accepted connection's nonblocking-worker bookkeeping. `fd` is kept
/// alongside the [`Connection`] purely so the reactor thread can
/// (de)register/rearm readiness without reaching into the connection's
/// transport mutex. Registration is a property of the raw descriptor, not
/// of anything `Connection` itself needs to know about.
struct Entry<H: Handler> {
    conn: Arc<Connection>,
    fd: RawFd,
    phase: Mutex<Option<Phase<H>>>,
}

enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl Listener {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Listener::Tcp(l) => l.as_raw_fd(),
            #[cfg(unix)]
            Listener::Unix(l) => l.as_raw_fd(),
        }
    }

    fn accept(&self) -> io::Result<Box<dyn Stream>> {
        match self {
            Listener::Tcp(l) => {
                let (stream, _peer) = l.accept()?;
                let _ = stream.set_nodelay(true);
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            Listener::Unix(l) => {
                let (stream, _) = l.accept()?;
                Ok(Box::new(stream))
            }
        }
    }
}

/// A unit of work handed from the reactor thread to the pool: "this
/// connection just became readable, go drain it."
struct Job<H: Handler> {
    key: usize,
    entry: Arc<Entry<H>>,
}

struct PoolHandle<H: Handler> {
    sender: mpsc::Sender<Job<H>>,
}

/// Runs the reactor loop on the calling thread until `shared.shutdown()` is
/// observed. Spawns `config.thread_pool.count` worker threads up front;
/// they live for the duration of this call.
pub fn run<H: Handler>(shared: Arc<Shared>, factory: HandlerFactory<H>) -> Result<(), Error> {
    let listener = bind_listener(&shared)?;
    let mut poll = Poll::new().map_err(Error::Io)?;
    poll.registry()
        .register(&mut SourceFd(&listener.as_raw_fd()), LISTENER_TOKEN, Interest::READABLE)
        .map_err(Error::Io)?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).map_err(Error::Io)?);

    spawn_shutdown_watcher(shared.clone(), waker);

    let registry = poll.registry().try_clone().map_err(Error::Io)?;
    let (tx, rx) = mpsc::channel::<Job<H>>();
    let rx = Arc::new(Mutex::new(rx));
    // Pool workers only ever touch `Entry`/`connection_count`; the slab
    // itself belongs to the reactor thread alone, so a closed entry's key is
    // handed back here instead of having workers mutate `connections` directly.
    let (retire_tx, retire_rx) = mpsc::channel::<usize>();
    let pool_size = shared.config.thread_pool.count.max(1);
    let mut pool_threads = Vec::with_capacity(pool_size);
    for _ in 0..pool_size {
        let rx = rx.clone();
        let shared = shared.clone();
        let factory = factory.clone();
        let registry = registry.try_clone().map_err(Error::Io)?;
        let retire_tx = retire_tx.clone();
        pool_threads.push(thread::spawn(move || pool_worker_loop(rx, shared, factory, registry, retire_tx)));
    }
    drop(retire_tx);
    let pool = PoolHandle { sender: tx };

    info!(target: "wsendpoint::nonblocking", "nonblocking worker listening");
    let mut events = Events::with_capacity(1024);
    let mut connections: Slab<Arc<Entry<H>>> = Slab::new();

    let sweep_interval = shared.config.handshake.timeout.map(|_| HANDSHAKE_SWEEP_INTERVAL);

    loop {
        if let Err(e) = poll.poll(&mut events, sweep_interval) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::Io(e));
        }

        for event in events.iter() {
            match event.token() {
                LISTENER_TOKEN => accept_all(&shared, &listener, &mut connections, poll.registry()),
                WAKER_TOKEN => {}
                token => {
                    let key = slab_key_for(token);
                    if let Some(entry) = connections.get(key).cloned() {
                        // Deregister first: once this fd is out of the
                        // interest list no further event can be observed
                        // for it until a pool worker explicitly rearms it,
                        // which is the entire "at most one owner" guarantee.
                        let _ = poll.registry().deregister(&mut SourceFd(&entry.fd));
                        let _ = pool.sender.send(Job { key, entry });
                    }
                }
            }
        }

        while let Ok(key) = retire_rx.try_recv() {
            if let Some(entry) = connections.try_remove(key) {
                let _ = poll.registry().deregister(&mut SourceFd(&entry.fd));
            }
        }

        if sweep_interval.is_some() {
            sweep_expired_handshakes(&shared, &mut connections, poll.registry());
        }

        if shared.shutting_down.load(Ordering::Acquire) {
            break;
        }
    }

    drop(pool);
    for t in pool_threads {
        let _ = t.join();
    }
    for (_, entry) in connections.iter() {
        if shared.config.shutdown.notify_client {
            let _ = entry.conn.write_close();
        }
        entry.conn.close();
    }
    Ok(())
}

fn spawn_shutdown_watcher(shared: Arc<Shared>, waker: Arc<Waker>) {
    thread::spawn(move || loop {
        let guard = shared.shutdown_lock.lock().expect("shutdown mutex poisoned");
        if shared.shutting_down.load(Ordering::Acquire) {
            let _ = waker.wake();
            return;
        }
        let (_guard, timed_out) = shared
            .shutdown_signal
            .wait_timeout(guard, std::time::Duration::from_millis(200))
            .expect("shutdown mutex poisoned");
        if !timed_out.timed_out() || shared.shutting_down.load(Ordering::Acquire) {
            let _ = waker.wake();
            if shared.shutting_down.load(Ordering::Acquire) {
                return;
            }
        }
    });
}

fn bind_listener(shared: &Shared) -> Result<Listener, Error> {
    use socket2::{Domain, Socket, Type};

    if let Some(path) = shared.config.unix_path.clone() {
        #[cfg(unix)]
        {
            let _ = std::fs::remove_file(&path);
            let listener = UnixListener::bind(&path).map_err(Error::Io)?;
            listener.set_nonblocking(true).map_err(Error::Io)?;
            return Ok(Listener::Unix(listener));
        }
        #[cfg(not(unix))]
        {
            let _ = path;
            panic!("unix_path configured on a non-Unix target");
        }
    }

    let port = shared.config.port.unwrap_or(0);
    let addr = format!("{}:{port}", shared.config.address)
        .parse()
        .map_err(|_| Error::Io(io::Error::new(io::ErrorKind::InvalidInput, "invalid listen address")))?;
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None).map_err(Error::Io)?;
    socket.set_reuse_address(true).map_err(Error::Io)?;
    #[cfg(all(unix, not(target_os = "windows")))]
    let _ = socket.set_reuse_port(true);
    socket.bind(&addr.into()).map_err(Error::Io)?;
    socket.listen(1024).map_err(Error::Io)?;
    socket.set_nonblocking(true).map_err(Error::Io)?;
    Ok(Listener::Tcp(socket.into()))
}

fn accept_all<H: Handler>(shared: &Arc<Shared>, listener: &Listener, connections: &mut Slab<Arc<Entry<H>>>, registry: &mio::Registry) {
    loop {
        if let Some(max) = shared.config.max_connections {
            if shared.connection_count.load(Ordering::Acquire) >= max {
                return;
            }
        }

        let stream = match listener.accept() {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                warn!(target: "wsendpoint::nonblocking", "accept error: {e}");
                return;
            }
        };

        let fd = stream.as_raw_fd();
        let _ = stream.set_nonblocking(true);
        let conn = match Connection::new(stream, IoMode::Nonblocking) {
            Ok(c) => Arc::new(c),
            Err(e) => {
                warn!(target: "wsendpoint::nonblocking", "failed to prepare accepted socket: {e}");
                continue;
            }
        };

        let handshake_state = shared.handshake_pool.acquire();
        let entry = Arc::new(Entry { conn, fd, phase: Mutex::new(Some(Phase::Handshaking(handshake_state))) });
        let key = connections.insert(entry);
        shared.connection_count.fetch_add(1, Ordering::AcqRel);

        if registry.register(&mut SourceFd(&fd), token_for(key), Interest::READABLE).is_err() {
            connections.remove(key);
            shared.connection_count.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Closes any connection still `Handshaking` past its deadline. A silent
/// peer (one that opens a socket and never sends a byte) produces no
/// readiness event to recheck the deadline against, so this runs on every
/// `poll.poll` timeout tick rather than only when data arrives.
///
/// Uses `try_lock` rather than `lock`: an entry currently owned by a pool
/// worker is either mid-read (about to reach its own deadline check in
/// [`advance_handshake`]) or mid-close, and this reactor thread must never
/// block waiting on it. Skipping a contended entry for one sweep tick is
/// harmless; it's picked up again 250ms later.
fn sweep_expired_handshakes<H: Handler>(shared: &Arc<Shared>, connections: &mut Slab<Arc<Entry<H>>>, registry: &mio::Registry) {
    let deadline = match shared.config.handshake.timeout {
        Some(d) => d,
        None => return,
    };

    let mut expired = Vec::new();
    for (key, entry) in connections.iter() {
        let mut guard = match entry.phase.try_lock() {
            Ok(g) => g,
            Err(_) => continue,
        };
        let is_expired = matches!(&*guard, Some(Phase::Handshaking(state)) if state.started_at.elapsed() >= deadline);
        if is_expired {
            *guard = None;
            expired.push((key, entry.clone()));
        }
    }

    for (key, entry) in expired {
        debug!(target: "wsendpoint::nonblocking", "handshake timed out");
        let _ = registry.deregister(&mut SourceFd(&entry.fd));
        entry.conn.with_stream(|s| write_handshake_error_response(s, &Error::Timeout));
        entry.conn.close();
        connections.remove(key);
        shared.connection_count.fetch_sub(1, Ordering::AcqRel);
    }
}

fn pool_worker_loop<H: Handler>(
    rx: Arc<Mutex<mpsc::Receiver<Job<H>>>>,
    shared: Arc<Shared>,
    factory: HandlerFactory<H>,
    registry: mio::Registry,
    retire_tx: mpsc::Sender<usize>,
) {
    loop {
        let job = {
            let rx = rx.lock().expect("job queue mutex poisoned");
            rx.recv()
        };
        let Job { key, entry } = match job {
            Ok(j) => j,
            Err(_) => return,
        };

        match process_entry(&shared, &factory, &entry) {
            Outcome::Rearm => {
                let _ = registry.reregister(&mut SourceFd(&entry.fd), token_for(key), Interest::READABLE);
            }
            Outcome::Closed => {
                shared.connection_count.fetch_sub(1, Ordering::AcqRel);
                let _ = retire_tx.send(key);
            }
            // The sweep already took this entry's phase, closed it, removed
            // it from the slab and decremented the count; this job was
            // already queued when that happened. Nothing left to account for.
            Outcome::AlreadyGone => {}
        }
    }
}

enum Outcome {
    Rearm,
    Closed,
    AlreadyGone,
}

fn process_entry<H: Handler>(shared: &Arc<Shared>, factory: &HandlerFactory<H>, entry: &Arc<Entry<H>>) -> Outcome {
    let mut phase_guard = entry.phase.lock().expect("connection phase mutex poisoned");
    let phase = match phase_guard.take() {
        Some(p) => p,
        None => return Outcome::AlreadyGone,
    };

    match phase {
        Phase::Handshaking(state) => match advance_handshake(shared, factory, &entry.conn, state) {
            Ok(HandshakeStep::NeedMore(state)) => {
                *phase_guard = Some(Phase::Handshaking(state));
                Outcome::Rearm
            }
            // The handshake read already drained the socket to `WouldBlock`,
            // so any frame the client pipelined right after its upgrade
            // request (§8 scenario 7) is sitting in `reader`'s buffer with no
            // further readiness event coming for it. Drain it here, the same
            // way the blocking worker's read loop drains leftover bytes
            // before its first post-handshake `fill`, instead of rearming
            // and waiting on the peer to write again.
            Ok(HandshakeStep::Upgraded { mut handler, mut reader }) => match drain_active(&entry.conn, &mut reader, &mut handler) {
                DrainResult::Rearm => {
                    *phase_guard = Some(Phase::Active { handler, reader });
                    Outcome::Rearm
                }
                DrainResult::Closed => {
                    handler.close(&entry.conn);
                    entry.conn.close();
                    Outcome::Closed
                }
            },
            Err(e) => {
                debug!(target: "wsendpoint::nonblocking", "handshake failed: {e}");
                entry.conn.close();
                Outcome::Closed
            }
        },
        Phase::Active { mut handler, mut reader } => match drain_active(&entry.conn, &mut reader, &mut handler) {
            DrainResult::Rearm => {
                *phase_guard = Some(Phase::Active { handler, reader });
                Outcome::Rearm
            }
            DrainResult::Closed => {
                handler.close(&entry.conn);
                entry.conn.close();
                Outcome::Closed
            }
        },
    }
}

enum HandshakeStep<H: Handler> {
    NeedMore(HandshakeState),
    Upgraded { handler: H, reader: MessageReader },
}

fn advance_handshake<H: Handler>(shared: &Arc<Shared>, factory: &HandlerFactory<H>, conn: &Arc<Connection>, mut state: HandshakeState) -> Result<HandshakeStep<H>, Error> {
    let eof = conn.with_stream(|s| read_nonblocking(s, &mut state.buf))?;
    if state.buf.len() > shared.config.handshake.max_size {
        conn.with_stream(|s| write_handshake_error_response(s, &Error::RequestTooLarge));
        shared.handshake_pool.release(state);
        return Err(Error::RequestTooLarge);
    }

    let parse_result = crate::handshake::parse_request(&state.buf, shared.config.handshake.max_headers);
    let (parsed, consumed) = match parse_result {
        Ok(Some(result)) => result,
        Ok(None) => {
            if eof {
                shared.handshake_pool.release(state);
                return Err(Error::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed during handshake")));
            }
            if let Some(deadline) = shared.config.handshake.timeout {
                if state.started_at.elapsed() >= deadline {
                    conn.with_stream(|s| write_handshake_error_response(s, &Error::Timeout));
                    shared.handshake_pool.release(state);
                    return Err(Error::Timeout);
                }
            }
            return Ok(HandshakeStep::NeedMore(state));
        }
        Err(e) => {
            conn.with_stream(|s| write_handshake_error_response(s, &e));
            shared.handshake_pool.release(state);
            return Err(e);
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
                    let _ = std::io::Write::write_all(s, &response);
                }
                None => write_handshake_error_response(s, &e),
            });
            shared.handshake_pool.release(state);
            return Err(Error::HandshakeRejected);
        }
    };

    let response = crate::handshake::accept_response(&parsed.key, subprotocol.as_deref());
    conn.with_stream(|s| std::io::Write::write_all(s, &response)).map_err(Error::Io)?;
    handler.after_init(conn);

    let leftover = state.buf[consumed..].to_vec();
    shared.handshake_pool.release(state);

    let mut reader = MessageReader::new(shared.config.connection_buffer_size, shared.config.max_message_size, shared.buffer_provider.clone());
    if !leftover.is_empty() {
        let mut seed = io::Cursor::new(leftover);
        reader.fill(&mut seed)?;
    }

    Ok(HandshakeStep::Upgraded { handler, reader })
}

enum DrainResult {
    Rearm,
    Closed,
}

fn drain_active<H: Handler>(conn: &Arc<Connection>, reader: &mut MessageReader, handler: &mut H) -> DrainResult {
    let fill_result = conn.with_stream(|s| reader.fill(&mut NonblockingAdapter(s)));
    if let Err(e) = fill_result {
        if !e.is_quiet_transport_close() {
            warn!(target: "wsendpoint::nonblocking", "read error: {e}");
        }
        return DrainResult::Closed;
    }

    loop {
        let (has_more, event) = match reader.read() {
            Ok(r) => r,
            Err(e) => {
                let _ = conn.write_close_with_code(e.close_code(), b"");
                return DrainResult::Closed;
            }
        };

        if let Some(event) = event {
            let should_close = handler::dispatch(handler, conn, event).unwrap_or_else(|e| {
                warn!(target: "wsendpoint::nonblocking", "handler error: {e}");
                true
            });
            reader.done();
            if should_close {
                return DrainResult::Closed;
            }
        }

        if !has_more {
            return DrainResult::Rearm;
        }
    }
}

/// Reads until the nonblocking socket reports `WouldBlock`, matching
/// `MessageReader::fill`'s own loop but applied to the handshake's growable
/// `Vec<u8>` instead of the reader's static buffer. Returns `true` if the
/// peer closed its write half (a bare `WouldBlock` with nothing read is not
/// the same thing: the handshake just isn't finished arriving yet).
fn read_nonblocking(stream: &mut dyn Stream, buf: &mut Vec<u8>) -> Result<bool, Error> {
    loop {
        let mut chunk = [0u8; 4096];
        match stream.read(&mut chunk) {
            Ok(0) => return Ok(true),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io(e)),
        }
    }
}

struct NonblockingAdapter<'a>(&'a mut dyn Stream);
impl Read for NonblockingAdapter<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}
