//! Per-connection state and the framed write helpers every worker and the
//! client core send through.
//!
//! A single `Mutex<Box<dyn Stream>>` guards the transport for both reads and
//! writes. Holding it across a read could starve a concurrent writer
//! indefinitely on a quiet blocking socket, which is why the blocking worker
//! always configures a read timeout (see `ServerConfig`/`ClientConfig`):
//! `fill` then returns (treating the timeout like `WouldBlock`) at worst once
//! per timeout window, bounding how long a writer waits on the lock. This is
//! the resolution recorded for the concurrent-writes open question; see
//! DESIGN.md.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use log::{debug, trace};

use crate::error::Error;
use crate::frame::{encode_header, OpCode};
use crate::stream::{PeerAddr, Stream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    Blocking,
    Nonblocking,
}

/// Owns the transport and tracks close state. Safe to share across threads:
/// `write_*` methods may be called from the owning worker (replying to a
/// ping) or from application code holding a handle to the same connection.
pub struct Connection {
    stream: Mutex<Box<dyn Stream>>,
    closed: AtomicBool,
    io_mode: IoMode,
    peer: PeerAddr,
}

impl Connection {
    pub fn new(stream: Box<dyn Stream>, io_mode: IoMode) -> Result<Self, Error> {
        let peer = stream.peer_addr().map_err(Error::Io)?;
        if io_mode == IoMode::Nonblocking {
            stream.set_nonblocking(true).map_err(Error::Io)?;
        }
        Ok(Connection { stream: Mutex::new(stream), closed: AtomicBool::new(false), io_mode, peer })
    }

    pub fn peer_addr(&self) -> &PeerAddr {
        &self.peer
    }

    pub fn blocking(&self) -> bool {
        self.io_mode == IoMode::Blocking
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Runs `f` with exclusive access to the transport. The worker's read
    /// loop and every `write_*` helper below funnel through this.
    pub fn with_stream<R>(&self, f: impl FnOnce(&mut dyn Stream) -> R) -> R {
        let mut guard = self.stream.lock().expect("connection stream mutex poisoned");
        f(&mut **guard)
    }

    fn write_frame(&self, opcode: OpCode, fin: bool, payload: &[u8]) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        // Connections created by Client::connect are the masked side; servers
        // never mask. IoMode alone doesn't carry that distinction, so the
        // client core calls write_framed directly with its own mask key and
        // this path is only reached by server-side connections.
        self.write_framed(opcode, fin, payload, None)
    }

    /// Writes one frame, applying `mask` if the caller is the client side
    /// (servers always pass `None`).
    pub fn write_framed(&self, opcode: OpCode, fin: bool, payload: &[u8], mask: Option<[u8; 4]>) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let mut out = Vec::with_capacity(14 + payload.len());
        encode_header(opcode, fin, payload.len(), mask, &mut out);
        let start = out.len();
        out.extend_from_slice(payload);
        if let Some(m) = mask {
            crate::frame::apply_mask(&mut out[start..], m);
        }
        self.with_stream(|s| s.write_all(&out)).map_err(Error::Io)?;
        Ok(())
    }

    pub fn write_text(&self, text: &str) -> Result<(), Error> {
        self.write_frame(OpCode::Text, true, text.as_bytes())
    }

    pub fn write_binary(&self, data: &[u8]) -> Result<(), Error> {
        self.write_frame(OpCode::Binary, true, data)
    }

    pub fn write_ping(&self, payload: &[u8]) -> Result<(), Error> {
        self.write_frame(OpCode::Ping, true, payload)
    }

    pub fn write_pong(&self, payload: &[u8]) -> Result<(), Error> {
        self.write_frame(OpCode::Pong, true, payload)
    }

    pub fn write_close(&self) -> Result<(), Error> {
        self.write_close_with_code(crate::error::CloseCode::Normal, b"")
    }

    pub fn write_close_with_code(&self, code: crate::error::CloseCode, reason: &[u8]) -> Result<(), Error> {
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&(code as u16).to_be_bytes());
        payload.extend_from_slice(reason);
        self.write_frame(OpCode::Close, true, &payload)
    }

    /// Idempotent: the first caller actually shuts the socket down, every
    /// later caller observes `Closed` and does nothing further.
    pub fn close(&self) {
        if self.closed.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            let result = self.with_stream(|s| s.shutdown());
            match result {
                Ok(()) => trace!(target: "wsendpoint::connection", "closed {}", self.peer),
                Err(e) => debug!(target: "wsendpoint::connection", "shutdown error on close for {}: {e}", self.peer),
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
