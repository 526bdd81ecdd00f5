//! A WebSocket (RFC 6455) endpoint library: HTTP/1.1 Upgrade handshake,
//! frame and message assembly, and two interchangeable worker models for
//! driving connections.
//!
//! [`server::Server::run_blocking`] spawns one thread per accepted
//! connection; [`server::Server::run_nonblocking`] (unix-only) runs a single
//! `mio`-backed reactor over a bounded thread pool instead. Both share the
//! same [`handler::Handler`] trait, [`config::ServerConfig`], buffer
//! provider and handshake pool. An application writes one handler and picks
//! a worker per deployment, not per feature.
//!
//! [`client::connect`] drives the other side of the protocol: connect,
//! handshake, read loop, masked writes, on the calling thread.

pub mod buffer;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handler;
pub mod handshake;
pub mod message;
#[cfg(unix)]
pub mod nonblocking;
pub mod server;
pub mod stream;

pub use client::{connect, ClientConnection};
pub use config::{ClientConfig, HandshakeConfig, LargeBufferConfig, ServerConfig, ShutdownConfig, ThreadPoolConfig};
pub use connection::{Connection, IoMode};
pub use error::{CloseCode, Error};
pub use handler::{dispatch, CloseDisposition, Handler, Handshake};
pub use message::{Message, MessageKind};
pub use server::{HandlerFactory, Server};
pub use stream::{PeerAddr, Stream};
