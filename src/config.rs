//! Plain, `Default`-backed configuration structs. No file or CLI loader is
//! implemented here (out of scope); these are the load target an external
//! loader would populate, keeping config shape separate from config
//! sourcing.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::buffer::BufferProvider;

#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Deadline for completing the Upgrade exchange. `None` means unbounded.
    pub timeout: Option<Duration>,
    /// Ceiling on the buffered request bytes before failing with `RequestTooLarge`.
    pub max_size: usize,
    pub max_headers: usize,
    /// Size of the pooled `HandshakeState` free list.
    pub pool_count: usize,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        HandshakeConfig { timeout: None, max_size: 1024, max_headers: 10, pool_count: 32 }
    }
}

#[derive(Debug, Clone)]
pub struct LargeBufferConfig {
    pub count: usize,
    pub size: usize,
}

#[derive(Debug, Clone)]
pub struct ThreadPoolConfig {
    pub count: usize,
    pub backlog: usize,
    pub buffer_size: usize,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        ThreadPoolConfig { count: 4, backlog: 500, buffer_size: 32768 }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ShutdownConfig {
    pub close_socket: bool,
    pub notify_client: bool,
    pub notify_handler: bool,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        ShutdownConfig { close_socket: true, notify_client: true, notify_handler: true }
    }
}

/// Where a server listens: a TCP address/port pair or a Unix-domain path.
/// `port`/`unix_path` are mutually exclusive, enforced at construction by
/// whichever code builds the listener, not by this struct.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: Option<u16>,
    pub address: String,
    pub unix_path: Option<PathBuf>,

    pub max_message_size: usize,
    /// Size of each connection's static reader buffer.
    pub connection_buffer_size: usize,

    pub handshake: HandshakeConfig,
    pub large_buffers: LargeBufferConfig,
    pub thread_pool: ThreadPoolConfig,
    pub shutdown: ShutdownConfig,

    /// Caps live connections for the nonblocking worker's accept loop
    /// (§4.7 "Admission"); `None` means unbounded. The blocking worker
    /// doesn't consult this: one thread per connection has no shared pool to
    /// protect.
    pub max_connections: Option<usize>,

    /// Subprotocol candidates the server is willing to negotiate, offered to
    /// `Handler::init` so it can pick one to echo back (see §4.4).
    pub subprotocols: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let max_message_size = 64 << 10;
        ServerConfig {
            port: Some(8080),
            address: "127.0.0.1".to_string(),
            unix_path: None,
            max_message_size,
            connection_buffer_size: 4096,
            handshake: HandshakeConfig::default(),
            large_buffers: LargeBufferConfig { count: 8, size: (max_message_size * 2).min(max_message_size) },
            thread_pool: ThreadPoolConfig::default(),
            shutdown: ShutdownConfig::default(),
            max_connections: None,
            subprotocols: Vec::new(),
        }
    }
}

/// A deterministic mask-key source, mainly for tests that need reproducible
/// wire bytes; production clients leave this `None` and get a random key per
/// frame from `rand`.
pub type MaskFn = Arc<dyn Fn() -> [u8; 4] + Send + Sync>;

#[derive(Clone)]
pub struct ClientConfig {
    pub max_size: usize,
    pub buffer_size: usize,
    pub mask_fn: Option<MaskFn>,
    /// When false (the default) the library answers ping/pong/close itself;
    /// set true to have the handler see and own that traffic instead.
    pub handle_ping: bool,
    pub handle_pong: bool,
    pub handle_close: bool,
    /// Share a buffer provider across multiple client connections instead of
    /// giving each its own pool.
    pub buffer_provider: Option<Arc<BufferProvider>>,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("max_size", &self.max_size)
            .field("buffer_size", &self.buffer_size)
            .field("mask_fn", &self.mask_fn.as_ref().map(|_| "<fn>"))
            .field("handle_ping", &self.handle_ping)
            .field("handle_pong", &self.handle_pong)
            .field("handle_close", &self.handle_close)
            .field("buffer_provider", &self.buffer_provider.as_ref().map(|_| "<shared>"))
            .finish()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            max_size: 64 << 10,
            buffer_size: 4096,
            mask_fn: None,
            handle_ping: false,
            handle_pong: false,
            handle_close: false,
            buffer_provider: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_defaults_match_the_documented_values() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.handshake.max_size, 1024);
        assert_eq!(cfg.handshake.max_headers, 10);
        assert_eq!(cfg.handshake.pool_count, 32);
        assert_eq!(cfg.large_buffers.count, 8);
        assert_eq!(cfg.thread_pool.backlog, 500);
        assert_eq!(cfg.thread_pool.buffer_size, 32768);
        assert!(cfg.shutdown.close_socket && cfg.shutdown.notify_client && cfg.shutdown.notify_handler);
    }

    #[test]
    fn client_config_defaults_to_library_handled_control_frames() {
        let cfg = ClientConfig::default();
        assert!(!cfg.handle_ping && !cfg.handle_pong && !cfg.handle_close);
        assert!(cfg.mask_fn.is_none());
    }
}
