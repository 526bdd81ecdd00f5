//! Readiness-driven (nonblocking) worker example: logs every message it
//! receives instead of echoing it. Run with `cargo run --example
//! simple_server` on a unix target.

use std::sync::Arc;

use wsendpoint::{Connection, Error, Handler, MessageKind, Server, ServerConfig};

struct Logger;

impl Handler for Logger {
    fn handle_message(&mut self, conn: &Connection, data: Vec<u8>, kind: MessageKind) -> Result<(), Error> {
        println!("{} sent a {kind:?} message of {} bytes", conn.peer_addr(), data.len());
        Ok(())
    }

    fn after_init(&mut self, conn: &Connection) {
        println!("{} connected", conn.peer_addr());
    }

    fn close(&mut self, conn: &Connection) {
        println!("{} disconnected", conn.peer_addr());
    }
}

#[cfg(unix)]
fn main() -> Result<(), Error> {
    env_logger::init();

    let config = ServerConfig { port: Some(9001), ..ServerConfig::default() };
    let server = Server::new(config, Arc::new(|_handshake, _conn| Ok(Logger)));

    println!("nonblocking worker listening on 127.0.0.1:9001");
    server.run_nonblocking()
}

#[cfg(not(unix))]
fn main() {
    eprintln!("the readiness-driven worker is unix-only");
}
