//! Blocking worker echo server: every text/binary message is sent straight
//! back to its sender. Run with `cargo run --example echo_server`.

use std::sync::Arc;

use wsendpoint::{Connection, Error, Handler, MessageKind, Server, ServerConfig};

struct Echo;

impl Handler for Echo {
    fn handle_message(&mut self, conn: &Connection, data: Vec<u8>, kind: MessageKind) -> Result<(), Error> {
        match kind {
            MessageKind::Text => conn.write_text(&String::from_utf8_lossy(&data)),
            MessageKind::Binary => conn.write_binary(&data),
        }
    }
}

fn main() -> Result<(), Error> {
    env_logger::init();

    let config = ServerConfig { port: Some(9000), ..ServerConfig::default() };
    let server = Server::new(config, Arc::new(|_handshake, _conn| Ok(Echo)));

    println!("echo server listening on 127.0.0.1:9000");
    server.run_blocking()
}
