//! Connects to a server, sends one text message, and prints whatever comes
//! back. Run with `cargo run --example client -- ws://127.0.0.1:9000`.

use std::env;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use wsendpoint::{ClientConfig, Connection, Error, Handler, MessageKind};

struct PrintOnce {
    sent: Arc<AtomicBool>,
}

impl Handler for PrintOnce {
    fn handle_message(&mut self, conn: &Connection, data: Vec<u8>, kind: MessageKind) -> Result<(), Error> {
        match kind {
            MessageKind::Text => println!("received: {}", String::from_utf8_lossy(&data)),
            MessageKind::Binary => println!("received {} binary bytes", data.len()),
        }
        conn.close();
        Ok(())
    }

    fn after_init(&mut self, conn: &Connection) {
        if self.sent.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = conn.write_text("hello from the client demo") {
            eprintln!("failed to send greeting: {e}");
        }
    }
}

fn main() -> Result<(), Error> {
    env_logger::init();

    let url = env::args().nth(1).unwrap_or_else(|| "ws://127.0.0.1:9000".to_string());
    let handler = PrintOnce { sent: Arc::new(AtomicBool::new(false)) };
    wsendpoint::connect(&url, ClientConfig::default(), handler)
}
