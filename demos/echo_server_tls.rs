//! TLS echo server, exercising the pluggable-stream interface directly
//! instead of through `Server::run_blocking` (which only knows how to accept
//! plain TCP/Unix sockets itself). An application that wants TLS terminates
//! it in front of the library the same way this demo does: perform the
//! rustls handshake, wrap the result in `TlsServerStream`, then drive the
//! WebSocket handshake and read loop with the same public building blocks
//! `server.rs` uses internally.
//!
//! Needs `server.crt`/`server.key` (PEM) next to the working directory and
//! the `tls` feature: `cargo run --example echo_server_tls --features tls`.

#![cfg(feature = "tls")]

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::TcpListener;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use rustls_pemfile::{certs, private_key};
use wsendpoint::connection::{Connection, IoMode};
use wsendpoint::handler::{self, Handler};
use wsendpoint::handshake;
use wsendpoint::message::MessageReader;
use wsendpoint::stream::tls::TlsServerStream;
use wsendpoint::stream::Stream;
use wsendpoint::{buffer::BufferProvider, buffer::BufferProviderConfig, MessageKind};

/// `MessageReader::fill` is generic over `Read` and needs a sized type;
/// `dyn Stream` isn't one.
struct StreamRef<'a>(&'a mut dyn Stream);

impl io::Read for StreamRef<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

struct Echo;

impl Handler for Echo {
    fn handle_message(&mut self, conn: &Connection, data: Vec<u8>, kind: MessageKind) -> Result<(), wsendpoint::Error> {
        match kind {
            MessageKind::Text => conn.write_text(&String::from_utf8_lossy(&data)),
            MessageKind::Binary => conn.write_binary(&data),
        }
    }
}

fn load_server_config() -> io::Result<rustls::ServerConfig> {
    let cert_chain = certs(&mut BufReader::new(File::open(Path::new("server.crt"))?)).collect::<Result<Vec<_>, _>>()?;
    let key = private_key(&mut BufReader::new(File::open(Path::new("server.key"))?))?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no private key found in server.key"))?;
    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

fn serve_one(tls_config: Arc<rustls::ServerConfig>, tcp: std::net::TcpStream) -> Result<(), wsendpoint::Error> {
    let tls_conn = rustls::ServerConnection::new(tls_config).map_err(|e| wsendpoint::Error::Io(io::Error::new(io::ErrorKind::Other, e)))?;
    let tls_stream = TlsServerStream::new(tls_conn, tcp);
    let conn = Arc::new(Connection::new(Box::new(tls_stream), IoMode::Blocking)?);

    let mut buf = Vec::new();
    let (parsed, consumed) = loop {
        let mut chunk = [0u8; 4096];
        let n = conn.with_stream(|s| std::io::Read::read(s, &mut chunk))?;
        buf.extend_from_slice(&chunk[..n]);
        if let Some(result) = handshake::parse_request(&buf, handshake::DEFAULT_MAX_HEADERS)? {
            break result;
        }
        if n == 0 {
            return Err(wsendpoint::Error::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed during handshake")));
        }
    };

    let response = handshake::accept_response(&parsed.key, None);
    conn.with_stream(|s| s.write_all(&response)).map_err(wsendpoint::Error::Io)?;

    let mut handler = Echo;
    handler.after_init(&conn);

    let provider = Arc::new(BufferProvider::new(BufferProviderConfig { large_buffer_size: 64 << 10, large_buffer_count: 4, max_message_size: 64 << 10 }));
    let mut reader = MessageReader::new(4096, 64 << 10, provider);
    let leftover = buf[consumed..].to_vec();
    let mut seed = io::Cursor::new(leftover);
    reader.fill(&mut seed)?;

    loop {
        if conn.is_closed() {
            break;
        }
        let (has_more, event) = reader.read()?;
        if let Some(ev) = event {
            let should_close = handler::dispatch(&mut handler, &conn, ev).unwrap_or(true);
            reader.done();
            if should_close {
                break;
            }
        }
        if !has_more {
            conn.with_stream(|s| reader.fill(&mut StreamRef(s)))?;
        }
    }
    handler.close(&conn);
    Ok(())
}

fn main() -> io::Result<()> {
    env_logger::init();

    let tls_config = Arc::new(load_server_config()?);
    let listener = TcpListener::bind("127.0.0.1:9002")?;
    println!("tls echo server listening on 127.0.0.1:9002");

    for stream in listener.incoming() {
        let tcp = stream?;
        let tls_config = tls_config.clone();
        thread::spawn(move || {
            if let Err(e) = serve_one(tls_config, tcp) {
                eprintln!("tls connection ended: {e}");
            }
        });
    }
    Ok(())
}
