//! TLS client, connecting against webpki's bundled root store instead of a
//! pinned certificate. Like `echo_server_tls`, this builds directly on the
//! same public pieces `client::connect` uses internally rather than on
//! `connect` itself, since `connect` only knows how to open a plain TCP or
//! Unix socket.
//!
//! Run with `cargo run --example client_tls --features tls -- wss://host:port/`.

#![cfg(feature = "tls")]

use std::env;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use pki_types::ServerName;
use rand::RngCore;
use wsendpoint::connection::{Connection, IoMode};
use wsendpoint::frame::OpCode;
use wsendpoint::handshake;
use wsendpoint::message::MessageReader;
use wsendpoint::stream::tls::TlsClientStream;
use wsendpoint::stream::Stream;
use wsendpoint::{buffer::BufferProvider, buffer::BufferProviderConfig};

struct StreamRef<'a>(&'a mut dyn Stream);

impl io::Read for StreamRef<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

fn next_mask() -> [u8; 4] {
    let mut key = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

fn main() -> Result<(), wsendpoint::Error> {
    env_logger::init();

    let url_arg = env::args().nth(1).unwrap_or_else(|| "wss://127.0.0.1:9002/".to_string());
    let url = url::Url::parse(&url_arg)?;
    let host = url.host_str().ok_or(wsendpoint::Error::UrlNoHost)?.to_string();
    let port = url.port().unwrap_or(443);

    let root_store = rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(rustls::ClientConfig::builder().with_root_certificates(root_store).with_no_client_auth());
    let server_name = ServerName::try_from(host.clone()).map_err(|e| wsendpoint::Error::Io(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
    let tls_conn = rustls::ClientConnection::new(tls_config, server_name).map_err(|e| wsendpoint::Error::Io(io::Error::new(io::ErrorKind::Other, e)))?;

    let tcp = TcpStream::connect((host.as_str(), port)).map_err(wsendpoint::Error::Io)?;
    tcp.set_nodelay(true).map_err(wsendpoint::Error::Io)?;
    let tls_stream = TlsClientStream::new(tls_conn, tcp);
    let conn = Arc::new(Connection::new(Box::new(tls_stream), IoMode::Blocking)?);

    let request = handshake::build_request(&url, &[])?;
    conn.with_stream(|s| s.write_all(&request.bytes))?;

    let mut buf = Vec::new();
    let consumed = loop {
        let mut chunk = [0u8; 4096];
        let n = conn.with_stream(|s| s.read(&mut chunk))?;
        buf.extend_from_slice(&chunk[..n]);
        if let Some((_, consumed)) = handshake::parse_response(&buf, &request.key, handshake::DEFAULT_MAX_HEADERS)? {
            break consumed;
        }
        if n == 0 {
            return Err(wsendpoint::Error::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed during handshake")));
        }
    };
    println!("tls handshake complete with {host}:{port}");

    conn.write_framed(OpCode::Text, true, b"hello over tls", Some(next_mask()))?;

    let provider = Arc::new(BufferProvider::new(BufferProviderConfig { large_buffer_size: 64 << 10, large_buffer_count: 4, max_message_size: 64 << 10 }));
    let mut reader = MessageReader::new(4096, 64 << 10, provider);
    let leftover = buf[consumed..].to_vec();
    let mut seed = io::Cursor::new(leftover);
    reader.fill(&mut seed)?;

    loop {
        let (has_more, event) = reader.read()?;
        if let Some(wsendpoint::message::ReadEvent::Message(m)) = event {
            println!("received: {}", String::from_utf8_lossy(&m.payload));
            break;
        }
        if !has_more {
            conn.with_stream(|s| reader.fill(&mut StreamRef(s)))?;
        }
    }
    Ok(())
}
