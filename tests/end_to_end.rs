//! End-to-end round trips over real TCP sockets: `Server::run_blocking`
//! against `client::connect`, and (on unix) `Server::run_nonblocking`
//! against the same client. No mocked transport here: `connection.rs`'s
//! and `handler.rs`'s unit tests already cover the in-process loopback
//! cases; this file exists to catch anything that only shows up once an
//! actual accept()/connect() pair and a real handshake are involved.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use wsendpoint::{ClientConfig, Connection, Error, Handler, MessageKind, Server, ServerConfig};

fn free_port() -> u16 {
    // ServerConfig takes a fixed port, not 0-for-ephemeral, so each test
    // claims its own out of a private range instead of racing on one port.
    static NEXT: AtomicU16 = AtomicU16::new(19_700);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

struct Echo;

impl Handler for Echo {
    fn handle_message(&mut self, conn: &Connection, data: Vec<u8>, kind: MessageKind) -> Result<(), Error> {
        match kind {
            MessageKind::Text => conn.write_text(&String::from_utf8_lossy(&data)),
            MessageKind::Binary => conn.write_binary(&data),
        }
    }
}

struct Capture {
    got: Arc<Mutex<Vec<String>>>,
    sent: AtomicBool,
}

impl Handler for Capture {
    fn handle_message(&mut self, conn: &Connection, data: Vec<u8>, _kind: MessageKind) -> Result<(), Error> {
        self.got.lock().unwrap().push(String::from_utf8_lossy(&data).into_owned());
        conn.close();
        Ok(())
    }

    fn after_init(&mut self, conn: &Connection) {
        if self.sent.swap(true, Ordering::AcqRel) {
            return;
        }
        conn.write_text("ping").unwrap();
    }
}

fn wait_for_port(port: u16) {
    for _ in 0..200 {
        if std::net::TcpStream::connect(("127.0.0.1", port)).is_ok() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("server on port {port} never came up");
}

#[test]
fn blocking_worker_echoes_a_text_message_round_trip() {
    let port = free_port();
    let config = ServerConfig { port: Some(port), ..ServerConfig::default() };
    let server = Arc::new(Server::new(config, Arc::new(|_hs, _conn| Ok(Echo))));

    let server_for_thread = server.clone();
    let server_thread = thread::spawn(move || server_for_thread.run_blocking());

    wait_for_port(port);

    let got = Arc::new(Mutex::new(Vec::new()));
    let handler = Capture { got: got.clone(), sent: AtomicBool::new(false) };
    let url = format!("ws://127.0.0.1:{port}");
    wsendpoint::connect(&url, ClientConfig::default(), handler).expect("client round trip");

    assert_eq!(*got.lock().unwrap(), vec!["ping".to_string()]);

    server.shutdown();
    server_thread.join().unwrap().expect("server thread");
}

#[test]
fn blocking_worker_tracks_and_releases_its_connection_count() {
    let port = free_port();
    let config = ServerConfig { port: Some(port), ..ServerConfig::default() };
    let server = Arc::new(Server::new(config, Arc::new(|_hs, _conn| Ok(Echo))));

    let server_for_thread = server.clone();
    let server_thread = thread::spawn(move || server_for_thread.run_blocking());
    wait_for_port(port);

    let got = Arc::new(Mutex::new(Vec::new()));
    let handler = Capture { got: got.clone(), sent: AtomicBool::new(false) };
    let url = format!("ws://127.0.0.1:{port}");
    wsendpoint::connect(&url, ClientConfig::default(), handler).expect("client round trip");

    // The client closed its side after one message; give the server's
    // worker thread a moment to notice and decrement the shared counter.
    for _ in 0..100 {
        if server.connection_count() == 0 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(server.connection_count(), 0);

    server.shutdown();
    server_thread.join().unwrap().expect("server thread");
}

#[cfg(unix)]
#[test]
fn nonblocking_worker_echoes_a_text_message_round_trip() {
    let port = free_port();
    let config = ServerConfig { port: Some(port), ..ServerConfig::default() };
    let server = Arc::new(Server::new(config, Arc::new(|_hs, _conn| Ok(Echo))));

    let server_for_thread = server.clone();
    let server_thread = thread::spawn(move || server_for_thread.run_nonblocking());

    wait_for_port(port);

    let got = Arc::new(Mutex::new(Vec::new()));
    let handler = Capture { got: got.clone(), sent: AtomicBool::new(false) };
    let url = format!("ws://127.0.0.1:{port}");
    wsendpoint::connect(&url, ClientConfig::default(), handler).expect("client round trip");

    assert_eq!(*got.lock().unwrap(), vec!["ping".to_string()]);

    server.shutdown();
    server_thread.join().unwrap().expect("server thread");
}

#[test]
fn server_replies_400_to_a_plain_http_request_with_no_upgrade_header() {
    use std::io::{Read, Write};

    let port = free_port();
    let config = ServerConfig { port: Some(port), ..ServerConfig::default() };
    let server = Arc::new(Server::new(config, Arc::new(|_hs, _conn| Ok(Echo))));

    let server_for_thread = server.clone();
    let server_thread = thread::spawn(move || server_for_thread.run_blocking());
    wait_for_port(port);

    let mut stream = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut buf = Vec::new();
    let _ = stream.read_to_end(&mut buf);
    // `parse_request` rejects a request missing `Upgrade: websocket` outright
    // (see handshake.rs); the worker still owes the peer a best-effort 400
    // naming the failure before closing, per the handshake error contract.
    let response = String::from_utf8_lossy(&buf);
    assert!(response.starts_with("HTTP/1.1 400 "), "expected a 400 reply, got: {response}");
    assert!(response.contains("Upgrade"), "expected the failure reason in the reply, got: {response}");

    server.shutdown();
    server_thread.join().unwrap().expect("server thread");
}

#[test]
fn blocking_worker_times_out_a_handshake_that_never_completes() {
    let port = free_port();
    let config = ServerConfig {
        port: Some(port),
        handshake: wsendpoint::HandshakeConfig { timeout: Some(Duration::from_millis(200)), ..ServerConfig::default().handshake },
        ..ServerConfig::default()
    };
    let server = Arc::new(Server::new(config, Arc::new(|_hs, _conn| Ok(Echo))));

    let server_for_thread = server.clone();
    let server_thread = thread::spawn(move || server_for_thread.run_blocking());
    wait_for_port(port);

    let mut stream = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
    // Send an incomplete request line and never finish it; the server must
    // give up once its handshake deadline elapses rather than hang forever.
    use std::io::{Read, Write};
    stream.write_all(b"GET / HTTP/1.1\r\n").unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut buf = Vec::new();
    let _ = stream.read_to_end(&mut buf);
    let response = String::from_utf8_lossy(&buf);
    assert!(response.starts_with("HTTP/1.1 400 "), "expected a 400 reply, got: {response}");
    assert!(response.contains("deadline"), "expected the timeout reason in the reply, got: {response}");

    server.shutdown();
    server_thread.join().unwrap().expect("server thread");
}

#[cfg(unix)]
#[test]
fn nonblocking_worker_times_out_a_handshake_that_never_completes() {
    let port = free_port();
    let config = ServerConfig {
        port: Some(port),
        handshake: wsendpoint::HandshakeConfig { timeout: Some(Duration::from_millis(200)), ..ServerConfig::default().handshake },
        ..ServerConfig::default()
    };
    let server = Arc::new(Server::new(config, Arc::new(|_hs, _conn| Ok(Echo))));

    let server_for_thread = server.clone();
    let server_thread = thread::spawn(move || server_for_thread.run_nonblocking());
    wait_for_port(port);

    let mut stream = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
    use std::io::{Read, Write};
    stream.write_all(b"GET / HTTP/1.1\r\n").unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut buf = Vec::new();
    let _ = stream.read_to_end(&mut buf);
    let response = String::from_utf8_lossy(&buf);
    assert!(response.starts_with("HTTP/1.1 400 "), "expected a 400 reply, got: {response}");
    assert!(response.contains("deadline"), "expected the timeout reason in the reply, got: {response}");

    server.shutdown();
    server_thread.join().unwrap().expect("server thread");
}
