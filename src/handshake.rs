//! HTTP/1.1 Upgrade handshake: server-side request parsing and response
//! generation, client-side request generation and response parsing, and the
//! pooled per-accept handshake state.
//!
//! Request/response parsing is built on `httparse` rather than hand-rolled
//! line scanning. `httparse::Status::Partial` maps directly onto "need more
//! bytes, try again", which a line-at-a-time scanner has to reconstruct by
//! hand.

use base64::prelude::*;
use httparse::{Status, EMPTY_HEADER};
use rand::RngCore;
use sha1::{Digest, Sha1};
use std::sync::Mutex;
use std::time::Instant;
use url::Url;

use crate::error::Error;

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
pub const DEFAULT_MAX_HEADERS: usize = 32;

fn accept_key(client_key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(client_key.as_bytes());
    sha1.update(GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

// ---------------------------------------------------------------- server --

/// A parsed, validated upgrade request.
#[derive(Debug)]
pub struct ParsedRequest {
    pub path: String,
    pub key: String,
    pub subprotocols: Vec<String>,
}

/// Parses a complete HTTP/1.1 Upgrade request out of the front of `buf`.
///
/// Returns `Ok(None)` on a partial request; the caller should read more
/// bytes and retry. Validates `Upgrade`, `Connection` and
/// `Sec-WebSocket-Version`; records (but never acts on) `Sec-WebSocket-
/// Protocol` candidates for the caller to negotiate against.
pub fn parse_request(buf: &[u8], max_headers: usize) -> Result<Option<(ParsedRequest, usize)>, Error> {
    let mut raw_headers = vec![EMPTY_HEADER; max_headers];
    let mut req = httparse::Request::new(&mut raw_headers);
    let consumed = match req.parse(buf)? {
        Status::Partial => return Ok(None),
        Status::Complete(n) => n,
    };

    if req.method != Some("GET") {
        return Err(Error::InvalidRequestLine);
    }

    let mut host_ok = false;
    let mut upgrade_ok = false;
    let mut connection_ok = false;
    let mut version_ok = false;
    let mut key = None;
    let mut subprotocols = Vec::new();

    for h in req.headers.iter() {
        let name = h.name.to_ascii_lowercase();
        let value = std::str::from_utf8(h.value).map_err(|_| Error::InvalidHeader("non-UTF-8 header value"))?;
        match name.as_str() {
            "host" => host_ok = !value.trim().is_empty(),
            "upgrade" => upgrade_ok = value.eq_ignore_ascii_case("websocket"),
            "connection" => connection_ok = value.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("upgrade")),
            "sec-websocket-version" => version_ok = value.trim() == "13",
            "sec-websocket-key" => key = Some(value.trim().to_string()),
            "sec-websocket-protocol" => {
                subprotocols.extend(value.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()));
            }
            _ => {}
        }
    }

    if !host_ok {
        return Err(Error::MissingHeaders);
    }
    if !upgrade_ok {
        return Err(Error::InvalidUpgrade);
    }
    if !connection_ok {
        return Err(Error::InvalidConnection);
    }
    if !version_ok {
        return Err(Error::InvalidVersion);
    }
    let key = key.ok_or(Error::MissingHeaders)?;

    Ok(Some((ParsedRequest { path: req.path.unwrap_or("/").to_string(), key, subprotocols }, consumed)))
}

/// Builds the `101 Switching Protocols` response for an accepted request.
/// `protocol` is the server's chosen subprotocol, if any of the client's
/// candidates were acceptable.
pub fn accept_response(key: &str, protocol: Option<&str>) -> Vec<u8> {
    let accept = accept_key(key);
    let mut resp = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n"
    );
    if let Some(p) = protocol {
        resp.push_str(&format!("Sec-WebSocket-Protocol: {p}\r\n"));
    }
    resp.push_str("\r\n");
    resp.into_bytes()
}

/// Builds a plain rejection response (the handshake never upgraded).
pub fn reject_response(status_code: u16, reason: &str) -> Vec<u8> {
    format!("HTTP/1.1 {status_code} {reason}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n").into_bytes()
}

// ---------------------------------------------------------------- client --

pub struct ClientRequest {
    pub bytes: Vec<u8>,
    pub key: String,
}

/// Builds the client's GET Upgrade request for `url`.
pub fn build_request(url: &Url, subprotocols: &[String]) -> Result<ClientRequest, Error> {
    build_request_with_key(url, subprotocols, None)
}

/// Same as [`build_request`] but lets tests/benchmarks pin the
/// `Sec-WebSocket-Key` instead of generating a random one.
pub fn build_request_with_key(url: &Url, subprotocols: &[String], fixed_key: Option<&str>) -> Result<ClientRequest, Error> {
    if url.scheme() != "ws" && url.scheme() != "wss" {
        return Err(Error::InvalidSchemeUrl);
    }
    let host = url.host_str().ok_or(Error::UrlNoHost)?;
    let host_header = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    let path = match url.query() {
        Some(q) => format!("{}?{}", url.path(), q),
        None => url.path().to_string(),
    };

    let key = match fixed_key {
        Some(k) => k.to_string(),
        None => {
            let mut key_bytes = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut key_bytes);
            BASE64_STANDARD.encode(key_bytes)
        }
    };

    let mut req = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host_header}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n"
    );
    if !subprotocols.is_empty() {
        req.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", subprotocols.join(", ")));
    }
    req.push_str("\r\n");

    Ok(ClientRequest { bytes: req.into_bytes(), key })
}

/// Parses the server's handshake response. Returns the server's chosen
/// subprotocol (if any) and how many bytes of `buf` the response consumed;
/// any bytes past that belong to the first WebSocket frame already in
/// flight and must be handed to the frame reader, not discarded.
pub fn parse_response(buf: &[u8], expected_key: &str, max_headers: usize) -> Result<Option<(Option<String>, usize)>, Error> {
    let mut raw_headers = vec![EMPTY_HEADER; max_headers];
    let mut resp = httparse::Response::new(&mut raw_headers);
    let consumed = match resp.parse(buf)? {
        Status::Partial => return Ok(None),
        Status::Complete(n) => n,
    };

    if resp.code != Some(101) {
        return Err(Error::NotUpgraded);
    }

    let expected = accept_key(expected_key);
    let mut accept_ok = false;
    let mut protocol = None;
    for h in resp.headers.iter() {
        let name = h.name.to_ascii_lowercase();
        let value = std::str::from_utf8(h.value).unwrap_or("");
        match name.as_str() {
            "sec-websocket-accept" => accept_ok = value == expected,
            "sec-websocket-protocol" => protocol = Some(value.to_string()),
            _ => {}
        }
    }
    if !accept_ok {
        return Err(Error::InvalidWebsocketAcceptHeader);
    }

    Ok(Some((protocol, consumed)))
}

// ------------------------------------------------------- pooled accept state --

/// Growable header-parse buffer reused across accepts: acquired when a
/// connection starts its handshake, released on completion or failure.
/// `started_at` is stamped fresh on every [`HandshakePool::acquire`], not at
/// construction, so a long-pooled state doesn't look like it's already
/// overrun a freshly accepted connection's deadline.
pub struct HandshakeState {
    pub buf: Vec<u8>,
    pub started_at: Instant,
}

impl HandshakeState {
    fn new(initial_capacity: usize) -> Self {
        HandshakeState { buf: Vec::with_capacity(initial_capacity), started_at: Instant::now() }
    }

    fn reset(&mut self) {
        self.buf.clear();
    }
}

/// Mutex-guarded free list of [`HandshakeState`]; overflow beyond `count` is
/// allocated dynamically on `acquire` and simply dropped on `release` rather
/// than grown back into the pool.
pub struct HandshakePool {
    free: Mutex<Vec<HandshakeState>>,
    count: usize,
    initial_capacity: usize,
}

impl HandshakePool {
    pub fn new(count: usize, initial_capacity: usize) -> Self {
        let free = (0..count).map(|_| HandshakeState::new(initial_capacity)).collect();
        HandshakePool { free: Mutex::new(free), count, initial_capacity }
    }

    pub fn acquire(&self) -> HandshakeState {
        let mut free = self.free.lock().expect("handshake pool mutex poisoned");
        let mut state = free.pop().unwrap_or_else(|| HandshakeState::new(self.initial_capacity));
        state.started_at = Instant::now();
        state
    }

    pub fn release(&self, mut state: HandshakeState) {
        state.reset();
        let mut free = self.free.lock().expect("handshake pool mutex poisoned");
        if free.len() < self.count {
            free.push(state);
        }
    }
}
