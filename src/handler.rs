//! The application-facing capability trait and the per-event dispatch logic
//! that both workers and the client's read loop funnel through.
//!
//! §9's "polymorphic handler with optional methods" note describes a
//! dynamically-typed source feature-detecting overridden methods once at
//! construction. In Rust that maps onto a capability trait with default
//! method bodies: an application overrides only the hooks it cares about,
//! and the default body *is* the library's canned behavior (echoing a pong,
//! ignoring an unsolicited pong, applying the close-code validation rules)
//! rather than a no-op a caller has to remember to replicate.

use crate::connection::Connection;
use crate::error::{CloseCode, Error};
use crate::message::{ControlFrame, MessageKind, ReadEvent};

/// What the connection looked like at handshake time, handed to the
/// handler factory alongside the live connection.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub path: String,
    pub subprotocol: Option<String>,
}

/// Returned by [`Handler::handle_close`] to say whether the override
/// consumed the close frame itself or wants the library's default
/// validation-and-reply behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDisposition {
    /// Apply the canonical code validation and canned reply.
    Default,
    /// The handler already replied (or chose not to); dispatch only closes.
    Handled,
}

/// The capability set a connection-bound application object may implement.
/// `handle_message` is the only method without a default; a handler that
/// does nothing on a data message isn't a handler. Every other hook falls
/// back to the protocol-mandated default behavior from §4.8.
pub trait Handler: Send + 'static {
    fn handle_message(&mut self, conn: &Connection, data: Vec<u8>, kind: MessageKind) -> Result<(), Error>;

    /// Called once, after the handler has been constructed and the upgrade
    /// response written, before the read loop starts.
    fn after_init(&mut self, _conn: &Connection) {}

    /// Default: echo the ping payload back as a pong (empty payload if the
    /// ping carried none).
    fn handle_ping(&mut self, conn: &Connection, data: &[u8]) -> Result<(), Error> {
        conn.write_pong(data)
    }

    /// Default: unsolicited pongs are ignored.
    fn handle_pong(&mut self, _conn: &Connection, _data: &[u8]) -> Result<(), Error> {
        Ok(())
    }

    /// Default: `CloseDisposition::Default` runs the code-validation rules
    /// in [`dispatch`] and replies accordingly. Override to inspect or
    /// reply to the close payload yourself; returning `Handled` skips the
    /// library's reply entirely (the connection still closes).
    fn handle_close(&mut self, _conn: &Connection, _data: &[u8]) -> Result<CloseDisposition, Error> {
        Ok(CloseDisposition::Default)
    }

    /// Called once the connection is torn down, regardless of cause.
    fn close(&mut self, _conn: &Connection) {}

    /// Custom HTTP reply when constructing the handler itself fails (e.g. an
    /// unacceptable path). No `&self` receiver: construction never produced
    /// a value, so this is looked up on the type, not an instance. `None`
    /// falls back to a generic `400 Bad Request`.
    fn handshake_error_response(_err: &Error) -> Option<Vec<u8>>
    where
        Self: Sized,
    {
        None
    }
}

/// Applies one read event to `handler`. Returns `true` if the connection
/// should be closed afterward (always true for a close frame, otherwise
/// only on a handler error).
pub fn dispatch(handler: &mut dyn Handler, conn: &Connection, event: ReadEvent) -> Result<bool, Error> {
    match event {
        ReadEvent::Message(m) => {
            handler.handle_message(conn, m.payload, m.kind)?;
            Ok(false)
        }
        ReadEvent::Control(ControlFrame::Ping(data)) => {
            handler.handle_ping(conn, &data)?;
            Ok(false)
        }
        ReadEvent::Control(ControlFrame::Pong(data)) => {
            handler.handle_pong(conn, &data)?;
            Ok(false)
        }
        ReadEvent::Control(ControlFrame::Close(data)) => {
            handle_close_frame(handler, conn, data)?;
            Ok(true)
        }
    }
}

fn handle_close_frame(handler: &mut dyn Handler, conn: &Connection, data: Vec<u8>) -> Result<(), Error> {
    if handler.handle_close(conn, &data)? == CloseDisposition::Handled {
        return Ok(());
    }
    validate_and_echo_close(conn, &data)
}

/// The §4.8 canned-reply ladder: empty payload, a lone length-1 byte,
/// an out-of-range or reserved code, or non-UTF-8 trailing reason text all
/// draw a 1002; anything else draws a 1000, never an echo of the peer's code.
fn validate_and_echo_close(conn: &Connection, data: &[u8]) -> Result<(), Error> {
    if data.is_empty() {
        return conn.write_close_with_code(CloseCode::Normal, b"");
    }
    if data.len() == 1 {
        return conn.write_close_with_code(CloseCode::ProtocolError, b"");
    }
    let code = u16::from_be_bytes([data[0], data[1]]);
    let reserved = matches!(code, 1004 | 1005 | 1006);
    let out_of_range = code < 1000 || (code > 1013 && code < 3000);
    if reserved || out_of_range {
        return conn.write_close_with_code(CloseCode::ProtocolError, b"");
    }
    if data.len() > 2 && std::str::from_utf8(&data[2..]).is_err() {
        return conn.write_close_with_code(CloseCode::ProtocolError, b"");
    }
    conn.write_close_with_code(CloseCode::Normal, b"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::IoMode;
    use crate::frame::{Frame, OpCode};
    use crate::stream::{PeerAddr, Stream};
    use std::io::{self, Read, Write};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct LoopbackStream {
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl Read for LoopbackStream {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }
    impl Write for LoopbackStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
    impl Stream for LoopbackStream {
        fn set_nonblocking(&self, _nonblocking: bool) -> io::Result<()> {
            Ok(())
        }
        fn set_read_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
            Ok(())
        }
        fn set_write_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
            Ok(())
        }
        fn peer_addr(&self) -> io::Result<PeerAddr> {
            Ok(PeerAddr::Unix)
        }
        fn shutdown(&self) -> io::Result<()> {
            Ok(())
        }
    }

    fn loopback() -> (Connection, Arc<Mutex<Vec<u8>>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let conn = Connection::new(Box::new(LoopbackStream { written: written.clone() }), IoMode::Blocking).unwrap();
        (conn, written)
    }

    struct EchoHandler {
        messages: Vec<(Vec<u8>, MessageKind)>,
    }

    impl Handler for EchoHandler {
        fn handle_message(&mut self, _conn: &Connection, data: Vec<u8>, kind: MessageKind) -> Result<(), Error> {
            self.messages.push((data, kind));
            Ok(())
        }
    }

    fn close_reply_code(written: &[u8]) -> u16 {
        let (frame, _) = Frame::decode(written).unwrap().unwrap();
        assert_eq!(frame.opcode, OpCode::Close);
        u16::from_be_bytes([frame.payload[0], frame.payload[1]])
    }

    #[test]
    fn default_ping_handler_echoes_payload_as_pong() {
        let (conn, written) = loopback();
        let mut h = EchoHandler { messages: Vec::new() };
        let closed = dispatch(&mut h, &conn, ReadEvent::Control(ControlFrame::Ping(b"hi".to_vec()))).unwrap();
        assert!(!closed);
        let (frame, _) = Frame::decode(&written.lock().unwrap()).unwrap().unwrap();
        assert_eq!(frame.opcode, OpCode::Pong);
        assert_eq!(frame.payload, b"hi");
    }

    #[test]
    fn default_pong_handler_is_a_no_op() {
        let (conn, written) = loopback();
        let mut h = EchoHandler { messages: Vec::new() };
        dispatch(&mut h, &conn, ReadEvent::Control(ControlFrame::Pong(b"hi".to_vec()))).unwrap();
        assert!(written.lock().unwrap().is_empty());
    }

    #[test]
    fn close_with_code_1000_is_echoed_as_1000() {
        let (conn, written) = loopback();
        let mut h = EchoHandler { messages: Vec::new() };
        let closed = dispatch(&mut h, &conn, ReadEvent::Control(ControlFrame::Close(1000u16.to_be_bytes().to_vec()))).unwrap();
        assert!(closed);
        assert_eq!(close_reply_code(&written.lock().unwrap()), 1000);
    }

    #[test]
    fn close_with_reserved_code_1004_is_a_protocol_error() {
        let (conn, written) = loopback();
        let mut h = EchoHandler { messages: Vec::new() };
        dispatch(&mut h, &conn, ReadEvent::Control(ControlFrame::Close(1004u16.to_be_bytes().to_vec()))).unwrap();
        assert_eq!(close_reply_code(&written.lock().unwrap()), 1002);
    }

    #[test]
    fn close_with_code_in_reserved_range_above_1013_is_a_protocol_error() {
        let (conn, written) = loopback();
        let mut h = EchoHandler { messages: Vec::new() };
        dispatch(&mut h, &conn, ReadEvent::Control(ControlFrame::Close(2000u16.to_be_bytes().to_vec()))).unwrap();
        assert_eq!(close_reply_code(&written.lock().unwrap()), 1002);
    }

    #[test]
    fn close_with_code_1014_inside_the_reserved_open_interval_is_a_protocol_error() {
        let (conn, written) = loopback();
        let mut h = EchoHandler { messages: Vec::new() };
        dispatch(&mut h, &conn, ReadEvent::Control(ControlFrame::Close(1014u16.to_be_bytes().to_vec()))).unwrap();
        assert_eq!(close_reply_code(&written.lock().unwrap()), 1002);
    }

    #[test]
    fn close_with_empty_payload_is_a_plain_normal_close() {
        let (conn, written) = loopback();
        let mut h = EchoHandler { messages: Vec::new() };
        dispatch(&mut h, &conn, ReadEvent::Control(ControlFrame::Close(Vec::new()))).unwrap();
        assert_eq!(close_reply_code(&written.lock().unwrap()), 1000);
    }

    #[test]
    fn close_with_a_single_byte_payload_is_a_protocol_error() {
        let (conn, written) = loopback();
        let mut h = EchoHandler { messages: Vec::new() };
        dispatch(&mut h, &conn, ReadEvent::Control(ControlFrame::Close(vec![0x03]))).unwrap();
        assert_eq!(close_reply_code(&written.lock().unwrap()), 1002);
    }

    #[test]
    fn close_with_non_utf8_reason_text_is_a_protocol_error() {
        let (conn, written) = loopback();
        let mut h = EchoHandler { messages: Vec::new() };
        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(&[0xff, 0xfe]);
        dispatch(&mut h, &conn, ReadEvent::Control(ControlFrame::Close(payload))).unwrap();
        assert_eq!(close_reply_code(&written.lock().unwrap()), 1002);
    }

    struct SilentCloseHandler;
    impl Handler for SilentCloseHandler {
        fn handle_message(&mut self, _conn: &Connection, _data: Vec<u8>, _kind: MessageKind) -> Result<(), Error> {
            Ok(())
        }
        fn handle_close(&mut self, _conn: &Connection, _data: &[u8]) -> Result<CloseDisposition, Error> {
            Ok(CloseDisposition::Handled)
        }
    }

    #[test]
    fn handler_owned_close_skips_the_library_reply() {
        let (conn, written) = loopback();
        let mut h = SilentCloseHandler;
        let closed = dispatch(&mut h, &conn, ReadEvent::Control(ControlFrame::Close(1000u16.to_be_bytes().to_vec()))).unwrap();
        assert!(closed);
        assert!(written.lock().unwrap().is_empty());
    }

    #[test]
    fn data_message_reaches_handle_message_with_its_kind() {
        let (conn, _) = loopback();
        let mut h = EchoHandler { messages: Vec::new() };
        dispatch(&mut h, &conn, ReadEvent::Message(crate::message::Message::text("hi"))).unwrap();
        assert_eq!(h.messages, vec![(b"hi".to_vec(), MessageKind::Text)]);
    }
}
