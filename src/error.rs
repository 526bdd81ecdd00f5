use std::io;
use std::string::FromUtf8Error;
use thiserror::Error;
use url::ParseError;

/// Close code a protocol-level failure maps to, per the error taxonomy in RFC 6455 §7.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    Normal = 1000,
    ProtocolError = 1002,
    InvalidPayload = 1007,
    MessageTooBig = 1009,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] FromUtf8Error),

    #[error("malformed HTTP: {0}")]
    Http(#[from] httparse::Error),

    #[error("{0}")]
    UrlParse(#[from] ParseError),

    // -- handshake (server side) --
    #[error("invalid request line")]
    InvalidRequestLine,

    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),

    #[error("missing or invalid Upgrade header")]
    InvalidUpgrade,

    #[error("missing or invalid Connection header")]
    InvalidConnection,

    #[error("missing or unsupported Sec-WebSocket-Version (must be 13)")]
    InvalidVersion,

    #[error("one or more required handshake headers are missing")]
    MissingHeaders,

    #[error("request exceeded the configured size limit")]
    RequestTooLarge,

    #[error("handshake did not complete before the configured deadline")]
    Timeout,

    // -- handshake (client side) --
    #[error("invalid scheme in WebSocket URL, expected ws:// or wss://")]
    InvalidSchemeUrl,

    #[error("URL has no host")]
    UrlNoHost,

    #[error("server did not reply with HTTP/1.1 101")]
    NotUpgraded,

    #[error("Sec-WebSocket-Accept did not match the expected digest")]
    InvalidWebsocketAcceptHeader,

    // -- framing --
    #[error("reserved bit set without a negotiated extension")]
    ReservedFlags,

    #[error("control frame was fragmented or exceeded 125 bytes")]
    LargeControl,

    #[error("unknown or reserved opcode")]
    InvalidOpcode,

    // -- message assembly --
    #[error("invalid fragmentation sequence")]
    InvalidFragmentation,

    #[error("message exceeded the configured maximum size")]
    MessageTooLarge,

    #[error("invalid close frame payload")]
    InvalidCloseFrame,

    // -- buffer provider --
    #[error("requested buffer size exceeds max_message_size")]
    BufferRequestTooLarge,

    // -- misc --
    #[error("connection is already closed")]
    Closed,

    #[error("handler rejected the connection during init")]
    HandshakeRejected,
}

impl Error {
    /// Maps a protocol-level error to the close code the peer should be told about.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Error::MessageTooLarge => CloseCode::MessageTooBig,
            Error::InvalidUtf8(_) | Error::InvalidCloseFrame => CloseCode::InvalidPayload,
            _ => CloseCode::ProtocolError,
        }
    }

    /// True for the transport-teardown errors that should close silently at debug level.
    pub fn is_quiet_transport_close(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionAborted
            ),
            Error::Closed => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_map_to_1002() {
        assert_eq!(Error::ReservedFlags.close_code(), CloseCode::ProtocolError);
        assert_eq!(Error::InvalidOpcode.close_code(), CloseCode::ProtocolError);
    }

    #[test]
    fn oversize_maps_to_1009() {
        assert_eq!(Error::MessageTooLarge.close_code(), CloseCode::MessageTooBig);
    }

    #[test]
    fn utf8_maps_to_1007() {
        let bad = String::from_utf8(vec![0xff, 0xfe]).unwrap_err();
        assert_eq!(Error::InvalidUtf8(bad).close_code(), CloseCode::InvalidPayload);
    }
}
