//! Error handling.

use std::io;

/// Result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Top level error type for the server core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Builder/configuration error, raised before any socket is touched.
    #[error("configuration error: {0}")]
    Config(String),
    /// Input-output error. Apart from `WouldBlock`, these are generally fatal
    /// for the connection they occurred on.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Protocol violation detected while parsing the handshake or a frame.
    #[error("WebSocket protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// A text frame (or reassembled fragmented message) was not valid UTF-8.
    #[error("invalid UTF-8 in text frame")]
    Utf8,
    /// The connection is no longer usable; the only meaningful action is to drop it.
    #[error("connection already closed")]
    AlreadyClosed,
}

impl From<httparse::Error> for Error {
    fn from(err: httparse::Error) -> Self {
        Error::Protocol(ProtocolError::Httparse(err))
    }
}

/// The specific kind of protocol violation encountered.
///
/// Each variant maps to a close code per RFC 6455 §7.4 via [`ProtocolError::close_code`].
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Request method was not `GET`.
    #[error("HTTP method must be GET")]
    WrongHttpMethod,
    /// Request used HTTP/1.0 or earlier.
    #[error("HTTP version must be 1.1 or higher")]
    WrongHttpVersion,
    /// `Connection: Upgrade` header missing.
    #[error("missing \"Connection: Upgrade\" header")]
    MissingConnectionUpgrade,
    /// `Upgrade: websocket` header missing.
    #[error("missing \"Upgrade: websocket\" header")]
    MissingUpgradeWebSocket,
    /// `Sec-WebSocket-Version: 13` header missing or mismatched.
    #[error("missing or unsupported Sec-WebSocket-Version header")]
    MissingOrBadVersion,
    /// `Sec-WebSocket-Key` header missing.
    #[error("missing Sec-WebSocket-Key header")]
    MissingSecWebSocketKey,
    /// Reserved bits were set without a negotiated extension.
    #[error("reserved bits are non-zero")]
    NonZeroReservedBits,
    /// A client sent a frame without the mandatory mask bit.
    #[error("received an unmasked frame from client")]
    UnmaskedFrameFromClient,
    /// A control frame (ping/pong/close) arrived fragmented.
    #[error("control frames must not be fragmented")]
    FragmentedControlFrame,
    /// A control frame payload exceeded 125 bytes.
    #[error("control frame payload must be 125 bytes or less")]
    ControlFrameTooBig,
    /// The 4-bit opcode did not map to a known frame type.
    #[error("invalid opcode: {0}")]
    InvalidOpcode(u8),
    /// A continuation frame arrived with no message in progress.
    #[error("continuation frame but nothing to continue")]
    UnexpectedContinuation,
    /// A new data frame arrived while a fragmented message was in progress.
    #[error("expected continuation frame, got a new data frame")]
    ExpectedContinuation,
    /// The close frame payload was a single byte (code requires 2+).
    #[error("invalid close frame payload")]
    InvalidCloseSequence,
    /// A reassembled or buffered message exceeded the configured cap.
    #[error("message exceeds configured maximum size")]
    MessageTooBig,
    /// `httparse` failed to parse the request line or headers.
    #[error("HTTP parse error: {0}")]
    Httparse(httparse::Error),
}

impl ProtocolError {
    /// The close code an endpoint should send when failing the connection
    /// for this reason, per RFC 6455 §7.4.1.
    pub fn close_code(&self) -> u16 {
        match self {
            ProtocolError::MessageTooBig => 1009,
            _ => 1002,
        }
    }
}
