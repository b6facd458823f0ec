//! WebSocket opcode and close code definitions (RFC 6455 §5.2, §7.4).

use crate::error::ProtocolError;
use std::fmt;

/// Operation codes as defined by RFC 6455.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum OpCode {
    /// Data frame opcodes: continuation, text, binary.
    Data(Data),
    /// Control frame opcodes: close, ping, pong.
    Control(Control),
}

/// Data frame opcodes.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Data {
    /// Continuation of a fragmented message.
    Continue,
    /// Complete (or first fragment of a) text message.
    Text,
    /// Complete (or first fragment of a) binary message.
    Binary,
}

/// Control frame opcodes.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Control {
    /// Close handshake frame.
    Close,
    /// Heartbeat ping.
    Ping,
    /// Heartbeat pong.
    Pong,
}

impl OpCode {
    /// Decode a raw 4-bit opcode nibble, rejecting anything RFC 6455 reserves.
    pub fn from_nibble(nibble: u8) -> Result<Self, ProtocolError> {
        Ok(match nibble {
            0 => OpCode::Data(Data::Continue),
            1 => OpCode::Data(Data::Text),
            2 => OpCode::Data(Data::Binary),
            8 => OpCode::Control(Control::Close),
            9 => OpCode::Control(Control::Ping),
            10 => OpCode::Control(Control::Pong),
            other => return Err(ProtocolError::InvalidOpcode(other)),
        })
    }

    /// Encode back to the 4-bit wire nibble.
    pub fn to_nibble(self) -> u8 {
        match self {
            OpCode::Data(Data::Continue) => 0,
            OpCode::Data(Data::Text) => 1,
            OpCode::Data(Data::Binary) => 2,
            OpCode::Control(Control::Close) => 8,
            OpCode::Control(Control::Ping) => 9,
            OpCode::Control(Control::Pong) => 10,
        }
    }

    /// True for ping/pong/close — frames that must never be fragmented.
    pub fn is_control(self) -> bool {
        matches!(self, OpCode::Control(_))
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpCode::Data(Data::Continue) => write!(f, "CONTINUE"),
            OpCode::Data(Data::Text) => write!(f, "TEXT"),
            OpCode::Data(Data::Binary) => write!(f, "BINARY"),
            OpCode::Control(Control::Close) => write!(f, "CLOSE"),
            OpCode::Control(Control::Ping) => write!(f, "PING"),
            OpCode::Control(Control::Pong) => write!(f, "PONG"),
        }
    }
}

/// A WebSocket close code, either a well-known reason or an opaque
/// application-defined value (3000–4999 per RFC 6455 §7.4.2).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CloseCode(pub u16);

impl CloseCode {
    /// 1000: normal, requested closure.
    pub const NORMAL: CloseCode = CloseCode(1000);
    /// 1001: endpoint ("server") going away, e.g. on shutdown.
    pub const GOING_AWAY: CloseCode = CloseCode(1001);
    /// 1002: a protocol error was detected.
    pub const PROTOCOL_ERROR: CloseCode = CloseCode(1002);
    /// 1007: payload data did not match the frame's type (bad UTF-8 in text).
    pub const INVALID_PAYLOAD: CloseCode = CloseCode(1007);
    /// 1009: message too big to process.
    pub const MESSAGE_TOO_BIG: CloseCode = CloseCode(1009);
    /// 1011: the server encountered an unexpected condition (callback failure).
    pub const INTERNAL_ERROR: CloseCode = CloseCode(1011);

    /// Whether this code is legal to find on the wire in an incoming close frame.
    ///
    /// Per RFC 6455 §7.4.1/§7.4.2: 1004, 1005, 1006, 1015, and anything below
    /// 1000 or in 1016..=2999 are reserved and must never appear on the wire;
    /// 3000..=4999 are free for applications/extensions.
    pub fn is_allowed_on_wire(self) -> bool {
        match self.0 {
            1000..=1003 | 1007..=1011 => true,
            3000..=4999 => true,
            _ => false,
        }
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        CloseCode(code)
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        code.0
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
