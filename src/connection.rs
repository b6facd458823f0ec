//! Per-socket state machine: TCP byte stream → HTTP upgrade handshake →
//! framed WebSocket session → close. Grounded in tungstenite's `protocol`
//! module (the `WebSocket<Stream>` read/write cycle) but collapsed into a
//! single owner of the socket, since this crate's connections are always
//! server-side and don't need tungstenite's client/server role generality.

use crate::buffer::IngressBuffer;
use crate::error::{Error, ProtocolError, Result};
use crate::frame::coding::{CloseCode, Control, Data, OpCode};
use crate::frame::{CloseFrame, Frame, FrameParser};
use crate::handshake::{self, HandshakeRequest};
use crate::message::{IncompleteMessage, Message, MessageKind};
use log::{debug, error, trace, warn};
use mio::net::TcpStream;
use mio::Token;
use std::io::{self, Read, Write};
use std::net::SocketAddr;

/// Where a connection sits in its lifecycle, per §4.2 of the design.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnState {
    /// Accumulating bytes for the HTTP upgrade request.
    AwaitingHandshake,
    /// Handshake complete; frames are being exchanged.
    Established,
    /// A close frame has been sent or echoed; draining outbound bytes.
    Closing,
    /// Fully torn down. No further callbacks will fire.
    Closed,
}

/// One entry point per connection event. All methods have a no-op default
/// so implementors only override what they need; the callback-map design of
/// the distilled spec is replaced by this single closed trait (see
/// SPEC_FULL.md §9).
///
/// Methods that can fail (everything except `on_disconnect`, which runs
/// during teardown) return [`Result`]; an `Err` is treated as an internal
/// failure specific to this connection and causes it to close with code
/// 1011, without affecting any other connection.
#[allow(unused_variables)]
pub trait ConnectionHandler {
    /// Fired after the client's upgrade request is parsed, before the 101
    /// response is written. The handler may call
    /// [`Connection::set_subprotocol`] or [`Connection::disconnect`] to
    /// reject the connection.
    fn on_handshake(&mut self, conn: &mut Connection, request: &HandshakeRequest) -> Result<()> {
        Ok(())
    }

    /// Fired once the 101 response has been flushed.
    fn on_ready(&mut self, conn: &mut Connection) -> Result<()> {
        Ok(())
    }

    /// Fired on a complete, UTF-8-validated text message.
    fn on_text(&mut self, conn: &mut Connection, text: &str) -> Result<()> {
        Ok(())
    }

    /// Fired on a complete binary message.
    fn on_binary(&mut self, conn: &mut Connection, data: &[u8]) -> Result<()> {
        Ok(())
    }

    /// Fired after the automatic pong reply has already been written.
    fn on_ping(&mut self, conn: &mut Connection, payload: &[u8]) -> Result<()> {
        Ok(())
    }

    /// Fired on receipt of a pong.
    fn on_pong(&mut self, conn: &mut Connection, payload: &[u8]) -> Result<()> {
        Ok(())
    }

    /// Fired exactly once per connection, during the transition to `Closed`.
    /// `code`/`reason` are `None` for abrupt (I/O-level) disconnects.
    fn on_disconnect(&mut self, conn: &mut Connection, code: Option<u16>, reason: Option<&str>) {}
}

/// A single accepted socket and its protocol state, owned by the `Server`
/// registry and handed to the user's [`ConnectionHandler`] as `conn`.
pub struct Connection {
    socket: TcpStream,
    token: Token,
    peer_addr: Option<SocketAddr>,
    state: ConnState,
    ingress: IngressBuffer,
    frame_parser: FrameParser,
    fragment: Option<IncompleteMessage>,
    outbound: Vec<u8>,
    subprotocol: Option<String>,
    max_message_size: usize,
    handler: Option<Box<dyn ConnectionHandler>>,
    disconnect_fired: bool,
}

impl Connection {
    /// Wrap a freshly accepted socket. Starts in `AwaitingHandshake`.
    pub fn new(
        socket: TcpStream,
        token: Token,
        handler: Box<dyn ConnectionHandler>,
        max_message_size: usize,
    ) -> Self {
        let peer_addr = socket.peer_addr().ok();
        Self {
            socket,
            token,
            peer_addr,
            state: ConnState::AwaitingHandshake,
            ingress: IngressBuffer::new(),
            frame_parser: FrameParser::new(),
            fragment: None,
            outbound: Vec::new(),
            subprotocol: None,
            max_message_size,
            handler: Some(handler),
            disconnect_fired: false,
        }
    }

    /// This connection's key in the server's registry.
    pub fn token(&self) -> Token {
        self.token
    }

    /// The remote address, if the socket could report one.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// The underlying socket, for the server's `mio::Registry` bookkeeping.
    /// Not part of the public connection-handling API.
    pub(crate) fn io_mut(&mut self) -> &mut TcpStream {
        &mut self.socket
    }

    /// Whether the connection has fully torn down and can be dropped.
    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    /// Whether there are buffered bytes waiting for a writable socket.
    /// The server registers/deregisters write-readiness interest based on
    /// this so blocked writes don't need to spin.
    pub fn wants_write(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Choose the subprotocol to echo back in the 101 response. Only
    /// meaningful when called from [`ConnectionHandler::on_handshake`].
    pub fn set_subprotocol(&mut self, protocol: impl Into<String>) {
        self.subprotocol = Some(protocol.into());
    }

    /// Send a complete text message.
    pub fn send_text(&mut self, text: impl AsRef<str>) -> Result<()> {
        self.send_frame(Frame::server_message(
            OpCode::Data(Data::Text),
            text.as_ref().as_bytes().to_vec(),
            true,
        ))
    }

    /// Send a complete binary message.
    pub fn send_binary(&mut self, data: impl Into<Vec<u8>>) -> Result<()> {
        self.send_frame(Frame::server_message(OpCode::Data(Data::Binary), data.into(), true))
    }

    /// Send an unsolicited ping. `payload` must be 125 bytes or fewer.
    pub fn send_ping(&mut self, payload: impl Into<Vec<u8>>) -> Result<()> {
        let payload = payload.into();
        if payload.len() > 125 {
            return Err(ProtocolError::ControlFrameTooBig.into());
        }
        self.send_frame(Frame::server_ping(payload))
    }

    /// Send a pong. `payload` must be 125 bytes or fewer.
    pub fn send_pong(&mut self, payload: impl Into<Vec<u8>>) -> Result<()> {
        let payload = payload.into();
        if payload.len() > 125 {
            return Err(ProtocolError::ControlFrameTooBig.into());
        }
        self.send_frame(Frame::server_pong(payload))
    }

    /// Initiate (or idempotently no-op on an already-closing/closed
    /// connection) a close with the given code and reason. Fires
    /// `on_disconnect` synchronously.
    pub fn disconnect(&mut self, code: u16, reason: impl Into<String>) {
        self.disconnect_with(Some(CloseFrame { code: CloseCode(code), reason: reason.into() }));
    }

    /// Flush whatever this connection still owes the socket. Called by the
    /// server on a writable-readiness event.
    pub fn writable(&mut self) -> Result<()> {
        self.try_flush().map_err(Error::Io)
    }

    /// Read whatever is available and drive the state machine as far as the
    /// buffered bytes allow. Loops over bounded `read()` calls (see
    /// [`crate::buffer::READ_CHUNK`]) until the socket reports `WouldBlock`:
    /// `mio`'s epoll backend is edge-triggered, so a single short read would
    /// leave bytes sitting in the kernel buffer with no further readiness
    /// event to notice them.
    ///
    /// While `Closing`, inbound bytes are no longer buffered into `ingress`
    /// at all — there's nothing left to parse, and a peer that keeps writing
    /// after the close frame would otherwise grow `ingress` without bound for
    /// the rest of the burst. The socket is still drained (to notice EOF or
    /// an error) with a small fixed-size scratch buffer instead.
    pub fn recv(&mut self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        loop {
            let read_result = if self.state == ConnState::Closing {
                self.discard_read()
            } else {
                self.ingress.read_from(&mut self.socket)
            };
            match read_result {
                Ok(0) => {
                    self.finalize_abrupt();
                    return Ok(());
                }
                Ok(_) => {
                    self.drive()?;
                    if self.is_closed() {
                        return Ok(());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.finalize_abrupt();
                    return Ok(());
                }
            }
        }
    }

    /// Read and discard up to one scratch-buffer's worth of bytes, used once
    /// `Closing` to keep noticing EOF/errors without buffering anything a
    /// peer sends after the close handshake has already begun.
    fn discard_read(&mut self) -> io::Result<usize> {
        let mut scratch = [0u8; 1024];
        self.socket.read(&mut scratch)
    }

    fn send_frame(&mut self, frame: Frame) -> Result<()> {
        if self.state != ConnState::Established {
            return Err(Error::AlreadyClosed);
        }
        let mut buf = Vec::new();
        frame.format(&mut buf);
        self.queue_write(&buf).map_err(Error::Io)
    }

    fn queue_write(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.outbound.is_empty() {
            match self.socket.write(bytes) {
                Ok(n) if n == bytes.len() => return Ok(()),
                Ok(n) => {
                    self.outbound.extend_from_slice(&bytes[n..]);
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.outbound.extend_from_slice(bytes);
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => return self.queue_write(bytes),
                Err(e) => return Err(e),
            }
        }
        self.outbound.extend_from_slice(bytes);
        self.try_flush()
    }

    fn try_flush(&mut self) -> io::Result<()> {
        while !self.outbound.is_empty() {
            match self.socket.write(&self.outbound) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "wrote zero bytes")),
                Ok(n) => {
                    self.outbound.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        if self.state == ConnState::Closing {
            self.state = ConnState::Closed;
        }
        Ok(())
    }

    /// Drive the handshake/frame parser over whatever is in `ingress` until
    /// it's exhausted or the connection stops being active.
    fn drive(&mut self) -> Result<()> {
        loop {
            match self.state {
                ConnState::AwaitingHandshake => match handshake::try_parse(self.ingress.as_slice())
                {
                    Ok(None) => return Ok(()),
                    Ok(Some((consumed, request))) => {
                        self.ingress.consume(consumed);
                        self.complete_handshake(request)?;
                    }
                    Err(err) => {
                        debug!("rejecting malformed handshake: {err}");
                        self.reject_handshake(&err.to_string());
                        return Ok(());
                    }
                },
                ConnState::Established => {
                    match self.frame_parser.feed(self.ingress.as_slice(), Some(self.max_message_size))
                    {
                        Ok((0, None)) => return Ok(()),
                        Ok((consumed, Some(frame))) => {
                            self.ingress.consume(consumed);
                            if let Err(err) = self.handle_frame(frame) {
                                self.fail(err);
                                return Ok(());
                            }
                        }
                        Ok((_, None)) => return Ok(()),
                        Err(err) => {
                            self.fail(err);
                            return Ok(());
                        }
                    }
                }
                ConnState::Closing | ConnState::Closed => return Ok(()),
            }
        }
    }

    fn complete_handshake(&mut self, request: HandshakeRequest) -> Result<()> {
        self.subprotocol = None;
        // A handler that wants to reject the connection calls `disconnect()`
        // itself (closes silently, matching the source's behavior); an `Err`
        // here means the callback malfunctioned and is handled like any
        // other callback failure, closing with 1011.
        if self.dispatch_fallible(|h, c| h.on_handshake(c, &request)).is_err() {
            return Ok(());
        }
        if self.state != ConnState::AwaitingHandshake {
            // The handler rejected the connection itself via `disconnect()`.
            return Ok(());
        }
        let response = handshake::format_accept_response(&request, self.subprotocol.as_deref());
        self.queue_write(&response).map_err(Error::Io)?;
        self.state = ConnState::Established;
        trace!("handshake complete for token {:?}", self.token);
        let _ = self.dispatch_fallible(|h, c| h.on_ready(c));
        Ok(())
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        match frame.opcode() {
            OpCode::Control(Control::Ping) => {
                let payload = frame.into_payload();
                self.send_pong(payload.clone())?;
                let _ = self.dispatch_fallible(|h, c| h.on_ping(c, &payload));
                Ok(())
            }
            OpCode::Control(Control::Pong) => {
                let payload = frame.into_payload();
                let _ = self.dispatch_fallible(|h, c| h.on_pong(c, &payload));
                Ok(())
            }
            OpCode::Control(Control::Close) => self.handle_close_frame(frame),
            OpCode::Data(Data::Continue) => self.handle_continuation(frame),
            OpCode::Data(kind) => self.handle_data_frame(kind, frame),
        }
    }

    fn handle_data_frame(&mut self, kind: Data, frame: Frame) -> Result<()> {
        if self.fragment.is_some() {
            return Err(ProtocolError::ExpectedContinuation.into());
        }
        let message_kind = match kind {
            Data::Text => MessageKind::Text,
            Data::Binary => MessageKind::Binary,
            Data::Continue => unreachable!("continuation handled separately"),
        };
        let fin = frame.is_final();
        let mut msg = IncompleteMessage::new(message_kind);
        msg.extend(frame.payload())?;
        self.check_message_size(&msg)?;
        if fin {
            self.deliver_message(msg.complete()?);
        } else {
            self.fragment = Some(msg);
        }
        Ok(())
    }

    fn handle_continuation(&mut self, frame: Frame) -> Result<()> {
        let mut msg = self.fragment.take().ok_or(ProtocolError::UnexpectedContinuation)?;
        let fin = frame.is_final();
        msg.extend(frame.payload())?;
        self.check_message_size(&msg)?;
        if fin {
            self.deliver_message(msg.complete()?);
        } else {
            self.fragment = Some(msg);
        }
        Ok(())
    }

    fn handle_close_frame(&mut self, frame: Frame) -> Result<()> {
        let close = frame.into_close()?;
        if let Some(ref c) = close {
            if !c.code.is_allowed_on_wire() {
                return Err(ProtocolError::InvalidCloseSequence.into());
            }
        }
        self.disconnect_with(close);
        Ok(())
    }

    fn check_message_size(&self, msg: &IncompleteMessage) -> Result<()> {
        if msg.len() > self.max_message_size {
            Err(ProtocolError::MessageTooBig.into())
        } else {
            Ok(())
        }
    }

    fn deliver_message(&mut self, msg: Message) {
        match msg {
            Message::Text(text) => {
                let _ = self.dispatch_fallible(|h, c| h.on_text(c, &text));
            }
            Message::Binary(data) => {
                let _ = self.dispatch_fallible(|h, c| h.on_binary(c, &data));
            }
        }
    }

    /// Map a parse/validation error to its close code and fail the
    /// connection, per RFC 6455 §7.4.1 (see [`ProtocolError::close_code`]).
    fn fail(&mut self, err: Error) {
        match &err {
            Error::Protocol(p) => {
                debug!("protocol error, closing: {err}");
                self.disconnect_with(Some(CloseFrame {
                    code: CloseCode(p.close_code()),
                    reason: err.to_string(),
                }));
            }
            Error::Utf8 => {
                debug!("invalid UTF-8 in text message, closing: {err}");
                self.disconnect_with(Some(CloseFrame {
                    code: CloseCode::INVALID_PAYLOAD,
                    reason: err.to_string(),
                }));
            }
            Error::Io(_) => self.finalize_abrupt(),
            Error::Config(_) | Error::AlreadyClosed => {
                warn!("unexpected internal error on connection: {err}");
            }
        }
    }

    /// Send (or echo) a close frame if established, then fire
    /// `on_disconnect`. Idempotent: a no-op once already closing/closed.
    fn disconnect_with(&mut self, close: Option<CloseFrame>) {
        if matches!(self.state, ConnState::Closing | ConnState::Closed) {
            return;
        }
        if self.state == ConnState::Established {
            let frame = Frame::server_close(close.clone());
            let mut buf = Vec::new();
            frame.format(&mut buf);
            if let Err(err) = self.queue_write(&buf) {
                debug!("failed writing close frame: {err}");
            }
        } else if self.state == ConnState::AwaitingHandshake {
            // No WebSocket session exists yet to send a close frame over;
            // a handler-initiated rejection gets an HTTP-level response
            // instead, same as a malformed request (see `reject_handshake`).
            if let Some(ref c) = close {
                let response = handshake::format_bad_request(&c.reason);
                if let Err(err) = self.queue_write(&response) {
                    debug!("failed writing handshake rejection: {err}");
                }
            }
        }
        self.state = if self.outbound.is_empty() { ConnState::Closed } else { ConnState::Closing };
        let (code, reason) = match close {
            Some(CloseFrame { code, reason }) => (Some(u16::from(code)), Some(reason)),
            None => (None, None),
        };
        self.fire_disconnect(code, reason.as_deref());
    }

    fn reject_handshake(&mut self, reason: &str) {
        let response = handshake::format_bad_request(reason);
        if let Err(err) = self.queue_write(&response) {
            debug!("failed writing handshake rejection: {err}");
        }
        self.finalize_abrupt();
    }

    fn finalize_abrupt(&mut self) {
        if self.state == ConnState::Closed {
            return;
        }
        self.state = ConnState::Closed;
        self.fire_disconnect(None, None);
    }

    fn fire_disconnect(&mut self, code: Option<u16>, reason: Option<&str>) {
        if self.disconnect_fired {
            return;
        }
        self.disconnect_fired = true;
        if let Some(mut handler) = self.handler.take() {
            handler.on_disconnect(self, code, reason);
            self.handler = Some(handler);
        }
    }

    /// Run a handler callback with the handler temporarily moved out (so it
    /// can be re-borrowed as `&mut Connection`), and fail the connection
    /// with 1011 if it returns an error.
    fn dispatch_fallible(
        &mut self,
        f: impl FnOnce(&mut dyn ConnectionHandler, &mut Connection) -> Result<()>,
    ) -> Result<()> {
        let Some(mut handler) = self.handler.take() else {
            return Ok(());
        };
        let result = f(handler.as_mut(), self);
        self.handler = Some(handler);
        if let Err(ref err) = result {
            error!("connection callback failed, closing: {err}");
            self.disconnect_with(Some(CloseFrame {
                code: CloseCode::INTERNAL_ERROR,
                reason: err.to_string(),
            }));
        }
        result
    }
}
