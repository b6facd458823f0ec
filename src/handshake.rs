//! HTTP/1.1 upgrade handshake: request parsing and the 101 response, per
//! RFC 6455 §4. Grounded in tungstenite's `handshake::server` module, but
//! collapsed to a single resumable `append`/`try_parse` pair since this
//! crate's connection state machine drives the byte accumulation itself
//! rather than delegating to a nested handshake machine.

use crate::error::{Error, ProtocolError, Result};
use data_encoding::BASE64;
use log::trace;
use sha1::{Digest, Sha1};
use std::fmt::Write as _;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const MAX_HEADERS: usize = 64;

/// The parsed client upgrade request, handed to `on_handshake` before the
/// 101 response is written.
#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    /// Request path, e.g. `/chat`.
    pub path: String,
    /// `Origin` header, if present.
    pub origin: Option<String>,
    /// Requested subprotocols, parsed from a comma-separated
    /// `Sec-WebSocket-Protocol` header.
    pub protocols: Vec<String>,
    key: String,
}

impl HandshakeRequest {
    /// The computed `Sec-WebSocket-Accept` value for this request's key.
    pub fn accept_key(&self) -> String {
        accept_key(&self.key)
    }
}

/// Compute `base64(SHA-1(key + GUID))` per RFC 6455 §4.2.2 item 5.4.
pub fn accept_key(client_key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(client_key.as_bytes());
    sha1.update(WS_GUID.as_bytes());
    BASE64.encode(&sha1.finalize())
}

/// Attempt to parse a complete HTTP request line + headers from the front of
/// `buf`. Returns `Ok(None)` if more bytes are needed.
///
/// On success, returns the number of bytes consumed (the request line and
/// headers, up to and including the terminating blank line) and the parsed
/// request. Bytes after that point (e.g. the start of a WebSocket frame sent
/// eagerly) are left in `buf` for the caller to re-feed to the frame parser.
pub fn try_parse(buf: &[u8]) -> Result<Option<(usize, HandshakeRequest)>> {
    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut header_storage);
    let size = match req.parse(buf)? {
        httparse::Status::Partial => return Ok(None),
        httparse::Status::Complete(size) => size,
    };

    if req.method != Some("GET") {
        return Err(ProtocolError::WrongHttpMethod.into());
    }
    // httparse represents "HTTP/1.1" as version 1; anything below that is 1.0 or earlier.
    if req.version != Some(1) {
        return Err(ProtocolError::WrongHttpVersion.into());
    }

    let header = |name: &str| -> Option<&str> {
        req.headers.iter().find(|h| h.name.eq_ignore_ascii_case(name)).and_then(|h| std::str::from_utf8(h.value).ok())
    };

    if !header("Connection").is_some_and(contains_token_ignore_case("upgrade")) {
        return Err(ProtocolError::MissingConnectionUpgrade.into());
    }
    if !header("Upgrade").is_some_and(|v| v.eq_ignore_ascii_case("websocket")) {
        return Err(ProtocolError::MissingUpgradeWebSocket.into());
    }
    if header("Sec-WebSocket-Version") != Some("13") {
        return Err(ProtocolError::MissingOrBadVersion.into());
    }
    let key = header("Sec-WebSocket-Key").ok_or(ProtocolError::MissingSecWebSocketKey)?.to_string();

    let origin = header("Origin").map(str::to_string);
    let protocols = header("Sec-WebSocket-Protocol")
        .map(|v| v.split(',').map(|p| p.trim().to_string()).filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();

    let path = req.path.unwrap_or("/").to_string();
    trace!("parsed handshake request for path {path:?}");

    Ok(Some((size, HandshakeRequest { path, origin, protocols, key })))
}

fn contains_token_ignore_case(token: &str) -> impl Fn(&str) -> bool + '_ {
    move |value: &str| value.split(',').any(|part| part.trim().eq_ignore_ascii_case(token))
}

/// Format the `101 Switching Protocols` response.
pub fn format_accept_response(request: &HandshakeRequest, subprotocol: Option<&str>) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n",
        request.accept_key()
    );
    if let Some(proto) = subprotocol {
        let _ = write!(out, "Sec-WebSocket-Protocol: {proto}\r\n");
    }
    out.push_str("\r\n");
    out.into_bytes()
}

/// Format a minimal `400 Bad Request` response for a rejected or malformed
/// handshake, sent before closing the TCP stream.
pub fn format_bad_request(reason: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 400 Bad Request\r\n\
         Connection: close\r\n\
         Content-Length: {}\r\n\
         \r\n\
         {}",
        reason.len(),
        reason
    )
    .into_bytes()
}

/// Map a parse/validation [`Error`] into the reason string used in the 400 body.
pub fn reject_reason(err: &Error) -> String {
    err.to_string()
}
