//! A minimal, dependency-light WebSocket server core.
//!
//! This crate owns the TCP accept loop, the RFC 6455 opening handshake,
//! the wire frame codec, message fragmentation/reassembly, and a per-socket
//! idle-ping scheduler — and nothing else. Compression extensions,
//! subprotocol semantics, TLS termination, and application-level fan-out
//! (rooms, broadcast) are left to the caller; see [`ConnectionHandler`] for
//! the seam where that application logic plugs in.
//!
//! ```no_run
//! use kindlewire::{ConnectionHandler, Connection, HandshakeRequest, Server};
//!
//! struct Echo;
//!
//! impl ConnectionHandler for Echo {
//!     fn on_text(&mut self, conn: &mut Connection, text: &str) -> kindlewire::Result<()> {
//!         conn.send_text(text)
//!     }
//! }
//!
//! let mut server = Server::bind(8080u16)?;
//! server.start(|_addr| Box::new(Echo))?;
//! # Ok::<(), kindlewire::Error>(())
//! ```

#![deny(unused_must_use, unused_import_braces)]
#![warn(missing_docs)]

mod buffer;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod message;
pub mod server;

pub use connection::{ConnState, Connection, ConnectionHandler};
pub use error::{Error, ProtocolError, Result};
pub use handshake::HandshakeRequest;
pub use message::Message;
pub use server::{ListenAddr, Server, ServerBuilder};
