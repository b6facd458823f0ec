//! The accept + readiness loop: owns the listening socket, the connection
//! registry, and the idle-ping scheduler. Grounded in the single-threaded
//! `mio::Poll` event loop idiom common across the Rust networking
//! ecosystem this crate's dependency stack belongs to (tungstenite itself
//! is sans-I/O and leaves the loop to its callers; this is that loop).

use crate::connection::{Connection, ConnectionHandler};
use crate::error::{Error, Result};
use log::{debug, error, trace};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const LISTENER: Token = Token(0);
const EVENTS_CAPACITY: usize = 1024;

/// Default listen port, matching the distilled spec's default.
pub const DEFAULT_PORT: u16 = 80;
/// Default idle-ping interval.
pub const DEFAULT_SILENCE_MAX: Duration = Duration::from_secs(20);
/// Default cap on a reassembled fragmented message, matching the scale
/// tungstenite itself defaults to for a single frame.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Where to listen: a bare port, or a socket the caller has already bound
/// (e.g. to pick up a `SO_REUSEPORT` listener from a supervisor).
pub enum ListenAddr {
    /// Bind a fresh listener on this port, all interfaces.
    Port(u16),
    /// Use an already-bound standard-library listener.
    Bound(StdTcpListener),
}

impl From<u16> for ListenAddr {
    fn from(port: u16) -> Self {
        ListenAddr::Port(port)
    }
}

impl From<StdTcpListener> for ListenAddr {
    fn from(listener: StdTcpListener) -> Self {
        ListenAddr::Bound(listener)
    }
}

/// Typed configuration surface, replacing the distilled spec's bag of
/// untyped `{listen, silence_max, on_connect}` options (SPEC_FULL.md §4.6).
pub struct ServerBuilder {
    listen: ListenAddr,
    silence_max: Duration,
    max_message_size: usize,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self {
            listen: ListenAddr::Port(DEFAULT_PORT),
            silence_max: DEFAULT_SILENCE_MAX,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl ServerBuilder {
    /// Start from the defaults: port 80, 20s silence max, 64 MiB messages.
    pub fn new() -> Self {
        Self::default()
    }

    /// Where to listen: a port number or a pre-bound acceptor.
    pub fn listen(mut self, addr: impl Into<ListenAddr>) -> Self {
        self.listen = addr.into();
        self
    }

    /// Seconds of allowed silence per connection before an idle ping is
    /// sent. Zero disables idle pings entirely.
    pub fn silence_max(mut self, silence_max: Duration) -> Self {
        self.silence_max = silence_max;
        self
    }

    /// Cap on a reassembled fragmented message before closing with 1009.
    pub fn max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Bind the listener and construct the `mio::Poll` registry. Fails
    /// fast with `Error::Config`/`Error::Io` before any connection is ever
    /// accepted.
    pub fn build(self) -> Result<Server> {
        if self.max_message_size == 0 {
            return Err(Error::Config("max_message_size must be non-zero".into()));
        }

        let std_listener = match self.listen {
            ListenAddr::Port(port) => {
                StdTcpListener::bind(("0.0.0.0", port)).map_err(Error::Io)?
            }
            ListenAddr::Bound(listener) => listener,
        };
        std_listener.set_nonblocking(true).map_err(Error::Io)?;
        let mut listener = TcpListener::from_std(std_listener);

        let poll = Poll::new().map_err(Error::Io)?;
        poll.registry().register(&mut listener, LISTENER, Interest::READABLE).map_err(Error::Io)?;

        let now = Instant::now();
        let silence_check_interval = self.silence_max / 2;
        Ok(Server {
            poll,
            listener: Some(listener),
            conns: HashMap::new(),
            next_token: LISTENER.0 + 1,
            silence_max: self.silence_max,
            silence_check_interval,
            silence_next_check: now + silence_check_interval,
            max_message_size: self.max_message_size,
            shutdown_requested: Arc::new(AtomicBool::new(false)),
        })
    }
}

struct ConnMeta {
    conn: Connection,
    last_recv: Instant,
}

/// A cheap, cloneable capability to request shutdown from inside a
/// [`ConnectionHandler`] callback, without needing a borrow of the `Server`
/// itself (which the loop is already borrowing for the duration of
/// `start()`). Obtain one with [`Server::shutdown_handle`] before calling
/// `start()` and capture it in the handler factory closure — the common
/// case is a handler that requests shutdown from `on_disconnect`. Backed by
/// an `Arc`/`AtomicBool` rather than `Rc`/`Cell` so it can be carried across
/// a thread boundary if `start()` is run on its own thread, not just
/// invoked from inside a callback on the loop's own thread.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    /// Ask the loop to shut down. Checked once per readiness tick; takes
    /// effect the next time `start()`'s loop wakes up. Idempotent.
    pub fn request(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Owns the listening socket, the connection registry, and drives the
/// readiness loop. See SPEC_FULL.md §4.1 for the algorithm this implements.
pub struct Server {
    poll: Poll,
    listener: Option<TcpListener>,
    conns: HashMap<Token, ConnMeta>,
    next_token: usize,
    silence_max: Duration,
    silence_check_interval: Duration,
    silence_next_check: Instant,
    max_message_size: usize,
    shutdown_requested: Arc<AtomicBool>,
}

impl Server {
    /// Convenience constructor equivalent to
    /// `ServerBuilder::new().listen(addr).build()`.
    pub fn bind(addr: impl Into<ListenAddr>) -> Result<Server> {
        ServerBuilder::new().listen(addr).build()
    }

    /// A cloneable handle that can request shutdown from within a callback.
    /// Call this before `start()` and move the handle into the handler
    /// factory closure.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown_requested.clone())
    }

    /// The connection tokens currently registered (iteration order
    /// unspecified).
    pub fn connections(&self) -> impl Iterator<Item = Token> + '_ {
        self.conns.keys().copied()
    }

    /// Low-level teardown: deregister and drop the socket without firing
    /// `on_disconnect`. Intended to be called after a `Connection` has
    /// already fired its own disconnect callback; `start()`'s sweep uses
    /// this internally, but it's exposed for callers managing their own
    /// cleanup (e.g. after observing `connections()`).
    pub fn disconnect(&mut self, token: Token) {
        if let Some(mut meta) = self.conns.remove(&token) {
            let _ = self.poll.registry().deregister(meta.conn.io_mut());
        }
    }

    /// Remove the listener from the readiness set, close it, and ask every
    /// connection to close with 1001 (Going Away). Idempotent. The loop
    /// exits once the last connection closes. Called directly when the
    /// caller already holds `&mut Server`; from inside a callback, use
    /// [`ShutdownHandle::request`] instead (see [`Server::shutdown_handle`]).
    pub fn shutdown(&mut self) {
        if let Some(mut listener) = self.listener.take() {
            let _ = self.poll.registry().deregister(&mut listener);
            debug!("listener removed from readiness set; draining connections");
        }
        let tokens: Vec<Token> = self.conns.keys().copied().collect();
        for token in tokens {
            if let Some(meta) = self.conns.get_mut(&token) {
                meta.conn.disconnect(1001, "server shutting down");
            }
        }
    }

    /// Run the loop until `shutdown()` has been called and every
    /// connection has finished closing. `handler_factory` is invoked once
    /// per accepted connection with its peer address, producing the
    /// handler that owns that connection's events for its lifetime.
    pub fn start(
        &mut self,
        mut handler_factory: impl FnMut(SocketAddr) -> Box<dyn ConnectionHandler>,
    ) -> Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        loop {
            let timeout = self.next_timeout();
            match self.poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
            let now = Instant::now();

            let mut listener_ready = false;
            let mut ready: Vec<(Token, bool, bool)> = Vec::new();
            for event in events.iter() {
                if event.token() == LISTENER {
                    listener_ready = true;
                } else {
                    ready.push((event.token(), event.is_readable(), event.is_writable()));
                }
            }
            if listener_ready {
                self.accept_ready(&mut handler_factory)?;
            }
            for (token, readable, writable) in ready {
                self.service(token, readable, writable, now);
            }

            if self.silence_max > Duration::ZERO && now >= self.silence_next_check {
                self.send_idle_pings(now);
            }

            if self.shutdown_requested.load(Ordering::Relaxed) {
                self.shutdown();
            }

            self.sweep_closed();

            if self.listener.is_none() && self.conns.is_empty() {
                break;
            }
        }
        Ok(())
    }

    fn next_timeout(&self) -> Option<Duration> {
        if self.silence_max.is_zero() {
            return None;
        }
        Some(self.silence_next_check.saturating_duration_since(Instant::now()))
    }

    fn accept_ready(
        &mut self,
        handler_factory: &mut impl FnMut(SocketAddr) -> Box<dyn ConnectionHandler>,
    ) -> Result<()> {
        loop {
            let Some(listener) = self.listener.as_ref() else { return Ok(()) };
            match listener.accept() {
                Ok((mut stream, addr)) => {
                    let token = self.allocate_token();
                    if let Err(e) =
                        self.poll.registry().register(&mut stream, token, Interest::READABLE)
                    {
                        error!("failed to register accepted socket: {e}");
                        continue;
                    }
                    let handler = handler_factory(addr);
                    let conn = Connection::new(stream, token, handler, self.max_message_size);
                    trace!("accepted {addr} as {token:?}");
                    self.conns.insert(token, ConnMeta { conn, last_recv: Instant::now() });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    fn allocate_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn service(&mut self, token: Token, readable: bool, writable: bool, now: Instant) {
        let Some(meta) = self.conns.get_mut(&token) else { return };
        if readable {
            meta.last_recv = now;
            if let Err(err) = meta.conn.recv() {
                error!("connection {token:?} errored on read: {err}");
            }
        }
        if writable && !meta.conn.is_closed() {
            if let Err(err) = meta.conn.writable() {
                error!("connection {token:?} errored on write: {err}");
            }
        }
        self.update_interest(token);
    }

    fn send_idle_pings(&mut self, now: Instant) {
        let threshold = self.silence_next_check - self.silence_check_interval;
        let stale: Vec<Token> =
            self.conns.iter().filter(|(_, m)| m.last_recv < threshold).map(|(t, _)| *t).collect();
        for token in &stale {
            if let Some(meta) = self.conns.get_mut(token) {
                if let Err(err) = meta.conn.send_ping(Vec::new()) {
                    debug!("idle ping to {token:?} skipped: {err}");
                }
            }
            self.update_interest(*token);
        }
        self.silence_next_check = now + self.silence_check_interval;
    }

    fn update_interest(&mut self, token: Token) {
        let Some(meta) = self.conns.get_mut(&token) else { return };
        if meta.conn.is_closed() {
            return;
        }
        let interest =
            if meta.conn.wants_write() { Interest::READABLE | Interest::WRITABLE } else { Interest::READABLE };
        if let Err(e) = self.poll.registry().reregister(meta.conn.io_mut(), token, interest) {
            debug!("failed to reregister {token:?}: {e}");
        }
    }

    fn sweep_closed(&mut self) {
        let closed: Vec<Token> =
            self.conns.iter().filter(|(_, m)| m.conn.is_closed()).map(|(t, _)| *t).collect();
        for token in closed {
            self.disconnect(token);
        }
    }
}
