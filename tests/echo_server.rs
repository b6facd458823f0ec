//! End-to-end scenarios driven over a real loopback socket: a `Server` runs
//! on a background thread, and a plain `std::net::TcpStream` plays the
//! client, hand-writing the handshake and frames exactly as a conforming
//! WebSocket client would. There's no WebSocket client dependency in this
//! crate (it's a server-only core), so the test client is built from raw
//! bytes the same way tungstenite's own `tests/handshake.rs` drives it.

use kindlewire::{Connection, ConnectionHandler, ListenAddr, ServerBuilder};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
const SAMPLE_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

fn spawn_server(
    factory: impl FnMut(SocketAddr) -> Box<dyn ConnectionHandler> + Send + 'static,
) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let mut server =
        ServerBuilder::new().listen(ListenAddr::Bound(listener)).silence_max(Duration::ZERO).build().unwrap();
    thread::spawn(move || {
        server.start(factory).unwrap();
    });
    // Give the loop thread a moment to enter poll() before the client connects.
    thread::sleep(Duration::from_millis(50));
    addr
}

fn spawn_server_with_max_message_size(
    max_message_size: usize,
    factory: impl FnMut(SocketAddr) -> Box<dyn ConnectionHandler> + Send + 'static,
) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let mut server = ServerBuilder::new()
        .listen(ListenAddr::Bound(listener))
        .silence_max(Duration::ZERO)
        .max_message_size(max_message_size)
        .build()
        .unwrap();
    thread::spawn(move || {
        server.start(factory).unwrap();
    });
    thread::sleep(Duration::from_millis(50));
    addr
}

fn client_handshake(stream: &mut TcpStream) -> String {
    let req = format!(
        "GET /chat HTTP/1.1\r\n\
         Host: localhost\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {SAMPLE_KEY}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    );
    stream.write_all(req.as_bytes()).unwrap();

    let mut resp = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = stream.read(&mut buf).unwrap();
        assert!(n > 0, "connection closed before handshake response arrived");
        resp.extend_from_slice(&buf[..n]);
        if resp.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    String::from_utf8(resp).unwrap()
}

fn write_client_frame(stream: &mut TcpStream, opcode: u8, payload: &[u8]) {
    write_client_frame_fin(stream, opcode, true, payload)
}

fn write_client_frame_fin(stream: &mut TcpStream, opcode: u8, fin: bool, payload: &[u8]) {
    let key = [0x12u8, 0x34, 0x56, 0x78];
    let mut frame = vec![(if fin { 0x80 } else { 0 }) | opcode];
    let len = payload.len();
    match len {
        0..=125 => frame.push(0x80 | len as u8),
        126..=65535 => {
            frame.push(0x80 | 126);
            frame.extend_from_slice(&(len as u16).to_be_bytes());
        }
        _ => {
            frame.push(0x80 | 127);
            frame.extend_from_slice(&(len as u64).to_be_bytes());
        }
    }
    frame.extend_from_slice(&key);
    frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i & 3]));
    stream.write_all(&frame).unwrap();
}

struct ServerFrame {
    opcode: u8,
    fin: bool,
    payload: Vec<u8>,
}

fn read_server_frame(stream: &mut TcpStream) -> ServerFrame {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).unwrap();
    let fin = header[0] & 0x80 != 0;
    let opcode = header[0] & 0x0F;
    let masked = header[1] & 0x80 != 0;
    assert!(!masked, "server must never mask its own frames");
    let len = match header[1] & 0x7F {
        126 => {
            let mut ext = [0u8; 2];
            stream.read_exact(&mut ext).unwrap();
            u16::from_be_bytes(ext) as usize
        }
        127 => {
            let mut ext = [0u8; 8];
            stream.read_exact(&mut ext).unwrap();
            u64::from_be_bytes(ext) as usize
        }
        small => small as usize,
    };
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).unwrap();
    ServerFrame { opcode, fin, payload }
}

const OP_CONTINUATION: u8 = 0;
const OP_TEXT: u8 = 1;
const OP_BINARY: u8 = 2;
const OP_CLOSE: u8 = 8;
const OP_PING: u8 = 9;
const OP_PONG: u8 = 10;

/// Echoes every event back as a formatted binary/text reply, matching the
/// literal end-to-end scenarios this crate is tested against.
struct EchoHandler;

impl ConnectionHandler for EchoHandler {
    fn on_ready(&mut self, conn: &mut Connection) -> kindlewire::Result<()> {
        conn.send_binary(b"ready".to_vec())
    }

    fn on_text(&mut self, conn: &mut Connection, text: &str) -> kindlewire::Result<()> {
        conn.send_text(format!("utf8({}) = {}", text.len(), text))
    }

    fn on_binary(&mut self, conn: &mut Connection, data: &[u8]) -> kindlewire::Result<()> {
        let mut reply = format!("binary({}) = ", data.len()).into_bytes();
        reply.extend_from_slice(data);
        conn.send_binary(reply)
    }

    fn on_pong(&mut self, conn: &mut Connection, payload: &[u8]) -> kindlewire::Result<()> {
        let text = String::from_utf8_lossy(payload);
        let mut reply = format!("pong({}) = ", payload.len()).into_bytes();
        reply.extend_from_slice(text.as_bytes());
        conn.send_binary(reply)
    }
}

#[test]
fn handshake_and_ready() {
    let addr = spawn_server(|_| Box::new(EchoHandler));
    let mut client = TcpStream::connect(addr).unwrap();
    let resp = client_handshake(&mut client);
    assert!(resp.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert!(resp.contains(&format!("Sec-WebSocket-Accept: {SAMPLE_ACCEPT}\r\n")));

    let frame = read_server_frame(&mut client);
    assert_eq!(frame.opcode, OP_BINARY);
    assert_eq!(frame.payload, b"ready");
}

#[test]
fn empty_text_message_is_echoed_with_length_prefix() {
    let addr = spawn_server(|_| Box::new(EchoHandler));
    let mut client = TcpStream::connect(addr).unwrap();
    client_handshake(&mut client);
    let _ready = read_server_frame(&mut client);

    write_client_frame(&mut client, OP_TEXT, b"");
    let frame = read_server_frame(&mut client);
    assert_eq!(frame.opcode, OP_TEXT);
    assert_eq!(frame.payload, b"utf8(0) = ");
}

#[test]
fn large_binary_message_round_trips_via_16bit_length() {
    let addr = spawn_server(|_| Box::new(EchoHandler));
    let mut client = TcpStream::connect(addr).unwrap();
    client_handshake(&mut client);
    let _ready = read_server_frame(&mut client);

    let payload = vec![b'a'; 32768];
    write_client_frame(&mut client, OP_BINARY, &payload);
    let frame = read_server_frame(&mut client);
    assert_eq!(frame.opcode, OP_BINARY);
    let mut expected = format!("binary({}) = ", payload.len()).into_bytes();
    expected.extend_from_slice(&payload);
    assert_eq!(frame.payload, expected);
}

#[test]
fn pong_fires_on_pong_and_is_echoed_as_binary() {
    let addr = spawn_server(|_| Box::new(EchoHandler));
    let mut client = TcpStream::connect(addr).unwrap();
    client_handshake(&mut client);
    let _ready = read_server_frame(&mut client);

    write_client_frame(&mut client, OP_PONG, b"simple");
    let frame = read_server_frame(&mut client);
    assert_eq!(frame.opcode, OP_BINARY);
    assert_eq!(frame.payload, b"pong(6) = simple");
}

#[test]
fn full_byte_range_binary_message_round_trips_verbatim() {
    let addr = spawn_server(|_| Box::new(EchoHandler));
    let mut client = TcpStream::connect(addr).unwrap();
    client_handshake(&mut client);
    let _ready = read_server_frame(&mut client);

    let payload: Vec<u8> = (0..=255u8).collect();
    write_client_frame(&mut client, OP_BINARY, &payload);
    let frame = read_server_frame(&mut client);
    assert_eq!(frame.opcode, OP_BINARY);
    let mut expected = format!("binary({}) = ", payload.len()).into_bytes();
    expected.extend_from_slice(&payload);
    assert_eq!(frame.payload, expected);
}

/// Reports the `on_disconnect` code/reason back to the test thread and asks
/// the server to shut down, exercising the documented "shutdown requested
/// from within a disconnect handler" path.
struct ShutdownOnDisconnect {
    shutdown: kindlewire::server::ShutdownHandle,
    report: mpsc::Sender<(Option<u16>, Option<String>)>,
}

impl ConnectionHandler for ShutdownOnDisconnect {
    fn on_disconnect(&mut self, _conn: &mut Connection, code: Option<u16>, reason: Option<&str>) {
        let _ = self.report.send((code, reason.map(str::to_string)));
        self.shutdown.request();
    }
}

#[test]
fn clean_close_with_code_fires_disconnect_and_shuts_down() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let mut server =
        ServerBuilder::new().listen(ListenAddr::Bound(listener)).silence_max(Duration::ZERO).build().unwrap();
    let shutdown = server.shutdown_handle();
    let (tx, rx) = mpsc::channel();

    let join = thread::spawn(move || {
        server
            .start(move |_| {
                Box::new(ShutdownOnDisconnect { shutdown: shutdown.clone(), report: tx.clone() })
                    as Box<dyn ConnectionHandler>
            })
            .unwrap();
    });
    thread::sleep(Duration::from_millis(50));

    let mut client = TcpStream::connect(addr).unwrap();
    client_handshake(&mut client);

    let reason = "test server shutdown cleanly";
    let mut payload = 4242u16.to_be_bytes().to_vec();
    payload.extend_from_slice(reason.as_bytes());
    write_client_frame(&mut client, OP_CLOSE, &payload);

    let (code, got_reason) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(code, Some(4242));
    assert_eq!(got_reason.as_deref(), Some(reason));

    // The server should have echoed a close frame before tearing down.
    let frame = read_server_frame(&mut client);
    assert_eq!(frame.opcode, OP_CLOSE);

    join.join().unwrap();
}

#[test]
fn disconnect_fires_exactly_once() {
    let count = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));

    struct CountingHandler(std::sync::Arc<std::sync::atomic::AtomicUsize>);
    impl ConnectionHandler for CountingHandler {
        fn on_disconnect(&mut self, _conn: &mut Connection, _code: Option<u16>, _reason: Option<&str>) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    let counter = count.clone();
    let addr = spawn_server(move |_| Box::new(CountingHandler(counter.clone())));
    let mut client = TcpStream::connect(addr).unwrap();
    client_handshake(&mut client);
    // No `on_ready` override here, so nothing more is written; drop straight to an abrupt close.
    drop(client);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[test]
fn ping_gets_an_automatic_pong_reply() {
    let addr = spawn_server(|_| Box::new(EchoHandler));
    let mut client = TcpStream::connect(addr).unwrap();
    client_handshake(&mut client);
    let _ready = read_server_frame(&mut client);

    write_client_frame(&mut client, OP_PING, b"hi");
    let frame = read_server_frame(&mut client);
    assert_eq!(frame.opcode, OP_PONG);
    assert_eq!(frame.payload, b"hi");
}

#[test]
fn unmasked_client_frame_is_rejected_with_protocol_error_close() {
    let addr = spawn_server(|_| Box::new(EchoHandler));
    let mut client = TcpStream::connect(addr).unwrap();
    client_handshake(&mut client);
    let _ready = read_server_frame(&mut client);

    // A compliant client always masks; send a raw unmasked text frame and
    // expect the server to fail the connection with a 1002 close.
    let raw = [0x81u8, 0x00];
    client.write_all(&raw).unwrap();

    let frame = read_server_frame(&mut client);
    assert_eq!(frame.opcode, OP_CLOSE);
    assert!(frame.fin);
    assert!(frame.payload.len() >= 2);
    let code = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
    assert_eq!(code, 1002);
}

#[test]
fn malformed_handshake_gets_400_response() {
    let addr = spawn_server(|_| Box::new(EchoHandler));
    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"GET / HTTP/1.0\r\n\r\n").unwrap();

    let mut resp = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = client.read(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        resp.extend_from_slice(&buf[..n]);
    }
    let resp = String::from_utf8(resp).unwrap();
    assert!(resp.starts_with("HTTP/1.1 400 Bad Request"));
}

#[test]
fn fragmented_message_over_the_cap_is_rejected_even_on_the_final_frame() {
    // Each individual frame here is well under `max_message_size`, so the
    // per-frame check in the frame parser never trips; only the reassembled
    // total (checked on every fragment, including the FIN one) catches this.
    let addr = spawn_server_with_max_message_size(1024, |_| Box::new(EchoHandler));
    let mut client = TcpStream::connect(addr).unwrap();
    client_handshake(&mut client);
    let _ready = read_server_frame(&mut client);

    write_client_frame_fin(&mut client, OP_BINARY, false, &vec![b'a'; 600]);
    write_client_frame_fin(&mut client, OP_CONTINUATION, true, &vec![b'b'; 600]);

    let frame = read_server_frame(&mut client);
    assert_eq!(frame.opcode, OP_CLOSE);
    assert!(frame.payload.len() >= 2);
    let code = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
    assert_eq!(code, 1009);
}
