//! [`NetBus`]: a non-blocking socket with its own frame parser.
//!
//! # How a poll works (for beginners)
//!
//! The device main loop calls [`NetBus::poll`] on every bus once per
//! iteration.  A poll never blocks:
//!
//! 1. Read at most one inbound unit (one `read` or one datagram).
//! 2. On the WebSocket bus, strip the envelope.  Pings are answered and a
//!    close frame drops the connection.
//! 3. With a [`Device`] attached, feed the bytes to this bus's private
//!    [`FrameParser`] and dispatch; frames the handlers queued are written
//!    straight back on this bus.  Without one the bytes are kept for
//!    [`NetBus::read_into`].

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use netlight_core::protocol::frame::{CHECKSUM_SIZE, HEADER_SIZE};
use netlight_core::{wrap, wrap_binary, FrameParser, Opcode, WsDeframer};
use tracing::{debug, info, trace, warn};

use super::{parse_ws_url, BusKind, TransportError};
use crate::app::Device;
use crate::dispatch::Extras;

const READ_SIZE: usize = 2048;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
/// `Sec-WebSocket-Accept` a conforming server derives from [`HANDSHAKE_KEY`].
const HANDSHAKE_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

enum Socket {
    Stream(TcpStream),
    Datagram(UdpSocket),
}

pub struct NetBus {
    kind: BusKind,
    label: String,
    socket: Option<Socket>,
    connected: bool,
    peer: Option<SocketAddr>,
    parser: FrameParser,
    deframer: WsDeframer,
    raw: Vec<u8>,
    read_buf: Box<[u8]>,
}

impl NetBus {
    /// The read buffer holds at least one maximum-size frame, so a datagram
    /// carrying a full frame is never truncated.
    pub fn new(kind: BusKind, label: impl Into<String>, parser: FrameParser) -> Self {
        let read_size = READ_SIZE.max(HEADER_SIZE + parser.max_payload() + CHECKSUM_SIZE);
        Self {
            kind,
            label: label.into(),
            socket: None,
            connected: false,
            peer: None,
            parser,
            deframer: WsDeframer::default(),
            raw: Vec::new(),
            read_buf: vec![0u8; read_size].into_boxed_slice(),
        }
    }

    pub fn kind(&self) -> BusKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Most recent datagram source; replies on a UDP bus go here.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn parser(&self) -> &FrameParser {
        &self.parser
    }

    /// Opens a TCP connection, performing the WebSocket upgrade on a
    /// [`BusKind::Ws`] bus.
    ///
    /// # Errors
    ///
    /// Resolution, connect, and handshake failures.  Calling this on a UDP
    /// bus returns [`TransportError::Unsupported`].
    pub fn connect(&mut self, host: &str, port: u16, path: &str) -> Result<(), TransportError> {
        if self.kind == BusKind::Udp {
            return Err(TransportError::Unsupported(self.kind));
        }
        self.disconnect();

        let target = format!("{host}:{port}");
        let addr = target
            .to_socket_addrs()
            .map_err(|_| TransportError::Resolve(target.clone()))?
            .next()
            .ok_or_else(|| TransportError::Resolve(target.clone()))?;
        let mut stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).map_err(
            |source: io::Error| TransportError::Connect {
                addr: target.clone(),
                source,
            },
        )?;
        stream.set_nodelay(true)?;

        if self.kind == BusKind::Ws {
            let leftover = handshake(&mut stream, host, port, path)?;
            self.deframer.push(&leftover);
        }

        stream.set_nonblocking(true)?;
        self.socket = Some(Socket::Stream(stream));
        self.connected = true;
        info!("[{}] connected to {target}{path}", self.label);
        Ok(())
    }

    /// Connects a WebSocket bus to `ws://host:port/path`.
    ///
    /// # Errors
    ///
    /// See [`connect`](Self::connect) and [`parse_ws_url`].
    pub fn connect_url(&mut self, url: &str) -> Result<(), TransportError> {
        let (host, port, path) = parse_ws_url(url)?;
        self.connect(&host, port, &path)
    }

    /// Binds a UDP bus on all interfaces with broadcast enabled.
    ///
    /// # Errors
    ///
    /// Bind failures.  Calling this on a stream bus returns
    /// [`TransportError::Unsupported`].
    pub fn bind(&mut self, port: u16) -> Result<(), TransportError> {
        if self.kind != BusKind::Udp {
            return Err(TransportError::Unsupported(self.kind));
        }
        self.disconnect();
        let socket = UdpSocket::bind(("0.0.0.0", port))?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        info!("[{}] listening on udp/{}", self.label, socket.local_addr()?.port());
        self.socket = Some(Socket::Datagram(socket));
        self.connected = true;
        Ok(())
    }

    /// Bound local address, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.socket.as_ref()? {
            Socket::Stream(s) => s.local_addr().ok(),
            Socket::Datagram(s) => s.local_addr().ok(),
        }
    }

    /// Drops the socket and every buffered byte.
    pub fn disconnect(&mut self) {
        if self.connected {
            info!("[{}] disconnected", self.label);
        }
        self.socket = None;
        self.connected = false;
        self.parser.clear();
        self.deframer.clear();
        self.raw.clear();
    }

    /// Reads at most one inbound unit and handles it.
    ///
    /// Returns the number of application bytes received, zero when nothing
    /// was ready or the bus is down.
    pub fn poll(&mut self, device: Option<&mut Device>, extras: Extras<'_>) -> usize {
        if !self.connected {
            return 0;
        }
        let Some(data) = self.read_unit() else {
            return 0;
        };
        if data.is_empty() {
            return 0;
        }

        match device {
            Some(device) => {
                let replies = device.handle_bytes(&self.label, &mut self.parser, &data, extras);
                for reply in replies {
                    self.write(&reply);
                }
            }
            None => self.raw.extend_from_slice(&data),
        }
        data.len()
    }

    /// Sends one protocol frame, wrapped for this transport.
    ///
    /// Returns `false` if nothing was sent.  A send error marks the bus
    /// disconnected.
    pub fn write(&mut self, frame: &[u8]) -> bool {
        if !self.connected {
            return false;
        }
        let result = match (&mut self.socket, self.kind) {
            (Some(Socket::Stream(stream)), BusKind::Ws) => write_blocking(stream, &wrap_binary(frame)),
            (Some(Socket::Stream(stream)), _) => write_blocking(stream, frame),
            (Some(Socket::Datagram(socket)), _) => match self.peer {
                Some(peer) => socket.send_to(frame, peer).map(|_| ()),
                None => {
                    debug!("[{}] no peer yet, {} byte(s) dropped", self.label, frame.len());
                    return false;
                }
            },
            (None, _) => return false,
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("[{}] send failed: {e}", self.label);
                self.disconnect();
                false
            }
        }
    }

    /// Sends a datagram to an explicit address.
    pub fn send_to(&mut self, frame: &[u8], addr: SocketAddr) -> bool {
        match &self.socket {
            Some(Socket::Datagram(socket)) if self.connected => match socket.send_to(frame, addr) {
                Ok(_) => true,
                Err(e) => {
                    warn!("[{}] send to {addr} failed: {e}", self.label);
                    false
                }
            },
            _ => false,
        }
    }

    /// Bytes waiting in the pass-through buffer.
    pub fn available(&self) -> usize {
        self.raw.len()
    }

    /// Moves up to `buf.len()` pass-through bytes into `buf`.
    pub fn read_into(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.raw.len());
        buf[..n].copy_from_slice(&self.raw[..n]);
        self.raw.drain(..n);
        n
    }

    /// Reads one unit.  `None` means nothing arrived or the bus went down.
    fn read_unit(&mut self) -> Option<Vec<u8>> {
        let result = match self.socket.as_mut()? {
            Socket::Stream(stream) => match stream.read(&mut self.read_buf) {
                Ok(0) => {
                    self.disconnect();
                    return None;
                }
                other => other,
            },
            Socket::Datagram(socket) => socket.recv_from(&mut self.read_buf).map(|(n, from)| {
                self.peer = Some(from);
                n
            }),
        };

        let n = match result {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return None,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return None,
            Err(e) => {
                warn!("[{}] receive failed: {e}", self.label);
                self.disconnect();
                return None;
            }
        };
        trace!("[{}] received {n} byte(s)", self.label);
        if self.kind == BusKind::Udp && n == self.read_buf.len() {
            warn!(
                "[{}] datagram filled the {n}-byte read buffer and may be truncated",
                self.label
            );
        }

        if self.kind == BusKind::Ws {
            self.deframer.push(&self.read_buf[..n]);
            return self.unwrap_messages();
        }
        Some(self.read_buf[..n].to_vec())
    }

    /// Drains complete envelope frames, answering control frames.
    fn unwrap_messages(&mut self) -> Option<Vec<u8>> {
        let mut data = Vec::new();
        loop {
            let message = match self.deframer.next_message() {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(e) => {
                    warn!("[{}] {e}", self.label);
                    self.disconnect();
                    return None;
                }
            };
            match message.opcode {
                op if op.is_data() => data.extend_from_slice(&message.payload),
                Opcode::Ping => {
                    if let Some(Socket::Stream(stream)) = self.socket.as_mut() {
                        if write_blocking(stream, &wrap(Opcode::Pong, &message.payload)).is_err() {
                            self.disconnect();
                            return None;
                        }
                    }
                }
                Opcode::Close => {
                    info!("[{}] peer closed the connection", self.label);
                    self.disconnect();
                    return None;
                }
                _ => {}
            }
        }
        Some(data)
    }
}

/// Writes all of `data` on a non-blocking stream.
fn write_blocking(stream: &mut TcpStream, data: &[u8]) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    let result = stream.write_all(data).and_then(|()| stream.flush());
    stream.set_nonblocking(true)?;
    result
}

/// Performs the client upgrade and returns any bytes read past the response.
fn handshake(
    stream: &mut TcpStream,
    host: &str,
    port: u16,
    path: &str,
) -> Result<Vec<u8>, TransportError> {
    let request = format!(
        "GET {path} HTTP/1.1\r\nHost: {host}:{port}\r\n\
         Upgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Key: {HANDSHAKE_KEY}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    );
    stream.set_read_timeout(Some(CONNECT_TIMEOUT))?;
    stream.write_all(request.as_bytes())?;

    let mut response = Vec::with_capacity(256);
    let mut chunk = [0u8; 512];
    let header_end = loop {
        if let Some(pos) = response.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if response.len() > 4096 {
            return Err(TransportError::Handshake("response header too long".into()));
        }
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(TransportError::Handshake("connection closed during upgrade".into()));
        }
        response.extend_from_slice(&chunk[..n]);
    };
    stream.set_read_timeout(None)?;

    let header = String::from_utf8_lossy(&response[..header_end]).into_owned();
    let mut lines = header.lines();
    let status_line = lines.next().unwrap_or_default().trim();
    if !status_line.starts_with("HTTP/1.1 101") {
        return Err(TransportError::Handshake(status_line.to_string()));
    }
    let accept = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("sec-websocket-accept"))
        .map(|(_, value)| value.trim());
    match accept {
        Some(HANDSHAKE_ACCEPT) => Ok(response.split_off(header_end)),
        Some(other) => Err(TransportError::Handshake(format!(
            "unexpected Sec-WebSocket-Accept {other}"
        ))),
        None => Err(TransportError::Handshake("missing Sec-WebSocket-Accept".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::test_app;
    use crate::dispatch::Dispatcher;
    use netlight_core::protocol::commands::{STREAM_FRAME, SYS_INFO_GET, SYS_INFO_RSP};
    use netlight_core::protocol::frame::{ADDR_BROADCAST, DEFAULT_MAX_PAYLOAD};
    use netlight_core::pack;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn udp_bus() -> NetBus {
        let mut bus = NetBus::new(BusKind::Udp, "udp", FrameParser::new());
        bus.bind(0).unwrap();
        bus
    }

    fn poll_until<F: FnMut(&mut NetBus) -> bool>(bus: &mut NetBus, mut done: F) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !done(bus) {
            assert!(Instant::now() < deadline, "timed out polling {}", bus.label());
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_poll_on_disconnected_bus_is_noop() {
        let mut bus = NetBus::new(BusKind::Tcp, "tcp", FrameParser::new());
        assert_eq!(bus.poll(None, Extras::default()), 0);
        assert!(!bus.write(b"x"));
    }

    #[test]
    fn test_udp_write_without_peer_is_dropped() {
        let mut bus = udp_bus();
        assert!(!bus.write(b"hello"));
        assert!(bus.is_connected());
    }

    #[test]
    fn test_udp_pass_through_buffer_and_reply_to_last_peer() {
        // Arrange
        let mut bus = udp_bus();
        let port = bus.local_addr().unwrap().port();
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        // Act
        client.send_to(b"raw bytes", ("127.0.0.1", port)).unwrap();
        poll_until(&mut bus, |b| b.poll(None, Extras::default()) > 0);
        let mut buf = [0u8; 4];
        let first = bus.read_into(&mut buf);
        let remaining = bus.available();
        assert!(bus.write(b"pong"));
        let mut reply = [0u8; 16];
        let (n, _) = client.recv_from(&mut reply).unwrap();

        // Assert
        assert_eq!(first, 4);
        assert_eq!(&buf, b"raw ");
        assert_eq!(remaining, 5);
        assert_eq!(&reply[..n], b"pong");
    }

    #[test]
    fn test_udp_bus_dispatches_into_device() {
        // Arrange
        let (app, _dir) = test_app();
        let mut dispatcher = Dispatcher::new(Arc::clone(&app.schema));
        crate::actions::register_all(&mut dispatcher);
        let mut device = Device { app, dispatcher };
        let mut bus = udp_bus();
        let port = bus.local_addr().unwrap().port();
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        // Act
        let request = pack(SYS_INFO_GET, &[], ADDR_BROADCAST).unwrap();
        client.send_to(&request, ("127.0.0.1", port)).unwrap();
        poll_until(&mut bus, |b| b.poll(Some(&mut device), Extras::default()) > 0);
        let mut reply = [0u8; 2048];
        let (n, _) = client.recv_from(&mut reply).unwrap();

        // Assert
        let mut parser = FrameParser::new();
        parser.feed(&reply[..n]);
        let frame = parser.try_parse_one().unwrap();
        assert_eq!(frame.cmd, SYS_INFO_RSP);
        assert_eq!(bus.available(), 0);
    }

    #[test]
    fn test_tcp_zero_length_read_disconnects() {
        // Arrange
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut bus = NetBus::new(BusKind::Tcp, "tcp", FrameParser::new());
        bus.connect("127.0.0.1", port, "/").unwrap();
        let (peer, _) = listener.accept().unwrap();

        // Act
        drop(peer);
        poll_until(&mut bus, |b| {
            b.poll(None, Extras::default());
            !b.is_connected()
        });

        // Assert
        assert_eq!(bus.poll(None, Extras::default()), 0);
    }

    /// Connects a WS bus to a one-shot server that answers the upgrade with
    /// `response`.
    fn connect_ws(response: &'static [u8]) -> (NetBus, Result<(), TransportError>) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).unwrap();
            sock.write_all(response).unwrap();
            sock
        });

        let mut bus = NetBus::new(BusKind::Ws, "ctrl", FrameParser::new());
        let result = bus.connect("127.0.0.1", port, "/ws");
        drop(server.join().unwrap());
        (bus, result)
    }

    #[test]
    fn test_ws_handshake_rejected_without_101() {
        let (bus, result) = connect_ws(b"HTTP/1.1 404 Not Found\r\n\r\n");

        assert!(matches!(result, Err(TransportError::Handshake(_))));
        assert!(!bus.is_connected());
    }

    #[test]
    fn test_ws_handshake_rejects_101_in_wrong_place() {
        let (bus, result) = connect_ws(
            b"HTTP/1.1 200 OK\r\nX-Trace: 101\r\n\
              Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n",
        );

        assert!(matches!(result, Err(TransportError::Handshake(_))));
        assert!(!bus.is_connected());
    }

    #[test]
    fn test_ws_handshake_verifies_accept_header() {
        let (_, wrong) = connect_ws(
            b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\
              Sec-WebSocket-Accept: AAAAAAAAAAAAAAAAAAAAAAAAAAA=\r\n\r\n",
        );
        let (_, missing) =
            connect_ws(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n");
        let (bus, ok) = connect_ws(
            b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\
              sec-websocket-accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n",
        );

        assert!(matches!(wrong, Err(TransportError::Handshake(_))));
        assert!(matches!(missing, Err(TransportError::Handshake(_))));
        assert!(ok.is_ok(), "{ok:?}");
        assert!(bus.is_connected());
    }

    #[test]
    fn test_udp_datagram_larger_than_default_read_size_arrives_whole() {
        // Arrange: a full-size frame and a 3000-byte raw datagram
        let mut bus = udp_bus();
        let port = bus.local_addr().unwrap().port();
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        let payload: Vec<u8> = (0..DEFAULT_MAX_PAYLOAD).map(|i| (i % 253) as u8).collect();
        let frame = pack(STREAM_FRAME, &payload, ADDR_BROADCAST).unwrap();
        let raw = vec![0x5Au8; 3000];

        // Act
        client.send_to(&frame, ("127.0.0.1", port)).unwrap();
        poll_until(&mut bus, |b| b.poll(None, Extras::default()) > 0);
        let mut received = vec![0u8; frame.len()];
        let frame_len = bus.read_into(&mut received);
        client.send_to(&raw, ("127.0.0.1", port)).unwrap();
        poll_until(&mut bus, |b| b.poll(None, Extras::default()) > 0);

        // Assert
        assert_eq!(frame_len, frame.len());
        let mut parser = FrameParser::new();
        parser.feed(&received);
        let parsed = parser.try_parse_one().unwrap();
        assert_eq!(parsed.cmd, STREAM_FRAME);
        assert_eq!(parsed.payload.len(), DEFAULT_MAX_PAYLOAD);
        assert_eq!(bus.available(), 3000);
    }
}
