//! Connection multiplexer: non-blocking accept, per-connection service
//! passes, and event dispatch.
//!
//! The manager owns the listening socket and the set of active connections.
//! One call to [`ConnectionManager::update`] performs at most one accept and
//! exactly one write/timeout/read/parse pass per connection that was active
//! at the start of the call. Nothing blocks: every socket operation is
//! non-blocking and a would-block condition means "no data / no room", not
//! an error. The host decides the cadence, typically a short fixed sleep or
//! a readiness notification on the underlying sockets.

use crate::connection::{Connection, DEFAULT_MAX_LINE, DEFAULT_TIMEOUT};
use crate::parser::ParseEvent;
use bytes::Buf;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Upper bound on bytes pulled from a socket in one pass.
const READ_CHUNK: usize = 4096;

/// Application callbacks for connection lifecycle events.
///
/// All four methods have diagnostic default bodies, so an application
/// overrides only the events it cares about. Every method runs synchronously
/// inside [`ConnectionManager::update`]; a handler may call
/// [`Connection::disconnect`] on the connection it was given and the manager
/// observes it as soon as the handler returns, dropping the rest of the
/// current chunk.
pub trait EventHandler {
    /// A client was accepted. The connection joins the active set after this
    /// returns, so `peers` does not include it.
    fn on_connect(&mut self, conn: &mut Connection, _peers: &mut Peers<'_>) {
        info!(
            id = conn.id(),
            host = %conn.peer_host(),
            port = conn.peer_port(),
            "New connection"
        );
    }

    /// A complete line arrived, CR/LF stripped and backspace-edited.
    fn on_message(&mut self, conn: &mut Connection, _peers: &mut Peers<'_>, line: &str) {
        info!(id = conn.id(), line = %line, "Received line");
    }

    /// A Telnet control sequence arrived: IAC, then the disposition byte,
    /// then the parameter byte.
    fn on_control(
        &mut self,
        conn: &mut Connection,
        _peers: &mut Peers<'_>,
        parameter: u8,
        disposition: u8,
    ) {
        debug!(
            id = conn.id(),
            disposition, parameter, "Telnet control sequence"
        );
    }

    /// The connection is being torn down. Fires exactly once per connection,
    /// with the first disconnect reason recorded.
    fn on_disconnect(&mut self, conn: &mut Connection, _peers: &mut Peers<'_>, reason: &str) {
        info!(id = conn.id(), reason = %reason, "Connection closed");
    }
}

/// Log-only fallback handler used when the application registers none.
#[derive(Debug, Default)]
pub struct DefaultHandler;

impl EventHandler for DefaultHandler {}

/// The other active connections, as seen by a handler during dispatch.
///
/// The connection currently being serviced is never part of this view; it is
/// reached through the handler's own `conn` argument. Peers disconnected
/// from here are torn down on their next pipeline pass.
pub struct Peers<'a> {
    connections: &'a mut VecDeque<Connection>,
}

impl Peers<'_> {
    /// Number of other active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether there are no other active connections.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Iterate the other active connections.
    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.iter()
    }

    /// Iterate the other active connections mutably, e.g. to broadcast.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.connections.iter_mut()
    }

    /// Look up another connection by id.
    pub fn get_mut(&mut self, id: u64) -> Option<&mut Connection> {
        self.connections.iter_mut().find(|c| c.id() == id)
    }
}

/// Owns the listening socket and the active connections, and drives one
/// non-blocking service pass per [`update`](ConnectionManager::update) call.
pub struct ConnectionManager<H = DefaultHandler> {
    listener: TcpListener,
    connections: VecDeque<Connection>,
    handler: H,
    next_id: u64,
    default_max_line: usize,
    default_timeout: Duration,
}

impl ConnectionManager<DefaultHandler> {
    /// Create a manager with the log-only [`DefaultHandler`].
    ///
    /// The listener must already be bound and listening; it is switched to
    /// non-blocking mode here.
    pub fn new(listener: TcpListener) -> io::Result<Self> {
        Self::with_handler(listener, DefaultHandler)
    }
}

impl<H: EventHandler> ConnectionManager<H> {
    /// Create a manager dispatching events to `handler`.
    pub fn with_handler(listener: TcpListener, handler: H) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            connections: VecDeque::new(),
            handler,
            next_id: 0,
            default_max_line: DEFAULT_MAX_LINE,
            default_timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Line-length cap stamped on connections accepted from now on.
    pub fn set_default_max_line(&mut self, max_line: usize) {
        self.default_max_line = max_line;
    }

    /// Idle timeout stamped on connections accepted from now on.
    /// `Duration::ZERO` disables it.
    pub fn set_default_timeout(&mut self, timeout: Duration) {
        self.default_timeout = timeout;
    }

    /// The application handler.
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// The application handler, mutably.
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Number of active connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Iterate the active connections.
    pub fn active_connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.iter()
    }

    /// Iterate the active connections mutably, e.g. to broadcast outside of
    /// event dispatch.
    pub fn active_connections_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.connections.iter_mut()
    }

    /// Accept at most one new client and run one service pass over every
    /// connection that was active when the call started. Connections
    /// accepted by this call are first serviced on the next call.
    ///
    /// Never blocks and never fails: accept errors are logged, and every
    /// per-connection failure is converted into a disconnection event
    /// without disturbing the remaining connections.
    pub fn update(&mut self) {
        let pending = self.connections.len();

        self.accept_one();

        for _ in 0..pending {
            let Some(conn) = self.connections.pop_front() else {
                break;
            };
            self.service(conn);
        }
    }

    /// One non-blocking accept attempt. Would-block means no client is
    /// waiting; any other failure is logged and the pass continues.
    fn accept_one(&mut self) {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(true) {
                    warn!(peer = %peer, error = %e, "Dropping client: cannot set non-blocking");
                    return;
                }
                self.next_id += 1;
                let mut conn = Connection::new(
                    self.next_id,
                    stream,
                    peer,
                    self.default_max_line,
                    self.default_timeout,
                );
                let mut peers = Peers {
                    connections: &mut self.connections,
                };
                self.handler.on_connect(&mut conn, &mut peers);
                self.connections.push_back(conn);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => warn!(error = %e, "Accept failed"),
        }
    }

    /// One pipeline pass over a single connection. The step order matters:
    /// a write failure or timeout detected here pre-empts reading, and a
    /// reason recorded by an earlier step is never overwritten by a later
    /// one.
    fn service(&mut self, mut conn: Connection) {
        // 1. Flush as much queued output as the socket accepts.
        if !conn.outbox.is_empty() {
            match conn.stream.write(&conn.outbox) {
                Ok(sent) => conn.outbox.advance(sent),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => conn.disconnect(e.to_string()),
            }
        }

        // 2. Idle timeout, measured from the last completed line.
        if !conn.timeout.is_zero() && conn.last_activity.elapsed() > conn.timeout {
            conn.disconnect("timed out");
        }

        // 3. Line quota. A soft cap: the oversized line is already buffered,
        // the client just doesn't get to grow it further.
        if conn.line_len() > conn.max_line {
            conn.disconnect("maximum line size exceeded");
        }

        // 4. Teardown if a disconnect is pending from this or an earlier
        // pass. The connection is not requeued.
        if let Some(reason) = conn.pending_disconnect.clone() {
            self.teardown(conn, &reason);
            return;
        }

        // 5. Read whatever is available, up to one chunk.
        let mut buf = [0u8; READ_CHUNK];
        let received = match conn.stream.read(&mut buf) {
            Ok(0) => {
                conn.disconnect("disconnected");
                0
            }
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(e) => {
                conn.disconnect(e.to_string());
                0
            }
        };

        // 6. Parse, unless the read already doomed the connection.
        if conn.pending_disconnect.is_none() {
            self.parse_chunk(&mut conn, &buf[..received]);
        }

        self.connections.push_back(conn);
    }

    /// Feed a received chunk through the line parser, dispatching events as
    /// they complete. Stops consuming the chunk as soon as a handler
    /// schedules a disconnect.
    fn parse_chunk(&mut self, conn: &mut Connection, chunk: &[u8]) {
        for &byte in chunk {
            let Some(event) = conn.parser.feed(byte) else {
                continue;
            };
            match event {
                ParseEvent::Line(line) => {
                    conn.last_activity = Instant::now();
                    let mut peers = Peers {
                        connections: &mut self.connections,
                    };
                    self.handler.on_message(conn, &mut peers, &line);
                }
                ParseEvent::Control {
                    parameter,
                    disposition,
                } => {
                    let mut peers = Peers {
                        connections: &mut self.connections,
                    };
                    self.handler.on_control(conn, &mut peers, parameter, disposition);
                }
            }
            if conn.pending_disconnect.is_some() {
                break;
            }
        }
    }

    /// Finalize a disconnection: fire the event, then best-effort shutdown.
    /// Shutdown errors are swallowed; the peer may already be gone.
    fn teardown(&mut self, mut conn: Connection, reason: &str) {
        conn.connected = false;
        let mut peers = Peers {
            connections: &mut self.connections,
        };
        self.handler.on_disconnect(&mut conn, &mut peers, reason);
        let _ = conn.stream.shutdown(Shutdown::Both);
        debug!(id = conn.id(), reason = %reason, "Connection torn down");
    }
}

/// Build a non-blocking listener ready to hand to [`ConnectionManager`]:
/// reuse-address, bound, listening with a backlog of 1024.
pub fn bind_listener(listen: &str) -> io::Result<TcpListener> {
    let addr: SocketAddr = listen
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;
    use std::thread;

    #[derive(Debug, Clone, PartialEq)]
    enum Ev {
        Connect(u64),
        Message(u64, String),
        Control(u64, u8, u8),
        Disconnect(u64, String),
    }

    /// Records every event; optionally disconnects (twice, to check that the
    /// first reason wins) whenever a message arrives.
    #[derive(Default)]
    struct Recorder {
        events: Vec<Ev>,
        disconnect_on_message: Option<&'static str>,
    }

    impl EventHandler for Recorder {
        fn on_connect(&mut self, conn: &mut Connection, _peers: &mut Peers<'_>) {
            self.events.push(Ev::Connect(conn.id()));
        }

        fn on_message(&mut self, conn: &mut Connection, _peers: &mut Peers<'_>, line: &str) {
            self.events.push(Ev::Message(conn.id(), line.to_string()));
            if let Some(reason) = self.disconnect_on_message {
                conn.disconnect(reason);
                conn.disconnect("a later reason that must lose");
            }
        }

        fn on_control(
            &mut self,
            conn: &mut Connection,
            _peers: &mut Peers<'_>,
            parameter: u8,
            disposition: u8,
        ) {
            self.events.push(Ev::Control(conn.id(), parameter, disposition));
        }

        fn on_disconnect(&mut self, conn: &mut Connection, _peers: &mut Peers<'_>, reason: &str) {
            self.events.push(Ev::Disconnect(conn.id(), reason.to_string()));
        }
    }

    fn manager_with_recorder() -> (ConnectionManager<Recorder>, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let manager = ConnectionManager::with_handler(listener, Recorder::default()).unwrap();
        (manager, addr)
    }

    fn pump<H: EventHandler>(manager: &mut ConnectionManager<H>, passes: usize) {
        for _ in 0..passes {
            manager.update();
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn read_available(stream: &mut TcpStream) -> String {
        stream
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(_) => break,
            }
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    #[test]
    fn test_accept_assigns_monotonic_ids() {
        let (mut manager, addr) = manager_with_recorder();
        let _a = TcpStream::connect(addr).unwrap();
        let _b = TcpStream::connect(addr).unwrap();
        pump(&mut manager, 4);

        assert_eq!(manager.connection_count(), 2);
        assert_eq!(
            &manager.handler().events[..2],
            &[Ev::Connect(1), Ev::Connect(2)]
        );
    }

    #[test]
    fn test_new_connection_not_serviced_in_accept_pass() {
        let (mut manager, addr) = manager_with_recorder();
        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"early\n").unwrap();
        thread::sleep(Duration::from_millis(50));

        // First call accepts but must not read the already-waiting bytes.
        manager.update();
        assert_eq!(manager.handler().events, vec![Ev::Connect(1)]);

        manager.update();
        assert_eq!(
            manager.handler().events,
            vec![Ev::Connect(1), Ev::Message(1, "early".to_string())]
        );
    }

    #[test]
    fn test_no_message_without_lf() {
        let (mut manager, addr) = manager_with_recorder();
        let mut client = TcpStream::connect(addr).unwrap();
        pump(&mut manager, 2);
        client.write_all(b"partial line").unwrap();
        pump(&mut manager, 3);

        let events = &manager.handler().events;
        assert!(!events.iter().any(|e| matches!(e, Ev::Message(..))));
        assert_eq!(manager.active_connections().next().unwrap().line_len(), 12);
    }

    #[test]
    fn test_echo_round_trip() {
        struct Echo;
        impl EventHandler for Echo {
            fn on_message(&mut self, conn: &mut Connection, _peers: &mut Peers<'_>, line: &str) {
                conn.write(line);
                conn.write("\r\n");
            }
        }

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut manager = ConnectionManager::with_handler(listener, Echo).unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        pump(&mut manager, 2);
        client.write_all(b"hello\n").unwrap();
        pump(&mut manager, 3);

        assert_eq!(read_available(&mut client), "hello\r\n");
    }

    #[test]
    fn test_control_sequence_event() {
        let (mut manager, addr) = manager_with_recorder();
        let mut client = TcpStream::connect(addr).unwrap();
        pump(&mut manager, 2);
        client.write_all(&[255, 251, 1]).unwrap();
        pump(&mut manager, 3);

        let events = &manager.handler().events;
        assert!(events.contains(&Ev::Control(1, 1, 251)));
        assert!(!events.iter().any(|e| matches!(e, Ev::Message(..))));
    }

    #[test]
    fn test_zero_timeout_never_disconnects() {
        let (mut manager, addr) = manager_with_recorder();
        manager.set_default_timeout(Duration::ZERO);
        let _client = TcpStream::connect(addr).unwrap();
        pump(&mut manager, 2);
        thread::sleep(Duration::from_millis(80));
        pump(&mut manager, 2);

        assert_eq!(manager.connection_count(), 1);
        let events = &manager.handler().events;
        assert!(!events.iter().any(|e| matches!(e, Ev::Disconnect(..))));
    }

    #[test]
    fn test_idle_timeout_disconnects() {
        let (mut manager, addr) = manager_with_recorder();
        manager.set_default_timeout(Duration::from_millis(30));
        let _client = TcpStream::connect(addr).unwrap();
        pump(&mut manager, 2);
        thread::sleep(Duration::from_millis(80));
        pump(&mut manager, 2);

        assert_eq!(manager.connection_count(), 0);
        assert!(manager
            .handler()
            .events
            .contains(&Ev::Disconnect(1, "timed out".to_string())));
    }

    #[test]
    fn test_oversized_line_disconnects() {
        let (mut manager, addr) = manager_with_recorder();
        manager.set_default_max_line(8);
        let mut client = TcpStream::connect(addr).unwrap();
        pump(&mut manager, 2);
        client.write_all(b"aaaaaaaaaaaaaaaaaaaa").unwrap();
        pump(&mut manager, 3);

        let events = &manager.handler().events;
        assert!(events.contains(&Ev::Disconnect(
            1,
            "maximum line size exceeded".to_string()
        )));
        assert!(!events.iter().any(|e| matches!(e, Ev::Message(..))));
        assert_eq!(manager.connection_count(), 0);
    }

    #[test]
    fn test_peer_close_disconnects() {
        let (mut manager, addr) = manager_with_recorder();
        let client = TcpStream::connect(addr).unwrap();
        pump(&mut manager, 2);
        drop(client);
        pump(&mut manager, 3);

        assert!(manager
            .handler()
            .events
            .contains(&Ev::Disconnect(1, "disconnected".to_string())));
        assert_eq!(manager.connection_count(), 0);
    }

    #[test]
    fn test_handler_disconnect_stops_chunk_and_first_reason_wins() {
        let (mut manager, addr) = manager_with_recorder();
        manager.handler_mut().disconnect_on_message = Some("handler said so");
        let mut client = TcpStream::connect(addr).unwrap();
        pump(&mut manager, 2);
        client.write_all(b"one\ntwo\n").unwrap();
        pump(&mut manager, 3);

        let events = &manager.handler().events;
        let messages: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, Ev::Message(..)))
            .collect();
        assert_eq!(messages, vec![&Ev::Message(1, "one".to_string())]);

        let disconnects: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, Ev::Disconnect(..)))
            .collect();
        assert_eq!(
            disconnects,
            vec![&Ev::Disconnect(1, "handler said so".to_string())]
        );
    }

    #[test]
    fn test_default_handler_logs_only() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut manager = ConnectionManager::new(listener).unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        pump(&mut manager, 2);
        client.write_all(b"hello\n").unwrap();
        pump(&mut manager, 2);

        // Default handlers are diagnostic only: the connection stays up and
        // nothing is written back.
        assert_eq!(manager.connection_count(), 1);
        assert_eq!(read_available(&mut client), "");
    }

    #[test]
    fn test_bind_listener_rejects_garbage() {
        assert!(bind_listener("not an address").is_err());
    }
}
