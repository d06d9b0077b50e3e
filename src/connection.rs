//! Per-client connection state.
//!
//! A `Connection` is created by the manager when a client is accepted and
//! destroyed by the manager after the disconnection event has fired. It
//! carries the socket, the peer identity, the input/output buffers and the
//! per-connection quotas; everything else (framing, timeouts, teardown)
//! happens in the manager's pipeline.

use crate::parser::LineParser;
use bytes::BytesMut;
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

/// Default soft cap on the length of a single line, in bytes.
///
/// This is not a hard maximum; it exists to keep a malicious client from
/// filling server memory. Exceeding it disconnects the client.
pub const DEFAULT_MAX_LINE: usize = 8192;

/// Default idle timeout. A client that goes this long without completing a
/// line is disconnected. `Duration::ZERO` disables the timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    /// Unique, monotonically increasing id. Never reused.
    id: u64,
    /// IP address of the client, captured at accept time.
    peer_host: String,
    /// Port on the client machine, captured at accept time.
    peer_port: u16,

    /// Soft cap on the line under construction; exceeding it disconnects.
    pub max_line: usize,
    /// Idle timeout; `Duration::ZERO` disables it.
    pub timeout: Duration,

    pub(crate) stream: TcpStream,
    pub(crate) connected: bool,
    /// Once set, never cleared; the manager tears the connection down on its
    /// next pipeline pass.
    pub(crate) pending_disconnect: Option<String>,
    pub(crate) parser: LineParser,
    /// Outgoing bytes, drained from the front as the socket accepts them.
    pub(crate) outbox: BytesMut,
    /// Updated only when a complete line is dispatched.
    pub(crate) last_activity: Instant,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        stream: TcpStream,
        peer: SocketAddr,
        max_line: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            id,
            peer_host: peer.ip().to_string(),
            peer_port: peer.port(),
            max_line,
            timeout,
            stream,
            connected: true,
            pending_disconnect: None,
            parser: LineParser::new(),
            outbox: BytesMut::new(),
            last_activity: Instant::now(),
        }
    }

    /// Unique id of this connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// IP address of the client.
    pub fn peer_host(&self) -> &str {
        &self.peer_host
    }

    /// Port on the client machine.
    pub fn peer_port(&self) -> u16 {
        self.peer_port
    }

    /// Whether this connection is still connected.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Queue text for the client. Telnet clients expect `\r\n` newlines,
    /// not bare `\n`.
    pub fn write(&mut self, text: &str) {
        self.outbox.extend_from_slice(text.as_bytes());
    }

    /// Queue raw bytes for the client.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.outbox.extend_from_slice(bytes);
    }

    /// Schedule this connection for teardown. The disconnection event fires
    /// on the connection's next pipeline pass, not synchronously. A no-op if
    /// the connection is already disconnected or a teardown is already
    /// pending, so the first reason given wins.
    pub fn disconnect(&mut self, reason: impl Into<String>) {
        if !self.connected || self.pending_disconnect.is_some() {
            return;
        }
        self.pending_disconnect = Some(reason.into());
    }

    /// Length in bytes of the line currently under construction.
    pub(crate) fn line_len(&self) -> usize {
        self.parser.line_len()
    }
}
