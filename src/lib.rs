//! telmux: a line-oriented Telnet connection multiplexer.
//!
//! Accepts inbound TCP connections, frames incoming bytes into lines, strips
//! a minimal subset of Telnet control sequences, buffers outbound writes, and
//! enforces per-connection idle timeouts and line-length limits. Lifecycle
//! events (new connection, line received, control sequence, disconnection)
//! reach the application through an [`EventHandler`].
//!
//! Everything runs on a single cooperative control loop: the host calls
//! [`ConnectionManager::update`] repeatedly, and each call performs one
//! non-blocking accept attempt plus one service pass over every connection.
//! There are no internal threads and no socket operation ever blocks.
//!
//! ```no_run
//! use telmux::{bind_listener, Connection, ConnectionManager, EventHandler, Peers};
//!
//! struct Echo;
//!
//! impl EventHandler for Echo {
//!     fn on_message(&mut self, conn: &mut Connection, _peers: &mut Peers<'_>, line: &str) {
//!         conn.write(line);
//!         conn.write("\r\n");
//!     }
//! }
//!
//! fn main() -> std::io::Result<()> {
//!     let listener = bind_listener("127.0.0.1:8211")?;
//!     let mut manager = ConnectionManager::with_handler(listener, Echo)?;
//!     loop {
//!         manager.update();
//!         std::thread::sleep(std::time::Duration::from_millis(100));
//!     }
//! }
//! ```

pub mod config;
pub mod connection;
pub mod manager;
pub mod parser;

pub use connection::{Connection, DEFAULT_MAX_LINE, DEFAULT_TIMEOUT};
pub use manager::{bind_listener, ConnectionManager, DefaultHandler, EventHandler, Peers};
pub use parser::{LineParser, ParseEvent};
