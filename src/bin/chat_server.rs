//! A simple example chat server.
//!
//! Clients pick a username on connect, then every line they send is
//! broadcast to the other logged-in users. All chat state lives here, keyed
//! by connection id; the multiplexer knows nothing about usernames.

use std::collections::HashMap;
use std::thread;
use std::time::Duration;
use telmux::config::Config;
use telmux::{bind_listener, Connection, ConnectionManager, EventHandler, Peers};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Usernames are limited to ASCII alphanumerics plus this set.
const USERNAME_PUNCTUATION: &str = ".!?$%*_-=+^&#~|@";

/// Maximum username length in characters.
const MAX_USERNAME_LEN: usize = 16;

fn valid_username_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || USERNAME_PUNCTUATION.contains(c)
}

/// Where a connection is in the login flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChatState {
    AwaitingUsername,
    Chatting,
}

/// Per-connection chat state, owned by the application and keyed by
/// connection id.
#[derive(Debug, Default)]
struct ChatHandler {
    usernames: HashMap<u64, String>,
    states: HashMap<u64, ChatState>,
}

impl ChatHandler {
    /// Send `message` to every logged-in peer. The speaker is never among
    /// the peers, so nothing is echoed back.
    fn announce(&self, peers: &mut Peers<'_>, message: &str) {
        for peer in peers.iter_mut() {
            if self.usernames.contains_key(&peer.id()) {
                peer.write(message);
                peer.write("\r\n");
            }
        }
    }
}

impl EventHandler for ChatHandler {
    fn on_connect(&mut self, conn: &mut Connection, _peers: &mut Peers<'_>) {
        info!(
            id = conn.id(),
            host = %conn.peer_host(),
            port = conn.peer_port(),
            "New connection"
        );
        self.states.insert(conn.id(), ChatState::AwaitingUsername);
        conn.write("Please enter a username: ");
    }

    fn on_message(&mut self, conn: &mut Connection, peers: &mut Peers<'_>, line: &str) {
        match self.states.get(&conn.id()).copied() {
            Some(ChatState::AwaitingUsername) => {
                if self.usernames.values().any(|name| name == line) {
                    conn.write("That username is already taken.\r\nPlease try again: ");
                    return;
                }
                if line.len() > MAX_USERNAME_LEN {
                    conn.write("Username too long.\r\nPlease try again: ");
                    return;
                }
                if !line.chars().all(valid_username_char) {
                    conn.write("Username contains invalid characters.\r\nPlease try again: ");
                    return;
                }

                if self.usernames.is_empty() {
                    conn.write("There is no one else here at the moment.\r\n");
                } else {
                    let names: Vec<&str> = self.usernames.values().map(String::as_str).collect();
                    conn.write(&format!("Presently connected: {}\r\n", names.join(", ")));
                }

                self.usernames.insert(conn.id(), line.to_string());
                self.states.insert(conn.id(), ChatState::Chatting);

                // Chatters are never idle-kicked.
                conn.timeout = Duration::ZERO;

                self.announce(peers, &format!("{line} has joined the chat."));
            }
            Some(ChatState::Chatting) => {
                let Some(name) = self.usernames.get(&conn.id()) else {
                    error!(id = conn.id(), "Chatting connection has no username");
                    conn.disconnect("internal state error");
                    return;
                };
                info!(id = conn.id(), user = %name, line = %line, "Chat message");
                let text = format!("<{name}> {line}");
                self.announce(peers, &text);
            }
            None => {
                error!(id = conn.id(), "Connection has no chat state");
                conn.disconnect("internal state error");
            }
        }
    }

    fn on_disconnect(&mut self, conn: &mut Connection, peers: &mut Peers<'_>, reason: &str) {
        match self.usernames.get(&conn.id()) {
            Some(name) => {
                info!(id = conn.id(), user = %name, reason = %reason, "Disconnected")
            }
            None => info!(id = conn.id(), reason = %reason, "Disconnected"),
        }

        if let Some(name) = self.usernames.remove(&conn.id()) {
            self.announce(peers, &format!("{name} has left the chat."));
        }
        self.states.remove(&conn.id());
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load("127.0.0.1:8212")?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let listener = bind_listener(&config.listen)?;
    let mut manager = ConnectionManager::with_handler(listener, ChatHandler::default())?;
    manager.set_default_max_line(config.max_line);
    manager.set_default_timeout(config.timeout);

    info!(address = %config.listen, "Chat server listening");

    loop {
        manager.update();
        thread::sleep(config.tick);
    }
}
