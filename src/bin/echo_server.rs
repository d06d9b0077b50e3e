//! A simple server which echoes back anything you type.

use std::thread;
use telmux::config::Config;
use telmux::{bind_listener, Connection, ConnectionManager, EventHandler, Peers};
use tracing::info;
use tracing_subscriber::EnvFilter;

struct EchoHandler;

impl EventHandler for EchoHandler {
    fn on_message(&mut self, conn: &mut Connection, _peers: &mut Peers<'_>, line: &str) {
        // Echo the client's line back, with a Telnet newline.
        conn.write(line);
        conn.write("\r\n");
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load("127.0.0.1:8211")?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let listener = bind_listener(&config.listen)?;
    let mut manager = ConnectionManager::with_handler(listener, EchoHandler)?;
    manager.set_default_max_line(config.max_line);
    manager.set_default_timeout(config.timeout);

    info!(address = %config.listen, "Echo server listening");

    loop {
        manager.update();
        thread::sleep(config.tick);
    }
}
