use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{ensure, Context};

use crate::cli::Cli;

/// Runtime settings for the relay. Built from CLI flags / environment via
/// `TryFrom<&Cli>`; `Default` mirrors the flag defaults so tests can tweak a
/// single field without going through the parser.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    /// Hard cap on concurrently registered students.
    pub max_students: usize,
    /// Largest inbound websocket message accepted, in bytes.
    pub max_message_bytes: usize,
    /// Deadline for a single outbound websocket write.
    pub write_timeout: Duration,
    /// A session is torn down when no inbound traffic arrives in this window.
    pub pong_timeout: Duration,
    /// Keepalive ping cadence; must stay strictly below `pong_timeout`.
    pub ping_interval: Duration,
    /// Bounded depth of each session's outbox.
    pub outbox_capacity: usize,
    /// Bounded depth of the hub's serialized request queue.
    pub hub_queue_depth: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_students: 100,
            max_message_bytes: 10 * 1024 * 1024,
            write_timeout: Duration::from_secs(5),
            pong_timeout: Duration::from_secs(60),
            ping_interval: Duration::from_secs(50),
            outbox_capacity: 128,
            hub_queue_depth: 256,
        }
    }
}

impl TryFrom<&Cli> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(cli: &Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address '{}'", cli.listen_addr))?;
        ensure!(cli.outbox_capacity > 0, "outbox capacity must be at least 1");
        ensure!(cli.hub_queue_depth > 0, "hub queue depth must be at least 1");
        ensure!(
            cli.ping_interval_secs < cli.pong_timeout_secs,
            "ping interval ({}s) must be shorter than the pong timeout ({}s)",
            cli.ping_interval_secs,
            cli.pong_timeout_secs
        );
        Ok(Self {
            listen_addr,
            max_students: cli.max_students,
            max_message_bytes: cli.max_message_bytes,
            write_timeout: Duration::from_secs(cli.write_timeout_secs),
            pong_timeout: Duration::from_secs(cli.pong_timeout_secs),
            ping_interval: Duration::from_secs(cli.ping_interval_secs),
            outbox_capacity: cli.outbox_capacity,
            hub_queue_depth: cli.hub_queue_depth,
        })
    }
}
