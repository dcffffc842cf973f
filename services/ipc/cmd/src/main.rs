//! ipc node binary.
//!
//! Starts one connection, sends every line read from standard input and
//! prints every message received, until interrupted.

use anyhow::Context;
use clap::Parser;
use ipc_connection::{Connection, IpcError, Protocol, Side, TracingSink};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
#[macro_use]
mod logging;

use config::NodeConfig;
use logging::IpcLogFormatter;

/// Asynchronous pair/bus ipc node
#[derive(Parser, Debug)]
#[command(name = "qk-ipc", version, about = "Asynchronous pair/bus ipc node")]
struct Args {
    /// Primary endpoint, e.g. tcp://127.0.0.1:5555, ipc:///tmp/node.sock or inproc://name
    #[arg(long)]
    endpoint: Option<String>,

    /// Messaging pattern: pair or bus
    #[arg(long)]
    protocol: Option<Protocol>,

    /// How to reach the endpoint: client, server or any
    #[arg(long)]
    side: Option<Side>,

    /// Mesh peer to dial after start (repeatable, bus only)
    #[arg(long)]
    peer: Vec<String>,

    /// Minimum reconnect interval, e.g. 100ms
    #[arg(long)]
    reconnect: Option<humantime::Duration>,

    /// Maximum reconnect backoff, e.g. 30s
    #[arg(long)]
    timeout: Option<humantime::Duration>,

    /// Largest message accepted, in bytes
    #[arg(long)]
    max_message_size: Option<usize>,

    /// How often received messages are polled
    #[arg(long, default_value = "10ms")]
    poll_interval: humantime::Duration,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Configuration file path
    #[arg(long, default_value = "qk-ipc.yaml")]
    config: PathBuf,
}

impl Args {
    /// Command line flags override the file and the environment
    fn apply(&self, config: &mut NodeConfig) {
        if let Some(endpoint) = &self.endpoint {
            config.endpoint = endpoint.clone();
        }
        if let Some(protocol) = self.protocol {
            config.protocol = protocol;
        }
        if let Some(side) = self.side {
            config.side = side;
        }
        if !self.peer.is_empty() {
            config.peers = self.peer.clone();
        }
        if let Some(reconnect) = self.reconnect {
            config.options.reconnect = reconnect.into();
        }
        if let Some(timeout) = self.timeout {
            config.options.timeout = timeout.into();
        }
        if let Some(size) = self.max_message_size {
            config.options.max_message_size = size;
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("qk_ipc={}", args.log_level).parse()?)
        .add_directive(format!("ipc_connection={}", args.log_level).parse()?)
        .add_directive(format!("ipc_transport={}", args.log_level).parse()?)
        .add_directive(format!("ipc_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .event_format(IpcLogFormatter::new("qk-ipc".to_string()))
        .init();

    info!("Starting qk-ipc v{}", env!("CARGO_PKG_VERSION"));

    let mut config = NodeConfig::load_from_file(&args.config)?;
    args.apply(&mut config);

    let conn = Arc::new(Connection::new());
    conn.set_error_cb(Some(Arc::new(TracingSink::Error)));
    conn.set_warn_cb(Some(Arc::new(TracingSink::Warn)));
    conn.set_opts(config.options);

    // start blocks on the first dial attempt
    let starter = conn.clone();
    let node = config.clone();
    tokio::task::spawn_blocking(move || start_node(&starter, &node))
        .await
        .context("start task failed")?
        .with_context(|| format!("failed to start on {}", config.endpoint))?;

    component_info!(
        "node",
        "Running {} {} on {} with {} peers",
        config.protocol,
        config.side,
        config.endpoint,
        conn.peers().len()
    );

    run(&conn, args.poll_interval.into()).await?;

    let stopper = conn.clone();
    tokio::task::spawn_blocking(move || stopper.stop())
        .await
        .context("stop task failed")?
        .context("failed to stop")?;

    info!("qk-ipc stopped");
    Ok(())
}

/// Start the connection and dial the configured mesh peers
fn start_node(conn: &Connection, config: &NodeConfig) -> Result<(), IpcError> {
    conn.start(&config.endpoint, config.protocol, config.side)?;

    for peer in &config.peers {
        // Already reported through the sinks; one bad peer does not stop the node
        if let Err(e) = conn.add_mesh_peer(peer) {
            component_warn!("mesh", "Skipping peer {}: {}", peer, e);
        }
    }
    Ok(())
}

/// Pump stdin into the connection and received messages to stdout until Ctrl-C
async fn run(conn: &Connection, poll_interval: Duration) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut poll = tokio::time::interval(poll_interval);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result.context("failed to listen for Ctrl-C")?;
                info!("Interrupted, shutting down");
                return Ok(());
            }
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) if line.is_empty() => {}
                Some(line) => {
                    if conn.send(line.as_bytes()).is_err() {
                        warn!("Dropped outbound line");
                    }
                }
                None => {
                    debug!("Standard input closed, still receiving");
                    stdin_open = false;
                }
            },
            _ = poll.tick() => {
                while let Some(msg) = conn.dequeue_received() {
                    println!("{}", String::from_utf8_lossy(&msg));
                }
            }
        }
    }
}
