//! tessera-server: standalone WebSocket sync server.
//!
//! Logging is controlled with `RUST_LOG` (e.g. `RUST_LOG=tessera_sync=debug`).

use std::time::Duration;

use clap::{Parser, ValueEnum};

use tessera_sync::config::{
    FanOut, ServerConfig, StoreConfig, SyncConfig, DEFAULT_MAX_MESSAGE_SIZE,
};
use tessera_sync::server::SyncServer;

/// Real-time state sync server for shared boards
#[derive(Parser, Debug)]
#[command(name = "tessera-server")]
#[command(about = "WebSocket server that merges and fans out field updates")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// Maximum concurrent connections (0 = unlimited)
    #[arg(long, default_value = "0")]
    max_connections: usize,

    /// Queued frames per connection before messages are dropped
    #[arg(long, default_value = "256")]
    outbox_capacity: usize,

    /// What room peers receive after a merge
    #[arg(long, value_enum, default_value = "raw")]
    fan_out: FanOutArg,

    /// Drop invalid operations without telling the sender
    #[arg(long)]
    silent_rejections: bool,

    /// Forget unoccupied entities idle for this many seconds
    #[arg(long)]
    idle_ttl_secs: Option<u64>,

    /// Upper bound on resident entities
    #[arg(long)]
    max_entities: Option<usize>,

    /// Seconds between idle sweeps
    #[arg(long, default_value = "60")]
    sweep_interval_secs: u64,

    /// Largest inbound WebSocket message, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE_SIZE)]
    max_message_bytes: usize,

    /// Seconds to wait for connections to close on shutdown
    #[arg(long, default_value = "5")]
    shutdown_grace_secs: u64,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FanOutArg {
    /// Forward each operation as submitted, even if it lost the merge
    Raw,
    /// Send the authoritative register after each accepted merge
    Resolved,
}

impl From<FanOutArg> for FanOut {
    fn from(arg: FanOutArg) -> Self {
        match arg {
            FanOutArg::Raw => FanOut::RawOperation,
            FanOutArg::Resolved => FanOut::ResolvedRegister,
        }
    }
}

impl Args {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind,
            max_connections: self.max_connections,
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
            max_message_size: self.max_message_bytes.max(1),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            sync: SyncConfig {
                fan_out: self.fan_out.into(),
                notify_rejections: !self.silent_rejections,
                outbox_capacity: self.outbox_capacity.max(1),
            },
            store: StoreConfig {
                idle_ttl: self.idle_ttl_secs.map(Duration::from_secs),
                max_entities: self.max_entities,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let config = Args::parse().into_config();
    log::info!(
        "Starting tessera-server on {} (fan-out {:?})",
        config.bind_addr,
        config.sync.fan_out
    );

    let server = SyncServer::new(config);
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for Ctrl-C: {e}");
            }
        })
        .await?;

    let stats = server.stats();
    log::info!(
        "Stopped after {} connections, {} operations applied, {} discarded, {} rejected",
        stats.total_connections,
        stats.operations_applied,
        stats.operations_discarded,
        stats.operations_rejected
    );
    Ok(())
}
