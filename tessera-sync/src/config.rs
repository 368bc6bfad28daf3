//! Configuration for the store, the router and the WebSocket server.

use std::time::Duration;

/// What peers receive when an operation is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FanOut {
    /// Forward the incoming operation as submitted, even if the merge
    /// discarded it.
    #[default]
    RawOperation,
    /// Forward the register after the merge; discarded operations are not
    /// forwarded at all.
    ResolvedRegister,
}

/// Router policy.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub fan_out: FanOut,
    /// Send `Rejected` to the origin of a malformed operation instead of
    /// dropping it silently.
    pub notify_rejections: bool,
    /// Messages buffered per connection before new ones are dropped.
    pub outbox_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            fan_out: FanOut::RawOperation,
            notify_rejections: true,
            outbox_capacity: 256,
        }
    }
}

/// Entity eviction policy. Both bounds are off by default, so entity state
/// lives until the store is cleared.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// Forget entities nobody has touched for this long (and nobody has joined).
    pub idle_ttl: Option<Duration>,
    /// Upper bound on resident entities; the least recently touched
    /// unoccupied entity is evicted to make room.
    pub max_entities: Option<usize>,
}

/// Default cap on inbound WebSocket messages (1 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum simultaneous connections (0 = unlimited)
    pub max_connections: usize,
    /// How often idle entities are swept when `store.idle_ttl` is set
    pub sweep_interval: Duration,
    /// Largest WebSocket message or frame accepted, in bytes
    pub max_message_size: usize,
    /// How long shutdown waits for connection tasks before aborting them
    pub shutdown_grace: Duration,
    pub sync: SyncConfig,
    pub store: StoreConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_connections: 0,
            sweep_interval: Duration::from_secs(60),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            shutdown_grace: Duration::from_secs(5),
            sync: SyncConfig::default(),
            store: StoreConfig::default(),
        }
    }
}
