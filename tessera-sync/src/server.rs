//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                     ┌── StateStore (registers)
//!             ├── connection task ─┤
//! Client B ──┘   (one per socket)  └── ConnectionRegistry (rooms, outboxes)
//!                      │
//!                      ▼
//!               OperationRouter::dispatch
//! ```
//!
//! Each connection runs in its own task. Inbound frames are decoded and
//! dispatched inline, one at a time, so a connection's operations are
//! processed in the order it sent them. The same task drains the
//! connection's outbox into the socket, and re-sends a snapshot of any
//! room whose deltas were dropped while the outbox was full.
//!
//! Connection tasks are tracked so that [`SyncServer::shutdown`] can stop
//! them before the store is cleared.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;

use crate::config::ServerConfig;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::rooms::ConnectionRegistry;
use crate::router::OperationRouter;
use crate::store::StateStore;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    /// Accepted sockets, including those still in the WebSocket handshake.
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub resident_entities: usize,
    pub operations_applied: u64,
    pub operations_discarded: u64,
    pub operations_rejected: u64,
    pub messages_dropped: u64,
}

#[derive(Default)]
struct ConnectionCounters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
}

/// Holds one slot of the connection limit until the task ends.
struct ActiveConnection(Arc<ConnectionCounters>);

impl ActiveConnection {
    fn acquire(counters: &Arc<ConnectionCounters>) -> Self {
        counters.active_connections.fetch_add(1, Ordering::Relaxed);
        Self(counters.clone())
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.0.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    router: Arc<OperationRouter>,
    counters: Arc<ConnectionCounters>,
    /// Set once `serve` has bound, for callers that bind to port 0.
    local_addr: RwLock<Option<SocketAddr>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<JoinSet<()>>,
}

impl SyncServer {
    /// Create a new sync server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let store = Arc::new(StateStore::new(config.store.clone()));
        let registry = Arc::new(ConnectionRegistry::new());
        let router = Arc::new(OperationRouter::new(store, registry, config.sync.clone()));
        Self {
            config,
            router,
            counters: Arc::new(ConnectionCounters::default()),
            local_addr: RwLock::new(None),
            shutdown_tx: watch::channel(false).0,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind to the configured address and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve until `shutdown` resolves, then stop every connection and drop
    /// all entity state.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), BoxError>
    where
        F: std::future::Future<Output = ()>,
    {
        let result = tokio::select! {
            r = self.run() => r,
            _ = shutdown => {
                log::info!("Shutdown requested");
                Ok(())
            }
        };
        self.shutdown().await;
        result
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        let addr = listener.local_addr()?;
        *self.local_addr.write().await = Some(addr);
        log::info!("Sync server listening on {addr}");

        let _sweeper = self.spawn_sweeper();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            let (stream, peer_addr) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = stopped(&mut shutdown_rx) => {
                    log::info!("Sync server on {addr} stopped accepting");
                    return Ok(());
                }
            };
            log::debug!("New TCP connection from {peer_addr}");

            let max = self.config.max_connections;
            if max > 0 && self.counters.active_connections.load(Ordering::Relaxed) >= max as u64 {
                log::warn!("Connection limit {max} reached; refusing {peer_addr}");
                drop(stream);
                continue;
            }

            // Counted before the handshake so pending sockets hold a slot.
            let active = ActiveConnection::acquire(&self.counters);
            let router = self.router.clone();
            let counters = self.counters.clone();
            let ws_config = self.ws_config();
            let shutdown = self.shutdown_tx.subscribe();

            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            while tasks.try_join_next().is_some() {}
            if *shutdown.borrow() {
                return Ok(());
            }
            tasks.spawn(async move {
                let result = Self::handle_connection(
                    stream, peer_addr, router, counters, ws_config, shutdown,
                )
                .await;
                if let Err(e) = result {
                    log::error!("Connection error from {peer_addr}: {e}");
                }
                drop(active);
            });
        }
    }

    fn ws_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.config.max_message_size);
        config.max_frame_size = Some(self.config.max_message_size);
        config
    }

    /// Periodically evict idle entities, if an idle TTL is configured.
    fn spawn_sweeper(&self) -> Option<SweeperGuard> {
        self.config.store.idle_ttl?;
        let router = self.router.clone();
        let period = self.config.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let evicted = router.sweep_idle();
                if !evicted.is_empty() {
                    log::info!("Evicted {} idle entities", evicted.len());
                }
            }
        });
        Some(SweeperGuard(handle))
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        router: Arc<OperationRouter>,
        counters: Arc<ConnectionCounters>,
        ws_config: WebSocketConfig,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        counters.total_connections.fetch_add(1, Ordering::Relaxed);

        let (connection_id, mut outbox) = router.connect();
        log::info!("WebSocket connection {connection_id} established from {addr}");

        let result = async {
            loop {
                tokio::select! {
                    biased;

                    _ = stopped(&mut shutdown) => {
                        log::debug!("Closing connection {connection_id} for shutdown");
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }

                    // Incoming WebSocket message
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                counters.total_messages.fetch_add(1, Ordering::Relaxed);
                                counters.total_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
                                match ClientMessage::decode(&data) {
                                    Ok(client_msg) => router.dispatch(connection_id, client_msg),
                                    Err(e) => {
                                        log::warn!("Failed to decode message from {addr}: {e}");
                                        let reply = ServerMessage::Error { message: e.to_string() };
                                        ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                    }
                                }
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    // Outgoing frames queued by the router
                    queued = outbox.recv() => {
                        match queued {
                            Some(data) => {
                                ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                                router.resync_lagged(connection_id);
                            }
                            None => break,
                        }
                    }
                }
            }
            Ok::<(), BoxError>(())
        }
        .await;

        // Cleanup runs even if the socket failed mid-message.
        router.disconnect(connection_id);
        log::info!("Connection {connection_id} from {addr} cleaned up");

        result
    }

    /// Get server statistics.
    pub fn stats(&self) -> ServerStats {
        let broadcast = self.router.registry().stats();
        let ops = self.router.stats();
        ServerStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            total_messages: self.counters.total_messages.load(Ordering::Relaxed),
            total_bytes: self.counters.total_bytes.load(Ordering::Relaxed),
            active_rooms: broadcast.active_rooms,
            resident_entities: self.router.store().entity_count(),
            operations_applied: ops.operations_applied,
            operations_discarded: ops.operations_discarded,
            operations_rejected: ops.operations_rejected,
            messages_dropped: broadcast.messages_dropped,
        }
    }

    /// Stop accepting, close every connection and drop all entity state.
    ///
    /// Connection tasks get `shutdown_grace` to finish before they are
    /// aborted; the store is cleared only once none of them is running.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let mut tasks = {
            let mut guard = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };

        let grace = self.config.shutdown_grace;
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            log::warn!(
                "{} connection tasks still running after {grace:?}; aborting",
                tasks.len()
            );
            tasks.shutdown().await;
        }

        let entities = self.router.store().entity_count();
        self.router.store().clear();
        log::info!("Store cleared ({entities} entities)");
    }

    /// Whether `shutdown` has been called.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Address actually bound, once serving.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().await
    }

    pub fn router(&self) -> &Arc<OperationRouter> {
        &self.router
    }
}

/// Resolves once the shutdown flag is set.
async fn stopped(rx: &mut watch::Receiver<bool>) {
    loop {
        let stop = *rx.borrow_and_update();
        if stop || rx.changed().await.is_err() {
            return;
        }
    }
}

/// Aborts the sweeper task when `serve` returns.
struct SweeperGuard(tokio::task::JoinHandle<()>);

impl Drop for SweeperGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}
