//! Operation router: validate → merge → fan out → ack.
//!
//! ```text
//! ClientMessage ──► dispatch()
//!                     │
//!      Submit ────────┼──► validate ──✗──► Rejected (origin only)
//!                     │        │
//!                     │        ▼
//!                     │   StateStore::apply_operation
//!                     │        │
//!                     │        ├──► room peers (origin excluded)
//!                     │        └──► Ack (origin only)
//!                     │
//!      JoinRoom ──────┼──► ConnectionRegistry::join ──► PeerJoined + Snapshot
//!      Presence ──────┴──► stamp sender ──► room peers
//! ```
//!
//! The router owns neither state: the store holds registers and the
//! registry holds memberships; the router is the only code that talks to
//! both. Everything here is synchronous and in-memory, so a merge and its
//! broadcast complete without waiting on any other connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::{FanOut, SyncConfig};
use crate::error::RegistryError;
use crate::operation::OperationFrame;
use crate::presence::{PresenceSender, PresenceSignal};
use crate::protocol::{Ack, ClientMessage, Rejection, ServerMessage};
use crate::register::MergeOutcome;
use crate::rooms::{ConnectionId, ConnectionRegistry, Outgoing};
use crate::store::StateStore;

/// Operation counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub operations_applied: u64,
    pub operations_discarded: u64,
    pub operations_rejected: u64,
}

#[derive(Default)]
struct AtomicRouterStats {
    applied: AtomicU64,
    discarded: AtomicU64,
    rejected: AtomicU64,
}

pub struct OperationRouter {
    store: Arc<StateStore>,
    registry: Arc<ConnectionRegistry>,
    config: SyncConfig,
    stats: AtomicRouterStats,
}

impl OperationRouter {
    pub fn new(store: Arc<StateStore>, registry: Arc<ConnectionRegistry>, config: SyncConfig) -> Self {
        Self {
            store,
            registry,
            config,
            stats: AtomicRouterStats::default(),
        }
    }

    /// Router over a fresh store and registry.
    pub fn with_config(config: SyncConfig) -> Self {
        Self::new(
            Arc::new(StateStore::default()),
            Arc::new(ConnectionRegistry::new()),
            config,
        )
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Register a connection and greet it with its id.
    pub fn connect(&self) -> (ConnectionId, mpsc::Receiver<Outgoing>) {
        let (id, rx) = self.registry.register(self.config.outbox_capacity);
        self.unicast(id, &ServerMessage::Welcome { connection_id: id });
        log::debug!("Connection {id} registered");
        (id, rx)
    }

    /// Handle one inbound message from `origin`, in arrival order.
    pub fn dispatch(&self, origin: ConnectionId, msg: ClientMessage) {
        match msg {
            ClientMessage::Identify { actor } => {
                if let Err(e) = self.registry.identify(origin, actor) {
                    log::warn!("Identify ignored: {e}");
                }
            }
            ClientMessage::JoinRoom { entity_id } => {
                if let Err(e) = self.join(origin, &entity_id) {
                    log::debug!("Join of {entity_id} ignored: {e}");
                }
            }
            ClientMessage::LeaveRoom { entity_id } => {
                if let Err(e) = self.leave(origin, &entity_id) {
                    log::debug!("Leave of {entity_id} ignored: {e}");
                }
            }
            ClientMessage::Submit(frame) => {
                // Outcome already delivered to the origin.
                let _ = self.handle_operation(frame, origin);
            }
            ClientMessage::RequestState { entity_id } => {
                self.send_snapshot(&entity_id, origin);
            }
            ClientMessage::Presence { entity_id, signal } => {
                self.relay_presence(origin, &entity_id, signal);
            }
            ClientMessage::Ping => self.unicast(origin, &ServerMessage::Pong),
        }
    }

    /// Validate, merge, fan out and acknowledge one operation.
    ///
    /// The origin need not be a member of the entity's room. If it has
    /// already disconnected, the merge and fan-out still happen and the ack
    /// is dropped.
    pub fn handle_operation(
        &self,
        frame: OperationFrame,
        origin: ConnectionId,
    ) -> Result<Ack, Rejection> {
        let operation_id = frame.id.clone().filter(|id| !id.trim().is_empty());
        let op = match frame.validate() {
            Ok(op) => op,
            Err(reason) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!("Rejected operation {operation_id:?} from {origin}: {reason}");
                let rejection = Rejection {
                    operation_id,
                    reason,
                };
                if self.config.notify_rejections {
                    self.unicast(origin, &ServerMessage::Rejected(rejection.clone()));
                }
                return Err(rejection);
            }
        };

        let merged = self.store.apply_operation(&op);
        match merged.outcome {
            MergeOutcome::Accepted => self.stats.applied.fetch_add(1, Ordering::Relaxed),
            MergeOutcome::Discarded => self.stats.discarded.fetch_add(1, Ordering::Relaxed),
        };
        log::debug!(
            "Operation {} on {}/{} by {} at {}: {:?} (v{})",
            op.id(),
            op.entity_id(),
            op.field(),
            op.actor(),
            op.timestamp(),
            merged.outcome,
            merged.register.version
        );

        let fan_out = match self.config.fan_out {
            FanOut::RawOperation => Some(ServerMessage::Operation(op.clone())),
            FanOut::ResolvedRegister if merged.outcome.is_accepted() => {
                Some(ServerMessage::FieldUpdate {
                    entity_id: op.entity_id().to_owned(),
                    field: op.field().to_owned(),
                    register: merged.register.clone(),
                })
            }
            FanOut::ResolvedRegister => None,
        };
        if let Some(msg) = fan_out {
            self.fan_out(op.entity_id(), &msg, Some(origin));
        }

        let ack = Ack {
            operation_id: op.id().to_owned(),
            outcome: merged.outcome,
            version: merged.register.version,
        };
        // A dropped ack leaves the origin unsure of the field; resync it.
        match self
            .registry
            .send_for(origin, op.entity_id(), &ServerMessage::Ack(ack.clone()))
        {
            Ok(_) => {}
            Err(e) => log::error!("Failed to encode ack for {origin}: {e}"),
        }
        Ok(ack)
    }

    /// Send the full state of an entity to one connection. Unknown entities
    /// produce an empty snapshot. Returns whether it was queued.
    ///
    /// The state is read with room broadcasts held off, so no delta queued
    /// ahead of the snapshot can be newer than it.
    pub fn send_snapshot(&self, entity_id: &str, connection: ConnectionId) -> bool {
        self.registry
            .send_exclusive(connection, entity_id, || self.snapshot(entity_id, connection))
    }

    /// Re-send the state of every entity `connection` missed messages for.
    /// Returns the number of snapshots queued.
    pub fn resync_lagged(&self, connection: ConnectionId) -> usize {
        let lagged = self.registry.take_lagged(connection);
        if lagged.is_empty() {
            return 0;
        }
        log::info!("Resyncing {} lagged entities for {connection}", lagged.len());
        lagged
            .iter()
            .filter(|entity_id| self.send_snapshot(entity_id, connection))
            .count()
    }

    /// Join a room and push a snapshot, then announce the newcomer.
    ///
    /// The snapshot is queued in the same critical section as the
    /// membership change: every delta the joiner receives is queued after
    /// it and merged no earlier than the state it shows.
    pub fn join(&self, connection: ConnectionId, entity_id: &str) -> Result<(), RegistryError> {
        self.store.pin(entity_id);
        let joined = match self
            .registry
            .join_with(connection, entity_id, || self.snapshot(entity_id, connection))
        {
            Ok(joined) => joined,
            Err(e) => {
                self.store.unpin(entity_id);
                return Err(e);
            }
        };
        if !joined {
            self.store.unpin(entity_id);
        } else {
            let sender = self.stamp(connection);
            self.fan_out(
                entity_id,
                &ServerMessage::PeerJoined {
                    entity_id: entity_id.to_owned(),
                    sender,
                },
                Some(connection),
            );
            log::info!("Connection {connection} joined {entity_id}");
        }
        Ok(())
    }

    pub fn leave(&self, connection: ConnectionId, entity_id: &str) -> Result<(), RegistryError> {
        if self.registry.leave(connection, entity_id)? {
            self.store.unpin(entity_id);
            self.announce_left(entity_id, connection);
            log::info!("Connection {connection} left {entity_id}");
        }
        Ok(())
    }

    /// Remove a connection from every room it was in.
    pub fn disconnect(&self, connection: ConnectionId) {
        let rooms = self.registry.on_disconnect(connection);
        for entity_id in &rooms {
            self.store.unpin(entity_id);
            self.announce_left(entity_id, connection);
        }
        log::debug!("Connection {connection} disconnected from {} rooms", rooms.len());
    }

    /// Relay a presence signal with a server-stamped sender. Signals for a
    /// room the sender has not joined are dropped. Returns the number of
    /// recipients.
    pub fn relay_presence(
        &self,
        connection: ConnectionId,
        entity_id: &str,
        signal: PresenceSignal,
    ) -> usize {
        if !self.registry.is_member(connection, entity_id) {
            log::debug!("Presence from {connection} for unjoined room {entity_id} dropped");
            return 0;
        }
        match &signal {
            PresenceSignal::Cursor { .. } => log::trace!("Presence: cursor in {entity_id}"),
            other => log::debug!("Presence: {} from {connection} in {entity_id}", other.kind()),
        }
        let exclude = if signal.echoes_to_sender() {
            None
        } else {
            Some(connection)
        };
        let msg = ServerMessage::Presence {
            entity_id: entity_id.to_owned(),
            sender: self.stamp(connection),
            signal,
        };
        self.fan_out(entity_id, &msg, exclude)
    }

    /// Evict idle, unoccupied entities from the store.
    pub fn sweep_idle(&self) -> Vec<String> {
        self.store.evict_idle()
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            operations_applied: self.stats.applied.load(Ordering::Relaxed),
            operations_discarded: self.stats.discarded.load(Ordering::Relaxed),
            operations_rejected: self.stats.rejected.load(Ordering::Relaxed),
        }
    }

    fn snapshot(&self, entity_id: &str, connection: ConnectionId) -> ServerMessage {
        let state = self.store.get_entity_state(entity_id);
        log::debug!(
            "Snapshot of {entity_id} ({} fields) to {connection}",
            state.len()
        );
        ServerMessage::Snapshot {
            entity_id: entity_id.to_owned(),
            state,
        }
    }

    fn stamp(&self, connection: ConnectionId) -> PresenceSender {
        PresenceSender {
            connection_id: connection,
            actor: self.registry.actor(connection),
        }
    }

    fn announce_left(&self, entity_id: &str, connection: ConnectionId) {
        self.fan_out(
            entity_id,
            &ServerMessage::PeerLeft {
                entity_id: entity_id.to_owned(),
                connection_id: connection,
            },
            Some(connection),
        );
    }

    fn fan_out(&self, entity_id: &str, msg: &ServerMessage, exclude: Option<ConnectionId>) -> usize {
        match self.registry.broadcast(entity_id, msg, exclude) {
            Ok(n) => n,
            Err(e) => {
                log::error!("Failed to encode broadcast for {entity_id}: {e}");
                0
            }
        }
    }

    fn unicast(&self, connection: ConnectionId, msg: &ServerMessage) {
        match self.registry.send_to(connection, msg) {
            Ok(true) => {}
            Ok(false) => log::debug!("Message to {connection} undeliverable; dropped"),
            Err(e) => log::error!("Failed to encode message for {connection}: {e}"),
        }
    }
}
