//! Connection registry and room fan-out.
//!
//! Every live connection owns a bounded outbox; rooms are sets of
//! connection ids keyed by entity id. A message is encoded once and the
//! same `Arc` is pushed into each member's outbox, skipping the excluded
//! connection. Outboxes never block the caller: a full outbox drops the
//! message and counts it.
//!
//! ```text
//!                 ┌── room "board-1" ──┐
//! broadcast ──►   │  conn A   conn B   │ ──► outbox A, outbox B
//!                 └────────────────────┘
//! ```
//!
//! Connection and room maps sit behind one lock so that a join racing a
//! disconnect for the same connection cannot leave a dangling member. The
//! same lock orders a joiner's snapshot before any broadcast it can see.
//!
//! A connection whose outbox overflowed is marked lagged for the room the
//! dropped message belonged to; the owner of the outbox asks for those
//! rooms with [`ConnectionRegistry::take_lagged`] and re-sends their state.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{ProtocolError, RegistryError};
use crate::protocol::ServerMessage;

pub type ConnectionId = Uuid;

/// Encoded frame shared by every recipient of a broadcast.
pub type Outgoing = Arc<Vec<u8>>;

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_connections: usize,
    pub active_rooms: usize,
}

/// Lock-free counters updated on the hot path.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

struct ConnectionEntry {
    outbox: mpsc::Sender<Outgoing>,
    rooms: HashSet<String>,
    actor: Option<String>,
    /// Set together with a non-empty `lagged`; checked without the mutex.
    lagging: AtomicBool,
    /// Rooms whose messages were dropped for this connection.
    lagged: Mutex<HashSet<String>>,
}

impl ConnectionEntry {
    fn mark_lagged(&self, entity_id: &str) {
        self.lagged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entity_id.to_owned());
        self.lagging.store(true, Ordering::Release);
    }
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    rooms: HashMap<String, HashSet<ConnectionId>>,
}

/// Live connections and their room memberships.
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
    stats: AtomicBroadcastStats,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            stats: AtomicBroadcastStats::new(),
        }
    }

    /// Register a new connection and return its id together with the
    /// receiving end of its outbox.
    pub fn register(&self, outbox_capacity: usize) -> (ConnectionId, mpsc::Receiver<Outgoing>) {
        let (tx, rx) = mpsc::channel(outbox_capacity.max(1));
        let id = Uuid::new_v4();
        self.write().connections.insert(
            id,
            ConnectionEntry {
                outbox: tx,
                rooms: HashSet::new(),
                actor: None,
                lagging: AtomicBool::new(false),
                lagged: Mutex::new(HashSet::new()),
            },
        );
        (id, rx)
    }

    /// Record the actor a connection speaks for. Attribution only, and
    /// fixed for the life of the connection once set.
    pub fn identify(&self, id: ConnectionId, actor: impl Into<String>) -> Result<(), RegistryError> {
        let mut inner = self.write();
        let entry = inner
            .connections
            .get_mut(&id)
            .ok_or(RegistryError::UnknownConnection(id))?;
        if entry.actor.is_some() {
            return Err(RegistryError::AlreadyIdentified(id));
        }
        entry.actor = Some(actor.into());
        Ok(())
    }

    pub fn actor(&self, id: ConnectionId) -> Option<String> {
        self.read().connections.get(&id).and_then(|c| c.actor.clone())
    }

    pub fn is_connected(&self, id: ConnectionId) -> bool {
        self.read().connections.contains_key(&id)
    }

    /// Add a connection to a room. Returns `true` if it was not already a member.
    pub fn join(&self, id: ConnectionId, entity_id: &str) -> Result<bool, RegistryError> {
        let mut inner = self.write();
        let entry = inner
            .connections
            .get_mut(&id)
            .ok_or(RegistryError::UnknownConnection(id))?;
        if !entry.rooms.insert(entity_id.to_owned()) {
            return Ok(false);
        }
        inner.rooms.entry(entity_id.to_owned()).or_default().insert(id);
        Ok(true)
    }

    /// Add a connection to a room and queue `initial()` for it while no
    /// broadcast to the room can run. Anything broadcast afterwards lands
    /// behind it in the outbox; anything broadcast before is reflected in
    /// whatever `initial` reads. `initial` is queued even for an existing
    /// member. Returns `true` if the connection was not already a member.
    pub fn join_with<F>(&self, id: ConnectionId, entity_id: &str, initial: F) -> Result<bool, RegistryError>
    where
        F: FnOnce() -> ServerMessage,
    {
        let mut inner = self.write();
        let entry = inner
            .connections
            .get_mut(&id)
            .ok_or(RegistryError::UnknownConnection(id))?;
        let joined = entry.rooms.insert(entity_id.to_owned());
        if joined {
            inner.rooms.entry(entity_id.to_owned()).or_default().insert(id);
        }
        if let Some(entry) = inner.connections.get(&id) {
            self.push_encoded(id, entry, &initial(), Some(entity_id));
        }
        Ok(joined)
    }

    /// Unicast `build()` to a connection with broadcasts held off, so no
    /// room delta can overtake it. Returns whether it was queued.
    pub fn send_exclusive<F>(&self, id: ConnectionId, entity_id: &str, build: F) -> bool
    where
        F: FnOnce() -> ServerMessage,
    {
        let inner = self.write();
        match inner.connections.get(&id) {
            Some(entry) => self.push_encoded(id, entry, &build(), Some(entity_id)),
            None => false,
        }
    }

    /// Unicast a message about `entity_id`; if it is dropped, the
    /// connection is marked lagged for that entity.
    pub fn send_for(&self, id: ConnectionId, entity_id: &str, msg: &ServerMessage) -> Result<bool, ProtocolError> {
        let encoded: Outgoing = Arc::new(msg.encode()?);
        let inner = self.read();
        Ok(match inner.connections.get(&id) {
            Some(entry) => self.push(id, entry, encoded, Some(entity_id)),
            None => false,
        })
    }

    /// Rooms this connection missed messages for since the last call.
    pub fn take_lagged(&self, id: ConnectionId) -> Vec<String> {
        let inner = self.read();
        let Some(entry) = inner.connections.get(&id) else {
            return Vec::new();
        };
        if !entry.lagging.swap(false, Ordering::AcqRel) {
            return Vec::new();
        }
        let mut lagged = entry.lagged.lock().unwrap_or_else(PoisonError::into_inner);
        lagged.drain().collect()
    }

    pub fn is_lagging(&self, id: ConnectionId) -> bool {
        self.read()
            .connections
            .get(&id)
            .is_some_and(|c| c.lagging.load(Ordering::Acquire))
    }

    /// Remove a connection from a room. Returns `true` if it was a member.
    pub fn leave(&self, id: ConnectionId, entity_id: &str) -> Result<bool, RegistryError> {
        let mut inner = self.write();
        let entry = inner
            .connections
            .get_mut(&id)
            .ok_or(RegistryError::UnknownConnection(id))?;
        if !entry.rooms.remove(entity_id) {
            return Ok(false);
        }
        remove_member(&mut inner.rooms, entity_id, id);
        Ok(true)
    }

    /// Drop a connection and all of its memberships. Returns the rooms it
    /// was in; unknown ids yield an empty list.
    pub fn on_disconnect(&self, id: ConnectionId) -> Vec<String> {
        let mut inner = self.write();
        let Some(entry) = inner.connections.remove(&id) else {
            return Vec::new();
        };
        let rooms: Vec<String> = entry.rooms.into_iter().collect();
        for entity_id in &rooms {
            remove_member(&mut inner.rooms, entity_id, id);
        }
        rooms
    }

    /// Send `msg` to every member of the room except `exclude`.
    ///
    /// Returns the number of outboxes that accepted the message.
    pub fn broadcast(
        &self,
        entity_id: &str,
        msg: &ServerMessage,
        exclude: Option<ConnectionId>,
    ) -> Result<usize, ProtocolError> {
        let encoded: Outgoing = Arc::new(msg.encode()?);
        Ok(self.broadcast_raw(entity_id, encoded, exclude))
    }

    /// Fan out pre-encoded bytes.
    pub fn broadcast_raw(
        &self,
        entity_id: &str,
        encoded: Outgoing,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let inner = self.read();
        let Some(members) = inner.rooms.get(entity_id) else {
            return 0;
        };
        let mut delivered = 0;
        for member in members.iter().filter(|m| Some(**m) != exclude) {
            if let Some(entry) = inner.connections.get(member) {
                if self.push(*member, entry, encoded.clone(), Some(entity_id)) {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Unicast to one connection. `Ok(false)` if it is gone or its outbox is full.
    pub fn send_to(&self, id: ConnectionId, msg: &ServerMessage) -> Result<bool, ProtocolError> {
        let encoded: Outgoing = Arc::new(msg.encode()?);
        let inner = self.read();
        Ok(match inner.connections.get(&id) {
            Some(entry) => self.push(id, entry, encoded, None),
            None => false,
        })
    }

    pub fn members(&self, entity_id: &str) -> Vec<ConnectionId> {
        self.read()
            .rooms
            .get(entity_id)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_member(&self, id: ConnectionId, entity_id: &str) -> bool {
        self.read()
            .rooms
            .get(entity_id)
            .is_some_and(|m| m.contains(&id))
    }

    pub fn rooms_of(&self, id: ConnectionId) -> Vec<String> {
        self.read()
            .connections
            .get(&id)
            .map(|c| c.rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        self.read().connections.len()
    }

    pub fn room_count(&self) -> usize {
        self.read().rooms.len()
    }

    /// Get broadcast statistics (lock-free counters plus current sizes).
    pub fn stats(&self) -> BroadcastStats {
        let inner = self.read();
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_connections: inner.connections.len(),
            active_rooms: inner.rooms.len(),
        }
    }

    fn push_encoded(
        &self,
        id: ConnectionId,
        entry: &ConnectionEntry,
        msg: &ServerMessage,
        room: Option<&str>,
    ) -> bool {
        match msg.encode() {
            Ok(encoded) => self.push(id, entry, Arc::new(encoded), room),
            Err(e) => {
                log::error!("Failed to encode message for {id}: {e}");
                false
            }
        }
    }

    fn push(&self, id: ConnectionId, entry: &ConnectionEntry, encoded: Outgoing, room: Option<&str>) -> bool {
        match entry.outbox.try_send(encoded) {
            Ok(()) => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                match room {
                    Some(entity_id) => {
                        entry.mark_lagged(entity_id);
                        log::warn!("Outbox full for connection {id}; {entity_id} will be re-sent");
                    }
                    None => log::warn!("Outbox full for connection {id}; message dropped"),
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::debug!("Outbox closed for connection {id}");
                false
            }
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn remove_member(rooms: &mut HashMap<String, HashSet<ConnectionId>>, entity_id: &str, id: ConnectionId) {
    if let Some(members) = rooms.get_mut(entity_id) {
        members.remove(&id);
        if members.is_empty() {
            rooms.remove(entity_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::Receiver<Outgoing>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(bytes) = rx.try_recv() {
            out.push(ServerMessage::decode(&bytes).unwrap());
        }
        out
    }

    #[test]
    fn test_join_leave() {
        let registry = ConnectionRegistry::new();
        let (a, _rx) = registry.register(16);

        assert!(registry.join(a, "board-1").unwrap());
        assert!(!registry.join(a, "board-1").unwrap());
        assert!(registry.is_member(a, "board-1"));
        assert_eq!(registry.room_count(), 1);

        assert!(registry.leave(a, "board-1").unwrap());
        assert!(!registry.leave(a, "board-1").unwrap());
        assert!(!registry.is_member(a, "board-1"));
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn test_multiple_rooms_and_disconnect() {
        let registry = ConnectionRegistry::new();
        let (a, _rx) = registry.register(16);
        registry.join(a, "board-1").unwrap();
        registry.join(a, "board-2").unwrap();

        let mut rooms = registry.on_disconnect(a);
        rooms.sort();
        assert_eq!(rooms, vec!["board-1".to_string(), "board-2".to_string()]);
        assert_eq!(registry.room_count(), 0);
        assert!(!registry.is_connected(a));
        assert!(registry.on_disconnect(a).is_empty());
    }

    #[test]
    fn test_join_after_disconnect_fails() {
        let registry = ConnectionRegistry::new();
        let (a, _rx) = registry.register(16);
        registry.on_disconnect(a);
        assert_eq!(registry.join(a, "board-1"), Err(RegistryError::UnknownConnection(a)));
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn test_broadcast_excludes_sender() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx_a) = registry.register(16);
        let (b, mut rx_b) = registry.register(16);
        let (c, mut rx_c) = registry.register(16);
        registry.join(a, "board-1").unwrap();
        registry.join(b, "board-1").unwrap();
        registry.join(c, "board-2").unwrap();

        let sent = registry.broadcast("board-1", &ServerMessage::Pong, Some(a)).unwrap();
        assert_eq!(sent, 1);
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(drain(&mut rx_b), vec![ServerMessage::Pong]);
        assert!(drain(&mut rx_c).is_empty());
    }

    #[test]
    fn test_broadcast_without_exclusion_reaches_all() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx_a) = registry.register(16);
        let (b, mut rx_b) = registry.register(16);
        registry.join(a, "board-1").unwrap();
        registry.join(b, "board-1").unwrap();

        assert_eq!(registry.broadcast("board-1", &ServerMessage::Pong, None).unwrap(), 2);
        assert_eq!(drain(&mut rx_a).len(), 1);
        assert_eq!(drain(&mut rx_b).len(), 1);
    }

    #[test]
    fn test_broadcast_unknown_room() {
        let registry = ConnectionRegistry::new();
        assert_eq!(registry.broadcast("nobody", &ServerMessage::Pong, None).unwrap(), 0);
    }

    #[test]
    fn test_full_outbox_drops_and_counts() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx) = registry.register(1);
        registry.join(a, "board-1").unwrap();

        assert_eq!(registry.broadcast("board-1", &ServerMessage::Pong, None).unwrap(), 1);
        assert_eq!(registry.broadcast("board-1", &ServerMessage::Pong, None).unwrap(), 0);

        let stats = registry.stats();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.messages_dropped, 1);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_overflow_marks_room_lagged() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx) = registry.register(1);
        registry.join(a, "board-1").unwrap();
        registry.join(a, "board-2").unwrap();

        registry.broadcast("board-1", &ServerMessage::Pong, None).unwrap();
        assert!(!registry.is_lagging(a));
        registry.broadcast("board-2", &ServerMessage::Pong, None).unwrap();
        assert!(registry.is_lagging(a));

        // Unicasts without a room are dropped without marking anything new.
        assert!(!registry.send_to(a, &ServerMessage::Pong).unwrap());

        drain(&mut rx);
        assert_eq!(registry.take_lagged(a), vec!["board-2".to_string()]);
        assert!(!registry.is_lagging(a));
        assert!(registry.take_lagged(a).is_empty());
    }

    #[test]
    fn test_send_for_marks_lagged() {
        let registry = ConnectionRegistry::new();
        let (a, _rx) = registry.register(1);
        assert!(registry.send_for(a, "board-1", &ServerMessage::Pong).unwrap());
        assert!(!registry.send_for(a, "board-1", &ServerMessage::Pong).unwrap());
        assert_eq!(registry.take_lagged(a), vec!["board-1".to_string()]);
    }

    #[test]
    fn test_join_with_queues_initial_message() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx) = registry.register(4);

        let joined = registry
            .join_with(a, "board-1", || ServerMessage::Error { message: "first".into() })
            .unwrap();
        assert!(joined);
        assert!(registry.is_member(a, "board-1"));

        // A repeated join still gets the message but is not a new member.
        let joined = registry.join_with(a, "board-1", || ServerMessage::Pong).unwrap();
        assert!(!joined);
        assert_eq!(
            drain(&mut rx),
            vec![ServerMessage::Error { message: "first".into() }, ServerMessage::Pong]
        );

        let ghost = Uuid::new_v4();
        assert_eq!(
            registry.join_with(ghost, "board-1", || ServerMessage::Pong),
            Err(RegistryError::UnknownConnection(ghost))
        );
    }

    #[test]
    fn test_send_exclusive() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx) = registry.register(4);
        assert!(registry.send_exclusive(a, "board-1", || ServerMessage::Pong));
        assert!(!registry.send_exclusive(Uuid::new_v4(), "board-1", || ServerMessage::Pong));
        assert_eq!(drain(&mut rx), vec![ServerMessage::Pong]);
    }

    #[test]
    fn test_send_to_closed_outbox() {
        let registry = ConnectionRegistry::new();
        let (a, rx) = registry.register(4);
        drop(rx);
        assert!(!registry.send_to(a, &ServerMessage::Pong).unwrap());
        assert!(!registry.send_to(Uuid::new_v4(), &ServerMessage::Pong).unwrap());
    }

    #[test]
    fn test_identify() {
        let registry = ConnectionRegistry::new();
        let (a, _rx) = registry.register(4);
        assert_eq!(registry.actor(a), None);
        registry.identify(a, "user-1").unwrap();
        assert_eq!(registry.actor(a).as_deref(), Some("user-1"));
        assert!(registry.identify(Uuid::new_v4(), "x").is_err());

        // The first identity sticks.
        assert_eq!(
            registry.identify(a, "someone-else"),
            Err(RegistryError::AlreadyIdentified(a))
        );
        assert_eq!(registry.actor(a).as_deref(), Some("user-1"));
    }

    #[test]
    fn test_concurrent_join_and_disconnect() {
        let registry = Arc::new(ConnectionRegistry::new());
        for _ in 0..50 {
            let (id, _rx) = registry.register(4);
            let r1 = registry.clone();
            let r2 = registry.clone();
            let joiner = std::thread::spawn(move || {
                for room in 0..20 {
                    let _ = r1.join(id, &format!("board-{room}"));
                }
            });
            let leaver = std::thread::spawn(move || r2.on_disconnect(id));
            joiner.join().unwrap();
            leaver.join().unwrap();
            // Whatever the interleaving, a disconnected connection is in no room.
            registry.on_disconnect(id);
            for room in 0..20 {
                assert!(!registry.is_member(id, &format!("board-{room}")));
            }
        }
        assert_eq!(registry.room_count(), 0);
    }
}
