//! Ephemeral presence signals: typing, cursors, online status.
//!
//! Presence never touches the state store. The server stamps the sender
//! from its own connection table and relays the signal to the room; there
//! is no ack and no persistence, and a dropped signal is simply superseded
//! by the next one.
//!
//! ```text
//! client ── Presence{entity, signal} ──► router
//!                                          │ stamp PresenceSender (server-side)
//!                                          ▼
//!                         room peers (+ sender for Status)
//! ```
//!
//! [`PresenceBoard`] is the receiving side: a per-room view of who is
//! doing what, with entries expiring after a short lifetime.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::value::Value;

/// Coarse availability of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    Offline,
}

/// Transient signal sent by a client to its room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PresenceSignal {
    /// Started or stopped typing, optionally inside a card.
    Typing {
        active: bool,
        related_entity: Option<String>,
    },

    /// Pointer position in board coordinates (high frequency).
    Cursor { x: f32, y: f32 },

    /// Availability change.
    Status(PresenceStatus),

    /// Application-defined signal.
    Custom { kind: String, payload: Value },
}

impl PresenceSignal {
    /// Whether the sender's own connection also receives the relayed signal.
    ///
    /// Status is echoed so every tab of the user shows the server-stamped
    /// status; pointer and typing signals are only meaningful to others.
    pub fn echoes_to_sender(&self) -> bool {
        matches!(self, PresenceSignal::Status(_))
    }

    pub fn kind(&self) -> &str {
        match self {
            PresenceSignal::Typing { .. } => "typing",
            PresenceSignal::Cursor { .. } => "cursor",
            PresenceSignal::Status(_) => "status",
            PresenceSignal::Custom { kind, .. } => kind.as_str(),
        }
    }
}

/// Identity attached to relayed presence, taken from the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceSender {
    /// Assigned by the server; cannot be forged.
    pub connection_id: Uuid,
    /// Self-declared with `Identify`, fixed after the first one. Display
    /// only, not authenticated.
    pub actor: Option<String>,
}

/// Last known presence of one remote connection.
#[derive(Debug, Clone)]
pub struct PeerPresence {
    pub sender: PresenceSender,
    pub status: Option<PresenceStatus>,
    pub typing: bool,
    pub typing_in: Option<String>,
    pub cursor: Option<(f32, f32)>,
    last_seen: Instant,
}

impl PeerPresence {
    fn new(sender: PresenceSender, now: Instant) -> Self {
        Self {
            sender,
            status: None,
            typing: false,
            typing_in: None,
            cursor: None,
            last_seen: now,
        }
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }
}

/// Client-side view of presence in one room.
pub struct PresenceBoard {
    entity_id: String,
    peers: HashMap<Uuid, PeerPresence>,
    /// Entries older than this are considered gone.
    ttl: Duration,
}

impl PresenceBoard {
    pub fn new(entity_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            entity_id: entity_id.into(),
            peers: HashMap::new(),
            ttl,
        }
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Record a relayed signal.
    pub fn apply(&mut self, sender: &PresenceSender, signal: &PresenceSignal) {
        self.apply_at(sender, signal, Instant::now());
    }

    pub fn apply_at(&mut self, sender: &PresenceSender, signal: &PresenceSignal, now: Instant) {
        let peer = self
            .peers
            .entry(sender.connection_id)
            .or_insert_with(|| PeerPresence::new(sender.clone(), now));
        peer.sender = sender.clone();
        peer.last_seen = now;
        match signal {
            PresenceSignal::Typing {
                active,
                related_entity,
            } => {
                peer.typing = *active;
                peer.typing_in = if *active { related_entity.clone() } else { None };
            }
            PresenceSignal::Cursor { x, y } => peer.cursor = Some((*x, *y)),
            PresenceSignal::Status(status) => peer.status = Some(*status),
            PresenceSignal::Custom { .. } => {}
        }
    }

    /// A peer joined the room.
    pub fn peer_joined(&mut self, sender: &PresenceSender) {
        let now = Instant::now();
        self.peers
            .entry(sender.connection_id)
            .or_insert_with(|| PeerPresence::new(sender.clone(), now))
            .last_seen = now;
    }

    /// A peer left or disconnected.
    pub fn peer_left(&mut self, connection_id: Uuid) {
        self.peers.remove(&connection_id);
    }

    pub fn peer(&self, connection_id: Uuid) -> Option<&PeerPresence> {
        self.peers.get(&connection_id)
    }

    /// Peers seen within the lifetime, as of `now`.
    pub fn active_at(&self, now: Instant) -> Vec<&PeerPresence> {
        self.peers
            .values()
            .filter(|p| now.saturating_duration_since(p.last_seen) <= self.ttl)
            .collect()
    }

    /// Actors currently typing.
    pub fn typing_at(&self, now: Instant) -> Vec<&PeerPresence> {
        self.active_at(now).into_iter().filter(|p| p.typing).collect()
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn prune_at(&mut self, now: Instant) -> usize {
        let before = self.peers.len();
        let ttl = self.ttl;
        self.peers
            .retain(|_, p| now.saturating_duration_since(p.last_seen) <= ttl);
        before - self.peers.len()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}
