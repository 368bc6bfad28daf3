//! Wire protocol between clients and the sync server.
//!
//! Every WebSocket binary frame carries exactly one bincode-encoded
//! message (standard config):
//!
//! ```text
//! client ──► server : ClientMessage
//! server ──► client : ServerMessage
//! ```
//!
//! | Client message   | Server reaction                                        |
//! |------------------|--------------------------------------------------------|
//! | `JoinRoom`       | add to room, `PeerJoined` to others, `Snapshot` to you |
//! | `LeaveRoom`      | remove from room, `PeerLeft` to others                 |
//! | `Submit`         | merge, fan out to peers, `Ack` or `Rejected` to you    |
//! | `RequestState`   | `Snapshot` to you                                      |
//! | `Presence`       | stamped `Presence` to peers                            |

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ProtocolError, RejectReason};
use crate::operation::{Operation, OperationFrame};
use crate::presence::{PresenceSender, PresenceSignal};
use crate::register::{MergeOutcome, Register};
use crate::store::EntityState;

/// Messages sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Declare the actor this connection speaks for (attribution only).
    Identify { actor: String },
    JoinRoom { entity_id: String },
    LeaveRoom { entity_id: String },
    Submit(OperationFrame),
    RequestState { entity_id: String },
    Presence {
        entity_id: String,
        signal: PresenceSignal,
    },
    Ping,
}

/// Receipt for a submitted operation. Confirms receipt, not acceptance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub operation_id: String,
    pub outcome: MergeOutcome,
    /// Register version after the merge.
    pub version: u64,
}

/// Refusal of a malformed operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    /// `None` when the frame carried no usable id.
    pub operation_id: Option<String>,
    pub reason: RejectReason,
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// First message on every connection.
    Welcome { connection_id: Uuid },
    /// A peer's operation, forwarded as submitted.
    Operation(Operation),
    /// Authoritative register after a merge.
    FieldUpdate {
        entity_id: String,
        field: String,
        register: Register,
    },
    Ack(Ack),
    Rejected(Rejection),
    Snapshot {
        entity_id: String,
        state: EntityState,
    },
    Presence {
        entity_id: String,
        sender: PresenceSender,
        signal: PresenceSignal,
    },
    PeerJoined {
        entity_id: String,
        sender: PresenceSender,
    },
    PeerLeft {
        entity_id: String,
        connection_id: Uuid,
    },
    /// A frame could not be decoded.
    Error { message: String },
    Pong,
}

impl ClientMessage {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(msg)
}
