//! Error types for the sync engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Why an operation submission was refused.
///
/// Sent back to the origin connection inside `ServerMessage::Rejected`.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RejectReason {
    #[error("operation id is missing")]
    MissingId,
    #[error("operation timestamp is missing")]
    MissingTimestamp,
    #[error("operation actor is missing")]
    MissingActor,
    #[error("operation entity id is missing")]
    MissingEntityId,
    #[error("operation field is missing")]
    MissingField,
    #[error("required field `{0}` is empty")]
    EmptyField(String),
}

impl RejectReason {
    /// Stable machine-readable code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingId => "missing_id",
            Self::MissingTimestamp => "missing_timestamp",
            Self::MissingActor => "missing_actor",
            Self::MissingEntityId => "missing_entity_id",
            Self::MissingField => "missing_field",
            Self::EmptyField(_) => "empty_field",
        }
    }
}

/// Wire encoding failures.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("connection closed")]
    ConnectionClosed,
}

/// Connection registry failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The connection was never registered or has already disconnected.
    #[error("unknown connection {0}")]
    UnknownConnection(Uuid),

    /// `Identify` was already accepted for this connection.
    #[error("connection {0} is already identified")]
    AlreadyIdentified(Uuid),
}
