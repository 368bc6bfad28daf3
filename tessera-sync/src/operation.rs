//! Operations: immutable, timestamped write intents.
//!
//! Clients submit an [`OperationFrame`], whose required fields are all
//! optional so that a malformed submission decodes successfully and can be
//! rejected with a precise reason. Validation produces an [`Operation`],
//! which has no setters: once built it is only read, cloned and forwarded.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::error::RejectReason;
use crate::value::Value;

/// A validated write of one field of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    id: String,
    timestamp: u64,
    actor: String,
    entity_id: String,
    field: String,
    value: Value,
    related_entity: Option<String>,
}

impl Operation {
    /// Build an operation with a fresh UUID id.
    ///
    /// `timestamp` is the logical clock used for last-writer-wins; clients
    /// normally pass [`now_millis`].
    pub fn new(
        entity_id: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<Value>,
        actor: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp,
            actor: actor.into(),
            entity_id: entity_id.into(),
            field: field.into(),
            value: value.into(),
            related_entity: None,
        }
    }

    /// Replace the generated id (tests, replays).
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Attach a secondary identifier such as the card a board field belongs to.
    pub fn with_related_entity(mut self, related: impl Into<String>) -> Self {
        self.related_entity = Some(related.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn related_entity(&self) -> Option<&str> {
        self.related_entity.as_deref()
    }

    /// Convert back to the wire shape for submission.
    pub fn to_frame(&self) -> OperationFrame {
        OperationFrame {
            id: Some(self.id.clone()),
            timestamp: Some(self.timestamp),
            actor: Some(self.actor.clone()),
            entity_id: Some(self.entity_id.clone()),
            field: Some(self.field.clone()),
            value: self.value.clone(),
            related_entity: self.related_entity.clone(),
        }
    }
}

/// Untrusted operation as received from a client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationFrame {
    pub id: Option<String>,
    pub timestamp: Option<u64>,
    pub actor: Option<String>,
    pub entity_id: Option<String>,
    pub field: Option<String>,
    pub value: Value,
    pub related_entity: Option<String>,
}

impl OperationFrame {
    /// Validate into an [`Operation`], failing on the first missing or
    /// empty required field.
    pub fn validate(self) -> Result<Operation, RejectReason> {
        let id = required(self.id, "id", RejectReason::MissingId)?;
        let timestamp = self.timestamp.ok_or(RejectReason::MissingTimestamp)?;
        let actor = required(self.actor, "actor", RejectReason::MissingActor)?;
        let entity_id = required(self.entity_id, "entity_id", RejectReason::MissingEntityId)?;
        let field = required(self.field, "field", RejectReason::MissingField)?;

        Ok(Operation {
            id,
            timestamp,
            actor,
            entity_id,
            field,
            value: self.value,
            related_entity: self.related_entity.filter(|r| !r.is_empty()),
        })
    }
}

impl TryFrom<OperationFrame> for Operation {
    type Error = RejectReason;

    fn try_from(frame: OperationFrame) -> Result<Self, Self::Error> {
        frame.validate()
    }
}

fn required(
    value: Option<String>,
    name: &'static str,
    missing: RejectReason,
) -> Result<String, RejectReason> {
    match value {
        None => Err(missing),
        Some(s) if s.trim().is_empty() => Err(RejectReason::EmptyField(name.to_string())),
        Some(s) => Ok(s),
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
