//! Last-writer-wins registers and the conflict resolver.
//!
//! ```text
//!   incoming op ──► merge(current, op)
//!                      │
//!          ┌───────────┼──────────────────────┐
//!          ▼           ▼                      ▼
//!     no register   op.ts > last_updated_at   op.ts <= last_updated_at
//!     version = 1   version + 1 (Accepted)    unchanged (Discarded)
//! ```
//!
//! Ties keep the existing register, so on equal timestamps the first
//! operation to reach the store wins.

use serde::{Deserialize, Serialize};

use crate::operation::Operation;
use crate::value::Value;

/// Resolved state of one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Register {
    pub value: Value,
    /// Bumped by exactly one per accepted write.
    pub version: u64,
    pub last_updated_by: String,
    /// Timestamp of the accepted write; the merge key for later writes.
    pub last_updated_at: u64,
}

impl Register {
    fn from_operation(op: &Operation, version: u64) -> Self {
        Self {
            value: op.value().clone(),
            version,
            last_updated_by: op.actor().to_owned(),
            last_updated_at: op.timestamp(),
        }
    }
}

/// Whether a merge changed the register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeOutcome {
    Accepted,
    Discarded,
}

impl MergeOutcome {
    pub fn is_accepted(self) -> bool {
        self == MergeOutcome::Accepted
    }
}

/// Result of merging one operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Merge {
    pub register: Register,
    pub outcome: MergeOutcome,
}

/// Merge `incoming` into `current`.
///
/// Pure and payload-agnostic: only `timestamp` and `actor` are read from the
/// operation besides the value being moved.
pub fn merge(current: Option<&Register>, incoming: &Operation) -> Merge {
    match current {
        None => Merge {
            register: Register::from_operation(incoming, 1),
            outcome: MergeOutcome::Accepted,
        },
        Some(existing) if incoming.timestamp() > existing.last_updated_at => Merge {
            register: Register::from_operation(incoming, existing.version + 1),
            outcome: MergeOutcome::Accepted,
        },
        Some(existing) => Merge {
            register: existing.clone(),
            outcome: MergeOutcome::Discarded,
        },
    }
}
