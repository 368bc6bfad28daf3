//! # tessera-sync — Real-time state synchronization for shared boards
//!
//! Keeps per-field state of shared entities consistent across many
//! concurrently connected clients using last-writer-wins registers.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │   bincode frames    │ (central)   │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                    ┌───────┴────────┐
//!                                    │ OperationRouter│
//!                                    └───┬────────┬───┘
//!                                        │        │
//!                              ┌─────────┴──┐  ┌──┴─────────────────┐
//!                              │ StateStore │  │ ConnectionRegistry │
//!                              │ (LWW regs) │  │ (rooms, fan-out)   │
//!                              └────────────┘  └────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`register`] — LWW merge of one operation into one register
//! - [`store`] — Concurrent entity → field → register map
//! - [`router`] — Validate, merge, fan out, acknowledge
//! - [`rooms`] — Connection registry and room broadcast with bounded outboxes
//! - [`presence`] — Typing, cursor and status signals
//! - [`protocol`] — Binary wire protocol (bincode-encoded messages)
//! - [`server`] — WebSocket sync server
//! - [`client`] — WebSocket sync client
//!
//! ## Guarantees
//!
//! | Property | How |
//! |----------|-----|
//! | Convergence | Same operations in any order give the same registers, given distinct timestamps |
//! | Monotonic versions | A register's version increases by one per accepted write |
//! | Field isolation | Merges lock a single field |
//! | Per-connection order | Each connection's frames are dispatched in arrival order |

pub mod value;
pub mod operation;
pub mod register;
pub mod store;
pub mod rooms;
pub mod presence;
pub mod protocol;
pub mod router;
pub mod config;
pub mod error;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use value::Value;
pub use operation::{now_millis, Operation, OperationFrame};
pub use register::{merge, Merge, MergeOutcome, Register};
pub use store::{EntityState, StateStore};
pub use rooms::{BroadcastStats, ConnectionId, ConnectionRegistry};
pub use presence::{PeerPresence, PresenceBoard, PresenceSender, PresenceSignal, PresenceStatus};
pub use protocol::{Ack, ClientMessage, Rejection, ServerMessage};
pub use router::{OperationRouter, RouterStats};
pub use config::{FanOut, ServerConfig, StoreConfig, SyncConfig};
pub use error::{ProtocolError, RegistryError, RejectReason};
pub use server::{ServerStats, SyncServer};
pub use client::{ConnectionState, SyncClient};
