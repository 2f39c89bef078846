//! Core synchronization engine for Arbor thoughtspaces.
//!
//! A thoughtspace is a tree of nodes replicated across many clients over
//! unreliable networks. Tree structure is governed by a log of move
//! operations: replicas exchange operations and fold them in timestamp
//! order, so every replica that has seen the same set of operations holds
//! the same tree, without user-visible conflict resolution.
//!
//! # Architecture
//!
//! 1. **Operations** ([`op`]): total-ordered timestamps and the move/update
//!    records that are the unit of replication
//! 2. **Store** ([`store`]): SQLite-backed append-only log plus the
//!    materialized `nodes` table it folds into
//! 3. **Engine** ([`engine`]): undo/redo replay with deterministic cycle
//!    skipping
//! 4. **Protocol** ([`protocol`]) and [`hydration`]: the JSON wire union
//!    and the binary snapshot codec
//! 5. **Sync** ([`sync`]): the per-replica coordinator state machine and
//!    its WebSocket transport
//!
//! The relay (authoritative node) lives in the `arbor_relay` crate and is
//! built from these same pieces, so the canonical tables are maintained by
//! exactly the fold every replica runs.

pub mod config;
pub mod engine;
pub mod error;
pub mod hydration;
pub mod op;
pub mod protocol;
pub mod store;
pub mod sync;

pub use config::{EngineConfig, SyncConfig};
pub use engine::{ApplyOutcome, Engine};
pub use error::{ArborError, Result};
pub use op::{
    new_client_id, new_node_id, ClientId, MoveOp, NodeId, Operation, Timestamp,
    TimestampGenerator, UpdateOp, ROOT, SERVER_CLIENT_ID, TOMBSTONE,
};
pub use store::{LogStore, NodeRow};
pub use sync::{Coordinator, LiveEvent, PullStream, RelayTransport, SyncState};
