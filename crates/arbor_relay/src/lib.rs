//! Authoritative relay for Arbor thoughtspaces.
//!
//! One room per thoughtspace owns the canonical operation log and
//! materialized tree, stamps incoming pushes with sync timestamps,
//! evaluates the deletion/restore policy, fans deltas out to connected
//! peers, and serves catch-up and hydration streams.

pub mod config;
pub mod connection;
pub mod handlers;
pub mod restore;
pub mod room;

pub use config::{Config, UpperLimitPolicy};
pub use handlers::{hydrate_handler, ws_handler, AppState};
pub use room::{RelayState, Room, RoomEvent};
