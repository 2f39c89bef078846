//! JSON wire messages exchanged between replicas and the relay.
//!
//! Messages form a discriminated union keyed by `type`. Catch-up streams
//! are newline-delimited: a JSON header line first, then one JSON operation
//! per line. Malformed frames are logged and dropped by both sides; a
//! stream is never aborted over one bad line.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::op::{Operation, Timestamp};
use crate::store::NodeRow;

/// Room lifecycle, broadcast by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Booting,
    Ready,
    Error,
}

/// Client → relay messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Request a status + roster reply.
    #[serde(rename = "ping")]
    Ping,
    /// Submit locally-originated operations. The reply is a bare
    /// [`PushAck`] carrying the server-assigned sync timestamp.
    #[serde(rename = "push")]
    Push { operations: Vec<Operation> },
    /// Request the catch-up stream of everything past the given cursor.
    #[serde(rename = "sync:stream")]
    SyncStream {
        #[serde(rename = "lastSyncTimestamp", default)]
        last_sync_timestamp: Option<Timestamp>,
    },
    /// Request the subtree below a node, bounded by depth. The reply is a
    /// bare JSON array of `{id, parent_id}` rows.
    #[serde(rename = "subtree")]
    Subtree { id: String, depth: u32 },
}

/// Relay → client messages that are not direct replies: broadcasts and
/// stream payloads all carry a `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Room lifecycle broadcast.
    #[serde(rename = "status")]
    Status { status: RoomStatus },
    /// Roster broadcast: ids of currently connected clients.
    #[serde(rename = "connections")]
    Connections { clients: Vec<String> },
    /// Real-time delta fan-out. Operations carry their per-op
    /// `sync_timestamp`; the batch-level stamp is the pull cursor value.
    #[serde(rename = "push")]
    Push {
        operations: Vec<Operation>,
        sync_timestamp: Timestamp,
    },
}

/// Direct reply to a push: the server-assigned sync timestamp for the
/// whole batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushAck {
    pub sync_timestamp: Timestamp,
}

/// First line of a catch-up stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamHeader {
    /// The cursor the stream starts after (exclusive). Echoes the request.
    #[serde(rename = "lowerLimit")]
    pub lower_limit: Option<Timestamp>,
    /// The bound the stream stops at (inclusive), snapshotted when the
    /// request started.
    #[serde(rename = "upperLimit")]
    pub upper_limit: Option<Timestamp>,
    /// Exact number of operation lines that follow the header.
    pub operations: u64,
    /// Node count at the relay, for progress reporting.
    pub nodes: u64,
}

/// Render a catch-up chunk as newline-delimited JSON lines.
pub fn encode_stream_lines(ops: &[Operation]) -> Result<String> {
    let mut lines = String::new();
    for op in ops {
        lines.push_str(&serde_json::to_string(op)?);
        lines.push('\n');
    }
    Ok(lines)
}

/// Parse the operation lines of a catch-up chunk, skipping malformed ones.
pub fn decode_stream_lines(chunk: &str) -> Vec<Operation> {
    chunk
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(op) => Some(op),
            Err(e) => {
                log::warn!("dropping malformed stream line: {e}");
                None
            }
        })
        .collect()
}

/// Subtree reply row. Identical shape to the `nodes` table row.
pub type SubtreeRow = NodeRow;
