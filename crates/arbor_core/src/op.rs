//! Node identifiers, operation timestamps and the operation records
//! exchanged between replicas.
//!
//! A timestamp is the operation's primary key: a zero-padded wall-clock
//! millisecond instant suffixed with the originating client id, so that the
//! lexicographic order of the encoded form is a total order across all
//! clients and equal timestamps cannot exist.

use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{ArborError, Result};

/// Opaque node identifier, assigned at creation.
pub type NodeId = String;

/// Stable identifier of an originating client.
pub type ClientId = String;

/// The tree root. Present in every replica; parent is null.
pub const ROOT: &str = "ROOT";

/// The sink for deleted subtrees. Present in every replica; parent is null.
pub const TOMBSTONE: &str = "TOMBSTONE";

/// Client id reserved for operations synthesized by the relay.
pub const SERVER_CLIENT_ID: &str = "server";

/// Number of digits in the millisecond prefix of an encoded timestamp.
const MILLIS_WIDTH: usize = 13;

/// Generate a fresh node id.
pub fn new_node_id() -> NodeId {
    uuid::Uuid::new_v4().to_string()
}

/// Generate a fresh client id.
pub fn new_client_id() -> ClientId {
    uuid::Uuid::new_v4().to_string()
}

/// Total-ordered operation identifier.
///
/// Encoded as `{millis:013}-{client_id}`. The fixed-width millisecond prefix
/// makes the encoding lexicographically sortable; the client id suffix
/// breaks ties between clients, so uniqueness only requires that each client
/// issues monotonically increasing instants (see [`TimestampGenerator`]).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timestamp(String);

impl Timestamp {
    /// Build a timestamp from a millisecond instant and a client id.
    pub fn new(millis: i64, client_id: &str) -> Self {
        Timestamp(format!("{:0width$}-{}", millis, client_id, width = MILLIS_WIDTH))
    }

    /// Parse an encoded timestamp, validating the sortable layout.
    pub fn parse(raw: &str) -> Result<Self> {
        let bytes = raw.as_bytes();
        let valid = bytes.len() > MILLIS_WIDTH + 1
            && bytes[..MILLIS_WIDTH].iter().all(u8::is_ascii_digit)
            && bytes[MILLIS_WIDTH] == b'-';
        if !valid {
            return Err(ArborError::MalformedTimestamp(raw.to_string()));
        }
        Ok(Timestamp(raw.to_string()))
    }

    /// The wall-clock millisecond prefix.
    pub fn millis(&self) -> i64 {
        self.0[..MILLIS_WIDTH].parse().unwrap_or(0)
    }

    /// The originating client id suffix.
    pub fn client_id(&self) -> &str {
        &self.0[MILLIS_WIDTH + 1..]
    }

    /// The encoded form, as persisted and sent on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Timestamp {
    type Error = ArborError;

    fn try_from(raw: String) -> Result<Self> {
        Timestamp::parse(&raw)
    }
}

impl From<Timestamp> for String {
    fn from(ts: Timestamp) -> String {
        ts.0
    }
}

/// Per-client monotonic timestamp issuance.
///
/// Never returns a value less than or equal to a previously issued or
/// observed one, even when the wall clock stalls or steps backwards.
/// `observe` folds in foreign timestamps so that a relay synthesizing
/// corrective operations can stamp them strictly after everything it has
/// already persisted.
pub struct TimestampGenerator {
    client_id: ClientId,
    last_millis: Mutex<i64>,
}

impl TimestampGenerator {
    pub fn new(client_id: impl Into<ClientId>) -> Self {
        Self {
            client_id: client_id.into(),
            last_millis: Mutex::new(0),
        }
    }

    /// The client id stamped into issued timestamps.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Issue the next timestamp for this client.
    pub fn next(&self) -> Timestamp {
        let now = chrono::Utc::now().timestamp_millis();
        let mut last = self.last_millis.lock().unwrap();
        *last = now.max(*last + 1);
        Timestamp::new(*last, &self.client_id)
    }

    /// Advance past a timestamp issued elsewhere.
    pub fn observe(&self, other: &Timestamp) {
        let mut last = self.last_millis.lock().unwrap();
        *last = (*last).max(other.millis());
    }
}

/// A tree-structure mutation: the unit of replication.
///
/// Immutable once appended to the log; the only mutable field is
/// `sync_timestamp`, set exactly once when the relay persists the operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveOp {
    /// Primary key; total order over all operations.
    pub timestamp: Timestamp,
    /// Node being moved.
    pub node_id: NodeId,
    /// Parent observed locally immediately before the operation. Null when
    /// the operation creates the node.
    pub old_parent_id: Option<NodeId>,
    /// Desired parent. [`TOMBSTONE`] denotes deletion.
    pub new_parent_id: NodeId,
    /// Originating client.
    pub client_id: ClientId,
    /// Relay-assigned stamp; null until the relay has persisted the
    /// operation. The cursor space for incremental pull.
    #[serde(default)]
    pub sync_timestamp: Option<Timestamp>,
    /// The originating client's pull cursor at creation time: its knowledge
    /// cutoff, consulted by the relay's restore policy.
    #[serde(default)]
    pub last_sync_timestamp: Option<Timestamp>,
}

impl MoveOp {
    /// Whether the operation's own target is the deleted sink.
    pub fn is_deletion(&self) -> bool {
        self.new_parent_id == TOMBSTONE
    }
}

/// Content write for the external last-write-wins register.
///
/// Co-persisted and relayed alongside move operations, but ignored by the
/// tree engine: content merging is not the tree core's concern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateOp {
    pub timestamp: Timestamp,
    pub node_id: NodeId,
    pub content: String,
}

/// Tagged operation variant exchanged on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Operation {
    Move(MoveOp),
    Update(UpdateOp),
}

impl Operation {
    pub fn timestamp(&self) -> &Timestamp {
        match self {
            Operation::Move(op) => &op.timestamp,
            Operation::Update(op) => &op.timestamp,
        }
    }

    pub fn node_id(&self) -> &str {
        match self {
            Operation::Move(op) => &op.node_id,
            Operation::Update(op) => &op.node_id,
        }
    }

    pub fn as_move(&self) -> Option<&MoveOp> {
        match self {
            Operation::Move(op) => Some(op),
            Operation::Update(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_encoding_sorts_lexicographically() {
        let a = Timestamp::new(1_700_000_000_000, "alice");
        let b = Timestamp::new(1_700_000_000_001, "alice");
        let c = Timestamp::new(1_700_000_000_001, "bob");

        assert!(a < b);
        assert!(b < c);
        assert!(a.as_str() < b.as_str());
        assert!(b.as_str() < c.as_str());
    }

    #[test]
    fn timestamp_round_trips_through_parse() {
        let ts = Timestamp::new(42, "client-7");
        let parsed = Timestamp::parse(ts.as_str()).unwrap();
        assert_eq!(parsed, ts);
        assert_eq!(parsed.millis(), 42);
        assert_eq!(parsed.client_id(), "client-7");
    }

    #[test]
    fn timestamp_rejects_malformed_input() {
        for raw in ["", "123-a", "abcdefghijklm-x", "0000000000000", "0000000000000-"] {
            assert!(Timestamp::parse(raw).is_err(), "accepted {raw:?}");
        }
    }

    #[test]
    fn generator_is_monotonic_when_clock_stalls() {
        let gen = TimestampGenerator::new("c1");
        let mut prev = gen.next();
        for _ in 0..100 {
            let next = gen.next();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn generator_advances_past_observed_timestamps() {
        let gen = TimestampGenerator::new("server");
        let far_future = Timestamp::new(9_000_000_000_000, "a");
        gen.observe(&far_future);
        assert!(gen.next() > far_future);
    }

    #[test]
    fn operation_serde_uses_kind_tag() {
        let op = Operation::Move(MoveOp {
            timestamp: Timestamp::new(1, "a"),
            node_id: "n1".into(),
            old_parent_id: None,
            new_parent_id: ROOT.into(),
            client_id: "a".into(),
            sync_timestamp: None,
            last_sync_timestamp: None,
        });
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["kind"], "move");
        assert_eq!(json["node_id"], "n1");

        let back: Operation = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn update_operation_round_trips() {
        let op = Operation::Update(UpdateOp {
            timestamp: Timestamp::new(5, "b"),
            node_id: "n2".into(),
            content: "hello".into(),
        });
        let json = serde_json::to_string(&op).unwrap();
        let back: Operation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, op);
    }
}
