//! SQLite-backed operation log store.
//!
//! Ground truth for the tree is the append-only `op_log`; the `nodes` table
//! is a materialized cache of the log fold and can be rebuilt from it. The
//! store exposes appends (idempotent on `timestamp`), ordered range reads by
//! `timestamp` and by `sync_timestamp`, parent reads/writes, and a
//! transactional scope so an engine batch commits or rolls back as a unit.
//!
//! # Thread Safety
//!
//! The connection is wrapped in a `Mutex` for thread-safe access. SQLite
//! itself is used in serialized threading mode, so a replica has exactly one
//! writer at a time.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::op::{ClientId, MoveOp, NodeId, Timestamp, ROOT, TOMBSTONE};

/// One row of the materialized `nodes` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRow {
    pub id: NodeId,
    pub parent_id: Option<NodeId>,
}

/// Schema for a replica database. Applied idempotently at open.
///
/// `op_log.timestamp` is the primary key, which doubles as the index that
/// makes the replay range scan cheap.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS nodes (
    id TEXT PRIMARY KEY,
    parent_id TEXT
);

CREATE TABLE IF NOT EXISTS op_log (
    timestamp TEXT PRIMARY KEY,
    node_id TEXT NOT NULL,
    old_parent_id TEXT,
    new_parent_id TEXT NOT NULL,
    client_id TEXT NOT NULL,
    sync_timestamp TEXT,
    last_sync_timestamp TEXT
);

-- Node-content register, outside the tree core.
CREATE TABLE IF NOT EXISTS payloads (
    node_id TEXT PRIMARY KEY,
    content TEXT,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS clients (
    id TEXT PRIMARY KEY,
    last_seen INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_nodes_parent ON nodes(parent_id);
CREATE INDEX IF NOT EXISTS idx_op_log_sync ON op_log(sync_timestamp);
CREATE INDEX IF NOT EXISTS idx_op_log_node ON op_log(node_id);

INSERT OR IGNORE INTO nodes (id, parent_id) VALUES ('ROOT', NULL);
INSERT OR IGNORE INTO nodes (id, parent_id) VALUES ('TOMBSTONE', NULL);
"#;

/// SQLite-backed log + materialized tree for one replica (or for the
/// relay's canonical copy of one thoughtspace).
pub struct LogStore {
    conn: Mutex<Connection>,
}

impl LogStore {
    /// Open or create a replica database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory store. Data is lost when dropped.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Run `f` inside a single transaction over the log and `nodes`.
    ///
    /// All mutations observe all-or-nothing semantics: an error from `f`
    /// rolls everything back and aborts the enclosing batch.
    pub fn transaction<T>(&self, f: impl FnOnce(&StoreTx<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let out = f(&StoreTx { conn: &tx })?;
        tx.commit()?;
        Ok(out)
    }

    /// Current parent of a node. Outer `None` means the node row does not
    /// exist; inner `None` is a null parent (the reserved roots).
    pub fn parent_of(&self, id: &str) -> Result<Option<Option<NodeId>>> {
        let conn = self.conn.lock().unwrap();
        parent_of(&conn, id)
    }

    /// All log entries in ascending `timestamp` order.
    pub fn all_ops(&self) -> Result<Vec<MoveOp>> {
        let conn = self.conn.lock().unwrap();
        query_ops(
            &conn,
            "SELECT timestamp, node_id, old_parent_id, new_parent_id, client_id,
                    sync_timestamp, last_sync_timestamp
             FROM op_log ORDER BY timestamp ASC",
            params![],
        )
    }

    /// Locally-originated entries not yet acknowledged by the relay.
    pub fn unsynced_ops(&self, client_id: &str) -> Result<Vec<MoveOp>> {
        let conn = self.conn.lock().unwrap();
        query_ops(
            &conn,
            "SELECT timestamp, node_id, old_parent_id, new_parent_id, client_id,
                    sync_timestamp, last_sync_timestamp
             FROM op_log
             WHERE sync_timestamp IS NULL AND client_id = ?1
             ORDER BY timestamp ASC",
            params![client_id],
        )
    }

    /// Acknowledge pushed entries: set `sync_timestamp` where still null.
    /// Null → non-null exactly once; re-acknowledging is a no-op.
    pub fn mark_synced(&self, timestamps: &[Timestamp], sync_ts: &Timestamp) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut changed = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE op_log SET sync_timestamp = ?1
                 WHERE timestamp = ?2 AND sync_timestamp IS NULL",
            )?;
            for ts in timestamps {
                changed += stmt.execute(params![sync_ts.as_str(), ts.as_str()])?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    /// Greatest operation timestamp in the log, if any.
    pub fn max_timestamp(&self) -> Result<Option<Timestamp>> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> = conn
            .query_row("SELECT MAX(timestamp) FROM op_log", params![], |row| {
                row.get(0)
            })
            .optional()?
            .flatten();
        raw.map(|s| Timestamp::parse(&s)).transpose()
    }

    /// The pull cursor: greatest `sync_timestamp` observed, optionally
    /// ignoring entries originated by `excluding_client`.
    pub fn max_sync_timestamp(&self, excluding_client: Option<&str>) -> Result<Option<Timestamp>> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> = conn
            .query_row(
                "SELECT MAX(sync_timestamp) FROM op_log
                 WHERE sync_timestamp IS NOT NULL
                   AND (?1 IS NULL OR client_id <> ?1)",
                params![excluding_client],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        raw.map(|s| Timestamp::parse(&s)).transpose()
    }

    /// One keyset page of entries ordered by `(sync_timestamp, timestamp)`,
    /// restricted to `sync_timestamp > cursor` and, when given, `<= upper`.
    pub fn sync_page(
        &self,
        cursor: Option<&Timestamp>,
        upper: Option<&Timestamp>,
        after: Option<(&Timestamp, &Timestamp)>,
        limit: usize,
    ) -> Result<Vec<MoveOp>> {
        let conn = self.conn.lock().unwrap();
        query_ops(
            &conn,
            "SELECT timestamp, node_id, old_parent_id, new_parent_id, client_id,
                    sync_timestamp, last_sync_timestamp
             FROM op_log
             WHERE sync_timestamp IS NOT NULL
               AND (?1 IS NULL OR sync_timestamp > ?1)
               AND (?2 IS NULL OR sync_timestamp <= ?2)
               AND (?3 IS NULL OR (sync_timestamp, timestamp) > (?3, ?4))
             ORDER BY sync_timestamp ASC, timestamp ASC
             LIMIT ?5",
            params![
                cursor.map(Timestamp::as_str),
                upper.map(Timestamp::as_str),
                after.map(|(s, _)| s.as_str()),
                after.map(|(_, t)| t.as_str()),
                limit as i64,
            ],
        )
    }

    /// Number of entries a catch-up stream for this range will carry.
    pub fn count_sync_range(
        &self,
        cursor: Option<&Timestamp>,
        upper: Option<&Timestamp>,
    ) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM op_log
             WHERE sync_timestamp IS NOT NULL
               AND (?1 IS NULL OR sync_timestamp > ?1)
               AND (?2 IS NULL OR sync_timestamp <= ?2)",
            params![cursor.map(Timestamp::as_str), upper.map(Timestamp::as_str)],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// One keyset page of the log by `timestamp`, for hydration dumps.
    ///
    /// With `synced_until` set, only rows whose `sync_timestamp` is at or
    /// below the bound are returned: a dump bounded this way is a
    /// consistent snapshot even while new pushes land, because later
    /// stamps are strictly greater and the client's catch-up starts below
    /// them.
    pub fn ops_page(
        &self,
        after: Option<&Timestamp>,
        synced_until: Option<&Timestamp>,
        limit: usize,
    ) -> Result<Vec<MoveOp>> {
        let conn = self.conn.lock().unwrap();
        query_ops(
            &conn,
            "SELECT timestamp, node_id, old_parent_id, new_parent_id, client_id,
                    sync_timestamp, last_sync_timestamp
             FROM op_log
             WHERE (?1 IS NULL OR timestamp > ?1)
               AND (?2 IS NULL OR (sync_timestamp IS NOT NULL AND sync_timestamp <= ?2))
             ORDER BY timestamp ASC
             LIMIT ?3",
            params![
                after.map(Timestamp::as_str),
                synced_until.map(Timestamp::as_str),
                limit as i64,
            ],
        )
    }

    /// One keyset page of `nodes` by id, for hydration dumps.
    pub fn nodes_page(&self, after: Option<&str>, limit: usize) -> Result<Vec<NodeRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, parent_id FROM nodes
             WHERE (?1 IS NULL OR id > ?1)
             ORDER BY id ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![after, limit as i64], |row| {
            Ok(NodeRow {
                id: row.get(0)?,
                parent_id: row.get(1)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Subtree of `nodes` reachable downward from `root`, up to `depth`
    /// levels below it. The root row itself is included when present.
    pub fn subtree(&self, root: &str, depth: u32) -> Result<Vec<NodeRow>> {
        let conn = self.conn.lock().unwrap();
        let mut out = Vec::new();
        let root_row: Option<NodeRow> = conn
            .query_row(
                "SELECT id, parent_id FROM nodes WHERE id = ?1",
                params![root],
                |row| {
                    Ok(NodeRow {
                        id: row.get(0)?,
                        parent_id: row.get(1)?,
                    })
                },
            )
            .optional()?;
        let Some(root_row) = root_row else {
            return Ok(out);
        };
        out.push(root_row);

        let mut stmt =
            conn.prepare("SELECT id, parent_id FROM nodes WHERE parent_id = ?1 ORDER BY id ASC")?;
        let mut frontier = vec![root.to_string()];
        for _ in 0..depth {
            let mut next = Vec::new();
            for parent in &frontier {
                let rows = stmt.query_map(params![parent], |row| {
                    Ok(NodeRow {
                        id: row.get(0)?,
                        parent_id: row.get(1)?,
                    })
                })?;
                for row in rows {
                    let row = row?;
                    next.push(row.id.clone());
                    out.push(row);
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
        Ok(out)
    }

    /// Import snapshot rows verbatim, without replay. Used by hydration.
    pub fn import_snapshot_rows(&self, nodes: &[NodeRow], ops: &[MoveOp]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut node_stmt =
                tx.prepare("INSERT OR REPLACE INTO nodes (id, parent_id) VALUES (?1, ?2)")?;
            for row in nodes {
                node_stmt.execute(params![row.id, row.parent_id])?;
            }
            let mut op_stmt = tx.prepare(
                "INSERT OR REPLACE INTO op_log
                 (timestamp, node_id, old_parent_id, new_parent_id, client_id,
                  sync_timestamp, last_sync_timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for op in ops {
                op_stmt.execute(params![
                    op.timestamp.as_str(),
                    op.node_id,
                    op.old_parent_id,
                    op.new_parent_id,
                    op.client_id,
                    op.sync_timestamp.as_ref().map(Timestamp::as_str),
                    op.last_sync_timestamp.as_ref().map(Timestamp::as_str),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// The whole materialized tree as a map, for integrity comparison.
    pub fn nodes_map(&self) -> Result<HashMap<NodeId, Option<NodeId>>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id, parent_id FROM nodes")?;
        let rows = stmt.query_map(params![], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })?;
        let mut out = HashMap::new();
        for row in rows {
            let (id, parent) = row?;
            out.insert(id, parent);
        }
        Ok(out)
    }

    /// Replace the materialized tree wholesale. Used by rebuild-from-log.
    pub fn replace_nodes(&self, map: &HashMap<NodeId, Option<NodeId>>) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            tx.execute("DELETE FROM nodes", params![])?;
            let mut stmt = tx.prepare("INSERT INTO nodes (id, parent_id) VALUES (?1, ?2)")?;
            for (id, parent) in map {
                stmt.execute(params![id, parent])?;
            }
            // Reserved rows survive a rebuild from an empty log.
            tx.execute(
                "INSERT OR IGNORE INTO nodes (id, parent_id) VALUES (?1, NULL)",
                params![ROOT],
            )?;
            tx.execute(
                "INSERT OR IGNORE INTO nodes (id, parent_id) VALUES (?1, NULL)",
                params![TOMBSTONE],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Discard everything: log, tree, register, roster. The replica then
    /// re-enters hydration from the relay.
    pub fn reset(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "DELETE FROM op_log;
             DELETE FROM nodes;
             DELETE FROM payloads;
             DELETE FROM clients;
             INSERT OR IGNORE INTO nodes (id, parent_id) VALUES ('ROOT', NULL);
             INSERT OR IGNORE INTO nodes (id, parent_id) VALUES ('TOMBSTONE', NULL);",
        )?;
        Ok(())
    }

    pub fn node_count(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM nodes", params![], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn op_count(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM op_log", params![], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Record that a client was seen now.
    pub fn upsert_client(&self, id: &ClientId, last_seen_millis: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO clients (id, last_seen) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET last_seen = excluded.last_seen",
            params![id, last_seen_millis],
        )?;
        Ok(())
    }

    /// Content register read.
    pub fn payload_of(&self, node_id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                "SELECT content FROM payloads WHERE node_id = ?1",
                params![node_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten())
    }

    /// Latest tombstoning entry for a node, if any. Consulted by the
    /// relay's restore policy.
    pub fn latest_deletion_of(&self, node_id: &str) -> Result<Option<MoveOp>> {
        let conn = self.conn.lock().unwrap();
        let mut ops = query_ops(
            &conn,
            "SELECT timestamp, node_id, old_parent_id, new_parent_id, client_id,
                    sync_timestamp, last_sync_timestamp
             FROM op_log
             WHERE node_id = ?1 AND new_parent_id = ?2
             ORDER BY timestamp DESC
             LIMIT 1",
            params![node_id, TOMBSTONE],
        )?;
        Ok(ops.pop())
    }

    /// Whether some other client touched `node_id` after the given
    /// knowledge cutoff. Consulted by the relay's restore policy.
    pub fn op_for_node_after(
        &self,
        node_id: &str,
        cutoff: Option<&Timestamp>,
        excluding_client: &str,
    ) -> Result<Option<MoveOp>> {
        let conn = self.conn.lock().unwrap();
        let mut ops = query_ops(
            &conn,
            "SELECT timestamp, node_id, old_parent_id, new_parent_id, client_id,
                    sync_timestamp, last_sync_timestamp
             FROM op_log
             WHERE node_id = ?1
               AND client_id <> ?2
               AND (?3 IS NULL OR timestamp > ?3)
             ORDER BY timestamp DESC
             LIMIT 1",
            params![node_id, excluding_client, cutoff.map(Timestamp::as_str)],
        )?;
        Ok(ops.pop())
    }
}

/// Transactional view handed to [`LogStore::transaction`] callbacks.
pub struct StoreTx<'a> {
    conn: &'a Connection,
}

impl StoreTx<'_> {
    /// Append one entry. Returns `false` when the timestamp was already
    /// present (at-least-once delivery); in that case a relay-assigned
    /// `sync_timestamp` on the incoming copy is backfilled if ours is
    /// still null.
    pub fn append(&self, op: &MoveOp) -> Result<bool> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO op_log
             (timestamp, node_id, old_parent_id, new_parent_id, client_id,
              sync_timestamp, last_sync_timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                op.timestamp.as_str(),
                op.node_id,
                op.old_parent_id,
                op.new_parent_id,
                op.client_id,
                op.sync_timestamp.as_ref().map(Timestamp::as_str),
                op.last_sync_timestamp.as_ref().map(Timestamp::as_str),
            ],
        )?;
        if inserted == 0 {
            if let Some(sync_ts) = &op.sync_timestamp {
                self.conn.execute(
                    "UPDATE op_log SET sync_timestamp = ?1
                     WHERE timestamp = ?2 AND sync_timestamp IS NULL",
                    params![sync_ts.as_str(), op.timestamp.as_str()],
                )?;
            }
            return Ok(false);
        }
        Ok(true)
    }

    /// Log entries with `timestamp >= since`, strictly ascending, no gaps.
    pub fn ops_since(&self, since: &Timestamp) -> Result<Vec<MoveOp>> {
        query_ops(
            self.conn,
            "SELECT timestamp, node_id, old_parent_id, new_parent_id, client_id,
                    sync_timestamp, last_sync_timestamp
             FROM op_log
             WHERE timestamp >= ?1
             ORDER BY timestamp ASC",
            params![since.as_str()],
        )
    }

    /// For every node touched at or after `since`: the `old_parent_id` of
    /// its earliest such entry. This is the state the undo phase restores.
    pub fn undo_targets_since(
        &self,
        since: &Timestamp,
    ) -> Result<HashMap<NodeId, Option<NodeId>>> {
        let mut stmt = self.conn.prepare(
            "SELECT node_id, old_parent_id FROM op_log
             WHERE timestamp >= ?1
             ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map(params![since.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })?;
        let mut targets = HashMap::new();
        for row in rows {
            let (node_id, old_parent) = row?;
            targets.entry(node_id).or_insert(old_parent);
        }
        Ok(targets)
    }

    pub fn parent_of(&self, id: &str) -> Result<Option<Option<NodeId>>> {
        parent_of(self.conn, id)
    }

    /// Set a node's parent, creating the row if the node is still unknown.
    pub fn set_parent(&self, id: &str, parent: Option<&str>) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO nodes (id, parent_id) VALUES (?1, ?2)",
            params![id, parent],
        )?;
        Ok(())
    }

    /// Create a placeholder row with a null parent if the id is unknown.
    pub fn ensure_node(&self, id: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO nodes (id, parent_id) VALUES (?1, NULL)",
            params![id],
        )?;
        Ok(())
    }

    /// Last-write-wins register update, guarded by `updated_at`.
    pub fn set_payload(&self, node_id: &str, content: &str, updated_at: &Timestamp) -> Result<()> {
        self.conn.execute(
            "INSERT INTO payloads (node_id, content, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(node_id) DO UPDATE
             SET content = excluded.content, updated_at = excluded.updated_at
             WHERE excluded.updated_at > payloads.updated_at",
            params![node_id, content, updated_at.as_str()],
        )?;
        Ok(())
    }
}

fn parent_of(conn: &Connection, id: &str) -> Result<Option<Option<NodeId>>> {
    Ok(conn
        .query_row(
            "SELECT parent_id FROM nodes WHERE id = ?1",
            params![id],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()?)
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Timestamp> {
    let raw: String = row.get(idx)?;
    Timestamp::parse(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Timestamp>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        Timestamp::parse(&s).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
        })
    })
    .transpose()
}

fn op_from_row(row: &Row<'_>) -> rusqlite::Result<MoveOp> {
    Ok(MoveOp {
        timestamp: ts_col(row, 0)?,
        node_id: row.get(1)?,
        old_parent_id: row.get(2)?,
        new_parent_id: row.get(3)?,
        client_id: row.get(4)?,
        sync_timestamp: opt_ts_col(row, 5)?,
        last_sync_timestamp: opt_ts_col(row, 6)?,
    })
}

fn query_ops<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<MoveOp>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, op_from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(ts: Timestamp, node: &str, old: Option<&str>, new: &str) -> MoveOp {
        let client = ts.client_id().to_string();
        MoveOp {
            timestamp: ts,
            node_id: node.to_string(),
            old_parent_id: old.map(str::to_string),
            new_parent_id: new.to_string(),
            client_id: client,
            sync_timestamp: None,
            last_sync_timestamp: None,
        }
    }

    #[test]
    fn schema_seeds_reserved_nodes() {
        let store = LogStore::in_memory().unwrap();
        assert_eq!(store.parent_of(ROOT).unwrap(), Some(None));
        assert_eq!(store.parent_of(TOMBSTONE).unwrap(), Some(None));
        assert_eq!(store.parent_of("missing").unwrap(), None);
    }

    #[test]
    fn append_is_idempotent_on_timestamp() {
        let store = LogStore::in_memory().unwrap();
        let entry = op(Timestamp::new(1, "a"), "n1", None, ROOT);
        store
            .transaction(|tx| {
                assert!(tx.append(&entry)?);
                assert!(!tx.append(&entry)?);
                Ok(())
            })
            .unwrap();
        assert_eq!(store.op_count().unwrap(), 1);
    }

    #[test]
    fn duplicate_append_backfills_sync_timestamp() {
        let store = LogStore::in_memory().unwrap();
        let mut entry = op(Timestamp::new(1, "a"), "n1", None, ROOT);
        store.transaction(|tx| tx.append(&entry).map(|_| ())).unwrap();

        entry.sync_timestamp = Some(Timestamp::new(9, "server"));
        store.transaction(|tx| tx.append(&entry).map(|_| ())).unwrap();

        let ops = store.all_ops().unwrap();
        assert_eq!(ops[0].sync_timestamp, Some(Timestamp::new(9, "server")));
    }

    #[test]
    fn mark_synced_sets_exactly_once() {
        let store = LogStore::in_memory().unwrap();
        let entry = op(Timestamp::new(1, "a"), "n1", None, ROOT);
        store.transaction(|tx| tx.append(&entry).map(|_| ())).unwrap();

        let first = Timestamp::new(5, "server");
        let second = Timestamp::new(6, "server");
        assert_eq!(store.mark_synced(&[entry.timestamp.clone()], &first).unwrap(), 1);
        assert_eq!(store.mark_synced(&[entry.timestamp.clone()], &second).unwrap(), 0);

        let ops = store.all_ops().unwrap();
        assert_eq!(ops[0].sync_timestamp, Some(first));
    }

    #[test]
    fn ops_since_is_strictly_ascending() {
        let store = LogStore::in_memory().unwrap();
        let entries = vec![
            op(Timestamp::new(3, "a"), "n3", None, ROOT),
            op(Timestamp::new(1, "a"), "n1", None, ROOT),
            op(Timestamp::new(2, "b"), "n2", None, ROOT),
        ];
        store
            .transaction(|tx| {
                for e in &entries {
                    tx.append(e)?;
                }
                Ok(())
            })
            .unwrap();

        let read = store
            .transaction(|tx| tx.ops_since(&Timestamp::new(1, "a")))
            .unwrap();
        let stamps: Vec<i64> = read.iter().map(|o| o.timestamp.millis()).collect();
        assert_eq!(stamps, vec![1, 2, 3]);
    }

    #[test]
    fn undo_targets_keep_earliest_old_parent() {
        let store = LogStore::in_memory().unwrap();
        store
            .transaction(|tx| {
                tx.append(&op(Timestamp::new(1, "a"), "n1", Some("p1"), "p2"))?;
                tx.append(&op(Timestamp::new(2, "a"), "n1", Some("p2"), "p3"))?;
                Ok(())
            })
            .unwrap();

        let targets = store
            .transaction(|tx| tx.undo_targets_since(&Timestamp::new(1, "a")))
            .unwrap();
        assert_eq!(targets.get("n1"), Some(&Some("p1".to_string())));
    }

    #[test]
    fn sync_page_orders_by_sync_then_timestamp() {
        let store = LogStore::in_memory().unwrap();
        let s1 = Timestamp::new(10, "server");
        let s2 = Timestamp::new(20, "server");
        let mut e1 = op(Timestamp::new(2, "a"), "n1", None, ROOT);
        let mut e2 = op(Timestamp::new(1, "b"), "n2", None, ROOT);
        let mut e3 = op(Timestamp::new(3, "c"), "n3", None, ROOT);
        e1.sync_timestamp = Some(s1.clone());
        e2.sync_timestamp = Some(s1.clone());
        e3.sync_timestamp = Some(s2.clone());
        store
            .transaction(|tx| {
                for e in [&e1, &e2, &e3] {
                    tx.append(e)?;
                }
                Ok(())
            })
            .unwrap();

        let page = store.sync_page(None, None, None, 10).unwrap();
        let order: Vec<&str> = page.iter().map(|o| o.node_id.as_str()).collect();
        assert_eq!(order, vec!["n2", "n1", "n3"]);

        // Keyset continuation picks up after the last row of a page.
        let first = store.sync_page(None, None, None, 1).unwrap();
        let after = (
            first[0].sync_timestamp.as_ref().unwrap(),
            &first[0].timestamp,
        );
        let rest = store.sync_page(None, None, Some((after.0, after.1)), 10).unwrap();
        assert_eq!(rest.len(), 2);

        // The frozen upper bound excludes later stamps.
        let bounded = store.sync_page(None, Some(&s1), None, 10).unwrap();
        assert_eq!(bounded.len(), 2);
        assert_eq!(store.count_sync_range(None, Some(&s1)).unwrap(), 2);
        assert_eq!(store.count_sync_range(Some(&s1), None).unwrap(), 1);
    }

    #[test]
    fn subtree_walks_to_bounded_depth() {
        let store = LogStore::in_memory().unwrap();
        store
            .transaction(|tx| {
                tx.set_parent("a", Some(ROOT))?;
                tx.set_parent("b", Some("a"))?;
                tx.set_parent("c", Some("b"))?;
                Ok(())
            })
            .unwrap();

        let one = store.subtree("a", 1).unwrap();
        let ids: Vec<&str> = one.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let two = store.subtree("a", 2).unwrap();
        assert_eq!(two.len(), 3);

        assert!(store.subtree("missing", 3).unwrap().is_empty());
    }

    #[test]
    fn payload_register_is_last_write_wins() {
        let store = LogStore::in_memory().unwrap();
        store
            .transaction(|tx| {
                tx.set_payload("n1", "new", &Timestamp::new(5, "a"))?;
                tx.set_payload("n1", "stale", &Timestamp::new(3, "b"))?;
                Ok(())
            })
            .unwrap();
        assert_eq!(store.payload_of("n1").unwrap(), Some("new".to_string()));
    }

    #[test]
    fn snapshot_import_is_verbatim() {
        let source = LogStore::in_memory().unwrap();
        let mut entry = op(Timestamp::new(1, "a"), "n1", None, ROOT);
        entry.sync_timestamp = Some(Timestamp::new(2, "server"));
        source
            .transaction(|tx| {
                tx.append(&entry)?;
                tx.set_parent("n1", Some(ROOT))?;
                Ok(())
            })
            .unwrap();

        let target = LogStore::in_memory().unwrap();
        target
            .import_snapshot_rows(
                &source.nodes_page(None, 100).unwrap(),
                &source.ops_page(None, None, 100).unwrap(),
            )
            .unwrap();

        assert_eq!(source.nodes_map().unwrap(), target.nodes_map().unwrap());
        assert_eq!(source.all_ops().unwrap(), target.all_ops().unwrap());
    }
}
