//! Log-driven move engine.
//!
//! Applying a batch inserts the new entries into the log, undoes the
//! materialized tree back to the earliest inserted timestamp and re-applies
//! every logged entry from that point in timestamp order, skipping any move
//! that would create a cycle. Replay is a pure fold of the log, so the final
//! state depends only on the set of operations, never on arrival order.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::error::{ArborError, Result};
use crate::op::{MoveOp, NodeId, Operation, Timestamp, ROOT, TOMBSTONE};
use crate::store::{LogStore, StoreTx};

/// What an apply batch did, for broadcast decisions and tests.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    /// Timestamps of entries newly inserted into the log (duplicates are
    /// absent: they were already reflected in materialized state).
    pub inserted: Vec<Timestamp>,
    /// Entries whose move was skipped during this replay because it would
    /// have created a cycle. They stay in the log and may take effect on a
    /// later replay if the ancestor chain changes.
    pub skipped_cycles: Vec<Timestamp>,
}

/// The CRDT engine for one replica.
///
/// Invocations are serialized by the store's single connection; a batch is
/// fully transactional and never exposes partial state.
pub struct Engine {
    store: Arc<LogStore>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(store: Arc<LogStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<LogStore> {
        &self.store
    }

    /// Apply a batch of incoming operations to the local replica.
    ///
    /// Non-move rows are routed to the content register and otherwise
    /// ignored by the tree fold. Duplicate timestamps are tolerated
    /// (at-least-once delivery); cycle-inducing moves are skipped, not
    /// errors. Only store-level failures surface.
    pub fn apply(&self, batch: &[Operation]) -> Result<ApplyOutcome> {
        if batch.is_empty() {
            return Ok(ApplyOutcome::default());
        }
        self.store.transaction(|tx| {
            let mut outcome = ApplyOutcome::default();
            let mut t_min: Option<Timestamp> = None;

            for operation in batch {
                match operation {
                    Operation::Move(op) => {
                        if tx.append(op)? {
                            if t_min.as_ref().map_or(true, |m| op.timestamp < *m) {
                                t_min = Some(op.timestamp.clone());
                            }
                            outcome.inserted.push(op.timestamp.clone());
                        }
                    }
                    Operation::Update(op) => {
                        tx.set_payload(&op.node_id, &op.content, &op.timestamp)?;
                    }
                }
            }

            // Nothing new in the log means the materialized tree already
            // reflects every entry; skip the replay entirely.
            let Some(t_min) = t_min else {
                return Ok(outcome);
            };

            self.undo_since(tx, &t_min)?;
            outcome.skipped_cycles = self.redo_since(tx, &t_min)?;
            Ok(outcome)
        })
    }

    /// Undo phase: restore every node touched at or after `t_min` to the
    /// parent recorded by its earliest such entry.
    fn undo_since(&self, tx: &StoreTx<'_>, t_min: &Timestamp) -> Result<()> {
        for (node_id, old_parent) in tx.undo_targets_since(t_min)? {
            if let Some(parent) = old_parent.as_deref() {
                tx.ensure_node(parent)?;
            }
            tx.set_parent(&node_id, old_parent.as_deref())?;
        }
        Ok(())
    }

    /// Redo phase: re-apply all log entries from `t_min` in timestamp
    /// order, skipping cycle-inducing moves. Returns the skipped stamps.
    fn redo_since(&self, tx: &StoreTx<'_>, t_min: &Timestamp) -> Result<Vec<Timestamp>> {
        let mut skipped = Vec::new();
        for op in tx.ops_since(t_min)? {
            tx.ensure_node(&op.node_id)?;
            tx.ensure_node(&op.new_parent_id)?;
            if self.walk_detects_cycle(&op, |id| tx.parent_of(id))? {
                log::debug!(
                    "skipping cycle-inducing move of {} under {} at {}",
                    op.node_id,
                    op.new_parent_id,
                    op.timestamp
                );
                skipped.push(op.timestamp);
                continue;
            }
            tx.set_parent(&op.node_id, Some(&op.new_parent_id))?;
        }
        Ok(skipped)
    }

    /// Walk the ancestor chain of the move's target parent. The move is a
    /// cycle if the moved node appears in that chain. The walk is bounded:
    /// a chain deeper than the configured safety depth is treated as a
    /// cycle, which keeps the decision deterministic on every replica.
    fn walk_detects_cycle(
        &self,
        op: &MoveOp,
        parent_of: impl Fn(&str) -> Result<Option<Option<NodeId>>>,
    ) -> Result<bool> {
        let mut current = Some(op.new_parent_id.clone());
        for _ in 0..=self.config.max_ancestor_walk_depth {
            let Some(id) = current else {
                return Ok(false);
            };
            if id == op.node_id {
                return Ok(true);
            }
            current = parent_of(&id)?.flatten();
        }
        Ok(true)
    }

    /// Fold the entire log from an empty tree, in memory.
    ///
    /// This is the reference semantics for the materialized `nodes` table:
    /// rebuilding from the log must reproduce it exactly.
    pub fn fold_log(&self) -> Result<HashMap<NodeId, Option<NodeId>>> {
        let mut map: HashMap<NodeId, Option<NodeId>> = HashMap::new();
        map.insert(ROOT.to_string(), None);
        map.insert(TOMBSTONE.to_string(), None);

        let ops = self.store.all_ops()?;

        // Mirror the undo phase over an empty tree: every node starts at
        // the old parent its earliest entry recorded, so a skipped move
        // leaves the same parent here as in the incremental path.
        let mut earliest: HashMap<&str, &Option<NodeId>> = HashMap::new();
        for op in &ops {
            earliest.entry(op.node_id.as_str()).or_insert(&op.old_parent_id);
        }
        for (node, old_parent) in earliest {
            if let Some(parent) = old_parent.as_deref() {
                map.entry(parent.to_string()).or_insert(None);
            }
            map.insert(node.to_string(), old_parent.clone());
        }

        // Redo: replay every entry in timestamp order with the cycle walk.
        for op in &ops {
            map.entry(op.node_id.clone()).or_insert(None);
            map.entry(op.new_parent_id.clone()).or_insert(None);
            let cycle = self.walk_detects_cycle(op, |id| Ok(map.get(id).cloned()))?;
            if !cycle {
                map.insert(op.node_id.clone(), Some(op.new_parent_id.clone()));
            }
        }
        Ok(map)
    }

    /// Compare the materialized table against a fresh fold of the log.
    pub fn verify_integrity(&self) -> Result<bool> {
        Ok(self.store.nodes_map()? == self.fold_log()?)
    }

    /// Rebuild the materialized table from the log. Startup recovery for
    /// torn writes; also the remedy for a failed integrity check.
    pub fn rebuild_nodes(&self) -> Result<()> {
        let folded = self.fold_log()?;
        self.store.replace_nodes(&folded)
    }

    /// Startup integrity gate: rebuild when the cached tree disagrees with
    /// the log, and fail only if the rebuild itself cannot restore
    /// agreement.
    pub fn check_or_rebuild(&self) -> Result<()> {
        if self.verify_integrity()? {
            return Ok(());
        }
        log::warn!("materialized nodes table disagrees with log replay, rebuilding");
        self.rebuild_nodes()?;
        if self.verify_integrity()? {
            Ok(())
        } else {
            Err(ArborError::Integrity(
                "nodes table still diverges after rebuild from log".into(),
            ))
        }
    }
}
