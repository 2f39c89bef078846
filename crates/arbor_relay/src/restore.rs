//! Restoration of subtrees deleted without knowledge of concurrent work.
//!
//! The base move algorithm deterministically parks a deleted node together
//! with everything below it under the tombstone. When the deletion and an
//! insertion below it were concurrent, that outcome buries work the
//! deleting client never saw. After persisting a push, the relay therefore
//! checks both directions:
//!
//! - a deletion is compared against already-persisted operations inside
//!   the deleted subtree that postdate the deleter's knowledge cutoff
//!   (`last_sync_timestamp`);
//! - an operation that lands inside an already-tombstoned subtree
//!   re-examines the deletion that cut it.
//!
//! When an uninformed deletion is found, the relay synthesizes a
//! corrective move that returns the deleted node to its prior parent,
//! attributed to the reserved `server` client and stamped strictly after
//! every persisted operation. Correctives are appended, applied and
//! broadcast like any other operation; clients need no special handling.
//! Restoration walks the ancestor chain, so a restore target that is
//! itself tombstoned by another uninformed deletion is restored too.

use arbor_core::engine::Engine;
use arbor_core::store::LogStore;
use arbor_core::{
    MoveOp, Operation, Result, TimestampGenerator, ROOT, SERVER_CLIENT_ID, TOMBSTONE,
};
use tracing::debug;

/// Evaluate the policy for one applied push batch. Returns the corrective
/// operations, already persisted and applied through the engine.
///
/// Runs inside the room's single-writer region, after the batch itself has
/// been applied, so every check reads the current materialized tree.
pub fn corrections(
    engine: &Engine,
    store: &LogStore,
    clock: &TimestampGenerator,
    batch: &[MoveOp],
    max_depth: usize,
) -> Result<Vec<Operation>> {
    let mut out = Vec::new();
    for op in batch {
        if op.is_deletion() {
            // Look for persisted work inside the deleted subtree that the
            // deleter could not have known about.
            if let Some(trigger) = newest_uninformed_descendant_op(store, op, max_depth)? {
                restore_chain(engine, store, clock, &trigger.node_id, &trigger, max_depth, &mut out)?;
            }
        } else {
            // An operation landing under an existing tombstoned subtree
            // re-examines the deletion that cut it.
            restore_chain(engine, store, clock, &op.node_id, op, max_depth, &mut out)?;
        }
    }
    Ok(out)
}

/// Newest operation by another client, past the deleter's knowledge
/// cutoff, whose node currently sits inside the deleted subtree.
fn newest_uninformed_descendant_op(
    store: &LogStore,
    deletion: &MoveOp,
    max_depth: usize,
) -> Result<Option<MoveOp>> {
    let mut newest: Option<MoveOp> = None;
    for row in store.subtree(&deletion.node_id, max_depth as u32)? {
        if row.id == deletion.node_id {
            continue;
        }
        let candidate = store.op_for_node_after(
            &row.id,
            deletion.last_sync_timestamp.as_ref(),
            &deletion.client_id,
        )?;
        if let Some(candidate) = candidate {
            if newest
                .as_ref()
                .map_or(true, |best| candidate.timestamp > best.timestamp)
            {
                newest = Some(candidate);
            }
        }
    }
    Ok(newest)
}

/// Walk upward from `start`; as long as the chain passes through a node
/// parked under the tombstone by a deletion uninformed of `trigger`,
/// synthesize a corrective move restoring that node, apply it, and re-walk.
fn restore_chain(
    engine: &Engine,
    store: &LogStore,
    clock: &TimestampGenerator,
    start: &str,
    trigger: &MoveOp,
    max_depth: usize,
    out: &mut Vec<Operation>,
) -> Result<()> {
    for _ in 0..max_depth {
        let Some(victim) = lowest_tombstoned_ancestor(store, start, max_depth)? else {
            return Ok(());
        };
        let Some(deletion) = store.latest_deletion_of(&victim)? else {
            return Ok(());
        };

        let uninformed = deletion.client_id != trigger.client_id
            && deletion
                .last_sync_timestamp
                .as_ref()
                .map_or(true, |cutoff| trigger.timestamp > *cutoff);
        if !uninformed {
            return Ok(());
        }

        let restore_to = deletion
            .old_parent_id
            .clone()
            .unwrap_or_else(|| ROOT.to_string());
        let stamp = clock.next();
        let corrective = MoveOp {
            timestamp: stamp.clone(),
            node_id: victim.clone(),
            old_parent_id: Some(TOMBSTONE.to_string()),
            new_parent_id: restore_to,
            client_id: SERVER_CLIENT_ID.to_string(),
            sync_timestamp: Some(stamp.clone()),
            last_sync_timestamp: Some(stamp),
        };
        debug!(
            "restoring {} to {} (deletion {} was uninformed of {})",
            victim, corrective.new_parent_id, deletion.timestamp, trigger.timestamp
        );

        let outcome = engine.apply(std::slice::from_ref(&Operation::Move(corrective.clone())))?;
        if !outcome.skipped_cycles.is_empty() {
            // The recorded prior parent is no longer a legal target; leave
            // the subtree tombstoned rather than guess a new home.
            return Ok(());
        }
        out.push(Operation::Move(corrective));
        // The restore target may itself sit under another uninformed
        // deletion; the next iteration re-walks the chain.
    }
    Ok(())
}

/// The node closest to `start` (inclusive) whose current parent is the
/// tombstone, following the ancestor chain at most `max_depth` steps.
fn lowest_tombstoned_ancestor(
    store: &LogStore,
    start: &str,
    max_depth: usize,
) -> Result<Option<String>> {
    let mut current = start.to_string();
    for _ in 0..=max_depth {
        match store.parent_of(&current)?.flatten() {
            None => return Ok(None),
            Some(parent) if parent == TOMBSTONE => return Ok(Some(current)),
            Some(parent) => current = parent,
        }
    }
    Ok(None)
}
