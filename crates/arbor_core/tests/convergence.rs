//! Convergence laws for the move engine.
//!
//! The properties here hold for any delivery schedule: replicas that have
//! seen the same set of operations hold identical trees, duplicate
//! delivery changes nothing, and the materialized table always equals a
//! fresh fold of the log.

use std::collections::HashMap;
use std::sync::Arc;

use arbor_core::{
    Engine, EngineConfig, LogStore, MoveOp, NodeId, Operation, Timestamp, ROOT, TOMBSTONE,
};

fn mv(millis: i64, client: &str, node: &str, old: Option<&str>, new: &str) -> Operation {
    Operation::Move(MoveOp {
        timestamp: Timestamp::new(millis, client),
        node_id: node.to_string(),
        old_parent_id: old.map(str::to_string),
        new_parent_id: new.to_string(),
        client_id: client.to_string(),
        sync_timestamp: None,
        last_sync_timestamp: None,
    })
}

fn fresh_engine() -> Engine {
    Engine::new(
        Arc::new(LogStore::in_memory().unwrap()),
        EngineConfig::default(),
    )
}

fn tree(engine: &Engine) -> HashMap<NodeId, Option<NodeId>> {
    engine.store().nodes_map().unwrap()
}

/// A workload with creates, reparents, a deletion and a cycle attempt.
fn workload() -> Vec<Operation> {
    vec![
        mv(1, "a", "A", None, ROOT),
        mv(2, "a", "B", None, "A"),
        mv(3, "b", "C", None, "B"),
        mv(4, "b", "B", Some("A"), "C"), // cycle attempt: skipped on replay
        mv(5, "a", "C", Some("B"), "A"),
        mv(6, "b", "A", Some(ROOT), TOMBSTONE),
    ]
}

fn permutations<T: Clone>(items: &[T]) -> Vec<Vec<T>> {
    if items.len() <= 1 {
        return vec![items.to_vec()];
    }
    let mut out = Vec::new();
    for (i, item) in items.iter().enumerate() {
        let mut rest = items.to_vec();
        rest.remove(i);
        for mut tail in permutations(&rest) {
            tail.insert(0, item.clone());
            out.push(tail);
        }
    }
    out
}

#[test]
fn any_delivery_order_converges_to_the_same_tree() {
    let ops = workload();

    let reference = fresh_engine();
    reference.apply(&ops).unwrap();
    let expected = tree(&reference);

    for order in permutations(&ops) {
        let replica = fresh_engine();
        for op in &order {
            replica.apply(std::slice::from_ref(op)).unwrap();
        }
        assert_eq!(
            tree(&replica),
            expected,
            "diverged for order {:?}",
            order.iter().map(|o| o.timestamp().to_string()).collect::<Vec<_>>()
        );
    }
}

#[test]
fn applying_a_batch_twice_equals_applying_it_once() {
    let ops = workload();

    let once = fresh_engine();
    once.apply(&ops).unwrap();

    let twice = fresh_engine();
    twice.apply(&ops).unwrap();
    let outcome = twice.apply(&ops).unwrap();

    assert!(outcome.inserted.is_empty());
    assert_eq!(tree(&once), tree(&twice));
    assert_eq!(
        once.store().all_ops().unwrap(),
        twice.store().all_ops().unwrap()
    );
}

#[test]
fn partitioned_batches_commute() {
    let ops = workload();
    let (b1, b2) = ops.split_at(3);

    let whole = fresh_engine();
    whole.apply(&ops).unwrap();

    let forward = fresh_engine();
    forward.apply(b1).unwrap();
    forward.apply(b2).unwrap();

    let backward = fresh_engine();
    backward.apply(b2).unwrap();
    backward.apply(b1).unwrap();

    assert_eq!(tree(&whole), tree(&forward));
    assert_eq!(tree(&whole), tree(&backward));
}

#[test]
fn overlapping_batches_are_harmless() {
    let ops = workload();

    let reference = fresh_engine();
    reference.apply(&ops).unwrap();

    // Batches share operations: at-least-once delivery.
    let replica = fresh_engine();
    replica.apply(&ops[..4]).unwrap();
    replica.apply(&ops[2..]).unwrap();

    assert_eq!(tree(&reference), tree(&replica));
}

#[test]
fn materialized_table_always_equals_the_log_fold() {
    let replica = fresh_engine();
    for op in workload() {
        replica.apply(&[op]).unwrap();
        assert_eq!(replica.fold_log().unwrap(), tree(&replica));
    }
}

#[test]
fn live_tree_never_contains_a_cycle() {
    let replica = fresh_engine();
    replica.apply(&workload()).unwrap();

    let nodes = tree(&replica);
    for start in nodes.keys() {
        let mut seen = vec![start.clone()];
        let mut current = nodes.get(start).cloned().flatten();
        while let Some(id) = current {
            assert!(!seen.contains(&id), "cycle through {id}");
            seen.push(id.clone());
            current = nodes.get(&id).cloned().flatten();
        }
    }
}

#[test]
fn concurrent_moves_of_one_node_pick_the_later_writer_everywhere() {
    let setup = vec![
        mv(1, "a", "P1", None, ROOT),
        mv(2, "a", "P2", None, ROOT),
        mv(3, "a", "X", None, ROOT),
    ];
    let alpha = mv(10, "a", "X", Some(ROOT), "P1");
    let beta = mv(11, "b", "X", Some(ROOT), "P2");

    for order in [[&alpha, &beta], [&beta, &alpha]] {
        let replica = fresh_engine();
        replica.apply(&setup).unwrap();
        for op in order {
            replica.apply(std::slice::from_ref(op)).unwrap();
        }
        assert_eq!(
            replica.store().parent_of("X").unwrap(),
            Some(Some("P2".to_string()))
        );
    }
}

#[test]
fn base_algorithm_sends_concurrent_insert_into_deleted_subtree_to_tombstone() {
    // Without the relay's restore policy, a deletion concurrent with an
    // insertion below it deterministically parks both under the
    // tombstone. The policy that undoes this lives at the relay.
    let setup = vec![mv(1, "a", "A", None, ROOT), mv(2, "a", "B", None, "A")];
    let delete = mv(10, "a", "B", Some("A"), TOMBSTONE);
    let insert = mv(11, "b", "D", None, "B");

    for order in [[&delete, &insert], [&insert, &delete]] {
        let replica = fresh_engine();
        replica.apply(&setup).unwrap();
        for op in order {
            replica.apply(std::slice::from_ref(op)).unwrap();
        }
        assert_eq!(
            replica.store().parent_of("B").unwrap(),
            Some(Some(TOMBSTONE.to_string()))
        );
        assert_eq!(
            replica.store().parent_of("D").unwrap(),
            Some(Some("B".to_string()))
        );
    }
}
