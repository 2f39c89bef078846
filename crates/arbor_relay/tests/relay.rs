//! Room-level integration tests: push stamping and fan-out, the restore
//! policy end to end, catch-up paging, and hydration equivalence.

use arbor_core::hydration::{SnapshotDecoder, SnapshotEncoder, SnapshotRow};
use arbor_core::protocol::ServerMessage;
use arbor_core::{LogStore, MoveOp, Operation, Timestamp, ROOT, SERVER_CLIENT_ID, TOMBSTONE};
use arbor_relay::{Config, Room, UpperLimitPolicy};

/// Operation timestamps in the restore tests sit above any server stamp
/// the room's clock can mint, the way real wall-clock client stamps do.
const BASE: i64 = 2_000_000_000_000;

fn test_config() -> Config {
    Config {
        host: "127.0.0.1".into(),
        port: 0,
        data_dir: "./data".into(),
        upper_limit_policy: UpperLimitPolicy::FrozenAtStart,
        pull_chunk_size: 2,
        hydration_row_batch: 2,
        max_ancestor_walk_depth: 100,
        cors_origins: Vec::new(),
    }
}

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

fn mv_with_cutoff(
    millis: i64,
    client: &str,
    node: &str,
    old: Option<&str>,
    new: &str,
    cutoff: &Timestamp,
) -> Operation {
    match mv(millis, client, node, old, new) {
        Operation::Move(mut op) => {
            op.last_sync_timestamp = Some(cutoff.clone());
            Operation::Move(op)
        }
        other => other,
    }
}

fn parent(room: &Room, id: &str) -> Option<String> {
    room.store().parent_of(id).unwrap().flatten()
}

#[tokio::test]
async fn push_stamps_operations_and_fans_out_to_peers_only() {
    let room = Room::in_memory("space", &test_config());
    let mut peer = room.join(&"peer".to_string());
    let mut pusher = room.join(&"pusher".to_string());
    // Drain the two roster broadcasts every subscriber saw.
    for _ in 0..2 {
        peer.recv().await.unwrap();
    }
    pusher.recv().await.unwrap();

    let stamp = room
        .apply_push(&"pusher".to_string(), vec![mv(1, "pusher", "A", None, ROOT)])
        .await
        .unwrap();

    // Peers see the stamped batch.
    let event = peer.recv().await.unwrap();
    assert_eq!(event.origin, Some("pusher".to_string()));
    match event.message {
        ServerMessage::Push {
            operations,
            sync_timestamp,
        } => {
            assert_eq!(sync_timestamp, stamp);
            let op = operations[0].as_move().unwrap();
            assert_eq!(op.sync_timestamp, Some(stamp.clone()));
        }
        other => panic!("expected push broadcast, got {other:?}"),
    }

    // The persisted copy carries the stamp too.
    let ops = room.store().all_ops().unwrap();
    assert_eq!(ops[0].sync_timestamp, Some(stamp));
    assert_eq!(parent(&room, "A"), Some(ROOT.to_string()));
}

#[tokio::test]
async fn push_is_idempotent_under_retry() {
    let room = Room::in_memory("space", &test_config());
    let batch = vec![mv(1, "c1", "A", None, ROOT)];

    room.apply_push(&"c1".to_string(), batch.clone()).await.unwrap();
    room.apply_push(&"c1".to_string(), batch).await.unwrap();

    assert_eq!(room.store().op_count().unwrap(), 1);
}

/// Delete + concurrent add, deletion pushed first.
#[tokio::test]
async fn uninformed_deletion_is_restored_when_insert_arrives_later() {
    let room = Room::in_memory("space", &test_config());
    let cutoff = room
        .apply_push(
            &"a".to_string(),
            vec![mv(BASE + 1, "a", "A", None, ROOT), mv(BASE + 2, "a", "B", None, "A")],
        )
        .await
        .unwrap();

    room.apply_push(
        &"a".to_string(),
        vec![mv_with_cutoff(BASE + 10, "a", "B", Some("A"), TOMBSTONE, &cutoff)],
    )
    .await
    .unwrap();
    assert_eq!(parent(&room, "B"), Some(TOMBSTONE.to_string()));

    let mut peer = room.join(&"c".to_string());
    room.apply_push(
        &"b".to_string(),
        vec![mv_with_cutoff(BASE + 20, "b", "D", None, "B", &cutoff)],
    )
    .await
    .unwrap();

    // Final live tree: ROOT -> A -> B -> D.
    assert_eq!(parent(&room, "B"), Some("A".to_string()));
    assert_eq!(parent(&room, "D"), Some("B".to_string()));

    // The corrective move is server-attributed, stamped after the insert,
    // and broadcast to everyone.
    let correctives: Vec<MoveOp> = room
        .store()
        .all_ops()
        .unwrap()
        .into_iter()
        .filter(|op| op.client_id == SERVER_CLIENT_ID)
        .collect();
    assert_eq!(correctives.len(), 1);
    assert_eq!(correctives[0].node_id, "B");
    assert_eq!(correctives[0].new_parent_id, "A");
    assert!(correctives[0].timestamp > Timestamp::new(BASE + 20, "b"));

    // Peer receives the original push, then the corrective batch.
    let mut saw_corrective = false;
    for _ in 0..3 {
        let event = peer.recv().await.unwrap();
        if let ServerMessage::Push { operations, .. } = &event.message {
            if operations
                .iter()
                .any(|op| op.as_move().map(|m| m.client_id.as_str()) == Some(SERVER_CLIENT_ID))
            {
                assert_eq!(event.origin, None);
                saw_corrective = true;
                break;
            }
        }
    }
    assert!(saw_corrective);
}

/// Delete + concurrent add, insertion pushed first.
#[tokio::test]
async fn uninformed_deletion_is_restored_when_it_arrives_later() {
    let room = Room::in_memory("space", &test_config());
    let cutoff = room
        .apply_push(
            &"a".to_string(),
            vec![mv(BASE + 1, "a", "A", None, ROOT), mv(BASE + 2, "a", "B", None, "A")],
        )
        .await
        .unwrap();

    room.apply_push(
        &"b".to_string(),
        vec![mv_with_cutoff(BASE + 20, "b", "D", None, "B", &cutoff)],
    )
    .await
    .unwrap();
    room.apply_push(
        &"a".to_string(),
        vec![mv_with_cutoff(BASE + 10, "a", "B", Some("A"), TOMBSTONE, &cutoff)],
    )
    .await
    .unwrap();

    assert_eq!(parent(&room, "B"), Some("A".to_string()));
    assert_eq!(parent(&room, "D"), Some("B".to_string()));
}

#[tokio::test]
async fn catch_up_stream_pages_in_sync_timestamp_order() {
    let room = Room::in_memory("space", &test_config());
    let first = room
        .apply_push(&"a".to_string(), vec![mv(1, "a", "A", None, ROOT)])
        .await
        .unwrap();
    room.apply_push(
        &"a".to_string(),
        vec![mv(2, "a", "B", None, "A"), mv(3, "a", "C", None, "A")],
    )
    .await
    .unwrap();

    // From scratch: all three operations, counted exactly.
    let (header, upper) = room.stream_header(None).unwrap();
    assert_eq!(header.operations, 3);

    let mut collected = Vec::new();
    let mut after: Option<(Timestamp, Timestamp)> = None;
    loop {
        let page = room
            .sync_page(None, upper.as_ref(), after.as_ref().map(|(s, t)| (s, t)), 2)
            .unwrap();
        if page.is_empty() {
            break;
        }
        let last = page.last().unwrap();
        after = Some((last.sync_timestamp.clone().unwrap(), last.timestamp.clone()));
        collected.extend(page);
    }
    assert_eq!(collected.len(), 3);
    let nodes: Vec<&str> = collected.iter().map(|op| op.node_id.as_str()).collect();
    assert_eq!(nodes, vec!["A", "B", "C"]);

    // From a cursor: only what the client has not seen.
    let (header, _) = room.stream_header(Some(&first)).unwrap();
    assert_eq!(header.operations, 2);
    assert_eq!(header.lower_limit, Some(first));
}

#[tokio::test]
async fn frozen_upper_limit_excludes_later_pushes() {
    let room = Room::in_memory("space", &test_config());
    room.apply_push(&"a".to_string(), vec![mv(1, "a", "A", None, ROOT)])
        .await
        .unwrap();

    let (header, upper) = room.stream_header(None).unwrap();
    assert_eq!(header.operations, 1);

    // A push racing the stream lands beyond the snapshotted bound.
    room.apply_push(&"a".to_string(), vec![mv(2, "a", "B", None, "A")])
        .await
        .unwrap();
    let page = room.sync_page(None, upper.as_ref(), None, 10).unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].node_id, "A");
}

/// Hydrating from the snapshot reproduces the relay's tables row for row,
/// without replaying the log.
#[tokio::test]
async fn hydration_snapshot_reproduces_relay_state() {
    let room = Room::in_memory("space", &test_config());
    let cutoff = room
        .apply_push(
            &"a".to_string(),
            vec![mv(BASE + 1, "a", "A", None, ROOT), mv(BASE + 2, "a", "B", None, "A")],
        )
        .await
        .unwrap();
    // Include a restore so server-synthesized rows are part of the dump.
    room.apply_push(
        &"a".to_string(),
        vec![mv_with_cutoff(BASE + 10, "a", "B", Some("A"), TOMBSTONE, &cutoff)],
    )
    .await
    .unwrap();
    room.apply_push(
        &"b".to_string(),
        vec![mv_with_cutoff(BASE + 20, "b", "D", None, "B", &cutoff)],
    )
    .await
    .unwrap();

    // Dump through the snapshot codec, paged like the endpoint does.
    let mut encoder = SnapshotEncoder::new();
    let mut after_id: Option<String> = None;
    loop {
        let page = room.store().nodes_page(after_id.as_deref(), 2).unwrap();
        for row in &page {
            encoder.push_node(row);
        }
        after_id = page.last().map(|row| row.id.clone());
        if page.len() < 2 {
            break;
        }
    }
    let mut after_ts: Option<Timestamp> = None;
    loop {
        let page = room.store().ops_page(after_ts.as_ref(), None, 2).unwrap();
        for op in &page {
            encoder.push_op(op);
        }
        after_ts = page.last().map(|op| op.timestamp.clone());
        if page.len() < 2 {
            break;
        }
    }
    encoder.finish();

    // Import verbatim into a fresh replica store.
    let replica = LogStore::in_memory().unwrap();
    let mut decoder = SnapshotDecoder::new();
    decoder.feed(&encoder.take());
    let mut nodes = Vec::new();
    let mut ops = Vec::new();
    while let Some(row) = decoder.next_row().unwrap() {
        match row {
            SnapshotRow::Node(row) => nodes.push(row),
            SnapshotRow::Op(op) => ops.push(op),
        }
    }
    assert!(decoder.finished());
    replica.import_snapshot_rows(&nodes, &ops).unwrap();

    assert_eq!(replica.nodes_map().unwrap(), room.store().nodes_map().unwrap());
    assert_eq!(replica.all_ops().unwrap(), room.store().all_ops().unwrap());
}

#[tokio::test]
async fn roster_broadcasts_track_joins_and_leaves() {
    let room = Room::in_memory("space", &test_config());
    let mut watcher = room.join(&"w".to_string());
    watcher.recv().await.unwrap(); // own join broadcast

    room.join(&"other".to_string());
    let event = watcher.recv().await.unwrap();
    match event.message {
        ServerMessage::Connections { clients } => {
            assert_eq!(clients, vec!["w".to_string(), "other".to_string()]);
        }
        other => panic!("expected roster broadcast, got {other:?}"),
    }

    room.leave(&"other".to_string());
    let event = watcher.recv().await.unwrap();
    match event.message {
        ServerMessage::Connections { clients } => {
            assert_eq!(clients, vec!["w".to_string()]);
        }
        other => panic!("expected roster broadcast, got {other:?}"),
    }
}
