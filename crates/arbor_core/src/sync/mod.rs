//! Per-replica sync coordination.
//!
//! The coordinator owns the replica's store and engine and drives the
//! connection lifecycle against a [`RelayTransport`]: bulk hydration for a
//! fresh replica, cursor-based catch-up after a disconnection, pushing
//! locally-originated operations, and feeding real-time broadcasts into the
//! engine. Transports are pluggable; the production WebSocket transport
//! lives in [`ws`].

pub mod ws;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::{EngineConfig, SyncConfig};
use crate::engine::Engine;
use crate::error::{ArborError, Result};
use crate::hydration::{SnapshotDecoder, SnapshotRow};
use crate::op::{
    new_node_id, ClientId, MoveOp, NodeId, Operation, Timestamp, TimestampGenerator, TOMBSTONE,
};
use crate::protocol::StreamHeader;
use crate::store::{LogStore, NodeRow};

/// Connection lifecycle of a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Disconnected,
    /// Bulk initial replication of a fresh local store.
    Hydrating,
    /// Cursor-based incremental pull after a disconnection.
    CatchingUp,
    /// Applying real-time broadcasts.
    Live,
    /// Irrecoverable local divergence; recover by resetting the store and
    /// re-entering hydration.
    Error,
}

/// A catch-up stream: the header, then operations in ascending
/// `sync_timestamp` order. Dropping the receiver cancels the producer.
pub struct PullStream {
    pub header: StreamHeader,
    pub operations: mpsc::Receiver<Result<Operation>>,
}

/// Events a transport delivers outside the request/reply flow.
#[derive(Debug)]
pub enum LiveEvent {
    /// Real-time broadcast from the relay. Feed into
    /// [`Coordinator::handle_remote_batch`].
    Batch {
        operations: Vec<Operation>,
        sync_timestamp: Timestamp,
    },
    /// Roster broadcast: currently connected client ids.
    Roster(Vec<String>),
    /// Room lifecycle broadcast.
    Status(crate::protocol::RoomStatus),
    /// The transport lost its connection. Feed into
    /// [`Coordinator::handle_disconnect`] and reconnect.
    Disconnected,
}

/// Transport seam between a replica and its relay.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Submit a batch; returns the server-assigned sync timestamp.
    /// Idempotent on operation timestamps, so retrying the same batch
    /// after a timeout is safe.
    async fn push(&self, operations: Vec<Operation>) -> Result<Timestamp>;

    /// Request everything past the cursor, up to a server-chosen bound.
    async fn pull_since(&self, cursor: Option<Timestamp>) -> Result<PullStream>;

    /// Request the binary snapshot stream on a dedicated connection.
    /// Dropping the receiver cancels the stream and releases the server's
    /// cursor.
    async fn hydrate(&self) -> Result<mpsc::Receiver<Result<Vec<u8>>>>;

    /// Query the subtree below a node, bounded by depth.
    async fn subtree(&self, id: &str, depth: u32) -> Result<Vec<NodeRow>>;
}

/// Sync coordinator for one replica.
///
/// Engine invocations are serialized through `&mut self`; a batch is never
/// torn across suspension points.
pub struct Coordinator<T: RelayTransport> {
    store: Arc<LogStore>,
    engine: Engine,
    transport: T,
    client_id: ClientId,
    clock: TimestampGenerator,
    config: SyncConfig,
    state: SyncState,
    /// Greatest `sync_timestamp` observed from a non-self client.
    cursor: Option<Timestamp>,
    /// Content register writes awaiting acknowledgement. The register is
    /// external to the tree core; these only ride along on pushes.
    pending_updates: Vec<Operation>,
}

impl<T: RelayTransport> Coordinator<T> {
    /// Build a coordinator over an opened store, running the startup
    /// integrity gate. A replica whose materialized tree cannot be
    /// reconciled with its log starts in [`SyncState::Error`] and must be
    /// recovered with [`Coordinator::reset_and_rehydrate`].
    pub fn new(
        store: Arc<LogStore>,
        transport: T,
        client_id: ClientId,
        engine_config: EngineConfig,
        config: SyncConfig,
    ) -> Result<Self> {
        let engine = Engine::new(store.clone(), engine_config);
        let state = match engine.check_or_rebuild() {
            Ok(()) => SyncState::Disconnected,
            Err(ArborError::Integrity(reason)) => {
                log::error!("local replica diverged: {reason}");
                SyncState::Error
            }
            Err(e) => return Err(e),
        };
        let cursor = store.max_sync_timestamp(Some(&client_id))?;
        let clock = TimestampGenerator::new(client_id.clone());
        Ok(Self {
            store,
            engine,
            transport,
            client_id,
            clock,
            config,
            state,
            cursor,
            pending_updates: Vec::new(),
        })
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn store(&self) -> &Arc<LogStore> {
        &self.store
    }

    /// Connect to the relay: hydrate a fresh store, otherwise catch up
    /// from the recorded cursor; then flush unacknowledged local
    /// operations and go live.
    pub async fn connect(&mut self) -> Result<()> {
        if self.state == SyncState::Error {
            return Err(ArborError::Integrity(
                "replica is in error state; reset and rehydrate".into(),
            ));
        }
        let fresh = self.store.max_sync_timestamp(None)?.is_none();
        self.state = if fresh {
            SyncState::Hydrating
        } else {
            SyncState::CatchingUp
        };

        let connected = async {
            if fresh {
                self.hydrate().await?;
            } else {
                self.catch_up().await?;
            }
            self.push_pending().await
        }
        .await;

        match connected {
            Ok(()) => {
                self.state = SyncState::Live;
                log::info!("replica {} is live, cursor {:?}", self.client_id, self.cursor);
                Ok(())
            }
            Err(e) => {
                // A torn hydration must not masquerade as a replica with a
                // cursor; wipe the partial import so the next connect
                // hydrates from scratch.
                if fresh {
                    if let Err(reset_err) = self.store.reset() {
                        log::error!("failed to reset after torn hydration: {reset_err}");
                    }
                    self.cursor = None;
                }
                self.state = SyncState::Disconnected;
                Err(e)
            }
        }
    }

    /// Transport loss: any state falls back to disconnected; the next
    /// [`Coordinator::connect`] re-runs catch-up.
    pub fn handle_disconnect(&mut self) {
        if self.state != SyncState::Error {
            self.state = SyncState::Disconnected;
        }
    }

    /// Apply a real-time broadcast batch. Always acceptable regardless of
    /// state: the engine is idempotent on timestamps. After going live the
    /// cursor advances monotonically.
    pub fn handle_remote_batch(
        &mut self,
        operations: Vec<Operation>,
        sync_timestamp: Timestamp,
    ) -> Result<()> {
        for op in &operations {
            self.clock.observe(op.timestamp());
        }
        self.engine.apply(&operations)?;
        if self.cursor.as_ref().map_or(true, |c| sync_timestamp > *c) {
            self.cursor = Some(sync_timestamp);
        }
        Ok(())
    }

    /// Discard the local replica and replicate from scratch. The recovery
    /// path out of [`SyncState::Error`].
    pub async fn reset_and_rehydrate(&mut self) -> Result<()> {
        log::warn!("resetting local replica {}", self.client_id);
        self.store.reset()?;
        self.cursor = None;
        self.pending_updates.clear();
        self.state = SyncState::Disconnected;
        self.connect().await
    }

    /// Create a node under `parent`. The operation applies locally first
    /// and is pushed on the next flush.
    pub fn create_node(&mut self, parent: &str) -> Result<NodeId> {
        let id = new_node_id();
        self.record_local_move(id.clone(), None, parent)?;
        Ok(id)
    }

    /// Reparent a node.
    pub fn move_node(&mut self, node_id: &str, new_parent: &str) -> Result<MoveOp> {
        let old_parent = self.store.parent_of(node_id)?.flatten();
        self.record_local_move(node_id.to_string(), old_parent, new_parent)
    }

    /// Delete a subtree by moving its root to the tombstone.
    pub fn delete_node(&mut self, node_id: &str) -> Result<MoveOp> {
        self.move_node(node_id, TOMBSTONE)
    }

    /// Write the content register for a node.
    pub fn update_content(&mut self, node_id: &str, content: &str) -> Result<()> {
        let op = Operation::Update(crate::op::UpdateOp {
            timestamp: self.clock.next(),
            node_id: node_id.to_string(),
            content: content.to_string(),
        });
        self.engine.apply(std::slice::from_ref(&op))?;
        self.pending_updates.push(op);
        Ok(())
    }

    /// Push all locally-originated unacknowledged operations and mark them
    /// acknowledged with the returned sync timestamp. On timeout the
    /// caller simply reconnects: the entries stay unsynced and the same
    /// batch is retried verbatim.
    pub async fn push_pending(&mut self) -> Result<()> {
        let pending = self.store.unsynced_ops(&self.client_id)?;
        if pending.is_empty() && self.pending_updates.is_empty() {
            return Ok(());
        }
        let timestamps: Vec<Timestamp> = pending.iter().map(|op| op.timestamp.clone()).collect();
        let mut batch: Vec<Operation> = pending.into_iter().map(Operation::Move).collect();
        batch.extend(self.pending_updates.iter().cloned());

        log::debug!("pushing {} operations for {}", batch.len(), self.client_id);
        let sync_ts = self.transport.push(batch).await?;
        self.store.mark_synced(&timestamps, &sync_ts)?;
        self.pending_updates.clear();
        Ok(())
    }

    fn record_local_move(
        &mut self,
        node_id: NodeId,
        old_parent: Option<NodeId>,
        new_parent: &str,
    ) -> Result<MoveOp> {
        let op = MoveOp {
            timestamp: self.clock.next(),
            node_id,
            old_parent_id: old_parent,
            new_parent_id: new_parent.to_string(),
            client_id: self.client_id.clone(),
            sync_timestamp: None,
            last_sync_timestamp: self.cursor.clone(),
        };
        self.engine.apply(&[Operation::Move(op.clone())])?;
        Ok(op)
    }

    /// Bulk initial replication: write snapshot rows verbatim, no replay.
    async fn hydrate(&mut self) -> Result<()> {
        let mut chunks = self.transport.hydrate().await?;
        let mut decoder = SnapshotDecoder::new();
        let mut nodes: Vec<NodeRow> = Vec::new();
        let mut ops: Vec<MoveOp> = Vec::new();
        let mut total = 0usize;

        while let Some(chunk) = chunks.recv().await {
            decoder.feed(&chunk?);
            while let Some(row) = decoder.next_row()? {
                match row {
                    SnapshotRow::Node(row) => nodes.push(row),
                    SnapshotRow::Op(op) => ops.push(op),
                }
                total += 1;
                if nodes.len() + ops.len() >= self.config.hydration_row_batch {
                    self.store.import_snapshot_rows(&nodes, &ops)?;
                    nodes.clear();
                    ops.clear();
                }
            }
        }
        if !decoder.finished() {
            return Err(ArborError::Transport(
                "hydration stream ended before trailer".into(),
            ));
        }
        self.store.import_snapshot_rows(&nodes, &ops)?;
        // A dump taken while the relay was accepting writes can leave the
        // cached tree one step behind the log; reconcile before going live.
        self.engine.check_or_rebuild()?;
        self.cursor = self.store.max_sync_timestamp(Some(&self.client_id))?;
        log::info!("hydrated {} rows for {}", total, self.client_id);
        Ok(())
    }

    /// Incremental catch-up: batch the pulled stream through the engine.
    async fn catch_up(&mut self) -> Result<()> {
        let mut stream = self.transport.pull_since(self.cursor.clone()).await?;
        let expected = stream.header.operations;
        let mut received = 0u64;
        let mut batch: Vec<Operation> = Vec::with_capacity(self.config.pull_chunk_size);

        while let Some(op) = stream.operations.recv().await {
            batch.push(op?);
            received += 1;
            if batch.len() >= self.config.pull_chunk_size {
                self.apply_pulled(&mut batch)?;
            }
        }
        if received != expected {
            return Err(ArborError::Transport(format!(
                "catch-up stream ended early: {received} of {expected} operations"
            )));
        }
        self.apply_pulled(&mut batch)?;
        // The cursor advances only after a successful end-of-stream.
        self.cursor = self.store.max_sync_timestamp(Some(&self.client_id))?;
        log::info!("caught up {} operations for {}", received, self.client_id);
        Ok(())
    }

    fn apply_pulled(&mut self, batch: &mut Vec<Operation>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        for op in batch.iter() {
            self.clock.observe(op.timestamp());
        }
        self.engine.apply(batch)?;
        batch.clear();
        Ok(())
    }
}
