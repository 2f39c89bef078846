//! Per-thoughtspace rooms.
//!
//! A room owns the canonical log and tree for one thoughtspace. Mutations
//! (push applications and the corrective moves the restore policy
//! synthesizes) are serialized through a single-writer region so the
//! persisted log always replays to the persisted tree; reads run
//! concurrently.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use arbor_core::engine::Engine;
use arbor_core::protocol::{RoomStatus, ServerMessage, StreamHeader};
use arbor_core::store::{LogStore, NodeRow};
use arbor_core::{
    ClientId, EngineConfig, MoveOp, Operation, Result, Timestamp, TimestampGenerator,
    SERVER_CLIENT_ID,
};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{error, info, warn};

use crate::config::{Config, UpperLimitPolicy};
use crate::restore;

/// A broadcast fan-out entry. `origin` is excluded from delivery so a
/// client never receives its own push back.
#[derive(Debug, Clone)]
pub struct RoomEvent {
    pub origin: Option<ClientId>,
    pub message: ServerMessage,
}

/// Global relay state managing all rooms.
pub struct RelayState {
    /// Map of thoughtspace id to room.
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    /// Base path for thoughtspace databases.
    data_dir: PathBuf,
    config: Arc<Config>,
}

impl RelayState {
    pub fn new(data_dir: PathBuf, config: Arc<Config>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            data_dir,
            config,
        }
    }

    /// Get or create the room for a thoughtspace.
    pub async fn get_or_create_room(&self, space_id: &str) -> Arc<Room> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(space_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;

        // Double-check after acquiring the write lock.
        if let Some(room) = rooms.get(space_id) {
            return room.clone();
        }

        let db_path = self.data_dir.join(format!("{}.db", space_id));
        let room = match Room::open(space_id, db_path, &self.config) {
            Ok(room) => Arc::new(room),
            Err(e) => {
                error!("failed to open room for {}: {}", space_id, e);
                // Fall back to an in-memory room so the space stays usable.
                Arc::new(Room::in_memory(space_id, &self.config))
            }
        };

        rooms.insert(space_id.to_string(), room.clone());
        info!("created room for thoughtspace: {}", space_id);
        room
    }

    /// Remove a room once it has no active connections.
    pub async fn maybe_remove_room(&self, space_id: &str) {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(space_id) {
            if room.connection_count() == 0 {
                rooms.remove(space_id);
                info!("removed idle room: {}", space_id);
            }
        }
    }
}

/// The authoritative node for a single thoughtspace.
pub struct Room {
    space_id: String,
    store: Arc<LogStore>,
    engine: Engine,
    /// Stamps sync timestamps and corrective-operation timestamps;
    /// monotonic past everything already persisted.
    clock: TimestampGenerator,
    /// Single-writer region around push-apply and the restore policy.
    writer: Mutex<()>,
    broadcast_tx: broadcast::Sender<RoomEvent>,
    roster: StdMutex<Vec<ClientId>>,
    connection_count: AtomicUsize,
    status: StdMutex<RoomStatus>,
    upper_limit_policy: UpperLimitPolicy,
    max_walk_depth: usize,
}

impl Room {
    /// Open a room backed by its thoughtspace database. Runs the startup
    /// integrity gate before accepting traffic.
    pub fn open(space_id: &str, db_path: PathBuf, config: &Config) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = Arc::new(LogStore::open(&db_path)?);
        Self::bootstrap(space_id, store, config)
    }

    /// Create an in-memory room (fallback and tests).
    pub fn in_memory(space_id: &str, config: &Config) -> Self {
        let store = Arc::new(LogStore::in_memory().expect("failed to create in-memory store"));
        Self::bootstrap(space_id, store, config).expect("in-memory bootstrap cannot fail")
    }

    fn bootstrap(space_id: &str, store: Arc<LogStore>, config: &Config) -> Result<Self> {
        let engine = Engine::new(
            store.clone(),
            EngineConfig {
                max_ancestor_walk_depth: config.max_ancestor_walk_depth,
            },
        );
        engine.check_or_rebuild()?;

        let clock = TimestampGenerator::new(SERVER_CLIENT_ID);
        if let Some(max) = store.max_timestamp()? {
            clock.observe(&max);
        }
        if let Some(max) = store.max_sync_timestamp(None)? {
            clock.observe(&max);
        }

        let (broadcast_tx, _) = broadcast::channel(1024);
        Ok(Self {
            space_id: space_id.to_string(),
            store,
            engine,
            clock,
            writer: Mutex::new(()),
            broadcast_tx,
            roster: StdMutex::new(Vec::new()),
            connection_count: AtomicUsize::new(0),
            status: StdMutex::new(RoomStatus::Ready),
            upper_limit_policy: config.upper_limit_policy,
            max_walk_depth: config.max_ancestor_walk_depth,
        })
    }

    pub fn space_id(&self) -> &str {
        &self.space_id
    }

    pub fn store(&self) -> &Arc<LogStore> {
        &self.store
    }

    pub fn status(&self) -> RoomStatus {
        *self.status.lock().unwrap()
    }

    pub fn roster(&self) -> Vec<ClientId> {
        self.roster.lock().unwrap().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::SeqCst)
    }

    /// Register a connection: subscribe to the fan-out, add the client to
    /// the roster, and broadcast the updated roster.
    pub fn join(&self, client_id: &ClientId) -> broadcast::Receiver<RoomEvent> {
        self.connection_count.fetch_add(1, Ordering::SeqCst);
        let rx = self.broadcast_tx.subscribe();
        {
            let mut roster = self.roster.lock().unwrap();
            if !roster.contains(client_id) {
                roster.push(client_id.clone());
            }
        }
        if let Err(e) = self
            .store
            .upsert_client(client_id, chrono_now_millis())
        {
            warn!("failed to record client {}: {}", client_id, e);
        }
        self.broadcast_roster();
        rx
    }

    /// Unregister a connection and broadcast the updated roster.
    pub fn leave(&self, client_id: &ClientId) {
        self.connection_count.fetch_sub(1, Ordering::SeqCst);
        {
            let mut roster = self.roster.lock().unwrap();
            roster.retain(|c| c != client_id);
        }
        self.broadcast_roster();
    }

    fn broadcast_roster(&self) {
        let _ = self.broadcast_tx.send(RoomEvent {
            origin: None,
            message: ServerMessage::Connections {
                clients: self.roster(),
            },
        });
    }

    fn broadcast(&self, origin: Option<ClientId>, message: ServerMessage) {
        let _ = self.broadcast_tx.send(RoomEvent { origin, message });
    }

    /// Apply a pushed batch: assign the sync timestamp, run the engine,
    /// evaluate the restore policy, and fan out the union of original and
    /// corrective operations.
    pub async fn apply_push(
        &self,
        origin: &ClientId,
        operations: Vec<Operation>,
    ) -> Result<Timestamp> {
        let _writer = self.writer.lock().await;

        for op in &operations {
            self.clock.observe(op.timestamp());
        }
        let sync_ts = self.clock.next();
        let stamped: Vec<Operation> = operations
            .into_iter()
            .map(|op| match op {
                Operation::Move(mut op) => {
                    op.sync_timestamp = Some(sync_ts.clone());
                    Operation::Move(op)
                }
                other => other,
            })
            .collect();

        let outcome = self.apply_guarded(&stamped)?;
        if let Err(e) = self.store.upsert_client(origin, chrono_now_millis()) {
            warn!("failed to record client {}: {}", origin, e);
        }
        if !outcome.skipped_cycles.is_empty() {
            info!(
                "room {}: skipped {} cycle-inducing moves from {}",
                self.space_id,
                outcome.skipped_cycles.len(),
                origin
            );
        }

        let moves: Vec<MoveOp> = stamped
            .iter()
            .filter_map(|op| op.as_move().cloned())
            .collect();
        let corrective =
            restore::corrections(&self.engine, &self.store, &self.clock, &moves, self.max_walk_depth)?;

        self.broadcast(
            Some(origin.clone()),
            ServerMessage::Push {
                operations: stamped,
                sync_timestamp: sync_ts.clone(),
            },
        );
        if !corrective.is_empty() {
            info!(
                "room {}: restored {} uninformed deletions",
                self.space_id,
                corrective.len()
            );
            let stamp = corrective
                .last()
                .and_then(|op| op.as_move())
                .and_then(|op| op.sync_timestamp.clone())
                .unwrap_or_else(|| sync_ts.clone());
            // Corrective moves go to every peer, the pusher included.
            self.broadcast(
                None,
                ServerMessage::Push {
                    operations: corrective,
                    sync_timestamp: stamp,
                },
            );
        }

        Ok(sync_ts)
    }

    /// Snapshot the catch-up bound and header for a pull request.
    pub fn stream_header(&self, cursor: Option<&Timestamp>) -> Result<(StreamHeader, Option<Timestamp>)> {
        let upper = match self.upper_limit_policy {
            UpperLimitPolicy::Now => Some(self.clock.next()),
            UpperLimitPolicy::FrozenAtStart => self.store.max_sync_timestamp(None)?,
        };
        let header = StreamHeader {
            lower_limit: cursor.cloned(),
            upper_limit: upper.clone(),
            operations: self.store.count_sync_range(cursor, upper.as_ref())?,
            nodes: self.store.node_count()?,
        };
        Ok((header, upper))
    }

    pub fn sync_page(
        &self,
        cursor: Option<&Timestamp>,
        upper: Option<&Timestamp>,
        after: Option<(&Timestamp, &Timestamp)>,
        limit: usize,
    ) -> Result<Vec<MoveOp>> {
        self.store.sync_page(cursor, upper, after, limit)
    }

    pub fn subtree(&self, root: &str, depth: u32) -> Result<Vec<NodeRow>> {
        self.store.subtree(root, depth)
    }

    /// Sync-stamp bound for a hydration dump, captured at stream start.
    /// Pushes racing the dump land strictly above it, where the hydrated
    /// client's first catch-up begins.
    pub fn hydration_bound(&self) -> Timestamp {
        self.clock.next()
    }

    /// Run the engine, demoting the room on unrecoverable store failure.
    fn apply_guarded(&self, batch: &[Operation]) -> Result<arbor_core::ApplyOutcome> {
        match self.engine.apply(batch) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!("room {}: store failure: {}", self.space_id, e);
                *self.status.lock().unwrap() = RoomStatus::Error;
                self.broadcast(
                    None,
                    ServerMessage::Status {
                        status: RoomStatus::Error,
                    },
                );
                Err(e)
            }
        }
    }
}

fn chrono_now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
