//! Bulk hydration endpoint.
//!
//! Serves the binary snapshot of a thoughtspace (the `nodes` table and
//! the full `op_log`) over a dedicated WebSocket connection, chunked one
//! row batch per frame. Sending awaits the socket, so a slow consumer
//! pauses the table scan instead of ballooning relay memory; closing the
//! connection mid-stream simply abandons the scan.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::{debug, error, info};

use arbor_core::hydration::SnapshotEncoder;
use arbor_core::Timestamp;

use super::AppState;
use crate::room::Room;

/// Query parameters for the hydration connection.
#[derive(Debug, Deserialize)]
pub struct HydrateQuery {
    /// Thoughtspace to dump.
    pub space: String,
}

/// WebSocket upgrade handler for `/hydrate`.
pub async fn hydrate_handler(
    State(state): State<AppState>,
    Query(query): Query<HydrateQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    info!("hydration stream requested: space={}", query.space);
    ws.on_upgrade(move |socket| stream_snapshot(socket, state, query.space))
}

async fn stream_snapshot(mut socket: WebSocket, state: AppState, space_id: String) {
    let room = state.relay.get_or_create_room(&space_id).await;
    let batch = state.config.hydration_row_batch;

    if let Err(e) = dump(&mut socket, &room, batch).await {
        error!("hydration stream for {} aborted: {}", space_id, e);
    }
    let _ = socket.send(Message::Close(None)).await;
    state.relay.maybe_remove_room(&space_id).await;
}

async fn dump(socket: &mut WebSocket, room: &Room, batch: usize) -> Result<(), axum::Error> {
    let store = room.store();
    let bound = room.hydration_bound();
    let mut encoder = SnapshotEncoder::new();
    let mut rows = 0u64;

    // Nodes first, paged by id.
    let mut after_id: Option<String> = None;
    loop {
        let page = store
            .nodes_page(after_id.as_deref(), batch)
            .map_err(axum::Error::new)?;
        let done = page.len() < batch;
        for row in &page {
            encoder.push_node(row);
        }
        rows += page.len() as u64;
        after_id = page.last().map(|row| row.id.clone());
        if !encoder.is_empty() {
            socket.send(Message::Binary(encoder.take())).await?;
        }
        if done {
            break;
        }
    }

    // Then the log, paged by timestamp.
    let mut after_ts: Option<Timestamp> = None;
    loop {
        let page = store
            .ops_page(after_ts.as_ref(), Some(&bound), batch)
            .map_err(axum::Error::new)?;
        let done = page.len() < batch;
        for op in &page {
            encoder.push_op(op);
        }
        rows += page.len() as u64;
        after_ts = page.last().map(|op| op.timestamp.clone());
        if !encoder.is_empty() {
            socket.send(Message::Binary(encoder.take())).await?;
        }
        if done {
            break;
        }
    }

    encoder.finish();
    socket.send(Message::Binary(encoder.take())).await?;
    debug!("hydration stream complete: {} rows", rows);
    Ok(())
}
