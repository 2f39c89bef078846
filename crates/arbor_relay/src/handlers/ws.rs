//! The relay's control endpoint: push, catch-up streaming, subtree
//! queries, ping, and the real-time broadcast, multiplexed over one
//! WebSocket per client.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use arbor_core::protocol::{
    encode_stream_lines, ClientMessage, PushAck, RoomStatus, ServerMessage,
};
use arbor_core::{Operation, Timestamp};

use super::AppState;
use crate::connection::ClientConnection;
use crate::room::Room;

/// Query parameters for the control connection.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Thoughtspace to join.
    pub space: String,
    /// Stable client id; generated for anonymous connections.
    pub client: Option<String>,
}

/// WebSocket upgrade handler for `/ws`.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let client_id = query
        .client
        .unwrap_or_else(|| format!("client-{}", uuid::Uuid::new_v4()));
    info!("websocket upgrade: space={}, client={}", query.space, client_id);
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.space, client_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, space_id: String, client_id: String) {
    let room = state.relay.get_or_create_room(&space_id).await;
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut connection = ClientConnection::new(client_id.clone(), room.clone());

    info!(
        "websocket connected: space={}, client={}, connections={}",
        space_id,
        client_id,
        room.connection_count()
    );

    // Status and roster first, so a client can gate its state machine on
    // room readiness.
    if send_message(
        &mut ws_tx,
        &ServerMessage::Status {
            status: room.status(),
        },
    )
    .await
    .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            // Incoming requests from this client.
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(message) => {
                                if let Err(e) = handle_client_message(
                                    message,
                                    &room,
                                    &client_id,
                                    &state,
                                    &mut ws_tx,
                                )
                                .await
                                {
                                    error!("failed to serve {}: {}", client_id, e);
                                    break;
                                }
                            }
                            // Protocol errors never abort the connection.
                            Err(e) => warn!("dropping malformed message from {}: {}", client_id, e),
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if ws_tx.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!("client {} requested close", client_id);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("websocket error for {}: {}", client_id, e);
                        break;
                    }
                    None => break,
                }
            }

            // Broadcasts from other clients of the room.
            broadcast = connection.recv_broadcast() => {
                match broadcast {
                    Some(message) => {
                        if send_message(&mut ws_tx, &message).await.is_err() {
                            break;
                        }
                    }
                    // Lagged or closed: drop the connection so the client
                    // reconnects through catch-up instead of missing deltas.
                    None => break,
                }
            }
        }
    }

    info!("websocket disconnected: space={}, client={}", space_id, client_id);
    drop(connection);
    state.relay.maybe_remove_room(&space_id).await;
}

async fn handle_client_message(
    message: ClientMessage,
    room: &Room,
    client_id: &str,
    state: &AppState,
    ws_tx: &mut SplitSink<WebSocket, Message>,
) -> Result<(), axum::Error> {
    match message {
        ClientMessage::Ping => {
            send_message(
                ws_tx,
                &ServerMessage::Status {
                    status: room.status(),
                },
            )
            .await?;
            send_message(
                ws_tx,
                &ServerMessage::Connections {
                    clients: room.roster(),
                },
            )
            .await?;
        }

        ClientMessage::Push { operations } => {
            match room.apply_push(&client_id.to_string(), operations).await {
                Ok(sync_timestamp) => {
                    send_json(ws_tx, &PushAck { sync_timestamp }).await?;
                }
                Err(e) => {
                    // The client keeps the batch unacknowledged and
                    // retries after reconnecting.
                    error!("push from {} rejected: {}", client_id, e);
                    send_message(
                        ws_tx,
                        &ServerMessage::Status {
                            status: RoomStatus::Error,
                        },
                    )
                    .await?;
                }
            }
        }

        ClientMessage::SyncStream {
            last_sync_timestamp,
        } => {
            stream_since(room, last_sync_timestamp, state.config.pull_chunk_size, ws_tx).await?;
        }

        ClientMessage::Subtree { id, depth } => {
            let rows = room.subtree(&id, depth).unwrap_or_else(|e| {
                error!("subtree query failed: {}", e);
                Vec::new()
            });
            send_json(ws_tx, &rows).await?;
        }
    }
    Ok(())
}

/// Serve a catch-up stream: one header line, then chunks of operation
/// lines in ascending `sync_timestamp` order, bounded by the upper limit
/// snapshotted at request start. Sending frame-by-frame keeps the
/// database cursor paced by the socket.
async fn stream_since(
    room: &Room,
    cursor: Option<Timestamp>,
    chunk_size: usize,
    ws_tx: &mut SplitSink<WebSocket, Message>,
) -> Result<(), axum::Error> {
    let (header, upper) = match room.stream_header(cursor.as_ref()) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            error!("catch-up header failed: {}", e);
            return Ok(());
        }
    };
    let expected = header.operations;
    let header_json = serde_json::to_string(&header).map_err(axum::Error::new)?;
    ws_tx.send(Message::Text(header_json)).await?;

    let mut after: Option<(Timestamp, Timestamp)> = None;
    let mut sent = 0u64;
    while sent < expected {
        let page = match room.sync_page(
            cursor.as_ref(),
            upper.as_ref(),
            after.as_ref().map(|(s, t)| (s, t)),
            chunk_size,
        ) {
            Ok(page) => page,
            Err(e) => {
                error!("catch-up page failed: {}", e);
                return Ok(());
            }
        };
        let Some(last) = page.last() else {
            warn!("catch-up stream dried up at {} of {} operations", sent, expected);
            return Ok(());
        };
        after = last
            .sync_timestamp
            .clone()
            .map(|sync| (sync, last.timestamp.clone()));
        sent += page.len() as u64;

        let operations: Vec<Operation> = page.into_iter().map(Operation::Move).collect();
        let lines = encode_stream_lines(&operations).map_err(axum::Error::new)?;
        ws_tx.send(Message::Text(lines)).await?;
    }
    debug!("catch-up stream complete: {} operations", sent);
    Ok(())
}

async fn send_message(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    send_json(ws_tx, message).await
}

async fn send_json<T: serde::Serialize>(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    value: &T,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(value).map_err(axum::Error::new)?;
    ws_tx.send(Message::Text(json)).await
}
