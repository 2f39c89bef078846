//! WebSocket transport for the sync coordinator.
//!
//! One control connection carries JSON request/reply traffic and the
//! real-time broadcast. Requests are strictly one-in-flight, which keeps
//! reply correlation trivial: any frame that is not a tagged broadcast
//! belongs to the pending request. Hydration opens its own connection so
//! its bulk stream applies TCP backpressure without stalling the control
//! channel.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::{LiveEvent, PullStream, RelayTransport};
use crate::error::{ArborError, Result};
use crate::op::{Operation, Timestamp};
use crate::protocol::{
    decode_stream_lines, ClientMessage, PushAck, ServerMessage, StreamHeader,
};
use crate::store::NodeRow;

/// Bound on a push round-trip. Safe to retry: pushes are idempotent on
/// operation timestamps.
const PUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// Capacity of a pull stream channel; a slow consumer pushes back here.
const PULL_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the hydration chunk channel; deliberately small so a slow
/// importer pauses the socket reader instead of buffering the snapshot.
const HYDRATION_CHANNEL_CAPACITY: usize = 4;

/// WebSocket connection to a relay, for one thoughtspace.
pub struct WsTransport {
    request_tx: mpsc::Sender<Request>,
    server_url: String,
    space_id: String,
}

enum Request {
    Push {
        operations: Vec<Operation>,
        reply: oneshot::Sender<Result<Timestamp>>,
    },
    Pull {
        cursor: Option<Timestamp>,
        reply: oneshot::Sender<Result<PullStream>>,
    },
    Subtree {
        id: String,
        depth: u32,
        reply: oneshot::Sender<Result<Vec<NodeRow>>>,
    },
}

/// The reply the pending request is waiting for.
enum Pending {
    Push(oneshot::Sender<Result<Timestamp>>),
    StreamHeader(oneshot::Sender<Result<PullStream>>),
    StreamBody {
        remaining: u64,
        lines: mpsc::Sender<Result<Operation>>,
    },
    Subtree(oneshot::Sender<Result<Vec<NodeRow>>>),
}

impl WsTransport {
    /// Connect the control channel. Returns the transport plus the stream
    /// of live events (broadcast batches, roster, status, disconnect).
    pub async fn connect(
        server_url: &str,
        space_id: &str,
        client_id: &str,
    ) -> Result<(Self, mpsc::Receiver<LiveEvent>)> {
        let server_url = server_url.trim_end_matches('/').to_string();
        let ws_url = format!("{server_url}/ws?space={space_id}&client={client_id}");
        let (stream, _) = connect_async(&ws_url)
            .await
            .map_err(|e| ArborError::Transport(format!("connect failed: {e}")))?;
        log::info!("connected to relay at {ws_url}");

        let (request_tx, request_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(64);
        tokio::spawn(connection_task(stream, request_rx, event_tx));

        Ok((
            Self {
                request_tx,
                server_url,
                space_id: space_id.to_string(),
            },
            event_rx,
        ))
    }

    async fn send_request(&self, request: Request) -> Result<()> {
        self.request_tx
            .send(request)
            .await
            .map_err(|_| ArborError::Transport("connection task is gone".into()))
    }
}

#[async_trait::async_trait]
impl RelayTransport for WsTransport {
    async fn push(&self, operations: Vec<Operation>) -> Result<Timestamp> {
        let (reply, reply_rx) = oneshot::channel();
        self.send_request(Request::Push { operations, reply }).await?;
        match tokio::time::timeout(PUSH_TIMEOUT, reply_rx).await {
            Err(_) => Err(ArborError::Transport("push timed out".into())),
            Ok(Err(_)) => Err(ArborError::Transport("connection closed during push".into())),
            Ok(Ok(result)) => result,
        }
    }

    async fn pull_since(&self, cursor: Option<Timestamp>) -> Result<PullStream> {
        let (reply, reply_rx) = oneshot::channel();
        self.send_request(Request::Pull { cursor, reply }).await?;
        reply_rx
            .await
            .map_err(|_| ArborError::Transport("connection closed during pull".into()))?
    }

    async fn hydrate(&self) -> Result<mpsc::Receiver<Result<Vec<u8>>>> {
        let url = format!("{}/hydrate?space={}", self.server_url, self.space_id);
        let (stream, _) = connect_async(&url)
            .await
            .map_err(|e| ArborError::Transport(format!("hydrate connect failed: {e}")))?;
        log::debug!("hydration stream opened at {url}");

        let (tx, rx) = mpsc::channel(HYDRATION_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let (_, mut read) = stream.split();
            while let Some(frame) = read.next().await {
                let forward = match frame {
                    Ok(Message::Binary(bytes)) => tx.send(Ok(bytes)).await,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = tx
                            .send(Err(ArborError::Transport(format!("hydrate read: {e}"))))
                            .await;
                        break;
                    }
                };
                // Receiver dropped: the consumer cancelled hydration.
                if forward.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn subtree(&self, id: &str, depth: u32) -> Result<Vec<NodeRow>> {
        let (reply, reply_rx) = oneshot::channel();
        self.send_request(Request::Subtree {
            id: id.to_string(),
            depth,
            reply,
        })
        .await?;
        reply_rx
            .await
            .map_err(|_| ArborError::Transport("connection closed during subtree".into()))?
    }
}

async fn connection_task<S>(
    stream: tokio_tungstenite::WebSocketStream<S>,
    mut request_rx: mpsc::Receiver<Request>,
    event_tx: mpsc::Sender<LiveEvent>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut write, mut read) = stream.split();
    let mut pending: Option<Pending> = None;

    loop {
        tokio::select! {
            // One request in flight at a time keeps reply correlation
            // unambiguous.
            request = request_rx.recv(), if pending.is_none() => {
                let Some(request) = request else { break };
                let (message, next) = match request {
                    Request::Push { operations, reply } => (
                        ClientMessage::Push { operations },
                        Pending::Push(reply),
                    ),
                    Request::Pull { cursor, reply } => (
                        ClientMessage::SyncStream { last_sync_timestamp: cursor },
                        Pending::StreamHeader(reply),
                    ),
                    Request::Subtree { id, depth, reply } => (
                        ClientMessage::Subtree { id, depth },
                        Pending::Subtree(reply),
                    ),
                };
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(e) => {
                        fail_pending(next, &format!("encode request: {e}"));
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json)).await {
                    fail_pending(next, &format!("send request: {e}"));
                    break;
                }
                pending = Some(next);
            }

            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        pending = handle_text(&text, pending, &event_tx).await;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("relay closed the connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::error!("websocket read error: {e}");
                        break;
                    }
                }
            }
        }
    }

    if let Some(next) = pending.take() {
        fail_pending(next, "connection lost");
    }
    let _ = event_tx.send(LiveEvent::Disconnected).await;
}

/// Route one text frame: tagged frames are broadcasts, everything else
/// belongs to the pending request. Malformed frames are logged and
/// dropped, never fatal to the stream.
async fn handle_text(
    text: &str,
    pending: Option<Pending>,
    event_tx: &mpsc::Sender<LiveEvent>,
) -> Option<Pending> {
    if let Ok(message) = serde_json::from_str::<ServerMessage>(text) {
        let event = match message {
            ServerMessage::Push { operations, sync_timestamp } => LiveEvent::Batch {
                operations,
                sync_timestamp,
            },
            ServerMessage::Connections { clients } => LiveEvent::Roster(clients),
            ServerMessage::Status { status } => LiveEvent::Status(status),
        };
        let _ = event_tx.send(event).await;
        return pending;
    }

    match pending {
        Some(Pending::Push(reply)) => {
            match serde_json::from_str::<PushAck>(text) {
                Ok(ack) => {
                    let _ = reply.send(Ok(ack.sync_timestamp));
                }
                Err(e) => {
                    let _ = reply.send(Err(ArborError::Protocol(format!("bad push ack: {e}"))));
                }
            }
            None
        }
        Some(Pending::StreamHeader(reply)) => {
            let header = match serde_json::from_str::<StreamHeader>(text) {
                Ok(header) => header,
                Err(e) => {
                    let _ = reply.send(Err(ArborError::Protocol(format!("bad stream header: {e}"))));
                    return None;
                }
            };
            let remaining = header.operations;
            let (lines, rx) = mpsc::channel(PULL_CHANNEL_CAPACITY);
            let _ = reply.send(Ok(PullStream {
                header,
                operations: rx,
            }));
            if remaining == 0 {
                None
            } else {
                Some(Pending::StreamBody { remaining, lines })
            }
        }
        Some(Pending::StreamBody { mut remaining, lines }) => {
            for op in decode_stream_lines(text) {
                remaining = remaining.saturating_sub(1);
                // A dropped receiver cancels the stream; keep counting so
                // the connection drains to a clean boundary.
                let _ = lines.send(Ok(op)).await;
            }
            if remaining == 0 {
                None
            } else {
                Some(Pending::StreamBody { remaining, lines })
            }
        }
        Some(Pending::Subtree(reply)) => {
            match serde_json::from_str::<Vec<NodeRow>>(text) {
                Ok(rows) => {
                    let _ = reply.send(Ok(rows));
                }
                Err(e) => {
                    let _ = reply.send(Err(ArborError::Protocol(format!("bad subtree reply: {e}"))));
                }
            }
            None
        }
        None => {
            log::warn!("dropping unexpected frame: {text}");
            None
        }
    }
}

fn fail_pending(pending: Pending, reason: &str) {
    let err = || ArborError::Transport(reason.to_string());
    match pending {
        Pending::Push(reply) => {
            let _ = reply.send(Err(err()));
        }
        Pending::StreamHeader(reply) => {
            let _ = reply.send(Err(err()));
        }
        Pending::StreamBody { lines, .. } => {
            let _ = lines.try_send(Err(err()));
        }
        Pending::Subtree(reply) => {
            let _ = reply.send(Err(err()));
        }
    }
}
