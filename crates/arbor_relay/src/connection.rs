use std::sync::Arc;

use arbor_core::protocol::ServerMessage;
use arbor_core::ClientId;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::room::{Room, RoomEvent};

/// One connected client of a room.
pub struct ClientConnection {
    pub client_id: ClientId,
    room: Arc<Room>,
    events: broadcast::Receiver<RoomEvent>,
}

impl ClientConnection {
    /// Join the room: subscribes to the fan-out and announces the roster.
    pub fn new(client_id: ClientId, room: Arc<Room>) -> Self {
        let events = room.join(&client_id);
        Self {
            client_id,
            room,
            events,
        }
    }

    /// Next broadcast addressed to this client (own pushes are filtered
    /// out). Returns `None` when the receiver lagged or the room closed;
    /// the caller should drop the connection so the client re-enters
    /// catch-up instead of silently missing deltas.
    pub async fn recv_broadcast(&mut self) -> Option<ServerMessage> {
        loop {
            match self.events.recv().await {
                Ok(event) => {
                    if event.origin.as_ref() == Some(&self.client_id) {
                        continue;
                    }
                    return Some(event.message);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("client {} lagged {} broadcasts, dropping", self.client_id, n);
                    return None;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        self.room.leave(&self.client_id);
        debug!("client disconnected: {}", self.client_id);
    }
}
