//! Connection handles: the relay's view of one live WebSocket.
//!
//! A handle is cheap to clone and is what the registry stores against a
//! device id. Sending through it never blocks and never fails loudly: if the
//! socket has already gone away the event is dropped.

use crate::protocol::ServerEvent;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Opaque per-connection identifier.
pub type ConnectionId = Uuid;

#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

impl ConnectionHandle {
    /// Open a new handle plus the receiving end drained by the socket writer.
    pub fn open() -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            id: Uuid::new_v4(),
            tx,
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Fire-and-forget delivery to this connection.
    pub fn send(&self, event: ServerEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!(connection = %self.id, "Dropping event for closed connection");
        }
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}
