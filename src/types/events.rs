use crate::types::message::Message;
use crate::types::peer::Peer;
use std::sync::{Arc, RwLock};

/// Why an outgoing message could not be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// The recipient has no live connection right now.
    RecipientOffline,
    /// The recipient is not (or no longer) in the sender's roster.
    NotInRoster,
}

/// Everything the core surfaces to the embedding application.
///
/// Dispatch is synchronous, so handlers must not block; anything slow should
/// be queued onto a task by the handler itself.
#[derive(Debug, Clone)]
pub enum Event {
    /// The realtime subscription is live and the backlog drain has started.
    Connected,
    /// The connection dropped unexpectedly; the client is retrying.
    Disconnected,
    /// A message for the active conversation, already cached and persisted.
    /// `remaining_in_batch` is non-zero while a replay batch is draining.
    MessageReceived {
        message: Message,
        remaining_in_batch: usize,
    },
    /// The unread count for a background conversation changed.
    UnreadChanged { peer_id: String, unread: usize },
    /// An application-level notification, forwarded verbatim.
    Notification(serde_json::Value),
    /// A peer's presence flag flipped.
    PresenceChanged { peer_id: String, online: bool },
    /// A pending roster request was accepted by the other side.
    PeerConfirmed(Peer),
    /// The other side removed us from their roster.
    PeerRemoved { peer_id: String },
    /// The server rejected an outgoing message.
    DeliveryFailed(DeliveryFailure),
    /// Credentials can no longer be refreshed; the user must sign in again.
    SessionExpired,
    /// Reconnecting was abandoned after repeated credential rejections.
    SessionFault { reason: String },
    /// The server is unreachable at the network level.
    NetworkUnavailable,
}

pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: &Event);
}

/// Fan-out point for [`Event`]s. Cloning shares the handler list.
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .expect("RwLock should not be poisoned")
            .push(handler);
    }

    pub fn has_handlers(&self) -> bool {
        !self
            .handlers
            .read()
            .expect("RwLock should not be poisoned")
            .is_empty()
    }

    pub fn dispatch(&self, event: &Event) {
        for handler in self
            .handlers
            .read()
            .expect("RwLock should not be poisoned")
            .iter()
        {
            handler.handle_event(event);
        }
    }
}
