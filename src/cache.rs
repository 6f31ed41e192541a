use crate::api::ApiClient;
use crate::store::traits::keys;
use crate::store::{self, KeyValueStore};
use crate::types::Message;
use crate::types::events::{Event, EventBus};
use crate::wire::{InboundMessagePayload, OutboundMessagePayload, WireFrame, events as wire_events};
use dashmap::DashMap;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("no active conversation to send into")]
    NoActiveChat,
}

#[derive(Default)]
struct CacheState {
    /// Full conversation per peer, oldest first.
    histories: HashMap<String, Vec<Message>>,
    /// Unread messages per peer. Entries exist only for background peers.
    unread: HashMap<String, Vec<Message>>,
    /// The conversation the user is looking at right now.
    active_peer: Option<String>,
    /// Peers whose persisted history has been merged this session.
    loaded_peers: HashSet<String>,
    /// Peers whose server-side backlog still awaits deletion.
    pending_cleanup: HashSet<String>,
    /// Server backlog fetched over HTTP, waiting for its conversation to be
    /// opened for the first time.
    staged: HashMap<String, Vec<Message>>,
}

/// The write-through conversation store.
///
/// Every mutation lands in memory first and is flushed to storage right
/// after; storage failures are logged and never block the conversation.
/// The `seen` set holds every correlation id the cache has accepted and is
/// the single gate that keeps redelivered messages out.
pub struct ConversationCache {
    storage: Arc<dyn KeyValueStore>,
    api: Arc<ApiClient>,
    bus: EventBus,
    outbound: mpsc::Sender<WireFrame>,
    state: Mutex<CacheState>,
    seen: DashMap<String, ()>,
    backlog_fetched: AtomicBool,
}

impl ConversationCache {
    pub fn new(
        storage: Arc<dyn KeyValueStore>,
        api: Arc<ApiClient>,
        bus: EventBus,
        outbound: mpsc::Sender<WireFrame>,
    ) -> Self {
        Self {
            storage,
            api,
            bus,
            outbound,
            state: Mutex::new(CacheState::default()),
            seen: DashMap::new(),
            backlog_fetched: AtomicBool::new(false),
        }
    }

    /// Reloads the unread index and the cleanup backlog after a cold start.
    /// Conversations themselves load lazily via [`Self::load_history`], but
    /// every persisted correlation id is registered up front so redelivered
    /// messages are recognized before their conversation is opened.
    pub async fn restore(&self) {
        let unread: HashMap<String, Vec<Message>> = self
            .read_record(keys::UNREAD_MESSAGES)
            .await
            .unwrap_or_default();
        let pending: HashSet<String> = self
            .read_record(keys::PENDING_CLEANUP)
            .await
            .unwrap_or_default();

        for message in unread.values().flatten() {
            self.seen.insert(message.correlation_id.clone(), ());
        }
        if let Some(all) = self
            .read_record::<HashMap<String, Vec<Message>>>(keys::MESSAGES)
            .await
        {
            for message in all.values().flatten() {
                self.seen.insert(message.correlation_id.clone(), ());
            }
        }

        let mut st = self.state.lock().await;
        st.unread = unread;
        st.pending_cleanup = pending;
    }

    /// Ingests one inbound message, live or replayed; both paths meet here.
    ///
    /// A correlation id the cache already holds makes this a no-op, which is
    /// what lets live delivery and replay race without duplicating anything.
    pub async fn receive(&self, payload: InboundMessagePayload, remaining_in_batch: usize) {
        let peer_id = payload.sender_id.clone();
        // Runs before the duplicate gate so the persisted record's ids are
        // in `seen`, and before the append so the snapshot below is full.
        self.ensure_loaded(&peer_id).await;

        let message = Message::received(
            payload.sender_id,
            payload.body,
            payload.correlation_id,
            payload.sent_at,
        );
        if self
            .seen
            .insert(message.correlation_id.clone(), ())
            .is_some()
        {
            debug!(
                target: "Client/Cache",
                "Suppressed duplicate message {}", message.correlation_id
            );
            return;
        }

        let (history_snapshot, unread_snapshot, unread_count, is_active) = {
            let mut st = self.state.lock().await;
            st.histories
                .entry(peer_id.clone())
                .or_default()
                .push(message.clone());
            let is_active = st.active_peer.as_deref() == Some(peer_id.as_str());
            let mut unread_count = 0;
            if !is_active {
                let list = st.unread.entry(peer_id.clone()).or_default();
                list.push(message.clone());
                unread_count = list.len();
            }
            (
                st.histories.get(&peer_id).cloned().unwrap_or_default(),
                (!is_active).then(|| st.unread.clone()),
                unread_count,
                is_active,
            )
        };

        self.write_history(&peer_id, &history_snapshot).await;
        if let Some(unread) = unread_snapshot {
            self.write_unread(&unread).await;
        }

        if is_active {
            self.bus.dispatch(&Event::MessageReceived {
                message,
                remaining_in_batch,
            });
        } else {
            self.bus.dispatch(&Event::UnreadChanged {
                peer_id,
                unread: unread_count,
            });
        }
    }

    /// Appends a message authored here to the active conversation and queues
    /// it for the socket.
    pub async fn send(&self, body: impl Into<String>) -> Result<Message, CacheError> {
        let body = body.into();
        let peer_id = {
            let st = self.state.lock().await;
            st.active_peer.clone().ok_or(CacheError::NoActiveChat)?
        };
        self.ensure_loaded(&peer_id).await;

        let (message, history_snapshot) = {
            let mut st = self.state.lock().await;
            let message = Message::sent(peer_id.clone(), body.clone());
            self.seen.insert(message.correlation_id.clone(), ());
            let list = st.histories.entry(peer_id.clone()).or_default();
            list.push(message.clone());
            (message, list.clone())
        };

        self.write_history(&peer_id, &history_snapshot).await;

        match WireFrame::with_payload(
            wire_events::SEND_MESSAGE,
            &OutboundMessagePayload {
                recipient_id: message.peer_id.clone(),
                body,
            },
        ) {
            Ok(frame) => {
                if self.outbound.send(frame).await.is_err() {
                    warn!(
                        target: "Client/Cache",
                        "Outbound queue closed; message kept locally only"
                    );
                }
            }
            Err(e) => warn!(target: "Client/Cache", "Failed to encode outbound message: {e}"),
        }

        Ok(message)
    }

    /// Marks a conversation as actively viewed: clears its unread entry and,
    /// the first time, asks the server to drop its delivered backlog.
    ///
    /// Calling this again for the same peer changes nothing, so rapid
    /// re-entry into the same chat is harmless.
    pub async fn start_chat(&self, peer_id: &str) {
        let unread_snapshot = {
            let mut st = self.state.lock().await;
            st.active_peer = Some(peer_id.to_string());
            let cleared = st.unread.remove(peer_id).is_some();
            cleared.then(|| st.unread.clone())
        };

        if let Some(unread) = unread_snapshot {
            self.write_unread(&unread).await;
        }

        self.run_pending_cleanup(peer_id).await;
    }

    /// The user left the conversation; new messages count as unread again.
    pub async fn end_chat(&self) {
        self.state.lock().await.active_peer = None;
    }

    /// Returns the full conversation with a peer, assembling it on first
    /// access from the persisted record, the staged server backlog, and
    /// whatever already arrived live this session.
    pub async fn load_history(&self, peer_id: &str) -> Vec<Message> {
        let merged = self.ensure_loaded(peer_id).await;

        let viewing = self.state.lock().await.active_peer.as_deref() == Some(peer_id);
        if viewing {
            self.run_pending_cleanup(peer_id).await;
        }

        merged
    }

    /// Merges a peer's persisted record, staged backlog, and live arrivals
    /// into memory, once per session. Every append goes behind this call:
    /// a write-through snapshot taken before the merge would shadow the
    /// persisted record.
    async fn ensure_loaded(&self, peer_id: &str) -> Vec<Message> {
        {
            let st = self.state.lock().await;
            if st.loaded_peers.contains(peer_id) {
                return st.histories.get(peer_id).cloned().unwrap_or_default();
            }
        }

        // Per-conversation record first, the bulk snapshot as fallback.
        let mut persisted: Vec<Message> = match self
            .read_record::<Vec<Message>>(&keys::peer_messages(peer_id))
            .await
        {
            Some(list) => list,
            None => self
                .read_record::<HashMap<String, Vec<Message>>>(keys::MESSAGES)
                .await
                .and_then(|mut all| all.remove(peer_id))
                .unwrap_or_default(),
        };

        if persisted.is_empty() {
            self.fetch_backlog_once().await;
        }

        let mut ids: HashSet<String> = HashSet::new();
        persisted.retain(|m| ids.insert(m.correlation_id.clone()));
        for id in &ids {
            self.seen.insert(id.clone(), ());
        }

        let merged = {
            let mut st = self.state.lock().await;
            // A concurrent call may have finished the merge while we were
            // reading storage; its result is already live.
            if st.loaded_peers.contains(peer_id) {
                return st.histories.get(peer_id).cloned().unwrap_or_default();
            }
            let mut merged = persisted;
            if let Some(staged) = st.staged.remove(peer_id) {
                for message in staged {
                    if ids.insert(message.correlation_id.clone()) {
                        merged.push(message);
                    }
                }
            }
            if let Some(live) = st.histories.remove(peer_id) {
                for message in live {
                    if ids.insert(message.correlation_id.clone()) {
                        merged.push(message);
                    }
                }
            }
            st.histories.insert(peer_id.to_string(), merged.clone());
            st.loaded_peers.insert(peer_id.to_string());
            merged
        };

        // An empty merge has nothing to record and must not resurrect a
        // key that sign-out removed.
        if !merged.is_empty() {
            self.write_history(peer_id, &merged).await;
        }
        merged
    }

    /// Claims and runs the one-shot server-side backlog deletion for a peer.
    /// The claim comes out of the set before the request goes out, so rapid
    /// repeat calls cannot double-fire; a failed request puts it back.
    async fn run_pending_cleanup(&self, peer_id: &str) {
        let claimed = self.state.lock().await.pending_cleanup.remove(peer_id);
        if !claimed {
            return;
        }
        match self.api.delete_initial_messages(peer_id).await {
            Ok(()) => {
                debug!(target: "Client/Cache", "Server backlog for {peer_id} deleted");
                let pending = self.state.lock().await.pending_cleanup.clone();
                self.write_cleanup(&pending).await;
            }
            Err(e) => {
                warn!(
                    target: "Client/Cache",
                    "Backlog cleanup for {peer_id} failed, keeping it queued: {e}"
                );
                self.state
                    .lock()
                    .await
                    .pending_cleanup
                    .insert(peer_id.to_string());
            }
        }
    }

    /// Flushes the in-memory state wholesale. Called when the app heads to
    /// the background and might not come back.
    pub async fn persist(&self) {
        let (histories, unread) = {
            let st = self.state.lock().await;
            (st.histories.clone(), st.unread.clone())
        };
        if let Err(e) = store::set_json(self.storage.as_ref(), keys::MESSAGES, &histories).await {
            warn!(target: "Client/Cache", "Failed to persist conversation snapshot: {e}");
        }
        self.write_unread(&unread).await;
    }

    /// Erases every conversation, unread entry, and persisted record.
    pub async fn clear_on_sign_out(&self) {
        let mut peers: HashSet<String> = {
            let mut st = self.state.lock().await;
            let mut peers: HashSet<String> = st.histories.keys().cloned().collect();
            peers.extend(st.unread.keys().cloned());
            peers.extend(st.staged.keys().cloned());
            peers.extend(st.pending_cleanup.iter().cloned());
            *st = CacheState::default();
            peers
        };
        self.seen.clear();
        self.backlog_fetched.store(false, Ordering::SeqCst);

        // Prior sessions may have written conversations we never touched.
        if let Some(all) = self
            .read_record::<HashMap<String, Vec<Message>>>(keys::MESSAGES)
            .await
        {
            peers.extend(all.into_keys());
        }
        for peer in &peers {
            self.remove_key(&keys::peer_messages(peer)).await;
        }
        for key in [keys::MESSAGES, keys::UNREAD_MESSAGES, keys::PENDING_CLEANUP] {
            self.remove_key(key).await;
        }
    }

    pub async fn unread_count(&self, peer_id: &str) -> usize {
        self.state
            .lock()
            .await
            .unread
            .get(peer_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub async fn total_unread(&self) -> usize {
        self.state.lock().await.unread.values().map(Vec::len).sum()
    }

    pub async fn active_peer(&self) -> Option<String> {
        self.state.lock().await.active_peer.clone()
    }

    /// One-shot fetch of the messages the server held before this device
    /// first connected. Distributes them into the staging area per sender.
    async fn fetch_backlog_once(&self) {
        if self.backlog_fetched.swap(true, Ordering::SeqCst) {
            return;
        }
        let backlog = match self.api.get_initial_messages().await {
            Ok(list) => list,
            Err(e) => {
                warn!(target: "Client/Cache", "Server backlog fetch failed: {e}");
                return;
            }
        };
        if backlog.is_empty() {
            return;
        }

        let pending = {
            let mut st = self.state.lock().await;
            for payload in backlog {
                let InboundMessagePayload {
                    sender_id,
                    body,
                    correlation_id,
                    sent_at,
                    ..
                } = payload;
                if self.seen.insert(correlation_id.clone(), ()).is_some() {
                    continue;
                }
                st.pending_cleanup.insert(sender_id.clone());
                st.staged.entry(sender_id.clone()).or_default().push(
                    Message::received(sender_id, body, correlation_id, sent_at),
                );
            }
            st.pending_cleanup.clone()
        };
        self.write_cleanup(&pending).await;
    }

    async fn read_record<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match store::get_json(self.storage.as_ref(), key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(target: "Client/Cache", "Failed to read '{key}': {e}");
                None
            }
        }
    }

    async fn write_history(&self, peer_id: &str, messages: &[Message]) {
        if let Err(e) = store::set_json(
            self.storage.as_ref(),
            &keys::peer_messages(peer_id),
            &messages,
        )
        .await
        {
            warn!(target: "Client/Cache", "Failed to persist conversation {peer_id}: {e}");
        }
    }

    async fn write_unread(&self, unread: &HashMap<String, Vec<Message>>) {
        if let Err(e) = store::set_json(self.storage.as_ref(), keys::UNREAD_MESSAGES, unread).await
        {
            warn!(target: "Client/Cache", "Failed to persist unread index: {e}");
        }
    }

    async fn write_cleanup(&self, pending: &HashSet<String>) {
        if let Err(e) =
            store::set_json(self.storage.as_ref(), keys::PENDING_CLEANUP, pending).await
        {
            warn!(target: "Client/Cache", "Failed to persist cleanup backlog: {e}");
        }
    }

    async fn remove_key(&self, key: &str) {
        if let Err(e) = self.storage.remove(key).await {
            warn!(target: "Client/Cache", "Failed to remove '{key}': {e}");
        }
    }
}
