use crate::api::{ApiClient, ApiError};
use crate::types::Peer;
use log::debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// In-memory roster of confirmed peers with their live presence flags.
///
/// The list is fetched lazily on first use and then maintained by realtime
/// events until sign-out.
pub struct PeerRoster {
    api: Arc<ApiClient>,
    peers: RwLock<Vec<Peer>>,
    loaded: AtomicBool,
}

impl PeerRoster {
    pub fn new(api: Arc<ApiClient>) -> Self {
        Self {
            api,
            peers: RwLock::new(Vec::new()),
            loaded: AtomicBool::new(false),
        }
    }

    /// Returns the roster, fetching it from the server on first use.
    pub async fn load(&self) -> Result<Vec<Peer>, ApiError> {
        if self.loaded.load(Ordering::SeqCst) {
            return Ok(self.peers.read().await.clone());
        }
        let fetched = self.api.get_friends().await?;
        let mut peers = self.peers.write().await;
        // Someone else may have finished the fetch while ours was in flight;
        // their copy (already receiving live updates) wins.
        if !self.loaded.swap(true, Ordering::SeqCst) {
            *peers = fetched;
        }
        Ok(peers.clone())
    }

    /// Flips a peer's presence flag. Unknown peers are ignored.
    pub async fn set_presence(&self, peer_id: &str, online: bool) {
        let mut peers = self.peers.write().await;
        match peers.iter_mut().find(|p| p.id == peer_id) {
            Some(peer) => peer.online = online,
            None => {
                debug!(target: "Client/Roster", "Presence flip for unknown peer {peer_id}")
            }
        }
    }

    /// Adds a newly confirmed peer. Repeat confirmations are no-ops.
    pub async fn confirm(&self, peer: Peer) {
        let mut peers = self.peers.write().await;
        if peers.iter().any(|p| p.id == peer.id) {
            return;
        }
        peers.push(peer);
    }

    /// Drops a peer. Removing an absent peer is a no-op.
    pub async fn remove(&self, peer_id: &str) {
        self.peers.write().await.retain(|p| p.id != peer_id);
    }

    pub async fn snapshot(&self) -> Vec<Peer> {
        self.peers.read().await.clone()
    }

    pub async fn is_online(&self, peer_id: &str) -> bool {
        self.peers
            .read()
            .await
            .iter()
            .any(|p| p.id == peer_id && p.online)
    }

    pub async fn clear(&self) {
        self.peers.write().await.clear();
        self.loaded.store(false, Ordering::SeqCst);
    }
}
