use crate::store::error::Result;
use async_trait::async_trait;

/// The durable storage boundary.
///
/// Values are opaque strings (JSON in practice). Implementations must make a
/// completed `set` visible to every later `get`, including after a process
/// restart for durable backends.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
    /// Drops every key. Used on sign-out.
    async fn clear(&self) -> Result<()>;
}

/// Well-known storage keys. Other keys under the same store belong to the
/// embedding application and are never touched here.
pub mod keys {
    pub const TOKEN: &str = "token";
    pub const REFRESH_TOKEN: &str = "refreshToken";
    /// Rotated connection token pushed by the server mid-session.
    pub const SOCKET_TOKEN: &str = "socketIoToken";
    /// Bulk conversation snapshot, a map of peer id to message list.
    pub const MESSAGES: &str = "messages";
    pub const UNREAD_MESSAGES: &str = "unreadMessages";
    /// Peers whose server-side message backlog still needs deletion.
    pub const PENDING_CLEANUP: &str = "messages:remove";

    /// Write-through record for a single conversation.
    pub fn peer_messages(peer_id: &str) -> String {
        format!("messages:{peer_id}")
    }
}
