use serde::{Deserialize, Serialize};

/// A confirmed counterparty in the roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Live presence flag, flipped by realtime events and replay.
    #[serde(default)]
    pub online: bool,
}

impl Peer {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            online: false,
        }
    }
}
