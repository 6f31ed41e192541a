use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sent,
    Received,
}

/// One line of a conversation, keyed to the counterparty it belongs to.
///
/// `correlation_id` is unique per message across the whole cache and is the
/// handle used to suppress duplicate delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub peer_id: String,
    pub direction: Direction,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    pub correlation_id: String,
}

impl Message {
    /// A locally authored message with a freshly minted correlation id.
    pub fn sent(peer_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            direction: Direction::Sent,
            body: body.into(),
            sent_at: Utc::now(),
            correlation_id: new_correlation_id(),
        }
    }

    pub fn received(
        peer_id: impl Into<String>,
        body: impl Into<String>,
        correlation_id: impl Into<String>,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            direction: Direction::Received,
            body: body.into(),
            sent_at,
            correlation_id: correlation_id.into(),
        }
    }
}

pub fn new_correlation_id() -> String {
    use rand::RngCore;
    let mut raw = [0u8; 16];
    rand::rng().fill_bytes(&mut raw);
    hex::encode(raw)
}
