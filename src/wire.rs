use crate::types::Peer;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Event names shared between live frames and replayed operations.
pub mod events {
    pub const NEW_NOTIFICATION: &str = "notification:new-notification";
    pub const NEW_MESSAGE: &str = "message:new-message";
    pub const FRIEND_LOGIN: &str = "friend:login";
    pub const FRIEND_LOGOUT: &str = "friend:logout";
    pub const USER_NOT_ONLINE: &str = "message:user-not-online";
    pub const NOT_IN_FRIENDS_LIST: &str = "message:not-in-friends-list";
    pub const USER_CONFIRMED: &str = "friends:user-confirmed";
    pub const FRIEND_REMOVED: &str = "friends:friend-you-removed";
    pub const NEW_TOKEN: &str = "new_token";
    pub const ERROR: &str = "error";
    pub const SUCCESS: &str = "success";
    /// Outbound only.
    pub const SEND_MESSAGE: &str = "new:message";
    /// Reply frame confirming receipt of an ack-requesting event.
    pub const ACK: &str = "ack";
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// One framed socket event: a named event, a JSON payload, and an optional
/// id the server expects an acknowledgement reply for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireFrame {
    pub event: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
}

impl WireFrame {
    pub fn event(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event: name.into(),
            payload,
            ack: None,
        }
    }

    pub fn with_payload<T: Serialize>(
        name: impl Into<String>,
        payload: &T,
    ) -> Result<Self, WireError> {
        Ok(Self::event(name, serde_json::to_value(payload)?))
    }

    /// The `{"success": true}` reply the server expects for `ack` frames.
    pub fn ack_reply(id: u64) -> Self {
        Self {
            event: events::ACK.to_string(),
            payload: serde_json::json!({"success": true}),
            ack: Some(id),
        }
    }

    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, WireError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn encode(&self) -> Result<Bytes, WireError> {
        Ok(serde_json::to_vec(self)?.into())
    }

    pub fn decode(raw: &[u8]) -> Result<Self, WireError> {
        Ok(serde_json::from_slice(raw)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessagePayload {
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: String,
    pub body: String,
    pub correlation_id: String,
    #[serde(default = "Utc::now")]
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessagePayload {
    pub recipient_id: String,
    pub body: String,
}

/// Payload of `friend:login` and `friend:logout`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresencePayload {
    #[serde(rename = "friendID")]
    pub friend_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfirmedPayload {
    pub friend: Peer,
}

/// Payload of `friends:friend-you-removed`. The key casing is the server's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRemovedPayload {
    #[serde(rename = "IdUserRemoving")]
    pub peer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRotatedPayload {
    pub token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerErrorPayload {
    #[serde(default)]
    pub reason: String,
}

impl ServerErrorPayload {
    /// The server phrases credential rejections in prose, so detection is a
    /// substring match rather than a code.
    pub fn is_token_expired(&self) -> bool {
        self.reason.to_ascii_lowercase().contains("token expired")
    }
}
