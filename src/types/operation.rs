use serde::{Deserialize, Serialize};

/// An event the server buffered while this device was offline.
///
/// Operations carry the same name/payload shape as live socket events and are
/// replayed through the same handlers. The optional sequence hint is advisory
/// only; array order is authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(
        default,
        rename = "sequenceHint",
        skip_serializing_if = "Option::is_none"
    )]
    pub seq: Option<u64>,
}

impl Operation {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
            seq: None,
        }
    }
}
