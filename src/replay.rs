use crate::types::Operation;
use crate::wire::{PresencePayload, events};
use std::collections::HashMap;

/// Reduces a replay batch before application: of all presence flips for a
/// peer only the last one in the batch survives, since the final flag is the
/// only observable outcome. Everything else keeps its relative order.
///
/// Presence operations with an unreadable payload pass through untouched so
/// the regular handler path gets to report them.
pub fn collapse_presence(ops: Vec<Operation>) -> Vec<Operation> {
    let mut last_presence: HashMap<String, usize> = HashMap::new();
    for (index, op) in ops.iter().enumerate() {
        if let Some(peer) = presence_peer(op) {
            last_presence.insert(peer, index);
        }
    }

    ops.into_iter()
        .enumerate()
        .filter(|(index, op)| match presence_peer(op) {
            Some(peer) => last_presence.get(&peer) == Some(index),
            None => true,
        })
        .map(|(_, op)| op)
        .collect()
}

fn presence_peer(op: &Operation) -> Option<String> {
    if op.name != events::FRIEND_LOGIN && op.name != events::FRIEND_LOGOUT {
        return None;
    }
    serde_json::from_value::<PresencePayload>(op.payload.clone())
        .ok()
        .map(|payload| payload.friend_id)
}
