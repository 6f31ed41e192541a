pub mod error;
pub mod filestore;
pub mod memory;
pub mod traits;

pub use error::{Result, StoreError};
pub use filestore::FileStore;
pub use memory::MemoryStore;
pub use traits::{KeyValueStore, keys};

use serde::{Serialize, de::DeserializeOwned};

/// Reads a JSON-encoded record, treating an absent key as `None`.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StoreError::Serialization(e.to_string())),
        None => Ok(None),
    }
}

pub async fn set_json<T: Serialize>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<()> {
    let raw =
        serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
    store.set(key, &raw).await
}
