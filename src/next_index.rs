use std::collections::HashMap;

use tokio::sync::RwLock;

/// Per-follower replication cursor: the index of the next log entry the
/// leader will send to each peer.
///
/// Shared between the driver and the flush tasks it spawns, which decrement
/// a peer's cursor on rejection and advance it on success.
#[derive(Debug)]
pub struct NextIndex {
    inner: RwLock<HashMap<u64, u64>>,
}

impl NextIndex {
    /// Builds the table with every cursor at `default_next_index`
    /// (conventionally the leader's last log index + 1).
    pub fn new(peer_ids: impl IntoIterator<Item = u64>, default_next_index: u64) -> Self {
        let inner = peer_ids
            .into_iter()
            .map(|id| (id, default_next_index))
            .collect();
        Self {
            inner: RwLock::new(inner),
        }
    }

    pub async fn get(&self, id: u64) -> u64 {
        self.inner.read().await.get(&id).copied().unwrap_or(1)
    }

    /// Step one entry back after a rejected AppendEntries, never below 1.
    pub async fn decrement(&self, id: u64) {
        let mut inner = self.inner.write().await;
        if let Some(next) = inner.get_mut(&id) {
            if *next > 1 {
                *next -= 1;
            }
        }
    }

    pub async fn set(&self, id: u64, index: u64) {
        self.inner.write().await.insert(id, index);
    }
}
