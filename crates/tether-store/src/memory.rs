//! In-process store backend.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tether_common::{TetherError, TetherResult};

use crate::kv::{KvPair, KvStore};

#[derive(Debug, Default)]
struct Entries {
    /// Key to (value, version index).
    values: BTreeMap<String, (Vec<u8>, u64)>,
    /// Last version index handed out.
    last_index: u64,
}

/// A [`KvStore`] held in memory.
///
/// Version indexes increase monotonically across all keys, so a stale
/// index is never reused by a later write.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<Entries>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All keys currently stored, in order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.entries.lock().values.keys().cloned().collect()
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().values.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> TetherResult<KvPair> {
        let entries = self.entries.lock();
        entries
            .values
            .get(key)
            .map(|(value, index)| KvPair {
                key: key.to_string(),
                value: value.clone(),
                last_index: *index,
            })
            .ok_or_else(|| TetherError::KeyNotFound {
                key: key.to_string(),
            })
    }

    async fn exists(&self, key: &str) -> TetherResult<bool> {
        Ok(self.entries.lock().values.contains_key(key))
    }

    async fn list(&self, prefix: &str) -> TetherResult<Vec<KvPair>> {
        let dir = format!("{}/", prefix.trim_end_matches('/'));
        let entries = self.entries.lock();
        Ok(entries
            .values
            .range(dir.clone()..)
            .take_while(|(key, _)| key.starts_with(&dir))
            .map(|(key, (value, index))| KvPair {
                key: key.clone(),
                value: value.clone(),
                last_index: *index,
            })
            .collect())
    }

    async fn atomic_put(
        &self,
        key: &str,
        value: Vec<u8>,
        previous: Option<u64>,
    ) -> TetherResult<u64> {
        let mut entries = self.entries.lock();
        let current = entries.values.get(key).map(|(_, index)| *index);

        if current != previous {
            tracing::debug!(key, ?current, ?previous, "Atomic put rejected");
            return Err(TetherError::KeyModified {
                key: key.to_string(),
            });
        }

        entries.last_index += 1;
        let index = entries.last_index;
        entries.values.insert(key.to_string(), (value, index));
        Ok(index)
    }

    async fn atomic_delete(&self, key: &str, previous: u64) -> TetherResult<()> {
        let mut entries = self.entries.lock();
        match entries.values.get(key).map(|(_, index)| *index) {
            None => Err(TetherError::KeyNotFound {
                key: key.to_string(),
            }),
            Some(current) if current != previous => {
                tracing::debug!(key, current, previous, "Atomic delete rejected");
                Err(TetherError::KeyModified {
                    key: key.to_string(),
                })
            }
            Some(_) => {
                entries.values.remove(key);
                Ok(())
            }
        }
    }
}
