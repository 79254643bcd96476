//! Backend contract for key/value stores with optimistic concurrency.

use async_trait::async_trait;
use tether_common::TetherResult;

/// A stored value and the version index it was written at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    /// Full key.
    pub key: String,
    /// Stored bytes.
    pub value: Vec<u8>,
    /// Version index of the last write to this key.
    pub last_index: u64,
}

/// A key/value store supporting compare-and-swap writes.
///
/// Conflicts are reported as [`TetherError::KeyModified`]
/// and are never retried by the store.
///
/// [`TetherError::KeyModified`]: tether_common::TetherError::KeyModified
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a key.
    ///
    /// # Errors
    ///
    /// Returns `KeyNotFound` if the key does not exist.
    async fn get(&self, key: &str) -> TetherResult<KvPair>;

    /// Check whether a key exists.
    async fn exists(&self, key: &str) -> TetherResult<bool>;

    /// List every key below `prefix`. Unknown prefixes yield an empty list.
    async fn list(&self, prefix: &str) -> TetherResult<Vec<KvPair>>;

    /// Write a key if it is still at `previous`.
    ///
    /// With `previous == None` the key must not exist yet. Returns the new
    /// version index.
    ///
    /// # Errors
    ///
    /// Returns `KeyModified` if the key moved past `previous` (or exists when
    /// `previous` is `None`).
    async fn atomic_put(&self, key: &str, value: Vec<u8>, previous: Option<u64>)
    -> TetherResult<u64>;

    /// Delete a key if it is still at `previous`.
    ///
    /// # Errors
    ///
    /// Returns `KeyNotFound` if the key is gone and `KeyModified` if it was
    /// rewritten since `previous`.
    async fn atomic_delete(&self, key: &str, previous: u64) -> TetherResult<()>;
}
