//! Scope-bound store wrapper that speaks [`KvObject`].

use std::sync::Arc;

use tether_common::{Scope, TetherResult};

use crate::kv::KvStore;
use crate::object::{DEFAULT_ROOT_CHAIN, KvObject, join_key};

/// A [`KvStore`] bound to one scope and one key root chain.
#[derive(Clone)]
pub struct DataStore {
    scope: Scope,
    root: String,
    store: Arc<dyn KvStore>,
}

impl std::fmt::Debug for DataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStore")
            .field("scope", &self.scope)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl DataStore {
    /// Wrap a backend for the given scope, under the default root chain.
    pub fn new(scope: Scope, store: Arc<dyn KvStore>) -> Self {
        Self::with_root(scope, DEFAULT_ROOT_CHAIN, store)
    }

    /// Wrap a backend under a custom root chain.
    pub fn with_root(scope: Scope, root: impl Into<String>, store: Arc<dyn KvStore>) -> Self {
        Self {
            scope,
            root: root.into(),
            store,
        }
    }

    /// Scope served by this store.
    #[must_use]
    pub const fn scope(&self) -> Scope {
        self.scope
    }

    /// The underlying backend.
    #[must_use]
    pub fn kv_store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Full key for the given segments.
    #[must_use]
    pub fn key<S: AsRef<str>>(&self, segments: &[S]) -> String {
        join_key(&self.root, segments)
    }

    /// Write an object, carrying its last-known index for conflict detection.
    ///
    /// Objects whose [`KvObject::skip`] is true are not written.
    ///
    /// # Errors
    ///
    /// Returns `KeyModified` if another writer got there first.
    pub async fn put_object_atomic<T: KvObject + ?Sized>(&self, object: &T) -> TetherResult<()> {
        if object.skip() {
            return Ok(());
        }

        let key = self.key(&object.key());
        let value = object.value()?;
        let previous = object.exists().then(|| object.index());

        let index = self.store.atomic_put(&key, value, previous).await?;
        object.set_index(index);

        tracing::debug!(key = %key, index, scope = %self.scope, "Stored object");
        Ok(())
    }

    /// Delete an object if it is still at its last-known index.
    ///
    /// # Errors
    ///
    /// Returns `KeyModified` if the stored object changed since it was read.
    pub async fn delete_object_atomic<T: KvObject + ?Sized>(
        &self,
        object: &T,
    ) -> TetherResult<()> {
        if object.skip() {
            return Ok(());
        }

        let key = self.key(&object.key());
        self.store.atomic_delete(&key, object.index()).await?;

        tracing::debug!(key = %key, scope = %self.scope, "Deleted object");
        Ok(())
    }

    /// Read the object stored under `key` into `object`.
    ///
    /// # Errors
    ///
    /// Returns `KeyNotFound` if nothing is stored there.
    pub async fn get_object<T: KvObject + ?Sized>(
        &self,
        key: &[String],
        object: &T,
    ) -> TetherResult<()> {
        let pair = self.store.get(&self.key(key)).await?;
        object.set_value(&pair.value)?;
        object.set_index(pair.last_index);
        Ok(())
    }

    /// Decode every object below `prefix`, using `template` to make blanks.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails or a value cannot be decoded.
    pub async fn list<T: KvObject>(&self, prefix: &[String], template: &T) -> TetherResult<Vec<T>> {
        let pairs = self.store.list(&self.key(prefix)).await?;
        let mut objects = Vec::with_capacity(pairs.len());

        for pair in pairs {
            let object = template.new_object();
            object.set_value(&pair.value)?;
            object.set_index(pair.last_index);
            objects.push(object);
        }

        Ok(objects)
    }

    /// Check whether anything is stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub async fn exists(&self, key: &[String]) -> TetherResult<bool> {
        self.store.exists(&self.key(key)).await
    }
}
