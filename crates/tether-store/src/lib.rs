//! # tether-store
//!
//! Persistence for Tether networks and endpoints.
//!
//! Every persisted entity implements [`KvObject`]. Writes go through a
//! [`DataStore`], which carries the object's last-read version index into
//! the backend so concurrent writers from other controllers are detected
//! instead of overwritten. Backends implement [`KvStore`]; [`MemoryStore`]
//! is the in-process backend.

#![warn(missing_docs)]

pub mod datastore;
pub mod kv;
pub mod memory;
pub mod object;

pub use datastore::DataStore;
pub use kv::{KvPair, KvStore};
pub use memory::MemoryStore;
pub use object::{
    DEFAULT_ROOT_CHAIN, ENDPOINT_KEY_PREFIX, KvObject, NETWORK_KEY_PREFIX, join_key,
};
