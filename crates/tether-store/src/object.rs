//! The persisted-entity contract.

use tether_common::{Scope, TetherResult};

/// Root of every key written by Tether.
pub const DEFAULT_ROOT_CHAIN: &str = "tether/network/v1.0";

/// Key prefix for network objects.
pub const NETWORK_KEY_PREFIX: &str = "network";

/// Key prefix for endpoint objects.
pub const ENDPOINT_KEY_PREFIX: &str = "endpoint";

/// An entity that can be written to a [`KvStore`](crate::KvStore).
///
/// Implementors guard their own state, so every method takes `&self`.
pub trait KvObject: Send + Sync {
    /// Key segments below the root chain, e.g. `["network", "<id>"]`.
    fn key(&self) -> Vec<String>;

    /// Key segments shared by every object of this type.
    fn key_prefix(&self) -> Vec<String>;

    /// Serialized value.
    ///
    /// # Errors
    ///
    /// Returns an error if the object cannot be serialized.
    fn value(&self) -> TetherResult<Vec<u8>>;

    /// Replace the object's fields from a serialized value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be decoded.
    fn set_value(&self, value: &[u8]) -> TetherResult<()>;

    /// Version index of the last successful read or write.
    fn index(&self) -> u64;

    /// Record a new version index. Also marks the object as existing.
    fn set_index(&self, index: u64);

    /// Whether the object is known to exist in the store.
    fn exists(&self) -> bool;

    /// Objects that must never reach the store return true.
    fn skip(&self) -> bool;

    /// Scope of the store this object belongs in.
    fn data_scope(&self) -> Scope;

    /// A blank instance wired to the same owner, for decoding into.
    fn new_object(&self) -> Self
    where
        Self: Sized;

    /// Deep copy into `dst`.
    fn copy_to(&self, dst: &Self)
    where
        Self: Sized;
}

/// Join key segments below a root chain.
#[must_use]
pub fn join_key<S: AsRef<str>>(root: &str, segments: &[S]) -> String {
    let mut key = root.trim_end_matches('/').to_string();
    for segment in segments {
        key.push('/');
        key.push_str(segment.as_ref());
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_joining() {
        let key = join_key(DEFAULT_ROOT_CHAIN, &[NETWORK_KEY_PREFIX, "abc"]);
        insta::assert_snapshot!(key, @"tether/network/v1.0/network/abc");

        let prefix = join_key("root/", &[ENDPOINT_KEY_PREFIX, "net"]);
        assert_eq!(prefix, "root/endpoint/net");
    }
}
