//! Generic driver options and well-known labels.

use std::collections::HashMap;

/// Driver-specific options, passed through to drivers untouched.
pub type GenericOptions = HashMap<String, serde_json::Value>;

/// Well-known option and metadata keys.
pub mod labels {
    /// Generic option enabling IPv6 on a network.
    pub const ENABLE_IPV6: &str = "tether.network.enable_ipv6";

    /// IPAM metadata key carrying a driver-chosen gateway (CIDR form).
    pub const GATEWAY: &str = "tether.network.gateway";
}

/// Read a boolean flag out of a generic option map.
///
/// Accepts JSON booleans and the strings `"true"`/`"false"`.
#[must_use]
pub fn flag(options: &GenericOptions, key: &str) -> Option<bool> {
    match options.get(key)? {
        serde_json::Value::Bool(b) => Some(*b),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
