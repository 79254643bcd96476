//! IPAM driver contract.

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use ipnet::IpNet;
use tether_common::TetherResult;

/// Name of the built-in IPAM driver.
pub const DEFAULT_IPAM: &str = "default";

/// Driver-supplied metadata attached to a pool or an address.
pub type IpamMeta = HashMap<String, String>;

/// Network types that manage their own addressing and never touch IPAM.
pub const SELF_MANAGED_TYPES: [&str; 3] = ["host", "null", "bridge"];

/// Returns true if networks of this type skip IPAM entirely.
#[must_use]
pub fn manages_own_addresses(network_type: &str) -> bool {
    SELF_MANAGED_TYPES.contains(&network_type)
}

/// An address manager: hands out pools and addresses within them.
///
/// An exhausted pool answers [`request_address`](Self::request_address)
/// with `TetherError::NoAvailableAddresses`; the caller then moves on to
/// the next pool of the network.
#[async_trait]
pub trait IpamDriver: Send + Sync {
    /// The driver's default `(local, global)` address spaces.
    async fn default_address_spaces(&self) -> TetherResult<(String, String)>;

    /// Reserve a pool. An empty `pool` lets the driver choose one.
    ///
    /// Returns the pool ID, the pool itself and pool metadata.
    async fn request_pool(
        &self,
        address_space: &str,
        pool: &str,
        sub_pool: &str,
        options: &HashMap<String, String>,
        v6: bool,
    ) -> TetherResult<(String, IpNet, IpamMeta)>;

    /// Release a pool.
    async fn release_pool(&self, pool_id: &str) -> TetherResult<()>;

    /// Reserve an address in a pool, optionally a specific one.
    async fn request_address(
        &self,
        pool_id: &str,
        preferred: Option<IpAddr>,
        options: Option<&HashMap<String, String>>,
    ) -> TetherResult<(IpNet, IpamMeta)>;

    /// Release an address back to its pool.
    async fn release_address(&self, pool_id: &str, address: IpAddr) -> TetherResult<()>;
}
