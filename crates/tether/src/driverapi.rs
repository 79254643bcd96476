//! Network driver contract.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tether_common::{GenericOptions, Scope, TetherResult};

use crate::endpoint::EndpointInterface;

/// What a driver declares about itself at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capability {
    /// Scope of the state the driver's networks live in.
    pub data_scope: Scope,
}

impl Capability {
    /// A driver whose networks are local to this host.
    #[must_use]
    pub const fn local() -> Self {
        Self {
            data_scope: Scope::Local,
        }
    }

    /// A driver whose networks span cooperating hosts.
    #[must_use]
    pub const fn global() -> Self {
        Self {
            data_scope: Scope::Global,
        }
    }
}

/// Addressing handed to a driver for one allocated pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpamData {
    /// Address space the pool was allocated from.
    #[serde(rename = "AddressSpace")]
    pub address_space: String,

    /// The pool.
    #[serde(rename = "Pool")]
    pub pool: IpNet,

    /// Gateway, in CIDR form.
    #[serde(rename = "Gateway", default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpNet>,

    /// Auxiliary addresses reserved for the driver, by name.
    #[serde(
        rename = "AuxAddresses",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub aux_addresses: BTreeMap<String, IpNet>,
}

impl IpamData {
    /// Data for a freshly allocated pool, without gateway or auxiliary addresses.
    #[must_use]
    pub fn new(address_space: impl Into<String>, pool: IpNet) -> Self {
        Self {
            address_space: address_space.into(),
            pool,
            gateway: None,
            aux_addresses: BTreeMap::new(),
        }
    }
}

/// A network driver: realizes networks and endpoints on the host.
///
/// `create_network` may be called again for a network the driver already
/// knows when the network type is registered lazily; drivers should treat
/// that as a no-op.
#[async_trait]
pub trait NetworkDriver: Send + Sync {
    /// Realize a network.
    async fn create_network(
        &self,
        network_id: &str,
        options: &GenericOptions,
        ipv4: &[IpamData],
        ipv6: &[IpamData],
    ) -> TetherResult<()>;

    /// Tear a network down. A `Forbidden` error aborts the deletion.
    async fn delete_network(&self, network_id: &str) -> TetherResult<()>;

    /// Realize an endpoint with the given interface.
    async fn create_endpoint(
        &self,
        network_id: &str,
        endpoint_id: &str,
        iface: &EndpointInterface,
        options: &GenericOptions,
    ) -> TetherResult<()>;

    /// Tear an endpoint down. A `Forbidden` error aborts the deletion.
    async fn delete_endpoint(&self, network_id: &str, endpoint_id: &str) -> TetherResult<()>;
}

/// Loads drivers on demand for network types nobody registered.
#[async_trait]
pub trait DriverLoader: Send + Sync {
    /// Load the driver for `network_type`.
    async fn load(
        &self,
        network_type: &str,
        options: &GenericOptions,
    ) -> TetherResult<(Arc<dyn NetworkDriver>, Capability)>;
}
