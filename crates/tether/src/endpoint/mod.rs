//! Endpoints: a network attachment point with its assigned addresses.

mod lifecycle;

use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tether_common::{GenericOptions, Scope, TetherError, TetherResult, generate_id};
use tether_store::{ENDPOINT_KEY_PREFIX, KvObject};

use crate::ipamapi::{IpamDriver, manages_own_addresses};
use crate::network::{IpamInfo, Network};
use crate::sandbox::Sandbox;

pub(crate) use lifecycle::create;

/// Interface addressing of an endpoint, as handed to the driver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInterface {
    #[serde(rename = "addr", default, skip_serializing_if = "Option::is_none")]
    address: Option<IpNet>,
    #[serde(rename = "addrv6", default, skip_serializing_if = "Option::is_none")]
    address_v6: Option<IpNet>,
    #[serde(rename = "v4PoolID", default, skip_serializing_if = "String::is_empty")]
    v4_pool_id: String,
    #[serde(rename = "v6PoolID", default, skip_serializing_if = "String::is_empty")]
    v6_pool_id: String,
}

impl EndpointInterface {
    /// IPv4 address, in CIDR form.
    #[must_use]
    pub const fn address(&self) -> Option<IpNet> {
        self.address
    }

    /// IPv6 address, in CIDR form.
    #[must_use]
    pub const fn address_v6(&self) -> Option<IpNet> {
        self.address_v6
    }

    /// Pool the IPv4 address came from.
    #[must_use]
    pub fn v4_pool_id(&self) -> &str {
        &self.v4_pool_id
    }

    /// Pool the IPv6 address came from.
    #[must_use]
    pub fn v6_pool_id(&self) -> &str {
        &self.v6_pool_id
    }
}

/// Options applied when creating an endpoint.
#[derive(Debug, Clone, Default)]
pub struct EndpointOptions {
    generic: GenericOptions,
    ipv4: Option<IpAddr>,
    ipv6: Option<IpAddr>,
}

impl EndpointOptions {
    /// Driver-specific options.
    #[must_use]
    pub fn with_generic(mut self, generic: GenericOptions) -> Self {
        self.generic = generic;
        self
    }

    /// Request a specific IPv4 address.
    #[must_use]
    pub const fn with_ip_address(mut self, address: IpAddr) -> Self {
        self.ipv4 = Some(address);
        self
    }

    /// Request a specific IPv6 address.
    #[must_use]
    pub const fn with_ipv6_address(mut self, address: IpAddr) -> Self {
        self.ipv6 = Some(address);
        self
    }
}

#[derive(Debug, Clone, Default)]
struct EndpointState {
    name: String,
    id: String,
    network_id: String,
    iface: EndpointInterface,
    generic: GenericOptions,
    preferred_v4: Option<IpAddr>,
    preferred_v6: Option<IpAddr>,
    db_index: u64,
    db_exists: bool,
}

#[derive(Serialize, Deserialize)]
struct EndpointRecord {
    name: String,
    id: String,
    network: String,
    #[serde(default)]
    ep_iface: EndpointInterface,
    #[serde(default, skip_serializing_if = "GenericOptions::is_empty")]
    generic: GenericOptions,
}

/// An endpoint on a [`Network`].
pub struct Endpoint {
    network: Arc<Network>,
    state: Mutex<EndpointState>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Endpoint")
            .field("name", &state.name)
            .field("id", &state.id)
            .field("network", &state.network_id)
            .field("iface", &state.iface)
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    pub(crate) fn new(network: Arc<Network>, name: &str, options: EndpointOptions) -> Self {
        let state = EndpointState {
            name: name.to_string(),
            id: generate_id(),
            network_id: network.id(),
            generic: options.generic,
            preferred_v4: options.ipv4,
            preferred_v6: options.ipv6,
            ..EndpointState::default()
        };

        Self {
            network,
            state: Mutex::new(state),
        }
    }

    /// A blank endpoint to decode a stored value into.
    pub(crate) fn blank(network: Arc<Network>) -> Self {
        let state = EndpointState {
            network_id: network.id(),
            ..EndpointState::default()
        };

        Self {
            network,
            state: Mutex::new(state),
        }
    }

    /// Endpoint name.
    #[must_use]
    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    /// Endpoint ID.
    #[must_use]
    pub fn id(&self) -> String {
        self.state.lock().id.clone()
    }

    /// ID of the owning network.
    #[must_use]
    pub fn network_id(&self) -> String {
        self.state.lock().network_id.clone()
    }

    /// The owning network.
    #[must_use]
    pub const fn network(&self) -> &Arc<Network> {
        &self.network
    }

    /// Interface addressing.
    #[must_use]
    pub fn iface(&self) -> EndpointInterface {
        self.state.lock().iface.clone()
    }

    /// IPv4 address, if one was assigned.
    #[must_use]
    pub fn address(&self) -> Option<IpNet> {
        self.state.lock().iface.address
    }

    /// IPv6 address, if one was assigned.
    #[must_use]
    pub fn address_v6(&self) -> Option<IpNet> {
        self.state.lock().iface.address_v6
    }

    /// Driver-specific options.
    #[must_use]
    pub fn generic(&self) -> GenericOptions {
        self.state.lock().generic.clone()
    }

    /// The sandbox this endpoint is joined to, if any.
    #[must_use]
    pub fn sandbox(&self) -> Option<Arc<dyn Sandbox>> {
        self.network.controller().attached_sandbox(&self.id())
    }

    pub(crate) fn mark_missing(&self) {
        let mut state = self.state.lock();
        state.db_exists = false;
        state.db_index = 0;
    }

    /// Assign addresses from the network's pools.
    ///
    /// Pools are tried in order; an exhausted pool moves on to the next.
    pub(crate) async fn assign_address(&self) -> TetherResult<()> {
        let network = &self.network;
        if manages_own_addresses(&network.network_type()) {
            return Ok(());
        }

        let ipam = network.controller().ipam_driver(&network.ipam_type())?.driver;
        let (preferred_v4, preferred_v6) = {
            let state = self.state.lock();
            (state.preferred_v4, state.preferred_v6)
        };

        self.assign_family(&ipam, &network.ipam_v4_info(), preferred_v4, false)
            .await?;

        let v6_info = network.ipam_v6_info();
        if let Err(e) = self.assign_family(&ipam, &v6_info, preferred_v6, true).await {
            self.release_address().await;
            return Err(e);
        }

        Ok(())
    }

    async fn assign_family(
        &self,
        ipam: &Arc<dyn IpamDriver>,
        infos: &[IpamInfo],
        preferred: Option<IpAddr>,
        v6: bool,
    ) -> TetherResult<()> {
        if infos.is_empty() {
            return Ok(());
        }

        let assigned = {
            let state = self.state.lock();
            if v6 {
                state.iface.address_v6.is_some()
            } else {
                state.iface.address.is_some()
            }
        };
        if assigned {
            return Err(TetherError::internal(format!(
                "endpoint {} already has an address",
                self.name()
            )));
        }

        for info in infos {
            match ipam.request_address(&info.pool_id, preferred, None).await {
                Ok((address, _)) => {
                    let mut state = self.state.lock();
                    if v6 {
                        state.iface.address_v6 = Some(address);
                        state.iface.v6_pool_id.clone_from(&info.pool_id);
                    } else {
                        state.iface.address = Some(address);
                        state.iface.v4_pool_id.clone_from(&info.pool_id);
                    }
                    return Ok(());
                }
                Err(TetherError::NoAvailableAddresses { .. }) => {
                    tracing::debug!(pool_id = %info.pool_id, "Pool exhausted, trying next");
                }
                Err(e) => return Err(e),
            }
        }

        Err(TetherError::NoAvailableAddresses {
            network: self.network.name(),
        })
    }

    /// Return assigned addresses to their pools. Failures are logged.
    pub(crate) async fn release_address(&self) {
        let network = &self.network;
        if manages_own_addresses(&network.network_type()) {
            return;
        }

        let ipam = match network.controller().ipam_driver(&network.ipam_type()) {
            Ok(entry) => entry.driver,
            Err(e) => {
                tracing::warn!(
                    endpoint = %self.name(),
                    error = %e,
                    "Failed to retrieve ipam driver to release endpoint addresses"
                );
                return;
            }
        };

        let iface = self.iface();
        let assigned = [
            (iface.address, iface.v4_pool_id.as_str()),
            (iface.address_v6, iface.v6_pool_id.as_str()),
        ];
        for (address, pool_id) in assigned {
            let Some(address) = address else {
                continue;
            };
            if let Err(e) = ipam.release_address(pool_id, address.addr()).await {
                tracing::warn!(
                    endpoint = %self.name(),
                    pool_id,
                    address = %address.addr(),
                    error = %e,
                    "Failed to release endpoint address"
                );
            }
        }
    }

    /// Tear the endpoint down in the driver, tolerating anything but a refusal.
    pub(crate) async fn delete_from_driver(&self) -> TetherResult<()> {
        let driver = self.network.driver().await?;

        if let Err(e) = driver
            .delete_endpoint(&self.network_id(), &self.id())
            .await
        {
            if e.is_forbidden() {
                return Err(e);
            }
            tracing::warn!(
                endpoint = %self.name(),
                error = %e,
                "Driver error deleting endpoint, proceeding anyway"
            );
        }
        Ok(())
    }

    /// Join a sandbox.
    ///
    /// The sandbox receives the network's current service records, and the
    /// endpoint's own records are published to the other sandboxes on the
    /// network.
    ///
    /// # Errors
    ///
    /// Returns `EndpointInUse` if the endpoint already joined a sandbox.
    pub fn join(&self, sandbox: Arc<dyn Sandbox>) -> TetherResult<()> {
        let (id, name, network_id) = {
            let state = self.state.lock();
            (state.id.clone(), state.name.clone(), state.network_id.clone())
        };

        self.network
            .controller()
            .attach(&id, &name, &network_id, sandbox.clone())?;

        let existing = self.network.svc_records();
        if !existing.is_empty() {
            sandbox.add_hosts_entries(&existing);
        }
        self.network
            .update_svc_record(&id, &name, self.address(), true);

        tracing::info!(endpoint = %name, sandbox = %sandbox.id(), "Endpoint joined sandbox");
        Ok(())
    }

    /// Leave the joined sandbox, withdrawing the endpoint's service records.
    ///
    /// # Errors
    ///
    /// Returns `BadRequest` if the endpoint is not joined.
    pub fn leave(&self) -> TetherResult<()> {
        let (id, name) = {
            let state = self.state.lock();
            (state.id.clone(), state.name.clone())
        };

        let sandbox = self.network.controller().detach(&id).ok_or_else(|| {
            TetherError::bad_request(format!("endpoint {name} is not attached to a sandbox"))
        })?;

        self.network
            .update_svc_record(&id, &name, self.address(), false);

        tracing::info!(endpoint = %name, sandbox = %sandbox.id(), "Endpoint left sandbox");
        Ok(())
    }
}

impl KvObject for Endpoint {
    fn key(&self) -> Vec<String> {
        let state = self.state.lock();
        vec![
            ENDPOINT_KEY_PREFIX.to_string(),
            state.network_id.clone(),
            state.id.clone(),
        ]
    }

    fn key_prefix(&self) -> Vec<String> {
        vec![ENDPOINT_KEY_PREFIX.to_string(), self.network_id()]
    }

    fn value(&self) -> TetherResult<Vec<u8>> {
        let record = {
            let state = self.state.lock();
            EndpointRecord {
                name: state.name.clone(),
                id: state.id.clone(),
                network: state.network_id.clone(),
                ep_iface: state.iface.clone(),
                generic: state.generic.clone(),
            }
        };
        Ok(serde_json::to_vec(&record)?)
    }

    fn set_value(&self, value: &[u8]) -> TetherResult<()> {
        let record: EndpointRecord = serde_json::from_slice(value)?;
        let mut state = self.state.lock();
        state.name = record.name;
        state.id = record.id;
        state.network_id = record.network;
        state.iface = record.ep_iface;
        state.generic = record.generic;
        Ok(())
    }

    fn index(&self) -> u64 {
        self.state.lock().db_index
    }

    fn set_index(&self, index: u64) {
        let mut state = self.state.lock();
        state.db_index = index;
        state.db_exists = true;
    }

    fn exists(&self) -> bool {
        self.state.lock().db_exists
    }

    fn skip(&self) -> bool {
        !self.network.persist()
    }

    fn data_scope(&self) -> Scope {
        self.network.scope()
    }

    fn new_object(&self) -> Self {
        Self::blank(self.network.clone())
    }

    fn copy_to(&self, dst: &Self) {
        if std::ptr::eq(self, dst) {
            return;
        }
        let snapshot = self.state.lock().clone();
        *dst.state.lock() = snapshot;
    }
}
