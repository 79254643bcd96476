//! Networks: named broadcast domains realized by a driver.
//!
//! A [`Network`] is shared behind an `Arc`. Its mutable state sits behind a
//! short-lived lock that is never held across a driver, IPAM or store call.

mod delete;
mod ipam;
mod persist;
mod svc;

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tether_common::{
    GenericOptions, Scope, TetherError, TetherResult, generate_id, labels, options,
};

use crate::controller::Controller;
use crate::driverapi::{IpamData, NetworkDriver};
use crate::endpoint::{self, Endpoint, EndpointOptions};

pub use ipam::{IpamConf, IpamInfo};

/// Guards the one-time lazy registration of a network with its driver.
///
/// The controller hands the same latch to every instance of a network it
/// reads back, and copies share it too. The registration future runs at
/// most once, and the latch stays closed even if that run failed.
#[derive(Debug, Default)]
pub(crate) struct RegistrationLatch {
    registered: tokio::sync::Mutex<bool>,
}

impl RegistrationLatch {
    /// Run `register` unless a registration was already attempted.
    pub(crate) async fn ensure<F>(&self, register: F) -> TetherResult<()>
    where
        F: Future<Output = TetherResult<()>>,
    {
        let mut registered = self.registered.lock().await;
        if *registered {
            return Ok(());
        }
        *registered = true;
        register.await
    }

    /// Mark the network as already known to its driver.
    pub(crate) async fn close(&self) {
        *self.registered.lock().await = true;
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct NetworkState {
    pub(crate) name: String,
    pub(crate) id: String,
    pub(crate) network_type: String,
    pub(crate) ipam_type: String,
    pub(crate) addr_space: String,
    pub(crate) ipam_v4_config: Vec<IpamConf>,
    pub(crate) ipam_v6_config: Vec<IpamConf>,
    pub(crate) ipam_v4_info: Vec<IpamInfo>,
    pub(crate) ipam_v6_info: Vec<IpamInfo>,
    pub(crate) enable_ipv6: bool,
    pub(crate) endpoint_cnt: u64,
    pub(crate) generic: Option<GenericOptions>,
    pub(crate) persist: bool,
    pub(crate) db_index: u64,
    pub(crate) db_exists: bool,
    pub(crate) scope: Scope,
    pub(crate) latch: Arc<RegistrationLatch>,
}

/// Options applied when creating a network.
#[derive(Debug, Clone, Default)]
pub struct NetworkOptions {
    generic: Option<GenericOptions>,
    persist: Option<bool>,
    ipam: Option<IpamOptions>,
}

#[derive(Debug, Clone)]
struct IpamOptions {
    driver: String,
    address_space: String,
    v4: Vec<IpamConf>,
    v6: Vec<IpamConf>,
}

impl NetworkOptions {
    /// Driver-specific options. The IPv6 flag is read from them as well.
    #[must_use]
    pub fn with_generic(mut self, generic: GenericOptions) -> Self {
        self.generic = Some(generic);
        self
    }

    /// Whether the network is written to the store. Defaults to true.
    #[must_use]
    pub const fn with_persist(mut self, persist: bool) -> Self {
        self.persist = Some(persist);
        self
    }

    /// IPAM driver, address space and per-family pool requests.
    ///
    /// An empty driver name keeps the configured default driver.
    #[must_use]
    pub fn with_ipam(
        mut self,
        driver: impl Into<String>,
        address_space: impl Into<String>,
        v4: Vec<IpamConf>,
        v6: Vec<IpamConf>,
    ) -> Self {
        self.ipam = Some(IpamOptions {
            driver: driver.into(),
            address_space: address_space.into(),
            v4,
            v6,
        });
        self
    }

    fn apply(self, state: &mut NetworkState) {
        if let Some(generic) = self.generic {
            if let Some(enable) = options::flag(&generic, labels::ENABLE_IPV6) {
                state.enable_ipv6 = enable;
            }
            state.generic = Some(generic);
        }
        if let Some(persist) = self.persist {
            state.persist = persist;
        }
        if let Some(ipam) = self.ipam {
            if !ipam.driver.is_empty() {
                state.ipam_type = ipam.driver;
            }
            state.addr_space = ipam.address_space;
            state.ipam_v4_config = ipam.v4;
            state.ipam_v6_config = ipam.v6;
        }
    }
}

/// A network managed by a [`Controller`].
pub struct Network {
    controller: Controller,
    state: Mutex<NetworkState>,
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Network")
            .field("name", &state.name)
            .field("id", &state.id)
            .field("type", &state.network_type)
            .field("endpoints", &state.endpoint_cnt)
            .finish_non_exhaustive()
    }
}

impl Network {
    pub(crate) fn new(
        controller: Controller,
        name: &str,
        network_type: &str,
        options: NetworkOptions,
    ) -> Self {
        let mut state = NetworkState {
            name: name.to_string(),
            id: generate_id(),
            network_type: network_type.to_string(),
            ipam_type: controller.config().default_ipam_driver.clone(),
            persist: true,
            ..NetworkState::default()
        };
        options.apply(&mut state);

        Self {
            controller,
            state: Mutex::new(state),
        }
    }

    /// A blank network to decode a stored value into.
    pub(crate) fn blank(controller: Controller) -> Self {
        Self {
            controller,
            state: Mutex::new(NetworkState::default()),
        }
    }

    /// Network name.
    #[must_use]
    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    /// Network ID.
    #[must_use]
    pub fn id(&self) -> String {
        self.state.lock().id.clone()
    }

    /// Network type, naming the driver.
    #[must_use]
    pub fn network_type(&self) -> String {
        self.state.lock().network_type.clone()
    }

    /// Name of the IPAM driver.
    #[must_use]
    pub fn ipam_type(&self) -> String {
        self.state.lock().ipam_type.clone()
    }

    /// Address space the pools were allocated from.
    #[must_use]
    pub fn address_space(&self) -> String {
        self.state.lock().addr_space.clone()
    }

    /// Scope the network is stored in.
    #[must_use]
    pub fn scope(&self) -> Scope {
        self.state.lock().scope
    }

    /// Number of endpoints, as last read from or written to the store.
    #[must_use]
    pub fn endpoint_count(&self) -> u64 {
        self.state.lock().endpoint_cnt
    }

    /// Whether the network is written to the store.
    #[must_use]
    pub fn persist(&self) -> bool {
        self.state.lock().persist
    }

    /// Whether IPv6 is enabled.
    #[must_use]
    pub fn enable_ipv6(&self) -> bool {
        self.state.lock().enable_ipv6
    }

    /// Driver-specific options.
    #[must_use]
    pub fn generic(&self) -> Option<GenericOptions> {
        self.state.lock().generic.clone()
    }

    /// Requested IPv4 pools.
    #[must_use]
    pub fn ipam_v4_config(&self) -> Vec<IpamConf> {
        self.state.lock().ipam_v4_config.clone()
    }

    /// Requested IPv6 pools.
    #[must_use]
    pub fn ipam_v6_config(&self) -> Vec<IpamConf> {
        self.state.lock().ipam_v6_config.clone()
    }

    /// Allocated IPv4 pools, in allocation order.
    #[must_use]
    pub fn ipam_v4_info(&self) -> Vec<IpamInfo> {
        self.state.lock().ipam_v4_info.clone()
    }

    /// Allocated IPv6 pools, in allocation order.
    #[must_use]
    pub fn ipam_v6_info(&self) -> Vec<IpamInfo> {
        self.state.lock().ipam_v6_info.clone()
    }

    /// Driver view of the IPv4 pools.
    #[must_use]
    pub fn ipv4_data(&self) -> Vec<IpamData> {
        self.state
            .lock()
            .ipam_v4_info
            .iter()
            .map(|info| info.data.clone())
            .collect()
    }

    /// Driver view of the IPv6 pools.
    #[must_use]
    pub fn ipv6_data(&self) -> Vec<IpamData> {
        self.state
            .lock()
            .ipam_v6_info
            .iter()
            .map(|info| info.data.clone())
            .collect()
    }

    /// The owning controller.
    #[must_use]
    pub const fn controller(&self) -> &Controller {
        &self.controller
    }

    pub(crate) fn set_scope(&self, scope: Scope) {
        self.state.lock().scope = scope;
    }

    pub(crate) fn latch(&self) -> Arc<RegistrationLatch> {
        self.state.lock().latch.clone()
    }

    pub(crate) fn set_latch(&self, latch: Arc<RegistrationLatch>) {
        self.state.lock().latch = latch;
    }

    /// Forget the store version, so the next write creates the key afresh.
    pub(crate) fn mark_missing(&self) {
        let mut state = self.state.lock();
        state.db_exists = false;
        state.db_index = 0;
    }

    /// The network's driver, loading it on demand.
    ///
    /// # Errors
    ///
    /// Returns `DriverNotFound` if no driver is registered or loadable.
    pub async fn driver(&self) -> TetherResult<Arc<dyn NetworkDriver>> {
        let entry = self.controller.resolve_driver(&self.network_type()).await?;
        Ok(entry.driver)
    }

    /// Scope declared by the network's driver, if the driver is available.
    pub async fn driver_scope(&self) -> Option<Scope> {
        self.controller.driver_scope(&self.network_type()).await
    }

    /// For lazily registered types, tell the driver about the network once.
    pub(crate) async fn ensure_registered(&self) -> TetherResult<()> {
        if !self.controller.config().is_legacy(&self.network_type()) {
            return Ok(());
        }
        let latch = self.latch();
        latch.ensure(self.controller.add_network(self)).await
    }

    /// Realize an endpoint in the driver.
    pub(crate) async fn add_endpoint(&self, endpoint: &Endpoint) -> TetherResult<()> {
        let driver = self.driver().await?;
        self.ensure_registered().await?;

        let network_id = self.id();
        let endpoint_id = endpoint.id();
        driver
            .create_endpoint(
                &network_id,
                &endpoint_id,
                &endpoint.iface(),
                &endpoint.generic(),
            )
            .await
            .map_err(|e| {
                TetherError::internal(format!(
                    "failed to create endpoint {} on network {}: {e}",
                    endpoint.name(),
                    self.name()
                ))
            })
    }

    /// Create an endpoint on this network.
    ///
    /// Address assignment, driver realization, the endpoint record and the
    /// endpoint count update happen in that order; a failure undoes the
    /// completed steps. The count update is the commit point.
    ///
    /// # Errors
    ///
    /// Returns `InvalidName` for a bad name, `EndpointExists` if the name is
    /// taken, or the error of the failed step.
    pub async fn create_endpoint(
        self: &Arc<Self>,
        name: &str,
        options: EndpointOptions,
    ) -> TetherResult<Arc<Endpoint>> {
        endpoint::create(self, name, options).await
    }

    /// Every endpoint on the network. Failures are logged and yield an empty list.
    pub async fn endpoints(self: &Arc<Self>) -> Vec<Arc<Endpoint>> {
        match self.controller.endpoints_of(self).await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                tracing::error!(network = %self.name(), error = %e, "Failed to list endpoints");
                Vec::new()
            }
        }
    }

    /// Visit endpoints until `walker` returns true.
    pub async fn walk_endpoints<F>(self: &Arc<Self>, mut walker: F)
    where
        F: FnMut(&Arc<Endpoint>) -> bool,
    {
        for endpoint in self.endpoints().await {
            if walker(&endpoint) {
                return;
            }
        }
    }

    /// Find an endpoint by name.
    ///
    /// # Errors
    ///
    /// Returns `InvalidName` for an empty name, `EndpointNotFound` otherwise.
    pub async fn endpoint_by_name(self: &Arc<Self>, name: &str) -> TetherResult<Arc<Endpoint>> {
        if name.is_empty() {
            return Err(TetherError::InvalidName {
                name: name.to_string(),
            });
        }

        let mut found = None;
        self.walk_endpoints(|endpoint| {
            if endpoint.name() == name {
                found = Some(endpoint.clone());
                return true;
            }
            false
        })
        .await;

        found.ok_or_else(|| TetherError::EndpointNotFound {
            name: name.to_string(),
        })
    }

    /// Find an endpoint by ID.
    ///
    /// # Errors
    ///
    /// Returns `InvalidId` for an empty ID, `EndpointNotFound` otherwise.
    pub async fn endpoint_by_id(self: &Arc<Self>, id: &str) -> TetherResult<Arc<Endpoint>> {
        if id.is_empty() {
            return Err(TetherError::InvalidId { id: id.to_string() });
        }

        self.controller.endpoint_from_store(self, id).await
    }

    /// Count one more endpoint and write the network back.
    ///
    /// On a failed write the in-memory count is restored.
    pub(crate) async fn inc_endpoint_count(self: &Arc<Self>) -> TetherResult<()> {
        self.state.lock().endpoint_cnt += 1;

        if let Err(e) = self.controller.save_network(self).await {
            let mut state = self.state.lock();
            state.endpoint_cnt = state.endpoint_cnt.saturating_sub(1);
            return Err(e);
        }
        Ok(())
    }

    /// Count one endpoint less and write the network back.
    ///
    /// The count never goes below zero.
    pub(crate) async fn dec_endpoint_count(self: &Arc<Self>) -> TetherResult<()> {
        {
            let mut state = self.state.lock();
            if state.endpoint_cnt == 0 {
                tracing::warn!(network = %state.name, "Endpoint count already zero");
                return Ok(());
            }
            state.endpoint_cnt -= 1;
        }

        if let Err(e) = self.controller.save_network(self).await {
            self.state.lock().endpoint_cnt += 1;
            return Err(e);
        }
        Ok(())
    }
}
