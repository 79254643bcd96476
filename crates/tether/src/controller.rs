//! The controller: driver registries, stores and network lookup.
//!
//! A [`Controller`] is a cheap handle; clones share one set of registries.
//! Networks created with `persist = false` never reach a store. The
//! controller keeps them, and their endpoints, in memory for its lifetime
//! instead, so lookups by ID still find them.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, RwLock};
use tether_common::{Scope, TetherError, TetherResult, generate_id, validate_name};
use tether_store::{
    DataStore, ENDPOINT_KEY_PREFIX, KvObject, KvStore, MemoryStore, NETWORK_KEY_PREFIX,
};

use crate::config::ControllerConfig;
use crate::driverapi::{Capability, DriverLoader, NetworkDriver};
use crate::endpoint::Endpoint;
use crate::ipamapi::IpamDriver;
use crate::network::{Network, NetworkOptions, RegistrationLatch};
use crate::rollback::Rollback;
use crate::sandbox::Sandbox;

/// Scopes in lookup order.
const SCOPES: [Scope; 2] = [Scope::Local, Scope::Global];

/// Service name to address, for one network.
pub(crate) type SvcMap = HashMap<String, IpAddr>;

/// A registered network driver.
#[derive(Clone)]
pub struct DriverEntry {
    /// The driver.
    pub driver: Arc<dyn NetworkDriver>,
    /// What the driver declared at registration.
    pub capability: Capability,
}

/// A registered IPAM driver with its default address spaces.
#[derive(Clone)]
pub struct IpamEntry {
    /// The driver.
    pub driver: Arc<dyn IpamDriver>,
    /// Address space for local-scope networks.
    pub default_local_space: String,
    /// Address space for global-scope networks.
    pub default_global_space: String,
}

impl std::fmt::Debug for DriverEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverEntry")
            .field("capability", &self.capability)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for IpamEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpamEntry")
            .field("default_local_space", &self.default_local_space)
            .field("default_global_space", &self.default_global_space)
            .finish_non_exhaustive()
    }
}

struct Attachment {
    network_id: String,
    sandbox: Arc<dyn Sandbox>,
}

struct ControllerInner {
    id: String,
    config: ControllerConfig,
    drivers: DashMap<String, DriverEntry>,
    ipam_drivers: DashMap<String, IpamEntry>,
    loader: RwLock<Option<Arc<dyn DriverLoader>>>,
    stores: HashMap<Scope, DataStore>,
    svc_db: Mutex<HashMap<String, SvcMap>>,
    attachments: Mutex<HashMap<String, Attachment>>,
    transient_networks: DashMap<String, Arc<Network>>,
    transient_endpoints: DashMap<(String, String), Arc<Endpoint>>,
    latches: DashMap<String, Arc<RegistrationLatch>>,
}

/// Owns the driver registries and stores, and creates networks.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("id", &self.inner.id)
            .field("drivers", &self.inner.drivers.len())
            .field("ipam_drivers", &self.inner.ipam_drivers.len())
            .field("scopes", &self.inner.stores.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Create a controller over a local store and an optional global one.
    pub fn new(
        config: ControllerConfig,
        local: Arc<dyn KvStore>,
        global: Option<Arc<dyn KvStore>>,
    ) -> Self {
        let mut stores = HashMap::new();
        stores.insert(
            Scope::Local,
            DataStore::with_root(Scope::Local, config.store_root.clone(), local),
        );
        if let Some(global) = global {
            stores.insert(
                Scope::Global,
                DataStore::with_root(Scope::Global, config.store_root.clone(), global),
            );
        }

        let id = generate_id();
        tracing::debug!(
            controller = %tether_common::short_id(&id),
            scopes = stores.len(),
            "Controller created"
        );

        Self {
            inner: Arc::new(ControllerInner {
                id,
                config,
                drivers: DashMap::new(),
                ipam_drivers: DashMap::new(),
                loader: RwLock::new(None),
                stores,
                svc_db: Mutex::new(HashMap::new()),
                attachments: Mutex::new(HashMap::new()),
                transient_networks: DashMap::new(),
                transient_endpoints: DashMap::new(),
                latches: DashMap::new(),
            }),
        }
    }

    /// Create a controller with an in-memory local store and no global store.
    #[must_use]
    pub fn in_memory(config: ControllerConfig) -> Self {
        Self::new(config, Arc::new(MemoryStore::new()), None)
    }

    /// Controller ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Controller configuration.
    #[must_use]
    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    /// The store serving a scope, if one is configured.
    #[must_use]
    pub fn store(&self, scope: Scope) -> Option<&DataStore> {
        self.inner.stores.get(&scope)
    }

    pub(crate) fn store_for(&self, scope: Scope) -> TetherResult<&DataStore> {
        self.store(scope).ok_or_else(|| TetherError::StoreUnavailable {
            scope: scope.to_string(),
        })
    }

    /// Register the driver for a network type.
    ///
    /// # Errors
    ///
    /// Returns `BadRequest` if the type already has a driver.
    pub fn register_driver(
        &self,
        network_type: &str,
        driver: Arc<dyn NetworkDriver>,
        capability: Capability,
    ) -> TetherResult<()> {
        match self.inner.drivers.entry(network_type.to_string()) {
            Entry::Occupied(_) => Err(TetherError::bad_request(format!(
                "driver already registered for network type {network_type}"
            ))),
            Entry::Vacant(slot) => {
                slot.insert(DriverEntry { driver, capability });
                tracing::info!(network_type, scope = %capability.data_scope, "Registered network driver");
                Ok(())
            }
        }
    }

    /// Register an IPAM driver, recording its default address spaces.
    ///
    /// # Errors
    ///
    /// Returns the driver's error if it cannot report its address spaces.
    pub async fn register_ipam_driver(
        &self,
        name: &str,
        driver: Arc<dyn IpamDriver>,
    ) -> TetherResult<()> {
        let (local, global) = driver.default_address_spaces().await?;
        tracing::info!(ipam = name, local = %local, global = %global, "Registered IPAM driver");

        self.inner.ipam_drivers.insert(
            name.to_string(),
            IpamEntry {
                driver,
                default_local_space: local,
                default_global_space: global,
            },
        );
        Ok(())
    }

    /// Install the loader consulted for unregistered network types.
    pub fn set_driver_loader(&self, loader: Arc<dyn DriverLoader>) {
        *self.inner.loader.write() = Some(loader);
    }

    /// Look up the driver for a network type, loading it if needed.
    ///
    /// The registry is never locked while the loader runs.
    pub(crate) async fn resolve_driver(&self, network_type: &str) -> TetherResult<DriverEntry> {
        let cached = self
            .inner
            .drivers
            .get(network_type)
            .map(|entry| entry.value().clone());
        if let Some(entry) = cached {
            return Ok(entry);
        }

        let loader = self.inner.loader.read().clone();
        let Some(loader) = loader else {
            return Err(TetherError::DriverNotFound {
                network_type: network_type.to_string(),
            });
        };

        let options = self.inner.config.driver_options(network_type);
        let (driver, capability) = loader.load(network_type, &options).await?;
        tracing::info!(network_type, scope = %capability.data_scope, "Loaded network driver");

        let entry = self
            .inner
            .drivers
            .entry(network_type.to_string())
            .or_insert(DriverEntry { driver, capability })
            .value()
            .clone();
        Ok(entry)
    }

    /// Scope declared by the driver of a network type, if it is available.
    pub async fn driver_scope(&self, network_type: &str) -> Option<Scope> {
        match self.resolve_driver(network_type).await {
            Ok(entry) => Some(entry.capability.data_scope),
            Err(e) => {
                tracing::debug!(network_type, error = %e, "Driver unavailable");
                None
            }
        }
    }

    pub(crate) fn ipam_driver(&self, name: &str) -> TetherResult<IpamEntry> {
        self.inner
            .ipam_drivers
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TetherError::IpamDriverNotFound {
                name: name.to_string(),
            })
    }

    /// Create a network.
    ///
    /// Pools are allocated, the driver realizes the network, and the network
    /// is written to the store of its driver's scope. A failure undoes the
    /// completed steps.
    ///
    /// # Errors
    ///
    /// Returns `InvalidName`, `NetworkNameExists`, `DriverNotFound`,
    /// `IpamDriverNotFound`, or the error of the failed step.
    pub async fn new_network(
        &self,
        network_type: &str,
        name: &str,
        options: NetworkOptions,
    ) -> TetherResult<Arc<Network>> {
        validate_name(name)?;

        if self.network_by_name(name).await.is_ok() {
            return Err(TetherError::NetworkNameExists {
                name: name.to_string(),
            });
        }

        let entry = self.resolve_driver(network_type).await?;
        let network = Arc::new(Network::new(self.clone(), name, network_type, options));
        network.set_scope(entry.capability.data_scope);
        if network.persist() {
            self.store_for(network.scope())?;
        }

        let mut rollback = Rollback::new("create network");
        rollback.append(network.ipam_allocate().await?);

        rollback.step(self.add_network(&network)).await?;
        {
            let network = network.clone();
            let driver = entry.driver.clone();
            rollback.push("driver network", move || async move {
                if let Err(e) = driver.delete_network(&network.id()).await {
                    tracing::warn!(
                        network = %network.name(),
                        error = %e,
                        "Failed to remove network from driver during rollback"
                    );
                }
            });
        }

        let latch = network.latch();
        latch.close().await;
        self.inner.latches.insert(network.id(), latch);

        if let Err(e) = rollback.step(self.save_network(&network)).await {
            self.inner.latches.remove(&network.id());
            return Err(e);
        }
        rollback.commit();

        tracing::info!(
            network = %name,
            id = %network.id(),
            network_type,
            scope = %network.scope(),
            persist = network.persist(),
            "Network created"
        );
        Ok(network)
    }

    /// Realize a network in its driver.
    pub(crate) async fn add_network(&self, network: &Network) -> TetherResult<()> {
        let entry = self.resolve_driver(&network.network_type()).await?;
        let options = network.generic().unwrap_or_default();

        entry
            .driver
            .create_network(
                &network.id(),
                &options,
                &network.ipv4_data(),
                &network.ipv6_data(),
            )
            .await
            .inspect_err(|e| {
                tracing::warn!(network = %network.name(), error = %e, "Driver failed to create network");
            })
    }

    /// Every known network, stored and transient. Store failures are logged.
    pub async fn networks(&self) -> Vec<Arc<Network>> {
        let mut networks = Vec::new();

        for scope in SCOPES {
            let Some(store) = self.store(scope) else {
                continue;
            };
            let template = Network::blank(self.clone());
            match store.list(&template.key_prefix(), &template).await {
                Ok(listed) => {
                    for network in listed {
                        network.set_scope(scope);
                        self.adopt_latch(&network);
                        networks.push(Arc::new(network));
                    }
                }
                Err(e) => {
                    tracing::error!(scope = %scope, error = %e, "Failed to list networks");
                }
            }
        }

        networks.extend(
            self.inner
                .transient_networks
                .iter()
                .map(|entry| entry.value().clone()),
        );
        networks
    }

    /// Visit networks until `walker` returns true.
    pub async fn walk_networks<F>(&self, mut walker: F)
    where
        F: FnMut(&Arc<Network>) -> bool,
    {
        for network in self.networks().await {
            if walker(&network) {
                return;
            }
        }
    }

    /// Find a network by name.
    ///
    /// # Errors
    ///
    /// Returns `InvalidName` for an empty name, `NetworkNotFound` otherwise.
    pub async fn network_by_name(&self, name: &str) -> TetherResult<Arc<Network>> {
        if name.is_empty() {
            return Err(TetherError::InvalidName {
                name: name.to_string(),
            });
        }

        let mut found = None;
        self.walk_networks(|network| {
            if network.name() == name {
                found = Some(network.clone());
                return true;
            }
            false
        })
        .await;

        found.ok_or_else(|| TetherError::NetworkNotFound {
            name: name.to_string(),
            id: String::new(),
        })
    }

    /// Find a network by ID.
    ///
    /// # Errors
    ///
    /// Returns `InvalidId` for an empty ID, `NetworkNotFound` otherwise.
    pub async fn network_by_id(&self, id: &str) -> TetherResult<Arc<Network>> {
        if id.is_empty() {
            return Err(TetherError::InvalidId { id: id.to_string() });
        }
        self.network_from_store(id).await
    }

    /// The latest version of a network.
    ///
    /// Stored networks are read afresh; transient ones are the live instance.
    pub(crate) async fn network_from_store(&self, id: &str) -> TetherResult<Arc<Network>> {
        if let Some(network) = self.inner.transient_networks.get(id) {
            return Ok(network.value().clone());
        }

        let key = vec![NETWORK_KEY_PREFIX.to_string(), id.to_string()];
        for scope in SCOPES {
            let Some(store) = self.store(scope) else {
                continue;
            };
            let network = Network::blank(self.clone());
            match store.get_object(&key, &network).await {
                Ok(()) => {
                    network.set_scope(scope);
                    self.adopt_latch(&network);
                    return Ok(Arc::new(network));
                }
                Err(TetherError::KeyNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        Err(TetherError::NetworkNotFound {
            name: String::new(),
            id: id.to_string(),
        })
    }

    /// Give a network read from a store the registration latch of every
    /// other instance of it.
    fn adopt_latch(&self, network: &Network) {
        let latch = self
            .inner
            .latches
            .entry(network.id())
            .or_default()
            .value()
            .clone();
        network.set_latch(latch);
    }

    pub(crate) fn forget_latch(&self, network_id: &str) {
        self.inner.latches.remove(network_id);
    }

    pub(crate) async fn save_network(&self, network: &Arc<Network>) -> TetherResult<()> {
        if network.skip() {
            self.inner
                .transient_networks
                .insert(network.id(), network.clone());
            return Ok(());
        }
        self.store_for(network.data_scope())?
            .put_object_atomic(network.as_ref())
            .await
    }

    pub(crate) async fn delete_network_record(&self, network: &Arc<Network>) -> TetherResult<()> {
        if network.skip() {
            self.inner.transient_networks.remove(&network.id());
            return Ok(());
        }
        self.store_for(network.data_scope())?
            .delete_object_atomic(network.as_ref())
            .await
    }

    pub(crate) async fn save_endpoint(&self, endpoint: &Arc<Endpoint>) -> TetherResult<()> {
        if endpoint.skip() {
            self.inner
                .transient_endpoints
                .insert((endpoint.network_id(), endpoint.id()), endpoint.clone());
            return Ok(());
        }
        self.store_for(endpoint.data_scope())?
            .put_object_atomic(endpoint.as_ref())
            .await
    }

    pub(crate) async fn delete_endpoint_record(&self, endpoint: &Arc<Endpoint>) -> TetherResult<()> {
        if endpoint.skip() {
            self.inner
                .transient_endpoints
                .remove(&(endpoint.network_id(), endpoint.id()));
            return Ok(());
        }
        self.store_for(endpoint.data_scope())?
            .delete_object_atomic(endpoint.as_ref())
            .await
    }

    pub(crate) async fn endpoint_from_store(
        &self,
        network: &Arc<Network>,
        id: &str,
    ) -> TetherResult<Arc<Endpoint>> {
        let not_found = || TetherError::EndpointNotFound {
            name: id.to_string(),
        };

        if network.skip() {
            return self
                .inner
                .transient_endpoints
                .get(&(network.id(), id.to_string()))
                .map(|entry| entry.value().clone())
                .ok_or_else(not_found);
        }

        let store = self.store_for(network.scope())?;
        let endpoint = Endpoint::blank(network.clone());
        let key = vec![ENDPOINT_KEY_PREFIX.to_string(), network.id(), id.to_string()];
        match store.get_object(&key, &endpoint).await {
            Ok(()) => Ok(Arc::new(endpoint)),
            Err(TetherError::KeyNotFound { .. }) => Err(not_found()),
            Err(e) => Err(e),
        }
    }

    pub(crate) async fn endpoints_of(&self, network: &Arc<Network>) -> TetherResult<Vec<Arc<Endpoint>>> {
        let network_id = network.id();

        if network.skip() {
            return Ok(self
                .inner
                .transient_endpoints
                .iter()
                .filter(|entry| entry.key().0 == network_id)
                .map(|entry| entry.value().clone())
                .collect());
        }

        let store = self.store_for(network.scope())?;
        let template = Endpoint::blank(network.clone());
        let listed = store.list(&template.key_prefix(), &template).await?;
        Ok(listed.into_iter().map(Arc::new).collect())
    }

    pub(crate) fn with_svc_map<R>(&self, network_id: &str, f: impl FnOnce(&mut SvcMap) -> R) -> R {
        let mut db = self.inner.svc_db.lock();
        f(db.entry(network_id.to_string()).or_default())
    }

    pub(crate) fn svc_entries(&self, network_id: &str) -> Vec<(String, IpAddr)> {
        self.inner
            .svc_db
            .lock()
            .get(network_id)
            .map(|map| map.iter().map(|(name, ip)| (name.clone(), *ip)).collect())
            .unwrap_or_default()
    }

    pub(crate) fn clear_svc_records(&self, network_id: &str) {
        self.inner.svc_db.lock().remove(network_id);
    }

    pub(crate) fn attach(
        &self,
        endpoint_id: &str,
        endpoint_name: &str,
        network_id: &str,
        sandbox: Arc<dyn Sandbox>,
    ) -> TetherResult<()> {
        let mut attachments = self.inner.attachments.lock();
        if let Some(existing) = attachments.get(endpoint_id) {
            return Err(TetherError::EndpointInUse {
                name: endpoint_name.to_string(),
                sandbox: existing.sandbox.id().to_string(),
            });
        }
        attachments.insert(
            endpoint_id.to_string(),
            Attachment {
                network_id: network_id.to_string(),
                sandbox,
            },
        );
        Ok(())
    }

    pub(crate) fn detach(&self, endpoint_id: &str) -> Option<Arc<dyn Sandbox>> {
        self.inner
            .attachments
            .lock()
            .remove(endpoint_id)
            .map(|attachment| attachment.sandbox)
    }

    pub(crate) fn attached_sandbox(&self, endpoint_id: &str) -> Option<Arc<dyn Sandbox>> {
        self.inner
            .attachments
            .lock()
            .get(endpoint_id)
            .map(|attachment| attachment.sandbox.clone())
    }

    /// Sandboxes of the endpoints attached here on a network, minus one endpoint.
    pub(crate) fn local_sandboxes(
        &self,
        network_id: &str,
        except_endpoint: &str,
    ) -> Vec<Arc<dyn Sandbox>> {
        let attachments = self.inner.attachments.lock();
        let mut seen = HashSet::new();
        attachments
            .iter()
            .filter(|(endpoint_id, attachment)| {
                attachment.network_id == network_id && endpoint_id.as_str() != except_endpoint
            })
            .filter(|(_, attachment)| seen.insert(attachment.sandbox.id().to_string()))
            .map(|(_, attachment)| attachment.sandbox.clone())
            .collect()
    }

    /// Drop all process-local state: transient networks and endpoints,
    /// attachments, service records and registration latches.
    pub fn stop(&self) {
        self.inner.transient_endpoints.clear();
        self.inner.transient_networks.clear();
        self.inner.latches.clear();
        self.inner.attachments.lock().clear();
        self.inner.svc_db.lock().clear();
        tracing::info!(controller = %tether_common::short_id(&self.inner.id), "Controller stopped");
    }
}
