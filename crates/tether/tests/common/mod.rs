//! Shared fakes for the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use ipnet::IpNet;
use parking_lot::Mutex;
use tether::ipamapi::IpamMeta;
use tether::{
    Capability, Controller, ControllerConfig, EndpointInterface, HostRecord, IpamData,
    IpamDriver, NetworkDriver, Sandbox,
};
use tether_common::{GenericOptions, TetherError, TetherResult, labels};
use tether_store::{DEFAULT_ROOT_CHAIN, KvPair, KvStore, MemoryStore};

/// How a fake driver call should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fail {
    Forbidden,
    Internal,
}

impl Fail {
    fn error(self, what: &str) -> TetherError {
        match self {
            Self::Forbidden => TetherError::forbidden(format!("{what} refused")),
            Self::Internal => TetherError::internal(format!("{what} failed")),
        }
    }
}

/// Network driver that records every call.
#[derive(Default)]
pub struct RecordingDriver {
    events: Mutex<Vec<String>>,
    pub fail_create_network: AtomicBool,
    pub fail_create_endpoint: AtomicBool,
    pub delete_network_failure: Mutex<Option<Fail>>,
    pub delete_endpoint_failure: Mutex<Option<Fail>>,
}

impl RecordingDriver {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| event.split(' ').next() == Some(call))
            .count()
    }
}

#[async_trait]
impl NetworkDriver for RecordingDriver {
    async fn create_network(
        &self,
        network_id: &str,
        _options: &GenericOptions,
        _ipv4: &[IpamData],
        _ipv6: &[IpamData],
    ) -> TetherResult<()> {
        self.events.lock().push(format!("create_network {network_id}"));
        if self.fail_create_network.load(Ordering::SeqCst) {
            return Err(Fail::Internal.error("create_network"));
        }
        Ok(())
    }

    async fn delete_network(&self, network_id: &str) -> TetherResult<()> {
        self.events.lock().push(format!("delete_network {network_id}"));
        match *self.delete_network_failure.lock() {
            Some(fail) => Err(fail.error("delete_network")),
            None => Ok(()),
        }
    }

    async fn create_endpoint(
        &self,
        _network_id: &str,
        endpoint_id: &str,
        _iface: &EndpointInterface,
        _options: &GenericOptions,
    ) -> TetherResult<()> {
        self.events.lock().push(format!("create_endpoint {endpoint_id}"));
        if self.fail_create_endpoint.load(Ordering::SeqCst) {
            return Err(Fail::Internal.error("create_endpoint"));
        }
        Ok(())
    }

    async fn delete_endpoint(&self, _network_id: &str, endpoint_id: &str) -> TetherResult<()> {
        self.events.lock().push(format!("delete_endpoint {endpoint_id}"));
        match *self.delete_endpoint_failure.lock() {
            Some(fail) => Err(fail.error("delete_endpoint")),
            None => Ok(()),
        }
    }
}

struct Pool {
    net: IpNet,
    allocated: BTreeSet<IpAddr>,
}

#[derive(Default)]
struct IpamState {
    pools: HashMap<String, Pool>,
    next_auto: u8,
}

/// IPAM driver handing out addresses from real CIDR pools.
#[derive(Default)]
pub struct FakeIpam {
    state: Mutex<IpamState>,
    calls: Mutex<Vec<String>>,
    /// When set, pools carry this gateway in their metadata.
    pub meta_gateway: Mutex<Option<String>>,
    /// Requests for this pool fail.
    pub refuse_pool: Mutex<Option<String>>,
}

impl FakeIpam {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn pool_count(&self) -> usize {
        self.state.lock().pools.len()
    }

    pub fn allocated(&self) -> usize {
        self.state
            .lock()
            .pools
            .values()
            .map(|pool| pool.allocated.len())
            .sum()
    }

    pub fn is_allocated(&self, address: &str) -> bool {
        let address: IpAddr = address.parse().unwrap();
        self.state
            .lock()
            .pools
            .values()
            .any(|pool| pool.allocated.contains(&address))
    }
}

#[async_trait]
impl IpamDriver for FakeIpam {
    async fn default_address_spaces(&self) -> TetherResult<(String, String)> {
        Ok(("LocalDefault".to_string(), "GlobalDefault".to_string()))
    }

    async fn request_pool(
        &self,
        address_space: &str,
        pool: &str,
        _sub_pool: &str,
        _options: &HashMap<String, String>,
        v6: bool,
    ) -> TetherResult<(String, IpNet, IpamMeta)> {
        if self.refuse_pool.lock().as_deref() == Some(pool) {
            return Err(TetherError::internal(format!("pool {pool} unavailable")));
        }

        let mut state = self.state.lock();
        let net: IpNet = if pool.is_empty() {
            state.next_auto += 1;
            if v6 {
                format!("fd00:{}::/64", state.next_auto).parse().unwrap()
            } else {
                format!("172.30.{}.0/24", state.next_auto).parse().unwrap()
            }
        } else {
            pool.parse()
                .map_err(|_| TetherError::bad_request(format!("invalid pool {pool}")))?
        };

        let pool_id = format!("{address_space}/{net}");
        if state.pools.contains_key(&pool_id) {
            return Err(TetherError::internal(format!("pool {net} overlaps")));
        }
        state.pools.insert(
            pool_id.clone(),
            Pool {
                net,
                allocated: BTreeSet::new(),
            },
        );
        self.calls.lock().push(format!("request_pool {net}"));

        let mut meta = IpamMeta::new();
        if let Some(gateway) = self.meta_gateway.lock().clone() {
            meta.insert(labels::GATEWAY.to_string(), gateway);
        }
        Ok((pool_id, net, meta))
    }

    async fn release_pool(&self, pool_id: &str) -> TetherResult<()> {
        self.calls.lock().push(format!("release_pool {pool_id}"));
        self.state
            .lock()
            .pools
            .remove(pool_id)
            .map(|_| ())
            .ok_or_else(|| TetherError::internal(format!("unknown pool {pool_id}")))
    }

    async fn request_address(
        &self,
        pool_id: &str,
        preferred: Option<IpAddr>,
        _options: Option<&HashMap<String, String>>,
    ) -> TetherResult<(IpNet, IpamMeta)> {
        let mut state = self.state.lock();
        let pool = state
            .pools
            .get_mut(pool_id)
            .ok_or_else(|| TetherError::internal(format!("unknown pool {pool_id}")))?;

        let address = match preferred {
            Some(address) => {
                if !pool.net.contains(&address) || pool.allocated.contains(&address) {
                    return Err(TetherError::internal(format!(
                        "address {address} unavailable in {pool_id}"
                    )));
                }
                address
            }
            None => pool
                .net
                .hosts()
                .find(|candidate| !pool.allocated.contains(candidate))
                .ok_or_else(|| TetherError::NoAvailableAddresses {
                    network: pool_id.to_string(),
                })?,
        };

        pool.allocated.insert(address);
        let prefix = pool.net.prefix_len();
        drop(state);

        self.calls.lock().push(format!("request_address {address}"));
        Ok((IpNet::new(address, prefix).unwrap(), IpamMeta::new()))
    }

    async fn release_address(&self, pool_id: &str, address: IpAddr) -> TetherResult<()> {
        self.calls.lock().push(format!("release_address {address}"));
        let mut state = self.state.lock();
        let released = state
            .pools
            .get_mut(pool_id)
            .is_some_and(|pool| pool.allocated.remove(&address));
        if released {
            Ok(())
        } else {
            Err(TetherError::internal(format!("{address} not allocated")))
        }
    }
}

/// Sandbox that records hosts entries pushed into it.
pub struct RecordingSandbox {
    id: String,
    pub added: Mutex<Vec<HostRecord>>,
    pub removed: Mutex<Vec<HostRecord>>,
}

impl RecordingSandbox {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            added: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
        })
    }
}

impl Sandbox for RecordingSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn add_hosts_entries(&self, records: &[HostRecord]) {
        self.added.lock().extend_from_slice(records);
    }

    fn delete_hosts_entries(&self, records: &[HostRecord]) {
        self.removed.lock().extend_from_slice(records);
    }
}

/// Store wrapper that logs writes and can reject them on demand.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    writes: Mutex<Vec<String>>,
    /// Puts to keys with this prefix fail with `KeyModified`.
    pub reject_puts: Mutex<Option<String>>,
    /// Deletes of keys with this prefix fail with `KeyModified`.
    pub reject_deletes: Mutex<Option<String>>,
}

impl FlakyStore {
    pub fn keys(&self) -> Vec<String> {
        self.inner.keys()
    }

    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().clone()
    }

    fn rejects(rule: &Mutex<Option<String>>, key: &str) -> bool {
        rule.lock()
            .as_deref()
            .is_some_and(|prefix| key.starts_with(prefix))
    }
}

#[async_trait]
impl KvStore for FlakyStore {
    async fn get(&self, key: &str) -> TetherResult<KvPair> {
        self.inner.get(key).await
    }

    async fn exists(&self, key: &str) -> TetherResult<bool> {
        self.inner.exists(key).await
    }

    async fn list(&self, prefix: &str) -> TetherResult<Vec<KvPair>> {
        self.inner.list(prefix).await
    }

    async fn atomic_put(&self, key: &str, value: Vec<u8>, previous: Option<u64>) -> TetherResult<u64> {
        if Self::rejects(&self.reject_puts, key) {
            return Err(TetherError::KeyModified { key: key.to_string() });
        }
        let index = self.inner.atomic_put(key, value, previous).await?;
        self.writes.lock().push(format!("put {key}"));
        Ok(index)
    }

    async fn atomic_delete(&self, key: &str, previous: u64) -> TetherResult<()> {
        if Self::rejects(&self.reject_deletes, key) {
            return Err(TetherError::KeyModified { key: key.to_string() });
        }
        self.inner.atomic_delete(key, previous).await?;
        self.writes.lock().push(format!("delete {key}"));
        Ok(())
    }
}

/// Key prefix of stored networks.
pub fn network_keys() -> String {
    format!("{DEFAULT_ROOT_CHAIN}/network/")
}

/// Key prefix of stored endpoints.
pub fn endpoint_keys() -> String {
    format!("{DEFAULT_ROOT_CHAIN}/endpoint/")
}

/// A controller wired to fakes.
///
/// `bridge` and `host` are local drivers, `overlay` is local and `vxlan`
/// is global. All share one recording driver.
pub struct Harness {
    pub controller: Controller,
    pub store: Arc<FlakyStore>,
    pub global: Arc<MemoryStore>,
    pub driver: Arc<RecordingDriver>,
    pub ipam: Arc<FakeIpam>,
}

pub async fn harness() -> Harness {
    let store = Arc::new(FlakyStore::default());
    let global = Arc::new(MemoryStore::new());
    let controller = Controller::new(
        ControllerConfig::default().with_default_ipam_driver("default"),
        store.clone(),
        Some(global.clone() as Arc<dyn KvStore>),
    );

    let driver = Arc::new(RecordingDriver::default());
    for network_type in ["bridge", "host", "overlay"] {
        controller
            .register_driver(network_type, driver.clone(), Capability::local())
            .unwrap();
    }
    controller
        .register_driver("vxlan", driver.clone(), Capability::global())
        .unwrap();

    let ipam = Arc::new(FakeIpam::default());
    controller
        .register_ipam_driver("default", ipam.clone())
        .await
        .unwrap();

    Harness {
        controller,
        store,
        global,
        driver,
        ipam,
    }
}
