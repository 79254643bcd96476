//! Pool allocation for networks.

use std::collections::{BTreeMap, HashMap};
use std::future;
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tether_common::{Scope, TetherError, TetherResult, labels};

use super::Network;
use crate::driverapi::IpamData;
use crate::ipamapi::{IpamDriver, IpamMeta, manages_own_addresses};
use crate::rollback::Rollback;

/// A requested pool for one address family.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpamConf {
    /// Pool to request, in CIDR form. Empty lets the IPAM driver choose.
    #[serde(rename = "PreferredPool", default)]
    pub preferred_pool: String,

    /// Sub-range of the pool to allocate addresses from.
    #[serde(rename = "SubPool", default)]
    pub sub_pool: String,

    /// Options passed to the IPAM driver.
    #[serde(rename = "Options", default, deserialize_with = "null_as_default")]
    pub options: HashMap<String, String>,

    /// Whether this is an IPv6 pool.
    #[serde(rename = "IsV6", default)]
    pub is_v6: bool,

    /// Explicit gateway address.
    #[serde(rename = "Gateway", default, with = "empty_as_none")]
    pub gateway: Option<String>,

    /// Auxiliary addresses to reserve, by name.
    #[serde(rename = "AuxAddresses", default, deserialize_with = "null_as_default")]
    pub aux_addresses: BTreeMap<String, String>,
}

impl IpamConf {
    /// Request a specific pool.
    pub fn with_pool(pool: impl Into<String>) -> Self {
        Self {
            preferred_pool: pool.into(),
            ..Self::default()
        }
    }

    /// Restrict address allocation to a sub-range.
    #[must_use]
    pub fn with_sub_pool(mut self, sub_pool: impl Into<String>) -> Self {
        self.sub_pool = sub_pool.into();
        self
    }

    /// Request an explicit gateway.
    #[must_use]
    pub fn with_gateway(mut self, gateway: impl Into<String>) -> Self {
        self.gateway = Some(gateway.into());
        self
    }

    /// Reserve a named auxiliary address.
    #[must_use]
    pub fn with_aux_address(mut self, name: impl Into<String>, address: impl Into<String>) -> Self {
        self.aux_addresses.insert(name.into(), address.into());
        self
    }

    /// Add an IPAM driver option.
    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Mark the pool as IPv6.
    #[must_use]
    pub const fn ipv6(mut self) -> Self {
        self.is_v6 = true;
        self
    }

    /// The explicit gateway, parsed.
    ///
    /// # Errors
    ///
    /// Returns `BadRequest` if the gateway is not an IP address.
    pub fn gateway_address(&self) -> TetherResult<Option<IpAddr>> {
        self.gateway
            .as_deref()
            .map(|gateway| {
                gateway.parse().map_err(|_| {
                    TetherError::bad_request(format!(
                        "invalid gateway address {gateway} in IpamConf structure"
                    ))
                })
            })
            .transpose()
    }

    /// Check the request before anything is allocated.
    ///
    /// # Errors
    ///
    /// Returns `BadRequest` if the gateway is not an IP address.
    pub fn validate(&self) -> TetherResult<()> {
        self.gateway_address().map(|_| ())
    }
}

/// An allocated pool and the addressing derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpamInfo {
    /// Pool ID handed out by the IPAM driver.
    pub pool_id: String,
    /// Pool metadata returned by the IPAM driver.
    pub meta: IpamMeta,
    /// Driver view of the pool.
    pub data: IpamData,
}

#[derive(Serialize, Deserialize)]
struct IpamInfoRecord {
    #[serde(rename = "PoolID")]
    pool_id: String,
    #[serde(rename = "Meta", default, skip_serializing_if = "Option::is_none")]
    meta: Option<IpamMeta>,
    #[serde(rename = "IPAMData", default, skip_serializing_if = "Option::is_none")]
    data: Option<String>,
}

impl Serialize for IpamInfo {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::Error as _;

        let data = serde_json::to_string(&self.data).map_err(S::Error::custom)?;
        IpamInfoRecord {
            pool_id: self.pool_id.clone(),
            meta: (!self.meta.is_empty()).then(|| self.meta.clone()),
            data: Some(data),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for IpamInfo {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let record = IpamInfoRecord::deserialize(deserializer)?;
        let encoded = record
            .data
            .ok_or_else(|| D::Error::missing_field("IPAMData"))?;
        let data = serde_json::from_str(&encoded).map_err(D::Error::custom)?;

        Ok(Self {
            pool_id: record.pool_id,
            meta: record.meta.unwrap_or_default(),
            data,
        })
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

mod empty_as_none {
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(value.as_deref().unwrap_or_default())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
        Ok(Option::<String>::deserialize(deserializer)?.filter(|s| !s.is_empty()))
    }
}

fn gateway_from_meta(meta: &IpamMeta) -> TetherResult<Option<IpNet>> {
    meta.get(labels::GATEWAY)
        .map(|gateway| {
            gateway.parse().map_err(|e| {
                TetherError::bad_request(format!(
                    "failed to parse gateway address ({gateway}) returned by ipam driver: {e}"
                ))
            })
        })
        .transpose()
}

fn release_address_later(
    rollback: &mut Rollback,
    step: &'static str,
    ipam: &Arc<dyn IpamDriver>,
    pool_id: &str,
    address: IpAddr,
) {
    let ipam = ipam.clone();
    let pool_id = pool_id.to_string();
    rollback.push(step, move || async move {
        if let Err(e) = ipam.release_address(&pool_id, address).await {
            tracing::warn!(pool_id = %pool_id, %address, error = %e, "Failed to release address");
        }
    });
}

/// Allocate every requested pool of one family, registering a release for
/// each completed allocation.
async fn allocate_pools(
    ipam: &Arc<dyn IpamDriver>,
    address_space: &str,
    configs: &[IpamConf],
    v6: bool,
    rollback: &mut Rollback,
) -> TetherResult<Vec<IpamInfo>> {
    let mut infos = Vec::with_capacity(configs.len());

    for conf in configs {
        let gateway = rollback.step(future::ready(conf.gateway_address())).await?;

        let (pool_id, pool, meta) = rollback
            .step(ipam.request_pool(
                address_space,
                &conf.preferred_pool,
                &conf.sub_pool,
                &conf.options,
                conf.is_v6 || v6,
            ))
            .await?;
        {
            let ipam = ipam.clone();
            let pool_id = pool_id.clone();
            rollback.push("release pool", move || async move {
                if let Err(e) = ipam.release_pool(&pool_id).await {
                    tracing::warn!(pool_id = %pool_id, error = %e, "Failed to release pool");
                }
            });
        }

        let mut data = IpamData::new(address_space, pool);
        data.gateway = rollback.step(future::ready(gateway_from_meta(&meta))).await?;

        if gateway.is_some() || data.gateway.is_none() {
            let (address, _) = rollback
                .step(async {
                    ipam.request_address(&pool_id, gateway, None)
                        .await
                        .map_err(|e| {
                            TetherError::internal(format!(
                                "failed to allocate gateway ({}): {e}",
                                conf.gateway.as_deref().unwrap_or_default()
                            ))
                        })
                })
                .await?;
            release_address_later(rollback, "release gateway", ipam, &pool_id, address.addr());
            data.gateway = Some(address);
        }

        for (name, raw) in &conf.aux_addresses {
            let preferred: IpAddr = rollback
                .step(future::ready(raw.parse().map_err(|_| {
                    TetherError::bad_request(format!(
                        "non parsable secondary ip address ({name}:{raw}) passed for network"
                    ))
                })))
                .await?;

            let (address, _) = rollback
                .step(async {
                    ipam.request_address(&pool_id, Some(preferred), None)
                        .await
                        .map_err(|e| {
                            TetherError::internal(format!(
                                "failed to allocate secondary ip address ({name}:{raw}): {e}"
                            ))
                        })
                })
                .await?;
            // Freed along with the pool on rollback.
            data.aux_addresses.insert(name.clone(), address);
        }

        infos.push(IpamInfo {
            pool_id,
            meta,
            data,
        });
    }

    Ok(infos)
}

async fn release_pools(ipam: &Arc<dyn IpamDriver>, network: &str, infos: &[IpamInfo]) {
    for info in infos {
        if let Some(gateway) = info.data.gateway {
            if let Err(e) = ipam.release_address(&info.pool_id, gateway.addr()).await {
                tracing::warn!(
                    network,
                    pool_id = %info.pool_id,
                    gateway = %gateway.addr(),
                    error = %e,
                    "Failed to release gateway address"
                );
            }
        }

        for (name, address) in &info.data.aux_addresses {
            if let Err(e) = ipam.release_address(&info.pool_id, address.addr()).await {
                tracing::warn!(
                    network,
                    pool_id = %info.pool_id,
                    aux = %name,
                    error = %e,
                    "Failed to release secondary address"
                );
            }
        }

        if let Err(e) = ipam.release_pool(&info.pool_id).await {
            tracing::warn!(network, pool_id = %info.pool_id, error = %e, "Failed to release pool");
        }
    }
}

impl Network {
    /// Allocate every requested pool.
    ///
    /// Returns the releases for what was allocated, so the caller can undo
    /// the allocation if a later step fails. A failure here is already
    /// undone before the error is returned.
    pub(crate) async fn ipam_allocate(&self) -> TetherResult<Rollback> {
        let mut rollback = Rollback::new("ipam allocation");

        let (network_type, ipam_type, mut address_space, v4_config, v6_config, scope) = {
            let state = self.state.lock();
            (
                state.network_type.clone(),
                state.ipam_type.clone(),
                state.addr_space.clone(),
                state.ipam_v4_config.clone(),
                state.ipam_v6_config.clone(),
                state.scope,
            )
        };

        if manages_own_addresses(&network_type) {
            return Ok(rollback);
        }

        let entry = self.controller.ipam_driver(&ipam_type)?;
        if address_space.is_empty() {
            address_space = match scope {
                Scope::Local => entry.default_local_space.clone(),
                Scope::Global => entry.default_global_space.clone(),
            };
        }

        let v4_config = if v4_config.is_empty() {
            vec![IpamConf::default()]
        } else {
            v4_config
        };

        let v4_info =
            allocate_pools(&entry.driver, &address_space, &v4_config, false, &mut rollback).await?;
        let v6_info =
            allocate_pools(&entry.driver, &address_space, &v6_config, true, &mut rollback).await?;

        tracing::debug!(
            network = %self.name(),
            address_space = %address_space,
            v4_pools = v4_info.len(),
            v6_pools = v6_info.len(),
            "Allocated network pools"
        );

        let mut state = self.state.lock();
        state.addr_space = address_space;
        state.ipam_v4_config = v4_config;
        state.ipam_v4_info = v4_info;
        state.ipam_v6_info = v6_info;
        drop(state);

        Ok(rollback)
    }

    /// Release every allocated pool with its gateway and auxiliary addresses.
    ///
    /// Failures are logged and do not stop the release of the rest.
    pub(crate) async fn ipam_release(&self) {
        let (name, network_type, ipam_type, v4_info, v6_info) = {
            let state = self.state.lock();
            (
                state.name.clone(),
                state.network_type.clone(),
                state.ipam_type.clone(),
                state.ipam_v4_info.clone(),
                state.ipam_v6_info.clone(),
            )
        };

        if manages_own_addresses(&network_type) {
            return;
        }

        let ipam = match self.controller.ipam_driver(&ipam_type) {
            Ok(entry) => entry.driver,
            Err(e) => {
                tracing::warn!(
                    network = %name,
                    ipam = %ipam_type,
                    error = %e,
                    "Failed to retrieve ipam driver to release address pools"
                );
                return;
            }
        };

        release_pools(&ipam, &name, &v4_info).await;
        release_pools(&ipam, &name, &v6_info).await;
    }
}
