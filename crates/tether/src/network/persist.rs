//! Stored form of a network.
//!
//! Pool configuration and allocation lists are stored as JSON-encoded
//! strings nested inside the network document, and only when non-empty.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tether_common::{GenericOptions, Scope, TetherResult};
use tether_store::{KvObject, NETWORK_KEY_PREFIX};

use super::{Network, NetworkState};

#[derive(Debug, Serialize, Deserialize)]
struct NetworkRecord {
    name: String,
    id: String,
    #[serde(rename = "networkType")]
    network_type: String,
    #[serde(rename = "ipamType", default)]
    ipam_type: String,
    #[serde(rename = "addrSpace", default)]
    addr_space: String,
    #[serde(rename = "endpointCnt", default)]
    endpoint_cnt: u64,
    #[serde(rename = "enableIPv6", default)]
    enable_ipv6: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    generic: Option<GenericOptions>,
    #[serde(default = "stored_default")]
    persist: bool,
    #[serde(rename = "ipamV4Config", default, skip_serializing_if = "Option::is_none")]
    ipam_v4_config: Option<String>,
    #[serde(rename = "ipamV4Info", default, skip_serializing_if = "Option::is_none")]
    ipam_v4_info: Option<String>,
    #[serde(rename = "ipamV6Config", default, skip_serializing_if = "Option::is_none")]
    ipam_v6_config: Option<String>,
    #[serde(rename = "ipamV6Info", default, skip_serializing_if = "Option::is_none")]
    ipam_v6_info: Option<String>,
}

// Anything found in the store was persisted.
const fn stored_default() -> bool {
    true
}

fn encode_list<T: Serialize>(list: &[T]) -> TetherResult<Option<String>> {
    if list.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string(list)?))
}

fn decode_list<T: DeserializeOwned>(encoded: Option<&str>) -> TetherResult<Vec<T>> {
    match encoded {
        Some(encoded) if !encoded.is_empty() => Ok(serde_json::from_str(encoded)?),
        _ => Ok(Vec::new()),
    }
}

impl NetworkRecord {
    fn from_state(state: &NetworkState) -> TetherResult<Self> {
        Ok(Self {
            name: state.name.clone(),
            id: state.id.clone(),
            network_type: state.network_type.clone(),
            ipam_type: state.ipam_type.clone(),
            addr_space: state.addr_space.clone(),
            endpoint_cnt: state.endpoint_cnt,
            enable_ipv6: state.enable_ipv6,
            generic: state.generic.clone(),
            persist: state.persist,
            ipam_v4_config: encode_list(&state.ipam_v4_config)?,
            ipam_v4_info: encode_list(&state.ipam_v4_info)?,
            ipam_v6_config: encode_list(&state.ipam_v6_config)?,
            ipam_v6_info: encode_list(&state.ipam_v6_info)?,
        })
    }
}

impl KvObject for Network {
    fn key(&self) -> Vec<String> {
        vec![NETWORK_KEY_PREFIX.to_string(), self.id()]
    }

    fn key_prefix(&self) -> Vec<String> {
        vec![NETWORK_KEY_PREFIX.to_string()]
    }

    fn value(&self) -> TetherResult<Vec<u8>> {
        let record = NetworkRecord::from_state(&self.state.lock())?;
        Ok(serde_json::to_vec(&record)?)
    }

    fn set_value(&self, value: &[u8]) -> TetherResult<()> {
        let record: NetworkRecord = serde_json::from_slice(value)?;
        let ipam_v4_config = decode_list(record.ipam_v4_config.as_deref())?;
        let ipam_v4_info = decode_list(record.ipam_v4_info.as_deref())?;
        let ipam_v6_config = decode_list(record.ipam_v6_config.as_deref())?;
        let ipam_v6_info = decode_list(record.ipam_v6_info.as_deref())?;

        let mut state = self.state.lock();
        state.name = record.name;
        state.id = record.id;
        state.network_type = record.network_type;
        state.ipam_type = record.ipam_type;
        state.addr_space = record.addr_space;
        state.endpoint_cnt = record.endpoint_cnt;
        state.enable_ipv6 = record.enable_ipv6;
        state.generic = record.generic;
        state.persist = record.persist;
        state.ipam_v4_config = ipam_v4_config;
        state.ipam_v4_info = ipam_v4_info;
        state.ipam_v6_config = ipam_v6_config;
        state.ipam_v6_info = ipam_v6_info;
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
        !self.state.lock().persist
    }

    fn data_scope(&self) -> Scope {
        self.state.lock().scope
    }

    fn new_object(&self) -> Self {
        Self::blank(self.controller.clone())
    }

    fn copy_to(&self, dst: &Self) {
        if std::ptr::eq(self, dst) {
            return;
        }
        let snapshot = self.state.lock().clone();
        *dst.state.lock() = snapshot;
    }
}
