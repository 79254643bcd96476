//! Service records: name to address mappings for endpoints on a network.

use ipnet::IpNet;

use super::Network;
use crate::sandbox::HostRecord;

impl Network {
    /// Add or remove the records of an endpoint.
    ///
    /// Both the bare name and `name.network` resolve to the endpoint's IPv4
    /// address. The change is pushed to the sandboxes of every other endpoint
    /// on this network attached here. Endpoints without an address have no
    /// records.
    pub(crate) fn update_svc_record(
        &self,
        endpoint_id: &str,
        endpoint_name: &str,
        address: Option<IpNet>,
        is_add: bool,
    ) {
        let Some(address) = address else {
            return;
        };
        let ip = address.addr();

        let (network_id, records) = {
            let state = self.state.lock();
            let qualified = format!("{endpoint_name}.{}", state.name);

            self.controller.with_svc_map(&state.id, |map| {
                if is_add {
                    map.insert(endpoint_name.to_string(), ip);
                    map.insert(qualified.clone(), ip);
                } else {
                    map.remove(endpoint_name);
                    map.remove(&qualified);
                }
            });

            let records = vec![
                HostRecord::new(endpoint_name, ip.to_string()),
                HostRecord::new(qualified, ip.to_string()),
            ];
            (state.id.clone(), records)
        };

        let sandboxes = self.controller.local_sandboxes(&network_id, endpoint_id);
        for sandbox in &sandboxes {
            if is_add {
                sandbox.add_hosts_entries(&records);
            } else {
                sandbox.delete_hosts_entries(&records);
            }
        }

        tracing::debug!(
            network = %network_id,
            endpoint = endpoint_name,
            %ip,
            is_add,
            sandboxes = sandboxes.len(),
            "Updated service records"
        );
    }

    /// Current service records of the network, sorted by name.
    #[must_use]
    pub fn svc_records(&self) -> Vec<HostRecord> {
        let state = self.state.lock();
        let mut records: Vec<HostRecord> = self
            .controller
            .svc_entries(&state.id)
            .into_iter()
            .map(|(name, ip)| HostRecord::new(name, ip.to_string()))
            .collect();
        drop(state);

        records.sort();
        records
    }
}
