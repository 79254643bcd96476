//! Integration tests for endpoint creation and deletion.

mod common;

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use common::{Fail, RecordingSandbox, endpoint_keys, harness, network_keys};
use tether::{
    Capability, Controller, ControllerConfig, EndpointOptions, IpamConf, Network, NetworkOptions,
};
use tether_common::TetherError;

async fn overlay(h: &common::Harness, name: &str, cidr: &str) -> Arc<Network> {
    let options =
        NetworkOptions::default().with_ipam("", "", vec![IpamConf::with_pool(cidr)], Vec::new());
    h.controller
        .new_network("overlay", name, options)
        .await
        .unwrap()
}

async fn stored_count(h: &common::Harness, network: &Network) -> u64 {
    h.controller
        .network_by_id(&network.id())
        .await
        .unwrap()
        .endpoint_count()
}

#[test_log::test(tokio::test)]
async fn test_endpoint_lifecycle() {
    let h = harness().await;
    let network = overlay(&h, "app", "10.0.0.0/24").await;

    let endpoint = network
        .create_endpoint("web", EndpointOptions::default())
        .await
        .unwrap();

    // Gateway took .1, the endpoint gets the next free address
    assert_eq!(endpoint.address().unwrap().to_string(), "10.0.0.2/24");
    assert_eq!(endpoint.iface().v4_pool_id(), "LocalDefault/10.0.0.0/24");
    assert_eq!(endpoint.network_id(), network.id());
    assert_eq!(stored_count(&h, &network).await, 1);
    assert_eq!(h.driver.count("create_endpoint"), 1);
    assert!(
        h.store
            .keys()
            .contains(&format!("{}{}/{}", endpoint_keys(), network.id(), endpoint.id()))
    );

    // Lookups
    assert_eq!(network.endpoints().await.len(), 1);
    let by_name = network.endpoint_by_name("web").await.unwrap();
    assert_eq!(by_name.id(), endpoint.id());
    let by_id = network.endpoint_by_id(&endpoint.id()).await.unwrap();
    assert_eq!(by_id.iface(), endpoint.iface());
    assert!(matches!(
        network.endpoint_by_id("missing").await.unwrap_err(),
        TetherError::EndpointNotFound { .. }
    ));

    endpoint.delete().await.unwrap();

    assert_eq!(stored_count(&h, &network).await, 0);
    assert!(!h.ipam.is_allocated("10.0.0.2"));
    assert_eq!(h.driver.count("delete_endpoint"), 1);
    assert!(network.endpoints().await.is_empty());

    network.delete().await.unwrap();
    assert!(h.store.keys().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_duplicate_endpoint_name() {
    let h = harness().await;
    let network = overlay(&h, "app", "10.0.0.0/24").await;
    network
        .create_endpoint("web", EndpointOptions::default())
        .await
        .unwrap();

    let err = network
        .create_endpoint("web", EndpointOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, TetherError::EndpointExists { .. }));
    assert_eq!(stored_count(&h, &network).await, 1);
    assert_eq!(h.driver.count("create_endpoint"), 1);
    assert_eq!(h.ipam.allocated(), 2);
}

#[test_log::test(tokio::test)]
async fn test_invalid_endpoint_name() {
    let h = harness().await;
    let network = overlay(&h, "app", "10.0.0.0/24").await;

    let err = network
        .create_endpoint("web.app", EndpointOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, TetherError::InvalidName { .. }));
    assert_eq!(h.ipam.allocated(), 1);
}

#[test_log::test(tokio::test)]
async fn test_count_update_is_last_write() {
    let h = harness().await;
    let network = overlay(&h, "app", "10.0.0.0/24").await;

    let endpoint = network
        .create_endpoint("web", EndpointOptions::default())
        .await
        .unwrap();

    let writes = h.store.writes();
    let n = writes.len();
    assert_eq!(
        writes[n - 2],
        format!("put {}{}/{}", endpoint_keys(), network.id(), endpoint.id())
    );
    assert_eq!(writes[n - 1], format!("put {}{}", network_keys(), network.id()));
}

#[test_log::test(tokio::test)]
async fn test_driver_failure_releases_address() {
    let h = harness().await;
    let network = overlay(&h, "app", "10.0.0.0/24").await;
    h.driver.fail_create_endpoint.store(true, Ordering::SeqCst);

    let err = network
        .create_endpoint("web", EndpointOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, TetherError::Internal { .. }));
    assert_eq!(h.ipam.allocated(), 1);
    assert!(!h.ipam.is_allocated("10.0.0.2"));
    assert_eq!(stored_count(&h, &network).await, 0);
    assert!(
        !h.store
            .keys()
            .iter()
            .any(|key| key.starts_with(&endpoint_keys()))
    );
}

#[test_log::test(tokio::test)]
async fn test_failed_count_update_undoes_everything() {
    let h = harness().await;
    let network = overlay(&h, "app", "10.0.0.0/24").await;
    *h.store.reject_puts.lock() = Some(network_keys());

    let err = network
        .create_endpoint("web", EndpointOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, TetherError::KeyModified { .. }));
    assert_eq!(h.driver.count("delete_endpoint"), 1);
    assert_eq!(h.ipam.allocated(), 1);
    assert!(
        !h.store
            .keys()
            .iter()
            .any(|key| key.starts_with(&endpoint_keys()))
    );

    *h.store.reject_puts.lock() = None;
    assert_eq!(stored_count(&h, &network).await, 0);
}

#[test_log::test(tokio::test)]
async fn test_preferred_address() {
    let h = harness().await;
    let network = overlay(&h, "app", "10.0.0.0/24").await;
    let preferred: IpAddr = "10.0.0.5".parse().unwrap();

    let endpoint = network
        .create_endpoint("web", EndpointOptions::default().with_ip_address(preferred))
        .await
        .unwrap();

    assert_eq!(endpoint.address().unwrap().to_string(), "10.0.0.5/24");
}

#[test_log::test(tokio::test)]
async fn test_exhausted_pool_moves_to_next() {
    let h = harness().await;
    let options = NetworkOptions::default().with_ipam(
        "",
        "",
        vec![
            IpamConf::with_pool("10.9.0.0/30"),
            IpamConf::with_pool("10.9.1.0/30"),
        ],
        Vec::new(),
    );
    let network = h
        .controller
        .new_network("overlay", "tiny", options)
        .await
        .unwrap();

    // Each /30 has two hosts, and each gateway takes one
    let first = network
        .create_endpoint("a", EndpointOptions::default())
        .await
        .unwrap();
    let second = network
        .create_endpoint("b", EndpointOptions::default())
        .await
        .unwrap();
    assert_eq!(first.address().unwrap().to_string(), "10.9.0.2/30");
    assert_eq!(second.address().unwrap().to_string(), "10.9.1.2/30");
    assert_eq!(second.iface().v4_pool_id(), "LocalDefault/10.9.1.0/30");

    let err = network
        .create_endpoint("c", EndpointOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TetherError::NoAvailableAddresses { .. }));
    assert_eq!(stored_count(&h, &network).await, 2);
}

#[test_log::test(tokio::test)]
async fn test_ipv6_addresses() {
    let h = harness().await;
    let options = NetworkOptions::default().with_ipam(
        "",
        "",
        vec![IpamConf::with_pool("10.0.0.0/24")],
        vec![IpamConf::with_pool("fd00:1::/64").ipv6()],
    );
    let network = h
        .controller
        .new_network("overlay", "dual", options)
        .await
        .unwrap();
    assert_eq!(network.ipam_v6_info().len(), 1);
    assert_eq!(network.ipv6_data()[0].pool.to_string(), "fd00:1::/64");

    let endpoint = network
        .create_endpoint("web", EndpointOptions::default())
        .await
        .unwrap();
    let address_v6 = endpoint.address_v6().unwrap();
    assert!(network.ipv6_data()[0].pool.contains(&address_v6.addr()));
    assert_eq!(address_v6.prefix_len(), 64);
    assert_eq!(endpoint.address().unwrap().to_string(), "10.0.0.2/24");

    endpoint.delete().await.unwrap();
    network.delete().await.unwrap();
    assert_eq!(h.ipam.allocated(), 0);
    assert_eq!(h.ipam.pool_count(), 0);
}

#[test_log::test(tokio::test)]
async fn test_host_network_without_persistence() {
    let h = harness().await;
    let network = h
        .controller
        .new_network(
            "host",
            "host",
            NetworkOptions::default().with_persist(false),
        )
        .await
        .unwrap();

    let endpoint = network
        .create_endpoint("e1", EndpointOptions::default())
        .await
        .unwrap();

    assert!(h.store.keys().is_empty());
    assert!(endpoint.address().is_none());
    assert_eq!(network.endpoint_count(), 1);
    assert_eq!(network.endpoints().await.len(), 1);
    assert!(network.endpoint_by_id(&endpoint.id()).await.is_ok());

    endpoint.delete().await.unwrap();
    assert_eq!(network.endpoint_count(), 0);
    assert!(network.endpoints().await.is_empty());
    assert!(h.store.writes().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_joined_endpoint_cannot_be_deleted() {
    let h = harness().await;
    let network = overlay(&h, "app", "10.0.0.0/24").await;
    let endpoint = network
        .create_endpoint("web", EndpointOptions::default())
        .await
        .unwrap();
    endpoint.join(RecordingSandbox::new("sb1")).unwrap();

    let err = endpoint.delete().await.unwrap_err();
    assert!(matches!(err, TetherError::EndpointInUse { .. }));
    assert_eq!(stored_count(&h, &network).await, 1);

    endpoint.leave().unwrap();
    endpoint.delete().await.unwrap();
    assert_eq!(stored_count(&h, &network).await, 0);
}

#[test_log::test(tokio::test)]
async fn test_refused_endpoint_delete_is_undone() {
    let h = harness().await;
    let network = overlay(&h, "app", "10.0.0.0/24").await;
    let endpoint = network
        .create_endpoint("web", EndpointOptions::default())
        .await
        .unwrap();
    *h.driver.delete_endpoint_failure.lock() = Some(Fail::Forbidden);

    let err = endpoint.delete().await.unwrap_err();

    assert!(err.is_forbidden());
    assert_eq!(stored_count(&h, &network).await, 1);
    assert!(network.endpoint_by_name("web").await.is_ok());
    assert!(h.ipam.is_allocated("10.0.0.2"));

    // The restored record can still be deleted once the driver relents
    *h.driver.delete_endpoint_failure.lock() = None;
    let restored = network.endpoint_by_name("web").await.unwrap();
    restored.delete().await.unwrap();
    assert_eq!(stored_count(&h, &network).await, 0);
}

#[test_log::test(tokio::test)]
async fn test_endpoint_delete_tolerates_driver_errors() {
    let h = harness().await;
    let network = overlay(&h, "app", "10.0.0.0/24").await;
    let endpoint = network
        .create_endpoint("web", EndpointOptions::default())
        .await
        .unwrap();
    *h.driver.delete_endpoint_failure.lock() = Some(Fail::Internal);

    endpoint.delete().await.unwrap();

    assert_eq!(stored_count(&h, &network).await, 0);
    assert!(!h.ipam.is_allocated("10.0.0.2"));
}

#[test_log::test(tokio::test)]
async fn test_lazy_registration_once_per_instance() {
    let h = harness().await;
    let network = h
        .controller
        .new_network(
            "bridge",
            "docker0",
            NetworkOptions::default().with_persist(false),
        )
        .await
        .unwrap();
    assert_eq!(h.driver.count("create_network"), 1);

    let creations = ["a", "b", "c"].map(|name| network.create_endpoint(name, EndpointOptions::default()));
    for result in futures::future::join_all(creations).await {
        result.unwrap();
    }

    // The instance that created the network already registered it
    assert_eq!(h.driver.count("create_network"), 1);
    assert_eq!(h.driver.count("create_endpoint"), 3);
    assert_eq!(network.endpoint_count(), 3);
}

#[test_log::test(tokio::test)]
async fn test_stored_legacy_network_registers_once() {
    let h = harness().await;
    let network = h
        .controller
        .new_network("bridge", "docker0", NetworkOptions::default())
        .await
        .unwrap();

    for name in ["a", "b", "c"] {
        network
            .create_endpoint(name, EndpointOptions::default())
            .await
            .unwrap();
    }
    network.endpoint_by_name("b").await.unwrap().delete().await.unwrap();

    // Every read of the network shares the latch closed at creation
    assert_eq!(h.driver.count("create_network"), 1);
    assert_eq!(h.driver.count("create_endpoint"), 3);
    assert_eq!(stored_count(&h, &network).await, 2);
}

#[test_log::test(tokio::test)]
async fn test_restarted_controller_registers_legacy_network_once() {
    let h = harness().await;
    let network = h
        .controller
        .new_network("bridge", "docker0", NetworkOptions::default())
        .await
        .unwrap();

    let restarted = Controller::new(ControllerConfig::default(), h.store.clone(), None);
    restarted
        .register_driver("bridge", h.driver.clone(), Capability::local())
        .unwrap();
    let reloaded = restarted.network_by_id(&network.id()).await.unwrap();

    for name in ["a", "b"] {
        reloaded
            .create_endpoint(name, EndpointOptions::default())
            .await
            .unwrap();
    }

    // The new controller tells the driver about the network before its
    // first endpoint, and only once
    let events = h.driver.events();
    let register = events
        .iter()
        .rposition(|e| e.starts_with("create_network"))
        .unwrap();
    let endpoint = events
        .iter()
        .position(|e| e.starts_with("create_endpoint"))
        .unwrap();
    assert_eq!(h.driver.count("create_network"), 2);
    assert!(register < endpoint);
}
