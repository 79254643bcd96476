//! Integration tests for service records published on join and leave.

mod common;

use std::net::IpAddr;

use common::{RecordingSandbox, harness};
use tether::{EndpointOptions, HostRecord, IpamConf, NetworkOptions};
use tether_common::TetherError;

fn options(address: &str) -> EndpointOptions {
    let address: IpAddr = address.parse().unwrap();
    EndpointOptions::default().with_ip_address(address)
}

fn records(name: &str, network: &str, ip: &str) -> Vec<HostRecord> {
    vec![
        HostRecord::new(name, ip),
        HostRecord::new(format!("{name}.{network}"), ip),
    ]
}

#[test_log::test(tokio::test)]
async fn test_join_publishes_records_to_other_sandboxes() {
    let h = harness().await;
    let network = h
        .controller
        .new_network(
            "overlay",
            "app",
            NetworkOptions::default().with_ipam(
                "",
                "",
                vec![IpamConf::with_pool("10.0.0.0/24")],
                Vec::new(),
            ),
        )
        .await
        .unwrap();

    let db = network.create_endpoint("db", options("10.0.0.4")).await.unwrap();
    let web = network.create_endpoint("web", options("10.0.0.5")).await.unwrap();

    let first = RecordingSandbox::new("sb-db");
    let second = RecordingSandbox::new("sb-web");
    db.join(first.clone()).unwrap();

    // The first sandbox sees nothing but what others publish later
    assert!(first.added.lock().is_empty());

    web.join(second.clone()).unwrap();

    assert_eq!(*first.added.lock(), records("web", "app", "10.0.0.5"));
    // The joining sandbox is seeded with the records already present
    assert_eq!(*second.added.lock(), {
        let mut existing = records("db", "app", "10.0.0.4");
        existing.sort();
        existing
    });

    let mut expected = records("db", "app", "10.0.0.4");
    expected.extend(records("web", "app", "10.0.0.5"));
    expected.sort();
    assert_eq!(network.svc_records(), expected);

    web.leave().unwrap();

    assert_eq!(*first.removed.lock(), records("web", "app", "10.0.0.5"));
    assert!(second.removed.lock().is_empty());
    assert_eq!(network.svc_records(), {
        let mut remaining = records("db", "app", "10.0.0.4");
        remaining.sort();
        remaining
    });
    assert!(web.sandbox().is_none());
}

#[test_log::test(tokio::test)]
async fn test_endpoint_without_address_has_no_records() {
    let h = harness().await;
    let network = h
        .controller
        .new_network("host", "host", NetworkOptions::default().with_persist(false))
        .await
        .unwrap();
    let endpoint = network
        .create_endpoint("e1", EndpointOptions::default())
        .await
        .unwrap();

    endpoint.join(RecordingSandbox::new("sb1")).unwrap();

    assert!(network.svc_records().is_empty());
    endpoint.leave().unwrap();
}

#[test_log::test(tokio::test)]
async fn test_join_twice_is_rejected() {
    let h = harness().await;
    let network = h
        .controller
        .new_network("overlay", "app", NetworkOptions::default())
        .await
        .unwrap();
    let endpoint = network
        .create_endpoint("web", EndpointOptions::default())
        .await
        .unwrap();
    let sandbox = RecordingSandbox::new("sb1");

    endpoint.join(sandbox.clone()).unwrap();
    let err = endpoint.join(RecordingSandbox::new("sb2")).unwrap_err();

    assert!(matches!(
        err,
        TetherError::EndpointInUse { ref sandbox, .. } if sandbox == "sb1"
    ));
    assert_eq!(endpoint.sandbox().unwrap().id(), "sb1");
    assert_eq!(network.svc_records().len(), 2);
}
