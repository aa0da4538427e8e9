use std::sync::Arc;

use stratus_backend::{Backend, MemoryBackend, ResourceKind};
use stratus_common::{DeploymentConfig, SubnetKind};
use stratus_topology::{Blueprint, Provisioner, ResourceKeys, RetryConfig};

fn config(zones: u32) -> DeploymentConfig {
    serde_json::from_value(serde_json::json!({
        "name": "web",
        "account_id": "123456789012",
        "image_repository": "registry.local/web",
        "network_cidr": "10.1.0.0/16",
        "zone_count": zones,
        "listener_ingress": ["0.0.0.0/0"],
        "source_repository": "git.local/acme/web",
        "source_credential": "secret://git-token"
    }))
    .unwrap()
}

#[tokio::test]
async fn three_zone_network_has_six_subnets_and_one_gateway() {
    let bp = Blueprint::compose(&config(3)).unwrap();

    let public: Vec<String> = bp
        .network
        .subnets_of(SubnetKind::Public)
        .map(|s| s.cidr.to_string())
        .collect();
    let private: Vec<String> = bp
        .network
        .subnets_of(SubnetKind::Private)
        .map(|s| s.cidr.to_string())
        .collect();
    assert_eq!(public, vec!["10.1.0.0/24", "10.1.1.0/24", "10.1.2.0/24"]);
    assert_eq!(private, vec!["10.1.3.0/24", "10.1.4.0/24", "10.1.5.0/24"]);
    assert_eq!(bp.network.gateways().len(), 1);

    let backend = MemoryBackend::new();
    let provisioner =
        Provisioner::new(Arc::new(backend.clone())).with_retry(RetryConfig::immediate(2));
    let topo = provisioner.provision(&bp.graph).await.unwrap();

    let gateways = topo
        .handles()
        .iter()
        .filter(|h| h.kind == ResourceKind::Gateway)
        .count();
    assert_eq!(gateways, 1);
    assert!(topo.get(ResourceKeys::TARGET).is_some());
}

#[tokio::test]
async fn replicas_land_in_private_subnets() {
    let bp = Blueprint::compose(&config(3)).unwrap();
    let backend = MemoryBackend::new();
    Provisioner::new(Arc::new(backend.clone()))
        .provision(&bp.graph)
        .await
        .unwrap();

    let workload = bp.workload.reference();
    let mut zones = Vec::new();
    for _ in 0..3 {
        let replica = backend.start_replica("web", &workload).await.unwrap();
        let addr = match replica.address.ip() {
            std::net::IpAddr::V4(v4) => v4,
            other => panic!("unexpected address {other}"),
        };
        assert!(bp
            .network
            .subnets_of(SubnetKind::Private)
            .any(|s| s.cidr.contains(addr)));
        zones.push(replica.zone);
    }
    zones.sort();
    zones.dedup();
    assert_eq!(zones.len(), 3);
}
