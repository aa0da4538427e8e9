//! The full resource graph for one deployment, composed from its config.

use serde::Serialize;

use stratus_backend::{HealthCheck, ResourceRequest};
use stratus_common::{
    AccessPolicy, Cidr, DeploymentConfig, NetworkTopology, Result, ServiceSpec, SubnetKind,
    WorkloadDefinition,
};

use crate::graph::ResourceGraph;

/// Logical keys of the resources every deployment declares.
pub struct ResourceKeys;

impl ResourceKeys {
    pub const NETWORK: &'static str = "network";
    pub const CLUSTER: &'static str = "cluster";
    pub const EXECUTION_IDENTITY: &'static str = "execution-identity";
    pub const BUILD_IDENTITY: &'static str = "build-identity";
    pub const LOG_GROUP: &'static str = "log-group";
    pub const WORKLOAD: &'static str = "workload";
    pub const SERVICE: &'static str = "service";
    pub const LOAD_BALANCER: &'static str = "load-balancer";
    pub const LISTENER: &'static str = "listener";
    pub const TARGET: &'static str = "target";

    /// Workload revisions after the first get their own key.
    pub fn workload_revision(revision: u32) -> String {
        if revision <= 1 {
            Self::WORKLOAD.to_string()
        } else {
            format!("{}-r{revision}", Self::WORKLOAD)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ListenerPlan {
    pub port: u16,
    pub ingress: Vec<Cidr>,
    pub target_port: u16,
    pub health_check: HealthCheck,
}

#[derive(Debug, Clone, Serialize)]
pub struct Blueprint {
    pub name: String,
    pub network: NetworkTopology,
    pub workload: WorkloadDefinition,
    pub service: ServiceSpec,
    pub execution_policy: AccessPolicy,
    pub build_policy: AccessPolicy,
    pub listener: ListenerPlan,
    pub graph: ResourceGraph,
}

impl Blueprint {
    /// Validates the config and lays out every resource. Nothing is created here.
    pub fn compose(config: &DeploymentConfig) -> Result<Self> {
        config.validate()?;

        let network = config.network()?;
        let workload = config.workload()?;
        let service = config.service_spec();
        let execution_policy = config.execution_policy();
        let build_policy = config.build_policy();
        let listener = ListenerPlan {
            port: config.listener_port,
            ingress: config.listener_ingress.clone(),
            target_port: config.container_port,
            health_check: HealthCheck {
                path: config.health_check_path.clone(),
                ..HealthCheck::default()
            },
        };

        let mut graph = ResourceGraph::new();
        graph.add(
            ResourceKeys::NETWORK,
            ResourceRequest::Network {
                topology: network.clone(),
            },
        )?;
        for gateway in network.gateways() {
            graph.add(
                gateway.name.clone(),
                ResourceRequest::Gateway {
                    network: ResourceKeys::NETWORK.into(),
                    gateway: gateway.clone(),
                },
            )?;
        }
        graph.add(
            ResourceKeys::CLUSTER,
            ResourceRequest::Cluster {
                network: ResourceKeys::NETWORK.into(),
            },
        )?;
        graph.add(
            ResourceKeys::EXECUTION_IDENTITY,
            ResourceRequest::Identity {
                policy: execution_policy.clone(),
            },
        )?;
        graph.add(
            ResourceKeys::BUILD_IDENTITY,
            ResourceRequest::Identity {
                policy: build_policy.clone(),
            },
        )?;
        graph.add(
            ResourceKeys::LOG_GROUP,
            ResourceRequest::LogGroup {
                destination: config.log_destination(),
            },
        )?;
        graph.add(
            ResourceKeys::WORKLOAD,
            ResourceRequest::Workload {
                definition: workload.clone(),
                execution_identity: ResourceKeys::EXECUTION_IDENTITY.into(),
                log_group: ResourceKeys::LOG_GROUP.into(),
            },
        )?;
        graph.add(
            ResourceKeys::SERVICE,
            ResourceRequest::Service {
                cluster: ResourceKeys::CLUSTER.into(),
                workload: ResourceKeys::WORKLOAD.into(),
                spec: service.clone(),
            },
        )?;
        graph.add(
            ResourceKeys::LOAD_BALANCER,
            ResourceRequest::LoadBalancer {
                network: ResourceKeys::NETWORK.into(),
                subnets: network
                    .subnets_of(SubnetKind::Public)
                    .map(|s| s.cidr)
                    .collect(),
            },
        )?;
        graph.add(
            ResourceKeys::LISTENER,
            ResourceRequest::Listener {
                load_balancer: ResourceKeys::LOAD_BALANCER.into(),
                port: listener.port,
                ingress: listener.ingress.clone(),
            },
        )?;
        graph.add(
            ResourceKeys::TARGET,
            ResourceRequest::TargetAttachment {
                listener: ResourceKeys::LISTENER.into(),
                service: ResourceKeys::SERVICE.into(),
                target_port: listener.target_port,
                health_check: listener.health_check.clone(),
            },
        )?;

        Ok(Self {
            name: config.name.clone(),
            network,
            workload,
            service,
            execution_policy,
            build_policy,
            listener,
            graph,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_backend::ResourceKind;
    use stratus_common::Error;

    fn config() -> DeploymentConfig {
        serde_json::from_value(serde_json::json!({
            "account_id": "123456789012",
            "image_repository": "registry.local/web",
            "network_cidr": "10.1.0.0/16",
            "zone_count": 3,
            "listener_ingress": ["0.0.0.0/0"],
            "source_repository": "git.local/acme/web",
            "source_credential": "secret://git-token"
        }))
        .unwrap()
    }

    #[test]
    fn test_compose_declares_every_resource() {
        let bp = Blueprint::compose(&config()).unwrap();
        assert_eq!(bp.graph.len(), 11);
        assert_eq!(bp.network.subnets_of(SubnetKind::Public).count(), 3);
        assert_eq!(bp.network.subnets_of(SubnetKind::Private).count(), 3);
        assert_eq!(bp.network.gateways().len(), 1);

        let order: Vec<&str> = bp
            .graph
            .creation_order()
            .iter()
            .map(|n| n.key.as_str())
            .collect();
        let pos = |k: &str| order.iter().position(|o| *o == k).unwrap();
        assert!(pos(ResourceKeys::NETWORK) < pos(ResourceKeys::CLUSTER));
        assert!(pos(ResourceKeys::EXECUTION_IDENTITY) < pos(ResourceKeys::WORKLOAD));
        assert!(pos(ResourceKeys::WORKLOAD) < pos(ResourceKeys::SERVICE));
        assert!(pos(ResourceKeys::SERVICE) < pos(ResourceKeys::TARGET));
        assert!(pos(ResourceKeys::LISTENER) < pos(ResourceKeys::TARGET));
    }

    #[test]
    fn test_load_balancer_sits_in_public_subnets() {
        let bp = Blueprint::compose(&config()).unwrap();
        let node = bp.graph.get(ResourceKeys::LOAD_BALANCER).unwrap();
        assert_eq!(node.kind(), ResourceKind::LoadBalancer);
        match &node.request {
            ResourceRequest::LoadBalancer { subnets, .. } => {
                let expected: Vec<Cidr> = ["10.1.0.0/24", "10.1.1.0/24", "10.1.2.0/24"]
                    .iter()
                    .map(|s| s.parse().unwrap())
                    .collect();
                assert_eq!(subnets, &expected);
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn test_invalid_config_composes_nothing() {
        let mut cfg = config();
        cfg.memory_mib = 3;
        assert!(matches!(
            Blueprint::compose(&cfg),
            Err(Error::InvalidResourceShape { .. })
        ));
    }

    #[test]
    fn test_workload_revision_keys() {
        assert_eq!(ResourceKeys::workload_revision(1), "workload");
        assert_eq!(ResourceKeys::workload_revision(3), "workload-r3");
    }
}
