use std::fmt;
use std::net::SocketAddr;
use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use stratus_common::{
    AccessPolicy, Cidr, Gateway, LogDestination, NetworkTopology, ServiceSpec, WorkloadDefinition,
    WorkloadRef,
};

pub type ReplicaId = u64;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Worth retrying: throttling, eventual consistency, timeouts.
    #[error("transient backend error: {0}")]
    Transient(String),
    /// The backend refused the request; retrying will not help.
    #[error("backend rejected request: {0}")]
    Rejected(String),
    #[error("{0} not found")]
    NotFound(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Network,
    Gateway,
    Cluster,
    Identity,
    LogGroup,
    Workload,
    Service,
    LoadBalancer,
    Listener,
    TargetAttachment,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Network => "network",
            ResourceKind::Gateway => "gateway",
            ResourceKind::Cluster => "cluster",
            ResourceKind::Identity => "identity",
            ResourceKind::LogGroup => "log_group",
            ResourceKind::Workload => "workload",
            ResourceKind::Service => "service",
            ResourceKind::LoadBalancer => "load_balancer",
            ResourceKind::Listener => "listener",
            ResourceKind::TargetAttachment => "target_attachment",
        };
        f.write_str(s)
    }
}

/// Target health checking, performed by the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthCheck {
    pub path: String,
    pub interval_ms: u64,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            interval_ms: 30_000,
            healthy_threshold: 5,
            unhealthy_threshold: 2,
        }
    }
}

/// Declarative creation request. String fields naming other resources are
/// the logical keys of resources that must exist first.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceRequest {
    Network {
        topology: NetworkTopology,
    },
    Gateway {
        network: String,
        gateway: Gateway,
    },
    Cluster {
        network: String,
    },
    Identity {
        policy: AccessPolicy,
    },
    LogGroup {
        destination: LogDestination,
    },
    Workload {
        definition: WorkloadDefinition,
        execution_identity: String,
        log_group: String,
    },
    Service {
        cluster: String,
        workload: String,
        spec: ServiceSpec,
    },
    LoadBalancer {
        network: String,
        subnets: Vec<Cidr>,
    },
    Listener {
        load_balancer: String,
        port: u16,
        ingress: Vec<Cidr>,
    },
    TargetAttachment {
        listener: String,
        service: String,
        target_port: u16,
        health_check: HealthCheck,
    },
}

impl ResourceRequest {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceRequest::Network { .. } => ResourceKind::Network,
            ResourceRequest::Gateway { .. } => ResourceKind::Gateway,
            ResourceRequest::Cluster { .. } => ResourceKind::Cluster,
            ResourceRequest::Identity { .. } => ResourceKind::Identity,
            ResourceRequest::LogGroup { .. } => ResourceKind::LogGroup,
            ResourceRequest::Workload { .. } => ResourceKind::Workload,
            ResourceRequest::Service { .. } => ResourceKind::Service,
            ResourceRequest::LoadBalancer { .. } => ResourceKind::LoadBalancer,
            ResourceRequest::Listener { .. } => ResourceKind::Listener,
            ResourceRequest::TargetAttachment { .. } => ResourceKind::TargetAttachment,
        }
    }

    /// Keys of the resources this request depends on.
    pub fn references(&self) -> Vec<&str> {
        match self {
            ResourceRequest::Network { .. }
            | ResourceRequest::Identity { .. }
            | ResourceRequest::LogGroup { .. } => vec![],
            ResourceRequest::Gateway { network, .. }
            | ResourceRequest::Cluster { network }
            | ResourceRequest::LoadBalancer { network, .. } => vec![network.as_str()],
            ResourceRequest::Workload {
                execution_identity,
                log_group,
                ..
            } => vec![execution_identity.as_str(), log_group.as_str()],
            ResourceRequest::Service {
                cluster, workload, ..
            } => vec![cluster.as_str(), workload.as_str()],
            ResourceRequest::Listener { load_balancer, .. } => vec![load_balancer.as_str()],
            ResourceRequest::TargetAttachment {
                listener, service, ..
            } => vec![listener.as_str(), service.as_str()],
        }
    }
}

/// A live resource returned by the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceHandle {
    /// Logical key within the deployment.
    pub key: String,
    /// Identifier assigned by the backend.
    pub id: String,
    pub kind: ResourceKind,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaStatus {
    Starting,
    Healthy,
    Unhealthy,
    Draining,
}

/// One running instance of a service's workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicaInfo {
    pub service: String,
    pub replica_id: ReplicaId,
    pub workload: WorkloadRef,
    pub zone: String,
    pub address: SocketAddr,
    pub status: ReplicaStatus,
    pub last_heartbeat_ms: u64,
}

/// Replica change. `replica` is `None` once the replica is gone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicaEvent {
    pub service: String,
    pub replica_id: ReplicaId,
    pub replica: Option<ReplicaInfo>,
    pub revision: u64,
}

pub type ReplicaStream = Pin<Box<dyn Stream<Item = ReplicaEvent> + Send>>;

/// The provisioning backend: creates declared resources and runs replicas.
/// Retries and eventual consistency are the backend's business; callers only
/// see `BackendError::Transient` when trying again may help.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn create(
        &self,
        key: &str,
        request: &ResourceRequest,
    ) -> Result<ResourceHandle, BackendError>;

    async fn delete(&self, handle: &ResourceHandle) -> Result<(), BackendError>;

    async fn start_replica(
        &self,
        service: &str,
        workload: &WorkloadRef,
    ) -> Result<ReplicaInfo, BackendError>;

    async fn stop_replica(&self, service: &str, replica_id: ReplicaId) -> Result<(), BackendError>;

    async fn list_replicas(&self, service: &str) -> Result<Vec<ReplicaInfo>, BackendError>;

    /// Replica changes after `start_revision_exclusive`, or from now if `None`.
    async fn watch_replicas(
        &self,
        start_revision_exclusive: Option<u64>,
    ) -> Result<ReplicaStream, BackendError>;
}
