use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_stream::StreamExt;

use stratus_common::util::now_ms;
use stratus_common::{Cidr, SubnetKind, WorkloadDefinition, WorkloadRef};

use crate::types::{
    Backend, BackendError, ReplicaEvent, ReplicaId, ReplicaInfo, ReplicaStatus, ReplicaStream,
    ResourceHandle, ResourceKind, ResourceRequest,
};

/// Everything the in-process backend was asked to do, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Create { key: String },
    Delete { key: String },
    StartReplica { service: String, replica_id: ReplicaId, workload: WorkloadRef },
    StopReplica { service: String, replica_id: ReplicaId },
    SetStatus { service: String, replica_id: ReplicaId, status: ReplicaStatus },
}

/// In-process provisioning backend. Resources are records; replicas report
/// healthy as soon as they start unless manual health is enabled or their
/// workload has been marked failing.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    inner: Arc<RwLock<Inner>>,
    tx: broadcast::Sender<ReplicaEvent>,
}

#[derive(Debug)]
struct StoredResource {
    handle: ResourceHandle,
    references: Vec<String>,
    service: Option<String>,
    workload: Option<WorkloadRef>,
}

#[derive(Debug, Default)]
struct Inner {
    revision: u64,
    next_id: u64,
    resources: BTreeMap<String, StoredResource>,
    workloads: HashMap<WorkloadRef, WorkloadDefinition>,
    services: HashSet<String>,
    private_subnets: Vec<(String, Cidr)>,
    replicas: BTreeMap<(String, ReplicaId), ReplicaInfo>,
    /// Per-key queue of injected outcomes; `None` lets one call through.
    faults: HashMap<String, VecDeque<Option<BackendError>>>,
    failing_workloads: HashSet<WorkloadRef>,
    manual_health: bool,
    floors: HashMap<String, u32>,
    ops: Vec<Operation>,
}

impl Inner {
    fn next_revision(&mut self) -> u64 {
        self.revision = self.revision.saturating_add(1);
        self.revision
    }

    fn healthy_count(&self, service: &str) -> u32 {
        self.replicas
            .values()
            .filter(|r| r.service == service && r.status == ReplicaStatus::Healthy)
            .count() as u32
    }

    fn observe_floor(&mut self, service: &str) {
        let healthy = self.healthy_count(service);
        if let Some(floor) = self.floors.get_mut(service) {
            *floor = (*floor).min(healthy);
        }
    }

    fn take_fault(&mut self, key: &str) -> Option<BackendError> {
        self.faults.get_mut(key).and_then(|q| q.pop_front()).flatten()
    }

    fn event(&mut self, service: &str, replica_id: ReplicaId) -> ReplicaEvent {
        let revision = self.next_revision();
        ReplicaEvent {
            service: service.to_string(),
            replica_id,
            replica: self.replicas.get(&(service.to_string(), replica_id)).cloned(),
            revision,
        }
    }

    fn replica_address(&self, seq: u64, port: u16) -> (String, SocketAddr) {
        if self.private_subnets.is_empty() {
            return (
                "local".to_string(),
                SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            );
        }
        let (zone, cidr) = &self.private_subnets[(seq as usize) % self.private_subnets.len()];
        let host_room = cidr.subnet_capacity(32).saturating_sub(8).max(1);
        let host = 4 + (seq / self.private_subnets.len() as u64) as u32 % host_room;
        let ip = Ipv4Addr::from(u32::from(cidr.network()).wrapping_add(host));
        (zone.clone(), SocketAddr::new(IpAddr::V4(ip), port))
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            tx,
        }
    }

    /// Replicas stay `Starting` until `set_status` is called.
    pub fn with_manual_health() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self {
            inner: Arc::new(RwLock::new(Inner {
                manual_health: true,
                ..Inner::default()
            })),
            tx,
        }
    }

    fn emit(&self, events: Vec<ReplicaEvent>) {
        for event in events {
            let _ = self.tx.send(event);
        }
    }

    /// The next `create` of `key` (or `start_replica` of service `key`) fails with `err`.
    pub async fn fail_next(&self, key: &str, err: BackendError) {
        self.inner
            .write()
            .await
            .faults
            .entry(key.to_string())
            .or_default()
            .push_back(Some(err));
    }

    /// The next call for `key` succeeds; queued failures move back by one.
    pub async fn allow_next(&self, key: &str) {
        self.inner
            .write()
            .await
            .faults
            .entry(key.to_string())
            .or_default()
            .push_back(None);
    }

    /// Replicas of `workload` report unhealthy.
    pub async fn fail_workload(&self, workload: WorkloadRef) {
        self.inner.write().await.failing_workloads.insert(workload);
    }

    pub async fn set_status(
        &self,
        service: &str,
        replica_id: ReplicaId,
        status: ReplicaStatus,
    ) -> Result<(), BackendError> {
        let event = {
            let mut inner = self.inner.write().await;
            let replica = inner
                .replicas
                .get_mut(&(service.to_string(), replica_id))
                .ok_or_else(|| BackendError::NotFound(format!("replica {service}/{replica_id}")))?;
            replica.status = status;
            replica.last_heartbeat_ms = now_ms();
            inner.ops.push(Operation::SetStatus {
                service: service.to_string(),
                replica_id,
                status,
            });
            inner.observe_floor(service);
            inner.event(service, replica_id)
        };
        self.emit(vec![event]);
        Ok(())
    }

    /// Start recording the lowest healthy replica count seen for `service`.
    pub async fn track_healthy_floor(&self, service: &str) {
        let mut inner = self.inner.write().await;
        let healthy = inner.healthy_count(service);
        inner.floors.insert(service.to_string(), healthy);
    }

    pub async fn healthy_floor(&self, service: &str) -> Option<u32> {
        self.inner.read().await.floors.get(service).copied()
    }

    pub async fn healthy_count(&self, service: &str) -> u32 {
        self.inner.read().await.healthy_count(service)
    }

    pub async fn operations(&self) -> Vec<Operation> {
        self.inner.read().await.ops.clone()
    }

    pub async fn resources(&self) -> Vec<ResourceHandle> {
        self.inner
            .read()
            .await
            .resources
            .values()
            .map(|r| r.handle.clone())
            .collect()
    }

    pub async fn workloads(&self) -> Vec<WorkloadDefinition> {
        self.inner.read().await.workloads.values().cloned().collect()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Backend for MemoryBackend {
    async fn create(
        &self,
        key: &str,
        request: &ResourceRequest,
    ) -> Result<ResourceHandle, BackendError> {
        let mut inner = self.inner.write().await;

        if let Some(err) = inner.take_fault(key) {
            return Err(err);
        }
        if inner.resources.contains_key(key) {
            return Err(BackendError::Rejected(format!("{key} already exists")));
        }
        let references: Vec<String> = request.references().into_iter().map(String::from).collect();
        if let Some(missing) = references.iter().find(|r| !inner.resources.contains_key(*r)) {
            return Err(BackendError::Rejected(format!(
                "{key} references {missing}, which does not exist"
            )));
        }

        let mut service = None;
        let mut workload = None;
        match request {
            ResourceRequest::Network { topology } => {
                inner.private_subnets = topology
                    .subnets_of(SubnetKind::Private)
                    .map(|s| (s.zone.clone(), s.cidr))
                    .collect();
            }
            ResourceRequest::Workload { definition, .. } => {
                inner
                    .workloads
                    .insert(definition.reference(), definition.clone());
                workload = Some(definition.reference());
            }
            ResourceRequest::Service { spec, .. } => {
                inner.services.insert(spec.name.clone());
                service = Some(spec.name.clone());
            }
            _ => {}
        }

        inner.next_id += 1;
        let handle = ResourceHandle {
            key: key.to_string(),
            id: format!("{}-{:04}", request.kind(), inner.next_id),
            kind: request.kind(),
        };
        inner.resources.insert(
            key.to_string(),
            StoredResource {
                handle: handle.clone(),
                references,
                service,
                workload,
            },
        );
        inner.ops.push(Operation::Create {
            key: key.to_string(),
        });
        tracing::debug!(%key, id=%handle.id, kind=%handle.kind, "memory backend: created");
        Ok(handle)
    }

    async fn delete(&self, handle: &ResourceHandle) -> Result<(), BackendError> {
        let events = {
            let mut inner = self.inner.write().await;
            if let Some(dependent) = inner
                .resources
                .values()
                .find(|r| r.references.iter().any(|k| k == &handle.key))
            {
                return Err(BackendError::Rejected(format!(
                    "{} is still referenced by {}",
                    handle.key, dependent.handle.key
                )));
            }
            let live = inner.resources.get(&handle.key).and_then(|r| {
                let workload = r.workload.as_ref()?;
                inner.replicas.values().find(|rep| &rep.workload == workload)
            });
            if let Some(replica) = live {
                return Err(BackendError::Rejected(format!(
                    "{} is still running as replica {}/{}",
                    handle.key, replica.service, replica.replica_id
                )));
            }

            let mut events = Vec::new();
            let Some(removed) = inner.resources.remove(&handle.key) else {
                return Err(BackendError::NotFound(handle.key.clone()));
            };
            inner.ops.push(Operation::Delete {
                key: handle.key.clone(),
            });
            tracing::debug!(key=%handle.key, id=%handle.id, "memory backend: deleted");
            if removed.handle.kind == ResourceKind::Network {
                inner.private_subnets.clear();
            }
            if let Some(workload) = &removed.workload {
                inner.workloads.remove(workload);
            }
            if let Some(name) = removed.service {
                inner.services.remove(&name);
                let ids: Vec<ReplicaId> = inner
                    .replicas
                    .keys()
                    .filter(|(s, _)| *s == name)
                    .map(|(_, id)| *id)
                    .collect();
                for id in ids {
                    inner.replicas.remove(&(name.clone(), id));
                    inner.ops.push(Operation::StopReplica {
                        service: name.clone(),
                        replica_id: id,
                    });
                    events.push(inner.event(&name, id));
                }
            }
            events
        };
        self.emit(events);
        Ok(())
    }

    async fn start_replica(
        &self,
        service: &str,
        workload: &WorkloadRef,
    ) -> Result<ReplicaInfo, BackendError> {
        let (info, event) = {
            let mut inner = self.inner.write().await;
            if let Some(err) = inner.take_fault(service) {
                return Err(err);
            }
            if !inner.services.contains(service) {
                return Err(BackendError::NotFound(format!("service {service}")));
            }
            let port = inner
                .workloads
                .get(workload)
                .map(|d| d.primary().port)
                .ok_or_else(|| {
                    BackendError::Rejected(format!("workload {workload} is not registered"))
                })?;

            inner.next_id += 1;
            let replica_id = inner.next_id;
            let (zone, address) = inner.replica_address(replica_id, port);
            let status = if inner.manual_health {
                ReplicaStatus::Starting
            } else if inner.failing_workloads.contains(workload) {
                ReplicaStatus::Unhealthy
            } else {
                ReplicaStatus::Healthy
            };
            let info = ReplicaInfo {
                service: service.to_string(),
                replica_id,
                workload: workload.clone(),
                zone,
                address,
                status,
                last_heartbeat_ms: now_ms(),
            };
            inner
                .replicas
                .insert((service.to_string(), replica_id), info.clone());
            inner.ops.push(Operation::StartReplica {
                service: service.to_string(),
                replica_id,
                workload: workload.clone(),
            });
            inner.observe_floor(service);
            let event = inner.event(service, replica_id);
            (info, event)
        };
        self.emit(vec![event]);
        Ok(info)
    }

    async fn stop_replica(&self, service: &str, replica_id: ReplicaId) -> Result<(), BackendError> {
        let event = {
            let mut inner = self.inner.write().await;
            if inner
                .replicas
                .remove(&(service.to_string(), replica_id))
                .is_none()
            {
                return Err(BackendError::NotFound(format!("replica {service}/{replica_id}")));
            }
            inner.ops.push(Operation::StopReplica {
                service: service.to_string(),
                replica_id,
            });
            inner.observe_floor(service);
            inner.event(service, replica_id)
        };
        self.emit(vec![event]);
        Ok(())
    }

    async fn list_replicas(&self, service: &str) -> Result<Vec<ReplicaInfo>, BackendError> {
        let inner = self.inner.read().await;
        Ok(inner
            .replicas
            .values()
            .filter(|r| r.service == service)
            .cloned()
            .collect())
    }

    async fn watch_replicas(
        &self,
        start_revision_exclusive: Option<u64>,
    ) -> Result<ReplicaStream, BackendError> {
        let min_rev = start_revision_exclusive.unwrap_or(0);
        let rx = self.tx.subscribe();
        // A lagged subscriber has missed events; ending the stream makes the
        // consumer resubscribe and relist.
        let stream = BroadcastStream::new(rx)
            .map_while(|msg| match msg {
                Ok(ev) => Some(ev),
                Err(BroadcastStreamRecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "memory backend: replica watcher lagged, closing stream");
                    None
                }
            })
            .filter(move |ev| ev.revision > min_rev);
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_common::{
        ContainerSpec, ImageRef, LogDestination, NetworkTopology, ReplicaBounds, RolloutPolicy,
        ScalingPolicy, ServiceSpec,
    };

    fn workload() -> WorkloadDefinition {
        let c = ContainerSpec::new(
            "web",
            ImageRef::new("registry.local/web", "v1"),
            5000,
            LogDestination {
                group: "/stratus/web".into(),
                stream_prefix: "web".into(),
            },
        );
        WorkloadDefinition::define("web", 1, 256, 512, vec![c]).unwrap()
    }

    fn service_spec() -> ServiceSpec {
        ServiceSpec {
            name: "web".into(),
            desired_count: 1,
            scaling: ScalingPolicy {
                bounds: ReplicaBounds { min: 1, max: 2 },
                target_cpu_percent: 50.0,
                scale_in_margin_percent: 10.0,
                evaluation_periods: 1,
                step: 1,
                scale_out_cooldown_ms: 0,
                scale_in_cooldown_ms: 0,
            },
            rollout: RolloutPolicy::default(),
            security_rules: vec![],
            assign_public_ip: false,
        }
    }

    async fn seed(backend: &MemoryBackend) -> Vec<ResourceHandle> {
        let zones = vec!["zone-a".to_string(), "zone-b".to_string()];
        let topology = NetworkTopology::plan("10.1.0.0/16".parse().unwrap(), &zones, 24).unwrap();
        let mut handles = Vec::new();
        let requests = vec![
            ("network", ResourceRequest::Network { topology }),
            (
                "cluster",
                ResourceRequest::Cluster {
                    network: "network".into(),
                },
            ),
            (
                "identity",
                ResourceRequest::Identity {
                    policy: stratus_common::AccessPolicy::execution("registry.local/web"),
                },
            ),
            (
                "logs",
                ResourceRequest::LogGroup {
                    destination: workload().primary().log.clone(),
                },
            ),
            (
                "workload",
                ResourceRequest::Workload {
                    definition: workload(),
                    execution_identity: "identity".into(),
                    log_group: "logs".into(),
                },
            ),
        ];
        for (key, req) in requests {
            handles.push(backend.create(key, &req).await.unwrap());
        }
        handles
    }

    #[tokio::test]
    async fn test_rejects_dangling_reference() {
        let backend = MemoryBackend::new();
        let err = backend
            .create(
                "cluster",
                &ResourceRequest::Cluster {
                    network: "network".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_delete_refuses_referenced_resource() {
        let backend = MemoryBackend::new();
        let handles = seed(&backend).await;
        let identity = &handles[2];
        assert!(matches!(
            backend.delete(identity).await,
            Err(BackendError::Rejected(_))
        ));
        backend.delete(&handles[4]).await.unwrap();
        backend.delete(identity).await.unwrap();
    }

    #[tokio::test]
    async fn test_injected_fault_is_consumed_once() {
        let backend = MemoryBackend::new();
        backend
            .fail_next("logs", BackendError::Transient("throttled".into()))
            .await;
        let req = ResourceRequest::LogGroup {
            destination: workload().primary().log.clone(),
        };
        assert!(backend.create("logs", &req).await.is_err());
        assert!(backend.create("logs", &req).await.is_ok());
    }

    #[tokio::test]
    async fn test_replica_events_and_floor() {
        let backend = MemoryBackend::with_manual_health();
        seed(&backend).await;
        backend
            .create(
                "web",
                &ResourceRequest::Service {
                    cluster: "cluster".into(),
                    workload: "workload".into(),
                    spec: service_spec(),
                },
            )
            .await
            .unwrap();

        let mut events = backend.watch_replicas(None).await.unwrap();
        let r = backend
            .start_replica("web", &workload().reference())
            .await
            .unwrap();
        assert_eq!(r.status, ReplicaStatus::Starting);
        assert_eq!(r.address.port(), 5000);
        assert!("10.1.2.0/23".parse::<Cidr>().unwrap().contains(match r.address.ip() {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(_) => unreachable!(),
        }));

        backend
            .set_status("web", r.replica_id, ReplicaStatus::Healthy)
            .await
            .unwrap();
        backend.track_healthy_floor("web").await;
        backend.stop_replica("web", r.replica_id).await.unwrap();

        assert_eq!(backend.healthy_floor("web").await, Some(0));

        let first = events.next().await.unwrap();
        assert_eq!(first.replica.unwrap().status, ReplicaStatus::Starting);
        let second = events.next().await.unwrap();
        assert_eq!(second.replica.unwrap().status, ReplicaStatus::Healthy);
        let third = events.next().await.unwrap();
        assert!(third.replica.is_none());
    }

    #[tokio::test]
    async fn test_delete_refuses_running_workload() {
        let backend = MemoryBackend::new();
        seed(&backend).await;
        backend
            .create(
                "service",
                &ResourceRequest::Service {
                    cluster: "cluster".into(),
                    workload: "workload".into(),
                    spec: service_spec(),
                },
            )
            .await
            .unwrap();
        let v2 = workload()
            .with_image(ImageRef::new("registry.local/web", "v2"))
            .unwrap();
        let r2 = backend
            .create(
                "workload-r2",
                &ResourceRequest::Workload {
                    definition: v2.clone(),
                    execution_identity: "identity".into(),
                    log_group: "logs".into(),
                },
            )
            .await
            .unwrap();
        let replica = backend.start_replica("web", &v2.reference()).await.unwrap();

        assert!(matches!(
            backend.delete(&r2).await,
            Err(BackendError::Rejected(_))
        ));

        backend.stop_replica("web", replica.replica_id).await.unwrap();
        backend.delete(&r2).await.unwrap();
        assert!(matches!(
            backend.start_replica("web", &v2.reference()).await,
            Err(BackendError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_lagged_watch_ends_stream() {
        let (tx, _rx) = broadcast::channel(2);
        let backend = MemoryBackend {
            inner: Arc::new(RwLock::new(Inner::default())),
            tx,
        };
        seed(&backend).await;
        backend
            .create(
                "service",
                &ResourceRequest::Service {
                    cluster: "cluster".into(),
                    workload: "workload".into(),
                    spec: service_spec(),
                },
            )
            .await
            .unwrap();

        let mut events = backend.watch_replicas(None).await.unwrap();
        for _ in 0..4 {
            backend
                .start_replica("web", &workload().reference())
                .await
                .unwrap();
        }
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn test_deleting_service_stops_its_replicas() {
        let backend = MemoryBackend::new();
        seed(&backend).await;
        let svc = backend
            .create(
                "service",
                &ResourceRequest::Service {
                    cluster: "cluster".into(),
                    workload: "workload".into(),
                    spec: service_spec(),
                },
            )
            .await
            .unwrap();
        backend
            .start_replica("web", &workload().reference())
            .await
            .unwrap();
        assert_eq!(backend.healthy_count("web").await, 1);

        backend.delete(&svc).await.unwrap();
        assert!(backend.list_replicas("web").await.unwrap().is_empty());
        assert!(matches!(
            backend.start_replica("web", &workload().reference()).await,
            Err(BackendError::NotFound(_))
        ));
    }
}
