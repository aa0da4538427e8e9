use std::collections::HashSet;
use std::fmt::Write;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;

use stratus_backend::{HealthCheck, ReplicaId, ReplicaInfo, ReplicaStatus};
use stratus_common::util::now_ms;
use stratus_common::Cidr;

pub mod strategy;
pub mod sync;

use strategy::{Candidate, RoundRobin, RoutingStrategy};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BalancerError {
    #[error("listener on port {0} already exists")]
    ListenerExists(u16),
    #[error("listener on port {0} needs an explicit ingress list")]
    ImplicitIngress(u16),
    #[error("no listener on port {0}")]
    UnknownListener(u16),
    #[error("listener on port {port} already targets service {service}")]
    TargetAttached { port: u16, service: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("no listener on port {0}")]
    NoListener(u16),
    #[error("{client} is outside the listener's ingress ranges")]
    Forbidden { client: IpAddr },
    #[error("listener on port {0} has no target")]
    NoTarget(u16),
    #[error("no healthy replica for service {0}")]
    NoHealthyTarget(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetGroup {
    pub service: String,
    pub target_port: u16,
    pub health_check: HealthCheck,
}

#[derive(Debug, Clone, Serialize)]
pub struct Listener {
    pub port: u16,
    pub ingress: Vec<Cidr>,
    pub target: Option<TargetGroup>,
}

impl Listener {
    pub fn admits(&self, client: IpAddr) -> bool {
        match client {
            IpAddr::V4(v4) => self.ingress.iter().any(|c| c.contains(v4)),
            IpAddr::V6(_) => false,
        }
    }
}

/// Where one request was sent. Hand it back to `finish` when the request ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Routed {
    pub service: String,
    pub replica_id: ReplicaId,
    pub address: SocketAddr,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub open_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            open_ms: 30_000,
        }
    }
}

impl CircuitConfig {
    /// Defaults, overridden by `STRATUS_ROUTE_CIRCUIT_FAILURE_THRESHOLD` and
    /// `STRATUS_ROUTE_CIRCUIT_OPEN_MS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            failure_threshold: std::env::var("STRATUS_ROUTE_CIRCUIT_FAILURE_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.failure_threshold),
            open_ms: std::env::var("STRATUS_ROUTE_CIRCUIT_OPEN_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.open_ms),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct CircuitState {
    consecutive_failures: u32,
    open_until_ms: u64,
}

#[derive(Debug, Default)]
struct Counters {
    routed_total: AtomicU64,
    forbidden_total: AtomicU64,
    no_healthy_total: AtomicU64,
    circuit_skipped_total: AtomicU64,
    circuit_open_total: AtomicU64,
}

/// Public entry point for a service. Only replicas currently reporting
/// healthy receive traffic.
pub struct LoadBalancer {
    listeners: DashMap<u16, Listener>,
    replicas: DashMap<(String, ReplicaId), ReplicaInfo>,
    outstanding: DashMap<(String, ReplicaId), u64>,
    circuit: DashMap<(String, ReplicaId), CircuitState>,
    circuit_config: CircuitConfig,
    strategy: Box<dyn RoutingStrategy>,
    counters: Counters,
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("strategy", &self.strategy.name())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl LoadBalancer {
    pub fn new() -> Arc<Self> {
        Self::with_strategy(Box::new(RoundRobin::default()), CircuitConfig::from_env())
    }

    pub fn with_strategy(strategy: Box<dyn RoutingStrategy>, circuit: CircuitConfig) -> Arc<Self> {
        tracing::info!(strategy = strategy.name(), "load balancer initialized");
        Arc::new(Self {
            listeners: DashMap::new(),
            replicas: DashMap::new(),
            outstanding: DashMap::new(),
            circuit: DashMap::new(),
            circuit_config: circuit,
            strategy,
            counters: Counters::default(),
        })
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Open a listener. Every accepted address range is listed explicitly;
    /// `0.0.0.0/0` has to be spelled out to accept everyone.
    pub fn attach_listener(&self, port: u16, ingress: Vec<Cidr>) -> Result<(), BalancerError> {
        if ingress.is_empty() {
            return Err(BalancerError::ImplicitIngress(port));
        }
        match self.listeners.entry(port) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(BalancerError::ListenerExists(port)),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                let open_to_all = ingress.iter().any(Cidr::is_any);
                tracing::info!(port, ?ingress, open_to_all, "listener attached");
                v.insert(Listener {
                    port,
                    ingress,
                    target: None,
                });
                Ok(())
            }
        }
    }

    pub fn add_target(
        &self,
        port: u16,
        service: &str,
        target_port: u16,
        health_check: HealthCheck,
    ) -> Result<(), BalancerError> {
        let mut listener = self
            .listeners
            .get_mut(&port)
            .ok_or(BalancerError::UnknownListener(port))?;
        if let Some(existing) = &listener.target {
            return Err(BalancerError::TargetAttached {
                port,
                service: existing.service.clone(),
            });
        }
        listener.target = Some(TargetGroup {
            service: service.to_string(),
            target_port,
            health_check,
        });
        tracing::info!(port, %service, target_port, "target added");
        Ok(())
    }

    pub fn listeners(&self) -> Vec<Listener> {
        let mut out: Vec<Listener> = self.listeners.iter().map(|l| l.value().clone()).collect();
        out.sort_by_key(|l| l.port);
        out
    }

    pub fn upsert_replica(&self, info: ReplicaInfo) {
        self.replicas
            .insert((info.service.clone(), info.replica_id), info);
    }

    pub fn remove_replica(&self, service: &str, replica_id: ReplicaId) {
        let key = (service.to_string(), replica_id);
        self.replicas.remove(&key);
        self.outstanding.remove(&key);
        self.circuit.remove(&key);
    }

    /// Swap in a full snapshot of `service`'s replicas. Routing state kept
    /// for replicas missing from the snapshot is dropped.
    pub fn replace_replicas(&self, service: &str, infos: Vec<ReplicaInfo>) {
        let keep: HashSet<ReplicaId> = infos.iter().map(|r| r.replica_id).collect();
        let current = |(s, id): &(String, ReplicaId)| s != service || keep.contains(id);
        self.replicas.retain(|(s, _), _| s != service);
        self.outstanding.retain(|key, _| current(key));
        self.circuit.retain(|key, _| current(key));
        for info in infos {
            self.upsert_replica(info);
        }
    }

    pub fn healthy_replicas(&self, service: &str) -> Vec<ReplicaInfo> {
        let mut out: Vec<ReplicaInfo> = self
            .replicas
            .iter()
            .filter(|e| e.key().0 == service && e.value().status == ReplicaStatus::Healthy)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|r| r.replica_id);
        out
    }

    fn is_circuit_open(&self, key: &(String, ReplicaId)) -> bool {
        let now = now_ms();
        if let Some(entry) = self.circuit.get(key) {
            let open = entry.open_until_ms > now;
            if !open && entry.consecutive_failures == 0 {
                drop(entry);
                self.circuit.remove(key);
            }
            return open;
        }
        false
    }

    /// Pick a healthy replica for a request from `client` on `port`.
    pub fn route(&self, port: u16, client: IpAddr) -> Result<Routed, RouteError> {
        let (service, target_port) = {
            let listener = self.listeners.get(&port).ok_or(RouteError::NoListener(port))?;
            if !listener.admits(client) {
                self.counters.forbidden_total.fetch_add(1, Ordering::Relaxed);
                return Err(RouteError::Forbidden { client });
            }
            let target = listener.target.as_ref().ok_or(RouteError::NoTarget(port))?;
            (target.service.clone(), target.target_port)
        };

        let healthy: Vec<ReplicaInfo> = self
            .healthy_replicas(&service)
            .into_iter()
            .filter(|r| {
                let open = self.is_circuit_open(&(service.clone(), r.replica_id));
                if open {
                    self.counters
                        .circuit_skipped_total
                        .fetch_add(1, Ordering::Relaxed);
                }
                !open
            })
            .collect();

        let outstanding: Vec<u64> = healthy
            .iter()
            .map(|r| {
                self.outstanding
                    .get(&(service.clone(), r.replica_id))
                    .map(|v| *v)
                    .unwrap_or(0)
            })
            .collect();
        let candidates: Vec<Candidate> = healthy
            .iter()
            .zip(&outstanding)
            .map(|(replica, &outstanding)| Candidate {
                replica,
                outstanding,
            })
            .collect();

        let Some(selected) = self.strategy.select(&candidates).map(|i| &healthy[i]) else {
            self.counters.no_healthy_total.fetch_add(1, Ordering::Relaxed);
            return Err(RouteError::NoHealthyTarget(service));
        };

        *self
            .outstanding
            .entry((service.clone(), selected.replica_id))
            .or_insert(0) += 1;
        self.counters.routed_total.fetch_add(1, Ordering::Relaxed);
        Ok(Routed {
            service,
            replica_id: selected.replica_id,
            address: SocketAddr::new(selected.address.ip(), target_port),
        })
    }

    /// Report how a routed request ended. Consecutive failures open the
    /// replica's circuit for a while.
    pub fn finish(&self, routed: &Routed, ok: bool) {
        let key = (routed.service.clone(), routed.replica_id);
        if let Some(mut n) = self.outstanding.get_mut(&key) {
            *n = n.saturating_sub(1);
        }
        if ok {
            self.circuit.remove(&key);
            return;
        }

        let now = now_ms();
        let mut entry = self
            .circuit
            .entry(key)
            .or_insert_with(CircuitState::default);
        if entry.open_until_ms > now {
            return;
        }
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        if entry.consecutive_failures >= self.circuit_config.failure_threshold {
            entry.consecutive_failures = 0;
            entry.open_until_ms = now.saturating_add(self.circuit_config.open_ms);
            self.counters
                .circuit_open_total
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                service = %routed.service,
                replica_id = routed.replica_id,
                open_ms = self.circuit_config.open_ms,
                "replica circuit opened"
            );
        }
    }

    pub fn render_metrics(&self, out: &mut String) {
        let c = &self.counters;
        let rows: [(&str, &str, &AtomicU64); 5] = [
            ("stratus_lb_routed_total", "Requests routed to a replica.", &c.routed_total),
            ("stratus_lb_forbidden_total", "Requests refused by listener ingress.", &c.forbidden_total),
            ("stratus_lb_no_healthy_total", "Requests with no healthy replica.", &c.no_healthy_total),
            ("stratus_lb_circuit_skipped_total", "Replicas skipped with an open circuit.", &c.circuit_skipped_total),
            ("stratus_lb_circuit_open_total", "Replica circuits opened.", &c.circuit_open_total),
        ];
        for (name, help, value) in rows {
            let _ = write!(
                out,
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {}\n",
                value.load(Ordering::Relaxed)
            );
        }
    }
}
