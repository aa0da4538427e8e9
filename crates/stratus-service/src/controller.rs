use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{info, warn};

use stratus_backend::{Backend, BackendError, ReplicaId, ReplicaInfo, ReplicaStatus};
use stratus_common::util::now_ms;
use stratus_common::{Error, Result, ServiceRecord, ServiceSpec, WorkloadDefinition, WorkloadRef};

use crate::metrics::ServiceMetrics;

/// Owns one service's record. Scale actions and rolling replaces both take
/// `ops`, so they never interleave their replica changes.
pub struct ServiceController {
    backend: Arc<dyn Backend>,
    spec: ServiceSpec,
    ops: Mutex<()>,
    record: watch::Sender<ServiceRecord>,
    history: RwLock<BTreeMap<u32, WorkloadDefinition>>,
    metrics: Arc<ServiceMetrics>,
}

impl ServiceController {
    /// Validate the bounds and start the initial replicas. The service
    /// resource itself must already exist in the backend.
    pub async fn create(
        backend: Arc<dyn Backend>,
        cluster: &str,
        spec: ServiceSpec,
        workload: WorkloadDefinition,
        metrics: Arc<ServiceMetrics>,
    ) -> Result<Self> {
        spec.validate()?;

        let record = ServiceRecord {
            name: spec.name.clone(),
            cluster: cluster.to_string(),
            workload: workload.reference(),
            desired_count: spec.desired_count,
            bounds: spec.scaling.bounds,
            security_rules: spec.security_rules.clone(),
            assign_public_ip: spec.assign_public_ip,
            version: 1,
            updated_at_ms: now_ms(),
        };
        let (record, _) = watch::channel(record);
        let mut history = BTreeMap::new();
        history.insert(workload.revision(), workload.clone());

        let controller = Self {
            backend,
            spec,
            ops: Mutex::new(()),
            record,
            history: RwLock::new(history),
            metrics,
        };

        {
            let _guard = controller.ops.lock().await;
            controller
                .converge(&workload.reference(), controller.spec.desired_count)
                .await?;
        }
        controller
            .metrics
            .desired_replicas
            .store(u64::from(controller.spec.desired_count), Ordering::Relaxed);
        info!(
            service = %controller.spec.name,
            workload = %workload.reference(),
            desired = controller.spec.desired_count,
            "service created"
        );
        Ok(controller)
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &ServiceSpec {
        &self.spec
    }

    pub fn record(&self) -> ServiceRecord {
        self.record.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ServiceRecord> {
        self.record.subscribe()
    }

    /// True while a scale action or rollout holds the service.
    pub fn is_busy(&self) -> bool {
        self.ops.try_lock().is_err()
    }

    pub async fn current_workload(&self) -> Option<WorkloadDefinition> {
        let current = self.record.borrow().workload.revision;
        self.history.read().await.get(&current).cloned()
    }

    pub async fn workload_history(&self) -> Vec<WorkloadRef> {
        self.history.read().await.values().map(|d| d.reference()).collect()
    }

    pub async fn replicas(&self) -> Result<Vec<ReplicaInfo>> {
        self.backend
            .list_replicas(&self.spec.name)
            .await
            .map_err(|e| self.failure(e))
    }

    fn failure(&self, reason: impl ToString) -> Error {
        Error::provisioning(format!("service/{}", self.spec.name), reason)
    }

    fn check_bounds(&self, desired: u32) -> Result<()> {
        let bounds = self.spec.scaling.bounds;
        if bounds.contains(desired) {
            Ok(())
        } else {
            Err(Error::ReplicaBounds {
                service: self.spec.name.clone(),
                desired,
                min: bounds.min,
                max: bounds.max,
            })
        }
    }

    fn write_record(&self, f: impl FnOnce(&mut ServiceRecord)) {
        self.record.send_modify(|r| {
            f(r);
            r.version += 1;
            r.updated_at_ms = now_ms();
        });
    }

    /// Set the desired count, waiting for any rollout to finish first.
    /// Returns the previous desired count.
    pub async fn scale_to(&self, desired: u32) -> Result<u32> {
        self.check_bounds(desired)?;
        let _guard = self.ops.lock().await;
        self.scale_locked(desired).await
    }

    /// Like `scale_to`, but gives up with `None` if the service is busy.
    pub async fn try_scale_to(&self, desired: u32) -> Result<Option<u32>> {
        self.check_bounds(desired)?;
        let Ok(_guard) = self.ops.try_lock() else {
            return Ok(None);
        };
        self.scale_locked(desired).await.map(Some)
    }

    async fn scale_locked(&self, desired: u32) -> Result<u32> {
        let (workload, previous) = {
            let r = self.record.borrow();
            (r.workload.clone(), r.desired_count)
        };
        if desired == previous {
            return Ok(previous);
        }

        let started = self.converge(&workload, desired).await?;
        if !started.is_empty() {
            if let Err(reason) = self.await_healthy(&started).await {
                warn!(service = %self.spec.name, %reason, "scale-out replicas never became healthy");
                self.stop_all(&started).await;
                return Err(self.failure(reason));
            }
        }

        self.write_record(|r| r.desired_count = desired);
        self.metrics
            .desired_replicas
            .store(u64::from(desired), Ordering::Relaxed);
        info!(service = %self.spec.name, from = previous, to = desired, "desired count updated");
        Ok(previous)
    }

    /// Start or stop replicas of `workload` until `desired` are running.
    /// Returns the replicas started.
    async fn converge(&self, workload: &WorkloadRef, desired: u32) -> Result<Vec<ReplicaId>> {
        let mut running: Vec<ReplicaInfo> = self
            .replicas()
            .await?
            .into_iter()
            .filter(|r| &r.workload == workload)
            .collect();

        let mut started = Vec::new();
        while (running.len() as u32) + (started.len() as u32) < desired {
            let replica = self
                .backend
                .start_replica(&self.spec.name, workload)
                .await
                .map_err(|e| self.failure(e))?;
            started.push(replica.replica_id);
        }

        if running.len() as u32 > desired {
            // Stop replicas that are not serving first, newest first after that.
            running.sort_by_key(|r| (r.status == ReplicaStatus::Healthy, std::cmp::Reverse(r.replica_id)));
            let excess = running.len() - desired as usize;
            for replica in running.iter().take(excess) {
                self.stop(replica.replica_id).await?;
            }
        }
        Ok(started)
    }

    async fn stop(&self, replica_id: ReplicaId) -> Result<()> {
        match self.backend.stop_replica(&self.spec.name, replica_id).await {
            Ok(()) | Err(BackendError::NotFound(_)) => Ok(()),
            Err(e) => Err(self.failure(e)),
        }
    }

    async fn stop_all(&self, ids: &[ReplicaId]) {
        for &id in ids {
            if let Err(e) = self.stop(id).await {
                warn!(service = %self.spec.name, replica_id = id, error = %e, "failed to stop replica");
            }
        }
    }

    /// Poll until every replica in `ids` reports healthy. Any replica that
    /// reports unhealthy, disappears, or outlives the grace period fails the wait.
    async fn await_healthy(&self, ids: &[ReplicaId]) -> std::result::Result<(), String> {
        let rollout = &self.spec.rollout;
        let deadline = Instant::now() + Duration::from_millis(rollout.health_grace_ms);
        let poll = Duration::from_millis(rollout.health_poll_ms);

        loop {
            let replicas = self.replicas().await.map_err(|e| e.to_string())?;
            let mut pending = 0;
            for id in ids {
                match replicas.iter().find(|r| r.replica_id == *id) {
                    None => return Err(format!("replica {id} disappeared")),
                    Some(r) => match r.status {
                        ReplicaStatus::Healthy => {}
                        ReplicaStatus::Starting => pending += 1,
                        other => return Err(format!("replica {id} reported {other:?}")),
                    },
                }
            }
            if pending == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(format!(
                    "{pending} replica(s) not healthy within {}ms",
                    rollout.health_grace_ms
                ));
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Roll the service onto `next`. New replicas must report healthy before
    /// old ones are retired, and healthy replicas never drop below the
    /// rollout minimum. On failure the new replicas are stopped and the
    /// service keeps its current workload.
    pub async fn deploy(&self, next: WorkloadDefinition) -> Result<WorkloadRef> {
        let _guard = self.ops.lock().await;

        let (current, desired) = {
            let r = self.record.borrow();
            (r.workload.clone(), r.desired_count)
        };
        let next_ref = next.reference();
        if next_ref == current {
            return Ok(current);
        }
        if next.family() != current.family {
            return Err(Error::InvalidConfig(format!(
                "service {} runs family {}, not {}",
                self.spec.name,
                current.family,
                next.family()
            )));
        }

        info!(service = %self.spec.name, from = %current, to = %next_ref, desired, "rolling replace started");
        self.history.write().await.insert(next.revision(), next);

        match self.rolling_replace(&current, &next_ref, desired).await {
            Ok(()) => {
                self.write_record(|r| r.workload = next_ref.clone());
                self.metrics.rollouts_total.fetch_add(1, Ordering::Relaxed);
                info!(service = %self.spec.name, workload = %next_ref, "rolling replace complete");
                Ok(next_ref)
            }
            Err(e) => {
                self.history.write().await.remove(&next_ref.revision);
                self.metrics.rollout_failures_total.fetch_add(1, Ordering::Relaxed);
                warn!(service = %self.spec.name, workload = %current, error = %e, "rolling replace aborted");
                Err(e)
            }
        }
    }

    async fn rolling_replace(
        &self,
        current: &WorkloadRef,
        next: &WorkloadRef,
        desired: u32,
    ) -> Result<()> {
        let rollout = &self.spec.rollout;
        let min_healthy = rollout.min_healthy(desired) as usize;
        let max_running = rollout.max_running(desired) as usize;
        let desired = desired as usize;
        let mut fresh: Vec<ReplicaId> = Vec::new();

        loop {
            let old: Vec<ReplicaInfo> = self
                .replicas()
                .await?
                .into_iter()
                .filter(|r| &r.workload != next)
                .collect();
            if fresh.len() >= desired && old.is_empty() {
                return Ok(());
            }

            let room = max_running.saturating_sub(old.len() + fresh.len());
            let to_start = desired.saturating_sub(fresh.len()).min(room);
            let mut batch = Vec::with_capacity(to_start);
            for _ in 0..to_start {
                match self.backend.start_replica(&self.spec.name, next).await {
                    Ok(r) => batch.push(r.replica_id),
                    Err(e) => {
                        fresh.extend(batch);
                        return Err(self.abort(current, &fresh, desired, e.to_string()).await);
                    }
                }
            }
            if !batch.is_empty() {
                let confirmed = self.await_healthy(&batch).await;
                fresh.extend(batch);
                if let Err(reason) = confirmed {
                    return Err(self.abort(current, &fresh, desired, reason).await);
                }
            }

            let fresh_ids: HashSet<ReplicaId> = fresh.iter().copied().collect();
            let all = self.replicas().await?;
            let healthy = all
                .iter()
                .filter(|r| r.status == ReplicaStatus::Healthy)
                .count();
            let mut budget = healthy.saturating_sub(min_healthy);
            let mut old: Vec<&ReplicaInfo> = all
                .iter()
                .filter(|r| !fresh_ids.contains(&r.replica_id) && &r.workload != next)
                .collect();
            old.sort_by_key(|r| r.status == ReplicaStatus::Healthy);

            let mut retired = 0;
            for replica in old {
                if replica.status != ReplicaStatus::Healthy {
                    self.stop(replica.replica_id).await?;
                } else if budget > 0 {
                    self.stop(replica.replica_id).await?;
                    budget -= 1;
                } else {
                    continue;
                }
                retired += 1;
            }

            if to_start == 0 && retired == 0 {
                let reason = format!("rollout stalled with {healthy} healthy of {min_healthy} required");
                return Err(self.abort(current, &fresh, desired, reason).await);
            }
        }
    }

    /// Put `current` back at full strength, then release the new replicas.
    /// If `current` cannot be restored, new replicas that are healthy keep
    /// serving and only the others are stopped.
    async fn abort(
        &self,
        current: &WorkloadRef,
        fresh: &[ReplicaId],
        desired: usize,
        reason: String,
    ) -> Error {
        let serving = match self.replicas().await {
            Ok(all) => Some(all.iter().filter(|r| &r.workload == current).count()),
            Err(e) => {
                warn!(service = %self.spec.name, error = %e, "cannot list replicas to restore");
                None
            }
        };
        let mut restored_ok = serving.is_some();
        let mut restored = Vec::new();
        for _ in serving.unwrap_or(desired)..desired {
            match self.backend.start_replica(&self.spec.name, current).await {
                Ok(r) => restored.push(r.replica_id),
                Err(e) => {
                    warn!(service = %self.spec.name, error = %e, "failed to restore replica");
                    restored_ok = false;
                    break;
                }
            }
        }
        if !restored.is_empty() {
            if let Err(why) = self.await_healthy(&restored).await {
                warn!(service = %self.spec.name, reason = %why, "restored replicas not healthy");
                restored_ok = false;
            }
        }

        if restored_ok {
            self.stop_all(fresh).await;
            return self.failure(format!("rollout to new workload aborted: {reason}"));
        }

        let serving_fresh: HashSet<ReplicaId> = match self.replicas().await {
            Ok(all) => all
                .iter()
                .filter(|r| r.status == ReplicaStatus::Healthy)
                .map(|r| r.replica_id)
                .collect(),
            Err(_) => fresh.iter().copied().collect(),
        };
        let (kept, dead): (Vec<ReplicaId>, Vec<ReplicaId>) =
            fresh.iter().copied().partition(|id| serving_fresh.contains(id));
        self.stop_all(&dead).await;
        warn!(
            service = %self.spec.name,
            workload = %current,
            kept = kept.len(),
            "previous workload not restored, new replicas left serving"
        );
        self.failure(format!(
            "rollout to new workload aborted: {reason}; {} new replica(s) left serving",
            kept.len()
        ))
    }
}
