use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;

use stratus_backend::Backend;

use crate::LoadBalancer;

/// Mirror the backend's view of `service`'s replicas into the balancer.
/// Reads replica health only; never changes it.
pub async fn health_sync_loop(
    backend: Arc<dyn Backend>,
    balancer: Arc<LoadBalancer>,
    service: String,
) -> anyhow::Result<()> {
    loop {
        // Subscribe before listing so nothing between the two is lost.
        let mut stream = match backend.watch_replicas(None).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error=%e, %service, "failed to watch replicas, will retry");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        match backend.list_replicas(&service).await {
            Ok(snapshot) => balancer.replace_replicas(&service, snapshot),
            Err(e) => {
                tracing::warn!(error=%e, %service, "failed to list replicas, will retry");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        }

        while let Some(ev) = stream.next().await {
            if ev.service != service {
                continue;
            }
            match ev.replica {
                Some(info) => balancer.upsert_replica(info),
                None => balancer.remove_replica(&ev.service, ev.replica_id),
            }
        }

        tracing::warn!(%service, "replica watch stream ended, reconnecting");
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}
