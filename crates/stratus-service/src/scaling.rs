use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use stratus_common::util::now_ms;

use crate::autoscaler::{Autoscaler, ScaleDirection};
use crate::controller::ServiceController;
use crate::metrics::ServiceMetrics;
use crate::source::MetricSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Idle,
    Scaled { from: u32, to: u32 },
    /// A rollout held the service; the decision was dropped.
    Skipped,
}

/// One autoscaler evaluation: sample, decide, apply.
pub async fn autoscale_once(
    controller: &ServiceController,
    autoscaler: &mut Autoscaler,
    source: &dyn MetricSource,
    metrics: &ServiceMetrics,
    now: u64,
) -> anyhow::Result<TickOutcome> {
    let utilization = source.cpu_utilization(controller.name()).await?;
    let desired = controller.record().desired_count;

    let Some(action) = autoscaler.observe(utilization, desired, now) else {
        debug!(service = %controller.name(), utilization, desired, "autoscale: steady");
        return Ok(TickOutcome::Idle);
    };

    match controller.try_scale_to(action.to).await {
        Ok(Some(from)) => {
            autoscaler.complete();
            let counter = match action.direction {
                ScaleDirection::Out => &metrics.scale_out_total,
                ScaleDirection::In => &metrics.scale_in_total,
            };
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(TickOutcome::Scaled { from, to: action.to })
        }
        Ok(None) => {
            autoscaler.abandon();
            metrics.scale_skipped_total.fetch_add(1, Ordering::Relaxed);
            info!(service = %controller.name(), to = action.to, "autoscale: service busy, action dropped");
            Ok(TickOutcome::Skipped)
        }
        Err(e) => {
            autoscaler.abandon();
            Err(e.into())
        }
    }
}

/// Runs for the lifetime of the service.
pub async fn autoscaler_loop(
    controller: Arc<ServiceController>,
    source: Arc<dyn MetricSource>,
    interval: Duration,
    metrics: Arc<ServiceMetrics>,
) {
    let mut autoscaler = Autoscaler::new(controller.spec().scaling.clone());
    info!(
        service = %controller.name(),
        interval_s = interval.as_secs(),
        "autoscaler loop started"
    );

    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        metrics.autoscale_ticks_total.fetch_add(1, Ordering::Relaxed);
        if let Err(e) =
            autoscale_once(&controller, &mut autoscaler, source.as_ref(), &metrics, now_ms()).await
        {
            metrics.autoscale_errors_total.fetch_add(1, Ordering::Relaxed);
            warn!(service = %controller.name(), error = %e, "autoscale cycle failed");
        }
    }
}
