use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the service controller and autoscaler.
#[derive(Debug, Default)]
pub struct ServiceMetrics {
    /// Autoscaler loop iterations.
    pub autoscale_ticks_total: AtomicU64,
    /// Cycles that failed to read the metric or apply an action.
    pub autoscale_errors_total: AtomicU64,
    pub scale_out_total: AtomicU64,
    pub scale_in_total: AtomicU64,
    /// Scale actions dropped because a rollout held the service.
    pub scale_skipped_total: AtomicU64,
    pub rollouts_total: AtomicU64,
    pub rollout_failures_total: AtomicU64,
    /// Current desired replica count (gauge).
    pub desired_replicas: AtomicU64,
}

impl ServiceMetrics {
    /// Prometheus text exposition.
    pub fn render(&self, out: &mut String) {
        let rows: [(&str, &str, &str, &AtomicU64); 8] = [
            ("stratus_autoscale_ticks_total", "counter", "Autoscaler loop iterations.", &self.autoscale_ticks_total),
            ("stratus_autoscale_errors_total", "counter", "Autoscale cycles that failed.", &self.autoscale_errors_total),
            ("stratus_scale_out_total", "counter", "Scale-out actions applied.", &self.scale_out_total),
            ("stratus_scale_in_total", "counter", "Scale-in actions applied.", &self.scale_in_total),
            ("stratus_scale_skipped_total", "counter", "Scale actions skipped during a rollout.", &self.scale_skipped_total),
            ("stratus_rollouts_total", "counter", "Rolling replaces completed.", &self.rollouts_total),
            ("stratus_rollout_failures_total", "counter", "Rolling replaces aborted.", &self.rollout_failures_total),
            ("stratus_desired_replicas", "gauge", "Desired replica count.", &self.desired_replicas),
        ];
        for (name, kind, help, value) in rows {
            let _ = write!(
                out,
                "# HELP {name} {help}\n# TYPE {name} {kind}\n{name} {}\n",
                value.load(Ordering::Relaxed)
            );
        }
    }
}
