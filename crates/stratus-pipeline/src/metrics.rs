use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub runs_started_total: AtomicU64,
    pub runs_deployed_total: AtomicU64,
    pub runs_failed_total: AtomicU64,
    /// Triggers refused because a run was active.
    pub triggers_rejected_total: AtomicU64,
    pub triggers_queued_total: AtomicU64,
}

impl PipelineMetrics {
    pub fn render(&self, out: &mut String) {
        let rows: [(&str, &str, &AtomicU64); 5] = [
            ("stratus_pipeline_runs_started_total", "Pipeline runs started.", &self.runs_started_total),
            ("stratus_pipeline_runs_deployed_total", "Pipeline runs that deployed.", &self.runs_deployed_total),
            ("stratus_pipeline_runs_failed_total", "Pipeline runs that failed.", &self.runs_failed_total),
            ("stratus_pipeline_triggers_rejected_total", "Triggers refused while a run was active.", &self.triggers_rejected_total),
            ("stratus_pipeline_triggers_queued_total", "Triggers held while a run was active.", &self.triggers_queued_total),
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
