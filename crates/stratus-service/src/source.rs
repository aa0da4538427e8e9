use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

/// Where the autoscaler reads average utilization from.
#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Average CPU utilization, in percent, across the service's replicas.
    async fn cpu_utilization(&self, service: &str) -> anyhow::Result<f64>;
}

/// A utilization value set from outside, e.g. by the admin API or a test.
#[derive(Debug)]
pub struct ManualMetric {
    bits: AtomicU64,
}

impl ManualMetric {
    pub fn new(initial: f64) -> Self {
        Self {
            bits: AtomicU64::new(initial.to_bits()),
        }
    }

    pub fn set(&self, percent: f64) {
        self.bits.store(percent.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

#[async_trait]
impl MetricSource for ManualMetric {
    async fn cpu_utilization(&self, _service: &str) -> anyhow::Result<f64> {
        let v = self.get();
        anyhow::ensure!(v.is_finite() && v >= 0.0, "utilization {v} is not a percentage");
        Ok(v)
    }
}
