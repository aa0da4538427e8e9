use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::network::Cidr;
use crate::workload::WorkloadRef;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicaBounds {
    pub min: u32,
    pub max: u32,
}

impl ReplicaBounds {
    pub fn contains(&self, count: u32) -> bool {
        (self.min..=self.max).contains(&count)
    }

    pub fn clamp(&self, count: u32) -> u32 {
        count.clamp(self.min, self.max)
    }
}

/// Governs `desired_count` over time. Never leaves `bounds`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingPolicy {
    pub bounds: ReplicaBounds,

    /// Average CPU utilization (percent) the autoscaler steers towards.
    pub target_cpu_percent: f64,

    /// Scale in only once utilization is this many points below target.
    #[serde(default = "default_scale_in_margin")]
    pub scale_in_margin_percent: f64,

    /// Consecutive samples on one side of the target before acting.
    #[serde(default = "default_evaluation_periods")]
    pub evaluation_periods: u32,

    /// Replicas added or removed per scaling action.
    #[serde(default = "default_step")]
    pub step: u32,

    pub scale_out_cooldown_ms: u64,
    pub scale_in_cooldown_ms: u64,
}

fn default_scale_in_margin() -> f64 {
    10.0
}

fn default_evaluation_periods() -> u32 {
    3
}

fn default_step() -> u32 {
    1
}

/// Rolling replace limits, as percentages of the desired count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RolloutPolicy {
    /// Healthy replicas never drop below this share of desired during a rollout.
    pub min_healthy_percent: u32,
    /// Upper bound on running replicas (old + new) during a rollout.
    pub max_percent: u32,
    /// How long a new replica may take to report healthy.
    pub health_grace_ms: u64,
    #[serde(default = "default_health_poll_ms")]
    pub health_poll_ms: u64,
}

fn default_health_poll_ms() -> u64 {
    250
}

impl Default for RolloutPolicy {
    fn default() -> Self {
        Self {
            min_healthy_percent: 100,
            max_percent: 200,
            health_grace_ms: 60_000,
            health_poll_ms: default_health_poll_ms(),
        }
    }
}

impl RolloutPolicy {
    pub fn min_healthy(&self, desired: u32) -> u32 {
        (u64::from(desired) * u64::from(self.min_healthy_percent)).div_ceil(100) as u32
    }

    /// How many replicas may run in total while replacing `desired` replicas.
    /// Always leaves room for at least one replacement above `min_healthy`.
    pub fn max_running(&self, desired: u32) -> u32 {
        let by_percent = (u64::from(desired) * u64::from(self.max_percent) / 100) as u32;
        by_percent.max(self.min_healthy(desired) + 1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_healthy_percent > 100 {
            return Err(Error::InvalidConfig(format!(
                "min_healthy_percent {} exceeds 100",
                self.min_healthy_percent
            )));
        }
        if self.max_percent <= 100 {
            return Err(Error::InvalidConfig(format!(
                "max_percent {} leaves no room to start replacements",
                self.max_percent
            )));
        }
        if self.health_grace_ms == 0 || self.health_poll_ms == 0 {
            return Err(Error::InvalidConfig(
                "health grace and poll interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Inbound traffic a service accepts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityRule {
    pub port: u16,
    pub source: Cidr,
    #[serde(default)]
    pub description: String,
}

/// What the operator asks for when creating a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceSpec {
    pub name: String,
    pub desired_count: u32,
    pub scaling: ScalingPolicy,
    #[serde(default)]
    pub rollout: RolloutPolicy,
    #[serde(default)]
    pub security_rules: Vec<SecurityRule>,
    #[serde(default)]
    pub assign_public_ip: bool,
}

impl ServiceSpec {
    pub fn validate(&self) -> Result<()> {
        let ReplicaBounds { min, max } = self.scaling.bounds;
        if min > max || max == 0 || !self.scaling.bounds.contains(self.desired_count) {
            return Err(Error::ReplicaBounds {
                service: self.name.clone(),
                desired: self.desired_count,
                min,
                max,
            });
        }
        if self.scaling.evaluation_periods == 0 || self.scaling.step == 0 {
            return Err(Error::InvalidConfig(format!(
                "service {}: evaluation periods and scaling step must be positive",
                self.name
            )));
        }
        if !(self.scaling.target_cpu_percent > 0.0 && self.scaling.target_cpu_percent <= 100.0) {
            return Err(Error::InvalidConfig(format!(
                "service {}: target utilization {} is outside (0, 100]",
                self.name, self.scaling.target_cpu_percent
            )));
        }
        self.rollout.validate()
    }
}

/// Live state of a service. `desired_count` and `workload` are the only
/// fields written after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceRecord {
    pub name: String,
    pub cluster: String,
    pub workload: WorkloadRef,
    pub desired_count: u32,
    pub bounds: ReplicaBounds,
    pub security_rules: Vec<SecurityRule>,
    pub assign_public_ip: bool,

    /// Bumped on every write.
    pub version: u64,
    pub updated_at_ms: u64,
}
