use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::network::{Cidr, NetworkTopology};
use crate::policy::{self, AccessPolicy};
use crate::service::{ReplicaBounds, RolloutPolicy, ScalingPolicy, SecurityRule, ServiceSpec};
use crate::workload::{ContainerSpec, ImageRef, LogDestination, WorkloadDefinition};

/// Prefix every secret reference must carry; credentials are never inlined.
pub const SECRET_REF_PREFIX: &str = "secret://";

/// What happens to a source-change trigger while a run is in progress.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPolicy {
    /// Refuse the trigger.
    #[default]
    Reject,
    /// Hold it and start it once the active run finishes. A newer trigger
    /// replaces an older held one.
    Queue,
}

/// Operator-facing inputs for one deployment. Enumerated values only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentConfig {
    #[serde(default = "default_name")]
    pub name: String,

    /// Owning account; tagged on every resource.
    pub account_id: String,

    /// Image repository the build stage pushes to and replicas pull from.
    pub image_repository: String,

    #[serde(default = "default_image_tag")]
    pub initial_image_tag: String,

    #[serde(default = "default_network_cidr")]
    pub network_cidr: Cidr,
    #[serde(default = "default_zone_count")]
    pub zone_count: u32,
    #[serde(default = "default_zone_prefix")]
    pub zone_prefix: String,
    #[serde(default = "default_subnet_mask")]
    pub subnet_mask: u8,

    #[serde(default = "default_cpu")]
    pub cpu: u32,
    #[serde(default = "default_memory_mib")]
    pub memory_mib: u32,
    #[serde(default = "default_container_port")]
    pub container_port: u16,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    #[serde(default = "default_one")]
    pub desired_count: u32,
    #[serde(default = "default_one")]
    pub min_replicas: u32,
    #[serde(default = "default_max_replicas")]
    pub max_replicas: u32,
    #[serde(default = "default_target_cpu")]
    pub target_cpu_percent: f64,
    #[serde(default = "default_scale_in_margin")]
    pub scale_in_margin_percent: f64,
    #[serde(default = "default_evaluation_periods")]
    pub evaluation_periods: u32,
    #[serde(default = "default_cooldown_secs")]
    pub scale_out_cooldown_secs: u64,
    #[serde(default = "default_cooldown_secs")]
    pub scale_in_cooldown_secs: u64,
    #[serde(default = "default_metric_poll_secs")]
    pub metric_poll_secs: u64,

    #[serde(default = "default_min_healthy_percent")]
    pub min_healthy_percent: u32,
    #[serde(default = "default_max_percent")]
    pub max_percent: u32,
    #[serde(default = "default_health_grace_secs")]
    pub health_grace_secs: u64,

    #[serde(default = "default_listener_port")]
    pub listener_port: u16,
    /// Address ranges the listener accepts. `0.0.0.0/0` must be listed to
    /// open the listener to everyone.
    #[serde(default)]
    pub listener_ingress: Vec<Cidr>,
    #[serde(default = "default_health_check_path")]
    pub health_check_path: String,

    pub source_repository: String,
    #[serde(default = "default_branch")]
    pub source_branch: String,
    /// Reference into the secret store, e.g. `secret://github-token`.
    pub source_credential: String,
    #[serde(default)]
    pub trigger_policy: TriggerPolicy,
}

fn default_name() -> String {
    "web".to_string()
}
fn default_image_tag() -> String {
    "latest".to_string()
}
fn default_network_cidr() -> Cidr {
    Cidr::new(std::net::Ipv4Addr::new(10, 0, 0, 0), 16).unwrap_or(Cidr::ANY)
}
fn default_zone_count() -> u32 {
    2
}
fn default_zone_prefix() -> String {
    "zone-".to_string()
}
fn default_subnet_mask() -> u8 {
    24
}
fn default_cpu() -> u32 {
    512
}
fn default_memory_mib() -> u32 {
    1024
}
fn default_container_port() -> u16 {
    5000
}
fn default_one() -> u32 {
    1
}
fn default_max_replicas() -> u32 {
    4
}
fn default_target_cpu() -> f64 {
    50.0
}
fn default_scale_in_margin() -> f64 {
    10.0
}
fn default_evaluation_periods() -> u32 {
    3
}
fn default_cooldown_secs() -> u64 {
    60
}
fn default_metric_poll_secs() -> u64 {
    15
}
fn default_min_healthy_percent() -> u32 {
    100
}
fn default_max_percent() -> u32 {
    200
}
fn default_health_grace_secs() -> u64 {
    60
}
fn default_listener_port() -> u16 {
    80
}
fn default_health_check_path() -> String {
    "/".to_string()
}
fn default_branch() -> String {
    "main".to_string()
}

impl DeploymentConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path).map_err(|e| {
            Error::InvalidConfig(format!("failed to read {}: {e}", path.display()))
        })?;
        serde_json::from_slice(&raw)
            .map_err(|e| Error::InvalidConfig(format!("failed to parse {}: {e}", path.display())))
    }

    /// Zone names: `<prefix>a`, `<prefix>b`, ...
    pub fn zones(&self) -> Result<Vec<String>> {
        if self.zone_count == 0 || self.zone_count > 26 {
            return Err(Error::InvalidConfig(format!(
                "zone count {} must be within 1..=26",
                self.zone_count
            )));
        }
        Ok((0..self.zone_count as u8)
            .map(|i| format!("{}{}", self.zone_prefix, (b'a' + i) as char))
            .collect())
    }

    pub fn network(&self) -> Result<NetworkTopology> {
        NetworkTopology::plan(self.network_cidr, &self.zones()?, self.subnet_mask)
    }

    pub fn log_destination(&self) -> LogDestination {
        LogDestination {
            group: format!("/stratus/{}", self.name),
            stream_prefix: self.name.clone(),
        }
    }

    /// Revision 1 of the workload, running the initial image tag.
    pub fn workload(&self) -> Result<WorkloadDefinition> {
        let container = ContainerSpec::new(
            self.name.clone(),
            ImageRef::new(self.image_repository.clone(), self.initial_image_tag.clone()),
            self.container_port,
            self.log_destination(),
        )
        .with_env(self.environment.clone())?;
        WorkloadDefinition::define(self.name.clone(), 1, self.cpu, self.memory_mib, vec![container])
    }

    /// Replicas accept traffic on the container port from inside the network only.
    pub fn service_spec(&self) -> ServiceSpec {
        ServiceSpec {
            name: self.name.clone(),
            desired_count: self.desired_count,
            scaling: ScalingPolicy {
                bounds: ReplicaBounds {
                    min: self.min_replicas,
                    max: self.max_replicas,
                },
                target_cpu_percent: self.target_cpu_percent,
                scale_in_margin_percent: self.scale_in_margin_percent,
                evaluation_periods: self.evaluation_periods,
                step: 1,
                scale_out_cooldown_ms: self.scale_out_cooldown_secs * 1000,
                scale_in_cooldown_ms: self.scale_in_cooldown_secs * 1000,
            },
            rollout: RolloutPolicy {
                min_healthy_percent: self.min_healthy_percent,
                max_percent: self.max_percent,
                health_grace_ms: self.health_grace_secs * 1000,
                ..RolloutPolicy::default()
            },
            security_rules: vec![SecurityRule {
                port: self.container_port,
                source: self.network_cidr,
                description: "load balancer to replicas".to_string(),
            }],
            assign_public_ip: false,
        }
    }

    pub fn execution_policy(&self) -> AccessPolicy {
        AccessPolicy::execution(&self.image_repository)
    }

    pub fn build_policy(&self) -> AccessPolicy {
        AccessPolicy::build(&self.image_repository)
    }

    /// Every construction-time check, before any resource is requested.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("name", &self.name),
            ("account_id", &self.account_id),
            ("image_repository", &self.image_repository),
            ("source_repository", &self.source_repository),
            ("source_branch", &self.source_branch),
        ] {
            if value.trim().is_empty() {
                return Err(Error::InvalidConfig(format!("{field} is required")));
            }
        }
        if !self.source_credential.starts_with(SECRET_REF_PREFIX)
            || self.source_credential.len() == SECRET_REF_PREFIX.len()
        {
            return Err(Error::InvalidConfig(format!(
                "source_credential must be a {SECRET_REF_PREFIX}<name> reference"
            )));
        }
        if self.listener_ingress.is_empty() {
            return Err(Error::InvalidConfig(
                "listener_ingress must list the address ranges the listener accepts".into(),
            ));
        }
        if self.listener_port == 0 || self.metric_poll_secs == 0 {
            return Err(Error::InvalidConfig(
                "listener port and metric poll interval must be positive".into(),
            ));
        }

        self.network()?;
        self.workload()?;
        self.service_spec().validate()?;
        policy::validate_pair(&self.execution_policy(), &self.build_policy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DeploymentConfig {
        serde_json::from_value(serde_json::json!({
            "account_id": "123456789012",
            "image_repository": "registry.local/web",
            "network_cidr": "10.1.0.0/16",
            "zone_count": 3,
            "listener_ingress": ["0.0.0.0/0"],
            "source_repository": "git.local/acme/web",
            "source_credential": "secret://git-token",
            "environment": {"IS_PRODUCTION": "true"}
        }))
        .unwrap()
    }

    #[test]
    fn test_defaults_validate() {
        let cfg = config();
        cfg.validate().unwrap();
        assert_eq!(cfg.zones().unwrap(), vec!["zone-a", "zone-b", "zone-c"]);
        assert_eq!(cfg.workload().unwrap().primary().environment["IS_PRODUCTION"], "true");
    }

    #[test]
    fn test_inline_credential_rejected() {
        let mut cfg = config();
        cfg.source_credential = "ghp_abcdef".into();
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_listener_ingress_must_be_explicit() {
        let mut cfg = config();
        cfg.listener_ingress.clear();
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_errors_surface_before_creation() {
        let mut cfg = config();
        cfg.cpu = 300;
        assert!(matches!(cfg.validate(), Err(Error::InvalidResourceShape { .. })));

        let mut cfg = config();
        cfg.desired_count = 9;
        assert!(matches!(cfg.validate(), Err(Error::ReplicaBounds { .. })));

        let mut cfg = config();
        cfg.network_cidr = "10.1.0.0/23".parse().unwrap();
        assert!(matches!(cfg.validate(), Err(Error::Capacity { .. })));
    }
}
