pub mod config;
pub mod error;
pub mod network;
pub mod pipeline;
pub mod policy;
pub mod service;
pub mod workload;

pub use config::{DeploymentConfig, TriggerPolicy};
pub use error::{Error, Result};
pub use network::{Cidr, Gateway, NetworkTopology, Subnet, SubnetKind};
pub use pipeline::{
    ApprovalDecision, Artifact, ImageArtifact, RunId, RunState, RunSummary, SourceArtifact,
    StageKind, TriggerEvent,
};
pub use policy::{AccessPolicy, Permission, Principal};
pub use service::{
    ReplicaBounds, RolloutPolicy, ScalingPolicy, SecurityRule, ServiceRecord, ServiceSpec,
};
pub use workload::{ContainerSpec, ImageRef, LogDestination, WorkloadDefinition, WorkloadRef};

pub mod telemetry;
pub mod util;
