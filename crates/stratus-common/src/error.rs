use thiserror::Error;

use crate::pipeline::{RunId, RunState, StageKind};

pub type Result<T> = std::result::Result<T, Error>;

/// Failures raised by topology composition, the service controller and the
/// release pipeline. Every variant names the component it came from.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
    /// The address range cannot be partitioned into the requested subnets.
    #[error("capacity error: {cidr} cannot hold {requested} subnets of /{mask} (room for {available})")]
    Capacity {
        cidr: String,
        mask: u8,
        requested: u32,
        available: u32,
    },

    #[error("invalid resource shape for workload {family}: cpu={cpu} memory={memory_mib}MiB: {reason}")]
    InvalidResourceShape {
        family: String,
        cpu: u32,
        memory_mib: u32,
        reason: String,
    },

    #[error("replica bounds error for service {service}: desired={desired} not within [{min}, {max}]")]
    ReplicaBounds {
        service: String,
        desired: u32,
        min: u32,
        max: u32,
    },

    #[error("provisioning failure on {resource}: {reason}")]
    Provisioning { resource: String, reason: String },

    #[error("pipeline run {run_id} failed in stage {stage}: {reason}")]
    PipelineStage {
        run_id: RunId,
        stage: StageKind,
        reason: String,
    },

    #[error("pipeline {pipeline} already has run {active} in progress")]
    PipelineBusy { pipeline: String, active: RunId },

    #[error("pipeline run {run_id} is {state}, not awaiting approval")]
    RunNotAwaitingApproval { run_id: RunId, state: RunState },

    /// The run is deploying or already finished.
    #[error("pipeline run {run_id} is {state} and can no longer be cancelled")]
    RunNotCancellable { run_id: RunId, state: RunState },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    pub fn provisioning(resource: impl Into<String>, reason: impl ToString) -> Self {
        Self::Provisioning {
            resource: resource.into(),
            reason: reason.to_string(),
        }
    }

    pub fn stage(run_id: RunId, stage: StageKind, reason: impl ToString) -> Self {
        Self::PipelineStage {
            run_id,
            stage,
            reason: reason.to_string(),
        }
    }
}
