use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workload::{ImageRef, WorkloadRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Source,
    Build,
    Approval,
    Deploy,
}

impl StageKind {
    pub const ORDER: [StageKind; 4] = [
        StageKind::Source,
        StageKind::Build,
        StageKind::Approval,
        StageKind::Deploy,
    ];
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageKind::Source => "source",
            StageKind::Build => "build",
            StageKind::Approval => "approval",
            StageKind::Deploy => "deploy",
        };
        f.write_str(s)
    }
}

/// Position of one pipeline run. Strictly forward, `Failed` from anywhere
/// non-terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Accepted from the trigger; source fetch in progress.
    Triggered,
    SourceFetched,
    Built,
    AwaitingApproval,
    /// Approved; rolling replace in progress.
    Approved,
    Deployed,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Deployed | RunState::Failed)
    }

    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Triggered, SourceFetched)
            | (SourceFetched, Built)
            | (Built, AwaitingApproval)
            | (AwaitingApproval, Approved)
            | (Approved, Deployed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Triggered => "TRIGGERED",
            RunState::SourceFetched => "SOURCE_FETCHED",
            RunState::Built => "BUILT",
            RunState::AwaitingApproval => "AWAITING_APPROVAL",
            RunState::Approved => "APPROVED",
            RunState::Deployed => "DEPLOYED",
            RunState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Upstream source-change event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriggerEvent {
    pub branch: String,
    pub commit: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceArtifact {
    pub repository: String,
    pub branch: String,
    pub commit: String,
    /// Opaque location of the snapshot, owned by the source collaborator.
    pub location: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageArtifact {
    pub image: ImageRef,
    pub build_id: String,
}

/// Output of one stage, consumed by exactly the next.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Artifact {
    Source(SourceArtifact),
    Image(ImageArtifact),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve { by: String },
    Reject { by: String, reason: String },
}

/// Externally visible view of a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: RunId,
    pub pipeline: String,
    pub state: RunState,
    pub trigger: TriggerEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload: Option<WorkloadRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<StageKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub started_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_only() {
        assert!(RunState::Triggered.can_transition_to(RunState::SourceFetched));
        assert!(RunState::AwaitingApproval.can_transition_to(RunState::Approved));
        assert!(!RunState::Triggered.can_transition_to(RunState::Built));
        assert!(!RunState::Built.can_transition_to(RunState::SourceFetched));
        assert!(!RunState::Built.can_transition_to(RunState::Deployed));
    }

    #[test]
    fn test_failed_reachable_from_non_terminal_only() {
        for s in [
            RunState::Triggered,
            RunState::SourceFetched,
            RunState::Built,
            RunState::AwaitingApproval,
            RunState::Approved,
        ] {
            assert!(s.can_transition_to(RunState::Failed), "{s}");
        }
        assert!(!RunState::Deployed.can_transition_to(RunState::Failed));
        assert!(!RunState::Failed.can_transition_to(RunState::Failed));
    }
}
