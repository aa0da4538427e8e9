use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{info, warn};

use stratus_common::util::now_ms;
use stratus_common::{
    AccessPolicy, ApprovalDecision, Artifact, Error, ImageArtifact, Result, RunId, RunState,
    RunSummary, StageKind, TriggerEvent, TriggerPolicy, WorkloadRef,
};

use crate::metrics::PipelineMetrics;
use crate::stages::{BuildContext, DeployTarget, ImageBuilder, SecretStore, SourceFetcher};

#[derive(Debug, Clone, Serialize)]
pub struct PipelineSettings {
    pub name: String,
    pub source_repository: String,
    pub source_branch: String,
    /// `secret://` reference, resolved at the start of every run.
    pub source_credential: String,
    pub image_repository: String,
    pub trigger_policy: TriggerPolicy,
}

pub struct Collaborators {
    pub secrets: Arc<dyn SecretStore>,
    pub source: Arc<dyn SourceFetcher>,
    pub builder: Arc<dyn ImageBuilder>,
    pub target: Arc<dyn DeployTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TriggerOutcome {
    Started { run_id: RunId },
    /// Held until the active run finishes; replaces any older held trigger.
    Queued { behind: RunId },
}

/// What the approval gate can receive.
#[derive(Debug)]
enum GateSignal {
    Decision(ApprovalDecision),
    Cancel { by: String },
}

struct RunRecord {
    summary: RunSummary,
    state: watch::Sender<RunState>,
    /// Output of the last completed stage, consumed by the next.
    artifact: Option<Artifact>,
    cancel_requested: Option<String>,
}

#[derive(Default)]
struct Runs {
    records: HashMap<RunId, RunRecord>,
    order: Vec<RunId>,
    active: Option<RunId>,
    queued: Option<TriggerEvent>,
}

/// A stage failure before it is recorded on the run.
struct StageFailure {
    stage: StageKind,
    reason: String,
}

impl StageFailure {
    fn new(stage: StageKind, reason: impl ToString) -> Self {
        Self {
            stage,
            reason: reason.to_string(),
        }
    }
}

/// Source → Build → Approval → Deploy, one run at a time.
pub struct Pipeline {
    settings: PipelineSettings,
    build_identity: AccessPolicy,
    collaborators: Collaborators,
    runs: Mutex<Runs>,
    /// Pending approval decisions, keyed by run.
    gates: Mutex<HashMap<RunId, oneshot::Sender<GateSignal>>>,
    metrics: Arc<PipelineMetrics>,
}

impl Pipeline {
    pub fn new(
        settings: PipelineSettings,
        build_identity: AccessPolicy,
        collaborators: Collaborators,
        metrics: Arc<PipelineMetrics>,
    ) -> Arc<Self> {
        info!(
            pipeline = %settings.name,
            repository = %settings.source_repository,
            branch = %settings.source_branch,
            policy = ?settings.trigger_policy,
            "pipeline configured"
        );
        Arc::new(Self {
            settings,
            build_identity,
            collaborators,
            runs: Mutex::new(Runs::default()),
            gates: Mutex::new(HashMap::new()),
            metrics,
        })
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Accept a source-change event. While a run is active the trigger is
    /// refused or held, depending on the trigger policy.
    pub async fn trigger(self: &Arc<Self>, event: TriggerEvent) -> Result<TriggerOutcome> {
        if event.branch != self.settings.source_branch {
            return Err(Error::InvalidConfig(format!(
                "pipeline {} tracks branch {}, not {}",
                self.settings.name, self.settings.source_branch, event.branch
            )));
        }

        let mut runs = self.runs.lock().await;
        if let Some(active) = runs.active {
            return match self.settings.trigger_policy {
                TriggerPolicy::Reject => {
                    self.metrics.triggers_rejected_total.fetch_add(1, Ordering::Relaxed);
                    warn!(pipeline = %self.settings.name, %active, commit = %event.commit, "trigger rejected, run in progress");
                    Err(Error::PipelineBusy {
                        pipeline: self.settings.name.clone(),
                        active,
                    })
                }
                TriggerPolicy::Queue => {
                    if let Some(replaced) = runs.queued.replace(event.clone()) {
                        info!(pipeline = %self.settings.name, replaced = %replaced.commit, "held trigger superseded");
                    }
                    self.metrics.triggers_queued_total.fetch_add(1, Ordering::Relaxed);
                    info!(pipeline = %self.settings.name, %active, commit = %event.commit, "trigger held");
                    Ok(TriggerOutcome::Queued { behind: active })
                }
            };
        }

        let run_id = self.start_locked(&mut runs, event);
        Ok(TriggerOutcome::Started { run_id })
    }

    fn start_locked(self: &Arc<Self>, runs: &mut Runs, event: TriggerEvent) -> RunId {
        let run_id = RunId::new();
        let (state, _) = watch::channel(RunState::Triggered);
        runs.records.insert(
            run_id,
            RunRecord {
                summary: RunSummary {
                    run_id,
                    pipeline: self.settings.name.clone(),
                    state: RunState::Triggered,
                    trigger: event.clone(),
                    image: None,
                    workload: None,
                    failed_stage: None,
                    failure: None,
                    started_at_ms: now_ms(),
                    finished_at_ms: None,
                },
                state,
                artifact: None,
                cancel_requested: None,
            },
        );
        runs.order.push(run_id);
        runs.active = Some(run_id);
        self.metrics.runs_started_total.fetch_add(1, Ordering::Relaxed);
        info!(pipeline = %self.settings.name, %run_id, commit = %event.commit, "run started");

        let pipeline = Arc::clone(self);
        tokio::spawn(async move { pipeline.execute(run_id, event).await });
        run_id
    }

    pub async fn run(&self, run_id: RunId) -> Option<RunSummary> {
        self.runs
            .lock()
            .await
            .records
            .get(&run_id)
            .map(|r| r.summary.clone())
    }

    /// Newest first.
    pub async fn runs(&self) -> Vec<RunSummary> {
        let runs = self.runs.lock().await;
        runs.order
            .iter()
            .rev()
            .filter_map(|id| runs.records.get(id).map(|r| r.summary.clone()))
            .collect()
    }

    pub async fn active_run(&self) -> Option<RunId> {
        self.runs.lock().await.active
    }

    /// Wait until the run reaches `state` or ends. Returns the summary then.
    pub async fn wait_for(&self, run_id: RunId, state: RunState) -> Result<RunSummary> {
        let mut rx = {
            let runs = self.runs.lock().await;
            let record = runs.records.get(&run_id).ok_or_else(|| Error::NotFound {
                kind: "run",
                id: run_id.to_string(),
            })?;
            record.state.subscribe()
        };
        // The sender lives as long as the record, which is never removed.
        let _ = rx.wait_for(|s| *s == state || s.is_terminal()).await;
        self.run(run_id).await.ok_or_else(|| Error::NotFound {
            kind: "run",
            id: run_id.to_string(),
        })
    }

    pub async fn wait_finished(&self, run_id: RunId) -> Result<RunSummary> {
        self.wait_for(run_id, RunState::Deployed).await
    }

    pub async fn approve(&self, run_id: RunId, by: &str) -> Result<()> {
        self.signal(run_id, GateSignal::Decision(ApprovalDecision::Approve { by: by.to_string() }))
            .await
    }

    pub async fn reject(&self, run_id: RunId, by: &str, reason: &str) -> Result<()> {
        self.signal(
            run_id,
            GateSignal::Decision(ApprovalDecision::Reject {
                by: by.to_string(),
                reason: reason.to_string(),
            }),
        )
        .await
    }

    /// Abort a run. A run waiting for approval fails at once; a run still
    /// fetching source or building fails when that stage completes. An
    /// approved run is rolling the service and can no longer be cancelled.
    pub async fn cancel(&self, run_id: RunId, by: &str) -> Result<()> {
        if let Some(gate) = self.gates.lock().await.remove(&run_id) {
            let _ = gate.send(GateSignal::Cancel { by: by.to_string() });
            return Ok(());
        }
        let mut runs = self.runs.lock().await;
        let record = runs.records.get_mut(&run_id).ok_or_else(|| Error::NotFound {
            kind: "run",
            id: run_id.to_string(),
        })?;
        let state = record.summary.state;
        if state.is_terminal() || state == RunState::Approved {
            return Err(Error::RunNotCancellable { run_id, state });
        }
        record.cancel_requested = Some(by.to_string());
        info!(%run_id, %by, state = %record.summary.state, "cancel requested");
        Ok(())
    }

    async fn signal(&self, run_id: RunId, signal: GateSignal) -> Result<()> {
        let gate = self.gates.lock().await.remove(&run_id);
        match gate {
            Some(tx) => {
                if tx.send(signal).is_err() {
                    warn!(%run_id, "approval gate closed before the decision arrived");
                }
                Ok(())
            }
            None => {
                let state = self.run(run_id).await.map(|s| s.state).ok_or_else(|| Error::NotFound {
                    kind: "run",
                    id: run_id.to_string(),
                })?;
                Err(Error::RunNotAwaitingApproval { run_id, state })
            }
        }
    }

    async fn advance(&self, run_id: RunId, next: RunState, f: impl FnOnce(&mut RunRecord)) -> std::result::Result<(), StageFailure> {
        let mut runs = self.runs.lock().await;
        let Some(record) = runs.records.get_mut(&run_id) else {
            return Err(StageFailure::new(StageKind::Source, "run record vanished"));
        };
        let from = record.summary.state;
        if let Some(by) = record.cancel_requested.clone() {
            let stage = stage_after(from);
            return Err(StageFailure::new(stage, format!("cancelled by {by}")));
        }
        if !from.can_transition_to(next) {
            return Err(StageFailure::new(
                stage_after(from),
                format!("illegal transition {from} -> {next}"),
            ));
        }
        f(record);
        record.summary.state = next;
        record.state.send_replace(next);
        info!(%run_id, %from, to = %next, "run advanced");
        Ok(())
    }

    async fn execute(self: Arc<Self>, run_id: RunId, event: TriggerEvent) {
        let outcome = self.run_stages(run_id, &event).await;

        let (final_state, leftover) = {
            let mut runs = self.runs.lock().await;
            let finished = match runs.records.get_mut(&run_id) {
                Some(record) => {
                    record.summary.finished_at_ms = Some(now_ms());
                    match &outcome {
                        Ok(workload) => {
                            record.summary.state = RunState::Deployed;
                            record.summary.workload = Some(workload.clone());
                            record.artifact = None;
                            (RunState::Deployed, None)
                        }
                        Err(failure) => {
                            record.summary.state = RunState::Failed;
                            record.summary.failed_stage = Some(failure.stage);
                            record.summary.failure = Some(failure.reason.clone());
                            record.summary.image = None;
                            (RunState::Failed, record.artifact.take())
                        }
                    }
                }
                None => (RunState::Failed, None),
            };
            runs.active = None;
            if let Some(next) = runs.queued.take() {
                info!(pipeline = %self.settings.name, commit = %next.commit, "starting held trigger");
                self.start_locked(&mut runs, next);
            }
            finished
        };

        match &outcome {
            Ok(workload) => {
                self.metrics.runs_deployed_total.fetch_add(1, Ordering::Relaxed);
                info!(%run_id, %workload, "run deployed");
            }
            Err(failure) => {
                self.metrics.runs_failed_total.fetch_add(1, Ordering::Relaxed);
                let err = Error::stage(run_id, failure.stage, &failure.reason);
                warn!(%run_id, stage = %failure.stage, error = %err, "run failed");
            }
        }

        if let Some(Artifact::Image(image)) = leftover {
            self.discard(run_id, &image).await;
            info!(%run_id, image = %image.image, "undeployed image discarded");
        }

        // Waiters observe the terminal state only once cleanup is done.
        if let Some(record) = self.runs.lock().await.records.get(&run_id) {
            record.state.send_replace(final_state);
        }
    }

    async fn run_stages(
        &self,
        run_id: RunId,
        event: &TriggerEvent,
    ) -> std::result::Result<WorkloadRef, StageFailure> {
        let c = &self.collaborators;

        let credential = c
            .secrets
            .resolve(&self.settings.source_credential)
            .await
            .map_err(|e| StageFailure::new(StageKind::Source, format!("{e:#}")))?;
        let source = c
            .source
            .fetch(&self.settings.source_repository, event, &credential)
            .await
            .map_err(|e| StageFailure::new(StageKind::Source, format!("{e:#}")))?;
        drop(credential);
        let artifact = Artifact::Source(source.clone());
        self.advance(run_id, RunState::SourceFetched, |r| r.artifact = Some(artifact))
            .await?;

        let image = c
            .builder
            .build(
                &source,
                BuildContext {
                    repository: &self.settings.image_repository,
                    identity: &self.build_identity,
                },
            )
            .await
            .map_err(|e| StageFailure::new(StageKind::Build, format!("{e:#}")))?;
        if image.image.repository != self.settings.image_repository {
            let reason = format!("image {} is outside {}", image.image, self.settings.image_repository);
            self.discard(run_id, &image).await;
            return Err(StageFailure::new(StageKind::Build, reason));
        }
        let built = image.clone();
        let stored = self
            .advance(run_id, RunState::Built, |r| {
                r.summary.image = Some(built.image.clone());
                r.artifact = Some(Artifact::Image(built));
            })
            .await;
        if let Err(failure) = stored {
            // The run never took ownership of the image.
            self.discard(run_id, &image).await;
            return Err(failure);
        }

        let decision = self.await_approval(run_id).await?;
        match decision {
            GateSignal::Decision(ApprovalDecision::Approve { by }) => {
                info!(%run_id, %by, image = %image.image, "run approved");
                self.advance(run_id, RunState::Approved, |_| {}).await?;
            }
            GateSignal::Decision(ApprovalDecision::Reject { by, reason }) => {
                return Err(StageFailure::new(
                    StageKind::Approval,
                    format!("rejected by {by}: {reason}"),
                ));
            }
            GateSignal::Cancel { by } => {
                return Err(StageFailure::new(StageKind::Approval, format!("cancelled by {by}")));
            }
        }

        let before = c.target.current().await;
        let workload = c
            .target
            .deploy(&image)
            .await
            .map_err(|e| StageFailure::new(StageKind::Deploy, e))?;
        info!(%run_id, from = %before, to = %workload, "service rolled");
        Ok(workload)
    }

    async fn await_approval(&self, run_id: RunId) -> std::result::Result<GateSignal, StageFailure> {
        let (tx, rx) = oneshot::channel();
        self.gates.lock().await.insert(run_id, tx);
        if let Err(e) = self.advance(run_id, RunState::AwaitingApproval, |_| {}).await {
            self.gates.lock().await.remove(&run_id);
            return Err(e);
        }
        info!(%run_id, "awaiting approval");
        rx.await
            .map_err(|_| StageFailure::new(StageKind::Approval, "approval gate dropped"))
    }

    async fn discard(&self, run_id: RunId, image: &ImageArtifact) {
        if let Err(e) = self.collaborators.builder.discard(image).await {
            warn!(%run_id, image = %image.image, error = %e, "failed to discard image");
        }
    }
}

/// The stage that runs after a run has reached `state`.
fn stage_after(state: RunState) -> StageKind {
    match state {
        RunState::Triggered => StageKind::Source,
        RunState::SourceFetched => StageKind::Build,
        RunState::Built | RunState::AwaitingApproval => StageKind::Approval,
        RunState::Approved | RunState::Deployed | RunState::Failed => StageKind::Deploy,
    }
}
