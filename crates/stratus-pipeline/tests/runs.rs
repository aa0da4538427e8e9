use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use stratus_common::{
    AccessPolicy, Error, ImageArtifact, ImageRef, Result, RunState, SourceArtifact, StageKind,
    TriggerEvent, TriggerPolicy, WorkloadRef,
};
use stratus_pipeline::{
    BuildContext, Collaborators, DeployTarget, ImageBuilder, LocalSourceFetcher, Pipeline,
    PipelineMetrics, PipelineSettings, Secret, SourceFetcher, StaticSecretStore, TagImageBuilder,
    TriggerOutcome,
};

/// Holds a stage open once armed, until the test opens it.
#[derive(Default)]
struct Gate {
    armed: AtomicBool,
    entered: Notify,
    release: Notify,
}

impl Gate {
    fn arm(&self) {
        self.armed.store(true, Ordering::Relaxed);
    }

    async fn pass(&self) {
        if self.armed.load(Ordering::Relaxed) {
            self.entered.notify_one();
            self.release.notified().await;
        }
    }

    async fn reached(&self) {
        self.entered.notified().await;
    }

    fn open(&self) {
        self.release.notify_one();
    }
}

struct GatedSource {
    gate: Arc<Gate>,
}

#[async_trait]
impl SourceFetcher for GatedSource {
    async fn fetch(
        &self,
        repository: &str,
        trigger: &TriggerEvent,
        credential: &Secret,
    ) -> anyhow::Result<SourceArtifact> {
        self.gate.pass().await;
        LocalSourceFetcher.fetch(repository, trigger, credential).await
    }
}

/// Pushes through the tag builder, then waits at the gate.
struct GatedBuilder {
    inner: Arc<TagImageBuilder>,
    gate: Arc<Gate>,
}

#[async_trait]
impl ImageBuilder for GatedBuilder {
    async fn build(
        &self,
        source: &SourceArtifact,
        ctx: BuildContext<'_>,
    ) -> anyhow::Result<ImageArtifact> {
        let image = self.inner.build(source, ctx).await?;
        self.gate.pass().await;
        Ok(image)
    }

    async fn discard(&self, image: &ImageArtifact) -> anyhow::Result<()> {
        self.inner.discard(image).await
    }
}

struct RecordingTarget {
    current: Mutex<WorkloadRef>,
    deployed: Mutex<Vec<ImageRef>>,
    fail: AtomicBool,
    gate: Arc<Gate>,
}

impl RecordingTarget {
    fn new(gate: Arc<Gate>) -> Self {
        Self {
            current: Mutex::new(WorkloadRef {
                family: "web".into(),
                revision: 1,
            }),
            deployed: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            gate,
        }
    }
}

#[async_trait]
impl DeployTarget for RecordingTarget {
    async fn current(&self) -> WorkloadRef {
        self.current.lock().await.clone()
    }

    async fn deploy(&self, image: &ImageArtifact) -> Result<WorkloadRef> {
        self.gate.pass().await;
        if self.fail.load(Ordering::Relaxed) {
            return Err(Error::provisioning("service/web", "new replicas never became healthy"));
        }
        let mut current = self.current.lock().await;
        current.revision += 1;
        self.deployed.lock().await.push(image.image.clone());
        Ok(current.clone())
    }
}

struct Fixture {
    pipeline: Arc<Pipeline>,
    builder: Arc<TagImageBuilder>,
    target: Arc<RecordingTarget>,
    metrics: Arc<PipelineMetrics>,
    source_gate: Arc<Gate>,
    build_gate: Arc<Gate>,
    deploy_gate: Arc<Gate>,
}

fn fixture(policy: TriggerPolicy, secrets: StaticSecretStore) -> Fixture {
    let builder = Arc::new(TagImageBuilder::new());
    let source_gate = Arc::new(Gate::default());
    let build_gate = Arc::new(Gate::default());
    let deploy_gate = Arc::new(Gate::default());
    let target = Arc::new(RecordingTarget::new(deploy_gate.clone()));
    let metrics = Arc::new(PipelineMetrics::default());
    let pipeline = Pipeline::new(
        PipelineSettings {
            name: "web".into(),
            source_repository: "git.local/acme/web".into(),
            source_branch: "main".into(),
            source_credential: "secret://git-token".into(),
            image_repository: "registry.local/web".into(),
            trigger_policy: policy,
        },
        AccessPolicy::build("registry.local/web"),
        Collaborators {
            secrets: Arc::new(secrets),
            source: Arc::new(GatedSource {
                gate: source_gate.clone(),
            }),
            builder: Arc::new(GatedBuilder {
                inner: builder.clone(),
                gate: build_gate.clone(),
            }),
            target: target.clone(),
        },
        metrics.clone(),
    );
    Fixture {
        pipeline,
        builder,
        target,
        metrics,
        source_gate,
        build_gate,
        deploy_gate,
    }
}

fn default_fixture(policy: TriggerPolicy) -> Fixture {
    fixture(policy, StaticSecretStore::new().with_secret("git-token", "t0k"))
}

fn push(commit: &str) -> TriggerEvent {
    TriggerEvent {
        branch: "main".into(),
        commit: commit.into(),
    }
}

async fn start(f: &Fixture, commit: &str) -> stratus_common::RunId {
    match f.pipeline.trigger(push(commit)).await.unwrap() {
        TriggerOutcome::Started { run_id } => run_id,
        other => panic!("expected a new run, got {other:?}"),
    }
}

#[tokio::test]
async fn approved_run_deploys_new_revision() {
    let f = default_fixture(TriggerPolicy::Reject);
    let run = start(&f, "aaaaaaaa1").await;

    let waiting = f.pipeline.wait_for(run, RunState::AwaitingApproval).await.unwrap();
    assert_eq!(waiting.state, RunState::AwaitingApproval);
    assert!(waiting.image.is_some());

    f.pipeline.approve(run, "release-manager").await.unwrap();
    let done = f.pipeline.wait_finished(run).await.unwrap();
    assert_eq!(done.state, RunState::Deployed);
    assert_eq!(done.workload.map(|w| w.revision), Some(2));
    assert_eq!(f.target.deployed.lock().await.len(), 1);
    assert_eq!(f.metrics.runs_deployed_total.load(Ordering::Relaxed), 1);
    assert_eq!(f.pipeline.active_run().await, None);
}

#[tokio::test]
async fn rejected_run_leaves_service_and_drops_image() {
    let f = default_fixture(TriggerPolicy::Reject);
    let before = f.target.current().await;
    let run = start(&f, "bbbbbbbb2").await;
    f.pipeline.wait_for(run, RunState::AwaitingApproval).await.unwrap();

    f.pipeline.reject(run, "release-manager", "not today").await.unwrap();
    let done = f.pipeline.wait_finished(run).await.unwrap();

    assert_eq!(done.state, RunState::Failed);
    assert_eq!(done.failed_stage, Some(StageKind::Approval));
    assert_eq!(done.image, None);
    assert_eq!(f.target.current().await, before);
    assert!(f.target.deployed.lock().await.is_empty());
    assert!(f.builder.pushed().await.is_empty());

    // No automatic retry of a rejected decision.
    assert!(matches!(
        f.pipeline.approve(run, "someone").await,
        Err(Error::RunNotAwaitingApproval { state: RunState::Failed, .. })
    ));
}

#[tokio::test]
async fn concurrent_trigger_is_rejected() {
    let f = default_fixture(TriggerPolicy::Reject);
    let run = start(&f, "cccccccc3").await;
    f.pipeline.wait_for(run, RunState::AwaitingApproval).await.unwrap();

    let err = f.pipeline.trigger(push("dddddddd4")).await.unwrap_err();
    assert_eq!(
        err,
        Error::PipelineBusy {
            pipeline: "web".into(),
            active: run
        }
    );
    assert_eq!(f.metrics.triggers_rejected_total.load(Ordering::Relaxed), 1);
    assert_eq!(f.pipeline.runs().await.len(), 1);
}

#[tokio::test]
async fn queued_trigger_runs_after_active_one_newest_wins() {
    let f = default_fixture(TriggerPolicy::Queue);
    let first = start(&f, "eeeeeeee5").await;
    f.pipeline.wait_for(first, RunState::AwaitingApproval).await.unwrap();

    for commit in ["ffffffff6", "99999999a"] {
        assert_eq!(
            f.pipeline.trigger(push(commit)).await.unwrap(),
            TriggerOutcome::Queued { behind: first }
        );
    }

    f.pipeline.reject(first, "ops", "superseded").await.unwrap();
    f.pipeline.wait_finished(first).await.unwrap();

    let second = loop {
        let runs = f.pipeline.runs().await;
        if runs.len() == 2 {
            break runs[0].clone();
        }
        tokio::task::yield_now().await;
    };
    assert_eq!(second.trigger.commit, "99999999a");
    f.pipeline
        .wait_for(second.run_id, RunState::AwaitingApproval)
        .await
        .unwrap();
}

#[tokio::test]
async fn cancel_collapses_awaiting_approval_to_failed() {
    let f = default_fixture(TriggerPolicy::Reject);
    let run = start(&f, "12121212b").await;
    f.pipeline.wait_for(run, RunState::AwaitingApproval).await.unwrap();

    f.pipeline.cancel(run, "operator").await.unwrap();
    let done = f.pipeline.wait_finished(run).await.unwrap();
    assert_eq!(done.state, RunState::Failed);
    assert_eq!(done.failed_stage, Some(StageKind::Approval));
    assert!(done.failure.unwrap().contains("operator"));
    assert!(f.target.deployed.lock().await.is_empty());
    assert!(f.builder.pushed().await.is_empty());
}

#[tokio::test]
async fn cancel_while_fetching_fails_source_stage() {
    let f = default_fixture(TriggerPolicy::Reject);
    f.source_gate.arm();
    let run = start(&f, "13131313f").await;
    f.source_gate.reached().await;

    f.pipeline.cancel(run, "operator").await.unwrap();
    f.source_gate.open();
    let done = f.pipeline.wait_finished(run).await.unwrap();

    assert_eq!(done.state, RunState::Failed);
    assert_eq!(done.failed_stage, Some(StageKind::Source));
    assert!(f.builder.pushed().await.is_empty());
    assert_eq!(f.pipeline.active_run().await, None);
}

#[tokio::test]
async fn cancel_while_building_discards_pushed_image() {
    let f = default_fixture(TriggerPolicy::Reject);
    f.build_gate.arm();
    let run = start(&f, "abcdef1234").await;
    f.build_gate.reached().await;
    assert_eq!(f.builder.pushed().await.len(), 1);

    f.pipeline.cancel(run, "operator").await.unwrap();
    f.build_gate.open();
    let done = f.pipeline.wait_finished(run).await.unwrap();

    assert_eq!(done.state, RunState::Failed);
    assert_eq!(done.failed_stage, Some(StageKind::Build));
    assert_eq!(done.image, None);
    assert!(f.builder.pushed().await.is_empty());
}

#[tokio::test]
async fn cancel_while_deploying_is_refused() {
    let f = default_fixture(TriggerPolicy::Reject);
    f.deploy_gate.arm();
    let run = start(&f, "24242424a").await;
    f.pipeline.wait_for(run, RunState::AwaitingApproval).await.unwrap();
    f.pipeline.approve(run, "release-manager").await.unwrap();
    f.deploy_gate.reached().await;

    assert_eq!(
        f.pipeline.cancel(run, "operator").await,
        Err(Error::RunNotCancellable {
            run_id: run,
            state: RunState::Approved
        })
    );
    f.deploy_gate.open();
    let done = f.pipeline.wait_finished(run).await.unwrap();

    assert_eq!(done.state, RunState::Deployed);
    assert_eq!(f.target.deployed.lock().await.len(), 1);
    assert!(matches!(
        f.pipeline.cancel(run, "operator").await,
        Err(Error::RunNotCancellable {
            state: RunState::Deployed,
            ..
        })
    ));
}

#[tokio::test]
async fn missing_credential_fails_source_stage() {
    let f = fixture(TriggerPolicy::Reject, StaticSecretStore::new());
    let run = start(&f, "34343434c").await;
    let done = f.pipeline.wait_finished(run).await.unwrap();
    assert_eq!(done.state, RunState::Failed);
    assert_eq!(done.failed_stage, Some(StageKind::Source));
    assert!(f.builder.pushed().await.is_empty());
}

#[tokio::test]
async fn build_failure_fails_run() {
    let f = default_fixture(TriggerPolicy::Reject);
    f.builder.set_failing(true);
    let run = start(&f, "56565656d").await;
    let done = f.pipeline.wait_finished(run).await.unwrap();
    assert_eq!(done.failed_stage, Some(StageKind::Build));
    assert_eq!(f.metrics.runs_failed_total.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn failed_rollout_keeps_previous_workload() {
    let f = default_fixture(TriggerPolicy::Reject);
    f.target.fail.store(true, Ordering::Relaxed);
    let before = f.target.current().await;

    let run = start(&f, "78787878e").await;
    f.pipeline.wait_for(run, RunState::AwaitingApproval).await.unwrap();
    f.pipeline.approve(run, "release-manager").await.unwrap();
    let done = f.pipeline.wait_finished(run).await.unwrap();

    assert_eq!(done.state, RunState::Failed);
    assert_eq!(done.failed_stage, Some(StageKind::Deploy));
    assert_eq!(f.target.current().await, before);
    assert!(f.builder.pushed().await.is_empty());
}

#[tokio::test]
async fn untracked_branch_is_refused() {
    let f = default_fixture(TriggerPolicy::Reject);
    let event = TriggerEvent {
        branch: "feature/x".into(),
        commit: "abc".into(),
    };
    assert!(matches!(
        f.pipeline.trigger(event).await,
        Err(Error::InvalidConfig(_))
    ));
}
