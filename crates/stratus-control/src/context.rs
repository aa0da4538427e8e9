use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use stratus_backend::Backend;
use stratus_balancer::LoadBalancer;
use stratus_common::{DeploymentConfig, Error, Result};
use stratus_pipeline::{
    Collaborators, ImageBuilder, Pipeline, PipelineMetrics, PipelineSettings, SecretStore,
    SourceFetcher,
};
use stratus_service::{ServiceController, ServiceMetrics};
use stratus_topology::{Blueprint, ProvisionedTopology, Provisioner, ResourceKeys};

use crate::target::ServiceDeployTarget;

/// Pipeline collaborators supplied by the caller; the deploy stage is wired
/// to the service by [`DeploymentContext::bring_up`].
pub struct ReleaseStages {
    pub secrets: Arc<dyn SecretStore>,
    pub source: Arc<dyn SourceFetcher>,
    pub builder: Arc<dyn ImageBuilder>,
}

/// Everything one deployment owns once it is up.
pub struct DeploymentContext {
    pub blueprint: Blueprint,
    pub provisioner: Arc<Provisioner>,
    pub topology: Arc<Mutex<ProvisionedTopology>>,
    pub controller: Arc<ServiceController>,
    pub balancer: Arc<LoadBalancer>,
    pub pipeline: Arc<Pipeline>,
    pub service_metrics: Arc<ServiceMetrics>,
    pub pipeline_metrics: Arc<PipelineMetrics>,
}

impl DeploymentContext {
    /// Compose, provision, start the service, wire the listener and build
    /// the release pipeline. A failure after provisioning tears the
    /// topology down again.
    pub async fn bring_up(
        config: &DeploymentConfig,
        backend: Arc<dyn Backend>,
        balancer: Arc<LoadBalancer>,
        stages: ReleaseStages,
    ) -> Result<Self> {
        let blueprint = Blueprint::compose(config)?;
        let provisioner = Arc::new(Provisioner::new(backend.clone()));
        let mut topology = provisioner.provision(&blueprint.graph).await?;

        let service_metrics = Arc::new(ServiceMetrics::default());
        let started = async {
            let controller = ServiceController::create(
                backend.clone(),
                ResourceKeys::CLUSTER,
                blueprint.service.clone(),
                blueprint.workload.clone(),
                service_metrics.clone(),
            )
            .await?;
            let plan = &blueprint.listener;
            balancer
                .attach_listener(plan.port, plan.ingress.clone())
                .and_then(|()| {
                    balancer.add_target(
                        plan.port,
                        &blueprint.service.name,
                        plan.target_port,
                        plan.health_check.clone(),
                    )
                })
                .map_err(|e| Error::provisioning(ResourceKeys::LISTENER, e))?;
            Ok::<_, Error>(controller)
        }
        .await;

        let controller = match started {
            Ok(c) => Arc::new(c),
            Err(e) => {
                warn!(deployment = %blueprint.name, error = %e, "service start failed, tearing down");
                if let Err(rollback) = provisioner.teardown(&mut topology).await {
                    warn!(error = %rollback, "rollback left resources behind");
                }
                return Err(e);
            }
        };

        let topology = Arc::new(Mutex::new(topology));
        let pipeline_metrics = Arc::new(PipelineMetrics::default());
        let target = Arc::new(ServiceDeployTarget::new(
            controller.clone(),
            provisioner.clone(),
            topology.clone(),
        ));
        let pipeline = Pipeline::new(
            PipelineSettings {
                name: config.name.clone(),
                source_repository: config.source_repository.clone(),
                source_branch: config.source_branch.clone(),
                source_credential: config.source_credential.clone(),
                image_repository: config.image_repository.clone(),
                trigger_policy: config.trigger_policy,
            },
            blueprint.build_policy.clone(),
            Collaborators {
                secrets: stages.secrets,
                source: stages.source,
                builder: stages.builder,
                target,
            },
            pipeline_metrics.clone(),
        );

        info!(
            deployment = %blueprint.name,
            account = %config.account_id,
            listener = blueprint.listener.port,
            "deployment up"
        );
        Ok(Self {
            blueprint,
            provisioner,
            topology,
            controller,
            balancer,
            pipeline,
            service_metrics,
            pipeline_metrics,
        })
    }

    /// Delete every resource in reverse creation order.
    pub async fn teardown(&self) -> Result<()> {
        let mut topology = self.topology.lock().await;
        self.provisioner.teardown(&mut topology).await
    }

    pub fn render_metrics(&self) -> String {
        let mut out = String::new();
        self.service_metrics.render(&mut out);
        self.pipeline_metrics.render(&mut out);
        self.balancer.render_metrics(&mut out);
        out
    }
}
