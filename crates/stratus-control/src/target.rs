use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use stratus_backend::ResourceRequest;
use stratus_common::{Error, ImageArtifact, Result, WorkloadRef};
use stratus_pipeline::DeployTarget;
use stratus_service::ServiceController;
use stratus_topology::{ProvisionedTopology, Provisioner, ResourceKeys};

/// Deploy stage backed by the running service: registers the next workload
/// revision with the new image, then rolls the service onto it.
pub struct ServiceDeployTarget {
    controller: Arc<ServiceController>,
    provisioner: Arc<Provisioner>,
    topology: Arc<Mutex<ProvisionedTopology>>,
}

impl ServiceDeployTarget {
    pub fn new(
        controller: Arc<ServiceController>,
        provisioner: Arc<Provisioner>,
        topology: Arc<Mutex<ProvisionedTopology>>,
    ) -> Self {
        Self {
            controller,
            provisioner,
            topology,
        }
    }
}

#[async_trait]
impl DeployTarget for ServiceDeployTarget {
    async fn current(&self) -> WorkloadRef {
        self.controller.record().workload
    }

    async fn deploy(&self, image: &ImageArtifact) -> Result<WorkloadRef> {
        let current = self
            .controller
            .current_workload()
            .await
            .ok_or_else(|| Error::NotFound {
                kind: "workload",
                id: self.controller.record().workload.to_string(),
            })?;
        let next = current.with_image(image.image.clone())?;
        let key = ResourceKeys::workload_revision(next.revision());
        let handle = self
            .provisioner
            .create_one(
                &key,
                &ResourceRequest::Workload {
                    definition: next.clone(),
                    execution_identity: ResourceKeys::EXECUTION_IDENTITY.into(),
                    log_group: ResourceKeys::LOG_GROUP.into(),
                },
            )
            .await?;
        info!(workload = %next.reference(), image = %image.image, build = %image.build_id, "workload revision registered");

        // Revisions are torn down after the service that runs them.
        match self.controller.deploy(next).await {
            Ok(deployed) => {
                self.topology
                    .lock()
                    .await
                    .record_before(handle, ResourceKeys::SERVICE);
                Ok(deployed)
            }
            Err(e) => {
                if let Err(cleanup) = self.provisioner.delete_one(&handle).await {
                    warn!(resource = %key, error = %cleanup, "failed to remove unused workload revision");
                    self.topology
                        .lock()
                        .await
                        .record_before(handle, ResourceKeys::SERVICE);
                }
                Err(e)
            }
        }
    }
}
