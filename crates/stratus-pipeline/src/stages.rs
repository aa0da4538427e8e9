//! Collaborators the release pipeline drives. Each stage is one call.

use std::fmt;

use async_trait::async_trait;

use stratus_common::{
    AccessPolicy, ImageArtifact, Result, SourceArtifact, TriggerEvent, WorkloadRef,
};

/// A resolved credential. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Resolve a `secret://<name>` reference.
    async fn resolve(&self, reference: &str) -> anyhow::Result<Secret>;
}

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(
        &self,
        repository: &str,
        trigger: &TriggerEvent,
        credential: &Secret,
    ) -> anyhow::Result<SourceArtifact>;
}

/// What the build stage runs as. The build identity is only ever handed
/// to the builder, for the duration of one build.
#[derive(Debug, Clone)]
pub struct BuildContext<'a> {
    pub repository: &'a str,
    pub identity: &'a AccessPolicy,
}

#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn build(
        &self,
        source: &SourceArtifact,
        ctx: BuildContext<'_>,
    ) -> anyhow::Result<ImageArtifact>;

    /// Drop an image that will never be deployed.
    async fn discard(&self, image: &ImageArtifact) -> anyhow::Result<()>;
}

/// Where approved images go. Implementations wrap the image in a new
/// workload revision and roll the service onto it.
#[async_trait]
pub trait DeployTarget: Send + Sync {
    async fn current(&self) -> WorkloadRef;

    async fn deploy(&self, image: &ImageArtifact) -> Result<WorkloadRef>;
}
