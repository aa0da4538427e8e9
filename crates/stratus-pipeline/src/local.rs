//! In-process collaborators for running the pipeline without external services.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::{anyhow, bail, ensure};
use async_trait::async_trait;
use tokio::sync::Mutex;

use stratus_common::config::SECRET_REF_PREFIX;
use stratus_common::{ImageArtifact, ImageRef, Permission, SourceArtifact, TriggerEvent};

use crate::stages::{BuildContext, ImageBuilder, Secret, SecretStore, SourceFetcher};

#[derive(Debug, Default)]
pub struct StaticSecretStore {
    secrets: HashMap<String, Secret>,
}

impl StaticSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, name: &str, value: &str) -> Self {
        self.secrets.insert(name.to_string(), Secret::new(value));
        self
    }
}

#[async_trait]
impl SecretStore for StaticSecretStore {
    async fn resolve(&self, reference: &str) -> anyhow::Result<Secret> {
        let name = reference
            .strip_prefix(SECRET_REF_PREFIX)
            .ok_or_else(|| anyhow!("{reference} is not a secret reference"))?;
        self.secrets
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("secret {name} not found"))
    }
}

/// Records the trigger's commit as the snapshot; needs a non-empty credential.
#[derive(Debug, Default)]
pub struct LocalSourceFetcher;

#[async_trait]
impl SourceFetcher for LocalSourceFetcher {
    async fn fetch(
        &self,
        repository: &str,
        trigger: &TriggerEvent,
        credential: &Secret,
    ) -> anyhow::Result<SourceArtifact> {
        ensure!(!credential.expose().is_empty(), "authentication to {repository} failed");
        ensure!(!trigger.commit.is_empty(), "trigger carries no commit");
        Ok(SourceArtifact {
            repository: repository.to_string(),
            branch: trigger.branch.clone(),
            commit: trigger.commit.clone(),
            location: format!("snapshot://{repository}@{}", trigger.commit),
        })
    }
}

/// Tags images `<commit7>-b<n>` and keeps the list of pushed images.
#[derive(Debug, Default)]
pub struct TagImageBuilder {
    builds: AtomicU64,
    fail: AtomicBool,
    pushed: Mutex<Vec<ImageArtifact>>,
}

impl TagImageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following build fail.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }

    pub async fn pushed(&self) -> Vec<ImageArtifact> {
        self.pushed.lock().await.clone()
    }
}

#[async_trait]
impl ImageBuilder for TagImageBuilder {
    async fn build(
        &self,
        source: &SourceArtifact,
        ctx: BuildContext<'_>,
    ) -> anyhow::Result<ImageArtifact> {
        ensure!(
            ctx.identity.allows(Permission::PushImage) && ctx.identity.repository == ctx.repository,
            "build identity cannot push to {}",
            ctx.repository
        );
        if self.fail.load(Ordering::Relaxed) {
            bail!("build of {} failed", source.commit);
        }

        let n = self.builds.fetch_add(1, Ordering::Relaxed) + 1;
        let short: String = source.commit.chars().take(7).collect();
        let artifact = ImageArtifact {
            image: ImageRef::new(ctx.repository, format!("{short}-b{n}")),
            build_id: format!("build-{n:04}"),
        };
        self.pushed.lock().await.push(artifact.clone());
        Ok(artifact)
    }

    async fn discard(&self, image: &ImageArtifact) -> anyhow::Result<()> {
        self.pushed.lock().await.retain(|a| a != image);
        Ok(())
    }
}
