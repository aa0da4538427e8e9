use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use stratus_backend::{Backend, ResourceHandle, ResourceRequest};
use stratus_common::{Error, Result};

use crate::graph::ResourceGraph;
use crate::retry::{retry_transient, RetryConfig};

/// Live handles, in the order they were created.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProvisionedTopology {
    handles: Vec<ResourceHandle>,
}

impl ProvisionedTopology {
    pub fn get(&self, key: &str) -> Option<&ResourceHandle> {
        self.handles.iter().find(|h| h.key == key)
    }

    pub fn handles(&self) -> &[ResourceHandle] {
        &self.handles
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn record(&mut self, handle: ResourceHandle) {
        self.handles.push(handle);
    }

    /// Record a resource that `dependent` relies on, placing it ahead of
    /// `dependent` so teardown deletes it afterwards. Appends when
    /// `dependent` is not recorded.
    pub fn record_before(&mut self, handle: ResourceHandle, dependent: &str) {
        match self.handles.iter().position(|h| h.key == dependent) {
            Some(pos) => self.handles.insert(pos, handle),
            None => self.handles.push(handle),
        }
    }

    pub fn forget(&mut self, key: &str) -> Option<ResourceHandle> {
        let pos = self.handles.iter().position(|h| h.key == key)?;
        Some(self.handles.remove(pos))
    }
}

/// Creates resource graphs against a backend, all or nothing.
#[derive(Clone)]
pub struct Provisioner {
    backend: Arc<dyn Backend>,
    retry: RetryConfig,
}

impl Provisioner {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Create every node in dependency order. If any creation fails, the
    /// resources already created are deleted in reverse order and the error
    /// names the resource that failed.
    pub async fn provision(&self, graph: &ResourceGraph) -> Result<ProvisionedTopology> {
        let mut created = ProvisionedTopology::default();

        for node in graph.creation_order() {
            match self.create_one(&node.key, &node.request).await {
                Ok(handle) => created.record(handle),
                Err(e) => {
                    error!(resource = %node.key, error = %e, "provisioning failed, rolling back");
                    if let Err(rollback) = self.teardown(&mut created).await {
                        warn!(error = %rollback, "rollback left resources behind");
                    }
                    return Err(e);
                }
            }
        }

        info!(resources = created.len(), "topology provisioned");
        Ok(created)
    }

    /// Delete in reverse creation order. Handles that were deleted are
    /// dropped from `topology`; the first failure is returned after every
    /// remaining resource has been attempted.
    pub async fn teardown(&self, topology: &mut ProvisionedTopology) -> Result<()> {
        let mut first_err = None;
        let mut remaining = Vec::new();

        while let Some(handle) = topology.handles.pop() {
            match self.delete_one(&handle).await {
                Ok(()) => {}
                Err(e) => {
                    warn!(resource = %handle.key, error = %e, "teardown step failed");
                    first_err.get_or_insert(e);
                    remaining.push(handle);
                }
            }
        }

        remaining.reverse();
        topology.handles = remaining;
        match first_err {
            Some(e) => Err(e),
            None => {
                info!("topology torn down");
                Ok(())
            }
        }
    }

    pub async fn create_one(&self, key: &str, request: &ResourceRequest) -> Result<ResourceHandle> {
        let op = format!("create {key}");
        let handle = retry_transient(&self.retry, &op, || self.backend.create(key, request))
            .await
            .map_err(|e| Error::provisioning(key, e))?;
        info!(resource = %key, id = %handle.id, kind = %handle.kind, "resource created");
        Ok(handle)
    }

    pub async fn delete_one(&self, handle: &ResourceHandle) -> Result<()> {
        let op = format!("delete {}", handle.key);
        retry_transient(&self.retry, &op, || self.backend.delete(handle))
            .await
            .map_err(|e| Error::provisioning(handle.key.clone(), e))?;
        info!(resource = %handle.key, id = %handle.id, "resource deleted");
        Ok(())
    }
}
