use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The two identities the deployment hands out. They are never merged.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Principal {
    /// Assumed by running replicas.
    Execution,
    /// Assumed by the build stage of the release pipeline only.
    Build,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    PullImage,
    PushImage,
    ReadRepositoryMetadata,
    WriteRepositoryMetadata,
    WriteLogs,
}

impl Permission {
    /// Permissions that can alter what an image reference resolves to.
    pub fn mutates_images(self) -> bool {
        matches!(self, Permission::PushImage | Permission::WriteRepositoryMetadata)
    }
}

/// Permissions granted to one principal, scoped to one image repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessPolicy {
    pub principal: Principal,
    pub repository: String,
    pub permissions: BTreeSet<Permission>,
}

impl AccessPolicy {
    pub fn execution(repository: &str) -> Self {
        Self {
            principal: Principal::Execution,
            repository: repository.to_string(),
            permissions: [Permission::PullImage, Permission::WriteLogs].into(),
        }
    }

    pub fn build(repository: &str) -> Self {
        Self {
            principal: Principal::Build,
            repository: repository.to_string(),
            permissions: [
                Permission::PullImage,
                Permission::PushImage,
                Permission::ReadRepositoryMetadata,
                Permission::WriteRepositoryMetadata,
                Permission::WriteLogs,
            ]
            .into(),
        }
    }

    pub fn allows(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    /// A running workload must not be able to overwrite its own image.
    pub fn validate(&self) -> Result<()> {
        if self.principal == Principal::Execution {
            if let Some(p) = self.permissions.iter().find(|p| p.mutates_images()) {
                return Err(Error::InvalidConfig(format!(
                    "execution identity must not hold {p:?}"
                )));
            }
        }
        Ok(())
    }
}

/// Validate a pair of policies: distinct principals, each individually sound.
pub fn validate_pair(execution: &AccessPolicy, build: &AccessPolicy) -> Result<()> {
    if execution.principal != Principal::Execution || build.principal != Principal::Build {
        return Err(Error::InvalidConfig(
            "execution and build policies must be attached to distinct identities".into(),
        ));
    }
    execution.validate()?;
    build.validate()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_cannot_push() {
        let exec = AccessPolicy::execution("repo/web");
        assert!(exec.allows(Permission::PullImage));
        assert!(exec.allows(Permission::WriteLogs));
        assert!(!exec.allows(Permission::PushImage));
        assert!(exec.validate().is_ok());

        let mut widened = exec.clone();
        widened.permissions.insert(Permission::PushImage);
        assert!(widened.validate().is_err());
    }

    #[test]
    fn test_pair_must_be_distinct() {
        let exec = AccessPolicy::execution("repo/web");
        let build = AccessPolicy::build("repo/web");
        assert!(validate_pair(&exec, &build).is_ok());
        assert!(validate_pair(&build, &build).is_err());
    }
}
