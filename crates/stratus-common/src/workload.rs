use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// cpu units → accepted memory sizes (MiB).
const ACCEPTED_SHAPES: &[(u32, &[u32])] = &[
    (256, &[512, 1024, 2048]),
    (512, &[1024, 2048, 3072, 4096]),
    (1024, &[2048, 3072, 4096, 5120, 6144, 7168, 8192]),
    (2048, &[4096, 5120, 6144, 7168, 8192, 9216, 10240, 11264, 12288, 13312, 14336, 15360, 16384]),
    (
        4096,
        &[
            8192, 9216, 10240, 11264, 12288, 13312, 14336, 15360, 16384, 17408, 18432, 19456,
            20480, 21504, 22528, 23552, 24576, 25600, 26624, 27648, 28672, 29696, 30720,
        ],
    ),
];

/// Whether the compute backend accepts this cpu/memory combination.
pub fn is_accepted_shape(cpu: u32, memory_mib: u32) -> bool {
    ACCEPTED_SHAPES
        .iter()
        .any(|(c, mems)| *c == cpu && mems.contains(&memory_mib))
}

pub fn accepted_shapes() -> impl Iterator<Item = (u32, u32)> {
    ACCEPTED_SHAPES
        .iter()
        .flat_map(|(c, mems)| mems.iter().map(move |m| (*c, *m)))
}

/// `repository:tag`, e.g. `123456789012.dkr.ecr.eu-west-1.amazonaws.com/web:build-42`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    pub repository: String,
    pub tag: String,
}

impl ImageRef {
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

impl FromStr for ImageRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let name_start = s.rfind('/').map(|i| i + 1).unwrap_or(0);
        match s[name_start..].rfind(':') {
            Some(i) => {
                let split = name_start + i;
                let (repo, tag) = (&s[..split], &s[split + 1..]);
                if repo.is_empty() || tag.is_empty() {
                    return Err(Error::InvalidConfig(format!("invalid image reference '{s}'")));
                }
                Ok(Self::new(repo, tag))
            }
            None if !s.is_empty() => Ok(Self::new(s, "latest")),
            None => Err(Error::InvalidConfig("empty image reference".into())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogDestination {
    pub group: String,
    pub stream_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: ImageRef,
    pub port: u16,
    pub environment: BTreeMap<String, String>,
    pub log: LogDestination,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: ImageRef, port: u16, log: LogDestination) -> Self {
        Self {
            name: name.into(),
            image,
            port,
            environment: BTreeMap::new(),
            log,
        }
    }

    /// Add environment variables. A key given twice is rejected.
    pub fn with_env<I, K, V>(mut self, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            let k = k.into();
            if self.environment.contains_key(&k) {
                return Err(Error::InvalidConfig(format!(
                    "container {}: duplicate environment key {k}",
                    self.name
                )));
            }
            self.environment.insert(k, v.into());
        }
        Ok(self)
    }
}

/// Identifies one immutable workload definition, rendered `family:revision`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkloadRef {
    pub family: String,
    pub revision: u32,
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.family, self.revision)
    }
}

/// One task's resource shape and containers. Immutable; a deploy creates the
/// next revision instead of editing this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkloadDefinition {
    family: String,
    revision: u32,
    cpu: u32,
    memory_mib: u32,
    containers: Vec<ContainerSpec>,
}

impl WorkloadDefinition {
    pub fn define(
        family: impl Into<String>,
        revision: u32,
        cpu: u32,
        memory_mib: u32,
        containers: Vec<ContainerSpec>,
    ) -> Result<Self> {
        let family = family.into();
        let invalid = |reason: String| Error::InvalidResourceShape {
            family: family.clone(),
            cpu,
            memory_mib,
            reason,
        };

        if containers.is_empty() {
            return Err(invalid("at least one container is required".into()));
        }
        if !is_accepted_shape(cpu, memory_mib) {
            return Err(invalid("unsupported cpu/memory combination".into()));
        }
        for (i, c) in containers.iter().enumerate() {
            if c.name.is_empty() {
                return Err(invalid(format!("container #{i} has no name")));
            }
            if c.port == 0 {
                return Err(invalid(format!("container {} has no port", c.name)));
            }
            if containers[..i].iter().any(|o| o.name == c.name) {
                return Err(invalid(format!("container name {} is used twice", c.name)));
            }
        }

        Ok(Self {
            family,
            revision,
            cpu,
            memory_mib,
            containers,
        })
    }

    pub fn reference(&self) -> WorkloadRef {
        WorkloadRef {
            family: self.family.clone(),
            revision: self.revision,
        }
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub fn cpu(&self) -> u32 {
        self.cpu
    }

    pub fn memory_mib(&self) -> u32 {
        self.memory_mib
    }

    pub fn containers(&self) -> &[ContainerSpec] {
        &self.containers
    }

    /// The container the load balancer targets.
    pub fn primary(&self) -> &ContainerSpec {
        &self.containers[0]
    }

    /// Next revision of this family with the primary container running `image`.
    pub fn with_image(&self, image: ImageRef) -> Result<Self> {
        let mut containers = self.containers.clone();
        containers[0].image = image;
        Self::define(
            self.family.clone(),
            self.revision + 1,
            self.cpu,
            self.memory_mib,
            containers,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(name: &str) -> ContainerSpec {
        ContainerSpec::new(
            name,
            ImageRef::new("registry.local/web", "v1"),
            5000,
            LogDestination {
                group: "/stratus/web".into(),
                stream_prefix: "web".into(),
            },
        )
    }

    #[test]
    fn test_every_accepted_shape_defines() {
        for (cpu, mem) in accepted_shapes() {
            assert!(
                WorkloadDefinition::define("web", 1, cpu, mem, vec![container("app")]).is_ok(),
                "cpu={cpu} mem={mem}"
            );
        }
    }

    #[test]
    fn test_rejected_shapes() {
        for (cpu, mem) in [(256, 4096), (512, 512), (100, 512), (1024, 1024), (4096, 31744), (0, 0)] {
            let err = WorkloadDefinition::define("web", 1, cpu, mem, vec![container("app")]);
            assert!(
                matches!(err, Err(Error::InvalidResourceShape { .. })),
                "cpu={cpu} mem={mem}"
            );
        }
    }

    #[test]
    fn test_empty_container_list_rejected() {
        assert!(matches!(
            WorkloadDefinition::define("web", 1, 256, 512, vec![]),
            Err(Error::InvalidResourceShape { .. })
        ));
    }

    #[test]
    fn test_duplicate_env_key_rejected() {
        let c = container("app").with_env([("IS_PRODUCTION", "true")]).unwrap();
        assert!(c.with_env([("IS_PRODUCTION", "false")]).is_err());
    }

    #[test]
    fn test_with_image_creates_next_revision() {
        let v1 = WorkloadDefinition::define("web", 1, 512, 1024, vec![container("app")]).unwrap();
        let v2 = v1.with_image(ImageRef::new("registry.local/web", "build-7")).unwrap();
        assert_eq!(v2.reference().to_string(), "web:2");
        assert_eq!(v2.primary().image.tag, "build-7");
        assert_eq!(v1.primary().image.tag, "v1");
    }

    #[test]
    fn test_image_ref_parse() {
        let r: ImageRef = "localhost:5000/web:abc".parse().unwrap();
        assert_eq!(r.repository, "localhost:5000/web");
        assert_eq!(r.tag, "abc");
        let r: ImageRef = "localhost:5000/web".parse().unwrap();
        assert_eq!(r.tag, "latest");
    }
}
