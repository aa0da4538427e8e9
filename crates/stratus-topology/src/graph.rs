use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use serde::Serialize;

use stratus_backend::{ResourceKind, ResourceRequest};
use stratus_common::{Error, Result};

#[derive(Debug, Clone, Serialize)]
pub struct ResourceNode {
    pub key: String,
    pub request: ResourceRequest,
    pub depends_on: Vec<String>,
}

impl ResourceNode {
    pub fn kind(&self) -> ResourceKind {
        self.request.kind()
    }
}

/// Resources and their "depends on" edges. A node may only reference nodes
/// already in the graph, so the graph is acyclic by construction.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResourceGraph {
    nodes: Vec<ResourceNode>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl ResourceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: impl Into<String>, request: ResourceRequest) -> Result<()> {
        let key = key.into();
        if self.index.contains_key(&key) {
            return Err(Error::InvalidConfig(format!("resource {key} declared twice")));
        }
        let depends_on: Vec<String> = request.references().into_iter().map(String::from).collect();
        if let Some(missing) = depends_on.iter().find(|d| !self.index.contains_key(*d)) {
            return Err(Error::InvalidConfig(format!(
                "resource {key} depends on undeclared resource {missing}"
            )));
        }
        self.index.insert(key.clone(), self.nodes.len());
        self.nodes.push(ResourceNode {
            key,
            request,
            depends_on,
        });
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&ResourceNode> {
        self.index.get(key).map(|&i| &self.nodes[i])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Keys of resources that reference `key` directly.
    pub fn dependents(&self, key: &str) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.depends_on.iter().any(|d| d == key))
            .map(|n| n.key.as_str())
            .collect()
    }

    /// Topological order (Kahn). Ties go to the node declared first.
    pub fn creation_order(&self) -> Vec<&ResourceNode> {
        let mut in_degree: Vec<usize> = self.nodes.iter().map(|n| n.depends_on.len()).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for (i, node) in self.nodes.iter().enumerate() {
            for dep in &node.depends_on {
                if let Some(&d) = self.index.get(dep) {
                    dependents[d].push(i);
                }
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &deg)| deg == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(i)) = ready.pop() {
            order.push(&self.nodes[i]);
            for &next in &dependents[i] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }
        order
    }

    pub fn teardown_order(&self) -> Vec<&ResourceNode> {
        let mut order = self.creation_order();
        order.reverse();
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_common::{AccessPolicy, LogDestination};

    fn log_group(name: &str) -> ResourceRequest {
        ResourceRequest::LogGroup {
            destination: LogDestination {
                group: name.into(),
                stream_prefix: name.into(),
            },
        }
    }

    #[test]
    fn test_undeclared_dependency_rejected() {
        let mut g = ResourceGraph::new();
        let err = g
            .add("cluster", ResourceRequest::Cluster { network: "network".into() })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert!(g.is_empty());
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut g = ResourceGraph::new();
        g.add("logs", log_group("a")).unwrap();
        assert!(g.add("logs", log_group("b")).is_err());
    }

    #[test]
    fn test_dependencies_come_first() {
        let mut g = ResourceGraph::new();
        g.add("logs", log_group("a")).unwrap();
        g.add(
            "identity",
            ResourceRequest::Identity {
                policy: AccessPolicy::execution("repo"),
            },
        )
        .unwrap();
        g.add("other-logs", log_group("b")).unwrap();

        let order: Vec<&str> = g.creation_order().iter().map(|n| n.key.as_str()).collect();
        assert_eq!(order, vec!["logs", "identity", "other-logs"]);

        let teardown: Vec<&str> = g.teardown_order().iter().map(|n| n.key.as_str()).collect();
        assert_eq!(teardown, vec!["other-logs", "identity", "logs"]);
    }
}
