pub mod blueprint;
pub mod graph;
pub mod provisioner;
pub mod retry;

pub use blueprint::{Blueprint, ListenerPlan, ResourceKeys};
pub use graph::{ResourceGraph, ResourceNode};
pub use provisioner::{ProvisionedTopology, Provisioner};
pub use retry::{retry_transient, RetryConfig};
