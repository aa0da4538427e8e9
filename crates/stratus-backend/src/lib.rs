pub mod memory;
pub mod types;

pub use memory::{MemoryBackend, Operation};
pub use types::{
    Backend, BackendError, HealthCheck, ReplicaEvent, ReplicaId, ReplicaInfo, ReplicaStatus,
    ReplicaStream, ResourceHandle, ResourceKind, ResourceRequest,
};
