pub mod admin;
pub mod context;
pub mod target;

pub use admin::{router, AdminState};
pub use context::{DeploymentContext, ReleaseStages};
pub use target::ServiceDeployTarget;
