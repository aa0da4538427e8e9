pub mod local;
pub mod metrics;
pub mod pipeline;
pub mod stages;

pub use local::{LocalSourceFetcher, StaticSecretStore, TagImageBuilder};
pub use metrics::PipelineMetrics;
pub use pipeline::{Collaborators, Pipeline, PipelineSettings, TriggerOutcome};
pub use stages::{BuildContext, DeployTarget, ImageBuilder, Secret, SecretStore, SourceFetcher};
