pub mod autoscaler;
pub mod controller;
pub mod metrics;
pub mod scaling;
pub mod source;

pub use autoscaler::{Autoscaler, AutoscalerState, ScaleAction, ScaleDirection};
pub use controller::ServiceController;
pub use metrics::ServiceMetrics;
pub use scaling::{autoscale_once, autoscaler_loop, TickOutcome};
pub use source::{ManualMetric, MetricSource};
