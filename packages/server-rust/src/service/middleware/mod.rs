//! Tower middleware layers for the invocation pipeline.
//!
//! - [`timeout`]: Per-invocation timeout enforcement
//! - [`metrics`]: Invocation timing and counting via `tracing` spans and `metrics`
//! - [`pipeline`]: Composes all layers around a dispatch table

pub mod metrics;
pub mod pipeline;
pub mod timeout;

pub use metrics::MetricsLayer;
pub use pipeline::{build_invocation_pipeline, InvocationPipeline};
pub use timeout::TimeoutLayer;
