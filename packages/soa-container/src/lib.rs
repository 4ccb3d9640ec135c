//! SOA container: the server-side request path of an RPC provider.
//!
//! Frames arrive over TCP, their headers are decoded, and each request runs
//! either inline on its connection task or on a bounded worker pool,
//! according to a per-method dynamic configuration flag. Every request ends
//! with a response (or a structured error response), one metrics update and
//! the release of its input buffer.

pub mod buffer;
pub mod config;
pub mod container;
pub mod dispatch;
pub mod handler;
pub mod logging;
pub mod metrics;
pub mod network;
pub mod pipeline;
pub mod pool;
pub mod registry;
pub mod reporter;

pub use buffer::{BufferTracker, InputFrame};
pub use config::ContainerConfig;
pub use container::{ContainerError, SoaContainer, SoaContainerBuilder};
pub use dispatch::{
    ConfigError, ConfigKey, ConfigValue, Dispatch, DispatchPolicy, DynamicConfig, ServiceConfig,
    StaticConfigSource,
};
pub use handler::RequestHandler;
pub use logging::{init_tracing, LogFormat};
pub use metrics::{CallSample, MetricsAggregator, ProcessRecord};
pub use pipeline::{
    ConnectionInfo, PendingRequest, RequestOutcome, RequestPipeline, ResponseSink, WriteError,
    ACCESS_LOG_TARGET,
};
pub use pool::{PoolError, Rejected, WorkerPool};
pub use registry::{NoopRegistryAgent, ProcessorRegistry, RegistryAgent};
pub use reporter::{MetricsBatch, MetricsReporter, MetricsSink, TracingSink};

/// Resolves on Ctrl-C; pass to [`SoaContainer::serve`].
pub async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
