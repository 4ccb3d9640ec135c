//! The container: owns every long-lived piece of the request path and
//! drives its lifecycle.
//!
//! 1. `build()` creates the processor registry, metrics aggregator, worker
//!    pool, pipeline and (unbound) server.
//! 2. `start()` binds the listener, announces every served
//!    `(service, version)` to the registry agent and starts the metrics
//!    reporter.
//! 3. `serve()` runs until the shutdown future resolves, withdraws the
//!    announcements, drains in-flight requests, stops the reporter (final
//!    flush) and joins the worker pool.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use soa_core::{MsgPackProtocol, Processor, ProtocolCodec, ServiceIdentity};
use tracing::{error, info, warn};

use crate::buffer::BufferTracker;
use crate::config::ContainerConfig;
use crate::dispatch::{DispatchPolicy, DynamicConfig, StaticConfigSource};
use crate::handler::RequestHandler;
use crate::metrics::{MetricsAggregator, ProcessRecord};
use crate::network::{ServerSettings, ShutdownController, SoaServer};
use crate::pipeline::RequestPipeline;
use crate::pool::PoolError;
use crate::registry::{NoopRegistryAgent, ProcessorRegistry, RegistryAgent};
use crate::reporter::{MetricsReporter, MetricsSink, TracingSink};

/// Errors raised while assembling or starting a container.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("failed to start worker pool: {0}")]
    Pool(#[from] PoolError),
    #[error("container has no processors")]
    NoProcessors,
    #[error("serve() called before start()")]
    NotStarted,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Collects the container's collaborators; anything not set gets a default.
pub struct SoaContainerBuilder {
    config: ContainerConfig,
    processors: Vec<Arc<dyn Processor>>,
    dynamic_config: Option<Arc<dyn DynamicConfig>>,
    registry_agent: Option<Arc<dyn RegistryAgent>>,
    codec: Option<Arc<dyn ProtocolCodec>>,
    metrics_sink: Option<Arc<dyn MetricsSink>>,
}

impl SoaContainerBuilder {
    #[must_use]
    pub fn processor(mut self, processor: Arc<dyn Processor>) -> Self {
        self.processors.push(processor);
        self
    }

    #[must_use]
    pub fn processors(mut self, processors: impl IntoIterator<Item = Arc<dyn Processor>>) -> Self {
        self.processors.extend(processors);
        self
    }

    /// Defaults to an empty [`StaticConfigSource`].
    #[must_use]
    pub fn dynamic_config(mut self, config: Arc<dyn DynamicConfig>) -> Self {
        self.dynamic_config = Some(config);
        self
    }

    /// Defaults to [`NoopRegistryAgent`].
    #[must_use]
    pub fn registry_agent(mut self, agent: Arc<dyn RegistryAgent>) -> Self {
        self.registry_agent = Some(agent);
        self
    }

    /// Defaults to [`MsgPackProtocol`].
    #[must_use]
    pub fn codec(mut self, codec: Arc<dyn ProtocolCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Defaults to [`TracingSink`].
    #[must_use]
    pub fn metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics_sink = Some(sink);
        self
    }

    /// Assembles the container. Worker threads are started here.
    ///
    /// # Errors
    ///
    /// Returns `ContainerError::NoProcessors` when nothing was registered and
    /// `ContainerError::Pool` when the worker pool cannot be created.
    pub fn build(self) -> Result<SoaContainer, ContainerError> {
        if self.processors.is_empty() {
            return Err(ContainerError::NoProcessors);
        }

        let registry = Arc::new(ProcessorRegistry::from_processors(self.processors));
        let metrics = Arc::new(MetricsAggregator::new());
        let codec = self.codec.unwrap_or_else(|| Arc::new(MsgPackProtocol));
        let pipeline = Arc::new(RequestPipeline::new(
            Arc::clone(&registry),
            codec,
            Arc::clone(&metrics),
        ));

        let pool = if self.config.use_thread_pool {
            let pool = RequestHandler::start_pool(
                &pipeline,
                self.config.core_pool_size,
                self.config.pool_queue_capacity,
            )?;
            info!(
                threads = pool.size(),
                prefix = pool.name_prefix(),
                queue_capacity = self.config.pool_queue_capacity,
                "request worker pool ready"
            );
            Some(pool)
        } else {
            None
        };
        let dynamic_config = self
            .dynamic_config
            .unwrap_or_else(|| Arc::new(StaticConfigSource::new()));
        let policy = DispatchPolicy::new(self.config.use_thread_pool, dynamic_config);
        let handler = Arc::new(RequestHandler::new(policy, pipeline, pool));

        let buffers = BufferTracker::new();
        let server = SoaServer::new(
            ServerSettings::from(&self.config),
            Arc::clone(&handler),
            buffers.clone(),
        );

        info!(
            processors = registry.len(),
            use_thread_pool = self.config.use_thread_pool,
            "container assembled"
        );

        Ok(SoaContainer {
            report_interval: Duration::from_millis(self.config.metrics_report_interval_ms),
            registry,
            metrics,
            buffers,
            handler,
            shutdown: server.shutdown_controller(),
            server,
            registry_agent: self
                .registry_agent
                .unwrap_or_else(|| Arc::new(NoopRegistryAgent)),
            metrics_sink: self.metrics_sink.unwrap_or_else(|| Arc::new(TracingSink)),
            reporter: None,
        })
    }
}

// ---------------------------------------------------------------------------
// SoaContainer
// ---------------------------------------------------------------------------

pub struct SoaContainer {
    report_interval: Duration,
    registry: Arc<ProcessorRegistry>,
    metrics: Arc<MetricsAggregator>,
    buffers: BufferTracker,
    handler: Arc<RequestHandler>,
    shutdown: Arc<ShutdownController>,
    server: SoaServer,
    registry_agent: Arc<dyn RegistryAgent>,
    metrics_sink: Arc<dyn MetricsSink>,
    reporter: Option<MetricsReporter>,
}

impl SoaContainer {
    #[must_use]
    pub fn builder(config: ContainerConfig) -> SoaContainerBuilder {
        SoaContainerBuilder {
            config,
            processors: Vec::new(),
            dynamic_config: None,
            registry_agent: None,
            codec: None,
            metrics_sink: None,
        }
    }

    /// Shorthand for the builder with the default codec and metrics sink.
    ///
    /// # Errors
    ///
    /// See [`SoaContainerBuilder::build`].
    pub fn new(
        config: ContainerConfig,
        processors: impl IntoIterator<Item = Arc<dyn Processor>>,
        dynamic_config: Arc<dyn DynamicConfig>,
        registry_agent: Arc<dyn RegistryAgent>,
    ) -> Result<Self, ContainerError> {
        Self::builder(config)
            .processors(processors)
            .dynamic_config(dynamic_config)
            .registry_agent(registry_agent)
            .build()
    }

    /// Binds the listener, announces the served services and starts the
    /// metrics reporter. Returns the bound port.
    ///
    /// Announcement failures are logged and do not prevent serving.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let port = self.server.start().await?;

        for key in self.registry.keys() {
            match self
                .registry_agent
                .register_service(&key.service_name, &key.version_name)
                .await
            {
                Ok(()) => info!(service = %key, "service registered"),
                Err(err) => error!(service = %key, error = %format!("{err:#}"), "failed to register service"),
            }
        }

        if self.reporter.is_none() {
            self.reporter = Some(MetricsReporter::start(
                Arc::clone(&self.metrics),
                Arc::clone(&self.metrics_sink),
                self.report_interval,
            ));
        }

        info!(port, "container started");
        Ok(port)
    }

    /// Serves until `shutdown` resolves, then tears everything down.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called first.
    pub async fn serve(self, shutdown: impl Future<Output = ()> + Send) -> anyhow::Result<()> {
        let Self {
            server,
            reporter,
            registry_agent: agent,
            handler,
            buffers,
            ..
        } = self;
        let Some(mut reporter) = reporter else {
            return Err(ContainerError::NotStarted.into());
        };

        let withdraw_then_drain = async move {
            shutdown.await;
            info!("shutdown requested");
            if let Err(err) = agent.unregister_all().await {
                warn!(error = %format!("{err:#}"), "failed to unregister services");
            }
        };
        let served = server.serve(withdraw_then_drain).await;

        reporter.stop().await;
        if let Err(err) = tokio::task::spawn_blocking(move || handler.shutdown_pool()).await {
            warn!(error = %err, "worker pool shutdown failed");
        }

        info!(outstanding_buffers = buffers.outstanding(), "container stopped");
        served
    }

    /// Current per-service records, sorted by identity.
    #[must_use]
    pub fn metrics_snapshot(&self) -> Vec<(ServiceIdentity, ProcessRecord)> {
        self.metrics.snapshot()
    }

    /// Shared handle to the aggregator; stays valid after `serve` consumes
    /// the container.
    #[must_use]
    pub fn metrics(&self) -> Arc<MetricsAggregator> {
        Arc::clone(&self.metrics)
    }

    #[must_use]
    pub fn buffers(&self) -> BufferTracker {
        self.buffers.clone()
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    #[must_use]
    pub fn registry(&self) -> &ProcessorRegistry {
        &self.registry
    }
}

impl std::fmt::Debug for SoaContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoaContainer")
            .field("registry", &self.registry)
            .field("started", &self.reporter.is_some())
            .finish_non_exhaustive()
    }
}
