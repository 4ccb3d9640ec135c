//! Periodic export of per-service call statistics.
//!
//! A background task wakes every report interval, takes (and resets) the
//! aggregator's records and hands them to a [`MetricsSink`]. Stopping the
//! reporter performs one last flush so no period is lost.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use soa_core::ServiceIdentity;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::metrics::{MetricsAggregator, ProcessRecord};

/// Records gathered for one reporting period.
pub type MetricsBatch = Vec<(ServiceIdentity, ProcessRecord)>;

// ---------------------------------------------------------------------------
// MetricsSink
// ---------------------------------------------------------------------------

/// Destination of periodic metrics batches (a monitoring service, a log).
#[async_trait]
pub trait MetricsSink: Send + Sync + 'static {
    /// Publishes one non-empty batch.
    async fn report(&self, batch: MetricsBatch) -> anyhow::Result<()>;
}

/// Writes each record as a structured `info` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl MetricsSink for TracingSink {
    async fn report(&self, batch: MetricsBatch) -> anyhow::Result<()> {
        for (identity, record) in &batch {
            info!(
                target: "soa_container::metrics",
                call = %identity,
                total_calls = record.total_calls,
                succeeded_calls = record.succeeded_calls,
                failed_calls = record.failed_calls,
                min_latency_ms = record.min_latency_ms,
                max_latency_ms = record.max_latency_ms,
                avg_latency_ms = record.average_latency_ms(),
                request_bytes = record.request_bytes,
                response_bytes = record.response_bytes,
                "service metrics"
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MetricsReporter
// ---------------------------------------------------------------------------

enum Command {
    Flush(oneshot::Sender<usize>),
}

struct Reporting {
    aggregator: Arc<MetricsAggregator>,
    sink: Arc<dyn MetricsSink>,
}

impl Reporting {
    /// Reports whatever accumulated since the last flush; returns the number
    /// of records handed to the sink.
    async fn flush(&self) -> usize {
        let batch = self.aggregator.take_snapshot();
        if batch.is_empty() {
            return 0;
        }
        let count = batch.len();
        match self.sink.report(batch).await {
            Ok(()) => debug!(records = count, "metrics reported"),
            Err(err) => warn!(records = count, error = %format!("{err:#}"), "failed to report metrics"),
        }
        count
    }
}

/// Handle to the background reporting task.
pub struct MetricsReporter {
    commands: Option<mpsc::Sender<Command>>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl MetricsReporter {
    /// Spawns the reporting task. Must be called inside a tokio runtime.
    #[must_use]
    pub fn start(
        aggregator: Arc<MetricsAggregator>,
        sink: Arc<dyn MetricsSink>,
        interval: Duration,
    ) -> Self {
        let (commands, mut command_rx) = mpsc::channel::<Command>(16);
        let (stop, mut stop_rx) = oneshot::channel::<()>();
        let reporting = Reporting { aggregator, sink };

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            // The first tick completes immediately; nothing to report yet.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    command = command_rx.recv() => match command {
                        Some(Command::Flush(reply)) => {
                            let _ = reply.send(reporting.flush().await);
                        }
                        None => break,
                    },
                    _ = ticker.tick() => {
                        reporting.flush().await;
                    }
                }
            }

            let remaining = reporting.flush().await;
            debug!(records = remaining, "metrics reporter stopped");
        });

        Self {
            commands: Some(commands),
            stop: Some(stop),
            task: Some(task),
        }
    }

    /// Reports immediately instead of waiting for the next tick.
    ///
    /// # Errors
    ///
    /// Returns an error if the reporter has been stopped.
    pub async fn flush(&self) -> anyhow::Result<usize> {
        let Some(commands) = &self.commands else {
            anyhow::bail!("metrics reporter not running");
        };
        let (reply, reply_rx) = oneshot::channel();
        commands
            .send(Command::Flush(reply))
            .await
            .map_err(|_| anyhow::anyhow!("metrics reporter channel closed"))?;
        Ok(reply_rx.await?)
    }

    /// Stops the task after a final flush. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.commands.take();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(error = %err, "metrics reporter task failed");
            }
        }
    }
}

impl std::fmt::Debug for MetricsReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsReporter")
            .field("running", &self.task.is_some())
            .finish()
    }
}
