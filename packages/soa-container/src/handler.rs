//! Per-frame entry point used by the transport: decode, decide where to run,
//! then run inline or hand off to the worker pool.

use std::sync::Arc;

use soa_core::CodecError;
use tracing::trace;

use crate::buffer::InputFrame;
use crate::dispatch::{Dispatch, DispatchPolicy};
use crate::network::shutdown::InFlightGuard;
use crate::pipeline::{ConnectionInfo, PendingRequest, RequestPipeline, ResponseSink};
use crate::pool::{PoolError, Rejected, WorkerPool};

/// Routes decoded requests to the connection task or the worker pool.
#[derive(Debug)]
pub struct RequestHandler {
    policy: DispatchPolicy,
    pipeline: Arc<RequestPipeline>,
    pool: Option<Arc<WorkerPool<PendingRequest>>>,
}

impl RequestHandler {
    /// `pool` is `None` when pooled execution is disabled; every request
    /// then runs inline whatever the policy says.
    #[must_use]
    pub fn new(
        policy: DispatchPolicy,
        pipeline: Arc<RequestPipeline>,
        pool: Option<Arc<WorkerPool<PendingRequest>>>,
    ) -> Self {
        Self {
            policy,
            pipeline,
            pool,
        }
    }

    /// Starts a worker pool whose workers run `pipeline`.
    ///
    /// # Errors
    ///
    /// Returns `PoolError` if the pool cannot be created.
    pub fn start_pool(
        pipeline: &Arc<RequestPipeline>,
        size: usize,
        queue_capacity: usize,
    ) -> Result<Arc<WorkerPool<PendingRequest>>, PoolError> {
        let pipeline = Arc::clone(pipeline);
        let pool = WorkerPool::start(size, queue_capacity, move |request: PendingRequest| {
            pipeline.process(request);
        })?;
        Ok(Arc::new(pool))
    }

    /// Handles one complete frame read from a connection.
    ///
    /// Returns where the request was sent. A pooled request may still be
    /// running when this returns.
    ///
    /// # Errors
    ///
    /// Returns the `CodecError` when the header cannot be decoded; the frame
    /// is already released and nothing was written.
    pub fn on_frame(
        &self,
        frame: InputFrame,
        responder: Arc<dyn ResponseSink>,
        connection: ConnectionInfo,
        in_flight: InFlightGuard,
    ) -> Result<Dispatch, CodecError> {
        let request = self
            .pipeline
            .accept(frame, responder, connection)?
            .with_in_flight(in_flight);

        let dispatch = match &self.pool {
            Some(pool) => match self.policy.decide(request.header()) {
                Dispatch::Pooled => {
                    if let Err(Rejected { task, reason }) = pool.submit(request) {
                        self.pipeline.reject(task, reason);
                    }
                    Dispatch::Pooled
                }
                Dispatch::Inline => {
                    self.pipeline.process(request);
                    Dispatch::Inline
                }
            },
            None => {
                self.pipeline.process(request);
                Dispatch::Inline
            }
        };
        trace!(?dispatch, "request dispatched");
        Ok(dispatch)
    }

    #[must_use]
    pub fn pipeline(&self) -> &Arc<RequestPipeline> {
        &self.pipeline
    }

    /// Stops the worker pool, finishing queued requests first. Blocks.
    pub fn shutdown_pool(&self) {
        if let Some(pool) = &self.pool {
            pool.shutdown();
        }
    }
}
