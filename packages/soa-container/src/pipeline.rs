//! The request pipeline: one decoded request in, one response (or error
//! response) out, followed by metrics and cleanup.
//!
//! ```text
//! accept ──► [dispatch] ──► process ──► respond | respond_error ──► finish
//!   │                                                                 │
//!   └─ decode failure: frame released, no response        release, metrics,
//!                                                          access log, drop ctx
//! ```
//!
//! Everything past `accept` is infallible from the caller's point of view:
//! processor errors, encode and write failures, and panics raised by the
//! processor, the codec or the response sink are all turned into a failed
//! call here and never reach the transport.

use std::fmt;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use soa_core::frame::{request_size, LENGTH_PREFIX_SIZE};
use soa_core::{
    CodecError, MessageType, ProcessError, ProtocolCodec, Reply, RequestContext, SoaBaseCode,
    SoaHeader,
};
use tracing::{debug, error, info, info_span, warn, Span};

use crate::buffer::InputFrame;
use crate::metrics::{CallSample, MetricsAggregator};
use crate::network::shutdown::InFlightGuard;
use crate::pool::PoolError;
use crate::registry::ProcessorRegistry;

/// Target of the one-line-per-request access log.
pub const ACCESS_LOG_TARGET: &str = "soa_container::access";

// ---------------------------------------------------------------------------
// Response sink
// ---------------------------------------------------------------------------

/// Why a response frame could not be handed to the connection.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("connection closed")]
    Closed,
}

/// Destination for encoded response frames. Implementations must be usable
/// from any thread, must not block and must not drop a frame while the
/// connection is open.
pub trait ResponseSink: Send + Sync {
    /// Queues one complete frame for the peer.
    ///
    /// # Errors
    ///
    /// Returns `WriteError` when the frame cannot be queued.
    fn write(&self, frame: Bytes) -> Result<(), WriteError>;
}

/// Endpoints of the connection a request arrived on, for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub peer: Option<SocketAddr>,
    pub local: Option<SocketAddr>,
}

struct Endpoint(Option<SocketAddr>);

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(addr) => write!(f, "{addr}"),
            None => f.write_str("-"),
        }
    }
}

// ---------------------------------------------------------------------------
// PendingRequest
// ---------------------------------------------------------------------------

/// A decoded request and everything needed to answer it. Moved, never
/// shared, from the connection task to whichever executor runs it.
pub struct PendingRequest {
    frame: InputFrame,
    context: RequestContext,
    body: Bytes,
    responder: Arc<dyn ResponseSink>,
    connection: ConnectionInfo,
    in_flight: Option<InFlightGuard>,
}

impl PendingRequest {
    #[must_use]
    pub fn header(&self) -> &SoaHeader {
        self.context.header()
    }

    #[must_use]
    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    /// Keeps the request counted as in flight until it finishes.
    #[must_use]
    pub fn with_in_flight(mut self, guard: InFlightGuard) -> Self {
        self.in_flight = Some(guard);
        self
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("header", self.context.header())
            .field("seq_id", &self.context.seq_id())
            .field("frame_len", &self.frame.len())
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

/// What happened to one request, as recorded in metrics and the access log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOutcome {
    pub succeeded: bool,
    pub resp_code: Option<String>,
    pub resp_message: Option<String>,
    pub request_bytes: u64,
    pub response_bytes: u64,
    pub elapsed_ms: u64,
}

struct Written {
    succeeded: bool,
    response_bytes: u64,
}

impl Written {
    fn failed() -> Self {
        Self {
            succeeded: false,
            response_bytes: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// RequestPipeline
// ---------------------------------------------------------------------------

/// Shared, stateless request pipeline. One instance serves every connection
/// and every worker thread.
pub struct RequestPipeline {
    registry: Arc<ProcessorRegistry>,
    codec: Arc<dyn ProtocolCodec>,
    metrics: Arc<MetricsAggregator>,
}

impl RequestPipeline {
    pub fn new(
        registry: Arc<ProcessorRegistry>,
        codec: Arc<dyn ProtocolCodec>,
        metrics: Arc<MetricsAggregator>,
    ) -> Self {
        Self {
            registry,
            codec,
            metrics,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ProcessorRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<MetricsAggregator> {
        &self.metrics
    }

    /// Decodes the header of a freshly read frame and builds its context.
    ///
    /// # Errors
    ///
    /// Returns the `CodecError` when the frame cannot be decoded. The frame
    /// has been released by then; the caller should close the connection.
    pub fn accept(
        &self,
        frame: InputFrame,
        responder: Arc<dyn ResponseSink>,
        connection: ConnectionInfo,
    ) -> Result<PendingRequest, CodecError> {
        let started_at = Instant::now();
        let bytes = frame.bytes();

        let decoded = match request_size(&bytes) {
            Some(size) => self.codec.decode(bytes).map(|decoded| (size, decoded)),
            None => Err(CodecError::Truncated {
                needed: LENGTH_PREFIX_SIZE,
                available: bytes.len(),
            }),
        };
        let (request_bytes, decoded) = match decoded {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(peer = %Endpoint(connection.peer), error = %err, "failed to decode request header");
                frame.release();
                return Err(err);
            }
        };
        debug!(header = %decoded.header, seq_id = decoded.seq_id, "request header decoded");

        Ok(PendingRequest {
            frame,
            context: RequestContext::new(decoded.header, decoded.seq_id, started_at, request_bytes),
            body: decoded.body,
            responder,
            connection,
            in_flight: None,
        })
    }

    /// Runs a request to completion on the calling thread.
    pub fn process(&self, request: PendingRequest) -> RequestOutcome {
        let span = request_span(&request.context);
        let _entered = span.enter();
        let result = self.invoke(&request.context, request.body.clone());
        self.complete(request, result, &span)
    }

    /// Answers a request the worker pool refused, on the calling thread.
    pub fn reject(&self, request: PendingRequest, reason: PoolError) -> RequestOutcome {
        let span = request_span(&request.context);
        let _entered = span.enter();
        let err = anyhow::Error::new(reason).context("request rejected by worker pool");
        self.complete(request, Err(ProcessError::Unexpected(err)), &span)
    }

    fn invoke(&self, ctx: &RequestContext, body: Bytes) -> Result<Reply, ProcessError> {
        let header = ctx.header();
        let processor = self
            .registry
            .lookup(&header.service_name, &header.version_name)
            .ok_or(ProcessError::from(SoaBaseCode::NOT_FOUND_SERVER))?;

        let started = Instant::now();
        let result = catch_unwind(AssertUnwindSafe(|| processor.process(ctx, body)))
            .unwrap_or_else(|payload| Err(ProcessError::from_panic("processor", payload.as_ref())));
        debug!(
            service = %header.service_name,
            version = %header.version_name,
            method = %header.method_name,
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "provider call finished"
        );
        result
    }

    fn complete(
        &self,
        request: PendingRequest,
        result: Result<Reply, ProcessError>,
        span: &Span,
    ) -> RequestOutcome {
        let PendingRequest {
            frame,
            mut context,
            body,
            responder,
            connection,
            in_flight,
        } = request;
        drop(body);

        let written = self.write_response(&mut context, result, responder.as_ref());

        frame.release();

        let elapsed_ms = u64::try_from(context.elapsed().as_millis()).unwrap_or(u64::MAX);
        let header = context.header();
        self.metrics.update(
            &header.identity(),
            CallSample {
                elapsed_ms,
                succeeded: written.succeeded,
                request_bytes: context.request_bytes(),
                response_bytes: written.response_bytes,
            },
        );

        span.record("elapsed_ms", elapsed_ms);
        span.record("outcome", if written.succeeded { "ok" } else { "error" });
        info!(
            target: ACCESS_LOG_TARGET,
            peer = %Endpoint(connection.peer),
            local = %Endpoint(connection.local),
            seq_id = context.seq_id(),
            call = %header.identity(),
            code = header.resp_code().unwrap_or("-"),
            message = header.resp_message().unwrap_or("-"),
            request_bytes = context.request_bytes(),
            response_bytes = written.response_bytes,
            elapsed_ms,
            "DONE"
        );

        let outcome = RequestOutcome {
            succeeded: written.succeeded,
            resp_code: header.resp_code().map(str::to_string),
            resp_message: header.resp_message().map(str::to_string),
            request_bytes: context.request_bytes(),
            response_bytes: written.response_bytes,
            elapsed_ms,
        };
        drop(context);
        drop(in_flight);
        outcome
    }

    /// Sends the reply or the error response. A panic in the codec or the
    /// sink turns into one error-response attempt; a second panic leaves the
    /// call unanswered and failed.
    fn write_response(
        &self,
        ctx: &mut RequestContext,
        result: Result<Reply, ProcessError>,
        responder: &dyn ResponseSink,
    ) -> Written {
        let attempt = catch_unwind(AssertUnwindSafe(|| match result {
            Ok(reply) => self.respond(ctx, reply, responder),
            Err(err) => self.respond_error(ctx, &err, responder),
        }));
        let payload = match attempt {
            Ok(written) => return written,
            Err(payload) => payload,
        };

        let err = ProcessError::from_panic("response writer", payload.as_ref());
        catch_unwind(AssertUnwindSafe(|| self.respond_error(ctx, &err, responder))).unwrap_or_else(
            |_| {
                error!(header = %ctx.header(), "error response panicked, leaving the call unanswered");
                Written::failed()
            },
        )
    }

    fn respond(&self, ctx: &mut RequestContext, reply: Reply, responder: &dyn ResponseSink) -> Written {
        let Reply {
            body,
            resp_code,
            resp_message,
        } = reply;
        ctx.header_mut().set_response(resp_code, resp_message);

        let frame = match self
            .codec
            .encode(ctx.header(), ctx.seq_id(), MessageType::Reply, &body)
        {
            Ok(frame) => frame,
            Err(err) => {
                let err = anyhow::Error::new(err).context("failed to encode response");
                return self.respond_error(ctx, &ProcessError::Unexpected(err), responder);
            }
        };

        let response_bytes = frame.len() as u64;
        match responder.write(frame) {
            Ok(()) => Written {
                succeeded: true,
                response_bytes,
            },
            Err(err) => {
                error!(header = %ctx.header(), error = %err, "failed to write response");
                Written::failed()
            }
        }
    }

    /// Best effort: every failure here is logged and swallowed.
    fn respond_error(
        &self,
        ctx: &mut RequestContext,
        err: &ProcessError,
        responder: &dyn ResponseSink,
    ) -> Written {
        match err {
            ProcessError::Domain(soa) => {
                error!(header = %ctx.header(), code = %soa.code, message = %soa.message, "request failed");
            }
            ProcessError::Unexpected(cause) => {
                let detail = format!("{cause:#}");
                error!(header = %ctx.header(), error = %detail, "request failed unexpectedly");
            }
        }

        let mapped = err.to_soa_error();
        ctx.header_mut()
            .set_response(Some(mapped.code), Some(mapped.message));

        let frame = match self
            .codec
            .encode(ctx.header(), ctx.seq_id(), MessageType::Reply, &[])
        {
            Ok(frame) => frame,
            Err(encode_err) => {
                error!(header = %ctx.header(), error = %encode_err, "failed to encode error response");
                return Written::failed();
            }
        };

        let response_bytes = frame.len() as u64;
        match responder.write(frame) {
            Ok(()) => {
                info!("response header:{} body:{{null}}", ctx.header());
                Written {
                    succeeded: false,
                    response_bytes,
                }
            }
            Err(write_err) => {
                error!(header = %ctx.header(), error = %write_err, "failed to write error response");
                Written::failed()
            }
        }
    }
}

fn request_span(ctx: &RequestContext) -> Span {
    info_span!(
        "soa_request",
        service = %ctx.header().service_name,
        method = %ctx.header().method_name,
        version = %ctx.header().version_name,
        seq_id = ctx.seq_id(),
        elapsed_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    )
}

impl fmt::Debug for RequestPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestPipeline")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
