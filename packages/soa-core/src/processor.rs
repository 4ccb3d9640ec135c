//! Processor contract: the server-side capability behind one service.

use std::sync::Arc;

use bytes::Bytes;

use crate::context::RequestContext;
use crate::error::ProcessError;

/// Successful result of a processor invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    /// Encoded response body, opaque to the container.
    pub body: Bytes,
    /// Optional response code to place in the response header.
    pub resp_code: Option<String>,
    /// Optional response message to place in the response header.
    pub resp_message: Option<String>,
}

impl Reply {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            resp_code: None,
            resp_message: None,
        }
    }

    #[must_use]
    pub fn with_status(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.resp_code = Some(code.into());
        self.resp_message = Some(message.into());
        self
    }
}

/// Executes one service's business logic.
///
/// `process` may block for as long as the business logic needs: the
/// container runs it either on the connection task or on a worker thread,
/// depending on the dispatch policy. Returning `ProcessError::Domain` sends
/// the caller its code and message; anything else is reported as unknown.
pub trait Processor: Send + Sync + 'static {
    /// Fully qualified interface name the processor is registered under.
    fn interface_name(&self) -> &str;

    /// Declared service version.
    fn version(&self) -> &str;

    /// Consumes the decoded request body and produces the encoded reply.
    ///
    /// # Errors
    ///
    /// Returns `ProcessError` when the call fails.
    fn process(&self, ctx: &RequestContext, request: Bytes) -> Result<Reply, ProcessError>;
}

/// Adapter that turns a closure into a [`Processor`].
pub struct FnProcessor<F> {
    interface_name: String,
    version: String,
    handler: F,
}

impl<F> FnProcessor<F>
where
    F: Fn(&RequestContext, Bytes) -> Result<Reply, ProcessError> + Send + Sync + 'static,
{
    pub fn new(interface_name: impl Into<String>, version: impl Into<String>, handler: F) -> Self {
        Self {
            interface_name: interface_name.into(),
            version: version.into(),
            handler,
        }
    }

    /// Boxes the adapter for registration.
    #[must_use]
    pub fn shared(self) -> Arc<dyn Processor> {
        Arc::new(self)
    }
}

impl<F> Processor for FnProcessor<F>
where
    F: Fn(&RequestContext, Bytes) -> Result<Reply, ProcessError> + Send + Sync + 'static,
{
    fn interface_name(&self) -> &str {
        &self.interface_name
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn process(&self, ctx: &RequestContext, request: Bytes) -> Result<Reply, ProcessError> {
        (self.handler)(ctx, request)
    }
}
