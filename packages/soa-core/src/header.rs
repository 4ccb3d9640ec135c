//! Request/response header and the identity keys derived from it.
//!
//! A [`SoaHeader`] is decoded once per request and is immutable afterwards,
//! except for the optional response code/message which the request pipeline
//! sets on the response path.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Suffix appended to `service.version.method` when querying dynamic
/// configuration for the provider side.
pub const PRODUCER_KEY_SUFFIX: &str = "producer";

/// Kind of protocol message carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Request that expects a reply.
    Call,
    /// Reply to a `Call`, successful or carrying an error code.
    Reply,
    /// Protocol-level exception raised before a reply could be produced.
    Exception,
    /// Request without a reply.
    Oneway,
}

/// Decoded addressing and control metadata of a request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoaHeader {
    /// Fully qualified service interface name.
    pub service_name: String,
    /// Exact service version, matched verbatim against registered processors.
    pub version_name: String,
    /// Method invoked on the service.
    pub method_name: String,
    resp_code: Option<String>,
    resp_message: Option<String>,
}

impl SoaHeader {
    /// Creates a request header with no response fields set.
    pub fn new(
        service_name: impl Into<String>,
        version_name: impl Into<String>,
        method_name: impl Into<String>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            version_name: version_name.into(),
            method_name: method_name.into(),
            resp_code: None,
            resp_message: None,
        }
    }

    /// Rebuilds a header as read off the wire, response fields included.
    #[must_use]
    pub fn with_response(
        mut self,
        resp_code: Option<String>,
        resp_message: Option<String>,
    ) -> Self {
        self.resp_code = resp_code;
        self.resp_message = resp_message;
        self
    }

    /// Response code, if the response path has set one.
    #[must_use]
    pub fn resp_code(&self) -> Option<&str> {
        self.resp_code.as_deref()
    }

    /// Response message, if the response path has set one.
    #[must_use]
    pub fn resp_message(&self) -> Option<&str> {
        self.resp_message.as_deref()
    }

    /// Sets the response code and message of the response about to be
    /// encoded. Only the request pipeline calls this.
    pub fn set_response(&mut self, resp_code: Option<String>, resp_message: Option<String>) {
        self.resp_code = resp_code;
        self.resp_message = resp_message;
    }

    /// Dynamic configuration key for this call: `service.version.method.producer`.
    #[must_use]
    pub fn service_key(&self) -> String {
        format!(
            "{}.{}.{}.{PRODUCER_KEY_SUFFIX}",
            self.service_name, self.version_name, self.method_name
        )
    }

    /// Key under which the target processor is registered.
    #[must_use]
    pub fn processor_key(&self) -> ProcessorKey {
        ProcessorKey::new(&self.service_name, &self.version_name)
    }

    /// Identity used to aggregate per-service metrics.
    #[must_use]
    pub fn identity(&self) -> ServiceIdentity {
        ServiceIdentity {
            service_name: self.service_name.clone(),
            method_name: self.method_name.clone(),
            version_name: self.version_name.clone(),
        }
    }
}

impl fmt::Display for SoaHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SoaHeader{{service={}, version={}, method={}, respCode={}, respMessage={}}}",
            self.service_name,
            self.version_name,
            self.method_name,
            self.resp_code.as_deref().unwrap_or("-"),
            self.resp_message.as_deref().unwrap_or("-"),
        )
    }
}

/// Exact-match registry key: `(service name, version)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessorKey {
    pub service_name: String,
    pub version_name: String,
}

impl ProcessorKey {
    pub fn new(service_name: impl Into<String>, version_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            version_name: version_name.into(),
        }
    }
}

impl fmt::Display for ProcessorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service_name, self.version_name)
    }
}

/// Service identity for metrics aggregation: one record per
/// `(service, method, version)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceIdentity {
    pub service_name: String,
    pub method_name: String,
    pub version_name: String,
}

impl fmt::Display for ServiceIdentity {
    /// Formats as `service.method:version`, the form used in access logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}:{}",
            self.service_name, self.method_name, self.version_name
        )
    }
}
