//! Error taxonomy for request processing.
//!
//! Processing failures are either *domain* errors, raised deliberately with
//! an explicit code and message, or *unexpected* errors (anything else). The
//! mapping from a failure to the `(code, message)` pair written on the wire
//! lives in [`ProcessError::to_soa_error`]; unexpected errors never leak
//! their internal detail to the caller.

use std::any::Any;
use std::fmt;

/// A well-known `(code, message)` pair defined by the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoaBaseCode {
    pub code: &'static str,
    pub message: &'static str,
}

impl SoaBaseCode {
    /// Generic code for any failure that is not a domain error.
    pub const UNKNOWN: Self = Self {
        code: "Err-Core-000",
        message: "unknown system error",
    };

    /// No processor is registered for the requested service and version.
    pub const NOT_FOUND_SERVER: Self = Self {
        code: "Err-Core-002",
        message: "no available server found",
    };
}

impl fmt::Display for SoaBaseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Domain error carrying the code and message sent back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct SoaError {
    pub code: String,
    pub message: String,
}

impl SoaError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<SoaBaseCode> for SoaError {
    fn from(base: SoaBaseCode) -> Self {
        Self::new(base.code, base.message)
    }
}

/// Whether a failure was raised deliberately or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Domain,
    Unexpected,
}

/// Failure of a single request while it is being processed.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// Deliberate, code-carrying failure.
    #[error(transparent)]
    Domain(#[from] SoaError),
    /// Anything else: resource exhaustion, codec faults, panics.
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl ProcessError {
    /// Builds an unexpected error from the payload of a panic caught while
    /// running `stage` (e.g. `"processor"`).
    #[must_use]
    pub fn from_panic(stage: &str, payload: &(dyn Any + Send)) -> Self {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::Unexpected(anyhow::anyhow!("{stage} panicked: {detail}"))
    }

    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Domain(_) => FailureKind::Domain,
            Self::Unexpected(_) => FailureKind::Unexpected,
        }
    }

    /// Maps the failure to the code and message written on the wire.
    ///
    /// Domain errors keep their own pair; unexpected errors collapse to
    /// [`SoaBaseCode::UNKNOWN`].
    #[must_use]
    pub fn to_soa_error(&self) -> SoaError {
        match self {
            Self::Domain(err) => err.clone(),
            Self::Unexpected(_) => SoaBaseCode::UNKNOWN.into(),
        }
    }
}

impl From<SoaBaseCode> for ProcessError {
    fn from(base: SoaBaseCode) -> Self {
        Self::Domain(base.into())
    }
}
