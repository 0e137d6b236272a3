//! Error taxonomy for the RPC and publish/subscribe engine.
//!
//! Two layers live here:
//!
//! - [`RpcError`]: the process-local error type returned from every public
//!   operation.
//! - [`ErrorBody`]: the wire form carried inside an `Error` envelope
//!   (`code`, `message`, optional `details`). Handler failures are converted
//!   to an `ErrorBody` before being sent to the peer, preserving the code,
//!   message and extra fields verbatim.

use serde_json::Value;
use thiserror::Error;

/// Errors that can occur during RPC and subscription operations.
#[derive(Error, Debug)]
pub enum RpcError {
    /// No item is registered under the requested name.
    #[error("item not found: {0}")]
    NotFound(String),

    /// No response arrived within the configured call timeout.
    #[error("call timed out")]
    Timeout,

    /// The connection was closed while the operation was outstanding,
    /// or the operation was attempted without an active connection.
    #[error("connection closed")]
    Disconnected,

    /// Transport-level failure (send failed, connect failed, socket error).
    #[error("transport error: {0}")]
    Transport(String),

    /// A single inbound frame could not be decoded. Non-fatal: the engine
    /// logs and drops the frame without closing the connection.
    #[error("malformed frame: {0}")]
    ProtocolDecode(String),

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An application-level failure reported by a remote handler (or raised
    /// by a local one). Code, message and details travel the wire verbatim.
    #[error("{message}")]
    Application {
        /// Numeric error code; handlers that don't set one get 500.
        code: u16,
        /// Human-readable description.
        message: String,
        /// Arbitrary extra fields attached by the handler.
        details: Option<Value>,
    },

    /// The middleware chain was driven incorrectly (e.g. `next()` invoked
    /// more than once at the same depth).
    #[error("middleware dispatch error: {0}")]
    BadDispatch(String),
}

impl RpcError {
    /// Shorthand for an application error with an explicit code.
    pub fn app(code: u16, message: impl Into<String>) -> Self {
        Self::Application {
            code,
            message: message.into(),
            details: None,
        }
    }
}

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;

/// Serialized error shape carried by `Error` envelopes.
///
/// Cloneable so an in-flight invocation result can be fanned out to every
/// coalesced caller.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorBody {
    pub code: u16,
    pub message: String,
    pub details: Option<Value>,
}

impl ErrorBody {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub(crate) fn not_found(name: &str) -> Self {
        Self::new(404, format!("item not found: {name}"))
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::new(500, message)
    }

    /// Convert the wire form back into the local error type.
    ///
    /// A 404 code maps onto [`RpcError::NotFound`]; everything else is
    /// surfaced as an application error with the fields preserved.
    pub fn into_error(self) -> RpcError {
        if self.code == 404 {
            RpcError::NotFound(self.message)
        } else {
            RpcError::Application {
                code: self.code,
                message: self.message,
                details: self.details,
            }
        }
    }
}

impl From<RpcError> for ErrorBody {
    /// Serialize a local error for the wire. Application errors keep their
    /// fields verbatim; everything else collapses to a 500-equivalent with
    /// the display message (404 for unknown items, 408 for timeouts).
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Application {
                code,
                message,
                details,
            } => Self {
                code,
                message,
                details,
            },
            RpcError::NotFound(name) => Self::not_found(&name),
            RpcError::Timeout => Self::new(408, "call timed out"),
            other => Self::internal(other.to_string()),
        }
    }
}
