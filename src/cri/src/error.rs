//! CRI-specific error conversions.
//!
//! Components below the gRPC surface return classified `ShimError`s; this
//! is the single place they become status codes. Logs keep the original
//! error, the wire carries the classified code and a message stripped of
//! manager internals.

use podlx_core::error::ShimError;
use tonic::Status;

/// Convert a ShimError to a gRPC Status.
pub fn shim_error_to_status(err: ShimError) -> Status {
    tracing::debug!(error = %err, "Mapping error to gRPC status");
    match err {
        ShimError::NotFound(msg) => Status::not_found(msg),
        ShimError::AlreadyInState(msg) => Status::failed_precondition(msg),
        ShimError::Transient(msg) => Status::unavailable(msg),
        ShimError::Invalid(msg) => Status::invalid_argument(msg),
        ShimError::Conflict(msg) => Status::aborted(msg),
        ShimError::NetworkSetup(msg) => Status::internal(format!("network setup: {}", msg)),
        ShimError::Timeout(msg) => Status::deadline_exceeded(msg),
        ShimError::Config(msg) => Status::failed_precondition(msg),
        // Manager internals and local faults stay out of the wire message.
        ShimError::Fatal(msg) => {
            tracing::error!(error = %msg, "Manager error surfaced to CRI");
            Status::internal("manager operation failed")
        }
        ShimError::Io(e) => {
            tracing::error!(error = %e, "I/O error surfaced to CRI");
            Status::internal("runtime I/O failure")
        }
        ShimError::Serialization(e) => {
            tracing::error!(error = %e, "Serialization error surfaced to CRI");
            Status::internal("runtime serialization failure")
        }
    }
}
