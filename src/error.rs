//! Error handling for the ingestion pipeline and session uploads
//!
//! This module defines the error type used throughout the crate and the
//! pluggable strategy that decides what happens when an unrecoverable
//! failure is detected deep inside a pipeline stage or worker thread.

use log::error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, IngestError>;

/// Error types that can occur while ingesting and uploading content
#[derive(Error, Debug)]
pub enum IngestError {
    /// A pipeline wiring or API usage contract was broken
    #[error("Contract violation: {context}")]
    ContractViolation { context: String },

    /// An upload operation reported a non-zero result code
    #[error("{operation} upload failed (code: {code})")]
    UploadFailed { operation: String, code: i32 },

    /// A resource needed by the pipeline could not be acquired
    #[error("Resource unavailable: {resource} - {message}")]
    ResourceUnavailable { resource: String, message: String },

    /// Session lifecycle or remote operation failed
    #[error("Session error: {message}")]
    SessionError { message: String },

    /// The gateway rejected a request
    #[error("Gateway rejected {operation}: {reason}")]
    GatewayRejected { operation: String, reason: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// Invalid spooler definition
    #[error("Invalid spooler definition '{definition}': {message}")]
    InvalidSpooler { definition: String, message: String },

    /// Invalid parameter
    #[error("Invalid parameter: {parameter} - {message}")]
    InvalidParameter { parameter: String, message: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl IngestError {
    /// Create a new contract violation error
    pub fn contract_violation(context: impl Into<String>) -> Self {
        IngestError::ContractViolation {
            context: context.into(),
        }
    }

    /// Create a new upload failure error
    pub fn upload_failed(operation: impl Into<String>, code: i32) -> Self {
        IngestError::UploadFailed {
            operation: operation.into(),
            code,
        }
    }

    /// Create a new resource unavailable error
    pub fn resource_unavailable(resource: impl Into<String>, message: impl Into<String>) -> Self {
        IngestError::ResourceUnavailable {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Create a new session error
    pub fn session_error(message: impl Into<String>) -> Self {
        IngestError::SessionError {
            message: message.into(),
        }
    }

    /// Create a new gateway rejection error
    pub fn gateway_rejected(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        IngestError::GatewayRejected {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a new configuration error
    pub fn config_error(message: impl Into<String>) -> Self {
        IngestError::ConfigError {
            message: message.into(),
        }
    }

    /// Create a new invalid spooler definition error
    pub fn invalid_spooler(definition: impl Into<String>, message: impl Into<String>) -> Self {
        IngestError::InvalidSpooler {
            definition: definition.into(),
            message: message.into(),
        }
    }

    /// Create a new invalid parameter error
    pub fn invalid_parameter(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        IngestError::InvalidParameter {
            parameter: parameter.into(),
            message: message.into(),
        }
    }
}

/// Records the first unrecoverable failure instead of terminating
#[derive(Debug, Default)]
pub struct FailureLatch {
    first: Mutex<Option<IngestError>>,
    count: AtomicUsize,
}

impl FailureLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure; only the first one is kept
    pub fn record(&self, error: IngestError) {
        self.count.fetch_add(1, Ordering::SeqCst);
        let mut first = self.first.lock().unwrap_or_else(|e| e.into_inner());
        if first.is_none() {
            *first = Some(error);
        }
    }

    /// Number of failures recorded so far
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn has_failed(&self) -> bool {
        self.count() > 0
    }

    /// Take the first recorded failure, leaving the latch empty
    pub fn take(&self) -> Option<IngestError> {
        self.first.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

/// What to do with a failure that cannot be reported through a return value
///
/// Upload and wiring failures happen on worker threads and inside completion
/// callbacks, where there is no caller to hand an error to.
#[derive(Debug, Clone, Default)]
pub enum FailurePolicy {
    /// Log the failure and abort the process
    #[default]
    Abort,
    /// Log the failure and panic on the current thread
    Panic,
    /// Log the failure and record it for the owner to pick up
    Collect(Arc<FailureLatch>),
}

impl FailurePolicy {
    /// Create a collecting policy together with its latch
    pub fn collect() -> (Self, Arc<FailureLatch>) {
        let latch = Arc::new(FailureLatch::new());
        (FailurePolicy::Collect(latch.clone()), latch)
    }

    /// Escalate an unrecoverable failure according to the policy
    pub fn escalate(&self, failure: IngestError) {
        error!("{}", failure);
        match self {
            FailurePolicy::Abort => std::process::abort(),
            FailurePolicy::Panic => panic!("{}", failure),
            FailurePolicy::Collect(latch) => latch.record(failure),
        }
    }

    /// Turn a recorded failure into an error, if the policy collects them
    pub fn check(&self) -> Result<()> {
        match self {
            FailurePolicy::Collect(latch) => match latch.take() {
                Some(failure) => Err(failure),
                None => Ok(()),
            },
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = IngestError::contract_violation("block without chunk");
        assert!(matches!(err, IngestError::ContractViolation { .. }));

        let err = IngestError::upload_failed("block", 3);
        assert!(matches!(err, IngestError::UploadFailed { code: 3, .. }));

        let err = IngestError::invalid_spooler("ftp,/tmp", "unknown scheme");
        assert!(matches!(err, IngestError::InvalidSpooler { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = IngestError::upload_failed("chunk", 2);
        assert_eq!(err.to_string(), "chunk upload failed (code: 2)");

        let err = IngestError::invalid_parameter("max-pack-size", "must be greater than 0");
        assert_eq!(
            err.to_string(),
            "Invalid parameter: max-pack-size - must be greater than 0"
        );
    }

    #[test]
    fn test_collect_policy_keeps_first_failure() {
        let (policy, latch) = FailurePolicy::collect();
        policy.escalate(IngestError::upload_failed("block", 1));
        policy.escalate(IngestError::upload_failed("chunk", 2));

        assert_eq!(latch.count(), 2);
        match policy.check() {
            Err(IngestError::UploadFailed { operation, code }) => {
                assert_eq!(operation, "block");
                assert_eq!(code, 1);
            }
            other => panic!("Expected UploadFailed, got: {:?}", other),
        }
        assert!(policy.check().is_ok());
    }

    #[test]
    #[should_panic(expected = "Contract violation")]
    fn test_panic_policy() {
        FailurePolicy::Panic.escalate(IngestError::contract_violation("test"));
    }
}
