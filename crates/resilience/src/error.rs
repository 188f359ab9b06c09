//! Error taxonomy for the resilience layer
//!
//! One generic error enum covers every way a protected call can fail, so the
//! composition layer can hand the innermost error back to the caller without
//! re-wrapping. Components never swallow errors: the breaker and bulkhead
//! either short-circuit with one of the reject kinds or pass the operation's
//! own failure through unchanged; only the retry loop may suppress
//! intermediate failures, and it always surfaces the last one.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Simple configuration error for validation
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid { message: message.into() }
    }
}

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors produced by the resilience layer
///
/// Generic over the wrapped operation error type `E` so the original failure
/// is preserved wherever one exists.
#[derive(Debug, Error)]
pub enum ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Call rejected because the breaker is open and its timeout has not
    /// elapsed
    #[error("circuit breaker '{name}' is open, rejecting calls")]
    CircuitOpen { name: String },

    /// Call rejected because both the pool and its waiting queue are
    /// saturated
    #[error("bulkhead '{name}' is full: {capacity} slots busy, {waiting} waiting")]
    BulkheadFull { name: String, capacity: usize, waiting: usize },

    /// Call was queued but its wait deadline elapsed before a slot freed
    #[error("checkout from bulkhead '{name}' timed out after {timeout:?}")]
    CheckoutTimeout { name: String, timeout: Duration },

    /// The wrapped operation failed on every retry attempt; carries the last
    /// underlying failure
    #[error("all {attempts} retry attempts failed")]
    MaxAttemptsReached {
        attempts: u32,
        #[source]
        source: E,
    },

    /// The operation failed with an error kind excluded from the retry
    /// policy
    #[error("operation failed with non-retryable error")]
    NonRetryable {
        #[source]
        source: E,
    },

    /// Generic wrapper for the underlying operation's own error
    #[error("operation failed")]
    OperationFailed {
        #[source]
        source: E,
    },

    /// The operation panicked; counted as a crash-class failure so a
    /// crashing dependency cannot bypass the breaker
    #[error("operation panicked: {message}")]
    Panicked { message: String },
}

impl<E> ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Whether a composed call with a fallback should substitute the
    /// fallback's result for this error.
    ///
    /// Matches the reject/exhaust kinds: `CircuitOpen`, `BulkheadFull`, and
    /// `MaxAttemptsReached`. A `CheckoutTimeout` propagates unchanged.
    pub fn triggers_fallback(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. } | Self::BulkheadFull { .. } | Self::MaxAttemptsReached { .. }
        )
    }

    /// Recover the underlying operation error, if this kind carries one.
    pub fn into_source(self) -> Option<E> {
        match self {
            Self::MaxAttemptsReached { source, .. }
            | Self::NonRetryable { source }
            | Self::OperationFailed { source } => Some(source),
            _ => None,
        }
    }
}

/// Result type for resilience operations
pub type ResilienceResult<T, E> = Result<T, ResilienceError<E>>;

/// Coarse failure classification used by retry policies and adaptive tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The dependency did not answer in time; the network may still recover
    Timeout,
    /// Connection-level failure (refused, reset, broken pipe)
    Connection,
    /// The dependency process crashed or the operation panicked
    Crash,
    /// Local resource exhaustion (pools, memory, file handles)
    Resource,
    /// Anything else
    Other,
}

impl FailureKind {
    /// Stable snake_case name, used as the default error signature
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connection => "connection",
            Self::Crash => "crash",
            Self::Resource => "resource",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification hook for operation error types
///
/// Retry policies decide retryability per [`FailureKind`], and the adaptive
/// extensions track recurrence per `signature()`. The signature defaults to
/// the kind name; implementors with several distinct failure modes inside
/// one kind should override it (e.g. an HTTP status code).
pub trait ClassifyError {
    /// The coarse kind of this failure
    fn failure_kind(&self) -> FailureKind;

    /// Identity used by the adaptive recurrence record
    fn signature(&self) -> String {
        self.failure_kind().as_str().to_string()
    }
}

impl ClassifyError for std::io::Error {
    fn failure_kind(&self) -> FailureKind {
        use std::io::ErrorKind;
        match self.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => FailureKind::Timeout,
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::AddrNotAvailable => FailureKind::Connection,
            ErrorKind::OutOfMemory => FailureKind::Resource,
            _ => FailureKind::Other,
        }
    }
}

/// Render a payload captured from `catch_unwind` into a message
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_display() {
        assert_eq!(FailureKind::Timeout.to_string(), "timeout");
        assert_eq!(FailureKind::Crash.to_string(), "crash");
        assert_eq!(FailureKind::Other.to_string(), "other");
    }

    #[test]
    fn test_io_error_classification() {
        let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert_eq!(timeout.failure_kind(), FailureKind::Timeout);

        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "no");
        assert_eq!(refused.failure_kind(), FailureKind::Connection);

        let generic = std::io::Error::other("boom");
        assert_eq!(generic.failure_kind(), FailureKind::Other);
    }

    #[test]
    fn test_default_signature_is_kind_name() {
        let err = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert_eq!(err.signature(), "timeout");
    }

    #[test]
    fn test_triggers_fallback() {
        let open: ResilienceError<std::io::Error> =
            ResilienceError::CircuitOpen { name: "db".into() };
        assert!(open.triggers_fallback());

        let full: ResilienceError<std::io::Error> =
            ResilienceError::BulkheadFull { name: "db".into(), capacity: 4, waiting: 2 };
        assert!(full.triggers_fallback());

        let exhausted: ResilienceError<std::io::Error> = ResilienceError::MaxAttemptsReached {
            attempts: 3,
            source: std::io::Error::other("boom"),
        };
        assert!(exhausted.triggers_fallback());

        let timeout: ResilienceError<std::io::Error> = ResilienceError::CheckoutTimeout {
            name: "db".into(),
            timeout: Duration::from_millis(5),
        };
        assert!(!timeout.triggers_fallback());

        let failed: ResilienceError<std::io::Error> =
            ResilienceError::OperationFailed { source: std::io::Error::other("boom") };
        assert!(!failed.triggers_fallback());
    }

    #[test]
    fn test_into_source() {
        let err: ResilienceError<std::io::Error> =
            ResilienceError::NonRetryable { source: std::io::Error::other("boom") };
        assert!(err.into_source().is_some());

        let open: ResilienceError<std::io::Error> =
            ResilienceError::CircuitOpen { name: "db".into() };
        assert!(open.into_source().is_none());
    }

    #[test]
    fn test_error_display_includes_name() {
        let err: ResilienceError<std::io::Error> =
            ResilienceError::CircuitOpen { name: "llm-api".into() };
        assert!(err.to_string().contains("llm-api"));
    }

    #[test]
    fn test_panic_message_downcasts() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new("owned".to_string())), "owned");
        assert_eq!(panic_message(Box::new(42_u32)), "non-string panic payload");
    }
}
