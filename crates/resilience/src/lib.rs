//! Fault-tolerance control plane for unreliable dependencies.
//!
//! Every outbound call to an unreliable dependency (a broker connection, an
//! HTTP/LLM API, a database) is routed through a small set of protective
//! primitives that isolate failures, shed load, and recover automatically:
//!
//! - [`CircuitBreaker`]: per-dependency open/closed/half-open state machine
//!   that stops calling a failing dependency until it appears to have
//!   recovered.
//! - [`Bulkhead`]: fixed slot pool with a FIFO waiting queue, isolating one
//!   dependency's concurrency so it cannot starve others.
//! - Retry ([`RetryExecutor`], [`with_retry`]): stateless exponential
//!   backoff with failure-kind classification and jitter.
//! - [`HealthMonitor`]: periodic aggregator rolling breaker, bulkhead, and
//!   custom checks into one health signal.
//! - [`ResilienceRegistry`]: named instances plus the `protected_call`
//!   composition (bulkhead → breaker → retry) with optional fallback.
//!
//! The crate is transport-agnostic: it protects arbitrary work encoded as a
//! no-argument operation that either produces a result or fails. Tunables
//! come from a [`ConfigProvider`] and every notable occurrence is emitted as
//! a structured event through an [`EventSink`].
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use aegis_resilience::{ResilienceRegistry, RetryPolicy};
//!
//! # #[derive(Debug)]
//! # struct ApiError;
//! # impl std::fmt::Display for ApiError {
//! #     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//! #         write!(f, "api error")
//! #     }
//! # }
//! # impl std::error::Error for ApiError {}
//! # impl aegis_resilience::ClassifyError for ApiError {
//! #     fn failure_kind(&self) -> aegis_resilience::FailureKind {
//! #         aegis_resilience::FailureKind::Connection
//! #     }
//! # }
//! # async fn call_llm() -> Result<String, ApiError> { Ok("ok".into()) }
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = ResilienceRegistry::default();
//!
//! let reply = registry
//!     .protected_call(
//!         "llm-api",
//!         "llm-api",
//!         RetryPolicy::default(),
//!         Duration::from_secs(5),
//!         || async { call_llm().await },
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod adaptive;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod health;
pub mod protected;
pub mod registry;
pub mod retry;

// Re-export commonly used types for convenience
// ------------------------------
pub use adaptive::{AdaptiveBreaker, AdaptiveThreshold, AdaptiveThresholdConfig};
pub use bulkhead::{
    Bulkhead, BulkheadConfig, BulkheadConfigBuilder, BulkheadMetrics, BulkheadState, CheckoutError,
    SlotGuard, SlotId,
};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitBreakerMetrics,
    CircuitState,
};
pub use clock::{Clock, MockClock, SystemClock};
pub use config::{ConfigProvider, HealthConfig, StaticConfigProvider};
pub use error::{
    ClassifyError, ConfigError, ConfigResult, FailureKind, ResilienceError, ResilienceResult,
};
pub use event::{CollectingEventSink, EventSink, ResilienceEvent, TracingEventSink};
pub use health::{ComponentReport, HealthCheckResult, HealthMonitor, HealthReport, HealthState};
pub use registry::ResilienceRegistry;
pub use retry::{with_retry, AdaptiveRetry, RetryExecutor, RetryPolicy, RetryPolicyBuilder};
