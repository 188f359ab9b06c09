//! Circuit breaker state machine, one instance per protected dependency
//!
//! The breaker monitors operation outcomes and temporarily blocks calls to a
//! dependency that keeps failing, probing for recovery through a half-open
//! trial phase. State transitions are totally ordered per instance and every
//! transition is emitted as a structured event.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::duration_ms;
use crate::error::{panic_message, ConfigError, ConfigResult, ResilienceError, ResilienceResult};
use crate::event::{default_sink, EventSink, ResilienceEvent};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, allowing requests
    Closed,
    /// Circuit is open, rejecting requests
    Open,
    /// Circuit is half-open, allowing limited requests to test recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u64,
    /// Consecutive successes needed to close the circuit from half-open
    pub success_threshold: u64,
    /// Time to wait before transitioning from open to half-open
    #[serde(with = "duration_ms")]
    pub open_timeout: Duration,
    /// Failures older than this no longer count toward the threshold
    #[serde(with = "duration_ms")]
    pub failure_reset_window: Duration,
    /// Maximum number of trial calls admitted in half-open state
    pub half_open_max_calls: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            open_timeout: Duration::from_millis(30_000),
            failure_reset_window: Duration::from_millis(60_000),
            half_open_max_calls: 3,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration builder
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold must be greater than 0"));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::invalid("success_threshold must be greater than 0"));
        }
        if self.half_open_max_calls == 0 {
            return Err(ConfigError::invalid("half_open_max_calls must be greater than 0"));
        }
        Ok(())
    }
}

/// Builder for [`CircuitBreakerConfig`]
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    pub fn failure_threshold(mut self, threshold: u64) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn success_threshold(mut self, threshold: u64) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.config.open_timeout = timeout;
        self
    }

    pub fn failure_reset_window(mut self, window: Duration) -> Self {
        self.config.failure_reset_window = window;
        self
    }

    pub fn half_open_max_calls(mut self, max_calls: u64) -> Self {
        self.config.half_open_max_calls = max_calls;
        self
    }

    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Circuit breaker metrics snapshot for monitoring
#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub failure_count: u64,
    pub success_count: u64,
    pub half_open_calls: u64,
    pub total_calls: u64,
    pub failure_threshold: u64,
    pub success_threshold: u64,
    pub last_failure_time: Option<Instant>,
}

/// Circuit breaker implementation
///
/// Lives for the process lifetime, one instance per dependency name; never
/// deleted, only reset. Handles are cheap to clone (shared internals), so a
/// registry and a health monitor can observe the same instance.
///
/// Thresholds are atomics and may be tuned at runtime, either by a config
/// refresh or by the adaptive strategy in [`crate::adaptive`].
pub struct CircuitBreaker<C: Clock = SystemClock> {
    name: Arc<str>,
    config: CircuitBreakerConfig,
    failure_threshold: Arc<AtomicU64>,
    success_threshold: Arc<AtomicU64>,
    state: Arc<RwLock<CircuitState>>,
    failure_count: Arc<AtomicU64>,
    success_count: Arc<AtomicU64>,
    half_open_calls: Arc<AtomicU64>,
    total_calls: Arc<AtomicU64>,
    last_failure_time: Arc<RwLock<Option<Instant>>>,
    events: Arc<dyn EventSink>,
    clock: Arc<C>,
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.get_state())
            .field("failure_count", &self.failure_count.load(Ordering::Acquire))
            .field("failure_threshold", &self.failure_threshold.load(Ordering::Acquire))
            .finish()
    }
}

impl<C: Clock> Clone for CircuitBreaker<C> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            config: self.config.clone(),
            failure_threshold: Arc::clone(&self.failure_threshold),
            success_threshold: Arc::clone(&self.success_threshold),
            state: Arc::clone(&self.state),
            failure_count: Arc::clone(&self.failure_count),
            success_count: Arc::clone(&self.success_count),
            half_open_calls: Arc::clone(&self.half_open_calls),
            total_calls: Arc::clone(&self.total_calls),
            last_failure_time: Arc::clone(&self.last_failure_time),
            events: Arc::clone(&self.events),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl CircuitBreaker<SystemClock> {
    /// Create a new circuit breaker with the given configuration using system
    /// clock
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(name, config, SystemClock)
    }

    /// Create a circuit breaker with default configuration
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default()).expect("Default config should be valid")
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a new circuit breaker with a custom clock (useful for testing)
    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: C,
    ) -> ConfigResult<Self> {
        config.validate()?;

        Ok(Self {
            name: Arc::from(name.into()),
            failure_threshold: Arc::new(AtomicU64::new(config.failure_threshold)),
            success_threshold: Arc::new(AtomicU64::new(config.success_threshold)),
            state: Arc::new(RwLock::new(CircuitState::Closed)),
            failure_count: Arc::new(AtomicU64::new(0)),
            success_count: Arc::new(AtomicU64::new(0)),
            half_open_calls: Arc::new(AtomicU64::new(0)),
            total_calls: Arc::new(AtomicU64::new(0)),
            last_failure_time: Arc::new(RwLock::new(None)),
            events: default_sink(),
            clock: Arc::new(clock),
            config,
        })
    }

    /// Replace the event sink (builder style)
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Name of the protected dependency
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fast check if circuit is available
    ///
    /// Lightweight probe for high-frequency polling; it does not advance the
    /// open → half-open transition. For admission use [`Self::try_acquire`].
    pub fn is_available(&self) -> bool {
        *self.state.read() != CircuitState::Open
    }

    /// Check if the circuit breaker allows execution
    ///
    /// Returns `false` if the circuit is open and the timeout hasn't elapsed,
    /// or if we're in half-open state and have reached the trial-call bound.
    /// Returns `true` otherwise, potentially transitioning from open to
    /// half-open.
    pub fn can_execute(&self) -> bool {
        let state = *self.state.read();

        match state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let last_failure = *self.last_failure_time.read();
                if let Some(failure_time) = last_failure {
                    let now = self.clock.now();
                    if now.duration_since(failure_time) >= self.config.open_timeout {
                        // Probe recovery: reset the trial counters before
                        // admitting the next call.
                        self.success_count.store(0, Ordering::Release);
                        self.half_open_calls.store(0, Ordering::Release);
                        self.transition(CircuitState::HalfOpen);
                        return true;
                    }
                }
                false
            }
            CircuitState::HalfOpen => {
                let current_calls = self.half_open_calls.load(Ordering::Acquire);
                current_calls < self.config.half_open_max_calls
            }
        }
    }

    /// Admission decision plus call bookkeeping
    ///
    /// External composition (the protected-call layer) uses this together
    /// with [`Self::record_success`]/[`Self::record_failure`] instead of
    /// wrapping the operation in [`Self::call`], so the retry loop can run
    /// inside a single admitted call.
    pub fn try_acquire(&self) -> bool {
        if !self.can_execute() {
            return false;
        }

        self.total_calls.fetch_add(1, Ordering::Relaxed);
        if self.get_state() == CircuitState::HalfOpen {
            self.half_open_calls.fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    /// Execute a synchronous operation with circuit breaker protection
    ///
    /// A panicking operation counts as a failure, exactly like an error
    /// return; the panic is surfaced as [`ResilienceError::Panicked`].
    #[instrument(skip(self, operation), fields(name = %self.name, state = %self.get_state()))]
    pub fn call<F, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        if !self.try_acquire() {
            debug!("circuit breaker rejecting call");
            return Err(ResilienceError::CircuitOpen { name: self.name.to_string() });
        }

        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(operation)) {
            Ok(Ok(result)) => {
                self.record_success();
                Ok(result)
            }
            Ok(Err(error)) => {
                self.record_failure();
                Err(ResilienceError::OperationFailed { source: error })
            }
            Err(payload) => {
                self.record_failure();
                Err(ResilienceError::Panicked { message: panic_message(payload) })
            }
        }
    }

    /// Execute an async operation with circuit breaker protection
    #[instrument(skip(self, operation), fields(name = %self.name, state = %self.get_state()))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        if !self.try_acquire() {
            debug!("circuit breaker rejecting call");
            return Err(ResilienceError::CircuitOpen { name: self.name.to_string() });
        }

        match std::panic::AssertUnwindSafe(operation()).catch_unwind().await {
            Ok(Ok(result)) => {
                self.record_success();
                Ok(result)
            }
            Ok(Err(error)) => {
                self.record_failure();
                Err(ResilienceError::OperationFailed { source: error })
            }
            Err(payload) => {
                self.record_failure();
                Err(ResilienceError::Panicked { message: panic_message(payload) })
            }
        }
    }

    /// Record a successful operation
    pub fn record_success(&self) {
        match self.get_state() {
            CircuitState::Closed => {
                // Consecutive-failure counting: one success wipes the streak.
                self.failure_count.store(0, Ordering::Release);
            }
            CircuitState::HalfOpen => {
                let successes = self.success_count.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.success_threshold.load(Ordering::Acquire) {
                    self.failure_count.store(0, Ordering::Release);
                    self.success_count.store(0, Ordering::Release);
                    self.transition(CircuitState::Closed);
                }
            }
            CircuitState::Open => {
                warn!(name = %self.name, "received success while circuit is open");
            }
        }
    }

    /// Record a failed operation
    pub fn record_failure(&self) {
        let now = self.clock.now();

        // Failures outside the reset window no longer count toward the
        // threshold.
        {
            let last_failure = *self.last_failure_time.read();
            if let Some(previous) = last_failure {
                if now.duration_since(previous) >= self.config.failure_reset_window {
                    self.failure_count.store(0, Ordering::Release);
                }
            }
        }

        let failures = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
        *self.last_failure_time.write() = Some(now);

        match self.get_state() {
            CircuitState::Closed => {
                if failures >= self.failure_threshold.load(Ordering::Acquire) {
                    warn!(name = %self.name, failures, "circuit breaker opening");
                    self.transition(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                // Any failure during the trial phase reopens immediately, no
                // partial credit for earlier successes.
                self.success_count.store(0, Ordering::Release);
                warn!(name = %self.name, "circuit breaker reopened by half-open failure");
                self.transition(CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Get the current state of the circuit breaker
    pub fn get_state(&self) -> CircuitState {
        *self.state.read()
    }

    /// Get the current circuit state (alias for `get_state()`)
    pub fn state(&self) -> CircuitState {
        self.get_state()
    }

    /// Get circuit breaker metrics
    pub fn get_metrics(&self) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            state: self.get_state(),
            failure_count: self.failure_count.load(Ordering::Acquire),
            success_count: self.success_count.load(Ordering::Acquire),
            half_open_calls: self.half_open_calls.load(Ordering::Acquire),
            total_calls: self.total_calls.load(Ordering::Acquire),
            failure_threshold: self.failure_threshold.load(Ordering::Acquire),
            success_threshold: self.success_threshold.load(Ordering::Acquire),
            last_failure_time: *self.last_failure_time.read(),
        }
    }

    /// Get current metrics snapshot (alias for `get_metrics()`)
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        self.get_metrics()
    }

    /// Current failure threshold (runtime mutable)
    pub fn failure_threshold(&self) -> u64 {
        self.failure_threshold.load(Ordering::Acquire)
    }

    /// Tune the failure threshold at runtime
    pub fn set_failure_threshold(&self, threshold: u64) {
        self.failure_threshold.store(threshold.max(1), Ordering::Release);
    }

    /// Current success threshold (runtime mutable)
    pub fn success_threshold(&self) -> u64 {
        self.success_threshold.load(Ordering::Acquire)
    }

    /// Tune the success threshold at runtime
    pub fn set_success_threshold(&self, threshold: u64) {
        self.success_threshold.store(threshold.max(1), Ordering::Release);
    }

    /// Configured threshold baseline (what the adaptive tuner scales from)
    pub fn base_failure_threshold(&self) -> u64 {
        self.config.failure_threshold
    }

    /// Reset the circuit breaker to closed state with zeroed counters
    ///
    /// For operational/test use; valid from any prior state.
    pub fn reset(&self) {
        self.failure_count.store(0, Ordering::Release);
        self.success_count.store(0, Ordering::Release);
        self.half_open_calls.store(0, Ordering::Release);
        *self.last_failure_time.write() = None;
        self.transition(CircuitState::Closed);
    }

    /// Swap state, emitting the transition when it actually changes
    fn transition(&self, to: CircuitState) {
        let from = {
            let mut state = self.state.write();
            let from = *state;
            if from == to {
                return;
            }
            *state = to;
            from
        };
        self.events.emit(&ResilienceEvent::StateTransition {
            name: self.name.to_string(),
            from,
            to,
        });
    }

    #[cfg(test)]
    fn force_state(&self, state: CircuitState) {
        *self.state.write() = state;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::clock::MockClock;
    use crate::event::CollectingEventSink;

    #[test]
    fn test_circuit_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "CLOSED");
        assert_eq!(CircuitState::Open.to_string(), "OPEN");
        assert_eq!(CircuitState::HalfOpen.to_string(), "HALF_OPEN");
    }

    #[test]
    fn test_config_default() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.success_threshold, 3);
        assert_eq!(config.open_timeout, Duration::from_secs(30));
        assert_eq!(config.failure_reset_window, Duration::from_secs(60));
        assert_eq!(config.half_open_max_calls, 3);
    }

    #[test]
    fn test_config_validation() {
        assert!(CircuitBreakerConfig::builder().failure_threshold(0).build().is_err());
        assert!(CircuitBreakerConfig::builder().success_threshold(0).build().is_err());
        assert!(CircuitBreakerConfig::builder().half_open_max_calls(0).build().is_err());
        assert!(CircuitBreakerConfig::builder().build().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(10)
            .success_threshold(4)
            .open_timeout(Duration::from_secs(15))
            .failure_reset_window(Duration::from_secs(120))
            .half_open_max_calls(5)
            .build()
            .expect("valid config");

        assert_eq!(config.failure_threshold, 10);
        assert_eq!(config.success_threshold, 4);
        assert_eq!(config.open_timeout, Duration::from_secs(15));
        assert_eq!(config.failure_reset_window, Duration::from_secs(120));
        assert_eq!(config.half_open_max_calls, 5);
    }

    #[test]
    fn test_config_roundtrips_through_millis_serde() {
        let config = CircuitBreakerConfig::default();
        let json = serde_json::to_value(&config).expect("serialize");
        assert_eq!(json["open_timeout"], 30_000);

        let back: CircuitBreakerConfig = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back.open_timeout, config.open_timeout);
    }

    #[test]
    fn test_breaker_starts_closed() {
        let cb = CircuitBreaker::with_defaults("db");
        assert_eq!(cb.get_state(), CircuitState::Closed);
        assert!(cb.can_execute());
        assert_eq!(cb.name(), "db");
    }

    /// Circuit opens once the consecutive-failure threshold is reached
    #[test]
    fn test_opens_after_failures() {
        let config =
            CircuitBreakerConfig::builder().failure_threshold(3).build().expect("valid config");
        let cb = CircuitBreaker::new("db", config).expect("breaker");

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.get_state(), CircuitState::Closed, "should remain closed below threshold");

        cb.record_failure();
        assert_eq!(cb.get_state(), CircuitState::Open, "should open at threshold");
        assert!(!cb.can_execute(), "open circuit blocks execution");
        assert!(!cb.is_available());
    }

    /// One success in closed state resets the failure streak
    #[test]
    fn test_success_resets_failure_count() {
        let config =
            CircuitBreakerConfig::builder().failure_threshold(3).build().expect("valid config");
        let cb = CircuitBreaker::new("db", config).expect("breaker");

        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.get_metrics().failure_count, 0);

        // A fresh full streak is required to open.
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.get_state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.get_state(), CircuitState::Open);
    }

    /// Failures older than the reset window do not accumulate
    #[test]
    fn test_failure_reset_window_expires_stale_failures() {
        let clock = MockClock::new();
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(3)
            .failure_reset_window(Duration::from_secs(60))
            .build()
            .expect("valid config");
        let cb = CircuitBreaker::with_clock("db", config, clock.clone()).expect("breaker");

        cb.record_failure();
        cb.record_failure();

        // The earlier streak is stale by the time the next failure lands.
        clock.advance(Duration::from_secs(61));
        cb.record_failure();

        assert_eq!(cb.get_state(), CircuitState::Closed);
        assert_eq!(cb.get_metrics().failure_count, 1);
    }

    #[test]
    fn test_open_to_half_open_after_timeout() {
        let clock = MockClock::new();
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(2)
            .open_timeout(Duration::from_secs(30))
            .build()
            .expect("valid config");
        let cb = CircuitBreaker::with_clock("db", config, clock.clone()).expect("breaker");

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.get_state(), CircuitState::Open);

        clock.advance(Duration::from_secs(10));
        assert!(!cb.can_execute(), "timeout not yet elapsed");
        assert_eq!(cb.get_state(), CircuitState::Open);

        clock.advance(Duration::from_secs(25));
        assert!(cb.can_execute(), "timeout elapsed, probe allowed");
        assert_eq!(cb.get_state(), CircuitState::HalfOpen);
    }

    /// Half-open admits only `half_open_max_calls` trial calls
    #[test]
    fn test_half_open_limits_trial_calls() {
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(1)
            .half_open_max_calls(2)
            .build()
            .expect("valid config");
        let cb = CircuitBreaker::new("db", config).expect("breaker");
        cb.force_state(CircuitState::HalfOpen);

        assert!(cb.try_acquire());
        assert!(cb.try_acquire());
        assert!(!cb.try_acquire(), "trial call bound reached");
    }

    #[test]
    fn test_half_open_closes_after_success_threshold() {
        let config =
            CircuitBreakerConfig::builder().success_threshold(2).build().expect("valid config");
        let cb = CircuitBreaker::new("db", config).expect("breaker");
        cb.force_state(CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.get_state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.get_state(), CircuitState::Closed);
        assert_eq!(cb.get_metrics().failure_count, 0);
    }

    /// No partial credit: any half-open failure reopens immediately
    #[test]
    fn test_half_open_failure_reopens() {
        let config =
            CircuitBreakerConfig::builder().success_threshold(2).build().expect("valid config");
        let cb = CircuitBreaker::new("db", config).expect("breaker");
        cb.force_state(CircuitState::HalfOpen);

        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.get_state(), CircuitState::Open);
        assert_eq!(cb.get_metrics().success_count, 0, "trial successes discarded");
    }

    #[test]
    fn test_call_success() {
        let cb = CircuitBreaker::with_defaults("db");
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let result = cb.call(|| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            Ok::<_, std::io::Error>(42)
        });

        assert_eq!(result.expect("should succeed"), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_call_failure_wraps_source() {
        let cb = CircuitBreaker::with_defaults("db");
        let result = cb.call(|| Err::<(), _>(std::io::Error::other("boom")));

        match result {
            Err(ResilienceError::OperationFailed { .. }) => {}
            other => panic!("expected OperationFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_call_rejects_when_open() {
        let config =
            CircuitBreakerConfig::builder().failure_threshold(1).build().expect("valid config");
        let cb = CircuitBreaker::new("db", config).expect("breaker");
        cb.record_failure();

        let result = cb.call(|| Ok::<_, std::io::Error>(42));
        match result {
            Err(ResilienceError::CircuitOpen { name }) => assert_eq!(name, "db"),
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
    }

    /// A panicking operation is a crash-class failure; it cannot bypass the
    /// breaker
    #[test]
    fn test_call_counts_panic_as_failure() {
        let config =
            CircuitBreakerConfig::builder().failure_threshold(2).build().expect("valid config");
        let cb = CircuitBreaker::new("db", config).expect("breaker");

        for _ in 0..2 {
            let result = cb.call(|| -> Result<(), std::io::Error> { panic!("dependency died") });
            assert!(matches!(result, Err(ResilienceError::Panicked { .. })));
        }

        assert_eq!(cb.get_state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_execute_success() {
        let cb = CircuitBreaker::with_defaults("db");
        let result = cb.execute(|| async { Ok::<_, std::io::Error>(7) }).await;
        assert_eq!(result.expect("should succeed"), 7);
    }

    #[tokio::test]
    async fn test_execute_counts_async_panic_as_failure() {
        let config =
            CircuitBreakerConfig::builder().failure_threshold(1).build().expect("valid config");
        let cb = CircuitBreaker::new("db", config).expect("breaker");

        let result: Result<(), ResilienceError<std::io::Error>> =
            cb.execute(|| async { panic!("dependency died") }).await;
        assert!(matches!(result, Err(ResilienceError::Panicked { .. })));
        assert_eq!(cb.get_state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_execute_rejects_when_open() {
        let config =
            CircuitBreakerConfig::builder().failure_threshold(1).build().expect("valid config");
        let cb = CircuitBreaker::new("db", config).expect("breaker");
        cb.record_failure();

        let result = cb.execute(|| async { Ok::<_, std::io::Error>(42) }).await;
        assert!(matches!(result, Err(ResilienceError::CircuitOpen { .. })));
    }

    /// `reset()` yields closed with zeroed counters from any prior state
    #[test]
    fn test_reset_from_any_state() {
        let config =
            CircuitBreakerConfig::builder().failure_threshold(1).build().expect("valid config");
        let cb = CircuitBreaker::new("db", config).expect("breaker");

        cb.record_failure();
        assert_eq!(cb.get_state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.get_state(), CircuitState::Closed);
        let metrics = cb.get_metrics();
        assert_eq!(metrics.failure_count, 0);
        assert_eq!(metrics.success_count, 0);
        assert!(metrics.last_failure_time.is_none());

        // Idempotent from closed as well.
        cb.reset();
        assert_eq!(cb.get_state(), CircuitState::Closed);
    }

    #[test]
    fn test_runtime_threshold_tuning() {
        let cb = CircuitBreaker::with_defaults("db");
        assert_eq!(cb.failure_threshold(), 5);

        cb.set_failure_threshold(2);
        assert_eq!(cb.failure_threshold(), 2);

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.get_state(), CircuitState::Open, "tuned threshold applies immediately");

        // Floor of 1 so a breaker can never be configured to open on zero
        // failures.
        cb.set_failure_threshold(0);
        assert_eq!(cb.failure_threshold(), 1);
    }

    #[test]
    fn test_transitions_emit_events() {
        let sink = Arc::new(CollectingEventSink::new());
        let config =
            CircuitBreakerConfig::builder().failure_threshold(1).build().expect("valid config");
        let cb = CircuitBreaker::new("db", config)
            .expect("breaker")
            .with_event_sink(Arc::clone(&sink) as Arc<dyn EventSink>);

        cb.record_failure();
        cb.reset();

        let events = sink.events();
        assert_eq!(events.len(), 2);
        match &events[0] {
            ResilienceEvent::StateTransition { name, from, to } => {
                assert_eq!(name, "db");
                assert_eq!(*from, CircuitState::Closed);
                assert_eq!(*to, CircuitState::Open);
            }
            other => panic!("expected StateTransition, got {other:?}"),
        }
    }

    #[test]
    fn test_metrics_snapshot() {
        let cb = CircuitBreaker::with_defaults("db");
        let _ = cb.call(|| Ok::<_, std::io::Error>(()));
        let _ = cb.call(|| Err::<(), _>(std::io::Error::other("boom")));

        let metrics = cb.get_metrics();
        assert_eq!(metrics.state, CircuitState::Closed);
        assert_eq!(metrics.total_calls, 2);
        assert_eq!(metrics.failure_count, 1);
        assert!(metrics.last_failure_time.is_some());
    }

    #[test]
    fn test_clone_shares_state() {
        let cb1 = CircuitBreaker::with_defaults("db");
        cb1.record_failure();

        let cb2 = cb1.clone();
        assert_eq!(cb2.get_metrics().failure_count, 1);
        assert_eq!(cb2.get_state(), cb1.get_state());
    }

    #[tokio::test]
    async fn test_concurrent_access() {
        let cb = Arc::new(CircuitBreaker::with_defaults("db"));
        let mut handles = vec![];

        for _ in 0..10 {
            let cb_clone = Arc::clone(&cb);
            handles.push(tokio::spawn(async move {
                let _ = cb_clone.call(|| Ok::<_, std::io::Error>(()));
            }));
        }

        for handle in handles {
            handle.await.expect("task should complete");
        }

        assert_eq!(cb.get_metrics().total_calls, 10);
        assert_eq!(cb.get_state(), CircuitState::Closed);
    }
}
