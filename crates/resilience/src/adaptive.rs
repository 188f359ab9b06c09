//! Self-adjusting failure thresholds for circuit breakers
//!
//! A pluggable strategy layered on top of the base state machine: the
//! breaker stays simple, and the tuner adjusts its failure threshold between
//! calls based on a rolling window of observed outcomes. High recent error
//! volume lowers the threshold (more sensitive); a clean recent history
//! raises it (more tolerant). Adjustments are clamped to
//! `[max(2, base * 0.7), base * 2]` and happen at most once per adaptation
//! window.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::circuit_breaker::CircuitBreaker;
use crate::clock::{Clock, SystemClock};
use crate::config::duration_ms;
use crate::error::{ClassifyError, ConfigError, ConfigResult, ResilienceError, ResilienceResult};
use crate::event::{default_sink, EventSink, ResilienceEvent};

/// Configuration for the adaptive threshold strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveThresholdConfig {
    /// Minimum time between threshold adjustments; also the warm-up period
    /// before the first one
    #[serde(with = "duration_ms")]
    pub adaptation_window: Duration,
    /// Number of recent outcomes kept in the rolling window
    pub window_size: usize,
    /// Error rate the tuner steers toward (0.0 to 1.0)
    pub target_error_rate: f64,
}

impl Default for AdaptiveThresholdConfig {
    fn default() -> Self {
        Self {
            adaptation_window: Duration::from_millis(300_000),
            window_size: 50,
            target_error_rate: 0.1,
        }
    }
}

impl AdaptiveThresholdConfig {
    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.window_size == 0 {
            return Err(ConfigError::invalid("window_size must be greater than 0"));
        }
        if !(0.0..=1.0).contains(&self.target_error_rate) {
            return Err(ConfigError::invalid("target_error_rate must be between 0.0 and 1.0"));
        }
        Ok(())
    }
}

struct Observation {
    success: bool,
    /// Failure signature by error class; `None` for successes
    signature: Option<String>,
}

/// Rolling-window threshold tuner
///
/// Owns no breaker; it is applied to one through
/// [`AdaptiveThreshold::maybe_adjust`], which writes through
/// `set_failure_threshold`. One tuner per breaker — the window is the
/// breaker's recent history.
pub struct AdaptiveThreshold<C: Clock = SystemClock> {
    config: AdaptiveThresholdConfig,
    base_threshold: u64,
    observations: Mutex<VecDeque<Observation>>,
    last_adjustment: Mutex<Instant>,
    adjustments: AtomicU64,
    events: Arc<dyn EventSink>,
    clock: Arc<C>,
}

impl AdaptiveThreshold<SystemClock> {
    /// Create a tuner for a breaker whose configured threshold is
    /// `base_threshold`
    pub fn new(base_threshold: u64, config: AdaptiveThresholdConfig) -> ConfigResult<Self> {
        Self::with_clock(base_threshold, config, SystemClock)
    }
}

impl<C: Clock> AdaptiveThreshold<C> {
    /// Create a tuner with a custom clock (useful for testing)
    pub fn with_clock(
        base_threshold: u64,
        config: AdaptiveThresholdConfig,
        clock: C,
    ) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            base_threshold,
            observations: Mutex::new(VecDeque::with_capacity(config.window_size)),
            // Warm-up: no adjustment before one full window has elapsed.
            last_adjustment: Mutex::new(clock.now()),
            adjustments: AtomicU64::new(0),
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

    /// Lowest threshold the tuner will set: `max(2, base * 0.7)`
    pub fn min_threshold(&self) -> u64 {
        ((self.base_threshold as f64 * 0.7) as u64).max(2)
    }

    /// Highest threshold the tuner will set: `base * 2`
    pub fn max_threshold(&self) -> u64 {
        self.base_threshold.saturating_mul(2)
    }

    /// Number of adjustments applied so far
    pub fn adjustments(&self) -> u64 {
        self.adjustments.load(Ordering::Acquire)
    }

    /// Error rate over the rolling window, or `None` when empty
    pub fn recent_error_rate(&self) -> Option<f64> {
        let observations = self.observations.lock();
        if observations.is_empty() {
            return None;
        }
        let failures = observations.iter().filter(|o| !o.success).count();
        Some(failures as f64 / observations.len() as f64)
    }

    /// Record a successful call
    pub fn record_success(&self) {
        self.push(Observation { success: true, signature: None });
    }

    /// Record a failed call with its error signature
    pub fn record_failure(&self, signature: impl Into<String>) {
        self.push(Observation { success: false, signature: Some(signature.into()) });
    }

    fn push(&self, observation: Observation) {
        let mut observations = self.observations.lock();
        observations.push_back(observation);
        while observations.len() > self.config.window_size {
            observations.pop_front();
        }
    }

    /// Adjust the breaker's failure threshold if the window allows it
    ///
    /// At most one adjustment per adaptation window, and none before a full
    /// window has elapsed since construction. Returns the new threshold when
    /// one was applied.
    pub fn maybe_adjust<B: Clock>(&self, breaker: &CircuitBreaker<B>) -> Option<u64> {
        let now = self.clock.now();
        {
            let last = self.last_adjustment.lock();
            if now.duration_since(*last) < self.config.adaptation_window {
                return None;
            }
        }

        let error_rate = self.recent_error_rate()?;
        // The evaluation consumes the window whether or not the threshold
        // moves.
        *self.last_adjustment.lock() = now;

        let current = breaker.failure_threshold();
        let proposed = if error_rate > self.config.target_error_rate {
            current.saturating_sub(1)
        } else if error_rate < self.config.target_error_rate * 0.5 {
            current.saturating_add(1)
        } else {
            current
        };
        let clamped = proposed.clamp(self.min_threshold(), self.max_threshold());

        if clamped == current {
            debug!(name = breaker.name(), error_rate, "threshold unchanged");
            return None;
        }

        breaker.set_failure_threshold(clamped);
        self.adjustments.fetch_add(1, Ordering::Relaxed);
        info!(
            name = breaker.name(),
            from = current,
            to = clamped,
            error_rate,
            "adjusted failure threshold"
        );
        self.events.emit(&ResilienceEvent::ThresholdAdjusted {
            name: breaker.name().to_string(),
            from: current,
            to: clamped,
        });
        Some(clamped)
    }
}

/// Circuit breaker with the adaptive strategy wired in
///
/// A decorator: outcomes feed the tuner, and the tuner nudges the wrapped
/// breaker's threshold between calls. The breaker itself stays a plain
/// [`CircuitBreaker`] and remains individually observable.
pub struct AdaptiveBreaker<C: Clock = SystemClock> {
    breaker: CircuitBreaker<C>,
    tuner: AdaptiveThreshold<C>,
}

impl AdaptiveBreaker<SystemClock> {
    pub fn new(
        breaker: CircuitBreaker<SystemClock>,
        config: AdaptiveThresholdConfig,
    ) -> ConfigResult<Self> {
        let tuner = AdaptiveThreshold::new(breaker.base_failure_threshold(), config)?;
        Ok(Self { breaker, tuner })
    }
}

impl<C: Clock> AdaptiveBreaker<C> {
    /// Create with a custom clock shared by breaker and tuner semantics
    pub fn with_clock(
        breaker: CircuitBreaker<C>,
        config: AdaptiveThresholdConfig,
        clock: C,
    ) -> ConfigResult<Self> {
        let tuner = AdaptiveThreshold::with_clock(breaker.base_failure_threshold(), config, clock)?;
        Ok(Self { breaker, tuner })
    }

    /// The wrapped breaker
    pub fn breaker(&self) -> &CircuitBreaker<C> {
        &self.breaker
    }

    /// The tuning strategy
    pub fn tuner(&self) -> &AdaptiveThreshold<C> {
        &self.tuner
    }

    /// Execute through the breaker, feeding outcomes to the tuner
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ClassifyError + std::error::Error + Send + Sync + 'static,
    {
        let result = self.breaker.execute(operation).await;

        match &result {
            Ok(_) => self.tuner.record_success(),
            Err(ResilienceError::OperationFailed { source }) => {
                self.tuner.record_failure(source.signature());
            }
            Err(ResilienceError::Panicked { .. }) => self.tuner.record_failure("panic"),
            // Rejections are not dependency outcomes; the window only
            // tracks what the dependency actually did.
            Err(_) => {}
        }

        self.tuner.maybe_adjust(&self.breaker);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::clock::MockClock;

    fn tuner(clock: MockClock) -> AdaptiveThreshold<MockClock> {
        let config = AdaptiveThresholdConfig {
            adaptation_window: Duration::from_secs(300),
            window_size: 10,
            target_error_rate: 0.1,
        };
        AdaptiveThreshold::with_clock(5, config, clock).expect("valid config")
    }

    fn breaker(clock: MockClock) -> CircuitBreaker<MockClock> {
        let config = CircuitBreakerConfig::builder().failure_threshold(5).build().expect("valid");
        CircuitBreaker::with_clock("db", config, clock).expect("breaker")
    }

    #[test]
    fn test_config_validation() {
        let mut config = AdaptiveThresholdConfig::default();
        assert!(config.validate().is_ok());

        config.window_size = 0;
        assert!(config.validate().is_err());

        config.window_size = 10;
        config.target_error_rate = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_threshold_bounds() {
        let t = AdaptiveThreshold::new(5, AdaptiveThresholdConfig::default()).expect("tuner");
        assert_eq!(t.min_threshold(), 3, "max(2, 5 * 0.7)");
        assert_eq!(t.max_threshold(), 10);

        let t = AdaptiveThreshold::new(2, AdaptiveThresholdConfig::default()).expect("tuner");
        assert_eq!(t.min_threshold(), 2, "floor of 2");
        assert_eq!(t.max_threshold(), 4);
    }

    #[test]
    fn test_window_is_bounded() {
        let clock = MockClock::new();
        let t = tuner(clock);
        for _ in 0..25 {
            t.record_failure("x");
        }
        // Window size 10, all failures.
        assert_eq!(t.recent_error_rate(), Some(1.0));
        t.record_success();
        assert_eq!(t.recent_error_rate(), Some(0.9));
    }

    /// No adjustment before one full adaptation window has elapsed
    #[test]
    fn test_no_adjustment_during_warmup() {
        let clock = MockClock::new();
        let t = tuner(clock.clone());
        let cb = breaker(clock.clone());

        for _ in 0..10 {
            t.record_failure("boom");
        }
        assert_eq!(t.maybe_adjust(&cb), None, "warm-up window not yet elapsed");
        assert_eq!(cb.failure_threshold(), 5);

        clock.advance(Duration::from_secs(301));
        assert_eq!(t.maybe_adjust(&cb), Some(4), "high error volume lowers the threshold");
        assert_eq!(cb.failure_threshold(), 4);
    }

    /// At most one adjustment per adaptation window
    #[test]
    fn test_single_adjustment_per_window() {
        let clock = MockClock::new();
        let t = tuner(clock.clone());
        let cb = breaker(clock.clone());

        for _ in 0..10 {
            t.record_failure("boom");
        }
        clock.advance(Duration::from_secs(301));
        assert!(t.maybe_adjust(&cb).is_some());
        assert!(t.maybe_adjust(&cb).is_none(), "window consumed");
        assert_eq!(t.adjustments(), 1);

        clock.advance(Duration::from_secs(301));
        assert!(t.maybe_adjust(&cb).is_some(), "next window allows another step");
        assert_eq!(cb.failure_threshold(), 3);
    }

    /// A clean recent history raises the threshold, up to base * 2
    #[test]
    fn test_clean_history_raises_threshold() {
        let clock = MockClock::new();
        let t = tuner(clock.clone());
        let cb = breaker(clock.clone());

        for _ in 0..10 {
            t.record_success();
        }
        clock.advance(Duration::from_secs(301));
        assert_eq!(t.maybe_adjust(&cb), Some(6));

        // Keep raising; it must stop at the max bound.
        for _ in 0..10 {
            clock.advance(Duration::from_secs(301));
            t.maybe_adjust(&cb);
        }
        assert_eq!(cb.failure_threshold(), 10, "clamped at base * 2");
    }

    /// High error volume cannot push the threshold below max(2, base * 0.7)
    #[test]
    fn test_floor_clamp() {
        let clock = MockClock::new();
        let t = tuner(clock.clone());
        let cb = breaker(clock.clone());

        for _ in 0..10 {
            t.record_failure("boom");
        }
        for _ in 0..10 {
            clock.advance(Duration::from_secs(301));
            t.maybe_adjust(&cb);
        }
        assert_eq!(cb.failure_threshold(), 3, "clamped at max(2, base * 0.7)");
    }

    #[test]
    fn test_empty_window_never_adjusts() {
        let clock = MockClock::new();
        let t = tuner(clock.clone());
        let cb = breaker(clock.clone());

        clock.advance(Duration::from_secs(301));
        assert_eq!(t.maybe_adjust(&cb), None);
    }

    #[tokio::test]
    async fn test_adaptive_breaker_feeds_tuner() {
        let clock = MockClock::new();
        let cb = breaker(clock.clone());
        let config = AdaptiveThresholdConfig {
            adaptation_window: Duration::from_secs(60),
            window_size: 10,
            target_error_rate: 0.1,
        };
        let adaptive = AdaptiveBreaker::with_clock(cb, config, clock.clone()).expect("adaptive");

        // Mostly failures, but interleaved successes keep the consecutive
        // counter below the trip threshold.
        for i in 0..8 {
            if i % 2 == 0 {
                let _ = adaptive
                    .execute(|| async { Err::<(), _>(std::io::Error::other("boom")) })
                    .await;
            } else {
                let _ = adaptive.execute(|| async { Ok::<_, std::io::Error>(()) }).await;
            }
        }

        clock.advance(Duration::from_secs(61));
        let _ = adaptive.execute(|| async { Ok::<_, std::io::Error>(()) }).await;

        assert_eq!(adaptive.tuner().adjustments(), 1, "50% error rate forced an adjustment");
        assert_eq!(adaptive.breaker().failure_threshold(), 4);
    }
}
