//! Retry with exponential backoff and failure-kind classification
//!
//! Pure policy plus a small executor: given an attempt number and a
//! classified error, decide whether to retry and how long to wait. The
//! executor owns no persistent state; the adaptive bookkeeping lives on the
//! loop's stack, local to one invocation, so unrelated call chains never
//! cross-talk.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::config::duration_ms;
use crate::error::{
    ClassifyError, ConfigError, ConfigResult, FailureKind, ResilienceError, ResilienceResult,
};
use crate::event::{default_sink, EventSink, ResilienceEvent};

fn default_retryable_kinds() -> HashSet<FailureKind> {
    [FailureKind::Timeout, FailureKind::Connection, FailureKind::Resource].into_iter().collect()
}

/// Adaptive retry extension, applied per invocation
///
/// The thresholds are empirically chosen tuning knobs, not correctness
/// requirements, so every one of them is configurable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveRetry {
    /// Stop early once a signature recurs this many times...
    pub recurrence_hits: u32,
    /// ...within this many most recent attempts
    pub recurrence_window: u32,
    /// Extra attempts granted to timeout-class failures (network may still
    /// recover)
    pub timeout_extra_attempts: u32,
    /// Backoff scaling for timeout-class failures
    pub timeout_backoff_factor: f64,
    /// Attempts removed for crash-class failures (a crashed dependency will
    /// not self-heal on this timescale)
    pub crash_attempt_penalty: u32,
    /// Backoff scaling for crash-class failures
    pub crash_backoff_factor: f64,
}

impl Default for AdaptiveRetry {
    fn default() -> Self {
        Self {
            recurrence_hits: 2,
            recurrence_window: 3,
            timeout_extra_attempts: 2,
            timeout_backoff_factor: 1.5,
            crash_attempt_penalty: 1,
            crash_backoff_factor: 0.7,
        }
    }
}

/// Retry policy value object
///
/// No identity, cheap to clone, safe to share between unrelated operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, first try included
    pub max_attempts: u32,
    /// Backoff before the second attempt
    #[serde(with = "duration_ms")]
    pub base_backoff: Duration,
    /// Upper bound on any computed backoff
    #[serde(with = "duration_ms")]
    pub max_backoff: Duration,
    /// Exponential growth factor per attempt
    pub backoff_multiplier: f64,
    /// Add a random amount in `[0, 0.2 * wait]` to each backoff
    pub jitter: bool,
    /// Failure kinds worth retrying; anything else surfaces immediately
    #[serde(default = "default_retryable_kinds")]
    pub retryable_kinds: HashSet<FailureKind>,
    /// Optional adaptive extension
    #[serde(default)]
    pub adaptive: Option<AdaptiveRetry>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(30_000),
            backoff_multiplier: 2.0,
            jitter: true,
            retryable_kinds: default_retryable_kinds(),
            adaptive: None,
        }
    }
}

impl RetryPolicy {
    /// Create a policy builder
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// Default policy with the adaptive extension enabled
    pub fn adaptive() -> Self {
        Self { adaptive: Some(AdaptiveRetry::default()), ..Self::default() }
    }

    /// Validate the policy
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts must be greater than 0"));
        }
        if self.backoff_multiplier <= 0.0 {
            return Err(ConfigError::invalid("backoff_multiplier must be greater than 0"));
        }
        if self.base_backoff > self.max_backoff {
            return Err(ConfigError::invalid("base_backoff must not exceed max_backoff"));
        }
        Ok(())
    }

    /// Attempts allowed for a failure kind, after adaptive adjustment
    pub fn allowed_attempts(&self, kind: FailureKind) -> u32 {
        match (&self.adaptive, kind) {
            (Some(adaptive), FailureKind::Timeout) => {
                self.max_attempts.saturating_add(adaptive.timeout_extra_attempts)
            }
            (Some(adaptive), FailureKind::Crash) => {
                self.max_attempts.saturating_sub(adaptive.crash_attempt_penalty).max(1)
            }
            _ => self.max_attempts,
        }
    }

    /// Backoff before the attempt following `attempt` (1-based)
    ///
    /// `min(max_backoff, base_backoff * multiplier^(attempt-1))`, scaled by
    /// the adaptive per-kind factor, plus jitter when enabled.
    pub fn backoff_for(&self, attempt: u32, kind: FailureKind) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let max_ms = self.max_backoff.as_millis() as f64;

        let raw = self.base_backoff.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let wait_ms = raw.min(max_ms) * self.kind_backoff_factor(kind);
        let wait = Duration::from_millis(wait_ms.min(max_ms) as u64);

        if self.jitter {
            let cap = wait.as_millis() as u64 / 5;
            wait + Duration::from_millis(rand::thread_rng().gen_range(0..=cap))
        } else {
            wait
        }
    }

    fn kind_backoff_factor(&self, kind: FailureKind) -> f64 {
        match (&self.adaptive, kind) {
            (Some(adaptive), FailureKind::Timeout) => adaptive.timeout_backoff_factor,
            (Some(adaptive), FailureKind::Crash) => adaptive.crash_backoff_factor,
            _ => 1.0,
        }
    }
}

/// Builder for [`RetryPolicy`]
#[derive(Debug, Default)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    pub fn new() -> Self {
        Self { policy: RetryPolicy::default() }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.policy.max_attempts = attempts;
        self
    }

    pub fn base_backoff(mut self, backoff: Duration) -> Self {
        self.policy.base_backoff = backoff;
        self
    }

    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.policy.max_backoff = backoff;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.policy.backoff_multiplier = multiplier;
        self
    }

    pub fn no_jitter(mut self) -> Self {
        self.policy.jitter = false;
        self
    }

    pub fn retry_on(mut self, kind: FailureKind) -> Self {
        self.policy.retryable_kinds.insert(kind);
        self
    }

    pub fn retryable_kinds(mut self, kinds: impl IntoIterator<Item = FailureKind>) -> Self {
        self.policy.retryable_kinds = kinds.into_iter().collect();
        self
    }

    pub fn adaptive(mut self, adaptive: AdaptiveRetry) -> Self {
        self.policy.adaptive = Some(adaptive);
        self
    }

    pub fn build(self) -> ConfigResult<RetryPolicy> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}

/// Executes operations under a [`RetryPolicy`]
///
/// Reentrant: a single executor may serve concurrent invocations; each
/// invocation carries its own adaptive record.
pub struct RetryExecutor {
    policy: RetryPolicy,
    events: Arc<dyn EventSink>,
}

impl RetryExecutor {
    /// Create an executor for the given policy
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, events: default_sink() }
    }

    /// Replace the event sink (builder style)
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// The policy this executor runs under
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run the operation, retrying per policy
    ///
    /// Intermediate failures are suppressed between attempts; the last one
    /// always surfaces, wrapped in `MaxAttemptsReached` when attempts ran
    /// out or `NonRetryable` when its kind is excluded from the policy.
    #[instrument(skip(self, operation), fields(max_attempts = self.policy.max_attempts))]
    pub async fn execute<F, Fut, T, E>(&self, mut operation: F) -> ResilienceResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ClassifyError + std::error::Error + Send + Sync + 'static,
    {
        let mut attempt: u32 = 1;
        // Recurrence record for this invocation only.
        let mut recent: VecDeque<String> = VecDeque::new();

        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "operation succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    let kind = error.failure_kind();

                    if !self.policy.retryable_kinds.contains(&kind) {
                        debug!(%kind, "error kind excluded from retry policy");
                        return Err(ResilienceError::NonRetryable { source: error });
                    }

                    if let Some(adaptive) = &self.policy.adaptive {
                        let signature = error.signature();
                        recent.push_back(signature.clone());
                        while recent.len() > adaptive.recurrence_window as usize {
                            recent.pop_front();
                        }
                        let hits = recent.iter().filter(|s| **s == signature).count() as u32;
                        if hits >= adaptive.recurrence_hits {
                            warn!(
                                %signature,
                                attempt, "recurring failure pattern, stopping retries early"
                            );
                            self.events.emit(&ResilienceEvent::RetriesExhausted { attempts: attempt });
                            return Err(ResilienceError::MaxAttemptsReached {
                                attempts: attempt,
                                source: error,
                            });
                        }
                    }

                    if attempt >= self.policy.allowed_attempts(kind) {
                        warn!(attempts = attempt, "all retry attempts exhausted");
                        self.events.emit(&ResilienceEvent::RetriesExhausted { attempts: attempt });
                        return Err(ResilienceError::MaxAttemptsReached {
                            attempts: attempt,
                            source: error,
                        });
                    }

                    let delay = self.policy.backoff_for(attempt, kind);
                    self.events.emit(&ResilienceEvent::RetryAttempt { attempt, delay, kind });
                    debug!(attempt, ?delay, %kind, "operation failed, backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Convenience: run one operation under a policy
pub async fn with_retry<F, Fut, T, E>(policy: RetryPolicy, operation: F) -> ResilienceResult<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: ClassifyError + std::error::Error + Send + Sync + 'static,
{
    RetryExecutor::new(policy).execute(operation).await
}
