//! Structured event emission for external observability collaborators
//!
//! Every state transition, checkout rejection/timeout, retry attempt, and
//! health change is delivered to an [`EventSink`]. The core does not format
//! or ship events itself; the default sink logs structured fields via
//! `tracing` and metrics/alerting layers plug in their own sink.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::circuit_breaker::CircuitState;
use crate::error::FailureKind;
use crate::health::HealthState;

/// A structured observability event `(kind, name, attributes)`
#[derive(Debug, Clone)]
pub enum ResilienceEvent {
    /// A circuit breaker changed state
    StateTransition { name: String, from: CircuitState, to: CircuitState },
    /// A checkout was rejected because pool and queue are saturated
    CheckoutRejected { name: String, capacity: usize, waiting: usize },
    /// A queued checkout hit its deadline before a slot freed
    CheckoutTimedOut { name: String, waited: Duration },
    /// A slot held past its lease was force-released
    SlotReclaimed { name: String, slot: usize },
    /// A retry attempt failed and the caller is backing off
    RetryAttempt { attempt: u32, delay: Duration, kind: FailureKind },
    /// The retry loop gave up
    RetriesExhausted { attempts: u32 },
    /// The adaptive tuner moved a breaker's failure threshold
    ThresholdAdjusted { name: String, from: u64, to: u64 },
    /// A monitored component's status changed between check cycles
    HealthChanged { name: String, from: HealthState, to: HealthState },
}

impl ResilienceEvent {
    /// Stable kind tag for downstream routing
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StateTransition { .. } => "state_transition",
            Self::CheckoutRejected { .. } => "checkout_rejected",
            Self::CheckoutTimedOut { .. } => "checkout_timed_out",
            Self::SlotReclaimed { .. } => "slot_reclaimed",
            Self::RetryAttempt { .. } => "retry_attempt",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::ThresholdAdjusted { .. } => "threshold_adjusted",
            Self::HealthChanged { .. } => "health_changed",
        }
    }
}

/// Consumer of resilience events
///
/// Implementations must be cheap and non-blocking; events are emitted from
/// hot paths while no internal locks are held.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &ResilienceEvent);
}

/// Default sink: structured tracing output
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &ResilienceEvent) {
        match event {
            ResilienceEvent::StateTransition { name, from, to } => {
                info!(kind = event.kind(), %name, %from, %to, "circuit breaker state changed");
            }
            ResilienceEvent::CheckoutRejected { name, capacity, waiting } => {
                warn!(kind = event.kind(), %name, capacity, waiting, "bulkhead checkout rejected");
            }
            ResilienceEvent::CheckoutTimedOut { name, waited } => {
                warn!(kind = event.kind(), %name, ?waited, "bulkhead checkout timed out");
            }
            ResilienceEvent::SlotReclaimed { name, slot } => {
                warn!(kind = event.kind(), %name, slot, "expired bulkhead slot reclaimed");
            }
            ResilienceEvent::RetryAttempt { attempt, delay, kind } => {
                debug!(kind = event.kind(), attempt, ?delay, failure = %kind, "retrying after backoff");
            }
            ResilienceEvent::RetriesExhausted { attempts } => {
                warn!(kind = event.kind(), attempts, "retry attempts exhausted");
            }
            ResilienceEvent::ThresholdAdjusted { name, from, to } => {
                info!(kind = event.kind(), %name, from, to, "failure threshold adjusted");
            }
            ResilienceEvent::HealthChanged { name, from, to } => {
                info!(kind = event.kind(), %name, %from, %to, "component health changed");
            }
        }
    }
}

/// Sink that records every event, for assertions in tests
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: Mutex<Vec<ResilienceEvent>>,
}

impl CollectingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything emitted so far
    pub fn events(&self) -> Vec<ResilienceEvent> {
        self.events.lock().clone()
    }

    /// Count of events matching a kind tag
    pub fn count_kind(&self, kind: &str) -> usize {
        self.events.lock().iter().filter(|e| e.kind() == kind).count()
    }
}

impl EventSink for CollectingEventSink {
    fn emit(&self, event: &ResilienceEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Shared handle to a sink, defaulting to [`TracingEventSink`]
pub(crate) fn default_sink() -> Arc<dyn EventSink> {
    Arc::new(TracingEventSink)
}
