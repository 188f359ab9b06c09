//! Health monitoring: one aggregated signal over breakers, bulkheads, and
//! custom checks
//!
//! The monitor polls registered components on a fixed interval (or on
//! demand via `check_now`) and rolls their statuses into one of
//! healthy/degraded/unhealthy, worst status winning. It only ever reads
//! component snapshots through their public metrics contracts — it never
//! mutates breaker or bulkhead internals.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bulkhead::Bulkhead;
use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::clock::Clock;
use crate::config::HealthConfig;
use crate::event::{default_sink, EventSink, ResilienceEvent};

/// Bulkhead utilization above this contributes resource pressure
const BULKHEAD_PRESSURE_THRESHOLD: f64 = 0.9;

/// Component health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
    /// Check could not determine a status; counts as degraded for rollup
    Unknown,
}

impl HealthState {
    /// Severity for worst-status rollup; `Unknown` ranks with `Degraded`
    fn severity(self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Degraded | Self::Unknown => 1,
            Self::Unhealthy => 2,
        }
    }

    /// The worse of two statuses under rollup rules
    pub fn worst(self, other: Self) -> Self {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Outcome of one component check
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    pub status: HealthState,
    pub details: Option<String>,
}

impl HealthCheckResult {
    pub fn healthy() -> Self {
        Self { status: HealthState::Healthy, details: None }
    }

    pub fn degraded(details: impl Into<String>) -> Self {
        Self { status: HealthState::Degraded, details: Some(details.into()) }
    }

    pub fn unhealthy(details: impl Into<String>) -> Self {
        Self { status: HealthState::Unhealthy, details: Some(details.into()) }
    }

    pub fn unknown() -> Self {
        Self { status: HealthState::Unknown, details: None }
    }
}

impl From<HealthState> for HealthCheckResult {
    fn from(status: HealthState) -> Self {
        Self { status, details: None }
    }
}

/// Latest observation for one registered component
#[derive(Debug, Clone, Serialize)]
pub struct ComponentReport {
    pub status: HealthState,
    pub details: Option<String>,
    pub last_check: SystemTime,
}

/// Aggregated health snapshot
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub overall: HealthState,
    pub components: HashMap<String, ComponentReport>,
}

impl HealthReport {
    fn from_components(components: HashMap<String, ComponentReport>) -> Self {
        let overall = components
            .values()
            .map(|report| report.status)
            .fold(HealthState::Healthy, HealthState::worst);
        Self { overall, components }
    }
}

type CheckFn = dyn Fn() -> HealthCheckResult + Send + Sync;

/// Periodic health aggregator, one instance per process
///
/// Components register and deregister at any time; check results are
/// ephemeral and overwritten each cycle. Handles are cheap to clone.
#[derive(Clone)]
pub struct HealthMonitor {
    config: HealthConfig,
    checks: Arc<RwLock<HashMap<String, Arc<CheckFn>>>>,
    reports: Arc<RwLock<HashMap<String, ComponentReport>>>,
    events: Arc<dyn EventSink>,
}

impl fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("check_interval", &self.config.check_interval)
            .field("components", &self.checks.read().len())
            .finish()
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}

impl HealthMonitor {
    /// Create a monitor with the given configuration
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            checks: Arc::new(RwLock::new(HashMap::new())),
            reports: Arc::new(RwLock::new(HashMap::new())),
            events: default_sink(),
        }
    }

    /// Replace the event sink (builder style)
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Register a custom component check
    ///
    /// A panicking check is reported as unhealthy; it cannot take the
    /// monitor down.
    pub fn register_component(
        &self,
        name: impl Into<String>,
        check: impl Fn() -> HealthCheckResult + Send + Sync + 'static,
    ) {
        self.checks.write().insert(name.into(), Arc::new(check));
    }

    /// Remove a component and its last report
    pub fn deregister(&self, name: &str) {
        self.checks.write().remove(name);
        self.reports.write().remove(name);
    }

    /// Register the built-in rollup for a circuit breaker
    ///
    /// `open` contributes unhealthy, `half_open` degraded.
    pub fn register_breaker<C: Clock>(&self, breaker: &CircuitBreaker<C>) {
        let name = format!("circuit:{}", breaker.name());
        let breaker = breaker.clone();
        self.register_component(name, move || match breaker.get_state() {
            CircuitState::Open => HealthCheckResult::unhealthy("circuit open"),
            CircuitState::HalfOpen => HealthCheckResult::degraded("circuit half-open"),
            CircuitState::Closed => HealthCheckResult::healthy(),
        });
    }

    /// Register the built-in rollup for a bulkhead
    ///
    /// Utilization above 90% contributes degraded, capped there: a
    /// saturated pool is self-correcting resource pressure, not an outage.
    pub fn register_bulkhead<C: Clock>(&self, bulkhead: &Bulkhead<C>) {
        let name = format!("bulkhead:{}", bulkhead.name());
        let bulkhead = bulkhead.clone();
        self.register_component(name, move || {
            let metrics = bulkhead.get_metrics();
            let utilization = metrics.utilization();
            if utilization > BULKHEAD_PRESSURE_THRESHOLD {
                HealthCheckResult::degraded(format!(
                    "utilization {:.0}%, {} waiting",
                    utilization * 100.0,
                    metrics.queue_size
                ))
            } else {
                HealthCheckResult::healthy()
            }
        });
    }

    /// Force an immediate evaluation of every registered component
    pub fn check_now(&self) -> HealthReport {
        let checks: Vec<(String, Arc<CheckFn>)> =
            self.checks.read().iter().map(|(name, check)| (name.clone(), Arc::clone(check))).collect();

        let mut fresh: HashMap<String, ComponentReport> = HashMap::with_capacity(checks.len());
        for (name, check) in checks {
            let result = catch_unwind(AssertUnwindSafe(|| check())).unwrap_or_else(|_| {
                warn!(component = %name, "health check panicked");
                HealthCheckResult::unhealthy("health check panicked")
            });
            fresh.insert(
                name,
                ComponentReport {
                    status: result.status,
                    details: result.details,
                    last_check: SystemTime::now(),
                },
            );
        }

        // Emit a change event for every component whose status moved since
        // the previous cycle.
        {
            let previous = self.reports.read();
            for (name, report) in &fresh {
                if let Some(old) = previous.get(name) {
                    if old.status != report.status {
                        self.events.emit(&ResilienceEvent::HealthChanged {
                            name: name.clone(),
                            from: old.status,
                            to: report.status,
                        });
                    }
                }
            }
        }

        *self.reports.write() = fresh.clone();
        let report = HealthReport::from_components(fresh);
        debug!(overall = %report.overall, components = report.components.len(), "health cycle");
        report
    }

    /// Aggregated view of the most recent check cycle
    ///
    /// Does not run checks; an empty monitor reports healthy.
    pub fn get_health(&self) -> HealthReport {
        HealthReport::from_components(self.reports.read().clone())
    }

    /// Run `check_now` on the configured interval until the handle is
    /// aborted
    pub fn spawn(&self) -> tokio::task::JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitor.config.check_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                monitor.check_now();
            }
        })
    }
}
