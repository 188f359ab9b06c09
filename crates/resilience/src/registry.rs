//! Named registries of circuit breakers and bulkheads
//!
//! One breaker and one bulkhead per protected dependency name, created on
//! first use from the injected [`ConfigProvider`] and shared from then on.
//! No global mutable state is shared between names; each instance owns its
//! state exclusively.

use std::sync::Arc;

use dashmap::DashMap;

use crate::bulkhead::Bulkhead;
use crate::circuit_breaker::CircuitBreaker;
use crate::config::{ConfigProvider, StaticConfigProvider};
use crate::event::{default_sink, EventSink};
use crate::health::HealthMonitor;
use crate::retry::RetryPolicy;
use tracing::warn;

/// Shared home for every named breaker and bulkhead in the process
pub struct ResilienceRegistry {
    provider: Arc<dyn ConfigProvider>,
    breakers: DashMap<String, CircuitBreaker>,
    bulkheads: DashMap<String, Bulkhead>,
    events: Arc<dyn EventSink>,
}

impl Default for ResilienceRegistry {
    fn default() -> Self {
        Self::new(Arc::new(StaticConfigProvider::new()))
    }
}

impl ResilienceRegistry {
    /// Create a registry reading tunables from the given provider
    pub fn new(provider: Arc<dyn ConfigProvider>) -> Self {
        Self {
            provider,
            breakers: DashMap::new(),
            bulkheads: DashMap::new(),
            events: default_sink(),
        }
    }

    /// Replace the event sink handed to every created instance (builder
    /// style)
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub(crate) fn events(&self) -> Arc<dyn EventSink> {
        Arc::clone(&self.events)
    }

    /// Get or create the breaker for a dependency name
    ///
    /// Instances live for the process lifetime; a provider returning an
    /// invalid configuration falls back to defaults rather than failing the
    /// call site.
    pub fn breaker(&self, name: &str) -> CircuitBreaker {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                let config = self.provider.circuit_config(name);
                match CircuitBreaker::new(name, config) {
                    Ok(breaker) => breaker.with_event_sink(Arc::clone(&self.events)),
                    Err(error) => {
                        warn!(%name, %error, "invalid circuit config, using defaults");
                        CircuitBreaker::with_defaults(name)
                            .with_event_sink(Arc::clone(&self.events))
                    }
                }
            })
            .clone()
    }

    /// Get or create the bulkhead for a dependency name
    pub fn bulkhead(&self, name: &str) -> Bulkhead {
        self.bulkheads
            .entry(name.to_string())
            .or_insert_with(|| {
                let config = self.provider.bulkhead_config(name);
                match Bulkhead::new(name, config) {
                    Ok(bulkhead) => bulkhead.with_event_sink(Arc::clone(&self.events)),
                    Err(error) => {
                        warn!(%name, %error, "invalid bulkhead config, using defaults");
                        Bulkhead::with_defaults(name).with_event_sink(Arc::clone(&self.events))
                    }
                }
            })
            .clone()
    }

    /// Retry policy for an operation class, validated
    pub fn retry_policy(&self, name: &str) -> RetryPolicy {
        let policy = self.provider.retry_policy(name);
        if let Err(error) = policy.validate() {
            warn!(%name, %error, "invalid retry policy, using defaults");
            return RetryPolicy::default();
        }
        policy
    }

    /// Re-read the provider and apply mutable parameters to live instances
    ///
    /// Breaker thresholds are atomics, so a hot configuration change takes
    /// effect without replacing instances or losing state. Pool sizes are
    /// fixed at creation and are not resized here.
    pub fn refresh(&self) {
        for entry in self.breakers.iter() {
            let config = self.provider.circuit_config(entry.key());
            if config.validate().is_ok() {
                entry.value().set_failure_threshold(config.failure_threshold);
                entry.value().set_success_threshold(config.success_threshold);
            }
        }
    }

    /// Register every known breaker and bulkhead with a health monitor
    pub fn register_health(&self, monitor: &HealthMonitor) {
        for entry in self.breakers.iter() {
            monitor.register_breaker(entry.value());
        }
        for entry in self.bulkheads.iter() {
            monitor.register_bulkhead(entry.value());
        }
    }

    /// Sweep every bulkhead for slots held past their lease
    pub fn reclaim_expired_slots(&self) -> usize {
        self.bulkheads.iter().map(|entry| entry.value().reclaim_expired()).sum()
    }

    /// Reset every breaker to closed (operational use)
    pub fn reset_breakers(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }

    /// Names with a live breaker
    pub fn breaker_names(&self) -> Vec<String> {
        self.breakers.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Names with a live bulkhead
    pub fn bulkhead_names(&self) -> Vec<String> {
        self.bulkheads.iter().map(|entry| entry.key().clone()).collect()
    }
}
