//! Runtime-tunable configuration for the resilience layer
//!
//! The core never assumes a storage mechanism: tunables are sourced from a
//! read-only [`ConfigProvider`] injected at construction. A provider backed
//! by a live store makes the layer hot-reloadable; the registry re-reads it
//! on [`crate::registry::ResilienceRegistry::refresh`] and applies mutable
//! parameters to live instances.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::bulkhead::BulkheadConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::retry::RetryPolicy;

/// Serde helper: `Duration` as integer milliseconds
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Serde helper: `Option<Duration>` as optional integer milliseconds
pub mod duration_ms_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

/// Configuration for the health monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Interval between periodic check cycles
    #[serde(with = "duration_ms")]
    pub check_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { check_interval: Duration::from_millis(30_000) }
    }
}

/// Read-only source of per-name tunables
///
/// Implementations may be static, file-backed, or wired to a live
/// configuration store. Providers are consulted when an instance is first
/// created for a name and again on every registry refresh, so a provider
/// returning updated values tunes live breakers without replacing them.
pub trait ConfigProvider: Send + Sync {
    /// Configuration for the named circuit breaker
    fn circuit_config(&self, name: &str) -> CircuitBreakerConfig;

    /// Configuration for the named bulkhead
    fn bulkhead_config(&self, name: &str) -> BulkheadConfig;

    /// Retry policy for the named operation class
    fn retry_policy(&self, name: &str) -> RetryPolicy;

    /// Health monitor configuration
    fn health_config(&self) -> HealthConfig {
        HealthConfig::default()
    }
}

/// In-memory provider: defaults plus per-name overrides
///
/// The overrides are concurrently mutable, which is enough to emulate a hot
/// configuration store in tests and small deployments.
#[derive(Default)]
pub struct StaticConfigProvider {
    circuit_default: CircuitBreakerConfig,
    bulkhead_default: BulkheadConfig,
    retry_default: RetryPolicy,
    health: HealthConfig,
    circuit_overrides: DashMap<String, CircuitBreakerConfig>,
    bulkhead_overrides: DashMap<String, BulkheadConfig>,
    retry_overrides: DashMap<String, RetryPolicy>,
}

impl StaticConfigProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the default circuit configuration
    pub fn with_circuit_default(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_default = config;
        self
    }

    /// Replace the default bulkhead configuration
    pub fn with_bulkhead_default(mut self, config: BulkheadConfig) -> Self {
        self.bulkhead_default = config;
        self
    }

    /// Replace the default retry policy
    pub fn with_retry_default(mut self, policy: RetryPolicy) -> Self {
        self.retry_default = policy;
        self
    }

    /// Replace the health monitor configuration
    pub fn with_health_config(mut self, config: HealthConfig) -> Self {
        self.health = config;
        self
    }

    /// Set or update a per-name circuit override
    pub fn set_circuit(&self, name: impl Into<String>, config: CircuitBreakerConfig) {
        self.circuit_overrides.insert(name.into(), config);
    }

    /// Set or update a per-name bulkhead override
    pub fn set_bulkhead(&self, name: impl Into<String>, config: BulkheadConfig) {
        self.bulkhead_overrides.insert(name.into(), config);
    }

    /// Set or update a per-name retry override
    pub fn set_retry(&self, name: impl Into<String>, policy: RetryPolicy) {
        self.retry_overrides.insert(name.into(), policy);
    }

    /// Wrap in an `Arc` for injection
    pub fn into_shared(self) -> Arc<dyn ConfigProvider> {
        Arc::new(self)
    }
}

impl ConfigProvider for StaticConfigProvider {
    fn circuit_config(&self, name: &str) -> CircuitBreakerConfig {
        self.circuit_overrides
            .get(name)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| self.circuit_default.clone())
    }

    fn bulkhead_config(&self, name: &str) -> BulkheadConfig {
        self.bulkhead_overrides
            .get(name)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| self.bulkhead_default.clone())
    }

    fn retry_policy(&self, name: &str) -> RetryPolicy {
        self.retry_overrides
            .get(name)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| self.retry_default.clone())
    }

    fn health_config(&self) -> HealthConfig {
        self.health.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_config_default() {
        let config = HealthConfig::default();
        assert_eq!(config.check_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_static_provider_falls_back_to_defaults() {
        let provider = StaticConfigProvider::new();
        let circuit = provider.circuit_config("anything");
        assert_eq!(circuit.failure_threshold, 5);

        let bulkhead = provider.bulkhead_config("anything");
        assert_eq!(bulkhead.max_concurrent, 10);

        let retry = provider.retry_policy("anything");
        assert_eq!(retry.max_attempts, 5);
    }

    #[test]
    fn test_static_provider_per_name_override() {
        let provider = StaticConfigProvider::new();
        let tight = CircuitBreakerConfig::builder().failure_threshold(2).build().expect("valid");
        provider.set_circuit("llm-api", tight);

        assert_eq!(provider.circuit_config("llm-api").failure_threshold, 2);
        assert_eq!(provider.circuit_config("amqp").failure_threshold, 5);
    }

    #[test]
    fn test_overrides_are_live() {
        let provider = StaticConfigProvider::new();
        assert_eq!(provider.circuit_config("db").failure_threshold, 5);

        // Emulates a hot configuration store pushing a new value.
        let updated = CircuitBreakerConfig::builder().failure_threshold(8).build().expect("valid");
        provider.set_circuit("db", updated);
        assert_eq!(provider.circuit_config("db").failure_threshold, 8);
    }

    #[test]
    fn test_duration_ms_opt_roundtrip() {
        #[derive(Serialize, Deserialize)]
        struct Lease {
            #[serde(default, with = "duration_ms_opt")]
            lease: Option<Duration>,
        }

        let json = serde_json::to_string(&Lease { lease: Some(Duration::from_millis(250)) })
            .expect("serialize");
        assert!(json.contains("250"));

        let back: Lease = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.lease, Some(Duration::from_millis(250)));

        let none: Lease = serde_json::from_str("{}").expect("deserialize default");
        assert_eq!(none.lease, None);
    }
}
