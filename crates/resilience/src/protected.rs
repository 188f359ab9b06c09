//! The protected-call composition: bulkhead → circuit breaker → retry
//!
//! The nesting order is deliberate. The bulkhead guards local resource
//! exhaustion independent of the remote dependency's health, so a saturated
//! pool rejects before any breaker or retry work happens. The breaker then
//! decides whether a known-bad dependency should be attempted at all, and
//! retry absorbs transient blips within an already-admitted, already-allowed
//! call. The slot is released on every exit path, panics included.

use std::future::Future;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, instrument};

use crate::error::{panic_message, ClassifyError, ResilienceError, ResilienceResult};
use crate::registry::ResilienceRegistry;
use crate::retry::{RetryExecutor, RetryPolicy};

impl ResilienceRegistry {
    /// Run an operation behind the full protection stack
    ///
    /// 1. Checkout a slot from the named bulkhead, waiting up to `timeout`;
    ///    `BulkheadFull`/`CheckoutTimeout` return immediately with no
    ///    breaker or retry interaction.
    /// 2. Inside the slot, ask the named breaker for admission, then run the
    ///    retry loop around the operation. The breaker records the overall
    ///    outcome of the admitted call.
    /// 3. Release the slot on every exit path, including panics.
    /// 4. The innermost error propagates unchanged.
    #[instrument(skip(self, policy, operation))]
    pub async fn protected_call<F, Fut, T, E>(
        &self,
        circuit: &str,
        pool: &str,
        policy: RetryPolicy,
        timeout: Duration,
        operation: F,
    ) -> ResilienceResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ClassifyError + std::error::Error + Send + Sync + 'static,
    {
        let bulkhead = self.bulkhead(pool);
        let guard = match bulkhead.checkout_within(timeout).await {
            Ok(guard) => guard,
            Err(rejection) => {
                debug!(%pool, "bulkhead rejected protected call");
                return Err(rejection.into());
            }
        };

        let breaker = self.breaker(circuit);
        if !breaker.try_acquire() {
            debug!(%circuit, "circuit breaker rejected protected call");
            guard.release();
            return Err(ResilienceError::CircuitOpen { name: circuit.to_string() });
        }

        let executor = RetryExecutor::new(policy).with_event_sink(self.events());
        let outcome = std::panic::AssertUnwindSafe(executor.execute(operation)).catch_unwind().await;

        let result = match outcome {
            Ok(result) => {
                // The breaker observes the admitted call's overall outcome,
                // not each individual retry attempt.
                match &result {
                    Ok(_) => breaker.record_success(),
                    Err(_) => breaker.record_failure(),
                }
                result
            }
            Err(payload) => {
                // The crash happened before the operation reported, so it
                // counts as an exit-class failure.
                breaker.record_failure();
                Err(ResilienceError::Panicked { message: panic_message(payload) })
            }
        };

        guard.release();
        result
    }

    /// [`Self::protected_call`] with a degraded-path substitute
    ///
    /// The fallback runs only for `CircuitOpen`, `BulkheadFull`, and
    /// `MaxAttemptsReached`. Other errors — including `CheckoutTimeout` and
    /// non-retryable operation failures — propagate unchanged.
    #[allow(clippy::too_many_arguments)]
    pub async fn protected_call_with_fallback<F, Fut, T, E, FB, FbFut>(
        &self,
        circuit: &str,
        pool: &str,
        policy: RetryPolicy,
        timeout: Duration,
        operation: F,
        fallback: FB,
    ) -> ResilienceResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce() -> FbFut,
        FbFut: Future<Output = Result<T, E>>,
        E: ClassifyError + std::error::Error + Send + Sync + 'static,
    {
        match self.protected_call(circuit, pool, policy, timeout, operation).await {
            Err(error) if error.triggers_fallback() => {
                debug!(%circuit, %pool, %error, "protection stack exhausted, using fallback");
                fallback()
                    .await
                    .map_err(|fallback_error| ResilienceError::OperationFailed {
                        source: fallback_error,
                    })
            }
            other => other,
        }
    }
}
