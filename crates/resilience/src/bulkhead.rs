//! Bulkhead pattern: a fixed slot pool with a FIFO waiting queue
//!
//! Each bulkhead isolates one dependency's concurrency so it cannot starve
//! others. Slots are allocated once at pool creation and cycle between
//! available and busy; callers past the pool size wait in a bounded FIFO
//! queue with a per-waiter deadline, and anything past the queue bound is
//! rejected outright. A freed slot is handed directly to the head waiter,
//! never parked where a newcomer could steal it.
//!
//! Crash safety: the primary net is the RAII [`SlotGuard`], which checks the
//! slot back in on every exit path including panic unwind. The secondary net
//! is lease expiry ([`Bulkhead::reclaim_expired`]) for holders that cannot
//! run destructors.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{duration_ms, duration_ms_opt};
use crate::error::{ConfigError, ConfigResult, ResilienceError};
use crate::event::{default_sink, EventSink, ResilienceEvent};

/// Identifier of one unit of pool capacity
pub type SlotId = usize;

/// Checkout-layer errors
///
/// Converted losslessly into [`ResilienceError`] at the composition
/// boundary, so callers of `with_slot`/`protected_call` see the one crate
/// taxonomy.
#[derive(Debug, Error)]
pub enum CheckoutError {
    /// Pool and waiting queue are both saturated; failed fast, not queued
    #[error("bulkhead '{name}' is full: {capacity} slots busy, {waiting} waiting")]
    Full { name: String, capacity: usize, waiting: usize },

    /// Queued, but the deadline elapsed before a slot freed
    #[error("checkout from bulkhead '{name}' timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },
}

impl<E> From<CheckoutError> for ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: CheckoutError) -> Self {
        match err {
            CheckoutError::Full { name, capacity, waiting } => {
                Self::BulkheadFull { name, capacity, waiting }
            }
            CheckoutError::Timeout { name, timeout } => Self::CheckoutTimeout { name, timeout },
        }
    }
}

/// Configuration for bulkhead behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkheadConfig {
    /// Number of slots in the pool
    pub max_concurrent: usize,
    /// Maximum number of checkouts waiting in queue
    pub max_waiting: usize,
    /// Default deadline for queued checkouts
    #[serde(with = "duration_ms")]
    pub checkout_timeout: Duration,
    /// If set, busy slots held past this lease are eligible for
    /// [`Bulkhead::reclaim_expired`]
    #[serde(default, with = "duration_ms_opt")]
    pub slot_lease: Option<Duration>,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_waiting: 50,
            checkout_timeout: Duration::from_millis(5_000),
            slot_lease: None,
        }
    }
}

impl BulkheadConfig {
    /// Create a configuration builder
    pub fn builder() -> BulkheadConfigBuilder {
        BulkheadConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::invalid("max_concurrent must be greater than 0"));
        }
        Ok(())
    }
}

/// Builder for [`BulkheadConfig`]
#[derive(Debug, Default)]
pub struct BulkheadConfigBuilder {
    config: BulkheadConfig,
}

impl BulkheadConfigBuilder {
    pub fn new() -> Self {
        Self { config: BulkheadConfig::default() }
    }

    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.config.max_concurrent = max;
        self
    }

    pub fn max_waiting(mut self, max: usize) -> Self {
        self.config.max_waiting = max;
        self
    }

    pub fn checkout_timeout(mut self, timeout: Duration) -> Self {
        self.config.checkout_timeout = timeout;
        self
    }

    pub fn slot_lease(mut self, lease: Duration) -> Self {
        self.config.slot_lease = Some(lease);
        self
    }

    pub fn build(self) -> ConfigResult<BulkheadConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Metrics for bulkhead monitoring
///
/// Peaks are monotonic maxima over the pool's lifetime, or since the last
/// [`Bulkhead::reset_metrics`].
#[derive(Debug, Clone)]
pub struct BulkheadMetrics {
    pub total_checkouts: u64,
    pub successful_checkouts: u64,
    pub rejected_checkouts: u64,
    pub timeouts: u64,
    pub current_usage: usize,
    pub peak_usage: usize,
    pub queue_size: usize,
    pub peak_queue_size: usize,
    pub max_concurrent: usize,
}

impl BulkheadMetrics {
    /// Current utilization as a fraction (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        if self.max_concurrent == 0 {
            return 0.0;
        }
        self.current_usage as f64 / self.max_concurrent as f64
    }

    /// Fraction of checkout attempts rejected outright
    pub fn rejection_rate(&self) -> f64 {
        if self.total_checkouts == 0 {
            return 0.0;
        }
        self.rejected_checkouts as f64 / self.total_checkouts as f64
    }

    /// Check if the pool is at capacity
    pub fn is_at_capacity(&self) -> bool {
        self.current_usage >= self.max_concurrent
    }

    /// Get a human-readable status message
    pub fn status_message(&self) -> String {
        format!(
            "Bulkhead: {}/{} slots busy ({:.1}% utilized), {} queued, {} rejected, {} timeouts",
            self.current_usage,
            self.max_concurrent,
            self.utilization() * 100.0,
            self.queue_size,
            self.rejected_checkouts,
            self.timeouts
        )
    }
}

/// Point-in-time view of the pool
#[derive(Debug, Clone)]
pub struct BulkheadState {
    pub available: usize,
    pub busy: usize,
    pub waiting: usize,
    pub max_concurrent: usize,
    pub max_waiting: usize,
}

struct Holder {
    ticket: u64,
    since: Instant,
}

struct Waiter {
    ticket: u64,
    tx: oneshot::Sender<SlotId>,
}

/// Pool bookkeeping, serialized through one mutex (the single-writer owner)
struct PoolState {
    available: Vec<SlotId>,
    busy: HashMap<SlotId, Holder>,
    waiting: VecDeque<Waiter>,
    peak_usage: usize,
    peak_queue_size: usize,
}

impl PoolState {
    fn note_usage(&mut self) {
        self.peak_usage = self.peak_usage.max(self.busy.len());
    }

    fn note_queue(&mut self) {
        self.peak_queue_size = self.peak_queue_size.max(self.waiting.len());
    }
}

/// Bulkhead: fixed-size slot pool with FIFO waiting queue
///
/// Handles are cheap to clone (shared internals); every [`SlotGuard`] holds
/// one so it can check its slot back in from wherever it is dropped.
pub struct Bulkhead<C: Clock = SystemClock> {
    name: Arc<str>,
    config: BulkheadConfig,
    state: Arc<Mutex<PoolState>>,
    next_ticket: Arc<AtomicU64>,
    total_checkouts: Arc<AtomicU64>,
    successful_checkouts: Arc<AtomicU64>,
    rejected_checkouts: Arc<AtomicU64>,
    timeouts: Arc<AtomicU64>,
    events: Arc<dyn EventSink>,
    clock: Arc<C>,
}

impl<C: Clock> Clone for Bulkhead<C> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            config: self.config.clone(),
            state: Arc::clone(&self.state),
            next_ticket: Arc::clone(&self.next_ticket),
            total_checkouts: Arc::clone(&self.total_checkouts),
            successful_checkouts: Arc::clone(&self.successful_checkouts),
            rejected_checkouts: Arc::clone(&self.rejected_checkouts),
            timeouts: Arc::clone(&self.timeouts),
            events: Arc::clone(&self.events),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<C: Clock> fmt::Debug for Bulkhead<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.get_state();
        f.debug_struct("Bulkhead")
            .field("name", &self.name)
            .field("busy", &state.busy)
            .field("waiting", &state.waiting)
            .field("max_concurrent", &state.max_concurrent)
            .field("max_waiting", &state.max_waiting)
            .finish()
    }
}

impl Bulkhead<SystemClock> {
    /// Create a new bulkhead with the given configuration
    pub fn new(name: impl Into<String>, config: BulkheadConfig) -> ConfigResult<Self> {
        Self::with_clock(name, config, SystemClock)
    }

    /// Create a bulkhead with default configuration
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, BulkheadConfig::default()).expect("Default config should be valid")
    }
}

impl<C: Clock> Bulkhead<C> {
    /// Create a new bulkhead with a custom clock (useful for lease tests)
    pub fn with_clock(
        name: impl Into<String>,
        config: BulkheadConfig,
        clock: C,
    ) -> ConfigResult<Self> {
        config.validate()?;

        // Slots are allocated once here and only ever move between
        // `available` and `busy`.
        let available: Vec<SlotId> = (0..config.max_concurrent).rev().collect();

        Ok(Self {
            name: Arc::from(name.into()),
            state: Arc::new(Mutex::new(PoolState {
                available,
                busy: HashMap::with_capacity(config.max_concurrent),
                waiting: VecDeque::new(),
                peak_usage: 0,
                peak_queue_size: 0,
            })),
            next_ticket: Arc::new(AtomicU64::new(1)),
            total_checkouts: Arc::new(AtomicU64::new(0)),
            successful_checkouts: Arc::new(AtomicU64::new(0)),
            rejected_checkouts: Arc::new(AtomicU64::new(0)),
            timeouts: Arc::new(AtomicU64::new(0)),
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

    /// Checkout a slot, waiting up to the configured `checkout_timeout`
    pub async fn checkout(&self) -> Result<SlotGuard<C>, CheckoutError> {
        self.checkout_within(self.config.checkout_timeout).await
    }

    /// Checkout a slot with an explicit deadline
    ///
    /// Fast path: an available slot is handed over immediately. If the pool
    /// is exhausted but the queue has room, the caller suspends until a slot
    /// is handed to it or the deadline fires; a timed-out caller removes
    /// only itself from the queue. If the queue is also full the call fails
    /// fast with [`CheckoutError::Full`] without queueing.
    #[instrument(skip(self), fields(name = %self.name))]
    pub async fn checkout_within(&self, timeout: Duration) -> Result<SlotGuard<C>, CheckoutError> {
        self.total_checkouts.fetch_add(1, Ordering::Relaxed);
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);

        let mut rx = {
            let mut state = self.state.lock();

            if let Some(slot) = state.available.pop() {
                state.busy.insert(slot, Holder { ticket, since: self.clock.now() });
                state.note_usage();
                self.successful_checkouts.fetch_add(1, Ordering::Relaxed);
                debug!(slot, "slot checked out immediately");
                return Ok(SlotGuard::new(self.clone(), slot, ticket));
            }

            if state.waiting.len() >= self.config.max_waiting {
                drop(state);
                self.rejected_checkouts.fetch_add(1, Ordering::Relaxed);
                self.events.emit(&ResilienceEvent::CheckoutRejected {
                    name: self.name.to_string(),
                    capacity: self.config.max_concurrent,
                    waiting: self.config.max_waiting,
                });
                return Err(CheckoutError::Full {
                    name: self.name.to_string(),
                    capacity: self.config.max_concurrent,
                    waiting: self.config.max_waiting,
                });
            }

            let (tx, rx) = oneshot::channel();
            state.waiting.push_back(Waiter { ticket, tx });
            state.note_queue();
            rx
        };

        tokio::select! {
            granted = &mut rx => {
                match granted {
                    Ok(slot) => {
                        self.successful_checkouts.fetch_add(1, Ordering::Relaxed);
                        debug!(slot, "slot granted from queue");
                        Ok(SlotGuard::new(self.clone(), slot, ticket))
                    }
                    // The pool never drops a queued sender; treat a closed
                    // channel as saturation rather than panic.
                    Err(_) => Err(CheckoutError::Full {
                        name: self.name.to_string(),
                        capacity: self.config.max_concurrent,
                        waiting: self.config.max_waiting,
                    }),
                }
            }
            _ = tokio::time::sleep(timeout) => {
                self.abandon_wait(ticket, &mut rx);
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                self.events.emit(&ResilienceEvent::CheckoutTimedOut {
                    name: self.name.to_string(),
                    waited: timeout,
                });
                Err(CheckoutError::Timeout { name: self.name.to_string(), timeout })
            }
        }
    }

    /// Checkout without waiting; `None` if no slot is immediately free
    pub fn try_checkout(&self) -> Option<SlotGuard<C>> {
        self.total_checkouts.fetch_add(1, Ordering::Relaxed);
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.lock();
        let slot = state.available.pop()?;
        state.busy.insert(slot, Holder { ticket, since: self.clock.now() });
        state.note_usage();
        drop(state);

        self.successful_checkouts.fetch_add(1, Ordering::Relaxed);
        Some(SlotGuard::new(self.clone(), slot, ticket))
    }

    /// Run an operation inside a slot, releasing it on every exit path
    ///
    /// This is the checkout/checkin sugar: the slot is returned on success,
    /// on operation error, and on panic unwind (guard drop).
    pub async fn with_slot<F, Fut, T, E>(
        &self,
        timeout: Duration,
        operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let guard = self.checkout_within(timeout).await?;
        let result = operation().await;
        guard.release();
        result.map_err(|error| ResilienceError::OperationFailed { source: error })
    }

    /// Force-release slots held past the configured lease
    ///
    /// Secondary crash recovery for holders that cannot run destructors
    /// (e.g. a wedged task). Reclaimed slots are handed to waiters or
    /// returned to the pool; a stale guard dropping later is a no-op because
    /// its ticket no longer matches. Returns the number of slots reclaimed.
    pub fn reclaim_expired(&self) -> usize {
        let Some(lease) = self.config.slot_lease else {
            return 0;
        };

        let now = self.clock.now();
        let reclaimed: Vec<SlotId> = {
            let mut state = self.state.lock();
            let expired: Vec<SlotId> = state
                .busy
                .iter()
                .filter(|(_, holder)| now.duration_since(holder.since) >= lease)
                .map(|(slot, _)| *slot)
                .collect();
            for slot in &expired {
                state.busy.remove(slot);
                self.grant_locked(&mut state, *slot);
            }
            expired
        };

        for slot in &reclaimed {
            warn!(name = %self.name, slot, "reclaimed slot held past its lease");
            self.events
                .emit(&ResilienceEvent::SlotReclaimed { name: self.name.to_string(), slot: *slot });
        }
        reclaimed.len()
    }

    /// Get bulkhead metrics
    pub fn get_metrics(&self) -> BulkheadMetrics {
        let state = self.state.lock();
        BulkheadMetrics {
            total_checkouts: self.total_checkouts.load(Ordering::Acquire),
            successful_checkouts: self.successful_checkouts.load(Ordering::Acquire),
            rejected_checkouts: self.rejected_checkouts.load(Ordering::Acquire),
            timeouts: self.timeouts.load(Ordering::Acquire),
            current_usage: state.busy.len(),
            peak_usage: state.peak_usage,
            queue_size: state.waiting.len(),
            peak_queue_size: state.peak_queue_size,
            max_concurrent: self.config.max_concurrent,
        }
    }

    /// Get current metrics snapshot (alias for `get_metrics()`)
    pub fn metrics(&self) -> BulkheadMetrics {
        self.get_metrics()
    }

    /// Get a point-in-time view of the pool
    pub fn get_state(&self) -> BulkheadState {
        let state = self.state.lock();
        BulkheadState {
            available: state.available.len(),
            busy: state.busy.len(),
            waiting: state.waiting.len(),
            max_concurrent: self.config.max_concurrent,
            max_waiting: self.config.max_waiting,
        }
    }

    /// Reset counters and peaks; slot assignments are untouched
    pub fn reset_metrics(&self) {
        self.total_checkouts.store(0, Ordering::Release);
        self.successful_checkouts.store(0, Ordering::Release);
        self.rejected_checkouts.store(0, Ordering::Release);
        self.timeouts.store(0, Ordering::Release);

        let mut state = self.state.lock();
        state.peak_usage = state.busy.len();
        state.peak_queue_size = state.waiting.len();
    }

    /// Check a slot back in; called by the guard
    fn checkin_slot(&self, slot: SlotId, ticket: u64) {
        let mut state = self.state.lock();
        match state.busy.get(&slot) {
            Some(holder) if holder.ticket == ticket => {
                state.busy.remove(&slot);
            }
            // Stale guard: the slot was already reclaimed (and possibly
            // rebound to a new holder). Nothing to release.
            _ => return,
        }
        self.grant_locked(&mut state, slot);
    }

    /// Hand a freed slot to the head waiter, or park it
    ///
    /// The direct transfer preserves FIFO fairness and closes the
    /// return-then-steal race: the slot is rebound to the waiter before the
    /// lock is released.
    fn grant_locked(&self, state: &mut PoolState, slot: SlotId) {
        while let Some(waiter) = state.waiting.pop_front() {
            state.busy.insert(slot, Holder { ticket: waiter.ticket, since: self.clock.now() });
            state.note_usage();
            if waiter.tx.send(slot).is_ok() {
                return;
            }
            // Receiver vanished (timed-out waiter that already left the
            // queue would not be found here, but a cancelled future's
            // receiver can be). Unbind and offer to the next in line.
            state.busy.remove(&slot);
        }
        state.available.push(slot);
    }

    /// Remove a timed-out waiter, resolving the race against a concurrent
    /// grant
    fn abandon_wait(&self, ticket: u64, rx: &mut oneshot::Receiver<SlotId>) {
        let mut state = self.state.lock();
        if let Some(position) = state.waiting.iter().position(|w| w.ticket == ticket) {
            state.waiting.remove(position);
            return;
        }

        // Not in the queue: a grant raced the deadline. The send completed
        // under the state lock, so the slot is sitting in our channel; the
        // deadline already passed, so put it back rather than keep it. The
        // ticket check keeps a lease sweep's rebinding safe from us.
        if let Ok(slot) = rx.try_recv() {
            if state.busy.get(&slot).map(|holder| holder.ticket) == Some(ticket) {
                state.busy.remove(&slot);
                self.grant_locked(&mut state, slot);
            }
        }
    }
}

/// One checked-out unit of pool capacity
///
/// Checking in is the guard's job: explicitly via [`SlotGuard::release`], or
/// implicitly on drop — which covers early returns, `?`, panic unwind, and
/// cancelled futures, so a crashed holder cannot leak its slot.
pub struct SlotGuard<C: Clock = SystemClock> {
    pool: Bulkhead<C>,
    slot: SlotId,
    ticket: u64,
    released: bool,
}

impl<C: Clock> SlotGuard<C> {
    fn new(pool: Bulkhead<C>, slot: SlotId, ticket: u64) -> Self {
        Self { pool, slot, ticket, released: false }
    }

    /// The slot this guard holds
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Check the slot back in now
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.pool.checkin_slot(self.slot, self.ticket);
        }
    }
}

impl<C: Clock> fmt::Debug for SlotGuard<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotGuard")
            .field("pool", &self.pool.name)
            .field("slot", &self.slot)
            .field("released", &self.released)
            .finish()
    }
}

impl<C: Clock> Drop for SlotGuard<C> {
    fn drop(&mut self) {
        self.release_inner();
    }
}
