//! Bounded pool of backing-store connections.
//!
//! Connections are borrowed through a [`PoolGuard`] and go back to the pool
//! when the guard drops, on every exit path. A background sweep evicts idle,
//! aged-out or unhealthy connections and keeps `min_size` warm.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::traits::ConnectionManager;

/// Configuration for the resource pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections opened up front and kept warm by the sweeper.
    pub min_size: usize,
    /// Connections kept in the pool.
    pub max_size: usize,
    /// Extra short-lived connections allowed under load, closed on release.
    pub max_overflow: usize,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_age: Duration,
    pub health_check_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 2,
            max_size: 10,
            max_overflow: 5,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            max_age: Duration::from_secs(3600),
            health_check_interval: Duration::from_secs(60),
        }
    }
}

impl PoolConfig {
    pub fn with_sizes(mut self, min_size: usize, max_size: usize, max_overflow: usize) -> Self {
        self.min_size = min_size;
        self.max_size = max_size;
        self.max_overflow = max_overflow;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_lifetimes(mut self, idle_timeout: Duration, max_age: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self.max_age = max_age;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Hard ceiling on live connections.
    pub fn capacity(&self) -> usize {
        self.max_size + self.max_overflow
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.max_size == 0 {
            return Err(AppError::ConfigError("pool max_size must be at least 1".into()));
        }
        if self.min_size > self.max_size {
            return Err(AppError::ConfigError(format!(
                "pool min_size ({}) exceeds max_size ({})",
                self.min_size, self.max_size
            )));
        }
        if self.health_check_interval.is_zero() {
            return Err(AppError::ConfigError(
                "pool health_check_interval must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub created: u64,
    pub active: usize,
    pub idle: usize,
    pub failed: u64,
    pub total_requests: u64,
    pub average_wait: Duration,
    pub peak_active: usize,
}

struct PooledResource<C> {
    conn: C,
    created_at: Instant,
    last_used: Instant,
    use_count: u64,
    healthy: bool,
    overflow: bool,
}

impl<C> PooledResource<C> {
    fn new(conn: C, overflow: bool) -> Self {
        let now = Instant::now();
        Self {
            conn,
            created_at: now,
            last_used: now,
            use_count: 0,
            healthy: true,
            overflow,
        }
    }
}

struct PoolState<C> {
    idle: VecDeque<PooledResource<C>>,
    active: usize,
    /// Slots held by connections being created or health-checked.
    reserved: usize,
    closed: bool,
    created: u64,
    failed: u64,
    total_requests: u64,
    total_wait: Duration,
    served: u64,
    peak_active: usize,
}

impl<C> PoolState<C> {
    fn live(&self) -> usize {
        self.active + self.idle.len() + self.reserved
    }
}

struct PoolShared<M: ConnectionManager> {
    manager: M,
    config: PoolConfig,
    state: Mutex<PoolState<M::Connection>>,
    available: Notify,
    shutdown: CancellationToken,
}

impl<M: ConnectionManager> PoolShared<M> {
    fn lock_state(&self) -> MutexGuard<'_, PoolState<M::Connection>> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned pool mutex");
            poisoned.into_inner()
        })
    }

    fn is_expired(&self, resource: &PooledResource<M::Connection>) -> bool {
        resource.created_at.elapsed() > self.config.max_age
    }

    fn check_in(&self, mut resource: PooledResource<M::Connection>) {
        resource.last_used = Instant::now();
        let discarded = {
            let mut state = self.lock_state();
            state.active = state.active.saturating_sub(1);
            let keep = !state.closed
                && !resource.overflow
                && resource.healthy
                && !self.is_expired(&resource)
                && state.idle.len() < self.config.max_size;
            if keep {
                state.idle.push_back(resource);
                None
            } else {
                Some(resource)
            }
        };
        if let Some(resource) = discarded {
            tracing::debug!(
                overflow = resource.overflow,
                healthy = resource.healthy,
                uses = resource.use_count,
                "Discarding pooled connection"
            );
        }
        self.available.notify_one();
    }
}

/// Releases a reserved slot if creation or a health check is abandoned.
struct Reservation<'a, M: ConnectionManager> {
    shared: &'a PoolShared<M>,
    slots: usize,
}

impl<M: ConnectionManager> Reservation<'_, M> {
    fn release(&mut self, n: usize) {
        let n = n.min(self.slots);
        self.slots -= n;
        let mut state = self.shared.lock_state();
        state.reserved = state.reserved.saturating_sub(n);
    }
}

impl<M: ConnectionManager> Drop for Reservation<'_, M> {
    fn drop(&mut self) {
        if self.slots > 0 {
            let slots = self.slots;
            self.release(slots);
            self.shared.available.notify_one();
        }
    }
}

/// A shared, cloneable connection pool.
pub struct Pool<M: ConnectionManager> {
    shared: Arc<PoolShared<M>>,
}

impl<M: ConnectionManager> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

enum Step<C> {
    Checkout(PooledResource<C>),
    Create { overflow: bool },
    Wait,
}

impl<M: ConnectionManager> Pool<M> {
    /// Validate `config`, open `min_size` connections and start the sweeper.
    pub async fn open(manager: M, config: PoolConfig) -> Result<Self, AppError> {
        config.validate()?;

        let shared = Arc::new(PoolShared {
            manager,
            state: Mutex::new(PoolState {
                idle: VecDeque::with_capacity(config.max_size),
                active: 0,
                reserved: 0,
                closed: false,
                created: 0,
                failed: 0,
                total_requests: 0,
                total_wait: Duration::ZERO,
                served: 0,
                peak_active: 0,
            }),
            config,
            available: Notify::new(),
            shutdown: CancellationToken::new(),
        });

        for _ in 0..shared.config.min_size {
            match shared.manager.connect().await {
                Ok(conn) => {
                    let mut state = shared.lock_state();
                    state.created += 1;
                    state.idle.push_back(PooledResource::new(conn, false));
                }
                Err(e) => {
                    shared.lock_state().failed += 1;
                    return Err(e);
                }
            }
        }

        tokio::spawn(run_sweeper(Arc::downgrade(&shared)));

        tracing::info!(
            min_size = shared.config.min_size,
            max_size = shared.config.max_size,
            max_overflow = shared.config.max_overflow,
            "Resource pool opened"
        );

        Ok(Self { shared })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Borrow a connection, waiting up to the configured `acquire_timeout`.
    pub async fn acquire_default(&self) -> Result<PoolGuard<M>, AppError> {
        self.acquire(self.shared.config.acquire_timeout).await
    }

    /// Borrow a connection, waiting up to `timeout` for one to free up.
    pub async fn acquire(&self, timeout: Duration) -> Result<PoolGuard<M>, AppError> {
        let shared = &self.shared;
        let start = Instant::now();
        let deadline = start + timeout;
        shared.lock_state().total_requests += 1;

        loop {
            // Registered before the state check so a release or close that
            // lands in between still wakes this waiter.
            let notified = shared.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let step = {
                let mut state = shared.lock_state();
                if state.closed {
                    return Err(AppError::PoolClosed);
                }
                if let Some(resource) = state.idle.pop_front() {
                    state.active += 1;
                    Step::Checkout(resource)
                } else if state.live() < shared.config.capacity() {
                    let overflow = state.live() >= shared.config.max_size;
                    state.reserved += 1;
                    Step::Create { overflow }
                } else {
                    Step::Wait
                }
            };

            match step {
                Step::Checkout(resource) => {
                    let mut guard = PoolGuard {
                        pool: self.clone(),
                        resource: Some(resource),
                    };
                    if self.probe(&mut guard).await {
                        return Ok(self.hand_out(guard, start));
                    }
                    guard.mark_unhealthy();
                    drop(guard);
                }
                Step::Create { overflow } => {
                    let mut reservation = Reservation {
                        shared: shared.as_ref(),
                        slots: 1,
                    };
                    match shared.manager.connect().await {
                        Ok(conn) => {
                            {
                                let mut state = shared.lock_state();
                                state.reserved = state.reserved.saturating_sub(1);
                                state.active += 1;
                                state.created += 1;
                            }
                            reservation.slots = 0;
                            if overflow {
                                tracing::debug!("Opened overflow connection");
                            }
                            let guard = PoolGuard {
                                pool: self.clone(),
                                resource: Some(PooledResource::new(conn, overflow)),
                            };
                            return Ok(self.hand_out(guard, start));
                        }
                        Err(e) => {
                            shared.lock_state().failed += 1;
                            tracing::warn!(error = %e, "Failed to open pooled connection");
                            return Err(e);
                        }
                    }
                }
                Step::Wait => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        if shared.lock_state().closed {
                            return Err(AppError::PoolClosed);
                        }
                        let waited = start.elapsed();
                        tracing::warn!(
                            waited_ms = %waited.as_millis(),
                            capacity = shared.config.capacity(),
                            "Resource pool exhausted"
                        );
                        return Err(AppError::PoolExhausted {
                            capacity: shared.config.capacity(),
                            waited,
                        });
                    }
                }
            }
        }
    }

    /// Return a connection explicitly. Same as dropping the guard.
    pub fn release(&self, guard: PoolGuard<M>) {
        drop(guard);
    }

    /// Stop the sweeper and close idle connections. Borrowed connections are
    /// closed when their guards drop; later acquires fail with `PoolClosed`.
    pub fn close(&self) {
        let drained: Vec<_> = {
            let mut state = self.shared.lock_state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.idle.drain(..).collect()
        };
        self.shared.shutdown.cancel();
        self.shared.available.notify_waiters();
        tracing::info!(closed_idle = drained.len(), "Resource pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock_state().closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock_state();
        let average_wait = if state.served == 0 {
            Duration::ZERO
        } else {
            state.total_wait / state.served as u32
        };
        PoolStats {
            created: state.created,
            active: state.active,
            idle: state.idle.len(),
            failed: state.failed,
            total_requests: state.total_requests,
            average_wait,
            peak_active: state.peak_active,
        }
    }

    /// Run one sweep now instead of waiting for the next interval.
    pub async fn sweep(&self) {
        sweep(&self.shared).await;
    }

    async fn probe(&self, guard: &mut PoolGuard<M>) -> bool {
        let Some(resource) = guard.resource.as_mut() else {
            return false;
        };
        if self.shared.is_expired(resource) {
            tracing::debug!("Pooled connection exceeded max age");
            return false;
        }
        match self.shared.manager.is_valid(&mut resource.conn).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(error = %e, "Pooled connection failed health probe");
                false
            }
        }
    }

    fn hand_out(&self, mut guard: PoolGuard<M>, start: Instant) -> PoolGuard<M> {
        if let Some(resource) = guard.resource.as_mut() {
            resource.use_count += 1;
            resource.last_used = Instant::now();
        }
        let mut state = self.shared.lock_state();
        state.total_wait += start.elapsed();
        state.served += 1;
        state.peak_active = state.peak_active.max(state.active);
        guard
    }
}

async fn run_sweeper<M: ConnectionManager>(shared: Weak<PoolShared<M>>) {
    let (period, shutdown) = match shared.upgrade() {
        Some(s) => (s.config.health_check_interval, s.shutdown.clone()),
        None => return,
    };
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let Some(shared) = shared.upgrade() else { break };
                sweep(&shared).await;
            }
        }
    }
    tracing::debug!("Pool sweeper stopped");
}

async fn sweep<M: ConnectionManager>(shared: &PoolShared<M>) {
    let candidates: Vec<_> = {
        let mut state = shared.lock_state();
        if state.closed {
            return;
        }
        let drained: Vec<_> = state.idle.drain(..).collect();
        state.reserved += drained.len();
        drained
    };
    let mut reservation = Reservation {
        shared,
        slots: candidates.len(),
    };

    let mut kept = Vec::with_capacity(candidates.len());
    let mut evicted = 0usize;
    for mut resource in candidates {
        let stale = resource.last_used.elapsed() > shared.config.idle_timeout
            || shared.is_expired(&resource);
        if stale || shared.manager.is_valid(&mut resource.conn).await.is_err() {
            evicted += 1;
            continue;
        }
        kept.push(resource);
    }

    let top_up = {
        let mut state = shared.lock_state();
        state.reserved = state.reserved.saturating_sub(reservation.slots);
        reservation.slots = 0;
        for resource in kept {
            if !state.closed && state.idle.len() < shared.config.max_size {
                state.idle.push_back(resource);
            }
        }
        let wanted = shared.config.min_size.saturating_sub(state.idle.len());
        let room = shared.config.max_size.saturating_sub(state.live());
        let top_up = if state.closed { 0 } else { wanted.min(room) };
        state.reserved += top_up;
        top_up
    };
    reservation.slots = top_up;
    shared.available.notify_waiters();

    let mut opened = 0usize;
    for _ in 0..top_up {
        let result = shared.manager.connect().await;
        reservation.release(1);
        match result {
            Ok(conn) => {
                let mut state = shared.lock_state();
                state.created += 1;
                if !state.closed {
                    state.idle.push_back(PooledResource::new(conn, false));
                }
                opened += 1;
            }
            Err(e) => {
                shared.lock_state().failed += 1;
                tracing::warn!(error = %e, "Failed to replenish pool");
                break;
            }
        }
        shared.available.notify_one();
    }

    if evicted > 0 || opened > 0 {
        tracing::debug!(evicted, opened, "Pool sweep finished");
    }
}

/// A borrowed connection. Returned to the pool on drop.
pub struct PoolGuard<M: ConnectionManager> {
    pool: Pool<M>,
    resource: Option<PooledResource<M::Connection>>,
}

impl<M: ConnectionManager> PoolGuard<M> {
    /// Close this connection instead of returning it to the pool.
    pub fn mark_unhealthy(&mut self) {
        if let Some(resource) = self.resource.as_mut() {
            resource.healthy = false;
        }
    }

    pub fn is_overflow(&self) -> bool {
        self.resource.as_ref().is_some_and(|r| r.overflow)
    }

    pub fn use_count(&self) -> u64 {
        self.resource.as_ref().map_or(0, |r| r.use_count)
    }
}

impl<M: ConnectionManager> fmt::Debug for PoolGuard<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolGuard")
            .field("overflow", &self.is_overflow())
            .field("use_count", &self.use_count())
            .finish_non_exhaustive()
    }
}

impl<M: ConnectionManager> Deref for PoolGuard<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        match self.resource.as_ref() {
            Some(resource) => &resource.conn,
            None => unreachable!("pool guard used after release"),
        }
    }
}

impl<M: ConnectionManager> DerefMut for PoolGuard<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self.resource.as_mut() {
            Some(resource) => &mut resource.conn,
            None => unreachable!("pool guard used after release"),
        }
    }
}

impl<M: ConnectionManager> Drop for PoolGuard<M> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.shared.check_in(resource);
        }
    }
}
