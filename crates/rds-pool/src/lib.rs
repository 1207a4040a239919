//! rds-pool
//!
//! Generic async connection pool (spec §4.3, C3): LIFO idle stack, FIFO
//! waiter queue, acquire/release/with_connection/close, periodic cleanup.
//! `mqk-db::connect_from_env` hands its pool lifecycle entirely to
//! `sqlx::postgres::PgPoolOptions::new().max_connections(10)` and nothing
//! else — no idle-reap task, no acquire timeout, no create/destroy
//! tracing exists anywhere in the pack to ground those parts on. This
//! module has no real precedent for its internals: it reimplements,
//! for an arbitrary connection type rather than just Postgres, the same
//! shape `sqlx`'s pool keeps private to itself (pre-size, validate-on-
//! borrow, cap at max), plus the waiter queue and periodic idle-reap spec
//! §4.3 names explicitly.

mod config;
mod metrics;

pub use config::PoolConfig;
pub use metrics::PoolMetrics;

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rds_error::{StoreError, StoreResult};
use tokio::sync::{mpsc, oneshot, Mutex};

/// Creates, validates, resets and destroys pooled connections of type `C`.
/// Implemented by a `Backend` adapter; the core never constructs a `C`
/// itself.
#[async_trait]
pub trait ConnectionFactory<C>: Send + Sync + 'static
where
    C: Send + 'static,
{
    async fn create(&self) -> StoreResult<C>;

    async fn destroy(&self, _conn: C) {}

    /// Validator used when `test_on_borrow`/`test_on_return` are enabled.
    async fn validate(&self, _conn: &C) -> bool {
        true
    }

    /// Attempt to recover a connection the cleanup tick found unhealthy.
    /// Returning `Err` causes the connection to be destroyed.
    async fn reset(&self, _conn: &mut C) -> StoreResult<()> {
        Ok(())
    }

    async fn health_check(&self, conn: &C) -> bool {
        self.validate(conn).await
    }
}

struct Slot<C> {
    conn: C,
    created_at: Instant,
    last_used_at: Instant,
    use_count: u64,
    healthy: bool,
}

impl<C> Slot<C> {
    fn fresh(conn: C) -> Self {
        let now = Instant::now();
        Self {
            conn,
            created_at: now,
            last_used_at: now,
            use_count: 0,
            healthy: true,
        }
    }
}

enum WaiterGrant<C> {
    Conn(Slot<C>),
    Closed,
}

struct Waiter<C> {
    id: u64,
    tx: oneshot::Sender<WaiterGrant<C>>,
}

struct Inner<C> {
    idle: Vec<Slot<C>>,
    waiters: VecDeque<Waiter<C>>,
    in_use: usize,
    total: usize,
    initialized: bool,
    closed: bool,
}

impl<C> Inner<C> {
    fn new() -> Self {
        Self {
            idle: Vec::new(),
            waiters: VecDeque::new(),
            in_use: 0,
            total: 0,
            initialized: false,
            closed: false,
        }
    }
}

/// A connection on loan from the pool. Released back on drop (constant
/// work, see spec §4.3) — including on panic, since dropping always runs
/// during unwind. `with_connection` relies on exactly this.
pub struct PooledConnection<C: Send + 'static> {
    slot: Option<Slot<C>>,
    return_tx: mpsc::UnboundedSender<Slot<C>>,
}

impl<C: Send + 'static> Deref for PooledConnection<C> {
    type Target = C;
    fn deref(&self) -> &C {
        &self.slot.as_ref().expect("slot present until drop").conn
    }
}

impl<C: Send + 'static> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.slot.as_mut().expect("slot present until drop").conn
    }
}

impl<C: Send + 'static> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            // Background returner task applies the release algorithm; a
            // failed send just means the pool itself is gone.
            let _ = self.return_tx.send(slot);
        }
    }
}

/// Generic async connection pool over connection type `C`.
#[derive(Clone)]
pub struct Pool<C: Send + 'static> {
    inner: Arc<Mutex<Inner<C>>>,
    factory: Arc<dyn ConnectionFactory<C>>,
    config: PoolConfig,
    metrics: Arc<Mutex<metrics::MetricsState>>,
    return_tx: mpsc::UnboundedSender<Slot<C>>,
    waiter_seq: Arc<AtomicU64>,
}

impl<C: Send + 'static> Pool<C> {
    pub fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory<C>>) -> Self {
        let config = config.normalized();
        let (return_tx, mut return_rx) = mpsc::unbounded_channel::<Slot<C>>();
        let pool = Self {
            inner: Arc::new(Mutex::new(Inner::new())),
            factory,
            config,
            metrics: Arc::new(Mutex::new(metrics::MetricsState::default())),
            return_tx,
            waiter_seq: Arc::new(AtomicU64::new(0)),
        };

        let returner_pool = pool.clone();
        tokio::spawn(async move {
            while let Some(slot) = return_rx.recv().await {
                returner_pool.do_release(slot).await;
            }
        });

        pool
    }

    /// Pre-creates `min_connections` and starts the periodic cleanup task
    /// (spec §4.3). Idempotent.
    pub async fn initialize(&self) -> StoreResult<()> {
        {
            let mut inner = self.inner.lock().await;
            if inner.initialized {
                return Ok(());
            }
            inner.initialized = true;
        }

        for _ in 0..self.config.min_connections {
            match self.factory.create().await {
                Ok(conn) => {
                    self.metrics.lock().await.record_created();
                    let mut inner = self.inner.lock().await;
                    inner.total += 1;
                    inner.idle.push(Slot::fresh(conn));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "pool pre-creation failed during initialize");
                }
            }
        }

        let cleanup_pool = self.clone();
        let interval = self.config.cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if cleanup_pool.inner.lock().await.closed {
                    break;
                }
                cleanup_pool.cleanup_tick().await;
            }
        });

        Ok(())
    }

    /// Blocks at most `acquire_timeout`; fails with `PoolTimeout`.
    pub async fn acquire(&self) -> StoreResult<PooledConnection<C>> {
        let start = Instant::now();
        loop {
            let mut guard = self.inner.lock().await;
            if !guard.initialized {
                return Err(StoreError::PoolNotInit);
            }
            if guard.closed {
                return Err(StoreError::PoolClosed);
            }

            while let Some(mut slot) = guard.idle.pop() {
                if slot.created_at.elapsed() > self.config.max_lifetime {
                    guard.total -= 1;
                    drop(guard);
                    self.factory.destroy(slot.conn).await;
                    self.metrics.lock().await.record_destroyed();
                    guard = self.inner.lock().await;
                    continue;
                }
                if self.config.test_on_borrow && !self.factory.validate(&slot.conn).await {
                    guard.total -= 1;
                    drop(guard);
                    self.factory.destroy(slot.conn).await;
                    self.metrics.lock().await.record_destroyed();
                    guard = self.inner.lock().await;
                    continue;
                }
                slot.last_used_at = Instant::now();
                slot.use_count += 1;
                guard.in_use += 1;
                let in_use = guard.in_use;
                drop(guard);
                self.metrics.lock().await.record_acquired(start.elapsed(), in_use);
                return Ok(self.wrap(slot));
            }

            if guard.total < self.config.max_connections {
                guard.total += 1; // reserve the slot before releasing the lock
                drop(guard);
                match self.factory.create().await {
                    Ok(conn) => {
                        self.metrics.lock().await.record_created();
                        let mut inner = self.inner.lock().await;
                        inner.in_use += 1;
                        let in_use = inner.in_use;
                        drop(inner);
                        self.metrics.lock().await.record_acquired(start.elapsed(), in_use);
                        return Ok(self.wrap(Slot::fresh(conn)));
                    }
                    Err(e) => {
                        let mut inner = self.inner.lock().await;
                        inner.total -= 1;
                        return Err(e);
                    }
                }
            }

            // Pool exhausted: enqueue a FIFO waiter and suspend.
            let id = self.waiter_seq.fetch_add(1, AtomicOrdering::Relaxed);
            let (tx, rx) = oneshot::channel();
            guard.waiters.push_back(Waiter { id, tx });
            drop(guard);

            return match tokio::time::timeout(self.config.acquire_timeout, rx).await {
                Ok(Ok(WaiterGrant::Conn(slot))) => {
                    let in_use = self.inner.lock().await.in_use;
                    self.metrics.lock().await.record_acquired(start.elapsed(), in_use);
                    Ok(self.wrap(slot))
                }
                Ok(Ok(WaiterGrant::Closed)) | Ok(Err(_)) => Err(StoreError::PoolClosed),
                Err(_elapsed) => {
                    self.cancel_waiter(id).await;
                    self.metrics.lock().await.record_timeout();
                    Err(StoreError::PoolTimeout {
                        waited_ms: start.elapsed().as_millis() as u64,
                    })
                }
            };
        }
    }

    /// Runs `f` with a borrowed connection, guaranteeing release on every
    /// exit path including panic (spec §4.3).
    pub async fn with_connection<F, Fut, R>(&self, f: F) -> StoreResult<R>
    where
        F: FnOnce(PooledConnection<C>) -> Fut,
        Fut: std::future::Future<Output = StoreResult<R>>,
    {
        let conn = self.acquire().await?;
        f(conn).await
    }

    /// Destroys all idle connections, wakes all waiters with `PoolClosed`,
    /// idempotent.
    pub async fn close(&self) {
        let (idle, waiters) = {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return;
            }
            inner.closed = true;
            (
                std::mem::take(&mut inner.idle),
                std::mem::take(&mut inner.waiters),
            )
        };
        for waiter in waiters {
            let _ = waiter.tx.send(WaiterGrant::Closed);
        }
        for slot in idle {
            self.factory.destroy(slot.conn).await;
            self.metrics.lock().await.record_destroyed();
        }
    }

    pub async fn metrics(&self) -> PoolMetrics {
        let inner = self.inner.lock().await;
        self.metrics
            .lock()
            .await
            .snapshot(inner.idle.len(), inner.in_use)
    }

    fn wrap(&self, slot: Slot<C>) -> PooledConnection<C> {
        PooledConnection {
            slot: Some(slot),
            return_tx: self.return_tx.clone(),
        }
    }

    /// Removes a timed-out waiter by id so it doesn't sit in the queue
    /// forever. If `do_release` already popped it before we got here, the
    /// `oneshot::Sender::send` in `do_release` fails (its receiver — owned
    /// by the timed-out `acquire` future — was just dropped) and that path
    /// reclaims the connection as idle itself; no connection is ever lost
    /// either way.
    async fn cancel_waiter(&self, id: u64) {
        let mut inner = self.inner.lock().await;
        if let Some(pos) = inner.waiters.iter().position(|w| w.id == id) {
            inner.waiters.remove(pos);
        }
    }

    /// Constant-work release: applied both from the background returner
    /// task (auto-drop path) and, equivalently, inline — see spec §4.3.
    async fn do_release(&self, mut slot: Slot<C>) {
        let mut inner = self.inner.lock().await;
        inner.in_use -= 1;

        if inner.closed {
            inner.total -= 1;
            drop(inner);
            self.factory.destroy(slot.conn).await;
            self.metrics.lock().await.record_destroyed();
            return;
        }

        if self.config.test_on_return && !self.factory.validate(&slot.conn).await {
            inner.total -= 1;
            drop(inner);
            self.factory.destroy(slot.conn).await;
            self.metrics.lock().await.record_destroyed();
            return;
        }

        if let Some(waiter) = inner.waiters.pop_front() {
            slot.last_used_at = Instant::now();
            // Released connection goes straight to the waiter: in_use net
            // change is zero (one holder's release funds the next
            // holder's acquire), so restore the decrement above.
            inner.in_use += 1;
            drop(inner);
            // If the waiter's future was dropped (e.g. its acquire() was
            // cancelled) between the pop and this send, the grant comes
            // back in the `Err` payload — reclaim it as idle rather than
            // leak it or destroy a perfectly healthy connection.
            if let Err(WaiterGrant::Conn(slot)) = waiter.tx.send(WaiterGrant::Conn(slot)) {
                let mut inner = self.inner.lock().await;
                inner.in_use -= 1;
                inner.idle.push(slot);
            }
            return;
        }

        inner.idle.push(slot);
    }

    async fn cleanup_tick(&self) {
        let mut to_destroy = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            let mut kept = Vec::with_capacity(inner.idle.len());
            for slot in inner.idle.drain(..) {
                let total_live = kept.len() + inner.in_use + to_destroy.len();
                if slot.last_used_at.elapsed() > self.config.idle_timeout
                    && total_live > self.config.min_connections
                {
                    to_destroy.push(slot);
                } else {
                    kept.push(slot);
                }
            }
            inner.idle = kept;
            inner.total -= to_destroy.len();
        }
        for slot in to_destroy {
            self.factory.destroy(slot.conn).await;
            self.metrics.lock().await.record_destroyed();
        }

        // Health-check remaining idle connections; reset or destroy the
        // unhealthy ones. Tolerate factory failures without crashing.
        let mut inner = self.inner.lock().await;
        let mut still_idle = Vec::with_capacity(inner.idle.len());
        let candidates = std::mem::take(&mut inner.idle);
        drop(inner);
        let mut destroyed = 0usize;
        for mut slot in candidates {
            if self.factory.health_check(&slot.conn).await {
                slot.healthy = true;
                still_idle.push(slot);
                continue;
            }
            match self.factory.reset(&mut slot.conn).await {
                Ok(()) => {
                    slot.healthy = true;
                    still_idle.push(slot);
                }
                Err(e) => {
                    tracing::debug!(error = %e, "pool cleanup: discarding unhealthy connection");
                    self.factory.destroy(slot.conn).await;
                    self.metrics.lock().await.record_destroyed();
                    destroyed += 1;
                }
            }
        }
        let mut inner = self.inner.lock().await;
        inner.idle = still_idle;
        inner.total -= destroyed;

        // Refill to min_connections.
        let deficit = self
            .config
            .min_connections
            .saturating_sub(inner.total);
        drop(inner);
        for _ in 0..deficit {
            match self.factory.create().await {
                Ok(conn) => {
                    self.metrics.lock().await.record_created();
                    let mut inner = self.inner.lock().await;
                    inner.total += 1;
                    inner.idle.push(Slot::fresh(conn));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "pool cleanup: refill creation failed");
                }
            }
        }
    }
}

