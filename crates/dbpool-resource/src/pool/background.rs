//! Background acquisition, culling and idle testing

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::PoolInner;
use crate::events::PoolEventKind;
use crate::manager::Manager;
use crate::stats::FailureKind;
use crate::tasks::Lane;

enum AcquireOutcome<R> {
    Acquired(R),
    Exhausted(String),
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
enum Sweep {
    Cull,
    IdleTest,
}

impl<M: Manager> PoolInner<M> {
    /// Start one acquisition task
    ///
    /// The task only holds a weak reference to the pool, so a pool that is
    /// dropped while the manager hangs in `acquire` still shuts down.
    pub(super) fn spawn_acquire(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let manager = self.manager.clone();
        let shutdown = self.shutdown.clone();
        let attempts = self.config.acquire_retry_attempts();
        let delay = self.config.acquire_retry_delay();

        self.tasks.spawn(Lane::Acquire, async move {
            let outcome = acquire_with_retry(&*manager, &weak, &shutdown, attempts, delay).await;
            let Some(inner) = weak.upgrade() else {
                if let AcquireOutcome::Acquired(resource) = outcome {
                    destroy_orphan(&*manager, resource).await;
                }
                return;
            };
            match outcome {
                AcquireOutcome::Acquired(resource) => inner.assimilate(resource),
                AcquireOutcome::Exhausted(reason) => inner.acquisition_exhausted(reason),
                AcquireOutcome::Cancelled => {
                    let mut state = inner.state.lock();
                    state.pending_acquires = state.pending_acquires.saturating_sub(1);
                }
            }
        });
    }

    fn assimilate(self: &Arc<Self>, resource: M::Resource) {
        let accepted = self
            .state
            .lock()
            .assimilate(&resource, Instant::now(), &self.config);
        if accepted {
            trace!(pool_id = %self.id, "acquired resource");
            self.available_notify.notify_waiters();
            self.emit(PoolEventKind::Acquired, &resource);
        } else {
            debug!(pool_id = %self.id, "pool does not need the acquired resource, destroying it");
            self.spawn_destroy(resource, false);
        }
    }

    /// An acquisition task gave up
    ///
    /// Either breaks the pool for good or fails every blocked checkout
    /// while leaving the pool usable for later attempts.
    fn acquisition_exhausted(self: &Arc<Self>, reason: String) {
        let break_pool = self.config.break_after_acquire_failure();
        let doomed = {
            let mut state = self.state.lock();
            state.pending_acquires = state.pending_acquires.saturating_sub(1);
            if state.closed {
                return;
            }
            if break_pool {
                state.broken = Some(reason.clone());
                state.drain_available()
            } else {
                state.interrupt_epoch += 1;
                state.exhaustion = Some(reason.clone());
                Vec::new()
            }
        };

        if break_pool {
            error!(pool_id = %self.id, reason = %reason, "resource acquisition exhausted its retries, pool is broken");
            self.shutdown.cancel();
        } else {
            warn!(pool_id = %self.id, reason = %reason, "resource acquisition exhausted its retries, interrupting waiters");
        }
        self.available_notify.notify_waiters();
        for resource in doomed {
            self.spawn_destroy(resource, false);
        }
    }

    pub(super) fn start_sweeps(self: &Arc<Self>) {
        if let Some(period) = self.config.expiration_check_interval() {
            self.spawn_sweep(Sweep::Cull, period);
        }
        if let Some(period) = self.config.idle_test_period() {
            self.spawn_sweep(Sweep::IdleTest, period);
        }
    }

    fn spawn_sweep(self: &Arc<Self>, sweep: Sweep, period: Duration) {
        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        self.tasks.spawn_dedicated(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                match sweep {
                    Sweep::Cull => inner.cull_expired(),
                    Sweep::IdleTest => inner.test_idle_resources(),
                }
            }
            trace!(?sweep, "pool sweep stopped");
        });
    }

    pub(super) fn cull_expired(self: &Arc<Self>) {
        let now = Instant::now();
        let (expired, overdue, plan) = {
            let mut state = self.state.lock();
            if state.closed || state.broken.is_some() {
                return;
            }
            let expired = state.cull_idle(now, &self.config);
            let overdue = state.cull_unreturned(now, &self.config);
            (expired, overdue, state.plan_resize())
        };

        for (resource, expiry) in expired {
            debug!(pool_id = %self.id, ?expiry, "culling expired resource");
            self.spawn_destroy(resource, false);
        }
        for (resource, card) in overdue {
            match card.checkout_context() {
                Some(context) => warn!(
                    pool_id = %self.id,
                    checked_out_at = %context.checked_out_at,
                    thread = ?context.thread,
                    backtrace = %context.backtrace,
                    "destroying resource that was never checked in"
                ),
                None => warn!(
                    pool_id = %self.id,
                    "destroying resource that was never checked in; enable debug_unreturned_checkouts to see where it was checked out"
                ),
            }
            self.spawn_destroy(resource, true);
        }
        self.apply_resize(plan);
    }

    pub(super) fn test_idle_resources(self: &Arc<Self>) {
        let batch = {
            let mut state = self.state.lock();
            if state.closed || state.broken.is_some() {
                return;
            }
            state.begin_idle_tests()
        };
        if !batch.is_empty() {
            trace!(pool_id = %self.id, count = batch.len(), "testing idle resources");
        }
        for resource in batch {
            let inner = self.clone();
            self.tasks
                .spawn(Lane::IdleTest, async move { inner.idle_test(resource).await });
        }
    }

    async fn idle_test(self: Arc<Self>, resource: M::Resource) {
        let failure = self
            .manager
            .refurbish_idle(&resource)
            .await
            .err()
            .map(|err| err.to_string());
        if let Some(message) = &failure {
            warn!(pool_id = %self.id, error = %message, "idle test failed, destroying resource");
        }

        let destroy = self.state.lock().complete_idle_test(&resource, failure);
        // A checkout may have been waiting for this test to finish.
        self.available_notify.notify_waiters();
        if destroy {
            self.spawn_destroy(resource, false);
            self.recheck_resize();
        }
    }
}

/// Destroy a resource acquired for a pool that no longer exists
pub(super) async fn destroy_orphan<M: Manager>(manager: &M, resource: M::Resource) {
    if let Err(err) = manager.destroy(&resource, false).await {
        debug!(error = %err, "failed to destroy resource acquired after the pool was dropped");
    }
}

async fn acquire_with_retry<M: Manager>(
    manager: &M,
    pool: &Weak<PoolInner<M>>,
    shutdown: &CancellationToken,
    attempts: Option<u32>,
    delay: Duration,
) -> AcquireOutcome<M::Resource> {
    let mut attempt: u32 = 0;
    loop {
        attempt = attempt.saturating_add(1);
        let result = tokio::select! {
            _ = shutdown.cancelled() => return AcquireOutcome::Cancelled,
            result = manager.acquire() => result,
        };
        let err = match result {
            Ok(resource) => return AcquireOutcome::Acquired(resource),
            Err(err) => err,
        };

        let message = err.to_string();
        warn!(attempt, error = %message, "resource acquisition failed");
        {
            let Some(inner) = pool.upgrade() else {
                return AcquireOutcome::Cancelled;
            };
            inner
                .state
                .lock()
                .record_failure(FailureKind::Acquire, message.clone());
        }

        if attempts.is_some_and(|max| attempt >= max) {
            return AcquireOutcome::Exhausted(message);
        }
        tokio::select! {
            _ = shutdown.cancelled() => return AcquireOutcome::Cancelled,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
