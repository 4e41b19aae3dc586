//! The resource pool engine

mod background;
mod state;

use std::sync::{Arc, Weak};
use std::time::Duration;

use dbpool_core::PoolError;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ResourcePoolConfig;
use crate::events::{PoolEvent, PoolEventKind, PoolEventListener};
use crate::manager::Manager;
use crate::punch_card::{CheckoutContext, PunchCard};
use crate::stats::{FailureKind, LastFailures, PoolStats};
use crate::tasks::{Lane, TaskRunner};

use state::{CheckinAction, Invalidation, PoolState, ResizePlan};

/// A pool of resources created and destroyed by a [`Manager`]
///
/// Cloning is cheap and every clone refers to the same pool. Background
/// work (acquisition, refurbishing returned resources, culling, idle
/// tests) runs on the Tokio runtime the pool was created in and never
/// holds the bookkeeping lock while calling into the manager.
pub struct ResourcePool<M: Manager> {
    inner: Arc<PoolInner<M>>,
}

impl<M: Manager> Clone for ResourcePool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// A reference to a pool that does not keep it alive
pub struct WeakResourcePool<M: Manager> {
    inner: Weak<PoolInner<M>>,
}

impl<M: Manager> Clone for WeakResourcePool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: Manager> WeakResourcePool<M> {
    pub fn upgrade(&self) -> Option<ResourcePool<M>> {
        self.inner.upgrade().map(|inner| ResourcePool { inner })
    }
}

pub(crate) struct PoolInner<M: Manager> {
    id: Uuid,
    manager: Arc<M>,
    config: ResourcePoolConfig,
    state: Mutex<PoolState<M::Resource>>,
    /// Woken whenever a blocked checkout may be able to make progress
    available_notify: Notify,
    tasks: TaskRunner,
    shutdown: CancellationToken,
    listeners: RwLock<Vec<Arc<dyn PoolEventListener<M::Resource>>>>,
}

impl<M: Manager> Drop for PoolInner<M> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl<M: Manager> ResourcePool<M> {
    /// Create a pool and start acquiring its initial resources
    ///
    /// Must be called from within a Tokio runtime. Returns immediately;
    /// the initial resources are acquired in the background.
    pub fn new(manager: M, config: ResourcePoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        let tasks = TaskRunner::new(config.num_helper_tasks())?;
        let inner = Arc::new(PoolInner {
            id: Uuid::new_v4(),
            manager: Arc::new(manager),
            state: Mutex::new(PoolState::new(&config)),
            config,
            available_notify: Notify::new(),
            tasks,
            shutdown: CancellationToken::new(),
            listeners: RwLock::new(Vec::new()),
        });

        tracing::info!(
            pool_id = %inner.id,
            min_size = inner.config.min_size(),
            max_size = inner.config.max_size(),
            target_size = inner.config.initial_target(),
            "resource pool created"
        );

        inner.recheck_resize();
        inner.start_sweeps();
        Ok(Self { inner })
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn config(&self) -> &ResourcePoolConfig {
        &self.inner.config
    }

    pub fn manager(&self) -> &M {
        &self.inner.manager
    }

    pub fn downgrade(&self) -> WeakResourcePool<M> {
        WeakResourcePool {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Check out a resource using the configured checkout timeout
    pub async fn checkout(&self) -> Result<M::Resource, PoolError> {
        let timeout = self.inner.config.checkout_timeout().unwrap_or(Duration::ZERO);
        self.checkout_timeout(timeout).await
    }

    /// Check out a resource, waiting at most `timeout` (zero waits forever)
    ///
    /// Expired resources are destroyed instead of being handed out, and a
    /// resource whose checkout refurbish fails is destroyed and replaced
    /// transparently. Dropping the returned future never leaks a resource.
    #[tracing::instrument(skip(self), fields(pool_id = %self.inner.id))]
    pub async fn checkout_timeout(&self, timeout: Duration) -> Result<M::Resource, PoolError> {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        loop {
            let resource = self.inner.await_available(deadline, timeout).await?;
            let guard = CheckoutGuard {
                inner: self.inner.clone(),
                resource: Some(resource.clone()),
            };

            let refurbished = self.inner.manager.refurbish_on_checkout(&resource).await;
            guard.disarm();

            if let Err(err) = refurbished {
                tracing::warn!(error = %err, "checkout refurbish failed, trying another resource");
                self.inner
                    .discard(resource, FailureKind::CheckoutRefurbish, err.to_string());
                continue;
            }

            if !self.inner.confirm_checkout(&resource) {
                // Invalidated or checked in while it was being refurbished
                self.inner.checkin(resource).await;
                continue;
            }

            self.inner.emit(PoolEventKind::CheckedOut, &resource);
            return Ok(resource);
        }
    }

    /// Return a resource to the pool
    ///
    /// Never fails. Duplicate checkins and resources the pool no longer
    /// manages are ignored.
    pub async fn checkin(&self, resource: M::Resource) {
        self.inner.checkin(resource).await;
    }

    /// Check in every resource currently checked out
    pub async fn checkin_all(&self) {
        let outstanding = self.inner.state.lock().checked_out();
        futures::future::join_all(outstanding.into_iter().map(|r| self.inner.checkin(r))).await;
    }

    /// Invalidate one resource
    ///
    /// An idle resource is destroyed right away; a checked-out one is
    /// excluded and destroyed when it is checked in.
    pub fn mark_broken(&self, resource: &M::Resource) {
        let invalidation = self.inner.state.lock().invalidate(resource);
        match invalidation {
            Invalidation::DestroyNow => {
                tracing::debug!(pool_id = %self.inner.id, "destroying broken idle resource");
                self.inner.spawn_destroy(resource.clone(), false);
            }
            Invalidation::Excluded => {
                tracing::debug!(pool_id = %self.inner.id, "excluding broken checked-out resource");
            }
            Invalidation::Unknown => {
                tracing::trace!(pool_id = %self.inner.id, "ignoring broken resource the pool does not manage");
                return;
            }
        }
        self.inner.recheck_resize();
    }

    /// Invalidate every managed resource and start over
    #[tracing::instrument(skip(self), fields(pool_id = %self.inner.id))]
    pub fn reset_pool(&self) {
        let (destroy, excluded) = {
            let mut state = self.inner.state.lock();
            let resources: Vec<M::Resource> = state.managed.keys().cloned().collect();
            let mut destroy = Vec::new();
            let mut excluded = 0usize;
            for resource in resources {
                match state.invalidate(&resource) {
                    Invalidation::DestroyNow => destroy.push(resource),
                    Invalidation::Excluded => excluded += 1,
                    Invalidation::Unknown => {}
                }
            }
            (destroy, excluded)
        };

        tracing::info!(destroyed = destroy.len(), excluded, "resetting resource pool");
        for resource in destroy {
            self.inner.spawn_destroy(resource, false);
        }
        self.inner.recheck_resize();
    }

    /// Change the size the pool converges to
    pub fn set_target_size(&self, target: usize) -> Result<(), PoolError> {
        let config = &self.inner.config;
        if target < config.min_size() || target > config.max_size() {
            return Err(PoolError::Configuration(format!(
                "target size {} is outside [{}, {}]",
                target,
                config.min_size(),
                config.max_size()
            )));
        }
        self.inner.state.lock().target_size = target;
        self.inner.recheck_resize();
        Ok(())
    }

    /// Run one expiration pass now
    pub fn cull_expired(&self) {
        self.inner.cull_expired();
    }

    /// Start an idle test of every available resource now
    pub fn test_idle_resources(&self) {
        self.inner.test_idle_resources();
    }

    /// Close the pool, destroying checked-out resources as well
    pub fn close(&self) -> JoinHandle<()> {
        self.close_with(true)
    }

    /// Close the pool
    ///
    /// Blocked checkouts fail with `Interrupted`, later ones with `Closed`.
    /// Available resources are destroyed, and checked-out ones too when
    /// `destroy_checked_out` is set; otherwise those are destroyed on
    /// checkin. Destruction runs on its own task, awaited through the
    /// returned handle.
    #[tracing::instrument(skip(self), fields(pool_id = %self.inner.id))]
    pub fn close_with(&self, destroy_checked_out: bool) -> JoinHandle<()> {
        self.inner.close(destroy_checked_out)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.state.lock().stats()
    }

    pub fn last_failures(&self) -> LastFailures {
        self.inner.state.lock().failures.clone()
    }

    /// Punch card of a managed resource
    pub fn punch_card(&self, resource: &M::Resource) -> Option<PunchCard> {
        self.inner.state.lock().managed.get(resource).cloned()
    }

    pub fn add_listener(&self, listener: Arc<dyn PoolEventListener<M::Resource>>) {
        self.inner.listeners.write().push(listener);
    }
}

/// Returns a resource whose checkout was abandoned mid-refurbish
struct CheckoutGuard<M: Manager> {
    inner: Arc<PoolInner<M>>,
    resource: Option<M::Resource>,
}

impl<M: Manager> CheckoutGuard<M> {
    fn disarm(mut self) {
        self.resource = None;
    }
}

impl<M: Manager> Drop for CheckoutGuard<M> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            let inner = self.inner.clone();
            self.inner.tasks.spawn_dedicated(async move {
                inner.checkin(resource).await;
            });
        }
    }
}

/// Finishes a synchronous checkin whose caller stopped waiting for it
///
/// The resource has already left the checked-out set, so nothing else
/// would ever make it available or destroy it.
struct CheckinGuard<M: Manager> {
    inner: Arc<PoolInner<M>>,
    resource: Option<M::Resource>,
}

impl<M: Manager> CheckinGuard<M> {
    fn disarm(mut self) {
        self.resource = None;
    }
}

impl<M: Manager> Drop for CheckinGuard<M> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            tracing::debug!(pool_id = %self.inner.id, "checkin abandoned mid-refurbish, finishing it in the background");
            let inner = self.inner.clone();
            self.inner
                .tasks
                .spawn(Lane::Return, async move { inner.finish_checkin(resource).await });
        }
    }
}

/// Keeps the waiter count exact however a blocked checkout ends
struct WaiterGuard<'a, M: Manager> {
    inner: &'a PoolInner<M>,
    epoch: u64,
}

impl<M: Manager> Drop for WaiterGuard<'_, M> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.waiters = state.waiters.saturating_sub(1);
    }
}

impl<M: Manager> PoolInner<M> {
    async fn await_available(
        self: &Arc<Self>,
        deadline: Option<Instant>,
        timeout: Duration,
    ) -> Result<M::Resource, PoolError> {
        let mut waiter: Option<WaiterGuard<'_, M>> = None;
        loop {
            // Registered before looking at the state so no wakeup is lost.
            let notified = self.available_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (picked, expired, plan) = {
                let mut state = self.state.lock();
                state.ensure_open(waiter.is_some())?;
                if let Some(epoch) = waiter.as_ref().map(|w| w.epoch)
                    && state.interrupt_epoch != epoch
                {
                    let reason = state.exhaustion.clone().unwrap_or_default();
                    return Err(PoolError::AcquisitionExhausted(reason));
                }

                let (picked, expired) = state.take_available(Instant::now(), &self.config);
                let plan = if picked.is_none() {
                    if waiter.is_none() {
                        state.waiters += 1;
                        waiter = Some(WaiterGuard {
                            inner: self.as_ref(),
                            epoch: state.interrupt_epoch,
                        });
                    }
                    state.grow_for_demand(&self.config);
                    Some(state.plan_resize())
                } else if !expired.is_empty() {
                    Some(state.plan_resize())
                } else {
                    None
                };
                (picked, expired, plan)
            };

            for (resource, expiry) in expired {
                tracing::debug!(pool_id = %self.id, ?expiry, "resource expired before checkout");
                self.spawn_destroy(resource, false);
            }
            if let Some(plan) = plan {
                self.apply_resize(plan);
            }
            if let Some(resource) = picked {
                return Ok(resource);
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(PoolError::Timeout(timeout));
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Final check after the checkout refurbish, records the checkout context
    fn confirm_checkout(&self, resource: &M::Resource) -> bool {
        let context = self
            .config
            .debug_unreturned_checkouts()
            .then(CheckoutContext::capture);
        let mut state = self.state.lock();
        match state.managed.get_mut(resource) {
            Some(card) if card.is_checked_out() => {
                if let Some(context) = context {
                    card.set_checkout_context(context);
                }
                true
            }
            _ => false,
        }
    }

    async fn checkin(self: &Arc<Self>, resource: M::Resource) {
        let action = self.state.lock().begin_checkin(&resource);
        match action {
            CheckinAction::Refurbish => {
                if self.config.force_synchronous_checkins() {
                    let guard = CheckinGuard {
                        inner: self.clone(),
                        resource: Some(resource.clone()),
                    };
                    self.clone().finish_checkin(resource).await;
                    guard.disarm();
                } else {
                    let inner = self.clone();
                    self.tasks
                        .spawn(Lane::Return, async move { inner.finish_checkin(resource).await });
                }
            }
            CheckinAction::Destroy => {
                tracing::debug!(pool_id = %self.id, "destroying checked-in resource");
                self.spawn_destroy(resource, false);
                self.recheck_resize();
            }
            CheckinAction::Ignore => {
                let former = self.state.lock().former.contains(&resource);
                if former {
                    tracing::trace!(pool_id = %self.id, "ignoring checkin of a resource no longer in the pool");
                } else {
                    tracing::warn!(pool_id = %self.id, "ignoring checkin of a resource that is not checked out of this pool");
                }
            }
        }
    }

    async fn finish_checkin(self: Arc<Self>, resource: M::Resource) {
        let failure = self
            .manager
            .refurbish_on_checkin(&resource)
            .await
            .err()
            .map(|err| err.to_string());
        if let Some(message) = &failure {
            tracing::warn!(pool_id = %self.id, error = %message, "checkin refurbish failed, destroying resource");
        }

        let destroy = self
            .state
            .lock()
            .complete_checkin(&resource, failure, Instant::now());
        if destroy {
            self.spawn_destroy(resource, false);
            self.recheck_resize();
        } else {
            self.available_notify.notify_waiters();
            self.emit(PoolEventKind::CheckedIn, &resource);
        }
    }

    /// Drop a resource whose checkout refurbish failed
    fn discard(self: &Arc<Self>, resource: M::Resource, kind: FailureKind, message: String) {
        let known = {
            let mut state = self.state.lock();
            state.record_failure(kind, message);
            let excluded = state.excluded.remove(&resource);
            state.retire(&resource).is_some() || excluded
        };
        if known {
            self.spawn_destroy(resource, false);
        }
        self.recheck_resize();
    }

    fn recheck_resize(self: &Arc<Self>) {
        let plan = self.state.lock().plan_resize();
        self.apply_resize(plan);
    }

    fn apply_resize(self: &Arc<Self>, plan: ResizePlan<M::Resource>) {
        if plan.acquire > 0 || !plan.remove.is_empty() {
            tracing::trace!(
                pool_id = %self.id,
                acquire = plan.acquire,
                remove = plan.remove.len(),
                "resizing pool"
            );
        }
        for _ in 0..plan.acquire {
            self.spawn_acquire();
        }
        for resource in plan.remove {
            self.spawn_destroy(resource, false);
        }
    }

    fn spawn_destroy(self: &Arc<Self>, resource: M::Resource, checked_out: bool) {
        let inner = self.clone();
        self.tasks.spawn(Lane::Return, async move {
            inner.destroy_resource(resource, checked_out).await;
        });
    }

    async fn destroy_resource(&self, resource: M::Resource, checked_out: bool) {
        if let Err(err) = self.manager.destroy(&resource, checked_out).await {
            tracing::warn!(pool_id = %self.id, error = %err, "failed to destroy resource");
            self.state
                .lock()
                .record_failure(FailureKind::Destroy, err.to_string());
        }
        self.emit(PoolEventKind::Removed, &resource);
    }

    fn close(self: &Arc<Self>, destroy_checked_out: bool) -> JoinHandle<()> {
        let doomed = {
            let mut state = self.state.lock();
            if state.closed {
                Vec::new()
            } else {
                state.close(destroy_checked_out)
            }
        };

        self.shutdown.cancel();
        self.available_notify.notify_waiters();
        tracing::info!(destroying = doomed.len(), "resource pool closed");

        // Destroying on a separate task keeps the caller clear of any lock
        // the resources themselves may be holding.
        let inner = self.clone();
        self.tasks.spawn_dedicated(async move {
            for (resource, checked_out) in doomed {
                inner.destroy_resource(resource, checked_out).await;
            }
        })
    }

    fn emit(&self, kind: PoolEventKind, resource: &M::Resource) {
        let listeners = self.listeners.read().clone();
        if listeners.is_empty() {
            return;
        }
        let event = {
            let state = self.state.lock();
            PoolEvent {
                kind,
                resource: resource.clone(),
                pool_size: state.managed.len(),
                available: state.available.len(),
                excluded: state.excluded.len(),
            }
        };
        for listener in listeners {
            listener.on_event(&event);
        }
    }
}
