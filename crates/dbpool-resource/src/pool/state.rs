//! Bookkeeping sets guarded by the pool lock
//!
//! Nothing in here awaits or calls into the manager. Every method runs
//! with the pool lock held and reports what the caller has to do once the
//! lock is released.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;

use dbpool_core::PoolError;
use tokio::time::Instant;
use tracing::debug;

use crate::config::ResourcePoolConfig;
use crate::punch_card::{Expiry, PunchCard};
use crate::stats::{FailureKind, LastFailures, PoolStats};

/// Bounded membership set of resources the pool used to manage
///
/// Only used to tell a stale checkin apart from a foreign one, so the
/// oldest entries are simply forgotten once capacity is reached.
pub(super) struct FormerSet<R> {
    order: VecDeque<R>,
    members: HashSet<R>,
    capacity: usize,
}

impl<R: Clone + Eq + Hash> FormerSet<R> {
    pub(super) fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    pub(super) fn insert(&mut self, resource: R) {
        if self.members.insert(resource.clone()) {
            self.order.push_back(resource);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
    }

    pub(super) fn remove(&mut self, resource: &R) {
        if self.members.remove(resource) {
            self.order.retain(|r| r != resource);
        }
    }

    pub(super) fn contains(&self, resource: &R) -> bool {
        self.members.contains(resource)
    }
}

/// Background work decided while holding the lock
pub(super) struct ResizePlan<R> {
    pub(super) acquire: usize,
    pub(super) remove: Vec<R>,
}

impl<R> ResizePlan<R> {
    fn none() -> Self {
        Self {
            acquire: 0,
            remove: Vec::new(),
        }
    }
}

/// What a checkin has to do after the lock is released
pub(super) enum CheckinAction {
    /// Run the checkin refurbish hook, then make it available
    Refurbish,
    /// Destroy the resource
    Destroy,
    /// Duplicate or foreign checkin
    Ignore,
}

/// Result of invalidating a single resource
pub(super) enum Invalidation {
    /// It was idle in the pool and has been removed
    DestroyNow,
    /// It is in use; it will be destroyed when it comes back
    Excluded,
    /// Not managed by this pool
    Unknown,
}

pub(super) struct PoolState<R> {
    /// Live resources and their punch cards
    pub(super) managed: HashMap<R, PunchCard>,
    /// Idle resources, most recently returned first
    pub(super) available: VecDeque<R>,
    /// Invalidated while checked out, destroyed on checkin
    pub(super) excluded: HashSet<R>,
    /// Available resources with an idle test in flight
    pub(super) idle_check: HashSet<R>,
    /// Checked in, checkin refurbish still running
    pub(super) returning: HashSet<R>,
    pub(super) former: FormerSet<R>,
    pub(super) target_size: usize,
    pub(super) pending_acquires: usize,
    pub(super) waiters: usize,
    /// Bumped whenever blocked checkouts must give up
    pub(super) interrupt_epoch: u64,
    pub(super) exhaustion: Option<String>,
    pub(super) broken: Option<String>,
    pub(super) closed: bool,
    pub(super) failures: LastFailures,
}

impl<R: Clone + Eq + Hash> PoolState<R> {
    pub(super) fn new(config: &ResourcePoolConfig) -> Self {
        Self {
            managed: HashMap::new(),
            available: VecDeque::new(),
            excluded: HashSet::new(),
            idle_check: HashSet::new(),
            returning: HashSet::new(),
            former: FormerSet::new(config.max_size() * 4),
            target_size: config.initial_target(),
            pending_acquires: 0,
            waiters: 0,
            interrupt_epoch: 0,
            exhaustion: None,
            broken: None,
            closed: false,
            failures: LastFailures::default(),
        }
    }

    pub(super) fn ensure_open(&self, waited: bool) -> Result<(), PoolError> {
        if self.closed {
            return Err(if waited {
                PoolError::Interrupted
            } else {
                PoolError::Closed
            });
        }
        if let Some(reason) = &self.broken {
            return Err(PoolError::Broken(reason.clone()));
        }
        Ok(())
    }

    fn is_shut(&self) -> bool {
        self.closed || self.broken.is_some()
    }

    pub(super) fn stats(&self) -> PoolStats {
        let checked_out = self
            .managed
            .values()
            .filter(|card| card.is_checked_out())
            .count();
        PoolStats::new(
            self.managed.len(),
            self.available.len(),
            self.excluded.len(),
            checked_out,
            self.idle_check.len(),
            self.waiters,
            self.target_size,
            self.pending_acquires,
        )
    }

    pub(super) fn record_failure(&mut self, kind: FailureKind, message: String) {
        self.failures.record(kind, message);
    }

    pub(super) fn checked_out(&self) -> Vec<R> {
        self.managed
            .iter()
            .filter(|(_, card)| card.is_checked_out())
            .map(|(resource, _)| resource.clone())
            .collect()
    }

    /// Stop managing a resource, remembering that it once belonged here
    pub(super) fn retire(&mut self, resource: &R) -> Option<PunchCard> {
        self.available.retain(|r| r != resource);
        let card = self.managed.remove(resource);
        self.former.insert(resource.clone());
        card
    }

    fn expire(&mut self, resource: &R, expiry: Expiry, config: &ResourcePoolConfig) {
        self.retire(resource);
        if expiry.shrinks_pool() {
            self.target_size = self
                .target_size
                .saturating_sub(1)
                .max(config.min_size());
        }
    }

    /// Pop the most recently returned resource that can be handed out
    ///
    /// Resources under idle test are skipped. Resources that expired while
    /// idle are retired and reported instead of being returned.
    pub(super) fn take_available(
        &mut self,
        now: Instant,
        config: &ResourcePoolConfig,
    ) -> (Option<R>, Vec<(R, Expiry)>) {
        let mut expired = Vec::new();
        loop {
            let Some(pos) = self
                .available
                .iter()
                .position(|r| !self.idle_check.contains(r))
            else {
                return (None, expired);
            };
            let Some(resource) = self.available.remove(pos) else {
                return (None, expired);
            };
            let pool_size = self.managed.len();
            let expiry = self
                .managed
                .get(&resource)
                .and_then(|card| card.idle_expiry(now, pool_size, config));
            match expiry {
                Some(expiry) => {
                    self.expire(&resource, expiry, config);
                    expired.push((resource, expiry));
                }
                None => {
                    if let Some(card) = self.managed.get_mut(&resource) {
                        card.punch_out(now);
                    }
                    return (Some(resource), expired);
                }
            }
        }
    }

    /// Raise the target size for callers that found nothing available
    ///
    /// Grows by at least one increment beyond what is managed or already
    /// being acquired, clamped to `[min_size, max_size]`.
    pub(super) fn grow_for_demand(&mut self, config: &ResourcePoolConfig) {
        if self.waiters <= self.pending_acquires {
            return;
        }
        let shortfall = self.waiters - self.pending_acquires;
        let wanted = self.managed.len() + self.pending_acquires + shortfall.max(config.increment());
        let grown = wanted
            .max(self.target_size)
            .clamp(config.min_size(), config.max_size());
        if grown > self.target_size {
            debug!(
                from = self.target_size,
                to = grown,
                waiters = self.waiters,
                "raising target pool size"
            );
            self.target_size = grown;
        }
    }

    /// Work needed to converge the managed count on the target size
    ///
    /// Acquisitions are counted as pending right away. Shrinking takes the
    /// least recently used idle resources first.
    pub(super) fn plan_resize(&mut self) -> ResizePlan<R> {
        if self.is_shut() {
            return ResizePlan::none();
        }
        let mut plan = ResizePlan::none();
        let in_flight = self.managed.len() + self.pending_acquires;
        if in_flight < self.target_size {
            plan.acquire = self.target_size - in_flight;
            self.pending_acquires += plan.acquire;
        } else if self.managed.len() > self.target_size {
            let excess = self.managed.len() - self.target_size;
            for _ in 0..excess {
                let Some(pos) = self
                    .available
                    .iter()
                    .rposition(|r| !self.idle_check.contains(r))
                else {
                    break;
                };
                if let Some(resource) = self.available.remove(pos) {
                    self.retire(&resource);
                    plan.remove.push(resource);
                }
            }
        }
        plan
    }

    /// Add a freshly acquired resource, returns false if it must be destroyed
    pub(super) fn assimilate(
        &mut self,
        resource: &R,
        now: Instant,
        config: &ResourcePoolConfig,
    ) -> bool {
        self.pending_acquires = self.pending_acquires.saturating_sub(1);
        if self.is_shut()
            || self.managed.len() >= config.max_size()
            || self.managed.contains_key(resource)
        {
            return false;
        }
        self.former.remove(resource);
        self.managed.insert(resource.clone(), PunchCard::new(now));
        self.available.push_front(resource.clone());
        true
    }

    pub(super) fn begin_checkin(&mut self, resource: &R) -> CheckinAction {
        if self.excluded.remove(resource) {
            self.former.insert(resource.clone());
            return CheckinAction::Destroy;
        }
        let shut = self.is_shut();
        let Some(card) = self.managed.get_mut(resource) else {
            return CheckinAction::Ignore;
        };
        if !card.is_checked_out() {
            return CheckinAction::Ignore;
        }
        if shut {
            self.retire(resource);
            return CheckinAction::Destroy;
        }
        card.clear_checkout();
        self.returning.insert(resource.clone());
        CheckinAction::Refurbish
    }

    /// Record the checkin refurbish outcome, returns true to destroy
    pub(super) fn complete_checkin(
        &mut self,
        resource: &R,
        failure: Option<String>,
        now: Instant,
    ) -> bool {
        self.returning.remove(resource);
        if self.excluded.remove(resource) {
            self.former.insert(resource.clone());
            if let Some(message) = failure {
                self.record_failure(FailureKind::CheckinRefurbish, message);
            }
            return true;
        }
        if !self.managed.contains_key(resource) {
            return false;
        }
        if let Some(message) = failure {
            self.record_failure(FailureKind::CheckinRefurbish, message);
            self.retire(resource);
            return true;
        }
        if self.is_shut() {
            self.retire(resource);
            return true;
        }
        if let Some(card) = self.managed.get_mut(resource) {
            card.punch_in(now);
        }
        self.available.push_front(resource.clone());
        false
    }

    pub(super) fn invalidate(&mut self, resource: &R) -> Invalidation {
        if !self.managed.contains_key(resource) {
            return Invalidation::Unknown;
        }
        let idle = !self.idle_check.contains(resource) && self.available.contains(resource);
        if idle {
            self.retire(resource);
            Invalidation::DestroyNow
        } else {
            self.available.retain(|r| r != resource);
            self.managed.remove(resource);
            self.excluded.insert(resource.clone());
            Invalidation::Excluded
        }
    }

    /// Retire every idle resource not under test
    pub(super) fn drain_available(&mut self) -> Vec<R> {
        let idle: Vec<R> = self
            .available
            .iter()
            .filter(|r| !self.idle_check.contains(*r))
            .cloned()
            .collect();
        for resource in &idle {
            self.retire(resource);
        }
        idle
    }

    /// Mark the pool closed and collect what to destroy
    ///
    /// Each entry carries the `checked_out` flag for the manager.
    pub(super) fn close(&mut self, destroy_checked_out: bool) -> Vec<(R, bool)> {
        self.closed = true;
        let mut doomed: Vec<(R, bool)> = self
            .drain_available()
            .into_iter()
            .map(|r| (r, false))
            .collect();
        // Resources under idle test are destroyed when the test completes.
        for resource in self.idle_check.clone() {
            self.retire(&resource);
        }
        if destroy_checked_out {
            for resource in self.checked_out() {
                self.retire(&resource);
                doomed.push((resource, true));
            }
        }
        doomed
    }

    /// Retire idle resources matched by the expiration rules, oldest first
    pub(super) fn cull_idle(
        &mut self,
        now: Instant,
        config: &ResourcePoolConfig,
    ) -> Vec<(R, Expiry)> {
        let candidates: Vec<R> = self
            .available
            .iter()
            .rev()
            .filter(|r| !self.idle_check.contains(*r))
            .cloned()
            .collect();
        let mut expired = Vec::new();
        for resource in candidates {
            let pool_size = self.managed.len();
            let expiry = self
                .managed
                .get(&resource)
                .and_then(|card| card.idle_expiry(now, pool_size, config));
            if let Some(expiry) = expiry {
                self.expire(&resource, expiry, config);
                expired.push((resource, expiry));
            }
        }
        expired
    }

    /// Retire checked-out resources held past the unreturned checkout timeout
    pub(super) fn cull_unreturned(
        &mut self,
        now: Instant,
        config: &ResourcePoolConfig,
    ) -> Vec<(R, PunchCard)> {
        let overdue: Vec<R> = self
            .managed
            .iter()
            .filter(|(_, card)| card.checkout_expiry(now, config).is_some())
            .map(|(resource, _)| resource.clone())
            .collect();
        overdue
            .into_iter()
            .filter_map(|resource| {
                let card = self.retire(&resource)?;
                Some((resource, card))
            })
            .collect()
    }

    /// Mark every idle resource as under test
    pub(super) fn begin_idle_tests(&mut self) -> Vec<R> {
        let batch: Vec<R> = self
            .available
            .iter()
            .filter(|r| !self.idle_check.contains(*r))
            .cloned()
            .collect();
        self.idle_check.extend(batch.iter().cloned());
        batch
    }

    /// Record an idle test outcome, returns true to destroy
    pub(super) fn complete_idle_test(&mut self, resource: &R, failure: Option<String>) -> bool {
        self.idle_check.remove(resource);
        let failed = failure.is_some();
        if let Some(message) = failure {
            self.record_failure(FailureKind::IdleTest, message);
        }
        if self.excluded.remove(resource) {
            self.former.insert(resource.clone());
            return true;
        }
        if !self.managed.contains_key(resource) {
            return true;
        }
        if failed || self.is_shut() {
            self.retire(resource);
            return true;
        }
        false
    }
}
