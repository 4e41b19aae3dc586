//! Per-resource timing metadata

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::config::ResourcePoolConfig;

/// Where and when a resource was checked out
///
/// Only captured when `debug_unreturned_checkouts` is enabled, since taking
/// a backtrace on every checkout is expensive.
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutContext {
    pub checked_out_at: DateTime<Utc>,
    pub thread: Option<String>,
    pub backtrace: String,
}

impl CheckoutContext {
    pub fn capture() -> Self {
        Self {
            checked_out_at: Utc::now(),
            thread: std::thread::current().name().map(String::from),
            backtrace: std::backtrace::Backtrace::force_capture().to_string(),
        }
    }
}

/// Timing record of one managed resource
#[derive(Debug, Clone)]
pub struct PunchCard {
    acquired_at: Instant,
    last_checkin_at: Instant,
    checkout_at: Option<Instant>,
    checkout_context: Option<Arc<CheckoutContext>>,
}

/// Why a resource expired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Idle past the excess threshold while the pool was above its minimum
    ExcessIdle,
    /// Idle past the max idle threshold
    Idle,
    /// Older than the max resource age
    Age,
    /// Checked out for longer than the unreturned checkout timeout
    Unreturned,
}

impl Expiry {
    /// Idle expirations shrink the pool, the others replace the resource
    pub fn shrinks_pool(&self) -> bool {
        matches!(self, Expiry::ExcessIdle | Expiry::Idle)
    }
}

impl PunchCard {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            acquired_at: now,
            last_checkin_at: now,
            checkout_at: None,
            checkout_context: None,
        }
    }

    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    pub fn last_checkin_at(&self) -> Instant {
        self.last_checkin_at
    }

    /// When the resource was checked out, `None` while in the pool
    pub fn checkout_at(&self) -> Option<Instant> {
        self.checkout_at
    }

    pub fn checkout_context(&self) -> Option<&CheckoutContext> {
        self.checkout_context.as_deref()
    }

    pub fn is_checked_out(&self) -> bool {
        self.checkout_at.is_some()
    }

    pub(crate) fn punch_out(&mut self, now: Instant) {
        self.checkout_at = Some(now);
    }

    pub(crate) fn set_checkout_context(&mut self, context: CheckoutContext) {
        self.checkout_context = Some(Arc::new(context));
    }

    /// Mark the start of a checkin; the resource no longer counts as out
    pub(crate) fn clear_checkout(&mut self) {
        self.checkout_at = None;
        self.checkout_context = None;
    }

    pub(crate) fn punch_in(&mut self, now: Instant) {
        self.clear_checkout();
        self.last_checkin_at = now;
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_checkin_at)
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.acquired_at)
    }

    /// Expiration verdict for a resource sitting in the pool
    ///
    /// Rules are checked in order: excess idle (only while the pool is
    /// larger than `min_size`), max idle, then max age.
    pub fn idle_expiry(
        &self,
        now: Instant,
        pool_size: usize,
        config: &ResourcePoolConfig,
    ) -> Option<Expiry> {
        let idle = self.idle_for(now);
        if let Some(excess) = config.max_idle_time_excess()
            && pool_size > config.min_size()
            && idle > excess
        {
            return Some(Expiry::ExcessIdle);
        }
        if let Some(max_idle) = config.max_idle_time()
            && idle > max_idle
        {
            return Some(Expiry::Idle);
        }
        if let Some(max_age) = config.max_resource_age()
            && self.age(now) > max_age
        {
            return Some(Expiry::Age);
        }
        None
    }

    /// Expiration verdict for a checked-out resource
    pub fn checkout_expiry(&self, now: Instant, config: &ResourcePoolConfig) -> Option<Expiry> {
        let limit = config.unreturned_checkout_timeout()?;
        let out_since = self.checkout_at?;
        (now.saturating_duration_since(out_since) > limit).then_some(Expiry::Unreturned)
    }
}
