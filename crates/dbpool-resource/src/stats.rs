//! Pool statistics and failure diagnostics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Statistics about a resource pool's current state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Live resources owned by the pool
    managed: usize,
    /// Resources ready to be checked out, including those under idle test
    available: usize,
    /// Resources invalidated while checked out, destroyed on checkin
    excluded: usize,
    /// Resources currently held by callers
    checked_out: usize,
    /// Available resources with a health check in flight
    idle_testing: usize,
    /// Callers blocked in checkout
    waiting: usize,
    /// Size the pool is converging to
    target_size: usize,
    /// Acquisitions in progress
    pending_acquires: usize,
}

impl PoolStats {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        managed: usize,
        available: usize,
        excluded: usize,
        checked_out: usize,
        idle_testing: usize,
        waiting: usize,
        target_size: usize,
        pending_acquires: usize,
    ) -> Self {
        Self {
            managed,
            available,
            excluded,
            checked_out,
            idle_testing,
            waiting,
            target_size,
            pending_acquires,
        }
    }

    pub fn managed(&self) -> usize {
        self.managed
    }

    pub fn available(&self) -> usize {
        self.available
    }

    pub fn excluded(&self) -> usize {
        self.excluded
    }

    pub fn checked_out(&self) -> usize {
        self.checked_out
    }

    pub fn idle_testing(&self) -> usize {
        self.idle_testing
    }

    pub fn waiting(&self) -> usize {
        self.waiting
    }

    pub fn target_size(&self) -> usize {
        self.target_size
    }

    pub fn pending_acquires(&self) -> usize {
        self.pending_acquires
    }

    /// Calculate pool utilization as a fraction (0.0 to 1.0)
    ///
    /// Returns 0.0 if the pool is empty to avoid division by zero.
    pub fn utilization(&self) -> f64 {
        if self.managed == 0 {
            0.0
        } else {
            self.checked_out as f64 / self.managed as f64
        }
    }

    /// Check if every managed resource is checked out
    pub fn is_exhausted(&self) -> bool {
        self.checked_out == self.managed && self.managed > 0
    }
}

/// Category of a failure recorded by the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Acquire,
    CheckoutRefurbish,
    CheckinRefurbish,
    IdleTest,
    Destroy,
}

/// A single recorded failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Most recent failure per category
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastFailures {
    acquire: Option<FailureRecord>,
    checkout_refurbish: Option<FailureRecord>,
    checkin_refurbish: Option<FailureRecord>,
    idle_test: Option<FailureRecord>,
    destroy: Option<FailureRecord>,
}

impl LastFailures {
    pub(crate) fn record(&mut self, kind: FailureKind, message: String) {
        let record = Some(FailureRecord {
            message,
            at: Utc::now(),
        });
        match kind {
            FailureKind::Acquire => self.acquire = record,
            FailureKind::CheckoutRefurbish => self.checkout_refurbish = record,
            FailureKind::CheckinRefurbish => self.checkin_refurbish = record,
            FailureKind::IdleTest => self.idle_test = record,
            FailureKind::Destroy => self.destroy = record,
        }
    }

    pub fn get(&self, kind: FailureKind) -> Option<&FailureRecord> {
        match kind {
            FailureKind::Acquire => self.acquire.as_ref(),
            FailureKind::CheckoutRefurbish => self.checkout_refurbish.as_ref(),
            FailureKind::CheckinRefurbish => self.checkin_refurbish.as_ref(),
            FailureKind::IdleTest => self.idle_test.as_ref(),
            FailureKind::Destroy => self.destroy.as_ref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.acquire.is_none()
            && self.checkout_refurbish.is_none()
            && self.checkin_refurbish.is_none()
            && self.idle_test.is_none()
            && self.destroy.is_none()
    }
}
