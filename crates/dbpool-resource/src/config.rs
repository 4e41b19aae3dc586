//! Resource pool configuration

use std::time::Duration;

use dbpool_core::PoolError;
use serde::{Deserialize, Serialize};

/// Smallest interval the expiration timer is allowed to run at
const MIN_EXPIRATION_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Configuration for a resource pool
///
/// All durations are stored in milliseconds. A value of `0` disables the
/// corresponding behavior, so the getters return `Option<Duration>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcePoolConfig {
    /// Number of resources to acquire when the pool starts
    initial_size: usize,
    /// Lower bound of the target size
    min_size: usize,
    /// Upper bound of managed resources
    max_size: usize,
    /// Minimum step by which the pool grows under demand
    increment: usize,
    /// Acquire attempts per acquisition task, 0 retries forever
    acquire_retry_attempts: u32,
    /// Pause between failed acquire attempts
    acquire_retry_delay_ms: u64,
    /// Break the pool permanently when an acquisition task gives up
    break_after_acquire_failure: bool,
    /// Default checkout timeout, 0 waits forever
    checkout_timeout_ms: u64,
    /// Period of the idle health check pass
    idle_test_period_ms: u64,
    /// Idle time after which any resource expires
    max_idle_time_ms: u64,
    /// Idle time after which resources above `min_size` expire
    max_idle_time_excess_ms: u64,
    /// Absolute age after which a resource expires
    max_resource_age_ms: u64,
    /// Time after which a checked-out resource is destroyed
    unreturned_checkout_timeout_ms: u64,
    /// Period of the cull pass, derived from the thresholds when 0
    expiration_check_interval_ms: u64,
    /// Capture a backtrace at checkout for diagnosing leaks
    debug_unreturned_checkouts: bool,
    /// Concurrency limit per kind of background task (acquire, checkin
    /// refurbish and destroy, idle test)
    num_helper_tasks: usize,
    /// Refurbish returned resources on the caller's task
    force_synchronous_checkins: bool,
}

impl ResourcePoolConfig {
    /// Create a configuration with the given size bounds
    ///
    /// The pool starts with `min_size` resources. Use [`validate`] to check
    /// the bounds; construction itself never fails.
    ///
    /// [`validate`]: ResourcePoolConfig::validate
    pub fn new(min_size: usize, max_size: usize) -> Self {
        Self {
            initial_size: min_size,
            min_size,
            max_size,
            ..Self::default()
        }
    }

    pub fn with_initial_size(mut self, initial_size: usize) -> Self {
        self.initial_size = initial_size;
        self
    }

    pub fn with_increment(mut self, increment: usize) -> Self {
        self.increment = increment;
        self
    }

    pub fn with_acquire_retry_attempts(mut self, attempts: u32) -> Self {
        self.acquire_retry_attempts = attempts;
        self
    }

    pub fn with_acquire_retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.acquire_retry_delay_ms = delay_ms;
        self
    }

    pub fn with_break_after_acquire_failure(mut self, enabled: bool) -> Self {
        self.break_after_acquire_failure = enabled;
        self
    }

    pub fn with_checkout_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.checkout_timeout_ms = timeout_ms;
        self
    }

    pub fn with_idle_test_period_ms(mut self, period_ms: u64) -> Self {
        self.idle_test_period_ms = period_ms;
        self
    }

    pub fn with_max_idle_time_ms(mut self, idle_ms: u64) -> Self {
        self.max_idle_time_ms = idle_ms;
        self
    }

    pub fn with_max_idle_time_excess_ms(mut self, idle_ms: u64) -> Self {
        self.max_idle_time_excess_ms = idle_ms;
        self
    }

    pub fn with_max_resource_age_ms(mut self, age_ms: u64) -> Self {
        self.max_resource_age_ms = age_ms;
        self
    }

    pub fn with_unreturned_checkout_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.unreturned_checkout_timeout_ms = timeout_ms;
        self
    }

    pub fn with_expiration_check_interval_ms(mut self, interval_ms: u64) -> Self {
        self.expiration_check_interval_ms = interval_ms;
        self
    }

    pub fn with_debug_unreturned_checkouts(mut self, enabled: bool) -> Self {
        self.debug_unreturned_checkouts = enabled;
        self
    }

    pub fn with_num_helper_tasks(mut self, tasks: usize) -> Self {
        self.num_helper_tasks = tasks;
        self
    }

    pub fn with_force_synchronous_checkins(mut self, enabled: bool) -> Self {
        self.force_synchronous_checkins = enabled;
        self
    }

    /// Check the size bounds and task limits
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_size == 0 {
            return Err(PoolError::Configuration(
                "max_size must be greater than 0".into(),
            ));
        }
        if self.min_size > self.max_size {
            return Err(PoolError::Configuration(format!(
                "min_size ({}) cannot exceed max_size ({})",
                self.min_size, self.max_size
            )));
        }
        if self.increment == 0 {
            return Err(PoolError::Configuration(
                "increment must be greater than 0".into(),
            ));
        }
        if self.num_helper_tasks == 0 {
            return Err(PoolError::Configuration(
                "num_helper_tasks must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn initial_size(&self) -> usize {
        self.initial_size
    }

    pub fn min_size(&self) -> usize {
        self.min_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn increment(&self) -> usize {
        self.increment
    }

    /// Target size the pool starts converging to
    pub fn initial_target(&self) -> usize {
        self.initial_size.clamp(self.min_size, self.max_size)
    }

    /// Acquire attempts per task, `None` meaning unlimited
    pub fn acquire_retry_attempts(&self) -> Option<u32> {
        (self.acquire_retry_attempts > 0).then_some(self.acquire_retry_attempts)
    }

    pub fn acquire_retry_delay(&self) -> Duration {
        Duration::from_millis(self.acquire_retry_delay_ms)
    }

    pub fn break_after_acquire_failure(&self) -> bool {
        self.break_after_acquire_failure
    }

    /// Default checkout timeout, `None` waits forever
    pub fn checkout_timeout(&self) -> Option<Duration> {
        millis(self.checkout_timeout_ms)
    }

    pub fn idle_test_period(&self) -> Option<Duration> {
        millis(self.idle_test_period_ms)
    }

    pub fn max_idle_time(&self) -> Option<Duration> {
        millis(self.max_idle_time_ms)
    }

    pub fn max_idle_time_excess(&self) -> Option<Duration> {
        millis(self.max_idle_time_excess_ms)
    }

    pub fn max_resource_age(&self) -> Option<Duration> {
        millis(self.max_resource_age_ms)
    }

    pub fn unreturned_checkout_timeout(&self) -> Option<Duration> {
        millis(self.unreturned_checkout_timeout_ms)
    }

    /// Period of the cull pass
    ///
    /// When not set explicitly this is a quarter of the shortest enabled
    /// expiration threshold, floored at 10ms. `None` when nothing expires.
    pub fn expiration_check_interval(&self) -> Option<Duration> {
        if let Some(interval) = millis(self.expiration_check_interval_ms) {
            return Some(interval);
        }
        [
            self.max_idle_time(),
            self.max_idle_time_excess(),
            self.max_resource_age(),
            self.unreturned_checkout_timeout(),
        ]
        .into_iter()
        .flatten()
        .min()
        .map(|shortest| (shortest / 4).max(MIN_EXPIRATION_CHECK_INTERVAL))
    }

    pub fn debug_unreturned_checkouts(&self) -> bool {
        self.debug_unreturned_checkouts
    }

    pub fn num_helper_tasks(&self) -> usize {
        self.num_helper_tasks
    }

    pub fn force_synchronous_checkins(&self) -> bool {
        self.force_synchronous_checkins
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl Default for ResourcePoolConfig {
    /// Defaults:
    /// - initial/min size: 3, max size: 15, increment: 3
    /// - 30 acquire attempts, 1 second apart
    /// - 3 helper tasks
    /// - every timeout and expiration rule disabled
    fn default() -> Self {
        Self {
            initial_size: 3,
            min_size: 3,
            max_size: 15,
            increment: 3,
            acquire_retry_attempts: 30,
            acquire_retry_delay_ms: 1_000,
            break_after_acquire_failure: false,
            checkout_timeout_ms: 0,
            idle_test_period_ms: 0,
            max_idle_time_ms: 0,
            max_idle_time_excess_ms: 0,
            max_resource_age_ms: 0,
            unreturned_checkout_timeout_ms: 0,
            expiration_check_interval_ms: 0,
            debug_unreturned_checkouts: false,
            num_helper_tasks: 3,
            force_synchronous_checkins: false,
        }
    }
}
