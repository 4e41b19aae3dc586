//! Generic resource pool engine
//!
//! A [`ResourcePool`] hands out resources created by a pluggable
//! [`Manager`], bounded by a configurable size range. It keeps itself
//! sized in the background, expires stale resources, runs idle health
//! checks, and escalates acquisition failures.
//!
//! # Example
//!
//! ```ignore
//! use dbpool_resource::{ResourcePool, ResourcePoolConfig};
//!
//! let config = ResourcePoolConfig::new(3, 15)
//!     .with_increment(3)
//!     .with_max_idle_time_ms(300_000);
//!
//! let pool = ResourcePool::new(manager, config)?;
//! let resource = pool.checkout_timeout(Duration::from_secs(5)).await?;
//! // Use resource...
//! pool.checkin(resource).await;
//! ```

mod config;
mod events;
mod manager;
mod pool;
mod punch_card;
mod stats;
mod tasks;

pub use config::ResourcePoolConfig;
pub use events::{PoolEvent, PoolEventKind, PoolEventListener};
pub use manager::Manager;
pub use pool::{ResourcePool, WeakResourcePool};
pub use punch_card::{CheckoutContext, Expiry, PunchCard};
pub use stats::{FailureKind, FailureRecord, LastFailures, PoolStats};

pub use dbpool_core::PoolError;
