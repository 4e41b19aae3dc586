//! Connection pool configuration

use std::time::Duration;

use dbpool_core::PoolError;
use dbpool_resource::ResourcePoolConfig;
use serde::{Deserialize, Serialize};

/// Configuration of a pool of database connections
///
/// Sizing, timeouts and expiration come from the embedded
/// [`ResourcePoolConfig`], which serializes flattened into this struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionPoolConfig {
    #[serde(flatten)]
    pool: ResourcePoolConfig,
    /// Actively test every connection before handing it out
    test_connection_on_checkout: bool,
    /// Actively test every connection after it is returned
    test_connection_on_checkin: bool,
    /// Query used by the default tester instead of the driver's ping query
    preferred_test_query: Option<String>,
    /// Time limit of one connection test
    test_timeout_ms: u64,
    /// Commit an unresolved transaction on close instead of rolling it back
    auto_commit_on_close: bool,
    /// Idle prepared statements kept per connection, 0 disables caching
    max_statements_per_connection: usize,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            pool: ResourcePoolConfig::default(),
            test_connection_on_checkout: false,
            test_connection_on_checkin: false,
            preferred_test_query: None,
            test_timeout_ms: 5000,
            auto_commit_on_close: false,
            max_statements_per_connection: 0,
        }
    }
}

impl ConnectionPoolConfig {
    pub fn new(pool: ResourcePoolConfig) -> Self {
        Self {
            pool,
            ..Self::default()
        }
    }

    pub fn with_test_connection_on_checkout(mut self, enabled: bool) -> Self {
        self.test_connection_on_checkout = enabled;
        self
    }

    pub fn with_test_connection_on_checkin(mut self, enabled: bool) -> Self {
        self.test_connection_on_checkin = enabled;
        self
    }

    pub fn with_preferred_test_query(mut self, query: impl Into<String>) -> Self {
        self.preferred_test_query = Some(query.into());
        self
    }

    pub fn with_test_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.test_timeout_ms = timeout_ms;
        self
    }

    pub fn with_auto_commit_on_close(mut self, enabled: bool) -> Self {
        self.auto_commit_on_close = enabled;
        self
    }

    pub fn with_max_statements_per_connection(mut self, max: usize) -> Self {
        self.max_statements_per_connection = max;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), PoolError> {
        self.pool.validate()?;
        if self.test_timeout_ms == 0 {
            return Err(PoolError::Configuration(
                "test_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn pool(&self) -> &ResourcePoolConfig {
        &self.pool
    }

    pub fn test_connection_on_checkout(&self) -> bool {
        self.test_connection_on_checkout
    }

    pub fn test_connection_on_checkin(&self) -> bool {
        self.test_connection_on_checkin
    }

    pub fn preferred_test_query(&self) -> Option<&str> {
        self.preferred_test_query.as_deref()
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_millis(self.test_timeout_ms)
    }

    pub fn auto_commit_on_close(&self) -> bool {
        self.auto_commit_on_close
    }

    /// Per-connection statement cache size, `None` when caching is off
    pub fn max_statements_per_connection(&self) -> Option<usize> {
        (self.max_statements_per_connection > 0).then_some(self.max_statements_per_connection)
    }
}
