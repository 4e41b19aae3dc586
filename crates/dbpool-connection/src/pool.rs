//! Pool of connections for one set of credentials

mod config;
mod connection_manager;

use std::sync::Arc;
use std::time::Duration;

use dbpool_core::Result;
use dbpool_resource::{LastFailures, PoolStats, ResourcePool};
use uuid::Uuid;

use crate::credentials::Credentials;
use crate::facade::PooledConnection;
use crate::session::SessionOptions;
use crate::statement_cache::BoundedStatementCache;
use crate::tester::{ConnectionTester, DefaultConnectionTester};

pub use config::ConnectionPoolConfig;
pub use connection_manager::{ConnectionFactory, ConnectionManager};

use connection_manager::FailureRouter;

/// Connection pool handing out [`PooledConnection`]s
///
/// Cloning is cheap; clones share the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    engine: ResourcePool<ConnectionManager>,
}

impl ConnectionPool {
    /// Create a pool tested by a [`DefaultConnectionTester`] built from the
    /// configuration
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        credentials: Credentials,
        config: ConnectionPoolConfig,
    ) -> Result<Self> {
        let mut tester = DefaultConnectionTester::new().with_timeout(config.test_timeout());
        if let Some(query) = config.preferred_test_query() {
            tester = tester.with_test_query(query);
        }
        Self::with_tester(factory, credentials, config, Arc::new(tester))
    }

    /// Create a pool with a custom connection tester
    pub fn with_tester(
        factory: Arc<dyn ConnectionFactory>,
        credentials: Credentials,
        config: ConnectionPoolConfig,
        tester: Arc<dyn ConnectionTester>,
    ) -> Result<Self> {
        config.validate()?;

        let mut options =
            SessionOptions::new(tester).with_auto_commit_on_close(config.auto_commit_on_close());
        if let Some(max) = config.max_statements_per_connection() {
            options = options.with_statement_cache(Arc::new(BoundedStatementCache::new(max)));
        }

        let router = Arc::new(FailureRouter::default());
        let manager = ConnectionManager::new(
            factory,
            credentials,
            options,
            config.test_connection_on_checkout(),
            config.test_connection_on_checkin(),
            router.clone(),
        );
        let engine = ResourcePool::new(manager, config.pool().clone())?;
        router.attach(engine.downgrade());

        tracing::info!(
            pool_id = %engine.id(),
            user = engine.manager().credentials().user(),
            "connection pool created"
        );
        Ok(Self { engine })
    }

    pub fn id(&self) -> Uuid {
        self.engine.id()
    }

    pub fn credentials(&self) -> &Credentials {
        self.engine.manager().credentials()
    }

    /// The underlying resource pool
    pub fn engine(&self) -> &ResourcePool<ConnectionManager> {
        &self.engine
    }

    /// Get a connection, waiting at most the configured checkout timeout
    pub async fn get_connection(&self) -> Result<PooledConnection> {
        let timeout = self
            .engine
            .config()
            .checkout_timeout()
            .unwrap_or(Duration::ZERO);
        self.get_connection_timeout(timeout).await
    }

    /// Get a connection, waiting at most `timeout` (zero waits forever)
    #[tracing::instrument(skip(self), fields(pool_id = %self.engine.id()))]
    pub async fn get_connection_timeout(&self, timeout: Duration) -> Result<PooledConnection> {
        let session = self.engine.checkout_timeout(timeout).await?;
        match session.acquire_facade() {
            Ok(connection) => {
                tracing::trace!(session_id = %session.id(), "connection checked out");
                Ok(connection)
            }
            Err(err) => {
                self.engine.checkin(session).await;
                Err(err)
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.engine.stats()
    }

    pub fn last_failures(&self) -> LastFailures {
        self.engine.last_failures()
    }

    /// Replace every connection, e.g. after the database restarted
    pub fn reset(&self) {
        self.engine.reset_pool();
    }

    pub fn is_closed(&self) -> bool {
        self.engine.is_closed()
    }

    /// Close the pool and every connection in it
    pub async fn close(&self) {
        if let Err(err) = self.engine.close().await {
            tracing::warn!(pool_id = %self.engine.id(), error = %err, "pool cleanup task failed");
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("id", &self.engine.id())
            .field("credentials", self.credentials())
            .field("stats", &self.engine.stats())
            .finish()
    }
}
