//! One connection pool per distinct set of credentials

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dbpool_core::{PoolError, Result};
use dbpool_resource::PoolStats;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::credentials::Credentials;
use crate::facade::PooledConnection;
use crate::pool::{ConnectionFactory, ConnectionPool, ConnectionPoolConfig};
use crate::registry::PoolRegistry;
use crate::tester::ConnectionTester;

/// Hands out connections from a pool per set of credentials
///
/// Pools are created lazily, the first time their credentials are used,
/// and all share the same configuration.
pub struct PoolManager {
    id: Uuid,
    factory: Arc<dyn ConnectionFactory>,
    default_credentials: Credentials,
    config: ConnectionPoolConfig,
    tester: Option<Arc<dyn ConnectionTester>>,
    pools: RwLock<HashMap<Credentials, ConnectionPool>>,
    closed: AtomicBool,
}

impl PoolManager {
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        default_credentials: Credentials,
        config: ConnectionPoolConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            id: Uuid::new_v4(),
            factory,
            default_credentials,
            config,
            tester: None,
            pools: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Test connections of every pool with `tester`
    pub fn with_tester(mut self, tester: Arc<dyn ConnectionTester>) -> Self {
        self.tester = Some(tester);
        self
    }

    /// Identity token under which the manager is registered
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn default_credentials(&self) -> &Credentials {
        &self.default_credentials
    }

    pub fn config(&self) -> &ConnectionPoolConfig {
        &self.config
    }

    /// Get the pool for `credentials`, creating it on first use
    pub fn pool_for(&self, credentials: &Credentials) -> Result<ConnectionPool> {
        if let Some(pool) = self.pools.read().get(credentials) {
            return Ok(pool.clone());
        }

        let mut pools = self.pools.write();
        if self.is_closed() {
            return Err(PoolError::Closed.into());
        }
        if let Some(pool) = pools.get(credentials) {
            return Ok(pool.clone());
        }

        let pool = match &self.tester {
            Some(tester) => ConnectionPool::with_tester(
                self.factory.clone(),
                credentials.clone(),
                self.config.clone(),
                tester.clone(),
            )?,
            None => ConnectionPool::new(
                self.factory.clone(),
                credentials.clone(),
                self.config.clone(),
            )?,
        };
        tracing::info!(
            manager_id = %self.id,
            user = credentials.user(),
            pools = pools.len() + 1,
            "created pool for new credentials"
        );
        pools.insert(credentials.clone(), pool.clone());
        Ok(pool)
    }

    /// Get a connection for the default credentials
    pub async fn get_connection(&self) -> Result<PooledConnection> {
        self.pool_for(&self.default_credentials)?
            .get_connection()
            .await
    }

    /// Get a connection for the given user
    pub async fn get_connection_for(&self, user: &str, password: &str) -> Result<PooledConnection> {
        let credentials = Credentials::new(user, password);
        self.pool_for(&credentials)?.get_connection().await
    }

    pub fn pool_count(&self) -> usize {
        self.pools.read().len()
    }

    /// Statistics of every pool, keyed by the credentials it serves
    pub fn stats(&self) -> Vec<(Credentials, PoolStats)> {
        self.pools
            .read()
            .iter()
            .map(|(credentials, pool)| (credentials.clone(), pool.stats()))
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close every pool and remove the manager from the global registry
    #[tracing::instrument(skip(self), fields(manager_id = %self.id))]
    pub async fn close(&self) {
        let pools: Vec<ConnectionPool> = {
            let mut pools = self.pools.write();
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            pools.drain().map(|(_, pool)| pool).collect()
        };

        tracing::info!(pools = pools.len(), "closing pool manager");
        futures::future::join_all(pools.iter().map(ConnectionPool::close)).await;
        PoolRegistry::global().unregister(self.id);
    }
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("id", &self.id)
            .field("default_credentials", &self.default_credentials)
            .field("pools", &self.pool_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockFactory, init_tracing};
    use dbpool_core::{Connection, DbError};
    use dbpool_resource::ResourcePoolConfig;
    use std::time::Duration;

    fn manager(factory: &Arc<MockFactory>) -> PoolManager {
        init_tracing();
        let config = ConnectionPoolConfig::new(ResourcePoolConfig::new(1, 2));
        PoolManager::new(factory.clone(), Credentials::new("app", "secret"), config).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_per_credentials() {
        let factory = Arc::new(MockFactory::default());
        let manager = manager(&factory);

        let conn = manager.get_connection().await.unwrap();
        let admin = manager.get_connection_for("admin", "hunter2").await.unwrap();
        assert_eq!(manager.pool_count(), 2);

        // Same credentials, same pool
        let again = manager.get_connection_for("app", "secret").await.unwrap();
        assert_eq!(manager.pool_count(), 2);
        assert_ne!(again.session_id(), conn.session_id());

        let users = factory.users.lock().clone();
        assert!(users.contains(&"app".to_string()));
        assert!(users.contains(&"admin".to_string()));

        let stats = manager.stats();
        assert_eq!(stats.len(), 2);
        let app_stats = stats
            .iter()
            .find(|(credentials, _)| credentials.user() == "app")
            .map(|(_, stats)| *stats)
            .unwrap();
        assert_eq!(app_stats.checked_out(), 2);

        for conn in [conn, admin, again] {
            conn.close().await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_password_is_a_different_pool() {
        let factory = Arc::new(MockFactory::default());
        let manager = manager(&factory);

        let a = manager.pool_for(&Credentials::new("app", "one")).unwrap();
        let b = manager.pool_for(&Credentials::new("app", "two")).unwrap();
        assert_ne!(a.id(), b.id());
        let a_again = manager.pool_for(&Credentials::new("app", "one")).unwrap();
        assert_eq!(a.id(), a_again.id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_closes_every_pool() {
        let factory = Arc::new(MockFactory::default());
        let manager = Arc::new(manager(&factory));
        PoolRegistry::global().register(&manager);

        let conn = manager.get_connection().await.unwrap();
        let pool = manager.pool_for(manager.default_credentials()).unwrap();
        manager.close().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(manager.is_closed());
        assert!(pool.is_closed());
        assert!(conn.is_closed());
        assert_eq!(manager.pool_count(), 0);
        assert!(PoolRegistry::global().lookup(manager.id()).is_none());
        assert!(matches!(
            manager.get_connection().await,
            Err(DbError::Pool(PoolError::Closed))
        ));

        // Closing twice is harmless
        manager.close().await;
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let factory = Arc::new(MockFactory::default());
        let config = ConnectionPoolConfig::new(ResourcePoolConfig::new(5, 1));
        let result = PoolManager::new(factory, Credentials::new("app", "secret"), config);
        assert!(matches!(result, Err(DbError::Pool(PoolError::Configuration(_)))));
    }
}
