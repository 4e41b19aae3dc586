//! Adapter running physical connections through the resource pool engine

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use dbpool_core::{Connection, ConnectionStatus, DbError, Result};
use dbpool_resource::{Manager, WeakResourcePool};

use crate::credentials::Credentials;
use crate::session::{ConnectionEventListener, ConnectionSession, SessionHandle, SessionOptions};

/// Opens physical connections for a set of credentials
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn Connection>>;
}

/// [`Manager`] whose resources are connection sessions
pub struct ConnectionManager {
    factory: Arc<dyn ConnectionFactory>,
    credentials: Credentials,
    options: SessionOptions,
    test_on_checkout: bool,
    test_on_checkin: bool,
    router: Arc<FailureRouter>,
}

impl ConnectionManager {
    pub(crate) fn new(
        factory: Arc<dyn ConnectionFactory>,
        credentials: Credentials,
        options: SessionOptions,
        test_on_checkout: bool,
        test_on_checkin: bool,
        router: Arc<FailureRouter>,
    ) -> Self {
        Self {
            factory,
            credentials,
            options,
            test_on_checkout,
            test_on_checkin,
            router,
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }
}

async fn active_test(session: &SessionHandle) -> Result<()> {
    match session.verify().await {
        ConnectionStatus::Okay => Ok(()),
        status => Err(DbError::Connection(format!(
            "connection test failed ({:?})",
            status
        ))),
    }
}

#[async_trait]
impl Manager for ConnectionManager {
    type Resource = SessionHandle;
    type Error = DbError;

    async fn acquire(&self) -> Result<SessionHandle> {
        let physical = self.factory.connect(&self.credentials).await?;
        match ConnectionSession::new(physical.clone(), self.options.clone()).await {
            Ok(session) => {
                session.set_listener(self.router.clone());
                Ok(session)
            }
            Err(err) => {
                if let Err(close_err) = physical.close().await {
                    tracing::debug!(error = %close_err, "failed to close unusable connection");
                }
                Err(err)
            }
        }
    }

    async fn refurbish_on_checkout(&self, session: &SessionHandle) -> Result<()> {
        session.ensure_usable()?;
        if self.test_on_checkout {
            active_test(session).await?;
        }
        Ok(())
    }

    async fn refurbish_on_checkin(&self, session: &SessionHandle) -> Result<()> {
        session.reset().await?;
        session.ensure_usable()?;
        if self.test_on_checkin {
            active_test(session).await?;
        }
        Ok(())
    }

    async fn refurbish_idle(&self, session: &SessionHandle) -> Result<()> {
        active_test(session).await
    }

    async fn destroy(&self, session: &SessionHandle, checked_out: bool) -> Result<()> {
        session.destroy(checked_out).await
    }
}

/// Routes session notifications back to the pool that owns the session
#[derive(Default)]
pub(crate) struct FailureRouter {
    pool: OnceLock<WeakResourcePool<ConnectionManager>>,
}

impl FailureRouter {
    pub(crate) fn attach(&self, pool: WeakResourcePool<ConnectionManager>) {
        let _ = self.pool.set(pool);
    }
}

#[async_trait]
impl ConnectionEventListener for FailureRouter {
    async fn connection_closed(&self, session: &SessionHandle) {
        match self.pool.get().and_then(WeakResourcePool::upgrade) {
            Some(pool) => pool.checkin(session.clone()).await,
            None => {
                tracing::debug!(session_id = %session.id(), "pool is gone, closing connection");
                if let Err(err) = session.destroy(true).await {
                    tracing::debug!(error = %err, "failed to close orphaned connection");
                }
            }
        }
    }

    fn connection_error_occurred(&self, session: &SessionHandle, status: ConnectionStatus) {
        let Some(pool) = self.pool.get().and_then(WeakResourcePool::upgrade) else {
            return;
        };
        match status {
            ConnectionStatus::Okay => {}
            ConnectionStatus::ConnectionInvalid => pool.mark_broken(session),
            ConnectionStatus::DatabaseInvalid => {
                tracing::error!(
                    pool_id = %pool.id(),
                    session_id = %session.id(),
                    "database appears unreachable, resetting pool"
                );
                pool.reset_pool();
            }
        }
    }
}
