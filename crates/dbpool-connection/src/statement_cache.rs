//! Prepared statement reuse across checkouts of the same connection

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use dbpool_core::{Connection, Result, Statement, StatementDescriptor, StatementKind};
use parking_lot::Mutex;

use crate::session::SessionId;

/// Cache of prepared statements, scoped per physical connection
///
/// Sessions only rely on this contract; how long statements are kept is up
/// to the implementation.
#[async_trait]
pub trait StatementCache: Send + Sync {
    /// Get a statement for `descriptor`, reusing an idle one when possible
    async fn checkout(
        &self,
        owner: SessionId,
        conn: &dyn Connection,
        descriptor: &StatementDescriptor,
    ) -> Result<Arc<dyn Statement>>;

    /// Hand a statement obtained from `checkout` back for reuse
    async fn checkin(
        &self,
        owner: SessionId,
        descriptor: StatementDescriptor,
        statement: Arc<dyn Statement>,
    ) -> Result<()>;

    /// Close and forget every statement kept for `owner`
    async fn close_all(&self, owner: SessionId) -> Result<()>;
}

type IdleStatements = VecDeque<(StatementDescriptor, Arc<dyn Statement>)>;

/// Statement cache keeping at most `max_per_connection` idle statements
/// per connection, reusing the most recently returned one first
pub struct BoundedStatementCache {
    max_per_connection: usize,
    idle: Mutex<HashMap<SessionId, IdleStatements>>,
}

impl BoundedStatementCache {
    pub fn new(max_per_connection: usize) -> Self {
        Self {
            max_per_connection,
            idle: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_per_connection(&self) -> usize {
        self.max_per_connection
    }

    /// Number of idle statements kept for `owner`
    pub fn idle_count(&self, owner: SessionId) -> usize {
        self.idle.lock().get(&owner).map_or(0, VecDeque::len)
    }
}

impl std::fmt::Debug for BoundedStatementCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedStatementCache")
            .field("max_per_connection", &self.max_per_connection)
            .field("connections", &self.idle.lock().len())
            .finish()
    }
}

#[async_trait]
impl StatementCache for BoundedStatementCache {
    async fn checkout(
        &self,
        owner: SessionId,
        conn: &dyn Connection,
        descriptor: &StatementDescriptor,
    ) -> Result<Arc<dyn Statement>> {
        let cached = {
            let mut idle = self.idle.lock();
            idle.get_mut(&owner).and_then(|list| {
                let pos = list.iter().position(|(d, s)| d == descriptor && !s.is_closed())?;
                list.remove(pos).map(|(_, statement)| statement)
            })
        };
        if let Some(statement) = cached {
            tracing::trace!(%owner, sql = %descriptor.sql, "statement cache hit");
            return Ok(statement);
        }

        match descriptor.kind {
            StatementKind::Prepared => conn.prepare(&descriptor.sql).await,
            StatementKind::Callable => conn.prepare_call(&descriptor.sql).await,
        }
    }

    async fn checkin(
        &self,
        owner: SessionId,
        descriptor: StatementDescriptor,
        statement: Arc<dyn Statement>,
    ) -> Result<()> {
        if statement.is_closed() {
            return Ok(());
        }

        let evicted = {
            let mut idle = self.idle.lock();
            let list = idle.entry(owner).or_default();
            list.push_front((descriptor, statement));
            let mut evicted = Vec::new();
            while list.len() > self.max_per_connection {
                if let Some((_, oldest)) = list.pop_back() {
                    evicted.push(oldest);
                }
            }
            evicted
        };

        for statement in evicted {
            tracing::trace!(%owner, sql = statement.sql(), "evicting cached statement");
            statement.close().await?;
        }
        Ok(())
    }

    async fn close_all(&self, owner: SessionId) -> Result<()> {
        let statements = self.idle.lock().remove(&owner).unwrap_or_default();
        let mut first_error = None;
        for (_, statement) in statements {
            if let Err(err) = statement.close().await {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
