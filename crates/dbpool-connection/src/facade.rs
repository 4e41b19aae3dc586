//! Caller-facing decorators over a pooled physical connection

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dbpool_core::{
    Connection, Cursor, DbError, Holdability, IsolationLevel, Result, Row, Statement,
    StatementDescriptor, TypeMap, Value,
};

use crate::session::{Property, SessionHandle, SessionId};

/// State shared by every clone of one façade and by what it produced
pub(crate) struct FacadeInner {
    session: SessionHandle,
    generation: u64,
    closed: AtomicBool,
}

impl FacadeInner {
    pub(crate) fn new(session: SessionHandle, generation: u64) -> Self {
        Self {
            session,
            generation,
            closed: AtomicBool::new(false),
        }
    }

    /// Closed through this façade; does not consult the session
    pub(crate) fn is_marked_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn is_live(&self) -> bool {
        !self.is_marked_closed() && self.session.is_generation_live(self.generation)
    }

    /// Reject calls through a closed façade or onto a connection already
    /// judged invalid
    fn ensure_live(&self) -> Result<()> {
        if !self.is_live() {
            return Err(DbError::closed("pooled connection"));
        }
        let status = self.session.status();
        if !status.is_okay() {
            return Err(DbError::Connection(format!(
                "connection is no longer usable ({:?})",
                status
            )));
        }
        Ok(())
    }

    /// Let the session classify any error before handing it back
    async fn check<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.session.handle_error(err).await;
        }
        result
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.session.facade_closed(self.generation).await;
    }
}

impl Drop for FacadeInner {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::warn!(
            session_id = %self.session.id(),
            "pooled connection dropped without close, returning it to the pool"
        );
        let session = self.session.clone();
        let generation = self.generation;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { session.facade_closed(generation).await });
            }
            Err(_) => {
                tracing::error!(
                    session_id = %session.id(),
                    "no runtime to return a dropped pooled connection on"
                );
            }
        }
    }
}

/// What an operation on the raw connection produced
pub enum RawOutcome {
    Statement(Arc<dyn Statement>),
    Cursor(Arc<dyn Cursor>),
    Count(u64),
    Nothing,
}

impl fmt::Debug for RawOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawOutcome::Statement(stmt) => f.debug_tuple("Statement").field(&stmt.sql()).finish(),
            RawOutcome::Cursor(_) => f.write_str("Cursor"),
            RawOutcome::Count(n) => f.debug_tuple("Count").field(n).finish(),
            RawOutcome::Nothing => f.write_str("Nothing"),
        }
    }
}

/// Connection handed to callers for the span of one checkout
///
/// Closing it returns the physical connection to the pool instead of
/// closing it. Every statement and cursor it produces is tracked and closed
/// on return if the caller forgot to. Clones share the same checkout.
#[derive(Clone)]
pub struct PooledConnection {
    inner: Arc<FacadeInner>,
}

impl PooledConnection {
    pub(crate) fn from_inner(inner: Arc<FacadeInner>) -> Self {
        Self { inner }
    }

    pub fn session_id(&self) -> SessionId {
        self.inner.session.id()
    }

    /// Run `op` against the unwrapped physical connection
    ///
    /// Statements and cursors it returns are tracked like any other and
    /// come back wrapped. The connection is assumed to have been changed
    /// arbitrarily: every property is restored and the transaction settled
    /// when the connection is returned.
    pub async fn raw_operation<F, Fut>(&self, op: F) -> Result<RawOutcome>
    where
        F: FnOnce(Arc<dyn Connection>) -> Fut + Send,
        Fut: Future<Output = Result<RawOutcome>> + Send,
    {
        self.inner.ensure_live()?;
        let session = &self.inner.session;
        session.mark_all_dirty();
        session.mark_unresolved();

        let physical = session.physical().clone();
        let outcome = self.inner.check(op(physical).await).await?;
        Ok(match outcome {
            RawOutcome::Statement(statement) => {
                let key = session.track_statement(statement.clone(), None);
                RawOutcome::Statement(Arc::new(PooledStatement::new(
                    key,
                    statement,
                    self.inner.clone(),
                )))
            }
            RawOutcome::Cursor(cursor) => {
                let key = session.track_cursor(cursor.clone(), None);
                RawOutcome::Cursor(Arc::new(PooledCursor::new(
                    key,
                    cursor,
                    self.inner.clone(),
                )))
            }
            other => other,
        })
    }

    async fn prepare_descriptor(&self, descriptor: StatementDescriptor) -> Result<Arc<dyn Statement>> {
        self.inner.ensure_live()?;
        let session = &self.inner.session;
        let (key, statement) = self.inner.check(session.prepare_tracked(descriptor).await).await?;
        session.mark_unresolved();
        Ok(Arc::new(PooledStatement::new(key, statement, self.inner.clone())))
    }

    async fn set_property<F>(&self, property: Property, set: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send,
    {
        self.inner.ensure_live()?;
        self.inner.session.mark_dirty(property);
        self.inner.check(set.await).await
    }

    fn physical(&self) -> &dyn Connection {
        self.inner.session.physical().as_ref()
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("session_id", &self.inner.session.id())
            .field("closed", &!self.inner.is_live())
            .finish()
    }
}

#[async_trait]
impl Connection for PooledConnection {
    fn driver_name(&self) -> &str {
        self.physical().driver_name()
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.inner.ensure_live()?;
        self.inner.session.mark_unresolved();
        self.inner.check(self.physical().execute(sql, params).await).await
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<Arc<dyn Cursor>> {
        self.inner.ensure_live()?;
        let session = &self.inner.session;
        let cursor = self.inner.check(self.physical().query(sql, params).await).await?;
        session.mark_unresolved();
        let key = session.track_cursor(cursor.clone(), None);
        Ok(Arc::new(PooledCursor::new(key, cursor, self.inner.clone())))
    }

    async fn prepare(&self, sql: &str) -> Result<Arc<dyn Statement>> {
        self.prepare_descriptor(StatementDescriptor::prepared(sql)).await
    }

    async fn prepare_call(&self, sql: &str) -> Result<Arc<dyn Statement>> {
        self.prepare_descriptor(StatementDescriptor::callable(sql)).await
    }

    async fn auto_commit(&self) -> Result<bool> {
        self.inner.ensure_live()?;
        self.inner.check(self.physical().auto_commit().await).await
    }

    async fn set_auto_commit(&self, enabled: bool) -> Result<()> {
        self.inner.ensure_live()?;
        self.inner
            .check(self.physical().set_auto_commit(enabled).await)
            .await?;
        self.inner.session.mark_resolved();
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.inner.ensure_live()?;
        self.inner.check(self.physical().commit().await).await?;
        self.inner.session.mark_resolved();
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.inner.ensure_live()?;
        self.inner.check(self.physical().rollback().await).await?;
        self.inner.session.mark_resolved();
        Ok(())
    }

    async fn transaction_isolation(&self) -> Result<IsolationLevel> {
        self.inner.ensure_live()?;
        self.inner
            .check(self.physical().transaction_isolation().await)
            .await
    }

    async fn set_transaction_isolation(&self, level: IsolationLevel) -> Result<()> {
        self.set_property(
            Property::Isolation,
            self.physical().set_transaction_isolation(level),
        )
        .await
    }

    async fn catalog(&self) -> Result<Option<String>> {
        self.inner.ensure_live()?;
        self.inner.check(self.physical().catalog().await).await
    }

    async fn set_catalog(&self, catalog: Option<String>) -> Result<()> {
        self.set_property(Property::Catalog, self.physical().set_catalog(catalog))
            .await
    }

    async fn holdability(&self) -> Result<Holdability> {
        self.inner.ensure_live()?;
        self.inner.check(self.physical().holdability().await).await
    }

    async fn set_holdability(&self, holdability: Holdability) -> Result<()> {
        self.set_property(
            Property::Holdability,
            self.physical().set_holdability(holdability),
        )
        .await
    }

    async fn is_read_only(&self) -> Result<bool> {
        self.inner.ensure_live()?;
        self.inner.check(self.physical().is_read_only().await).await
    }

    async fn set_read_only(&self, read_only: bool) -> Result<()> {
        self.set_property(Property::ReadOnly, self.physical().set_read_only(read_only))
            .await
    }

    async fn type_map(&self) -> Result<TypeMap> {
        self.inner.ensure_live()?;
        self.inner.check(self.physical().type_map().await).await
    }

    async fn set_type_map(&self, map: TypeMap) -> Result<()> {
        self.set_property(Property::TypeMap, self.physical().set_type_map(map))
            .await
    }

    /// Return the connection to its pool; closing twice is a no-op
    async fn close(&self) -> Result<()> {
        self.inner.close().await;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        !self.inner.is_live()
    }
}

/// Statement produced through a [`PooledConnection`]
pub struct PooledStatement {
    key: u64,
    inner: Arc<dyn Statement>,
    facade: Arc<FacadeInner>,
    closed: AtomicBool,
}

impl PooledStatement {
    fn new(key: u64, inner: Arc<dyn Statement>, facade: Arc<FacadeInner>) -> Self {
        Self {
            key,
            inner,
            facade,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(DbError::closed("statement"));
        }
        self.facade.ensure_live()
    }
}

#[async_trait]
impl Statement for PooledStatement {
    fn sql(&self) -> &str {
        self.inner.sql()
    }

    async fn execute(&self, params: &[Value]) -> Result<u64> {
        self.ensure_open()?;
        self.facade.session.mark_unresolved();
        self.facade.check(self.inner.execute(params).await).await
    }

    async fn query(&self, params: &[Value]) -> Result<Arc<dyn Cursor>> {
        self.ensure_open()?;
        let cursor = self.facade.check(self.inner.query(params).await).await?;
        let session = &self.facade.session;
        session.mark_unresolved();
        let key = session.track_cursor(cursor.clone(), Some(self.key));
        Ok(Arc::new(PooledCursor::new(key, cursor, self.facade.clone())))
    }

    /// Closes the statement's cursors; a cached statement goes back to the
    /// cache instead of being closed
    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) || !self.facade.is_live() {
            return Ok(());
        }
        let released = self.facade.session.release_statement(self.key).await;
        self.facade.check(released).await
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || !self.facade.is_live() || self.inner.is_closed()
    }
}

/// Cursor produced through a [`PooledConnection`] or [`PooledStatement`]
pub struct PooledCursor {
    key: u64,
    inner: Arc<dyn Cursor>,
    facade: Arc<FacadeInner>,
}

impl PooledCursor {
    fn new(key: u64, inner: Arc<dyn Cursor>, facade: Arc<FacadeInner>) -> Self {
        Self { key, inner, facade }
    }
}

#[async_trait]
impl Cursor for PooledCursor {
    async fn next_row(&self) -> Result<Option<Row>> {
        if self.is_closed() {
            return Err(DbError::closed("cursor"));
        }
        self.facade.ensure_live()?;
        self.facade.check(self.inner.next_row().await).await
    }

    async fn close(&self) -> Result<()> {
        self.facade.session.untrack_cursor(self.key);
        if self.inner.is_closed() {
            return Ok(());
        }
        self.facade.check(self.inner.close().await).await
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed() || !self.facade.is_live()
    }
}
