//! Per-connection session: façade lifecycle, tracked sub-resources and
//! state restoration between checkouts

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use dbpool_core::{
    Connection, ConnectionStatus, Cursor, DbError, Holdability, IsolationLevel, Result, Statement,
    StatementDescriptor, StatementKind, StatusCell, TypeMap,
};
use parking_lot::Mutex;

use crate::facade::{FacadeInner, PooledConnection};
use crate::statement_cache::StatementCache;
use crate::tester::ConnectionTester;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Property values a connection had when it joined the pool
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionDefaults {
    pub isolation: IsolationLevel,
    pub catalog: Option<String>,
    pub holdability: Holdability,
    pub read_only: bool,
    pub type_map: TypeMap,
}

impl ConnectionDefaults {
    pub async fn capture(conn: &dyn Connection) -> Result<Self> {
        Ok(Self {
            isolation: conn.transaction_isolation().await?,
            catalog: conn.catalog().await?,
            holdability: conn.holdability().await?,
            read_only: conn.is_read_only().await?,
            type_map: conn.type_map().await?,
        })
    }
}

/// A connection property a caller can change through the façade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Property {
    Isolation,
    Catalog,
    Holdability,
    ReadOnly,
    TypeMap,
}

#[derive(Debug, Clone, Copy, Default)]
struct DirtyProps {
    isolation: bool,
    catalog: bool,
    holdability: bool,
    read_only: bool,
    type_map: bool,
}

impl DirtyProps {
    fn all() -> Self {
        Self {
            isolation: true,
            catalog: true,
            holdability: true,
            read_only: true,
            type_map: true,
        }
    }

    fn mark(&mut self, property: Property) {
        match property {
            Property::Isolation => self.isolation = true,
            Property::Catalog => self.catalog = true,
            Property::Holdability => self.holdability = true,
            Property::ReadOnly => self.read_only = true,
            Property::TypeMap => self.type_map = true,
        }
    }
}

/// Collaborators and policies shared by every session of a pool
#[derive(Clone)]
pub struct SessionOptions {
    auto_commit_on_close: bool,
    tester: Arc<dyn ConnectionTester>,
    statement_cache: Option<Arc<dyn StatementCache>>,
}

impl SessionOptions {
    pub fn new(tester: Arc<dyn ConnectionTester>) -> Self {
        Self {
            auto_commit_on_close: false,
            tester,
            statement_cache: None,
        }
    }

    /// Commit instead of rolling back an unresolved transaction on close
    pub fn with_auto_commit_on_close(mut self, enabled: bool) -> Self {
        self.auto_commit_on_close = enabled;
        self
    }

    pub fn with_statement_cache(mut self, cache: Arc<dyn StatementCache>) -> Self {
        self.statement_cache = Some(cache);
        self
    }

    pub fn auto_commit_on_close(&self) -> bool {
        self.auto_commit_on_close
    }

    pub fn tester(&self) -> &Arc<dyn ConnectionTester> {
        &self.tester
    }

    pub fn statement_cache(&self) -> Option<&Arc<dyn StatementCache>> {
        self.statement_cache.as_ref()
    }
}

/// Receives lifecycle notifications from sessions
#[async_trait]
pub trait ConnectionEventListener: Send + Sync {
    /// The caller closed the session's façade
    async fn connection_closed(&self, session: &SessionHandle);

    /// The session left the Okay status; fired at most once per session
    fn connection_error_occurred(&self, session: &SessionHandle, status: ConnectionStatus);
}

struct TrackedStatement {
    statement: Arc<dyn Statement>,
    /// Set when the statement came from the statement cache
    descriptor: Option<StatementDescriptor>,
}

struct TrackedCursor {
    cursor: Arc<dyn Cursor>,
    statement: Option<u64>,
}

struct SessionState {
    facade: Option<Weak<FacadeInner>>,
    generation: u64,
    statements: HashMap<u64, TrackedStatement>,
    cursors: HashMap<u64, TrackedCursor>,
    next_key: u64,
    dirty: DirtyProps,
    txn_resolved: bool,
}

impl SessionState {
    fn next_key(&mut self) -> u64 {
        self.next_key += 1;
        self.next_key
    }

    fn drain(&mut self) -> (Vec<Arc<dyn Cursor>>, Vec<TrackedStatement>) {
        let cursors = self.cursors.drain().map(|(_, c)| c.cursor).collect();
        let statements = self.statements.drain().map(|(_, s)| s).collect();
        (cursors, statements)
    }
}

/// One physical connection and everything handed out from it during the
/// current checkout
pub struct ConnectionSession {
    id: SessionId,
    me: Weak<ConnectionSession>,
    physical: Arc<dyn Connection>,
    defaults: ConnectionDefaults,
    options: SessionOptions,
    status: StatusCell,
    failure_notified: AtomicBool,
    state: Mutex<SessionState>,
    listener: OnceLock<Arc<dyn ConnectionEventListener>>,
}

impl ConnectionSession {
    /// Wrap a freshly opened connection, capturing its current properties
    /// as the defaults restored after every checkout
    pub async fn new(
        physical: Arc<dyn Connection>,
        options: SessionOptions,
    ) -> Result<SessionHandle> {
        let defaults = ConnectionDefaults::capture(physical.as_ref()).await?;
        let session = Arc::new_cyclic(|me| ConnectionSession {
            id: SessionId::next(),
            me: me.clone(),
            physical,
            defaults,
            options,
            status: StatusCell::new(),
            failure_notified: AtomicBool::new(false),
            state: Mutex::new(SessionState {
                facade: None,
                generation: 0,
                statements: HashMap::new(),
                cursors: HashMap::new(),
                next_key: 0,
                dirty: DirtyProps::default(),
                txn_resolved: true,
            }),
            listener: OnceLock::new(),
        });
        tracing::debug!(session_id = %session.id, "connection session created");
        Ok(SessionHandle(session))
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.get()
    }

    pub fn defaults(&self) -> &ConnectionDefaults {
        &self.defaults
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub(crate) fn physical(&self) -> &Arc<dyn Connection> {
        &self.physical
    }

    /// Install the listener notified on close and on failure
    ///
    /// Only the first listener is kept.
    pub fn set_listener(&self, listener: Arc<dyn ConnectionEventListener>) {
        if self.listener.set(listener).is_err() {
            tracing::warn!(session_id = %self.id, "session listener already installed");
        }
    }

    /// Whether a façade is currently handed out
    pub fn is_active(&self) -> bool {
        self.state
            .lock()
            .facade
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|facade| !facade.is_marked_closed())
    }

    pub fn open_cursor_count(&self) -> usize {
        self.state.lock().cursors.len()
    }

    pub fn open_statement_count(&self) -> usize {
        self.state.lock().statements.len()
    }

    /// Get the façade for the current checkout
    ///
    /// Returns the outstanding façade if there is one; handing out a second
    /// one usually means a caller reused a connection it already closed.
    pub fn acquire_facade(&self) -> Result<PooledConnection> {
        let status = self.status.get();
        if !status.is_okay() {
            return Err(DbError::Connection(format!(
                "session {} is no longer usable ({:?})",
                self.id, status
            )));
        }
        let session = self.handle().ok_or_else(|| DbError::closed("session"))?;

        let mut state = self.state.lock();
        if let Some(existing) = state.facade.as_ref().and_then(Weak::upgrade)
            && !existing.is_marked_closed()
        {
            tracing::warn!(session_id = %self.id, "façade requested while one is still outstanding");
            return Ok(PooledConnection::from_inner(existing));
        }

        state.generation += 1;
        state.txn_resolved = true;
        let inner = Arc::new(FacadeInner::new(session, state.generation));
        state.facade = Some(Arc::downgrade(&inner));
        Ok(PooledConnection::from_inner(inner))
    }

    pub(crate) fn is_generation_live(&self, generation: u64) -> bool {
        self.state.lock().generation == generation
    }

    fn handle(&self) -> Option<SessionHandle> {
        self.me.upgrade().map(SessionHandle)
    }

    pub(crate) fn mark_dirty(&self, property: Property) {
        self.state.lock().dirty.mark(property);
    }

    pub(crate) fn mark_all_dirty(&self) {
        self.state.lock().dirty = DirtyProps::all();
    }

    pub(crate) fn mark_resolved(&self) {
        self.state.lock().txn_resolved = true;
    }

    pub(crate) fn mark_unresolved(&self) {
        self.state.lock().txn_resolved = false;
    }

    pub(crate) fn track_cursor(&self, cursor: Arc<dyn Cursor>, statement: Option<u64>) -> u64 {
        let mut state = self.state.lock();
        let key = state.next_key();
        state.cursors.insert(key, TrackedCursor { cursor, statement });
        key
    }

    pub(crate) fn untrack_cursor(&self, key: u64) {
        self.state.lock().cursors.remove(&key);
    }

    pub(crate) fn track_statement(
        &self,
        statement: Arc<dyn Statement>,
        descriptor: Option<StatementDescriptor>,
    ) -> u64 {
        let mut state = self.state.lock();
        let key = state.next_key();
        state.statements.insert(
            key,
            TrackedStatement {
                statement,
                descriptor,
            },
        );
        key
    }

    /// Prepare a statement, through the statement cache when there is one
    pub(crate) async fn prepare_tracked(
        &self,
        descriptor: StatementDescriptor,
    ) -> Result<(u64, Arc<dyn Statement>)> {
        let (statement, cached) = match &self.options.statement_cache {
            Some(cache) => (
                cache
                    .checkout(self.id, self.physical.as_ref(), &descriptor)
                    .await?,
                true,
            ),
            None => {
                let statement = match descriptor.kind {
                    StatementKind::Prepared => self.physical.prepare(&descriptor.sql).await?,
                    StatementKind::Callable => self.physical.prepare_call(&descriptor.sql).await?,
                };
                (statement, false)
            }
        };
        let key = self.track_statement(statement.clone(), cached.then_some(descriptor));
        Ok((key, statement))
    }

    /// Stop tracking a statement the caller closed, closing its cursors
    pub(crate) async fn release_statement(&self, key: u64) -> Result<()> {
        let (tracked, cursors) = {
            let mut state = self.state.lock();
            let tracked = state.statements.remove(&key);
            let keys: Vec<u64> = state
                .cursors
                .iter()
                .filter(|(_, c)| c.statement == Some(key))
                .map(|(k, _)| *k)
                .collect();
            let cursors: Vec<Arc<dyn Cursor>> = keys
                .iter()
                .filter_map(|k| state.cursors.remove(k))
                .map(|c| c.cursor)
                .collect();
            (tracked, cursors)
        };

        let mut first_error = close_cursors(cursors).await.err();
        if let Some(tracked) = tracked
            && let Err(err) = self.return_statement(tracked).await
        {
            first_error.get_or_insert(err);
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn return_statement(&self, tracked: TrackedStatement) -> Result<()> {
        match (tracked.descriptor, &self.options.statement_cache) {
            (Some(descriptor), Some(cache)) => {
                cache.checkin(self.id, descriptor, tracked.statement).await
            }
            _ if tracked.statement.is_closed() => Ok(()),
            _ => tracked.statement.close().await,
        }
    }

    /// Classify an error seen through the façade
    pub(crate) async fn handle_error(&self, error: &DbError) {
        let status = self
            .options
            .tester
            .status_on_error(self.physical.as_ref(), error)
            .await;
        self.escalate(status);
    }

    /// Actively test the physical connection
    pub(crate) async fn verify(&self) -> ConnectionStatus {
        let status = self.options.tester.active_check(self.physical.as_ref()).await;
        self.escalate(status);
        self.status.get()
    }

    fn escalate(&self, status: ConnectionStatus) {
        if status.is_okay() {
            return;
        }
        let previous = self.status.escalate(status);
        if !previous.is_okay() || self.failure_notified.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::warn!(session_id = %self.id, ?status, "pooled connection failed");
        if let Some(listener) = self.listener.get()
            && let Some(handle) = self.handle()
        {
            listener.connection_error_occurred(&handle, status);
        }
    }

    /// Called once per façade when it is closed or dropped
    pub(crate) async fn facade_closed(&self, generation: u64) {
        if !self.is_generation_live(generation) {
            tracing::trace!(session_id = %self.id, "stale façade closed");
            return;
        }
        match (self.listener.get(), self.handle()) {
            (Some(listener), Some(handle)) => listener.connection_closed(&handle).await,
            _ => {
                if let Err(err) = self.reset().await {
                    tracing::warn!(session_id = %self.id, error = %err, "connection reset failed");
                }
            }
        }
    }

    /// Tear down the current checkout and restore the default state
    ///
    /// Closes every cursor and statement the caller left open, settles the
    /// transaction, restores changed properties and forgets the façade.
    #[tracing::instrument(skip(self), fields(session_id = %self.id))]
    pub async fn reset(&self) -> Result<()> {
        let (cursors, statements, dirty, resolved) = {
            let mut state = self.state.lock();
            state.facade = None;
            state.generation += 1;
            let (cursors, statements) = state.drain();
            let dirty = std::mem::take(&mut state.dirty);
            let resolved = std::mem::replace(&mut state.txn_resolved, true);
            (cursors, statements, dirty, resolved)
        };

        if !cursors.is_empty() || !statements.is_empty() {
            tracing::debug!(
                cursors = cursors.len(),
                statements = statements.len(),
                "closing resources left open by the caller"
            );
        }

        let mut first_error = close_cursors(cursors).await.err();
        for tracked in statements {
            if let Err(err) = self.return_statement(tracked).await {
                first_error.get_or_insert(err);
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        let conn = self.physical.as_ref();
        if !conn.auto_commit().await? {
            if !resolved {
                if self.options.auto_commit_on_close {
                    tracing::debug!("committing unresolved transaction on close");
                    conn.commit().await?;
                } else {
                    tracing::debug!("rolling back unresolved transaction on close");
                    conn.rollback().await?;
                }
            }
            conn.set_auto_commit(true).await?;
        }

        self.restore_defaults(dirty).await
    }

    async fn restore_defaults(&self, dirty: DirtyProps) -> Result<()> {
        let conn = self.physical.as_ref();
        let defaults = &self.defaults;
        if dirty.isolation {
            conn.set_transaction_isolation(defaults.isolation).await?;
        }
        if dirty.catalog {
            conn.set_catalog(defaults.catalog.clone()).await?;
        }
        if dirty.holdability {
            conn.set_holdability(defaults.holdability).await?;
        }
        if dirty.read_only {
            conn.set_read_only(defaults.read_only).await?;
        }
        if dirty.type_map {
            conn.set_type_map(defaults.type_map.clone()).await?;
        }
        Ok(())
    }

    /// Whether the session may be handed to a new caller
    pub(crate) fn ensure_usable(&self) -> Result<()> {
        let status = self.status.get();
        if !status.is_okay() {
            return Err(DbError::Connection(format!("connection status is {:?}", status)));
        }
        if self.physical.is_closed() {
            return Err(DbError::closed("physical connection"));
        }
        Ok(())
    }

    /// Close everything, including the physical connection
    #[tracing::instrument(skip(self), fields(session_id = %self.id))]
    pub async fn destroy(&self, checked_out: bool) -> Result<()> {
        let (cursors, statements) = {
            let mut state = self.state.lock();
            state.facade = None;
            state.generation += 1;
            state.drain()
        };
        if checked_out {
            tracing::debug!("destroying a connection that is still checked out");
        }

        if let Err(err) = close_cursors(cursors).await {
            tracing::debug!(error = %err, "failed to close cursor during destroy");
        }
        for tracked in statements {
            if !tracked.statement.is_closed()
                && let Err(err) = tracked.statement.close().await
            {
                tracing::debug!(error = %err, "failed to close statement during destroy");
            }
        }
        if let Some(cache) = &self.options.statement_cache
            && let Err(err) = cache.close_all(self.id).await
        {
            tracing::debug!(error = %err, "failed to close cached statements");
        }

        self.physical.close().await
    }
}

async fn close_cursors(cursors: Vec<Arc<dyn Cursor>>) -> Result<()> {
    let mut first_error = None;
    for cursor in cursors {
        if cursor.is_closed() {
            continue;
        }
        if let Err(err) = cursor.close().await {
            first_error.get_or_insert(err);
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// Shared handle to a [`ConnectionSession`], the resource type pooled by
/// a `ConnectionPool`
///
/// Equality and hashing follow session identity.
#[derive(Clone)]
pub struct SessionHandle(Arc<ConnectionSession>);

impl Deref for SessionHandle {
    type Target = ConnectionSession;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl PartialEq for SessionHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for SessionHandle {}

impl Hash for SessionHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.0.id)
            .field("status", &self.0.status())
            .finish()
    }
}

#[cfg(test)]
mod tests;
