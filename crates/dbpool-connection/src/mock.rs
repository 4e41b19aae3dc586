//! In-memory connection used by the tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use async_trait::async_trait;
use dbpool_core::{
    Connection, Cursor, DbError, Holdability, IsolationLevel, Result, Row, Statement, TypeMap,
    Value,
};
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use crate::credentials::Credentials;
use crate::pool::ConnectionFactory;

static INIT: Once = Once::new();

pub(crate) fn init_tracing() {
    INIT.call_once(|| {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env()
                    .add_directive("dbpool_connection=debug".parse().unwrap()),
            )
            .with_test_writer()
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

/// Which error a failing mock connection reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MockFailure {
    Connection,
    Unavailable,
}

impl MockFailure {
    fn error(&self) -> DbError {
        match self {
            MockFailure::Connection => DbError::Connection("broken pipe".into()),
            MockFailure::Unavailable => DbError::Unavailable("no route to host".into()),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct MockProps {
    pub auto_commit: bool,
    pub isolation: IsolationLevel,
    pub catalog: Option<String>,
    pub holdability: Holdability,
    pub read_only: bool,
    pub type_map: TypeMap,
}

impl Default for MockProps {
    fn default() -> Self {
        Self {
            auto_commit: true,
            isolation: IsolationLevel::ReadCommitted,
            catalog: Some("main".into()),
            holdability: Holdability::HoldCursorsOverCommit,
            read_only: false,
            type_map: TypeMap::new(),
        }
    }
}

pub(crate) struct MockCursor {
    rows: Mutex<VecDeque<Row>>,
    closed: AtomicBool,
    pub fail_close: AtomicBool,
}

impl MockCursor {
    fn new() -> Self {
        let row = Row::new(vec!["value".into()], vec![Value::Int64(1)]);
        Self {
            rows: Mutex::new(VecDeque::from(vec![row])),
            closed: AtomicBool::new(false),
            fail_close: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Cursor for MockCursor {
    async fn next_row(&self) -> Result<Option<Row>> {
        if self.is_closed() {
            return Err(DbError::closed("cursor"));
        }
        Ok(self.rows.lock().pop_front())
    }

    async fn close(&self) -> Result<()> {
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(DbError::Connection("broken pipe".into()));
        }
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub(crate) struct MockStatement {
    sql: String,
    closed: AtomicBool,
    log: Arc<MockLog>,
}

#[async_trait]
impl Statement for MockStatement {
    fn sql(&self) -> &str {
        &self.sql
    }

    async fn execute(&self, _params: &[Value]) -> Result<u64> {
        if let Some(failure) = *self.log.failure.lock() {
            return Err(failure.error());
        }
        Ok(1)
    }

    async fn query(&self, _params: &[Value]) -> Result<Arc<dyn Cursor>> {
        if let Some(failure) = *self.log.failure.lock() {
            return Err(failure.error());
        }
        Ok(self.log.new_cursor())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Everything a mock connection has handed out, shared with its statements
#[derive(Default)]
pub(crate) struct MockLog {
    pub cursors: Mutex<Vec<Arc<MockCursor>>>,
    pub statements: Mutex<Vec<Arc<MockStatement>>>,
    pub failure: Mutex<Option<MockFailure>>,
}

impl MockLog {
    fn new_cursor(&self) -> Arc<MockCursor> {
        let cursor = Arc::new(MockCursor::new());
        self.cursors.lock().push(cursor.clone());
        cursor
    }

    pub(crate) fn open_cursors(&self) -> usize {
        self.cursors.lock().iter().filter(|c| !c.is_closed()).count()
    }

    pub(crate) fn open_statements(&self) -> usize {
        self.statements.lock().iter().filter(|s| !s.is_closed()).count()
    }
}

/// Mock connection keeping its properties in memory
pub(crate) struct MockConnection {
    pub id: usize,
    pub props: Mutex<MockProps>,
    pub log: Arc<MockLog>,
    pub commits: AtomicUsize,
    pub rollbacks: AtomicUsize,
    pub prepares: AtomicUsize,
    closed: AtomicBool,
}

impl MockConnection {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            props: Mutex::new(MockProps::default()),
            log: Arc::new(MockLog::default()),
            commits: AtomicUsize::new(0),
            rollbacks: AtomicUsize::new(0),
            prepares: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn fail_with(&self, failure: Option<MockFailure>) {
        *self.log.failure.lock() = failure;
    }

    fn check(&self) -> Result<()> {
        if self.is_closed() {
            return Err(DbError::closed("connection"));
        }
        if let Some(failure) = *self.log.failure.lock() {
            return Err(failure.error());
        }
        Ok(())
    }

    fn new_statement(&self, sql: &str) -> Arc<MockStatement> {
        self.prepares.fetch_add(1, Ordering::SeqCst);
        let statement = Arc::new(MockStatement {
            sql: sql.to_string(),
            closed: AtomicBool::new(false),
            log: self.log.clone(),
        });
        self.log.statements.lock().push(statement.clone());
        statement
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn driver_name(&self) -> &str {
        "mock"
    }

    async fn execute(&self, _sql: &str, _params: &[Value]) -> Result<u64> {
        self.check()?;
        Ok(1)
    }

    async fn query(&self, _sql: &str, _params: &[Value]) -> Result<Arc<dyn Cursor>> {
        self.check()?;
        Ok(self.log.new_cursor())
    }

    async fn prepare(&self, sql: &str) -> Result<Arc<dyn Statement>> {
        self.check()?;
        Ok(self.new_statement(sql))
    }

    async fn prepare_call(&self, sql: &str) -> Result<Arc<dyn Statement>> {
        self.check()?;
        Ok(self.new_statement(sql))
    }

    async fn auto_commit(&self) -> Result<bool> {
        self.check()?;
        Ok(self.props.lock().auto_commit)
    }

    async fn set_auto_commit(&self, enabled: bool) -> Result<()> {
        self.check()?;
        self.props.lock().auto_commit = enabled;
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.check()?;
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.check()?;
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn transaction_isolation(&self) -> Result<IsolationLevel> {
        self.check()?;
        Ok(self.props.lock().isolation)
    }

    async fn set_transaction_isolation(&self, level: IsolationLevel) -> Result<()> {
        self.check()?;
        self.props.lock().isolation = level;
        Ok(())
    }

    async fn catalog(&self) -> Result<Option<String>> {
        self.check()?;
        Ok(self.props.lock().catalog.clone())
    }

    async fn set_catalog(&self, catalog: Option<String>) -> Result<()> {
        self.check()?;
        self.props.lock().catalog = catalog;
        Ok(())
    }

    async fn holdability(&self) -> Result<Holdability> {
        self.check()?;
        Ok(self.props.lock().holdability)
    }

    async fn set_holdability(&self, holdability: Holdability) -> Result<()> {
        self.check()?;
        self.props.lock().holdability = holdability;
        Ok(())
    }

    async fn is_read_only(&self) -> Result<bool> {
        self.check()?;
        Ok(self.props.lock().read_only)
    }

    async fn set_read_only(&self, read_only: bool) -> Result<()> {
        self.check()?;
        self.props.lock().read_only = read_only;
        Ok(())
    }

    async fn type_map(&self) -> Result<TypeMap> {
        self.check()?;
        Ok(self.props.lock().type_map.clone())
    }

    async fn set_type_map(&self, map: TypeMap) -> Result<()> {
        self.check()?;
        self.props.lock().type_map = map;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Factory recording every connection it opens
#[derive(Default)]
pub(crate) struct MockFactory {
    pub connections: Mutex<Vec<Arc<MockConnection>>>,
    pub users: Mutex<Vec<String>>,
    pub refuse: AtomicBool,
}

impl MockFactory {
    pub(crate) fn connection(&self, index: usize) -> Arc<MockConnection> {
        self.connections.lock()[index].clone()
    }

    pub(crate) fn opened(&self) -> usize {
        self.connections.lock().len()
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn Connection>> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(DbError::Connection("connection refused".into()));
        }
        self.users.lock().push(credentials.user().to_string());
        let mut connections = self.connections.lock();
        let connection = Arc::new(MockConnection::new(connections.len()));
        connections.push(connection.clone());
        Ok(connection)
    }
}
