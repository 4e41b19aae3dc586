use super::*;
use crate::facade::RawOutcome;
use crate::mock::{MockConnection, MockFailure};
use crate::statement_cache::BoundedStatementCache;
use crate::tester::DefaultConnectionTester;
use dbpool_core::Value;
use pretty_assertions::assert_eq;
use std::time::Duration;

fn options() -> SessionOptions {
    SessionOptions::new(Arc::new(DefaultConnectionTester::new()))
}

async fn session_with(options: SessionOptions) -> (Arc<MockConnection>, SessionHandle) {
    let conn = Arc::new(MockConnection::new(0));
    let session = ConnectionSession::new(conn.clone(), options).await.unwrap();
    (conn, session)
}

#[derive(Default)]
struct RecordingListener {
    closed: Mutex<Vec<SessionId>>,
    failures: Mutex<Vec<(SessionId, ConnectionStatus)>>,
}

#[async_trait]
impl ConnectionEventListener for RecordingListener {
    async fn connection_closed(&self, session: &SessionHandle) {
        self.closed.lock().push(session.id());
    }

    fn connection_error_occurred(&self, session: &SessionHandle, status: ConnectionStatus) {
        self.failures.lock().push((session.id(), status));
    }
}

// ============================================================================
// Construction Tests
// ============================================================================

#[tokio::test]
async fn test_defaults_are_captured() {
    let conn = Arc::new(MockConnection::new(0));
    conn.props.lock().isolation = IsolationLevel::RepeatableRead;
    let session = ConnectionSession::new(conn.clone(), options()).await.unwrap();

    let defaults = session.defaults();
    assert_eq!(defaults.isolation, IsolationLevel::RepeatableRead);
    assert_eq!(defaults.catalog.as_deref(), Some("main"));
    assert!(!defaults.read_only);
    assert_eq!(session.status(), ConnectionStatus::Okay);
    assert!(!session.is_active());
}

#[tokio::test]
async fn test_construction_fails_on_dead_connection() {
    let conn = Arc::new(MockConnection::new(0));
    conn.fail_with(Some(MockFailure::Connection));
    let result = ConnectionSession::new(conn, options()).await;
    assert!(matches!(result, Err(DbError::Connection(_))));
}

#[tokio::test]
async fn test_session_handles_compare_by_identity() {
    let (_, a) = session_with(options()).await;
    let (_, b) = session_with(options()).await;
    assert_eq!(a.clone(), a);
    assert_ne!(a, b);
    assert_ne!(a.id(), b.id());
}

// ============================================================================
// Façade Tests
// ============================================================================

#[tokio::test]
async fn test_single_outstanding_facade() {
    let (_, session) = session_with(options()).await;
    let first = session.acquire_facade().unwrap();
    let second = session.acquire_facade().unwrap();
    assert!(session.is_active());

    first.close().await.unwrap();
    assert!(second.is_closed());
    assert!(!session.is_active());

    let third = session.acquire_facade().unwrap();
    assert!(!third.is_closed());
    assert!(first.is_closed());
}

#[tokio::test]
async fn test_close_resets_without_listener() {
    let (conn, session) = session_with(options()).await;
    let facade = session.acquire_facade().unwrap();

    facade.set_auto_commit(false).await.unwrap();
    let cursor = facade.query("SELECT * FROM users", &[]).await.unwrap();
    let stmt = facade.prepare("UPDATE users SET name = ?").await.unwrap();
    stmt.execute(&[Value::String("x".into())]).await.unwrap();
    assert_eq!(session.open_cursor_count(), 1);
    assert_eq!(session.open_statement_count(), 1);

    facade.close().await.unwrap();

    assert!(cursor.is_closed());
    assert!(stmt.is_closed());
    assert_eq!(conn.log.open_cursors(), 0);
    assert_eq!(conn.log.open_statements(), 0);
    assert_eq!(session.open_cursor_count(), 0);
    assert_eq!(conn.rollbacks.load(Ordering::SeqCst), 1);
    assert!(conn.props.lock().auto_commit);
}

#[tokio::test]
async fn test_close_notifies_listener() {
    let (conn, session) = session_with(options()).await;
    let listener = Arc::new(RecordingListener::default());
    session.set_listener(listener.clone());

    let facade = session.acquire_facade().unwrap();
    let cursor = facade.query("SELECT 1", &[]).await.unwrap();
    facade.close().await.unwrap();
    facade.close().await.unwrap();

    assert_eq!(*listener.closed.lock(), vec![session.id()]);
    // The listener owns teardown, nothing was reset yet
    assert_eq!(conn.log.open_cursors(), 1);

    session.reset().await.unwrap();
    assert!(cursor.is_closed());
}

#[tokio::test]
async fn test_dropped_facade_is_returned() {
    let (conn, session) = session_with(options()).await;
    {
        let facade = session.acquire_facade().unwrap();
        facade.query("SELECT 1", &[]).await.unwrap();
    }

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(conn.log.open_cursors(), 0);
    assert!(!session.is_active());
}

// ============================================================================
// Teardown Tests
// ============================================================================

#[tokio::test]
async fn test_resolved_transaction_is_not_rolled_back() {
    let (conn, session) = session_with(options()).await;
    let facade = session.acquire_facade().unwrap();

    facade.set_auto_commit(false).await.unwrap();
    facade.execute("INSERT INTO t VALUES (1)", &[]).await.unwrap();
    facade.commit().await.unwrap();
    facade.close().await.unwrap();

    assert_eq!(conn.commits.load(Ordering::SeqCst), 1);
    assert_eq!(conn.rollbacks.load(Ordering::SeqCst), 0);
    assert!(conn.props.lock().auto_commit);
}

#[tokio::test]
async fn test_auto_commit_on_close() {
    let (conn, session) = session_with(options().with_auto_commit_on_close(true)).await;
    let facade = session.acquire_facade().unwrap();

    facade.set_auto_commit(false).await.unwrap();
    facade.execute("INSERT INTO t VALUES (1)", &[]).await.unwrap();
    facade.close().await.unwrap();

    assert_eq!(conn.commits.load(Ordering::SeqCst), 1);
    assert_eq!(conn.rollbacks.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_auto_commit_connection_is_left_alone() {
    let (conn, session) = session_with(options()).await;
    let facade = session.acquire_facade().unwrap();
    facade.execute("INSERT INTO t VALUES (1)", &[]).await.unwrap();
    facade.close().await.unwrap();

    assert_eq!(conn.commits.load(Ordering::SeqCst), 0);
    assert_eq!(conn.rollbacks.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_changed_properties_are_restored() {
    let (conn, session) = session_with(options()).await;
    let facade = session.acquire_facade().unwrap();

    facade
        .set_transaction_isolation(IsolationLevel::Serializable)
        .await
        .unwrap();
    facade.set_catalog(Some("reporting".into())).await.unwrap();
    facade.set_read_only(true).await.unwrap();
    facade
        .set_holdability(Holdability::CloseCursorsAtCommit)
        .await
        .unwrap();
    let mut map = TypeMap::new();
    map.insert("point".into(), "geo::Point".into());
    facade.set_type_map(map).await.unwrap();
    assert_eq!(conn.props.lock().catalog.as_deref(), Some("reporting"));

    facade.close().await.unwrap();

    let props = conn.props.lock().clone();
    assert_eq!(props.isolation, IsolationLevel::ReadCommitted);
    assert_eq!(props.catalog.as_deref(), Some("main"));
    assert!(!props.read_only);
    assert_eq!(props.holdability, Holdability::HoldCursorsOverCommit);
    assert!(props.type_map.is_empty());
}

#[tokio::test]
async fn test_raw_operation_is_tracked() {
    let (conn, session) = session_with(options()).await;
    let facade = session.acquire_facade().unwrap();

    let outcome = facade
        .raw_operation(|raw| async move {
            raw.set_catalog(Some("scratch".into())).await?;
            Ok::<_, DbError>(RawOutcome::Cursor(raw.query("SELECT 1", &[]).await?))
        })
        .await
        .unwrap();
    let RawOutcome::Cursor(cursor) = outcome else {
        panic!("expected a cursor");
    };
    assert_eq!(session.open_cursor_count(), 1);

    facade.close().await.unwrap();
    assert!(cursor.is_closed());
    assert_eq!(conn.log.open_cursors(), 0);
    assert_eq!(conn.props.lock().catalog.as_deref(), Some("main"));
}

#[tokio::test]
async fn test_statement_cache_receives_statements() {
    let cache = Arc::new(BoundedStatementCache::new(4));
    let (conn, session) = session_with(options().with_statement_cache(cache.clone())).await;

    let facade = session.acquire_facade().unwrap();
    facade.prepare("SELECT * FROM t WHERE id = ?").await.unwrap();
    facade.close().await.unwrap();

    assert_eq!(cache.idle_count(session.id()), 1);
    assert_eq!(conn.log.open_statements(), 1);

    let facade = session.acquire_facade().unwrap();
    facade.prepare("SELECT * FROM t WHERE id = ?").await.unwrap();
    assert_eq!(conn.prepares.load(Ordering::SeqCst), 1);
    facade.close().await.unwrap();

    session.destroy(false).await.unwrap();
    assert_eq!(cache.idle_count(session.id()), 0);
    assert_eq!(conn.log.open_statements(), 0);
    assert!(conn.is_closed());
}

// ============================================================================
// Failure Classification Tests
// ============================================================================

#[tokio::test]
async fn test_connection_failure_notifies_once() {
    let (conn, session) = session_with(options()).await;
    let listener = Arc::new(RecordingListener::default());
    session.set_listener(listener.clone());
    let facade = session.acquire_facade().unwrap();

    conn.fail_with(Some(MockFailure::Connection));
    assert!(facade.execute("SELECT 1", &[]).await.is_err());
    assert!(facade.query("SELECT 1", &[]).await.is_err());

    assert_eq!(session.status(), ConnectionStatus::ConnectionInvalid);
    assert_eq!(
        *listener.failures.lock(),
        vec![(session.id(), ConnectionStatus::ConnectionInvalid)]
    );
    assert!(session.ensure_usable().is_err());

    facade.close().await.unwrap();
    assert!(session.acquire_facade().is_err());
}

#[tokio::test]
async fn test_status_never_regresses() {
    let (conn, session) = session_with(options()).await;
    let facade = session.acquire_facade().unwrap();

    conn.fail_with(Some(MockFailure::Unavailable));
    assert!(facade.execute("SELECT 1", &[]).await.is_err());
    assert_eq!(session.status(), ConnectionStatus::DatabaseInvalid);

    conn.fail_with(Some(MockFailure::Connection));
    assert!(facade.execute("SELECT 1", &[]).await.is_err());
    conn.fail_with(None);
    assert_eq!(session.verify().await, ConnectionStatus::DatabaseInvalid);
}

#[tokio::test]
async fn test_invalid_connection_rejects_further_calls() {
    let (conn, session) = session_with(options()).await;
    let facade = session.acquire_facade().unwrap();
    let stmt = facade.prepare("SELECT * FROM t WHERE id = ?").await.unwrap();
    let cursor = facade.query("SELECT 1", &[]).await.unwrap();

    conn.fail_with(Some(MockFailure::Connection));
    assert!(facade.execute("SELECT 1", &[]).await.is_err());
    assert_eq!(session.status(), ConnectionStatus::ConnectionInvalid);

    // Even once the connection answers again, nothing reaches it
    conn.fail_with(None);
    assert!(matches!(
        facade.execute("SELECT 1", &[]).await,
        Err(DbError::Connection(_))
    ));
    assert!(matches!(stmt.execute(&[]).await, Err(DbError::Connection(_))));
    assert!(matches!(cursor.next_row().await, Err(DbError::Connection(_))));
    assert_eq!(conn.log.open_cursors(), 1);

    facade.close().await.unwrap();
    assert!(facade.is_closed());
}

#[tokio::test]
async fn test_cursor_close_failure_is_classified() {
    let (conn, session) = session_with(options()).await;
    let listener = Arc::new(RecordingListener::default());
    session.set_listener(listener.clone());
    let facade = session.acquire_facade().unwrap();

    let cursor = facade.query("SELECT 1", &[]).await.unwrap();
    conn.log.cursors.lock()[0]
        .fail_close
        .store(true, Ordering::SeqCst);

    assert!(matches!(cursor.close().await, Err(DbError::Connection(_))));
    assert_eq!(session.status(), ConnectionStatus::ConnectionInvalid);
    assert_eq!(
        *listener.failures.lock(),
        vec![(session.id(), ConnectionStatus::ConnectionInvalid)]
    );
}

#[tokio::test]
async fn test_misuse_after_close_is_not_a_failure() {
    let (_, session) = session_with(options()).await;
    let facade = session.acquire_facade().unwrap();
    facade.close().await.unwrap();

    let err = facade.execute("SELECT 1", &[]).await.unwrap_err();
    assert!(matches!(err, DbError::Closed(_)));
    assert_eq!(session.status(), ConnectionStatus::Okay);
    assert_eq!(session.verify().await, ConnectionStatus::Okay);
    assert!(session.ensure_usable().is_ok());
}
