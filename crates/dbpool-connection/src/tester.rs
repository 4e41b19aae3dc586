//! Connection health classification

use std::time::Duration;

use async_trait::async_trait;
use dbpool_core::{Connection, ConnectionStatus, DbError};

/// Classifies a connection as healthy, broken, or a sign that the whole
/// database is unreachable
#[async_trait]
pub trait ConnectionTester: Send + Sync {
    /// Actively test the connection
    async fn active_check(&self, conn: &dyn Connection) -> ConnectionStatus;

    /// Judge a connection after `error` surfaced through it
    async fn status_on_error(&self, conn: &dyn Connection, error: &DbError) -> ConnectionStatus;
}

/// Tester running a lightweight query under a timeout
#[derive(Debug, Clone)]
pub struct DefaultConnectionTester {
    test_query: Option<String>,
    timeout: Duration,
}

impl DefaultConnectionTester {
    pub fn new() -> Self {
        Self {
            test_query: None,
            timeout: Duration::from_secs(5),
        }
    }

    /// Use `query` instead of the driver's ping query
    pub fn with_test_query(mut self, query: impl Into<String>) -> Self {
        self.test_query = Some(query.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn query_for<'a>(&'a self, conn: &dyn Connection) -> &'a str {
        match &self.test_query {
            Some(query) => query.as_str(),
            None => ping_query(conn.driver_name()),
        }
    }
}

impl Default for DefaultConnectionTester {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionTester for DefaultConnectionTester {
    async fn active_check(&self, conn: &dyn Connection) -> ConnectionStatus {
        if conn.is_closed() {
            return ConnectionStatus::ConnectionInvalid;
        }

        let query = self.query_for(conn);
        match tokio::time::timeout(self.timeout, conn.query(query, &[])).await {
            Ok(Ok(cursor)) => {
                let _ = cursor.close().await;
                ConnectionStatus::Okay
            }
            Ok(Err(DbError::Unavailable(msg))) => {
                tracing::debug!(error = %msg, "test query reports the database unavailable");
                ConnectionStatus::DatabaseInvalid
            }
            Ok(Err(err)) => {
                tracing::debug!(error = %err, query, "test query failed");
                ConnectionStatus::ConnectionInvalid
            }
            Err(_) => {
                tracing::debug!(timeout = ?self.timeout, query, "test query timed out");
                ConnectionStatus::ConnectionInvalid
            }
        }
    }

    async fn status_on_error(&self, conn: &dyn Connection, error: &DbError) -> ConnectionStatus {
        match error {
            DbError::Unavailable(_) => ConnectionStatus::DatabaseInvalid,
            DbError::Connection(_) | DbError::Closed(_) | DbError::Timeout(_) => {
                ConnectionStatus::ConnectionInvalid
            }
            DbError::Pool(_) | DbError::NotSupported(_) | DbError::Configuration(_) => {
                ConnectionStatus::Okay
            }
            _ => self.active_check(conn).await,
        }
    }
}

/// Get the cheapest query that round-trips to the server for a driver.
pub(crate) fn ping_query(driver_name: &str) -> &'static str {
    match driver_name {
        "oracle" => "SELECT 1 FROM DUAL",
        "db2" => "SELECT 1 FROM SYSIBM.SYSDUMMY1",
        "mysql" | "postgresql" | "postgres" | "sqlite" | "mssql" => "SELECT 1",
        _ => "SELECT 1", // Generic fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockConnection, MockFailure};

    #[tokio::test]
    async fn test_active_check_healthy() {
        let conn = MockConnection::new(0);
        let tester = DefaultConnectionTester::new();
        assert_eq!(tester.active_check(&conn).await, ConnectionStatus::Okay);
        assert_eq!(conn.log.open_cursors(), 0);
    }

    #[tokio::test]
    async fn test_active_check_classifies_failures() {
        let conn = MockConnection::new(0);
        let tester = DefaultConnectionTester::new().with_test_query("SELECT 42");

        conn.fail_with(Some(MockFailure::Connection));
        assert_eq!(tester.active_check(&conn).await, ConnectionStatus::ConnectionInvalid);

        conn.fail_with(Some(MockFailure::Unavailable));
        assert_eq!(tester.active_check(&conn).await, ConnectionStatus::DatabaseInvalid);

        conn.fail_with(None);
        conn.close().await.unwrap();
        assert_eq!(tester.active_check(&conn).await, ConnectionStatus::ConnectionInvalid);
    }

    #[tokio::test]
    async fn test_status_on_error() {
        let conn = MockConnection::new(0);
        let tester = DefaultConnectionTester::new();

        let status = tester
            .status_on_error(&conn, &DbError::Unavailable("down".into()))
            .await;
        assert_eq!(status, ConnectionStatus::DatabaseInvalid);

        let status = tester
            .status_on_error(&conn, &DbError::Connection("reset".into()))
            .await;
        assert_eq!(status, ConnectionStatus::ConnectionInvalid);

        // A plain query error on a healthy connection is the caller's problem
        let status = tester
            .status_on_error(&conn, &DbError::Query("syntax".into()))
            .await;
        assert_eq!(status, ConnectionStatus::Okay);

        conn.fail_with(Some(MockFailure::Connection));
        let status = tester
            .status_on_error(&conn, &DbError::Query("syntax".into()))
            .await;
        assert_eq!(status, ConnectionStatus::ConnectionInvalid);
    }

    #[test]
    fn test_ping_query() {
        assert_eq!(ping_query("oracle"), "SELECT 1 FROM DUAL");
        assert_eq!(ping_query("postgres"), "SELECT 1");
        assert_eq!(ping_query("unknown"), "SELECT 1");
    }
}
