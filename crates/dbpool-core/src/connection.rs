//! Capabilities of a physical database connection
//!
//! Drivers implement these traits; the pooling layer wraps them in
//! decorators that implement the same traits.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{Holdability, IsolationLevel, Result, Row, TypeMap, Value};

/// A forward-only cursor over the rows of a query
#[async_trait]
pub trait Cursor: Send + Sync {
    /// Fetch the next row, `None` once exhausted
    async fn next_row(&self) -> Result<Option<Row>>;

    /// Drain every remaining row
    async fn fetch_all(&self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// A prepared (or callable) statement bound to one connection
#[async_trait]
pub trait Statement: Send + Sync {
    /// SQL text the statement was prepared from
    fn sql(&self) -> &str;

    /// Execute with parameters, returning the affected row count
    async fn execute(&self, params: &[Value]) -> Result<u64>;

    /// Execute with parameters, returning a cursor over the result
    async fn query(&self, params: &[Value]) -> Result<Arc<dyn Cursor>>;

    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// A database connection
///
/// Property getters and setters are async since drivers may need a round
/// trip to the server to read or apply them.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Get the driver name (e.g., "sqlite", "postgresql", "mysql")
    fn driver_name(&self) -> &str;

    /// Execute a statement that modifies data, returning affected rows
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Execute a query, returning a cursor over its rows
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Arc<dyn Cursor>>;

    /// Prepare a statement for repeated execution
    async fn prepare(&self, sql: &str) -> Result<Arc<dyn Statement>>;

    /// Prepare a stored procedure call
    async fn prepare_call(&self, sql: &str) -> Result<Arc<dyn Statement>>;

    async fn auto_commit(&self) -> Result<bool>;

    async fn set_auto_commit(&self, enabled: bool) -> Result<()>;

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;

    async fn transaction_isolation(&self) -> Result<IsolationLevel>;

    async fn set_transaction_isolation(&self, level: IsolationLevel) -> Result<()>;

    async fn catalog(&self) -> Result<Option<String>>;

    async fn set_catalog(&self, catalog: Option<String>) -> Result<()>;

    async fn holdability(&self) -> Result<Holdability>;

    async fn set_holdability(&self, holdability: Holdability) -> Result<()>;

    async fn is_read_only(&self) -> Result<bool>;

    async fn set_read_only(&self, read_only: bool) -> Result<()>;

    async fn type_map(&self) -> Result<TypeMap>;

    async fn set_type_map(&self, map: TypeMap) -> Result<()>;

    /// Close the connection
    async fn close(&self) -> Result<()>;

    /// Check if the connection is closed
    fn is_closed(&self) -> bool;
}
