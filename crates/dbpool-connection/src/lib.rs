//! Pooled database connections
//!
//! Builds a connection pool on top of the generic `dbpool-resource`
//! engine. Every physical connection is wrapped in a [`ConnectionSession`]
//! that hands callers a fresh [`PooledConnection`] per checkout, tracks the
//! statements and cursors produced through it, and restores the connection
//! to its default state when it is returned.
//!
//! # Example
//!
//! ```ignore
//! use dbpool_connection::{ConnectionPool, ConnectionPoolConfig, Credentials};
//! use dbpool_resource::ResourcePoolConfig;
//!
//! let config = ConnectionPoolConfig::new(ResourcePoolConfig::new(3, 15))
//!     .with_test_connection_on_checkout(true);
//! let pool = ConnectionPool::new(factory, Credentials::new("app", "secret"), config)?;
//!
//! let conn = pool.get_connection().await?;
//! let cursor = conn.query("SELECT id FROM users", &[]).await?;
//! conn.close().await?; // cursor is closed, connection goes back to the pool
//! ```

mod credentials;
mod facade;
mod manager;
mod pool;
mod registry;
mod session;
mod statement_cache;
mod tester;

#[cfg(test)]
mod mock;

pub use credentials::Credentials;
pub use facade::{PooledConnection, PooledCursor, PooledStatement, RawOutcome};
pub use manager::PoolManager;
pub use pool::{ConnectionFactory, ConnectionManager, ConnectionPool, ConnectionPoolConfig};
pub use registry::PoolRegistry;
pub use session::{
    ConnectionDefaults, ConnectionEventListener, ConnectionSession, SessionHandle, SessionId,
    SessionOptions,
};
pub use statement_cache::{BoundedStatementCache, StatementCache};
pub use tester::{ConnectionTester, DefaultConnectionTester};
