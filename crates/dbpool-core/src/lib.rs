//! dbpool core - shared vocabulary for the pooling crates
//!
//! This crate defines the pieces both the generic resource pool and the
//! pooled-connection layer agree on:
//!
//! - `DbError` / `PoolError` - the error taxonomy
//! - `Connection`, `Statement`, `Cursor` - capabilities of a physical connection
//! - `ConnectionStatus` / `StatusCell` - monotonically worsening health status
//! - Common types like `Value`, `Row`, `IsolationLevel`, etc.

mod connection;
mod error;
mod status;
mod types;

pub use connection::*;
pub use error::*;
pub use status::*;
pub use types::*;
