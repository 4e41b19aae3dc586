//! Connection health status
//!
//! A status only ever worsens: once a connection is judged invalid it can
//! not become healthy again, and once the whole database is judged
//! unreachable nothing downgrades that verdict.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Health verdict for a pooled connection, ordered from best to worst
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionStatus {
    /// Connection is usable
    #[default]
    Okay = 0,
    /// This connection is broken, the database may be fine
    ConnectionInvalid = 1,
    /// The whole database appears unreachable
    DatabaseInvalid = 2,
}

impl ConnectionStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionStatus::Okay,
            1 => ConnectionStatus::ConnectionInvalid,
            _ => ConnectionStatus::DatabaseInvalid,
        }
    }

    pub fn is_okay(&self) -> bool {
        matches!(self, ConnectionStatus::Okay)
    }
}

/// Atomic holder of a `ConnectionStatus` that only moves forward
#[derive(Debug, Default)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Raise the status to `to` unless it is already at least that bad.
    ///
    /// Returns the status held before the call. Exactly one caller ever
    /// observes `Okay` here together with a worse `to`, which makes the
    /// return value usable as a one-shot "first failure" signal.
    pub fn escalate(&self, to: ConnectionStatus) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.0.fetch_max(to as u8, Ordering::SeqCst))
    }
}
