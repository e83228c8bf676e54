//! Core identifiers
//!
//! Newtypes for log sequence numbers, transaction ids, broker ids and the
//! database instance id. Keeping them distinct stops an LSN from being passed
//! where a transaction id is expected.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Log Sequence Number of a write-ahead log record
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into,
)]
#[display("{_0}")]
pub struct Lsn(u64);

impl Lsn {
    /// The first LSN ever assigned by a fresh log
    pub const FIRST: Self = Self(1);

    /// Sentinel meaning "nothing logged yet"
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The LSN immediately after this one
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Transaction identifier, monotonically increasing per database
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0}")]
pub struct TxnId(u64);

impl TxnId {
    /// Reserved for records not owned by any transaction
    pub const SYSTEM: Self = Self(0);

    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Index of a broker within its pool
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Into)]
#[display("broker-{_0}")]
pub struct BrokerId(usize);

impl BrokerId {
    #[must_use]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Unique identifier of a database instance
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, From, Into)]
pub struct DatabaseId(Uuid);

impl DatabaseId {
    /// Generate a new random database ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for DatabaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DatabaseId({})", self.0)
    }
}

impl fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_ordering() {
        assert!(Lsn::FIRST > Lsn::ZERO);
        assert_eq!(Lsn::new(41).next(), Lsn::new(42));
        assert_eq!(u64::from(Lsn::new(7)), 7);
        assert_eq!(Lsn::default(), Lsn::ZERO);
    }

    #[test]
    fn test_broker_id_display() {
        assert_eq!(BrokerId::new(3).to_string(), "broker-3");
    }

    #[test]
    fn test_database_ids_are_unique() {
        assert_ne!(DatabaseId::new(), DatabaseId::new());
    }
}
