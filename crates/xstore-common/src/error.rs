//! Error types for XStore
//!
//! This module defines the error taxonomy shared by the broker pool, the
//! transaction manager and the cache manager.

use crate::types::{BrokerId, TxnId};
use std::time::Duration;
use thiserror::Error;

/// Common result type for XStore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for XStore
#[derive(Debug, Error)]
pub enum Error {
    // Session errors
    #[error("authentication failed: {0}")]
    Authentication(String),

    // Broker pool errors
    #[error("no broker available after waiting {waited:?}")]
    PoolExhausted { waited: Duration },

    #[error("database is shutting down")]
    ShutdownInProgress,

    #[error("broker protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("broker {broker} is not checked out by the calling thread")]
    NotOwner { broker: BrokerId },

    // Transaction errors
    #[error("too many active transactions: limit is {limit}")]
    TooManyActiveTransactions { limit: usize },

    #[error("transaction {txn_id} is {state}, operation requires ACTIVE")]
    InvalidTransactionState { txn_id: TxnId, state: &'static str },

    #[error("database is read-only")]
    ReadOnly,

    // Log errors
    #[error("log I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("log corruption: {0}")]
    LogCorruption(String),

    #[error("durability can no longer be guaranteed: {0}")]
    DurabilityLost(String),

    // Cache errors
    #[error("cache registrant already registered: {0}")]
    DuplicateRegistrant(String),

    #[error("unknown cache registrant: {0}")]
    UnknownRegistrant(String),

    #[error("cache budget exceeded: requested {requested} bytes, available {available} bytes")]
    CacheBudgetExceeded { requested: u64, available: u64 },

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new protocol violation error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if the caller may retry the operation later
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PoolExhausted { .. }
                | Self::ShutdownInProgress
                | Self::TooManyActiveTransactions { .. }
        )
    }

    /// Check if the error means the database can no longer operate safely
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::DurabilityLost(_) | Self::LogCorruption(_))
    }

    /// Check if this is a misuse of the acquire/release or transaction protocol
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::ProtocolViolation(_) | Self::NotOwner { .. } | Self::InvalidTransactionState { .. }
        )
    }
}
