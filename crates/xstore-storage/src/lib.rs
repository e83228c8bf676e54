//! XStore Storage Core
//!
//! This crate implements the transactional and memory-management core that
//! every storage subsystem runs on:
//! - Write-ahead logging with gapless LSNs and CRC32C-checked records
//! - Transaction manager (begin/append/commit/abort, checkpoint, recovery)
//! - Cache manager arbitrating a shared memory budget among registrants
//! - A managed LRU cache that registers itself with the cache manager

pub mod cache;
pub mod lru;
pub mod txn;
pub mod wal;

// Re-exports
pub use cache::{CacheHandle, CacheManager, CacheManagerStats, CacheRegistrant, CacheShare};
pub use lru::{CacheStats, ManagedCache};
pub use txn::{
    RecoveryReport, Transaction, TransactionInfo, TransactionManager, TransactionalStore,
    TxnState, TxnStats,
};
pub use wal::{LogRecord, MAX_PAYLOAD_SIZE, RecordKind, WriteAheadLog};
