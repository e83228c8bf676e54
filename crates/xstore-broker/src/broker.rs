//! Brokers
//!
//! A broker is the handle through which one caller performs storage
//! operations. It is bound to an identity and an owning thread for the
//! duration of a checkout; every operation checks that it runs on the
//! owning thread.

use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, ThreadId};
use tracing::{debug, warn};
use xstore_auth::Identity;
use xstore_common::{BrokerId, DatabaseId, Error, Lsn, Result};
use xstore_storage::{CacheManager, Transaction, TransactionManager, TransactionalStore, TxnState};

/// Thread a broker is checked out to
#[derive(Debug, Clone)]
pub(crate) struct Owner {
    pub(crate) id: ThreadId,
    pub(crate) name: Option<String>,
}

impl Owner {
    pub(crate) fn current() -> Self {
        let thread = thread::current();
        Self {
            id: thread.id(),
            name: thread.name().map(str::to_string),
        }
    }
}

/// Storage-access handle
pub struct Broker {
    id: BrokerId,
    database_id: DatabaseId,
    identity: Mutex<Option<Arc<Identity>>>,
    owner: Mutex<Option<Owner>>,
    /// Checkout depth, changed only under the pool lock
    depth: AtomicUsize,
    txns: Arc<TransactionManager>,
    caches: Arc<CacheManager>,
    read_only: bool,
}

impl Broker {
    pub(crate) fn new(
        id: BrokerId,
        database_id: DatabaseId,
        txns: Arc<TransactionManager>,
        caches: Arc<CacheManager>,
        read_only: bool,
    ) -> Self {
        Self {
            id,
            database_id,
            identity: Mutex::new(None),
            owner: Mutex::new(None),
            depth: AtomicUsize::new(0),
            txns,
            caches,
            read_only,
        }
    }

    pub const fn id(&self) -> BrokerId {
        self.id
    }

    /// Database this broker belongs to
    pub const fn database_id(&self) -> DatabaseId {
        self.database_id
    }

    /// Identity the broker acts for, `None` while in the free set
    pub fn identity(&self) -> Option<Arc<Identity>> {
        self.identity.lock().clone()
    }

    /// Current reentrant checkout depth
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub const fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub const fn transaction_manager(&self) -> &Arc<TransactionManager> {
        &self.txns
    }

    pub const fn cache_manager(&self) -> &Arc<CacheManager> {
        &self.caches
    }

    pub(crate) fn owner(&self) -> Option<Owner> {
        self.owner.lock().clone()
    }

    pub(crate) fn bind(&self, identity: Arc<Identity>, owner: Owner) {
        *self.identity.lock() = Some(identity);
        *self.owner.lock() = Some(owner);
        self.depth.store(1, Ordering::SeqCst);
    }

    pub(crate) fn enter(&self) -> usize {
        self.depth.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn leave(&self) -> usize {
        let previous = self
            .depth
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| d.checked_sub(1))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub(crate) fn unbind(&self) {
        *self.identity.lock() = None;
        *self.owner.lock() = None;
        self.depth.store(0, Ordering::SeqCst);
    }

    /// Fail unless the calling thread holds this broker
    fn check_owner(&self) -> Result<()> {
        let current = thread::current().id();
        match self.owner.lock().as_ref() {
            Some(owner) if owner.id == current => Ok(()),
            _ => Err(Error::NotOwner { broker: self.id }),
        }
    }

    /// Begin a transaction owned by this broker
    pub fn begin_transaction(&self) -> Result<Transaction> {
        self.check_owner()?;
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        self.txns.begin(self.id)
    }

    /// Log `op` for `tx`, then apply it to `store`.
    ///
    /// The operation reaches the store only after its log record exists.
    pub fn apply(
        &self,
        tx: &mut Transaction,
        store: &dyn TransactionalStore,
        op: impl Into<Bytes>,
    ) -> Result<Lsn> {
        self.check_owner()?;
        if tx.broker() != self.id {
            return Err(Error::protocol(format!(
                "transaction {} belongs to {}, not {}",
                tx.id(),
                tx.broker(),
                self.id
            )));
        }

        let op = op.into();
        let lsn = self.txns.append(tx, op.clone())?;
        store.apply_under_transaction(tx.id(), lsn, &op)?;
        Ok(lsn)
    }

    /// Apply a single operation in its own transaction
    pub fn apply_implicit(&self, store: &dyn TransactionalStore, op: impl Into<Bytes>) -> Result<Lsn> {
        let op = op.into();
        self.with_transaction(|tx| self.apply(tx, store, op))
    }

    /// Run `f` inside a transaction: commit if it returns `Ok`, abort otherwise
    pub fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction) -> Result<T>,
    {
        let mut tx = self.begin_transaction()?;
        match f(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                if tx.state() == TxnState::Active {
                    if let Err(abort_err) = tx.abort() {
                        warn!(txn_id = %tx.id(), error = %abort_err, "abort after failure did not complete");
                    }
                }
                debug!(txn_id = %tx.id(), error = %e, "transaction rolled back");
                Err(e)
            }
        }
    }
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("id", &self.id)
            .field("identity", &self.identity().map(|i| i.name().to_string()))
            .field("depth", &self.depth())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.identity() {
            Some(identity) => write!(f, "{} ({})", self.id, identity.name()),
            None => write!(f, "{} (free)", self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BrokerPool;
    use crate::testutil::{RecordingStore, test_config};
    use tempfile::tempdir;
    use xstore_common::TxnId;

    #[test]
    fn test_apply_logs_before_store() {
        let dir = tempdir().unwrap();
        let store = Arc::new(RecordingStore::default());
        let pool = BrokerPool::builder(test_config(dir.path(), 2))
            .with_store(store.clone())
            .open()
            .unwrap();

        let broker = pool.get(&Identity::guest()).unwrap();
        let lsn = broker
            .with_transaction(|tx| {
                broker.apply(tx, &*store, Bytes::from_static(b"a"))?;
                broker.apply(tx, &*store, Bytes::from_static(b"b"))
            })
            .unwrap();

        assert_eq!(lsn, Lsn::new(2));
        assert_eq!(store.applied(), vec![Lsn::new(1), Lsn::new(2)]);
        assert_eq!(store.committed().len(), 1);
        assert!(pool.transaction_manager().wal().last_lsn() >= lsn);
    }

    #[test]
    fn test_with_transaction_aborts_on_error() {
        let dir = tempdir().unwrap();
        let store = Arc::new(RecordingStore::default());
        let pool = BrokerPool::builder(test_config(dir.path(), 1))
            .with_store(store.clone())
            .open()
            .unwrap();

        let broker = pool.get(&Identity::guest()).unwrap();
        let mut seen = TxnId::SYSTEM;
        let result: Result<()> = broker.with_transaction(|tx| {
            seen = tx.id();
            broker.apply(tx, &*store, Bytes::from_static(b"x"))?;
            Err(Error::internal("collaborator failed"))
        });

        assert!(matches!(result, Err(Error::Internal(_))));
        assert_eq!(store.discarded(), vec![seen]);
        assert!(store.committed().is_empty());
        assert!(!pool.transaction_manager().visible_as(None, seen));
    }

    #[test]
    fn test_apply_implicit_commits_single_operation() {
        let dir = tempdir().unwrap();
        let store = Arc::new(RecordingStore::default());
        let pool = BrokerPool::builder(test_config(dir.path(), 1))
            .with_store(store.clone())
            .open()
            .unwrap();

        let broker = pool.get(&Identity::guest()).unwrap();
        broker.apply_implicit(&*store, Bytes::from_static(b"one")).unwrap();
        broker.apply_implicit(&*store, Bytes::from_static(b"two")).unwrap();

        assert_eq!(store.committed().len(), 2);
        assert_eq!(pool.transaction_manager().active_count(), 0);
    }

    #[test]
    fn test_foreign_thread_rejected() {
        let dir = tempdir().unwrap();
        let pool = BrokerPool::builder(test_config(dir.path(), 1)).open().unwrap();

        let broker = pool.acquire(&Identity::guest()).unwrap();
        let shared = Arc::clone(&broker);
        let outcome = thread::spawn(move || shared.begin_transaction().map(|_| ()))
            .join()
            .unwrap();

        assert!(matches!(outcome, Err(Error::NotOwner { .. })));
        pool.release(&broker).unwrap();
    }

    #[test]
    fn test_transaction_from_other_broker_rejected() {
        let dir = tempdir().unwrap();
        let store = RecordingStore::default();
        let pool = BrokerPool::builder(test_config(dir.path(), 2)).open().unwrap();
        let broker = pool.get(&Identity::guest()).unwrap();

        let mut foreign = pool
            .transaction_manager()
            .begin(BrokerId::new(1))
            .unwrap();
        let outcome = broker.apply(&mut foreign, &store, Bytes::from_static(b"x"));
        assert!(matches!(outcome, Err(Error::ProtocolViolation(_))));
        foreign.abort().unwrap();
    }

    #[test]
    fn test_read_only_refuses_transactions() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path(), 1);
        config.database.read_only = true;
        let pool = BrokerPool::builder(config).open().unwrap();

        let broker = pool.get(&Identity::guest()).unwrap();
        assert!(broker.is_read_only());
        assert!(matches!(broker.begin_transaction(), Err(Error::ReadOnly)));
    }

    #[test]
    fn test_display() {
        let dir = tempdir().unwrap();
        let pool = BrokerPool::builder(test_config(dir.path(), 1)).open().unwrap();

        let broker = pool.acquire(&Identity::guest()).unwrap();
        assert_eq!(broker.to_string(), "broker-0 (guest)");
        pool.release(&broker).unwrap();
        assert_eq!(broker.to_string(), "broker-0 (free)");
    }
}
