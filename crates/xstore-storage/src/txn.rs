//! Transaction manager
//!
//! Transactions move through `ACTIVE -> COMMITTING -> COMMITTED` or
//! `ACTIVE -> ABORTING -> ABORTED`. Every operation is logged before it is
//! applied; a commit is acknowledged only after its commit record is
//! durable. Checkpoints write a marker carrying the low-water LSN (the
//! oldest first LSN among active transactions) and truncate the log below
//! it. Recovery replays from the last marker's low-water LSN and aborts
//! every transaction without a commit record.

use crate::wal::{LogRecord, RecordKind, WriteAheadLog};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tracing::{debug, error, info, warn};
use xstore_common::config::TransactionConfig;
use xstore_common::{BrokerId, Error, Lsn, Result, TxnId};

/// Transaction lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnState {
    Active,
    Committing,
    Committed,
    Aborting,
    Aborted,
}

impl TxnState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Committing => "COMMITTING",
            Self::Committed => "COMMITTED",
            Self::Aborting => "ABORTING",
            Self::Aborted => "ABORTED",
        }
    }

    /// No further transitions are possible
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A storage subsystem whose changes are protected by the log.
///
/// Stores receive every logged operation through
/// [`apply_under_transaction`](Self::apply_under_transaction) and learn each
/// transaction's outcome through [`committed`](Self::committed) and
/// [`discard`](Self::discard). During recovery the same calls replay
/// committed work and discard incomplete work.
pub trait TransactionalStore: Send + Sync {
    /// Store name for logging
    fn name(&self) -> &str;

    /// Apply an operation that has already been logged at `lsn`
    fn apply_under_transaction(&self, txn: TxnId, lsn: Lsn, op: &[u8]) -> Result<()>;

    /// The transaction's commit record is durable.
    ///
    /// Checkpoints wait for this call to return, so it must not begin or
    /// finish transactions itself.
    fn committed(&self, _txn: TxnId) {}

    /// Throw away every effect of the transaction
    fn discard(&self, txn: TxnId);

    /// Persist applied state. Called before a checkpoint marker is written.
    fn checkpoint(&self) -> Result<()> {
        Ok(())
    }
}

/// Transaction manager statistics
#[derive(Debug, Default)]
pub struct TxnStats {
    pub begun: AtomicU64,
    pub committed: AtomicU64,
    pub aborted: AtomicU64,
    pub forced_aborts: AtomicU64,
    pub flush_failures: AtomicU64,
    pub checkpoints: AtomicU64,
    /// Committed transactions redone by recovery
    pub recovered: AtomicU64,
}

/// Manager-side view of a live transaction
#[derive(Debug, Clone, Copy)]
struct ActiveTxn {
    broker: BrokerId,
    state: TxnState,
    /// Lower bound on the first LSN, set before the first record is written
    first_lsn: Option<Lsn>,
    last_lsn: Option<Lsn>,
}

/// Snapshot of a live transaction for monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionInfo {
    pub id: TxnId,
    pub broker: BrokerId,
    pub state: TxnState,
    pub first_lsn: Option<Lsn>,
    pub last_lsn: Option<Lsn>,
}

/// Outcome of crash recovery
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// LSN of the checkpoint marker replay started from
    pub checkpoint: Option<Lsn>,
    /// First LSN examined
    pub low_water: Lsn,
    /// Last LSN found in the log
    pub last_lsn: Lsn,
    /// Transactions with a commit record in the replayed range
    pub committed: BTreeSet<TxnId>,
    /// Committed transactions whose operations were re-applied
    pub redone: BTreeSet<TxnId>,
    /// Transactions that ended aborted, including incomplete ones
    pub aborted: BTreeSet<TxnId>,
    /// Transactions with no commit or abort record
    pub incomplete: BTreeSet<TxnId>,
    /// Records examined
    pub records_replayed: usize,
}

impl RecoveryReport {
    /// Final state of a transaction seen during recovery
    pub fn outcome(&self, txn: TxnId) -> Option<TxnState> {
        if self.committed.contains(&txn) {
            Some(TxnState::Committed)
        } else if self.aborted.contains(&txn) {
            Some(TxnState::Aborted)
        } else {
            None
        }
    }
}

/// Handle to a transaction.
///
/// Dropping a handle that is still ACTIVE aborts the transaction.
pub struct Transaction {
    id: TxnId,
    broker: BrokerId,
    state: TxnState,
    first_lsn: Option<Lsn>,
    last_lsn: Option<Lsn>,
    manager: Arc<TransactionManager>,
}

impl Transaction {
    pub const fn id(&self) -> TxnId {
        self.id
    }

    /// Broker that began the transaction
    pub const fn broker(&self) -> BrokerId {
        self.broker
    }

    pub const fn state(&self) -> TxnState {
        self.state
    }

    pub const fn first_lsn(&self) -> Option<Lsn> {
        self.first_lsn
    }

    pub const fn last_lsn(&self) -> Option<Lsn> {
        self.last_lsn
    }

    /// Log an operation for this transaction
    pub fn append(&mut self, payload: impl Into<Bytes>) -> Result<Lsn> {
        let manager = Arc::clone(&self.manager);
        manager.append(self, payload)
    }

    /// Commit, returning once the commit record is durable
    pub fn commit(&mut self) -> Result<()> {
        let manager = Arc::clone(&self.manager);
        manager.commit(self)
    }

    pub fn abort(&mut self) -> Result<()> {
        let manager = Arc::clone(&self.manager);
        manager.abort(self)
    }

    fn invalid_state(&self) -> Error {
        Error::InvalidTransactionState {
            txn_id: self.id,
            state: self.state.as_str(),
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("broker", &self.broker)
            .field("state", &self.state)
            .field("first_lsn", &self.first_lsn)
            .field("last_lsn", &self.last_lsn)
            .finish_non_exhaustive()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TxnState::Active {
            warn!(txn_id = %self.id, "transaction dropped while active, aborting");
            let manager = Arc::clone(&self.manager);
            if let Err(e) = manager.abort(self) {
                warn!(txn_id = %self.id, error = %e, "abort on drop failed");
            }
        }
    }
}

/// Coordinates transactions over the write-ahead log
pub struct TransactionManager {
    wal: WriteAheadLog,
    config: TransactionConfig,
    next_txn_id: AtomicU64,
    active: Mutex<BTreeMap<TxnId, ActiveTxn>>,
    /// Aborted since the last checkpoint, consulted by `visible_as`
    aborted: Mutex<BTreeSet<TxnId>>,
    stores: RwLock<Vec<Arc<dyn TransactionalStore>>>,
    /// Commits hold this shared; checkpoints hold it exclusively
    boundary: RwLock<()>,
    checkpoint_lsn: AtomicU64,
    consecutive_failures: AtomicU32,
    halted: AtomicBool,
    failure: Mutex<Option<String>>,
    recovered: AtomicBool,
    stats: TxnStats,
}

impl TransactionManager {
    /// Open the log at `path` and build a manager over it.
    ///
    /// Call [`recover`](Self::recover) once stores are registered and before
    /// the first transaction begins.
    pub fn open(path: impl AsRef<Path>, config: TransactionConfig) -> Result<Arc<Self>> {
        let wal = WriteAheadLog::open(path, config.sync_mode)?;
        Ok(Arc::new(Self::new(wal, config)))
    }

    pub fn new(wal: WriteAheadLog, config: TransactionConfig) -> Self {
        Self {
            wal,
            config,
            next_txn_id: AtomicU64::new(1),
            active: Mutex::new(BTreeMap::new()),
            aborted: Mutex::new(BTreeSet::new()),
            stores: RwLock::new(Vec::new()),
            boundary: RwLock::new(()),
            checkpoint_lsn: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            halted: AtomicBool::new(false),
            failure: Mutex::new(None),
            recovered: AtomicBool::new(false),
            stats: TxnStats::default(),
        }
    }

    /// Register a store to receive operations and outcomes
    pub fn register_store(&self, store: Arc<dyn TransactionalStore>) {
        info!(store = store.name(), "registered transactional store");
        self.stores.write().push(store);
    }

    fn stores(&self) -> Vec<Arc<dyn TransactionalStore>> {
        self.stores.read().clone()
    }

    /// Error for a manager that can no longer start work
    fn check_usable(&self) -> Result<()> {
        if let Some(reason) = self.failure.lock().as_ref() {
            return Err(Error::DurabilityLost(reason.clone()));
        }
        if self.halted.load(Ordering::SeqCst) {
            return Err(Error::ShutdownInProgress);
        }
        Ok(())
    }

    fn fail(&self, reason: String) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            error!(reason = %reason, "transaction log failed, refusing further work");
            *failure = Some(reason);
        }
    }

    /// Begin a transaction on behalf of `broker`
    pub fn begin(self: &Arc<Self>, broker: BrokerId) -> Result<Transaction> {
        let id = {
            let mut active = self.active.lock();
            self.check_usable()?;
            if active.len() >= self.config.max_active {
                return Err(Error::TooManyActiveTransactions {
                    limit: self.config.max_active,
                });
            }
            let id = TxnId::new(self.next_txn_id.fetch_add(1, Ordering::SeqCst));
            active.insert(
                id,
                ActiveTxn {
                    broker,
                    state: TxnState::Active,
                    first_lsn: None,
                    last_lsn: None,
                },
            );
            id
        };

        self.stats.begun.fetch_add(1, Ordering::Relaxed);
        debug!(txn_id = %id, broker = %broker, "transaction started");

        Ok(Transaction {
            id,
            broker,
            state: TxnState::Active,
            first_lsn: None,
            last_lsn: None,
            manager: Arc::clone(self),
        })
    }

    /// Log an operation for an active transaction and return its LSN
    pub fn append(&self, tx: &mut Transaction, payload: impl Into<Bytes>) -> Result<Lsn> {
        if tx.state != TxnState::Active {
            return Err(tx.invalid_state());
        }
        self.check_usable()?;

        let known = {
            let mut active = self.active.lock();
            match active.get_mut(&tx.id) {
                Some(entry) => {
                    // Checkpoints must see this transaction's low water
                    // before its first record exists
                    if entry.first_lsn.is_none() {
                        entry.first_lsn = Some(self.wal.next_lsn());
                    }
                    true
                }
                None => false,
            }
        };
        if !known {
            tx.state = TxnState::Aborted;
            return Err(tx.invalid_state());
        }

        let lsn = self
            .wal
            .append(tx.id, RecordKind::Operation, payload.into())?;

        if let Some(entry) = self.active.lock().get_mut(&tx.id) {
            if tx.first_lsn.is_none() {
                entry.first_lsn = Some(lsn);
            }
            entry.last_lsn = Some(lsn);
        }
        tx.first_lsn.get_or_insert(lsn);
        tx.last_lsn = Some(lsn);

        Ok(lsn)
    }

    /// Commit an active transaction.
    ///
    /// Returns after the commit record is durable. If the log cannot be
    /// flushed the transaction ends ABORTED and the I/O error is returned.
    pub fn commit(&self, tx: &mut Transaction) -> Result<()> {
        if tx.state != TxnState::Active {
            return Err(tx.invalid_state());
        }

        let (known, usable) = {
            let mut active = self.active.lock();
            let usable = self.check_usable();
            let known = match active.get_mut(&tx.id) {
                Some(entry) => {
                    if usable.is_ok() {
                        entry.state = TxnState::Committing;
                    }
                    true
                }
                None => false,
            };
            (known, usable)
        };
        if !known {
            tx.state = TxnState::Aborted;
            return Err(usable.err().unwrap_or_else(|| tx.invalid_state()));
        }
        if let Err(e) = usable {
            self.finish_abort(tx);
            return Err(e);
        }
        tx.state = TxnState::Committing;

        // Held until the stores know the outcome, so no checkpoint can
        // persist store state that is missing a commit it truncates
        let _boundary = self.boundary.read();
        let outcome = self
            .wal
            .append(tx.id, RecordKind::Commit, Bytes::new())
            .and_then(|lsn| self.wal.sync_to(lsn).map(|()| lsn));

        match outcome {
            Ok(lsn) => {
                self.active.lock().remove(&tx.id);
                tx.state = TxnState::Committed;
                tx.last_lsn = Some(lsn);
                self.consecutive_failures.store(0, Ordering::SeqCst);
                self.stats.committed.fetch_add(1, Ordering::Relaxed);

                for store in self.stores() {
                    store.committed(tx.id);
                }

                debug!(txn_id = %tx.id, lsn = %lsn, "transaction committed");
                Ok(())
            }
            Err(e) => {
                self.stats.flush_failures.fetch_add(1, Ordering::Relaxed);
                error!(txn_id = %tx.id, error = %e, "commit failed, aborting transaction");
                self.finish_abort(tx);

                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.config.max_flush_failures {
                    self.fail(format!("{failures} consecutive commit flush failures"));
                }
                Err(e)
            }
        }
    }

    /// Abort an active transaction
    pub fn abort(&self, tx: &mut Transaction) -> Result<()> {
        if tx.state != TxnState::Active {
            return Err(tx.invalid_state());
        }

        // A shutdown may already have aborted it
        if self.finish_abort(tx) {
            debug!(txn_id = %tx.id, "transaction aborted");
        }
        Ok(())
    }

    fn finish_abort(&self, tx: &mut Transaction) -> bool {
        tx.state = TxnState::Aborting;
        let aborted = self.abort_by_id(tx.id);
        tx.state = TxnState::Aborted;
        aborted
    }

    /// Write the abort record, forget the transaction and discard its effects.
    ///
    /// Returns false if someone else is already aborting it.
    fn abort_by_id(&self, id: TxnId) -> bool {
        {
            let mut active = self.active.lock();
            match active.get_mut(&id) {
                Some(entry) if entry.state != TxnState::Aborting => entry.state = TxnState::Aborting,
                _ => return false,
            }
        }
        self.log_abort(id);
        true
    }

    /// Abort a transaction already claimed as ABORTING
    fn log_abort(&self, id: TxnId) {
        if let Err(e) = self.wal.append(id, RecordKind::Abort, Bytes::new()) {
            warn!(txn_id = %id, error = %e, "failed to log abort record");
        }

        self.active.lock().remove(&id);
        self.aborted.lock().insert(id);
        for store in self.stores() {
            store.discard(id);
        }
        self.stats.aborted.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a checkpoint and return the new low-water LSN.
    ///
    /// Commits are held off while the marker is written. An I/O failure
    /// here leaves the manager refusing further work.
    pub fn checkpoint(&self) -> Result<Lsn> {
        self.check_usable()?;
        self.checkpoint_inner()
    }

    fn checkpoint_inner(&self) -> Result<Lsn> {
        let _boundary = self.boundary.write();

        let result = (|| -> Result<(Lsn, Lsn, usize)> {
            for store in self.stores() {
                store.checkpoint()?;
            }

            let low_water = {
                let active = self.active.lock();
                active
                    .values()
                    .filter_map(|t| t.first_lsn)
                    .min()
                    .unwrap_or_else(|| self.wal.next_lsn())
            };
            let high_water = TxnId::new(self.next_txn_id.load(Ordering::SeqCst));

            let marker = self.wal.append_checkpoint(high_water, low_water)?;
            self.wal.sync()?;
            let removed = self.wal.truncate_before(low_water)?;
            Ok((marker, low_water, removed))
        })();

        match result {
            Ok((marker, low_water, removed)) => {
                self.checkpoint_lsn.store(low_water.get(), Ordering::SeqCst);
                self.aborted.lock().clear();
                self.stats.checkpoints.fetch_add(1, Ordering::Relaxed);
                info!(
                    marker = %marker,
                    low_water = %low_water,
                    removed,
                    "checkpoint complete"
                );
                Ok(low_water)
            }
            Err(e) => {
                if matches!(e, Error::Io(_)) {
                    self.fail(format!("checkpoint failed: {e}"));
                }
                error!(error = %e, "checkpoint failed");
                Err(e)
            }
        }
    }

    /// Replay the log after a crash. May run only once per manager.
    pub fn recover(&self) -> Result<RecoveryReport> {
        if self.recovered.swap(true, Ordering::SeqCst) {
            return Err(Error::protocol("recovery has already run"));
        }

        let result = self.recover_inner();
        if let Err(Error::Io(e)) = &result {
            self.fail(format!("recovery failed: {e}"));
        }
        result
    }

    fn recover_inner(&self) -> Result<RecoveryReport> {
        let records = self.wal.read_records()?;

        let marker = records.iter().rev().find(|r| r.kind == RecordKind::Checkpoint);
        let (marker_lsn, low_water, id_high_water) = match marker {
            Some(m) => (
                Some(m.lsn),
                m.low_water()
                    .ok_or_else(|| Error::LogCorruption(format!("malformed checkpoint at LSN {}", m.lsn)))?,
                m.txn_id.get(),
            ),
            None => (None, Lsn::ZERO, 0),
        };

        let mut report = RecoveryReport {
            checkpoint: marker_lsn,
            low_water,
            last_lsn: records.last().map_or(Lsn::ZERO, |r| r.lsn),
            ..RecoveryReport::default()
        };

        let mut pending: BTreeMap<TxnId, Vec<LogRecord>> = BTreeMap::new();
        let mut committed: BTreeMap<TxnId, (Lsn, Vec<LogRecord>)> = BTreeMap::new();
        let mut next_id = id_high_water;

        for record in records.into_iter().filter(|r| r.lsn >= low_water) {
            report.records_replayed += 1;
            let txn = record.txn_id;
            match record.kind {
                RecordKind::Operation => {
                    next_id = next_id.max(txn.get() + 1);
                    pending.entry(txn).or_default().push(record);
                }
                RecordKind::Commit => {
                    next_id = next_id.max(txn.get() + 1);
                    let ops = pending.remove(&txn).unwrap_or_default();
                    committed.insert(txn, (record.lsn, ops));
                    report.aborted.remove(&txn);
                }
                RecordKind::Abort => {
                    next_id = next_id.max(txn.get() + 1);
                    pending.remove(&txn);
                    // An abort after a commit record means the commit was never acknowledged
                    committed.remove(&txn);
                    report.aborted.insert(txn);
                }
                RecordKind::Checkpoint => {}
            }
        }

        let stores = self.stores();
        let redo_after = marker_lsn.unwrap_or(Lsn::ZERO);

        for (txn, (commit_lsn, ops)) in &committed {
            report.committed.insert(*txn);
            if *commit_lsn <= redo_after {
                continue;
            }
            for op in ops {
                for store in &stores {
                    store.apply_under_transaction(*txn, op.lsn, &op.payload)?;
                }
            }
            for store in &stores {
                store.committed(*txn);
            }
            report.redone.insert(*txn);
        }

        for txn in pending.keys() {
            warn!(txn_id = %txn, "aborting incomplete transaction found during recovery");
            self.wal.append(*txn, RecordKind::Abort, Bytes::new())?;
            report.incomplete.insert(*txn);
            report.aborted.insert(*txn);
        }
        for txn in &report.aborted {
            for store in &stores {
                store.discard(*txn);
            }
        }
        self.wal.sync()?;

        self.next_txn_id.fetch_max(next_id, Ordering::SeqCst);
        self.aborted.lock().extend(report.aborted.iter().copied());
        self.checkpoint_lsn.store(low_water.get(), Ordering::SeqCst);
        self.stats
            .recovered
            .store(report.redone.len() as u64, Ordering::Relaxed);

        info!(
            records = report.records_replayed,
            committed = report.committed.len(),
            redone = report.redone.len(),
            aborted = report.aborted.len(),
            last_lsn = %report.last_lsn,
            "recovery complete"
        );
        Ok(report)
    }

    /// Whether `writer`'s changes are visible to `reader`.
    ///
    /// A transaction sees its own work. Everyone else sees only the work of
    /// transactions that are committed.
    pub fn visible_as(&self, reader: Option<TxnId>, writer: TxnId) -> bool {
        if reader == Some(writer) {
            return true;
        }
        if self.active.lock().contains_key(&writer) {
            return false;
        }
        !self.aborted.lock().contains(&writer)
    }

    /// Stop accepting work, abort every active transaction and take a
    /// final checkpoint. Returns the transactions that were force-aborted.
    ///
    /// Only the first call does anything.
    pub fn shutdown(&self) -> Vec<TxnId> {
        let forced: Vec<TxnId> = {
            let mut active = self.active.lock();
            if self.halted.swap(true, Ordering::SeqCst) {
                return Vec::new();
            }
            // Claimed under the lock; transactions already committing or
            // aborting finish on their own
            active
                .iter_mut()
                .filter(|(_, t)| t.state == TxnState::Active)
                .map(|(id, t)| {
                    t.state = TxnState::Aborting;
                    *id
                })
                .collect()
        };

        for id in &forced {
            warn!(txn_id = %id, "forcing abort of active transaction at shutdown");
            self.log_abort(*id);
        }
        self.stats
            .forced_aborts
            .fetch_add(forced.len() as u64, Ordering::Relaxed);

        let failed = self.failure.lock().is_some();
        if failed {
            if let Err(e) = self.wal.sync() {
                warn!(error = %e, "final log sync failed");
            }
        } else if let Err(e) = self.checkpoint_inner() {
            warn!(error = %e, "final checkpoint failed");
        }

        info!(forced_aborts = forced.len(), "transaction manager shut down");
        forced
    }

    /// Force buffered log records to disk
    pub fn flush_log(&self) -> Result<()> {
        self.wal.sync()
    }

    /// Low-water LSN of the most recent checkpoint or recovery
    pub fn checkpoint_lsn(&self) -> Lsn {
        Lsn::new(self.checkpoint_lsn.load(Ordering::SeqCst))
    }

    /// The log has grown past its configured size
    pub fn checkpoint_due(&self) -> bool {
        self.wal.size() >= self.config.max_log_size
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Snapshot of live transactions
    pub fn active_transactions(&self) -> Vec<TransactionInfo> {
        self.active
            .lock()
            .iter()
            .map(|(id, t)| TransactionInfo {
                id: *id,
                broker: t.broker,
                state: t.state,
                first_lsn: t.first_lsn,
                last_lsn: t.last_lsn,
            })
            .collect()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// The log is no longer trusted
    pub fn is_failed(&self) -> bool {
        self.failure.lock().is_some()
    }

    pub const fn stats(&self) -> &TxnStats {
        &self.stats
    }

    pub const fn config(&self) -> &TransactionConfig {
        &self.config
    }

    pub const fn wal(&self) -> &WriteAheadLog {
        &self.wal
    }
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("log", &self.wal.path())
            .field("next_lsn", &self.wal.next_lsn())
            .field("active", &self.active_count())
            .field("checkpoint_lsn", &self.checkpoint_lsn())
            .field("halted", &self.is_halted())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{Receiver, Sender, bounded};
    use std::collections::HashMap;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};
    use xstore_common::config::SyncMode;

    /// In-memory key/value store. Operations are `key=value`.
    #[derive(Default)]
    struct MemoryStore {
        staged: Mutex<HashMap<TxnId, Vec<(String, String)>>>,
        data: Mutex<HashMap<String, String>>,
        applied: Mutex<Vec<Lsn>>,
        discarded: Mutex<Vec<TxnId>>,
    }

    impl MemoryStore {
        fn get(&self, key: &str) -> Option<String> {
            self.data.lock().get(key).cloned()
        }
    }

    impl TransactionalStore for MemoryStore {
        fn name(&self) -> &str {
            "memory"
        }

        fn apply_under_transaction(&self, txn: TxnId, lsn: Lsn, op: &[u8]) -> Result<()> {
            let text = std::str::from_utf8(op).map_err(|e| Error::internal(e.to_string()))?;
            let (key, value) = text
                .split_once('=')
                .ok_or_else(|| Error::internal("malformed op"))?;
            self.staged
                .lock()
                .entry(txn)
                .or_default()
                .push((key.to_string(), value.to_string()));
            self.applied.lock().push(lsn);
            Ok(())
        }

        fn committed(&self, txn: TxnId) {
            if let Some(ops) = self.staged.lock().remove(&txn) {
                self.data.lock().extend(ops);
            }
        }

        fn discard(&self, txn: TxnId) {
            self.staged.lock().remove(&txn);
            self.discarded.lock().push(txn);
        }
    }

    /// Persists committed data at checkpoints; commit notifications wait
    /// for a go-ahead
    struct GatedStore {
        inner: MemoryStore,
        persisted: Mutex<HashMap<String, String>>,
        entered: Sender<()>,
        release: Receiver<()>,
    }

    impl TransactionalStore for GatedStore {
        fn name(&self) -> &str {
            "gated"
        }

        fn apply_under_transaction(&self, txn: TxnId, lsn: Lsn, op: &[u8]) -> Result<()> {
            self.inner.apply_under_transaction(txn, lsn, op)
        }

        fn committed(&self, txn: TxnId) {
            let _ = self.entered.send(());
            let _ = self.release.recv();
            self.inner.committed(txn);
        }

        fn discard(&self, txn: TxnId) {
            self.inner.discard(txn);
        }

        fn checkpoint(&self) -> Result<()> {
            let data = self.inner.data.lock().clone();
            *self.persisted.lock() = data;
            Ok(())
        }
    }

    fn config() -> TransactionConfig {
        TransactionConfig {
            sync_mode: SyncMode::OnCommit,
            ..TransactionConfig::default()
        }
    }

    fn open(dir: &TempDir, config: TransactionConfig) -> (Arc<TransactionManager>, Arc<MemoryStore>) {
        let manager = TransactionManager::open(dir.path().join("txn.wal"), config).unwrap();
        let store = Arc::new(MemoryStore::default());
        manager.register_store(store.clone());
        manager.recover().unwrap();
        (manager, store)
    }

    /// Log then apply, as a broker does
    fn write(tx: &mut Transaction, store: &MemoryStore, op: &'static str) -> Lsn {
        let lsn = tx.append(Bytes::from_static(op.as_bytes())).unwrap();
        store
            .apply_under_transaction(tx.id(), lsn, op.as_bytes())
            .unwrap();
        lsn
    }

    /// Simulate a crash: the log is on disk, nothing else runs
    fn crash(manager: Arc<TransactionManager>, txns: Vec<Transaction>) {
        manager.flush_log().unwrap();
        for tx in txns {
            std::mem::forget(tx);
        }
        std::mem::forget(manager);
    }

    #[test]
    fn test_commit_lifecycle() {
        let dir = tempdir().unwrap();
        let (manager, store) = open(&dir, config());

        let mut tx = manager.begin(BrokerId::new(0)).unwrap();
        assert_eq!(tx.state(), TxnState::Active);
        assert_eq!(tx.broker(), BrokerId::new(0));

        let first = write(&mut tx, &store, "a=1");
        let second = write(&mut tx, &store, "b=2");
        assert_eq!(second, first.next());
        assert_eq!(tx.first_lsn(), Some(first));
        assert_eq!(tx.last_lsn(), Some(second));

        assert!(!manager.visible_as(None, tx.id()));
        assert!(manager.visible_as(Some(tx.id()), tx.id()));

        tx.commit().unwrap();
        assert_eq!(tx.state(), TxnState::Committed);
        assert!(manager.visible_as(None, tx.id()));
        assert_eq!(store.get("a").as_deref(), Some("1"));
        assert_eq!(manager.active_count(), 0);
        assert_eq!(manager.stats().committed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_abort_discards() {
        let dir = tempdir().unwrap();
        let (manager, store) = open(&dir, config());

        let mut tx = manager.begin(BrokerId::new(0)).unwrap();
        write(&mut tx, &store, "a=1");
        tx.abort().unwrap();

        assert_eq!(tx.state(), TxnState::Aborted);
        assert!(!manager.visible_as(None, tx.id()));
        assert!(store.get("a").is_none());
        assert_eq!(store.discarded.lock().as_slice(), &[tx.id()]);
    }

    #[test]
    fn test_operations_on_finished_transaction_rejected() {
        let dir = tempdir().unwrap();
        let (manager, _store) = open(&dir, config());

        let mut tx = manager.begin(BrokerId::new(0)).unwrap();
        tx.commit().unwrap();

        assert!(matches!(
            tx.append(Bytes::from_static(b"x=1")),
            Err(Error::InvalidTransactionState { state: "COMMITTED", .. })
        ));
        assert!(matches!(
            tx.commit(),
            Err(Error::InvalidTransactionState { .. })
        ));
        assert!(matches!(
            tx.abort(),
            Err(Error::InvalidTransactionState { .. })
        ));
    }

    #[test]
    fn test_active_limit() {
        let dir = tempdir().unwrap();
        let (manager, _store) = open(
            &dir,
            TransactionConfig {
                max_active: 2,
                ..config()
            },
        );

        let _t1 = manager.begin(BrokerId::new(0)).unwrap();
        let t2 = manager.begin(BrokerId::new(1)).unwrap();
        assert!(matches!(
            manager.begin(BrokerId::new(2)),
            Err(Error::TooManyActiveTransactions { limit: 2 })
        ));

        // Dropping an active handle aborts it and frees the slot
        drop(t2);
        assert!(manager.begin(BrokerId::new(2)).is_ok());
    }

    #[test]
    fn test_transaction_ids_are_unique() {
        let dir = tempdir().unwrap();
        let (manager, _store) = open(&dir, config());

        let ids: BTreeSet<TxnId> = (0..50)
            .map(|_| {
                let mut tx = manager.begin(BrokerId::new(0)).unwrap();
                tx.commit().unwrap();
                tx.id()
            })
            .collect();
        assert_eq!(ids.len(), 50);
    }

    #[test]
    fn test_recovery_aborts_incomplete_transaction() {
        let dir = tempdir().unwrap();
        let (manager, store) = open(&dir, config());

        // txn1: 98 operations and a commit fill LSNs 1..=99
        let mut t1 = manager.begin(BrokerId::new(0)).unwrap();
        for _ in 0..98 {
            write(&mut t1, &store, "k=committed");
        }
        t1.commit().unwrap();
        assert_eq!(t1.last_lsn(), Some(Lsn::new(99)));

        // txn2: LSNs 100 and 101, never committed
        let mut t2 = manager.begin(BrokerId::new(1)).unwrap();
        assert_eq!(write(&mut t2, &store, "k=lost"), Lsn::new(100));
        assert_eq!(write(&mut t2, &store, "j=lost"), Lsn::new(101));
        let (t1_id, t2_id) = (t1.id(), t2.id());
        crash(manager, vec![t2]);

        let (manager, store) = open(&dir, config());
        let report = manager.wal().read_records().unwrap();
        assert_eq!(report.last().map(|r| r.kind), Some(RecordKind::Abort));

        assert!(store.get("j").is_none());
        assert_eq!(store.get("k").as_deref(), Some("committed"));
        assert!(
            store
                .applied
                .lock()
                .iter()
                .all(|lsn| *lsn < Lsn::new(100))
        );
        assert!(manager.visible_as(None, t1_id));
        assert!(!manager.visible_as(None, t2_id));

        // New ids never reuse a logged one
        let next = manager.begin(BrokerId::new(0)).unwrap();
        assert!(next.id() > t2_id);
    }

    #[test]
    fn test_recovery_report_outcomes() {
        let dir = tempdir().unwrap();
        {
            let (manager, store) = open(&dir, config());
            let mut t1 = manager.begin(BrokerId::new(0)).unwrap();
            write(&mut t1, &store, "a=1");
            t1.commit().unwrap();

            let mut t2 = manager.begin(BrokerId::new(0)).unwrap();
            write(&mut t2, &store, "b=2");
            crash(manager, vec![t2]);
        }

        let manager = TransactionManager::open(dir.path().join("txn.wal"), config()).unwrap();
        let store = Arc::new(MemoryStore::default());
        manager.register_store(store.clone());
        let report = manager.recover().unwrap();

        assert_eq!(report.checkpoint, None);
        assert_eq!(report.outcome(TxnId::new(1)), Some(TxnState::Committed));
        assert_eq!(report.outcome(TxnId::new(2)), Some(TxnState::Aborted));
        assert!(report.incomplete.contains(&TxnId::new(2)));
        assert!(report.redone.contains(&TxnId::new(1)));
        assert_eq!(store.get("a").as_deref(), Some("1"));
        assert!(store.get("b").is_none());
        assert_eq!(report.outcome(TxnId::new(3)), None);
    }

    #[test]
    fn test_recover_runs_once() {
        let dir = tempdir().unwrap();
        let (manager, _store) = open(&dir, config());
        assert!(matches!(
            manager.recover(),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_checkpoint_low_water_and_truncation() {
        let dir = tempdir().unwrap();
        let (manager, store) = open(&dir, config());

        for _ in 0..5 {
            let mut tx = manager.begin(BrokerId::new(0)).unwrap();
            write(&mut tx, &store, "a=1");
            tx.commit().unwrap();
        }

        let mut open_tx = manager.begin(BrokerId::new(1)).unwrap();
        let first = write(&mut open_tx, &store, "b=2");

        let low_water = manager.checkpoint().unwrap();
        assert_eq!(low_water, first);
        assert_eq!(manager.checkpoint_lsn(), first);
        assert_eq!(manager.wal().first_lsn(), first);

        // Nothing active: low water is the next LSN to be written
        open_tx.commit().unwrap();
        let next = manager.wal().next_lsn();
        assert_eq!(manager.checkpoint().unwrap(), next);
    }

    #[test]
    fn test_recovery_after_checkpoint_skips_checkpointed_commits() {
        let dir = tempdir().unwrap();
        {
            let (manager, store) = open(&dir, config());

            let mut before = manager.begin(BrokerId::new(0)).unwrap();
            write(&mut before, &store, "a=1");

            let mut spanning = manager.begin(BrokerId::new(0)).unwrap();
            write(&mut spanning, &store, "b=2");

            before.commit().unwrap();
            manager.checkpoint().unwrap();

            write(&mut spanning, &store, "c=3");
            spanning.commit().unwrap();
            crash(manager, Vec::new());
        }

        let manager = TransactionManager::open(dir.path().join("txn.wal"), config()).unwrap();
        let store = Arc::new(MemoryStore::default());
        manager.register_store(store.clone());
        let report = manager.recover().unwrap();

        // The spanning transaction is redone from its first record, which
        // sits below the marker
        assert!(report.checkpoint.is_some());
        assert_eq!(report.redone.len(), 1);
        assert_eq!(store.get("b").as_deref(), Some("2"));
        assert_eq!(store.get("c").as_deref(), Some("3"));
        assert!(store.get("a").is_none());
    }

    #[test]
    fn test_checkpoint_waits_for_commit_notifications() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("txn.wal");
        let (entered_tx, entered_rx) = bounded(1);
        let (release_tx, release_rx) = bounded(1);

        let manager = TransactionManager::open(&path, config()).unwrap();
        let store = Arc::new(GatedStore {
            inner: MemoryStore::default(),
            persisted: Mutex::default(),
            entered: entered_tx,
            release: release_rx,
        });
        manager.register_store(store.clone());
        manager.recover().unwrap();

        let mut tx = manager.begin(BrokerId::new(0)).unwrap();
        let lsn = tx.append(Bytes::from_static(b"a=1")).unwrap();
        store.apply_under_transaction(tx.id(), lsn, b"a=1").unwrap();

        std::thread::scope(|s| {
            let committer = s.spawn(move || tx.commit());
            entered_rx.recv().unwrap();

            let checkpointer = s.spawn(|| manager.checkpoint());
            std::thread::sleep(Duration::from_millis(50));
            assert!(!checkpointer.is_finished());

            release_tx.send(()).unwrap();
            committer.join().unwrap().unwrap();
            checkpointer.join().unwrap().unwrap();
        });
        assert_eq!(store.persisted.lock().get("a").map(String::as_str), Some("1"));
        crash(manager, Vec::new());

        // Restart from what the checkpoint persisted plus the log
        let manager = TransactionManager::open(&path, config()).unwrap();
        let recovered = Arc::new(MemoryStore::default());
        recovered.data.lock().extend(store.persisted.lock().clone());
        manager.register_store(recovered.clone());
        manager.recover().unwrap();
        assert_eq!(recovered.get("a").as_deref(), Some("1"));
    }

    #[test]
    fn test_abort_is_claimed_once() {
        let dir = tempdir().unwrap();
        let (manager, store) = open(&dir, config());

        let mut tx = manager.begin(BrokerId::new(0)).unwrap();
        write(&mut tx, &store, "a=1");
        let id = tx.id();

        // Claimed elsewhere, as a shutdown does
        manager.active.lock().get_mut(&id).unwrap().state = TxnState::Aborting;
        tx.abort().unwrap();
        assert_eq!(tx.state(), TxnState::Aborted);
        assert!(store.discarded.lock().is_empty());

        manager.log_abort(id);
        assert!(!manager.abort_by_id(id));

        assert_eq!(store.discarded.lock().as_slice(), &[id]);
        assert_eq!(manager.stats().aborted.load(Ordering::Relaxed), 1);
        let abort_records = manager
            .wal()
            .read_records()
            .unwrap()
            .iter()
            .filter(|r| r.kind == RecordKind::Abort && r.txn_id == id)
            .count();
        assert_eq!(abort_records, 1);
    }

    #[test]
    fn test_default_report_is_empty() {
        let report = RecoveryReport::default();
        assert_eq!(report.checkpoint, None);
        assert_eq!(report.low_water, Lsn::ZERO);
        assert_eq!(report.last_lsn, Lsn::ZERO);
        assert!(report.committed.is_empty());
        assert_eq!(report.records_replayed, 0);
    }

    #[test]
    fn test_flush_failure_aborts_and_escalates() {
        let dir = tempdir().unwrap();
        let (manager, store) = open(
            &dir,
            TransactionConfig {
                max_flush_failures: 2,
                ..config()
            },
        );

        manager.wal().fail_next_syncs(1);
        let mut tx = manager.begin(BrokerId::new(0)).unwrap();
        write(&mut tx, &store, "a=1");
        assert!(matches!(tx.commit(), Err(Error::Io(_))));
        assert_eq!(tx.state(), TxnState::Aborted);
        assert!(store.get("a").is_none());
        assert!(!manager.is_failed());

        // A success resets the count
        let mut tx = manager.begin(BrokerId::new(0)).unwrap();
        tx.commit().unwrap();

        manager.wal().fail_next_syncs(2);
        for _ in 0..2 {
            let mut tx = manager.begin(BrokerId::new(0)).unwrap();
            assert!(tx.commit().is_err());
        }
        assert!(manager.is_failed());
        assert!(matches!(
            manager.begin(BrokerId::new(0)),
            Err(Error::DurabilityLost(_))
        ));
    }

    #[test]
    fn test_checkpoint_io_failure_is_fatal() {
        let dir = tempdir().unwrap();
        let (manager, _store) = open(&dir, config());

        manager.wal().fail_next_syncs(1);
        assert!(matches!(manager.checkpoint(), Err(Error::Io(_))));
        assert!(manager.is_failed());
        assert!(matches!(
            manager.checkpoint(),
            Err(Error::DurabilityLost(_))
        ));
    }

    #[test]
    fn test_shutdown_forces_aborts() {
        let dir = tempdir().unwrap();
        let (manager, store) = open(&dir, config());

        let mut tx = manager.begin(BrokerId::new(3)).unwrap();
        write(&mut tx, &store, "a=1");

        let forced = manager.shutdown();
        assert_eq!(forced, vec![tx.id()]);
        assert!(manager.shutdown().is_empty());
        assert!(matches!(
            manager.begin(BrokerId::new(0)),
            Err(Error::ShutdownInProgress)
        ));

        // The handle learns its fate on next use
        assert!(matches!(tx.commit(), Err(Error::ShutdownInProgress)));
        assert_eq!(tx.state(), TxnState::Aborted);
        assert_eq!(manager.stats().forced_aborts.load(Ordering::Relaxed), 1);
        assert_eq!(manager.stats().aborted.load(Ordering::Relaxed), 1);
        assert_eq!(store.discarded.lock().as_slice(), &[tx.id()]);
    }

    #[test]
    fn test_active_transactions_snapshot() {
        let dir = tempdir().unwrap();
        let (manager, store) = open(&dir, config());

        let mut tx = manager.begin(BrokerId::new(4)).unwrap();
        let lsn = write(&mut tx, &store, "a=1");

        let infos = manager.active_transactions();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].id, tx.id());
        assert_eq!(infos[0].broker, BrokerId::new(4));
        assert_eq!(infos[0].state, TxnState::Active);
        assert_eq!(infos[0].first_lsn, Some(lsn));
        assert_eq!(infos[0].last_lsn, Some(lsn));
    }

    #[test]
    fn test_concurrent_commits() {
        let dir = tempdir().unwrap();
        let (manager, _store) = open(&dir, config());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let manager = Arc::clone(&manager);
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        let mut tx = manager.begin(BrokerId::new(i)).unwrap();
                        tx.append(Bytes::from_static(b"k=v")).unwrap();
                        tx.commit().unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // 8 threads x 25 transactions x (operation + commit)
        assert_eq!(manager.wal().last_lsn(), Lsn::new(400));
        assert_eq!(manager.stats().committed.load(Ordering::Relaxed), 200);
    }
}
