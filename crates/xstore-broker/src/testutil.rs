use parking_lot::Mutex;
use std::path::Path;
use xstore_common::{Config, Lsn, Result, TxnId};
use xstore_storage::TransactionalStore;

/// Store that records every call it receives
#[derive(Default)]
pub struct RecordingStore {
    applied: Mutex<Vec<Lsn>>,
    committed: Mutex<Vec<TxnId>>,
    discarded: Mutex<Vec<TxnId>>,
}

impl RecordingStore {
    pub fn applied(&self) -> Vec<Lsn> {
        self.applied.lock().clone()
    }

    pub fn committed(&self) -> Vec<TxnId> {
        self.committed.lock().clone()
    }

    pub fn discarded(&self) -> Vec<TxnId> {
        self.discarded.lock().clone()
    }
}

impl TransactionalStore for RecordingStore {
    fn name(&self) -> &str {
        "recording"
    }

    fn apply_under_transaction(&self, _txn: TxnId, lsn: Lsn, _op: &[u8]) -> Result<()> {
        self.applied.lock().push(lsn);
        Ok(())
    }

    fn committed(&self, txn: TxnId) {
        self.committed.lock().push(txn);
    }

    fn discard(&self, txn: TxnId) {
        self.discarded.lock().push(txn);
    }
}

/// Pool configuration rooted at `dir`, background checkpoints off
pub fn test_config(dir: &Path, brokers: usize) -> Config {
    let mut config = Config::default();
    config.database.data_dir = dir.to_path_buf();
    config.pool.max_brokers = brokers;
    config.pool.acquire_timeout_ms = 5_000;
    config.transaction.checkpoint_interval_secs = 0;
    config
}
