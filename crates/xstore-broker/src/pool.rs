//! Broker pool
//!
//! Checkout protocol:
//! - A thread that already holds a broker gets the same broker back with its
//!   depth raised; the first identity stays bound.
//! - Otherwise the caller takes a ticket and waits its turn. Tickets are
//!   served strictly in order, and only the head of the queue may take a
//!   free broker.
//! - Release lowers the depth; at zero the broker is unbound, returned to
//!   the free set and waiters are woken.
//!
//! Shutdown stops new checkouts, waits for outstanding brokers, then halts
//! the transaction manager and the cache manager, in that order.

use crate::broker::{Broker, Owner};
use crate::checkpoint::Checkpointer;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use xstore_auth::{AccountStore, Authenticator, Credentials, Identity};
use xstore_common::{BrokerId, Config, DatabaseId, Error, Lsn, Result, TxnId};
use xstore_storage::{
    CacheManager, CacheShare, RecoveryReport, TransactionManager, TransactionalStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    Draining,
    Stopped,
}

/// Outcome of [`BrokerPool::shutdown`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Brokers still checked out when the timeout expired
    pub outstanding_brokers: Vec<BrokerId>,
    /// Transactions aborted because they were still active
    pub aborted_transactions: Vec<TxnId>,
    pub elapsed: Duration,
}

/// One checked-out broker, for monitoring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerActivity {
    pub broker: BrokerId,
    pub identity: String,
    pub depth: usize,
    pub thread: Option<String>,
}

struct PoolState {
    free: VecDeque<Arc<Broker>>,
    leases: HashMap<ThreadId, Arc<Broker>>,
    /// Tickets of threads waiting for a broker, oldest first
    waiters: VecDeque<u64>,
    next_ticket: u64,
    phase: Phase,
    report: Option<ShutdownReport>,
}

impl PoolState {
    fn leave_queue(&mut self, ticket: u64) {
        self.waiters.retain(|t| *t != ticket);
    }
}

/// Bounded pool of brokers
pub struct BrokerPool {
    id: DatabaseId,
    config: Config,
    brokers: Vec<Arc<Broker>>,
    state: Mutex<PoolState>,
    /// Signalled when a broker is returned or the phase changes
    available: Condvar,
    shutdown_done: Condvar,
    txns: Arc<TransactionManager>,
    caches: Arc<CacheManager>,
    authenticator: Arc<dyn Authenticator>,
    checkpointer: Mutex<Option<Checkpointer>>,
    recovery: RecoveryReport,
}

impl BrokerPool {
    /// Start configuring a pool
    pub fn builder(config: Config) -> BrokerPoolBuilder {
        BrokerPoolBuilder::new(config)
    }

    /// Check out a broker for `identity`, waiting up to the configured timeout
    pub fn acquire(&self, identity: &Identity) -> Result<Arc<Broker>> {
        self.acquire_timeout(identity, self.config.pool.acquire_timeout())
    }

    /// Check out a broker for `identity`, waiting up to `timeout`
    pub fn acquire_timeout(&self, identity: &Identity, timeout: Duration) -> Result<Arc<Broker>> {
        let owner = Owner::current();
        let start = Instant::now();
        let deadline = start.checked_add(timeout);

        let mut state = self.state.lock();
        if state.phase != Phase::Running {
            return Err(Error::ShutdownInProgress);
        }

        if let Some(broker) = state.leases.get(&owner.id) {
            let depth = broker.enter();
            debug!(broker = %broker.id(), depth, "reentrant checkout");
            return Ok(Arc::clone(broker));
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.waiters.push_back(ticket);

        let mut timed_out = false;
        loop {
            if state.phase != Phase::Running {
                state.leave_queue(ticket);
                self.available.notify_all();
                return Err(Error::ShutdownInProgress);
            }

            if state.waiters.front() == Some(&ticket) {
                if let Some(broker) = state.free.pop_front() {
                    state.waiters.pop_front();
                    broker.bind(Arc::new(identity.clone()), owner.clone());
                    state.leases.insert(owner.id, Arc::clone(&broker));

                    // Let the next waiter in line see any remaining broker
                    if !state.free.is_empty() && !state.waiters.is_empty() {
                        self.available.notify_all();
                    }

                    debug!(broker = %broker.id(), identity = identity.name(), "broker checked out");
                    return Ok(broker);
                }
            }

            if timed_out {
                state.leave_queue(ticket);
                self.available.notify_all();
                let waited = start.elapsed();
                warn!(identity = identity.name(), ?waited, "no broker available");
                return Err(Error::PoolExhausted { waited });
            }

            timed_out = match deadline {
                Some(deadline) => self.available.wait_until(&mut state, deadline).timed_out(),
                None => {
                    self.available.wait(&mut state);
                    false
                }
            };
        }
    }

    /// Release one level of the calling thread's checkout
    pub fn release(&self, broker: &Broker) -> Result<()> {
        let thread = thread::current().id();
        let mut state = self.state.lock();

        let Some(held) = state.leases.get(&thread) else {
            error!(broker = %broker.id(), "release by a thread that holds no broker");
            return Err(Error::protocol(format!(
                "{} released by a thread that does not hold it",
                broker.id()
            )));
        };
        if held.id() != broker.id() {
            error!(held = %held.id(), released = %broker.id(), "release of a foreign broker");
            return Err(Error::protocol(format!(
                "thread holds {} but released {}",
                held.id(),
                broker.id()
            )));
        }

        let depth = held.leave();
        if depth > 0 {
            debug!(broker = %broker.id(), depth, "reentrant release");
            return Ok(());
        }

        if let Some(returned) = state.leases.remove(&thread) {
            returned.unbind();
            state.free.push_back(returned);
        }
        self.available.notify_all();
        debug!(broker = %broker.id(), "broker returned to pool");
        Ok(())
    }

    /// Scoped checkout: the broker is released when the guard drops
    pub fn get(&self, identity: &Identity) -> Result<BrokerGuard<'_>> {
        let broker = self.acquire(identity)?;
        Ok(BrokerGuard {
            pool: self,
            broker,
            _not_send: PhantomData,
        })
    }

    /// Scoped checkout for the guest identity
    pub fn get_guest(&self) -> Result<BrokerGuard<'_>> {
        self.get(&Identity::guest())
    }

    /// Scoped checkout for the system identity
    pub fn get_system(&self) -> Result<BrokerGuard<'_>> {
        self.get(&Identity::system())
    }

    /// Verify credentials with the authentication collaborator
    pub fn authenticate(&self, credentials: &Credentials) -> Result<Identity> {
        match self.authenticator.verify(credentials) {
            Ok(identity) => {
                debug!(user = identity.name(), "authenticated");
                Ok(identity)
            }
            Err(e) => {
                warn!(user = %credentials.username, error = %e, "authentication failed");
                Err(Error::Authentication(e.to_string()))
            }
        }
    }

    /// Authenticate, then check out a broker for the resulting identity
    pub fn authenticate_and_get(&self, credentials: &Credentials) -> Result<BrokerGuard<'_>> {
        let identity = self.authenticate(credentials)?;
        self.get(&identity)
    }

    /// Broker held by the calling thread
    pub fn active_broker(&self) -> Option<Arc<Broker>> {
        let thread = thread::current().id();
        self.state.lock().leases.get(&thread).cloned()
    }

    /// Identity bound to the calling thread's broker
    pub fn current_identity(&self) -> Option<Arc<Identity>> {
        self.active_broker().and_then(|b| b.identity())
    }

    /// Number of brokers checked out
    pub fn active_count(&self) -> usize {
        self.state.lock().leases.len()
    }

    /// Number of brokers in the free set
    pub fn available_count(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Every current checkout
    pub fn active_brokers(&self) -> Vec<BrokerActivity> {
        let state = self.state.lock();
        let mut activity: Vec<BrokerActivity> = state
            .leases
            .values()
            .map(|broker| BrokerActivity {
                broker: broker.id(),
                identity: broker
                    .identity()
                    .map(|i| i.name().to_string())
                    .unwrap_or_default(),
                depth: broker.depth(),
                thread: broker.owner().and_then(|o| o.name),
            })
            .collect();
        activity.sort_by_key(|a| a.broker);
        activity
    }

    /// Stop the pool.
    ///
    /// New checkouts fail at once; outstanding brokers get up to `timeout`
    /// to come back. A concurrent second call waits for the first and
    /// returns the same report.
    pub fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        let start = Instant::now();
        let mut state = self.state.lock();
        match state.phase {
            Phase::Running => {
                state.phase = Phase::Draining;
                self.available.notify_all();
            }
            Phase::Draining | Phase::Stopped => {
                while state.report.is_none() {
                    self.shutdown_done.wait(&mut state);
                }
                return state.report.clone().unwrap_or_default();
            }
        }

        info!(database_id = %self.id, active = state.leases.len(), "shutting down broker pool");
        let deadline = start.checked_add(timeout);
        while !state.leases.is_empty() {
            match deadline {
                Some(deadline) => {
                    if self.available.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
                None => self.available.wait(&mut state),
            }
        }
        let mut outstanding: Vec<BrokerId> = state.leases.values().map(|b| b.id()).collect();
        outstanding.sort();
        drop(state);

        if !outstanding.is_empty() {
            warn!(brokers = ?outstanding, "brokers still checked out at shutdown");
        }

        if let Some(checkpointer) = self.checkpointer.lock().take() {
            checkpointer.stop();
        }
        let aborted = self.txns.shutdown();
        self.caches.halt();

        let report = ShutdownReport {
            outstanding_brokers: outstanding,
            aborted_transactions: aborted,
            elapsed: start.elapsed(),
        };

        let mut state = self.state.lock();
        state.phase = Phase::Stopped;
        state.report = Some(report.clone());
        self.shutdown_done.notify_all();
        drop(state);

        info!(
            database_id = %self.id,
            aborted = report.aborted_transactions.len(),
            elapsed = ?report.elapsed,
            "broker pool shut down"
        );
        report
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.lock().phase == Phase::Stopped
    }

    pub const fn id(&self) -> DatabaseId {
        self.id
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Pool size
    pub fn max_brokers(&self) -> usize {
        self.brokers.len()
    }

    pub const fn is_read_only(&self) -> bool {
        self.config.database.read_only
    }

    pub const fn transaction_manager(&self) -> &Arc<TransactionManager> {
        &self.txns
    }

    pub const fn cache_manager(&self) -> &Arc<CacheManager> {
        &self.caches
    }

    /// What recovery found when the pool opened
    pub const fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Low-water LSN of the latest checkpoint
    pub fn checkpoint_lsn(&self) -> Lsn {
        self.txns.checkpoint_lsn()
    }

    pub fn cache_shares(&self) -> Vec<CacheShare> {
        self.caches.shares()
    }
}

impl fmt::Debug for BrokerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerPool")
            .field("id", &self.id)
            .field("max_brokers", &self.brokers.len())
            .field("active", &self.active_count())
            .finish_non_exhaustive()
    }
}

impl Drop for BrokerPool {
    fn drop(&mut self) {
        if self.state.get_mut().phase == Phase::Running {
            self.shutdown(Duration::ZERO);
        }
    }
}

/// A checked-out broker that is released on drop.
///
/// Not `Send`: a checkout belongs to the thread that made it.
pub struct BrokerGuard<'a> {
    pool: &'a BrokerPool,
    broker: Arc<Broker>,
    _not_send: PhantomData<*const ()>,
}

impl BrokerGuard<'_> {
    /// Shared handle to the underlying broker
    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }
}

impl Deref for BrokerGuard<'_> {
    type Target = Broker;

    fn deref(&self) -> &Broker {
        &self.broker
    }
}

impl Drop for BrokerGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.pool.release(&self.broker) {
            error!(broker = %self.broker.id(), error = %e, "failed to release broker");
        }
    }
}

impl fmt::Debug for BrokerGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BrokerGuard").field(&self.broker).finish()
    }
}

/// Opens a broker pool: log, recovery, managers, brokers, checkpointer
pub struct BrokerPoolBuilder {
    config: Config,
    authenticator: Option<Arc<dyn Authenticator>>,
    stores: Vec<Arc<dyn TransactionalStore>>,
}

impl BrokerPoolBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            authenticator: None,
            stores: Vec::new(),
        }
    }

    /// Authentication collaborator, an empty [`AccountStore`] by default
    #[must_use]
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Storage collaborator to register before recovery runs
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn TransactionalStore>) -> Self {
        self.stores.push(store);
        self
    }

    pub fn open(self) -> Result<Arc<BrokerPool>> {
        let config = self.config;
        config.validate()?;

        std::fs::create_dir_all(&config.database.data_dir)?;
        let txns = TransactionManager::open(config.log_path(), config.transaction.clone())?;
        for store in self.stores {
            txns.register_store(store);
        }
        let recovery = txns.recover()?;

        let caches = Arc::new(CacheManager::new(&config.cache));
        let id = DatabaseId::new();
        let read_only = config.database.read_only;

        let brokers: Vec<Arc<Broker>> = (0..config.pool.max_brokers)
            .map(|i| {
                Arc::new(Broker::new(
                    BrokerId::new(i),
                    id,
                    Arc::clone(&txns),
                    Arc::clone(&caches),
                    read_only,
                ))
            })
            .collect();

        let checkpointer = match config.transaction.checkpoint_interval() {
            Some(interval) => Some(Checkpointer::start(Arc::clone(&txns), interval)?),
            None => None,
        };

        info!(
            database_id = %id,
            brokers = brokers.len(),
            data_dir = %config.database.data_dir.display(),
            read_only,
            "broker pool open"
        );

        Ok(Arc::new(BrokerPool {
            id,
            state: Mutex::new(PoolState {
                free: brokers.iter().cloned().collect(),
                leases: HashMap::new(),
                waiters: VecDeque::new(),
                next_ticket: 0,
                phase: Phase::Running,
                report: None,
            }),
            brokers,
            config,
            available: Condvar::new(),
            shutdown_done: Condvar::new(),
            txns,
            caches,
            authenticator: self
                .authenticator
                .unwrap_or_else(|| Arc::new(AccountStore::new())),
            checkpointer: Mutex::new(checkpointer),
            recovery,
        }))
    }
}
