//! Cache manager
//!
//! One memory budget is shared by every cache in the process. Each
//! registrant is guaranteed its minimum share and may grow up to its
//! maximum while free budget remains. Rebalancing redistributes the budget
//! toward registrants with higher recent demand; shrinking is done by the
//! registrants themselves when asked to evict, and the manager never takes
//! back memory a registrant still reports as in use.
//!
//! Registrant callbacks are always invoked with the manager lock released,
//! so a registrant may call back into the manager from inside them.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};
use xstore_common::config::CacheConfig;
use xstore_common::{Error, Result};

/// Eviction targets under pressure are this fraction of the pressure line
const RELIEF_FACTOR: f64 = 0.75;

/// A cache that takes part in budget arbitration
pub trait CacheRegistrant: Send + Sync {
    /// Bytes the registrant would like to hold
    fn requested_share(&self) -> u64;

    /// Evict down to `target` bytes and return the bytes still in use
    fn eviction_pressure(&self, target: u64) -> u64;
}

/// Ticket returned by [`CacheManager::register`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHandle {
    index: usize,
    name: Arc<str>,
}

impl CacheHandle {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Budget view of one registrant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheShare {
    pub name: String,
    pub min_share: u64,
    pub max_share: u64,
    pub allocation: u64,
    pub usage: u64,
}

/// Cache manager statistics
#[derive(Debug, Default)]
pub struct CacheManagerStats {
    /// Bytes handed out through `request_grow`
    pub granted: AtomicU64,
    /// Growth requests that received less than asked
    pub denied: AtomicU64,
    /// Eviction requests sent to registrants
    pub pressure_events: AtomicU64,
    pub rebalances: AtomicU64,
}

struct Slot {
    name: Arc<str>,
    min_share: u64,
    max_share: u64,
    allocation: u64,
    usage: u64,
    /// Highest usage reported since the last rebalance
    peak_usage: u64,
    registrant: Arc<dyn CacheRegistrant>,
}

impl Slot {
    fn share(&self) -> CacheShare {
        CacheShare {
            name: self.name.to_string(),
            min_share: self.min_share,
            max_share: self.max_share,
            allocation: self.allocation,
            usage: self.usage,
        }
    }
}

struct BudgetState {
    /// Registration order is rebalance order
    slots: Vec<Slot>,
    halted: bool,
}

impl BudgetState {
    fn allocated(&self) -> u64 {
        self.slots.iter().map(|s| s.allocation).sum()
    }

    fn slot_mut(&mut self, handle: &CacheHandle) -> Result<&mut Slot> {
        self.slots
            .get_mut(handle.index)
            .filter(|s| s.name == handle.name)
            .ok_or_else(|| Error::UnknownRegistrant(handle.name.to_string()))
    }
}

/// Share bounds and demand fed to the allocator
#[derive(Debug, Clone, Copy)]
struct ShareSpec {
    min: u64,
    max: u64,
    demand: u64,
}

/// Give everyone their minimum, then fill toward each demand in proportion
/// to what is still missing. Budget nobody wants stays free.
fn compute_shares(total: u64, specs: &[ShareSpec]) -> Vec<u64> {
    let mut shares: Vec<u64> = specs.iter().map(|s| s.min).collect();
    let mut remaining = total.saturating_sub(shares.iter().sum());

    loop {
        let wants: Vec<u64> = specs
            .iter()
            .zip(&shares)
            .map(|(s, &current)| s.demand.min(s.max).saturating_sub(current))
            .collect();
        let total_want: u64 = wants.iter().sum();
        if total_want == 0 || remaining == 0 {
            break;
        }
        if total_want <= remaining {
            for (share, want) in shares.iter_mut().zip(&wants) {
                *share += want;
            }
            break;
        }

        let mut granted = 0;
        for (share, want) in shares.iter_mut().zip(&wants) {
            let portion =
                (u128::from(*want) * u128::from(remaining) / u128::from(total_want)) as u64;
            *share += portion;
            granted += portion;
        }
        remaining -= granted;

        // Rounding left everyone at zero; hand out single bytes in order
        if granted == 0 {
            for (share, want) in shares.iter_mut().zip(&wants) {
                if remaining == 0 {
                    break;
                }
                if *want > 0 {
                    *share += 1;
                    remaining -= 1;
                }
            }
        }
    }

    shares
}

/// Arbitrates the shared cache budget
pub struct CacheManager {
    total_budget: u64,
    pressure_threshold: f64,
    state: Mutex<BudgetState>,
    stats: CacheManagerStats,
}

impl CacheManager {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            total_budget: config.total_budget,
            pressure_threshold: config.pressure_threshold,
            state: Mutex::new(BudgetState {
                slots: Vec::new(),
                halted: false,
            }),
            stats: CacheManagerStats::default(),
        }
    }

    /// Register a cache and reserve its minimum share
    pub fn register(
        &self,
        name: &str,
        min_share: u64,
        max_share: u64,
        registrant: Arc<dyn CacheRegistrant>,
    ) -> Result<CacheHandle> {
        if min_share > max_share {
            return Err(Error::configuration(format!(
                "cache {name}: min share {min_share} exceeds max share {max_share}"
            )));
        }

        let mut state = self.state.lock();
        if state.halted {
            return Err(Error::ShutdownInProgress);
        }
        if state.slots.iter().any(|s| &*s.name == name) {
            return Err(Error::DuplicateRegistrant(name.to_string()));
        }

        let available = self.total_budget.saturating_sub(state.allocated());
        if min_share > available {
            return Err(Error::CacheBudgetExceeded {
                requested: min_share,
                available,
            });
        }

        let name: Arc<str> = Arc::from(name);
        let handle = CacheHandle {
            index: state.slots.len(),
            name: Arc::clone(&name),
        };
        state.slots.push(Slot {
            name,
            min_share,
            max_share,
            allocation: min_share,
            usage: 0,
            peak_usage: 0,
            registrant,
        });

        info!(cache = handle.name(), min_share, max_share, "registered cache");
        Ok(handle)
    }

    /// Grant up to `amount` more bytes from free budget, never past the
    /// registrant's max share. Never blocks on other registrants.
    pub fn request_grow(&self, handle: &CacheHandle, amount: u64) -> Result<u64> {
        let mut state = self.state.lock();
        if state.halted {
            return Ok(0);
        }
        let free = self.total_budget.saturating_sub(state.allocated());

        let slot = state.slot_mut(handle)?;
        let headroom = slot.max_share.saturating_sub(slot.allocation);
        let granted = amount.min(free).min(headroom);
        slot.allocation += granted;

        self.stats.granted.fetch_add(granted, Ordering::Relaxed);
        if granted < amount {
            self.stats.denied.fetch_add(1, Ordering::Relaxed);
        }
        debug!(cache = handle.name(), requested = amount, granted, "cache growth");
        Ok(granted)
    }

    /// Record a registrant's usage; asks it to evict once usage passes the
    /// pressure threshold of its allocation.
    pub fn notify_usage(&self, handle: &CacheHandle, usage: u64) -> Result<()> {
        let pressure = {
            let mut state = self.state.lock();
            let threshold = self.pressure_threshold;
            let slot = state.slot_mut(handle)?;
            slot.usage = usage;
            slot.peak_usage = slot.peak_usage.max(usage);

            let line = slot.allocation as f64 * threshold;
            if usage > 0 && usage as f64 > line {
                Some((Arc::clone(&slot.registrant), (line * RELIEF_FACTOR) as u64))
            } else {
                None
            }
        };

        if let Some((registrant, target)) = pressure {
            self.stats.pressure_events.fetch_add(1, Ordering::Relaxed);
            debug!(cache = handle.name(), usage, target, "cache under pressure");
            let remaining = registrant.eviction_pressure(target);
            self.state.lock().slot_mut(handle)?.usage = remaining;
        }
        Ok(())
    }

    /// Redistribute the budget by recent demand and return the new shares.
    pub fn rebalance(&self) -> Vec<CacheShare> {
        let registrants: Vec<Arc<dyn CacheRegistrant>> = {
            let state = self.state.lock();
            if state.halted {
                return Self::snapshot(&state);
            }
            state.slots.iter().map(|s| Arc::clone(&s.registrant)).collect()
        };
        let requested: Vec<u64> = registrants.iter().map(|r| r.requested_share()).collect();

        // Plan, then collect registrants that must shrink first
        let (plan, evictions) = {
            let state = self.state.lock();
            let specs: Vec<ShareSpec> = state
                .slots
                .iter()
                .enumerate()
                .map(|(i, s)| ShareSpec {
                    min: s.min_share,
                    max: s.max_share,
                    demand: s
                        .usage
                        .max(s.peak_usage)
                        .max(requested.get(i).copied().unwrap_or(0)),
                })
                .collect();
            let plan = compute_shares(self.total_budget, &specs);
            let evictions: Vec<(usize, Arc<dyn CacheRegistrant>, u64)> = state
                .slots
                .iter()
                .zip(&plan)
                .enumerate()
                .filter(|(_, (s, target))| s.usage > **target)
                .map(|(i, (s, target))| (i, Arc::clone(&s.registrant), *target))
                .collect();
            (plan, evictions)
        };

        let evicted: Vec<(usize, u64)> = evictions
            .into_iter()
            .map(|(i, registrant, target)| {
                self.stats.pressure_events.fetch_add(1, Ordering::Relaxed);
                (i, registrant.eviction_pressure(target))
            })
            .collect();

        let mut state = self.state.lock();
        for (i, usage) in evicted {
            if let Some(slot) = state.slots.get_mut(i) {
                slot.usage = usage;
            }
        }

        // Shrink first, never below what is still in use
        for (slot, target) in state.slots.iter_mut().zip(&plan) {
            if *target < slot.allocation {
                let floor = slot.usage.max(*target);
                if floor > *target {
                    warn!(
                        cache = &*slot.name,
                        usage = slot.usage,
                        target,
                        "registrant kept more than its new share"
                    );
                }
                slot.allocation = slot.allocation.min(floor);
            }
        }

        // Then grow from what was freed
        let mut free = self.total_budget.saturating_sub(state.allocated());
        for (slot, target) in state.slots.iter_mut().zip(&plan) {
            if *target > slot.allocation {
                let grant = (*target - slot.allocation).min(free);
                slot.allocation += grant;
                free -= grant;
            }
            slot.peak_usage = slot.usage;
        }

        self.stats.rebalances.fetch_add(1, Ordering::Relaxed);
        let shares = Self::snapshot(&state);
        debug!(registrants = shares.len(), free, "cache budget rebalanced");
        shares
    }

    /// Evict every registrant to zero and refuse further growth.
    ///
    /// Only the first call does anything.
    pub fn halt(&self) {
        let registrants: Vec<(usize, Arc<dyn CacheRegistrant>)> = {
            let mut state = self.state.lock();
            if state.halted {
                return;
            }
            state.halted = true;
            state
                .slots
                .iter()
                .enumerate()
                .map(|(i, s)| (i, Arc::clone(&s.registrant)))
                .collect()
        };

        let remaining: Vec<(usize, u64)> = registrants
            .into_iter()
            .map(|(i, registrant)| (i, registrant.eviction_pressure(0)))
            .collect();

        let mut state = self.state.lock();
        for (i, usage) in remaining {
            if let Some(slot) = state.slots.get_mut(i) {
                slot.usage = usage;
                slot.allocation = usage;
            }
        }
        info!(registrants = state.slots.len(), "cache manager halted");
    }

    /// Current share of every registrant, in registration order
    pub fn shares(&self) -> Vec<CacheShare> {
        Self::snapshot(&self.state.lock())
    }

    fn snapshot(state: &BudgetState) -> Vec<CacheShare> {
        state.slots.iter().map(Slot::share).collect()
    }

    /// Bytes currently granted to a registrant
    pub fn allocation(&self, handle: &CacheHandle) -> Result<u64> {
        Ok(self.state.lock().slot_mut(handle)?.allocation)
    }

    pub const fn total_budget(&self) -> u64 {
        self.total_budget
    }

    /// Usage / allocation ratio above which registrants are asked to evict
    pub const fn pressure_threshold(&self) -> f64 {
        self.pressure_threshold
    }

    /// Budget not granted to anyone
    pub fn free(&self) -> u64 {
        self.total_budget
            .saturating_sub(self.state.lock().allocated())
    }

    pub fn is_halted(&self) -> bool {
        self.state.lock().halted
    }

    pub const fn stats(&self) -> &CacheManagerStats {
        &self.stats
    }
}

impl fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheManager")
            .field("total_budget", &self.total_budget)
            .field("free", &self.free())
            .field("registrants", &self.state.lock().slots.len())
            .finish_non_exhaustive()
    }
}
