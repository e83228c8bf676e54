//! XStore Broker Pool
//!
//! The broker pool is the entry point to a database instance. It owns a
//! fixed set of brokers, hands them out to calling threads (reentrantly, so
//! nested operations on one thread share a broker), and orchestrates
//! startup recovery and shutdown of the transaction and cache managers.
//!
//! ```ignore
//! let pool = BrokerPool::builder(config).with_store(nodes).open()?;
//! let broker = pool.authenticate_and_get(&credentials)?;
//! broker.with_transaction(|tx| broker.apply(tx, &*nodes, op))?;
//! ```

pub mod broker;
pub mod checkpoint;
pub mod pool;

#[cfg(test)]
pub(crate) mod testutil;

// Re-exports
pub use broker::Broker;
pub use checkpoint::Checkpointer;
pub use pool::{BrokerActivity, BrokerGuard, BrokerPool, BrokerPoolBuilder, ShutdownReport};
