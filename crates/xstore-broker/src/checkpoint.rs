//! Background checkpointer
//!
//! A dedicated thread takes a checkpoint every interval, or earlier once the
//! log grows past its configured size. It stops when told to through its
//! channel, or for good once the log has failed.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use xstore_common::{Error, Result};
use xstore_storage::TransactionManager;

/// How often the log size is looked at between scheduled checkpoints
const SIZE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Handle to the checkpoint thread; stops it on drop
pub struct Checkpointer {
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Checkpointer {
    /// Spawn the checkpoint thread
    pub fn start(txns: Arc<TransactionManager>, interval: Duration) -> Result<Self> {
        let (stop, stopped) = bounded(1);
        let handle = thread::Builder::new()
            .name("xstore-checkpoint".into())
            .spawn(move || run(&txns, interval, &stopped))?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it to exit
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for Checkpointer {
    fn drop(&mut self) {
        // A full channel or an exited thread both mean it is already stopping
        let _ = self.stop.try_send(());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("checkpoint thread panicked");
            }
        }
    }
}

fn run(txns: &TransactionManager, interval: Duration, stop: &Receiver<()>) {
    info!(?interval, "checkpoint thread started");
    let poll = interval.min(SIZE_POLL_INTERVAL);
    let mut last = Instant::now();

    loop {
        match stop.recv_timeout(poll) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let due = txns.checkpoint_due();
        if last.elapsed() < interval && !due {
            continue;
        }
        last = Instant::now();

        match txns.checkpoint() {
            Ok(low_water) => debug!(low_water = %low_water, oversized = due, "background checkpoint"),
            Err(Error::ShutdownInProgress) => break,
            Err(e) if e.is_fatal() => {
                error!(error = %e, "stopping checkpoints, log is no longer usable");
                break;
            }
            Err(e) => warn!(error = %e, "background checkpoint failed"),
        }
    }

    info!("checkpoint thread stopped");
}
