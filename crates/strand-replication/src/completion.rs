//! Write completion
//!
//! Callers register the end position of their write and get a receiver
//! that resolves once the commit position covers it. Consumes the
//! tracker's commit advances.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

use crate::error::{ReplicationError, ReplicationResult};
use crate::tracker::ReplicationEvent;

type Waiter = oneshot::Sender<ReplicationResult<i64>>;

/// Pending writes keyed by end position
pub struct WriteCompletion {
    committed: AtomicI64,
    pending: Mutex<BTreeMap<i64, Vec<Waiter>>>,
}

impl Default for WriteCompletion {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteCompletion {
    pub fn new() -> Self {
        Self {
            committed: AtomicI64::new(-1),
            pending: Mutex::new(BTreeMap::new()),
        }
    }

    /// Wait for `end_position` to commit
    ///
    /// Resolves with the commit position that covered the write.
    pub fn register(&self, end_position: i64) -> oneshot::Receiver<ReplicationResult<i64>> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock();
        let committed = self.committed.load(Ordering::Acquire);
        if end_position <= committed {
            let _ = tx.send(Ok(committed));
        } else {
            pending.entry(end_position).or_default().push(tx);
        }
        rx
    }

    /// Release every write at or below `position`; returns how many
    pub fn commit_advanced(&self, position: i64) -> usize {
        let mut pending = self.pending.lock();
        if self.committed.fetch_max(position, Ordering::AcqRel) >= position {
            return 0;
        }
        let still_pending = pending.split_off(&position.saturating_add(1));
        let released = std::mem::replace(&mut *pending, still_pending);
        drop(pending);

        let mut count = 0;
        for (_, waiters) in released {
            for waiter in waiters {
                let _ = waiter.send(Ok(position));
                count += 1;
            }
        }
        if count > 0 {
            debug!(position, released = count, "Released committed writes");
        }
        count
    }

    /// Fail every pending write, e.g. when leadership is lost
    pub fn fail_all(&self, reason: &str) -> usize {
        let pending = std::mem::take(&mut *self.pending.lock());
        let mut count = 0;
        for (_, waiters) in pending {
            for waiter in waiters {
                let _ = waiter.send(Err(ReplicationError::not_ready(reason)));
                count += 1;
            }
        }
        if count > 0 {
            warn!(failed = count, reason, "Failed pending writes");
        }
        count
    }

    pub fn committed_position(&self) -> i64 {
        self.committed.load(Ordering::Acquire)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().values().map(Vec::len).sum()
    }

    /// Feed commit advances from a tracker subscription until it closes
    pub async fn run(&self, mut events: broadcast::Receiver<ReplicationEvent>) {
        loop {
            match events.recv().await {
                Ok(ReplicationEvent::CommitAdvanced(position)) => {
                    self.commit_advanced(position);
                }
                Ok(ReplicationEvent::NoQuorum { .. }) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Commit notifications lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.fail_all("replication stopped");
                    break;
                }
            }
        }
    }
}
