//! Replication state shared by the node and its background tasks

use std::sync::Arc;
use std::time::{Duration, Instant};

use strand_replication::{
    LeaderState, LeaderStateMachine, QuorumTracker, ReplicaId, ReplicationConfig,
    ReplicationEvent, ReplicationResult, WriteCompletion,
};
use strand_storage::{Checkpoint, ChunkDb, StorageError};
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tracing::{Instrument, Span, debug, error, info, warn};

pub(crate) struct Cluster {
    pub tracker: QuorumTracker,
    pub leader: LeaderStateMachine,
    pub completion: WriteCompletion,
    /// Signalled whenever a replica connects
    pub membership: Notify,
}

impl Cluster {
    pub fn new(config: ReplicationConfig) -> ReplicationResult<Self> {
        Ok(Self {
            tracker: QuorumTracker::new(config)?,
            leader: LeaderStateMachine::new(),
            completion: WriteCompletion::new(),
            membership: Notify::new(),
        })
    }

    /// Leave leadership and fail every write still waiting to commit
    pub fn step_down(&self, reason: &str) {
        let from = self.leader.step_down();
        self.tracker.set_leading(false);
        let failed = self.completion.fail_all(reason);
        if from != LeaderState::Idle {
            warn!(?from, failed, reason, "Leadership lost");
        }
    }

    /// Persist a commit advance, then release the writes it covers
    ///
    /// If the checkpoint cannot be persisted the node steps down, so
    /// waiting writers fail instead of hanging.
    pub async fn commit(&self, replication: &Checkpoint, position: i64) -> bool {
        match persist_commit(replication, position).await {
            Ok(()) => {
                self.completion.commit_advanced(position);
                true
            }
            Err(e) => {
                self.commit_persist_failed(position, &e);
                false
            }
        }
    }

    pub fn commit_persist_failed(&self, position: i64, err: &StorageError) {
        error!(position, error = %err, "Failed to persist replication checkpoint");
        self.step_down("replication checkpoint failure");
    }

    /// Promotable replicas currently connected
    pub fn promotable_count(&self) -> usize {
        self.tracker
            .replicas()
            .iter()
            .filter(|r| r.is_promotable)
            .count()
    }
}

/// Persist commit advances, then release the writes they cover
pub(crate) fn spawn_commit_task(
    cluster: Arc<Cluster>,
    replication: Arc<Checkpoint>,
    mut shutdown: broadcast::Receiver<()>,
    span: Span,
) -> JoinHandle<()> {
    let mut events = cluster.tracker.subscribe();
    tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    event = events.recv() => match event {
                        Ok(ReplicationEvent::CommitAdvanced(position)) => {
                            cluster.commit(&replication, position).await;
                        }
                        Ok(ReplicationEvent::NoQuorum { connected, required }) => {
                            warn!(connected, required, "Stepping down without quorum");
                            cluster.step_down("no quorum");
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Commit notifications lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            debug!("Commit task stopped");
        }
        .instrument(span),
    )
}

async fn persist_commit(replication: &Checkpoint, position: i64) -> Result<(), StorageError> {
    if position > replication.read() {
        replication.write(position)?;
        replication.flush().await?;
    }
    Ok(())
}

/// Periodically refresh this node's own ack, expire silent replicas and
/// check that a quorum is still connected
pub(crate) fn spawn_liveness_task(
    cluster: Arc<Cluster>,
    db: Arc<ChunkDb>,
    self_replica: ReplicaId,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
    span: Span,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = cluster.tracker.ack(self_replica, db.readable_position()) {
                            warn!(error = %e, "Failed to refresh own ack");
                        }
                        for expired in cluster.tracker.expire_silent(Instant::now()) {
                            info!(replica = %expired, "Expired silent replica");
                        }
                        cluster.tracker.check_quorum(Instant::now());
                    }
                }
            }
            debug!("Liveness task stopped");
        }
        .instrument(span),
    )
}
