//! # Strand Node
//!
//! A single node of a Strand cluster. Owns the chunk database, the stream
//! index rebuilt from it, the scavenge service and the replication state,
//! and exposes the operations clients and peers use.
//!
//! ## Lifecycle
//!
//! [`Node::open`] recovers the database, replays the log into the stream
//! index, marks interrupted scavenges as failed and starts two background
//! tasks: one persisting commit advances and releasing waiting writers, one
//! sweeping replica liveness. [`Node::close`] stops them and flushes
//! everything.
//!
//! ## Leadership
//!
//! A node starts as a follower. [`Node::become_leader`] writes an epoch
//! record, waits for it to become readable and for enough promotable
//! replicas to connect, then starts publishing commit positions.
//!
//! ## Example
//!
//! ```ignore
//! use strand_node::{NewEvent, Node, NodeConfig};
//! use strand_core::ExpectedVersion;
//!
//! let node = Node::open(NodeConfig::with_data_dir("./data")).await?;
//! node.become_leader().await?;
//! let written = node
//!     .write_events("orders", ExpectedVersion::NoStream, vec![NewEvent::json("Placed", "{}")])
//!     .await?;
//! node.wait_for_commit(written.end_position).await?;
//! ```

mod cluster;
pub mod config;
pub mod error;
mod event;

pub use config::NodeConfig;
pub use error::{NodeError, NodeResult};
pub use event::{NewEvent, WriteResult};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use strand_core::{
    EpochRecord, ExpectedVersion, LogRecord, METADATA_EVENT_TYPE, PrepareRecord, StreamMetadata,
    SystemPayload, SystemRecord, UNSET_POSITION, metastream_of,
};
use strand_logging::NodeContextGuard;
use strand_replication::{
    LeaderEpoch, LeaderState, ReplicaId, ReplicaInfo, ReplicationError, ReplicationEvent,
};
use strand_storage::{
    AppendResult, CheckpointKind, ChunkDb, DELETED_STREAM, ScavengeIndex, ScavengeLog,
    ScavengeOptions, ScavengeRecord, ScavengeService, ScavengeStatus, Scavenger, StorageError,
    StreamIndex,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, instrument, warn};
use uuid::Uuid;

use crate::cluster::{Cluster, spawn_commit_task, spawn_liveness_task};

/// A Strand node
pub struct Node {
    config: NodeConfig,
    db: Arc<ChunkDb>,
    index: Arc<StreamIndex>,
    cluster: Arc<Cluster>,
    scavenges: ScavengeService,
    scavenge_log: Arc<ScavengeLog>,
    /// This node's own slot in the quorum
    self_replica: ReplicaId,
    /// Serializes version checks with the append that follows them
    write_lock: tokio::sync::Mutex<()>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Node {
    /// Open the node's database and start its background tasks
    #[instrument(skip(config), fields(node = %config.node_endpoint))]
    pub async fn open(config: NodeConfig) -> NodeResult<Self> {
        config.validate().map_err(NodeError::Config)?;

        let db = Arc::new(ChunkDb::open(config.db.clone()).await?);
        let index = Arc::new(StreamIndex::new());
        let records = db.read_from(0).await?;
        for record in &records {
            index.apply(record);
        }
        info!(
            records = records.len(),
            streams = index.stream_count(),
            "Rebuilt stream index"
        );

        let scavenge_log = Arc::new(ScavengeLog::open(config.scavenge_log.clone()).await?);
        let interrupted = scavenge_log.initialise(&config.node_endpoint).await?;
        if !interrupted.is_empty() {
            warn!(scavenges = ?interrupted, "Marked interrupted scavenges as failed");
        }
        let scavenger = Scavenger::new(
            Arc::clone(&db),
            Arc::clone(&index) as Arc<dyn ScavengeIndex>,
            Arc::clone(&scavenge_log),
            config.node_endpoint.clone(),
        );

        let cluster = Arc::new(Cluster::new(config.replication.clone())?);
        let self_replica = cluster.tracker.register_replica(&config.node_endpoint, true);
        cluster.tracker.ack(self_replica, db.readable_position())?;

        let span = {
            let _ctx = NodeContextGuard::with_instance_id(
                &config.node_endpoint,
                cluster.leader.instance_id(),
            );
            info_span!("node", endpoint = %config.node_endpoint)
        };
        let (shutdown_tx, _) = broadcast::channel(1);
        let tasks = vec![
            spawn_commit_task(
                Arc::clone(&cluster),
                Arc::clone(&db.checkpoints().replication),
                shutdown_tx.subscribe(),
                span.clone(),
            ),
            spawn_liveness_task(
                Arc::clone(&cluster),
                Arc::clone(&db),
                self_replica,
                config.liveness_interval,
                shutdown_tx.subscribe(),
                span,
            ),
        ];

        info!(
            writer = db.checkpoints().writer.read(),
            instance_id = %cluster.leader.instance_id(),
            "Node opened"
        );
        Ok(Self {
            config,
            db,
            index,
            cluster,
            scavenges: ScavengeService::new(scavenger),
            scavenge_log,
            self_replica,
            write_lock: tokio::sync::Mutex::new(()),
            shutdown_tx,
            tasks: Mutex::new(tasks),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// The underlying chunk database
    pub fn db(&self) -> &Arc<ChunkDb> {
        &self.db
    }

    /// Identifies this process in epoch records
    pub fn instance_id(&self) -> Uuid {
        self.cluster.leader.instance_id()
    }

    pub fn leader_state(&self) -> LeaderState {
        self.cluster.leader.state()
    }

    pub fn is_leader(&self) -> bool {
        self.cluster.leader.is_active()
    }

    fn ensure_open(&self) -> NodeResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NodeError::Closed);
        }
        Ok(())
    }

    // ---- Writes ----

    /// Append raw records
    ///
    /// Positions are stamped by the database; the records are then fed to
    /// the stream index.
    #[instrument(skip(self, records), fields(count = records.len()))]
    pub async fn append(&self, records: Vec<LogRecord>) -> NodeResult<AppendResult> {
        self.ensure_open()?;
        let _write = self.write_lock.lock().await;
        self.append_locked(records).await
    }

    async fn append_locked(&self, mut records: Vec<LogRecord>) -> NodeResult<AppendResult> {
        let result = self.db.append(records.clone()).await?;
        if let Some(&first) = result.positions.first() {
            for (record, &position) in records.iter_mut().zip(&result.positions) {
                record.set_position(position);
                record.set_transaction_position_if_unset(first);
                self.index.apply(record);
            }
        }
        if self.db.config().sync_on_write {
            self.ack_self();
        }
        Ok(result)
    }

    /// Write events to a stream as one implicitly committed transaction
    #[instrument(skip(self, events), fields(count = events.len()))]
    pub async fn write_events(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> NodeResult<WriteResult> {
        self.ensure_open()?;
        let _write = self.write_lock.lock().await;
        let current = self.check_expected(stream, expected)?;
        if events.is_empty() {
            return Ok(WriteResult {
                first_event_number: current + 1,
                last_event_number: current,
                positions: Vec::new(),
                end_position: self.db.checkpoints().writer.read(),
            });
        }

        let count = events.len();
        let records = events
            .into_iter()
            .enumerate()
            .map(|(offset, event)| {
                LogRecord::Prepare(event.into_prepare(stream, current + offset as i64, offset, count))
            })
            .collect();
        let result = self.append_locked(records).await?;
        debug!(stream, first = current + 1, count, "Wrote events");
        Ok(WriteResult {
            first_event_number: current + 1,
            last_event_number: current + count as i64,
            positions: result.positions,
            end_position: result.end_position,
        })
    }

    /// Delete a stream by writing its tombstone
    ///
    /// Returns the tombstone's position. Later writes to the stream fail
    /// with [`NodeError::StreamDeleted`].
    #[instrument(skip(self))]
    pub async fn delete_stream(&self, stream: &str, expected: ExpectedVersion) -> NodeResult<i64> {
        self.ensure_open()?;
        let _write = self.write_lock.lock().await;
        let current = self.check_expected(stream, expected)?;
        let tombstone = PrepareRecord::tombstone(stream, current);
        let result = self.append_locked(vec![tombstone.into()]).await?;
        let position = result
            .positions
            .first()
            .copied()
            .ok_or_else(|| StorageError::io("tombstone append returned no position"))?;
        info!(stream, position, "Stream deleted");
        Ok(position)
    }

    /// Replace a stream's retention rules
    pub async fn set_stream_metadata(
        &self,
        stream: &str,
        metadata: &StreamMetadata,
    ) -> NodeResult<WriteResult> {
        let event = NewEvent::json(METADATA_EVENT_TYPE, metadata.to_json()?);
        self.write_events(&metastream_of(stream), ExpectedVersion::Any, vec![event])
            .await
    }

    fn check_expected(&self, stream: &str, expected: ExpectedVersion) -> NodeResult<i64> {
        let current = self.index.last_event_number(stream);
        if current == DELETED_STREAM {
            return Err(NodeError::StreamDeleted(stream.to_string()));
        }
        if !expected.matches(current) {
            return Err(NodeError::WrongExpectedVersion {
                stream: stream.to_string(),
                expected: expected.as_raw(),
                current,
            });
        }
        Ok(current)
    }

    /// Make appended data durable and readable
    pub async fn flush(&self) -> NodeResult<()> {
        self.ensure_open()?;
        self.db.flush().await?;
        self.ack_self();
        Ok(())
    }

    fn ack_self(&self) {
        let position = self.db.readable_position();
        if let Err(e) = self.cluster.tracker.ack(self.self_replica, position) {
            warn!(position, error = %e, "Failed to record own ack");
        }
    }

    /// Wait until the commit position covers `end_position`
    ///
    /// Fails if this node is not leader or loses leadership first.
    pub async fn wait_for_commit(&self, end_position: i64) -> NodeResult<i64> {
        let state = self.cluster.leader.state();
        if state != LeaderState::Active {
            return Err(NodeError::NotLeader(state));
        }
        let committed = self.cluster.completion.register(end_position);
        Ok(committed.await.map_err(|_| NodeError::Closed)??)
    }

    // ---- Reads ----

    /// Read the record at a log position
    pub async fn read_at(&self, position: i64) -> NodeResult<LogRecord> {
        Ok(self.db.read_at(position).await?)
    }

    /// Read event `event_number` of `stream`
    pub async fn read_event(&self, stream: &str, event_number: i64) -> NodeResult<LogRecord> {
        let position = self
            .index
            .event_position(stream, event_number)
            .ok_or_else(|| StorageError::not_found(format!("{stream}@{event_number}")))?;
        self.read_at(position).await
    }

    /// Last event number of a stream, [`strand_core::NO_STREAM`] if absent
    pub fn last_event_number(&self, stream: &str) -> i64 {
        self.index.last_event_number(stream)
    }

    /// Current value of a checkpoint
    pub fn checkpoint(&self, kind: CheckpointKind) -> i64 {
        self.db.checkpoints().get(kind).read()
    }

    /// Receive commit advances and no-quorum reports
    pub fn subscribe(&self) -> broadcast::Receiver<ReplicationEvent> {
        self.cluster.tracker.subscribe()
    }

    // ---- Scavenging ----

    /// Start a background scavenge and return its id
    pub fn start_scavenge(&self, options: ScavengeOptions) -> NodeResult<String> {
        self.ensure_open()?;
        Ok(self.scavenges.start(options)?)
    }

    /// Ask a running scavenge to stop after the current chunk
    pub fn stop_scavenge(&self, scavenge_id: &str) -> NodeResult<()> {
        Ok(self.scavenges.stop(scavenge_id)?)
    }

    /// Wait for a scavenge to finish
    pub async fn wait_scavenge(&self, scavenge_id: &str) -> NodeResult<ScavengeStatus> {
        Ok(self.scavenges.wait(scavenge_id).await?)
    }

    /// Past and running scavenges, most recent first
    pub async fn scavenge_history(&self) -> Vec<ScavengeRecord> {
        self.scavenge_log.history().await
    }

    // ---- Leadership ----

    /// Promote this node to leader
    ///
    /// On any failure after promotion started the node steps back down.
    #[instrument(skip(self), fields(node = %self.config.node_endpoint))]
    pub async fn become_leader(&self) -> NodeResult<LeaderEpoch> {
        self.ensure_open()?;
        self.cluster.leader.transition(LeaderState::BecomingLeader)?;
        match self.promote().await {
            Ok(epoch) => Ok(epoch),
            Err(e) => {
                warn!(error = %e, "Promotion failed");
                self.cluster.step_down("promotion failed");
                Err(e)
            }
        }
    }

    async fn promote(&self) -> NodeResult<LeaderEpoch> {
        let leader = &self.cluster.leader;

        leader.advance()?;
        let epoch = self.write_epoch().await?;
        leader.set_epoch(epoch)?;

        leader.advance()?;
        self.db.flush().await?;
        let epoch_end = self.db.checkpoints().writer.read();
        let mut chaser = self.db.checkpoints().chaser.subscribe();
        chaser
            .wait_for(|position| *position >= epoch_end)
            .await
            .map_err(|_| NodeError::Closed)?;
        self.ack_self();

        leader.advance()?;
        self.wait_for_quorum_members().await?;

        leader.advance()?;
        self.cluster.tracker.set_leading(true);
        info!(
            epoch = epoch.epoch_number,
            position = epoch.position,
            "Became leader"
        );
        Ok(epoch)
    }

    async fn write_epoch(&self) -> NodeResult<LeaderEpoch> {
        let _write = self.write_lock.lock().await;
        let checkpoints = self.db.checkpoints();
        let prev_epoch_position = checkpoints.epoch.read();
        let epoch_number = if prev_epoch_position == UNSET_POSITION {
            0
        } else {
            match self.db.read_at(prev_epoch_position).await? {
                LogRecord::System(SystemRecord {
                    payload: SystemPayload::Epoch(prev),
                    ..
                }) => prev.epoch_number + 1,
                _ => {
                    return Err(StorageError::corrupt(
                        CheckpointKind::Epoch.file_name(),
                        format!("position {prev_epoch_position} does not hold an epoch record"),
                    )
                    .into());
                }
            }
        };

        let epoch_id = Uuid::new_v4();
        let record = SystemRecord::epoch(EpochRecord {
            epoch_number,
            epoch_id,
            prev_epoch_position,
            leader_instance_id: self.cluster.leader.instance_id(),
        });
        let result = self.append_locked(vec![LogRecord::System(record)]).await?;
        let position = result
            .positions
            .first()
            .copied()
            .ok_or_else(|| StorageError::io("epoch append returned no position"))?;
        checkpoints.epoch.write(position)?;
        checkpoints.epoch.flush().await?;
        debug!(epoch_number, position, "Wrote epoch record");
        Ok(LeaderEpoch {
            epoch_number,
            epoch_id,
            position,
        })
    }

    async fn wait_for_quorum_members(&self) -> NodeResult<()> {
        let deadline = tokio::time::Instant::now() + self.config.promotion_timeout;
        loop {
            let connected = self.cluster.membership.notified();
            if self.cluster.tracker.has_quorum_members() {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, connected).await.is_err() {
                return Err(NodeError::PromotionTimedOut {
                    connected: self.cluster.promotable_count(),
                    required: self.cluster.tracker.config().quorum_size,
                });
            }
        }
    }

    /// Give up leadership; pending commit waits fail
    pub fn step_down(&self) {
        self.cluster.step_down("stepped down");
    }

    // ---- Replica connections ----

    /// Register a connected replica
    pub fn replica_connected(&self, endpoint: &str, is_promotable: bool) -> ReplicaId {
        let id = self.cluster.tracker.register_replica(endpoint, is_promotable);
        self.cluster.membership.notify_waiters();
        id
    }

    /// Record a replica's acknowledged position
    ///
    /// Returns the new commit position if this ack advanced it.
    pub fn replica_ack(&self, replica: ReplicaId, position: i64) -> NodeResult<Option<i64>> {
        Ok(self.cluster.tracker.ack(replica, position)?)
    }

    pub fn replica_disconnected(&self, replica: ReplicaId) -> NodeResult<()> {
        if replica == self.self_replica {
            return Err(ReplicationError::UnknownReplica(replica).into());
        }
        Ok(self.cluster.tracker.disconnect(replica)?)
    }

    /// Connected replicas, this node included
    pub fn replicas(&self) -> Vec<ReplicaInfo> {
        self.cluster.tracker.replicas()
    }

    /// Last commit position published, `-1` if none
    pub fn commit_position(&self) -> i64 {
        self.cluster.tracker.published_position()
    }

    // ---- Shutdown ----

    /// Stop background work, flush and release all files
    #[instrument(skip(self), fields(node = %self.config.node_endpoint))]
    pub async fn close(&self) -> NodeResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(scavenge_id) = self.scavenges.current() {
            if self.scavenges.stop(&scavenge_id).is_ok() {
                let status = self.scavenges.wait(&scavenge_id).await?;
                info!(scavenge_id, ?status, "Scavenge ended for shutdown");
            }
        }

        self.cluster.step_down("node closed");
        let _ = self.shutdown_tx.send(());
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        let _write = self.write_lock.lock().await;
        self.db.close().await?;
        self.scavenge_log.close().await;
        info!("Node closed");
        Ok(())
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}
