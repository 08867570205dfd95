//! Replica ack tracking and quorum computation
//!
//! Replicas live in slots of an arena. A [`ReplicaId`] carries the slot's
//! generation, so an id held after its replica disconnected (and the slot
//! was reused) is rejected instead of updating someone else's entry.
//!
//! ## Commit publishing
//!
//! While leading, every increase of the quorum position is published once
//! as [`ReplicationEvent::CommitAdvanced`]. The published position never
//! moves backwards, even when replicas disconnect.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::config::ReplicationConfig;
use crate::error::{ReplicationError, ReplicationResult};

/// Handle to a registered replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaId {
    slot: u32,
    generation: u32,
}

impl ReplicaId {
    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.slot, self.generation)
    }
}

/// Snapshot of one replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaInfo {
    pub id: ReplicaId,
    pub endpoint: String,
    /// Read-only replicas are visible but never count towards quorum
    pub is_promotable: bool,
    /// Highest acknowledged position, if any
    pub acked: Option<i64>,
    pub last_seen: Instant,
}

/// Notifications published by the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationEvent {
    /// The commit position rose to this value
    CommitAdvanced(i64),
    /// Too few promotable replicas for longer than the no-quorum timeout
    NoQuorum { connected: usize, required: usize },
}

struct Slot {
    generation: u32,
    replica: Option<ReplicaInfo>,
}

struct TrackerState {
    slots: Vec<Slot>,
    free: Vec<u32>,
    published: i64,
    leading: bool,
    quorum_lost_at: Option<Instant>,
    no_quorum_reported: bool,
}

impl TrackerState {
    fn get(&self, id: ReplicaId) -> Option<&ReplicaInfo> {
        self.slots
            .get(id.slot as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.replica.as_ref())
    }

    fn get_mut(&mut self, id: ReplicaId) -> Option<&mut ReplicaInfo> {
        self.slots
            .get_mut(id.slot as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.replica.as_mut())
    }

    fn replicas(&self) -> impl Iterator<Item = &ReplicaInfo> {
        self.slots.iter().filter_map(|slot| slot.replica.as_ref())
    }

    fn promotable_count(&self) -> usize {
        self.replicas().filter(|r| r.is_promotable).count()
    }

    fn quorum_position(&self, quorum_size: usize) -> Option<i64> {
        let mut acked: Vec<i64> = self
            .replicas()
            .filter(|r| r.is_promotable)
            .filter_map(|r| r.acked)
            .collect();
        if quorum_size == 0 || acked.len() < quorum_size {
            return None;
        }
        acked.sort_unstable_by(|a, b| b.cmp(a));
        Some(acked[quorum_size - 1])
    }
}

/// Tracks replica acks and publishes commit advances
pub struct QuorumTracker {
    config: ReplicationConfig,
    state: Mutex<TrackerState>,
    events: broadcast::Sender<ReplicationEvent>,
}

impl QuorumTracker {
    pub fn new(config: ReplicationConfig) -> ReplicationResult<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(config.notification_capacity.max(1));
        Ok(Self {
            config,
            state: Mutex::new(TrackerState {
                slots: Vec::new(),
                free: Vec::new(),
                published: -1,
                leading: false,
                quorum_lost_at: None,
                no_quorum_reported: false,
            }),
            events,
        })
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Receive commit advances and no-quorum reports
    pub fn subscribe(&self) -> broadcast::Receiver<ReplicationEvent> {
        self.events.subscribe()
    }

    /// Add a replica; returns its handle
    #[instrument(skip(self, endpoint), fields(endpoint = %endpoint.as_ref()))]
    pub fn register_replica(&self, endpoint: impl AsRef<str>, is_promotable: bool) -> ReplicaId {
        let mut state = self.state.lock();
        let slot = match state.free.pop() {
            Some(slot) => slot,
            None => {
                state.slots.push(Slot {
                    generation: 0,
                    replica: None,
                });
                (state.slots.len() - 1) as u32
            }
        };
        let generation = state.slots[slot as usize].generation;
        let id = ReplicaId { slot, generation };
        state.slots[slot as usize].replica = Some(ReplicaInfo {
            id,
            endpoint: endpoint.as_ref().to_string(),
            is_promotable,
            acked: None,
            last_seen: Instant::now(),
        });
        info!(replica = %id, is_promotable, "Replica registered");
        id
    }

    /// Record an ack from a replica
    ///
    /// Acks at or below the replica's previous one are ignored. Returns the
    /// newly published commit position if this ack advanced it.
    pub fn ack(&self, id: ReplicaId, position: i64) -> ReplicationResult<Option<i64>> {
        let mut state = self.state.lock();
        let replica = state
            .get_mut(id)
            .ok_or(ReplicationError::UnknownReplica(id))?;
        replica.last_seen = Instant::now();
        if replica.acked.is_some_and(|acked| position <= acked) {
            debug!(replica = %id, position, "Ignoring stale ack");
            return Ok(None);
        }
        replica.acked = Some(position);
        Ok(self.publish_locked(&mut state))
    }

    /// Drop a replica
    ///
    /// The published commit position is kept; only future advances are
    /// affected.
    pub fn disconnect(&self, id: ReplicaId) -> ReplicationResult<()> {
        let mut state = self.state.lock();
        self.remove_locked(&mut state, id)?;
        info!(replica = %id, "Replica disconnected");
        Ok(())
    }

    fn remove_locked(&self, state: &mut TrackerState, id: ReplicaId) -> ReplicationResult<()> {
        let slot = state
            .slots
            .get_mut(id.slot as usize)
            .filter(|slot| slot.generation == id.generation && slot.replica.is_some())
            .ok_or(ReplicationError::UnknownReplica(id))?;
        slot.replica = None;
        slot.generation = slot.generation.wrapping_add(1);
        state.free.push(id.slot);
        Ok(())
    }

    /// Disconnect every replica not heard from within the ack timeout
    pub fn expire_silent(&self, now: Instant) -> Vec<ReplicaId> {
        let mut state = self.state.lock();
        let timeout = self.config.ack_timeout;
        let silent: Vec<ReplicaId> = state
            .replicas()
            .filter(|r| now.saturating_duration_since(r.last_seen) > timeout)
            .map(|r| r.id)
            .collect();
        for id in &silent {
            if self.remove_locked(&mut state, *id).is_ok() {
                warn!(replica = %id, timeout_ms = timeout.as_millis() as u64, "Replica timed out");
            }
        }
        silent
    }

    /// Highest position acked by at least `quorum_size` promotable replicas
    pub fn compute_quorum_position(&self) -> Option<i64> {
        self.state.lock().quorum_position(self.config.quorum_size)
    }

    /// Last commit position published, `-1` if none
    pub fn published_position(&self) -> i64 {
        self.state.lock().published
    }

    /// Start or stop publishing commit advances
    ///
    /// Starting publishes the current quorum position if it is ahead.
    pub fn set_leading(&self, leading: bool) -> Option<i64> {
        let mut state = self.state.lock();
        state.leading = leading;
        state.quorum_lost_at = None;
        state.no_quorum_reported = false;
        if leading {
            self.publish_locked(&mut state)
        } else {
            None
        }
    }

    pub fn is_leading(&self) -> bool {
        self.state.lock().leading
    }

    fn publish_locked(&self, state: &mut TrackerState) -> Option<i64> {
        if !state.leading {
            return None;
        }
        let position = state.quorum_position(self.config.quorum_size)?;
        if position <= state.published {
            return None;
        }
        state.published = position;
        debug!(position, "Commit position advanced");
        let _ = self.events.send(ReplicationEvent::CommitAdvanced(position));
        Some(position)
    }

    /// Check quorum liveness while leading
    ///
    /// Emits a single `NoQuorum` once quorum has been missing for longer
    /// than the no-quorum timeout; returns whether it fired on this call.
    pub fn check_quorum(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        if !state.leading {
            return false;
        }
        let connected = state.promotable_count();
        let required = self.config.quorum_size;
        if connected >= required {
            if state.no_quorum_reported {
                info!(connected, required, "Quorum restored");
            }
            state.quorum_lost_at = None;
            state.no_quorum_reported = false;
            return false;
        }

        let lost_at = *state.quorum_lost_at.get_or_insert(now);
        if state.no_quorum_reported
            || now.saturating_duration_since(lost_at) < self.config.no_quorum_timeout
        {
            return false;
        }
        state.no_quorum_reported = true;
        warn!(connected, required, "No quorum");
        let _ = self
            .events
            .send(ReplicationEvent::NoQuorum { connected, required });
        true
    }

    /// Whether enough promotable replicas are connected to form a quorum
    pub fn has_quorum_members(&self) -> bool {
        self.state.lock().promotable_count() >= self.config.quorum_size
    }

    pub fn replica(&self, id: ReplicaId) -> Option<ReplicaInfo> {
        self.state.lock().get(id).cloned()
    }

    pub fn replicas(&self) -> Vec<ReplicaInfo> {
        self.state.lock().replicas().cloned().collect()
    }

    pub fn replica_count(&self) -> usize {
        self.state.lock().replicas().count()
    }

    pub fn ack_timeout(&self) -> Duration {
        self.config.ack_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(cluster: usize) -> QuorumTracker {
        QuorumTracker::new(ReplicationConfig::new(cluster)).unwrap()
    }

    #[test]
    fn test_quorum_of_acked_positions() {
        let tracker = tracker(3);
        let a = tracker.register_replica("a", true);
        let b = tracker.register_replica("b", true);
        let c = tracker.register_replica("c", true);
        tracker.ack(a, 300).unwrap();
        assert_eq!(tracker.compute_quorum_position(), None);

        tracker.ack(b, 200).unwrap();
        tracker.ack(c, 100).unwrap();
        assert_eq!(tracker.compute_quorum_position(), Some(200));
    }

    #[test]
    fn test_read_only_replicas_excluded() {
        let tracker = tracker(3);
        let a = tracker.register_replica("a", true);
        let ro = tracker.register_replica("ro", false);
        tracker.ack(a, 500).unwrap();
        tracker.ack(ro, 500).unwrap();
        assert_eq!(tracker.compute_quorum_position(), None);
        assert_eq!(tracker.replica_count(), 2);
    }

    #[test]
    fn test_stale_ack_ignored() {
        let tracker = tracker(1);
        let a = tracker.register_replica("a", true);
        tracker.ack(a, 500).unwrap();
        tracker.ack(a, 400).unwrap();
        tracker.ack(a, 500).unwrap();
        assert_eq!(tracker.replica(a).unwrap().acked, Some(500));
    }

    #[test]
    fn test_stale_id_rejected_after_slot_reuse() {
        let tracker = tracker(3);
        let old = tracker.register_replica("a", true);
        tracker.disconnect(old).unwrap();
        let new = tracker.register_replica("b", true);

        assert_eq!(old.slot(), new.slot());
        assert_ne!(old, new);
        assert_eq!(
            tracker.ack(old, 10),
            Err(ReplicationError::UnknownReplica(old))
        );
        tokio_test::assert_err!(tracker.disconnect(old));
        tokio_test::assert_ok!(tracker.ack(new, 10));
    }

    #[test]
    fn test_nothing_published_until_leading() {
        let tracker = tracker(1);
        let a = tracker.register_replica("a", true);
        assert_eq!(tracker.ack(a, 100).unwrap(), None);
        assert_eq!(tracker.published_position(), -1);
        assert_eq!(tracker.set_leading(true), Some(100));
        assert_eq!(tracker.ack(a, 150).unwrap(), Some(150));
    }

    #[test]
    fn test_expire_silent() {
        let tracker = tracker(3);
        let a = tracker.register_replica("a", true);
        let later = Instant::now() + tracker.ack_timeout() + Duration::from_secs(1);
        assert_eq!(tracker.expire_silent(later), vec![a]);
        assert_eq!(tracker.replica_count(), 0);
    }

    #[test]
    fn test_no_quorum_reported_once() {
        let tracker = tracker(3);
        tracker.register_replica("a", true);
        tracker.set_leading(true);
        let mut events = tracker.subscribe();

        let start = Instant::now();
        assert!(!tracker.check_quorum(start));
        let late = start + tracker.config().no_quorum_timeout + Duration::from_millis(1);
        assert!(tracker.check_quorum(late));
        assert!(!tracker.check_quorum(late + Duration::from_secs(5)));
        assert_eq!(
            events.try_recv().unwrap(),
            ReplicationEvent::NoQuorum {
                connected: 1,
                required: 2
            }
        );
        assert!(events.try_recv().is_err());

        tracker.register_replica("b", true);
        assert!(!tracker.check_quorum(late + Duration::from_secs(6)));
        assert!(tracker.has_quorum_members());
    }
}
