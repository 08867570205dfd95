//! Leader promotion state machine
//!
//! `Idle -> BecomingLeader -> WritingEpoch -> WaitingForChaser ->
//! WaitingForConditions -> Active`. Any state may step down to `Idle`.
//! The storage side of each step (writing the epoch record, waiting for
//! the chaser) is driven by the caller; this type only enforces the order
//! and publishes the current state.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ReplicationError, ReplicationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LeaderState {
    Idle,
    BecomingLeader,
    WritingEpoch,
    WaitingForChaser,
    WaitingForConditions,
    Active,
}

impl LeaderState {
    /// The state that follows this one during promotion
    pub fn next(self) -> Option<LeaderState> {
        match self {
            LeaderState::Idle => Some(LeaderState::BecomingLeader),
            LeaderState::BecomingLeader => Some(LeaderState::WritingEpoch),
            LeaderState::WritingEpoch => Some(LeaderState::WaitingForChaser),
            LeaderState::WaitingForChaser => Some(LeaderState::WaitingForConditions),
            LeaderState::WaitingForConditions => Some(LeaderState::Active),
            LeaderState::Active => None,
        }
    }

    pub fn can_transition_to(self, to: LeaderState) -> bool {
        to == LeaderState::Idle || self.next() == Some(to)
    }
}

/// Epoch a leader was promoted in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderEpoch {
    pub epoch_number: i64,
    pub epoch_id: Uuid,
    /// Log position of the epoch record
    pub position: i64,
}

struct Inner {
    state: LeaderState,
    epoch: Option<LeaderEpoch>,
}

pub struct LeaderStateMachine {
    instance_id: Uuid,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<LeaderState>,
}

impl Default for LeaderStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaderStateMachine {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(LeaderState::Idle);
        Self {
            instance_id: Uuid::new_v4(),
            inner: Mutex::new(Inner {
                state: LeaderState::Idle,
                epoch: None,
            }),
            state_tx,
        }
    }

    /// Identifies this process in epoch records
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn state(&self) -> LeaderState {
        self.inner.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == LeaderState::Active
    }

    pub fn epoch(&self) -> Option<LeaderEpoch> {
        self.inner.lock().epoch
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<LeaderState> {
        self.state_tx.subscribe()
    }

    /// Move to `to`, failing if the transition is not allowed
    pub fn transition(&self, to: LeaderState) -> ReplicationResult<LeaderState> {
        let mut inner = self.inner.lock();
        let from = inner.state;
        if !from.can_transition_to(to) {
            warn!(?from, ?to, "Rejected leader transition");
            return Err(ReplicationError::IllegalTransition { from, to });
        }
        inner.state = to;
        if to == LeaderState::Idle {
            inner.epoch = None;
        }
        drop(inner);

        info!(?from, ?to, "Leader state changed");
        self.state_tx.send_replace(to);
        Ok(from)
    }

    /// Advance to the next promotion state
    pub fn advance(&self) -> ReplicationResult<LeaderState> {
        let current = self.state();
        let next = current.next().ok_or(ReplicationError::IllegalTransition {
            from: current,
            to: current,
        })?;
        self.transition(next)?;
        Ok(next)
    }

    /// Record the epoch written during `WritingEpoch`
    pub fn set_epoch(&self, epoch: LeaderEpoch) -> ReplicationResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != LeaderState::WritingEpoch {
            return Err(ReplicationError::not_ready(format!(
                "epoch can only be set while writing it, state is {:?}",
                inner.state
            )));
        }
        inner.epoch = Some(epoch);
        Ok(())
    }

    /// Give up leadership from any state
    pub fn step_down(&self) -> LeaderState {
        let mut inner = self.inner.lock();
        let from = inner.state;
        inner.state = LeaderState::Idle;
        inner.epoch = None;
        drop(inner);
        if from != LeaderState::Idle {
            info!(?from, "Stepped down");
            self.state_tx.send_replace(LeaderState::Idle);
        }
        from
    }
}
