//! Quorum scenarios for strand-replication
//!
//! Three-node clusters acking positions, dropping out and rejoining, with
//! commit advances flowing through to waiting writers.

use std::sync::Arc;

use strand_replication::{
    LeaderState, LeaderStateMachine, QuorumTracker, ReplicationConfig, ReplicationError,
    ReplicationEvent, WriteCompletion,
};
use tokio::sync::broadcast::error::TryRecvError;

fn three_node_tracker() -> QuorumTracker {
    let tracker = QuorumTracker::new(ReplicationConfig::new(3)).unwrap();
    tracker.set_leading(true);
    tracker
}

#[test]
fn test_all_acked_reaches_quorum() {
    let tracker = three_node_tracker();
    let a = tracker.register_replica("a:1112", true);
    let b = tracker.register_replica("b:1112", true);
    let c = tracker.register_replica("c:1112", true);
    for id in [a, b, c] {
        tracker.ack(id, 4000).unwrap();
    }
    assert_eq!(tracker.compute_quorum_position(), Some(4000));
}

#[test]
fn test_single_ack_is_not_a_quorum() {
    let tracker = three_node_tracker();
    let a = tracker.register_replica("a:1112", true);
    tracker.register_replica("b:1112", true);
    tracker.register_replica("c:1112", true);
    tracker.ack(a, 4000).unwrap();
    assert_eq!(tracker.compute_quorum_position(), None);
    assert_eq!(tracker.published_position(), -1);
}

#[test]
fn test_commit_notification_fires_once_per_increase() {
    let tracker = three_node_tracker();
    let mut events = tracker.subscribe();
    let a = tracker.register_replica("a:1112", true);
    let b = tracker.register_replica("b:1112", true);
    let c = tracker.register_replica("c:1112", true);

    tracker.ack(a, 4000).unwrap();
    tracker.ack(b, 4000).unwrap();
    tracker.ack(c, 4000).unwrap();
    tracker.ack(b, 3000).unwrap();

    assert_eq!(events.try_recv().unwrap(), ReplicationEvent::CommitAdvanced(4000));
    assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
}

#[test]
fn test_disconnect_never_retracts_published_position() {
    let tracker = three_node_tracker();
    let a = tracker.register_replica("a:1112", true);
    let b = tracker.register_replica("b:1112", true);
    tracker.ack(a, 4000).unwrap();
    tracker.ack(b, 4000).unwrap();
    assert_eq!(tracker.published_position(), 4000);

    tracker.disconnect(b).unwrap();
    assert_eq!(tracker.compute_quorum_position(), None);
    assert_eq!(tracker.published_position(), 4000);

    let c = tracker.register_replica("c:1112", true);
    tracker.ack(c, 3500).unwrap();
    assert_eq!(tracker.compute_quorum_position(), Some(3500));
    assert_eq!(tracker.published_position(), 4000);

    tracker.ack(c, 5000).unwrap();
    tracker.ack(a, 5000).unwrap();
    assert_eq!(tracker.published_position(), 5000);
}

#[test]
fn test_acks_from_disconnected_replica_rejected() {
    let tracker = three_node_tracker();
    let a = tracker.register_replica("a:1112", true);
    tracker.disconnect(a).unwrap();
    assert_eq!(
        tracker.ack(a, 100),
        Err(ReplicationError::UnknownReplica(a))
    );
}

#[tokio::test]
async fn test_writers_released_by_quorum() {
    let tracker = Arc::new(three_node_tracker());
    let completion = Arc::new(WriteCompletion::new());
    let runner = {
        let completion = Arc::clone(&completion);
        let events = tracker.subscribe();
        tokio::spawn(async move { completion.run(events).await })
    };

    let a = tracker.register_replica("a:1112", true);
    let b = tracker.register_replica("b:1112", true);
    let early = completion.register(1000);
    let late = completion.register(2000);

    tracker.ack(a, 1500).unwrap();
    tracker.ack(b, 1500).unwrap();
    assert_eq!(early.await.unwrap(), Ok(1500));

    tracker.ack(a, 2000).unwrap();
    tracker.ack(b, 2500).unwrap();
    assert_eq!(late.await.unwrap(), Ok(2000));

    runner.abort();
}

#[tokio::test]
async fn test_leadership_loss_fails_pending_writes() {
    let machine = LeaderStateMachine::new();
    while machine.state() != LeaderState::Active {
        machine.advance().unwrap();
    }
    let completion = WriteCompletion::new();
    let pending = completion.register(100);

    machine.step_down();
    completion.fail_all("leadership lost");
    assert!(matches!(
        pending.await.unwrap(),
        Err(ReplicationError::NotReady(_))
    ));
}
