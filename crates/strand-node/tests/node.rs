//! End-to-end tests for strand-node
//!
//! Single nodes writing, reading, reopening and scavenging, and small
//! clusters where replicas ack positions to move the commit point.

use std::time::Duration;

use strand_core::{ExpectedVersion, LogRecord, StreamMetadata, SystemPayload};
use strand_node::{NewEvent, Node, NodeConfig, NodeError};
use strand_replication::{LeaderState, ReplicationConfig, ReplicationError, ReplicationEvent};
use strand_storage::{CheckpointKind, DbConfig, ScavengeOptions, ScavengeStatus, StorageError};
use tempfile::TempDir;

fn config(dir: &TempDir, cluster_size: usize) -> NodeConfig {
    let config = NodeConfig::with_data_dir(dir.path())
        .with_node_endpoint("a:1112")
        .with_replication(ReplicationConfig::new(cluster_size))
        .with_promotion_timeout(Duration::from_millis(200));
    let db = DbConfig::new(&config.db.path).with_chunk_size(4096);
    config.with_db(db)
}

fn events(count: usize) -> Vec<NewEvent> {
    (0..count)
        .map(|i| NewEvent::json("Written", format!("{{\"n\":{i}}}")))
        .collect()
}

#[tokio::test]
async fn test_write_and_read_stream() {
    let dir = TempDir::new().unwrap();
    let node = Node::open(config(&dir, 1)).await.unwrap();

    let first = node
        .write_events("orders", ExpectedVersion::NoStream, events(3))
        .await
        .unwrap();
    assert_eq!(first.first_event_number, 0);
    assert_eq!(first.last_event_number, 2);
    assert_eq!(first.positions.len(), 3);

    let second = node
        .write_events("orders", ExpectedVersion::Exact(2), events(1))
        .await
        .unwrap();
    assert_eq!(second.first_event_number, 3);
    assert_eq!(node.last_event_number("orders"), 3);

    match node.read_event("orders", 1).await.unwrap() {
        LogRecord::Prepare(prepare) => {
            assert_eq!(prepare.stream_id, "orders");
            assert_eq!(&prepare.data[..], b"{\"n\":1}");
            assert_eq!(prepare.log_position, first.positions[1]);
        }
        other => panic!("unexpected record {other:?}"),
    }
    node.close().await.unwrap();
}

#[tokio::test]
async fn test_wrong_expected_version_rejected() {
    let dir = TempDir::new().unwrap();
    let node = Node::open(config(&dir, 1)).await.unwrap();
    node.write_events("orders", ExpectedVersion::NoStream, events(2))
        .await
        .unwrap();

    let result = node
        .write_events("orders", ExpectedVersion::Exact(0), events(1))
        .await;
    assert!(matches!(
        result,
        Err(NodeError::WrongExpectedVersion { current: 1, expected: 0, .. })
    ));
    let result = node
        .write_events("orders", ExpectedVersion::NoStream, events(1))
        .await;
    assert!(matches!(result, Err(NodeError::WrongExpectedVersion { .. })));
    assert_eq!(node.last_event_number("orders"), 1);
    node.close().await.unwrap();
}

#[tokio::test]
async fn test_deleted_stream_rejects_writes() {
    let dir = TempDir::new().unwrap();
    let node = Node::open(config(&dir, 1)).await.unwrap();
    node.write_events("orders", ExpectedVersion::NoStream, events(2))
        .await
        .unwrap();

    let position = node
        .delete_stream("orders", ExpectedVersion::Any)
        .await
        .unwrap();
    match node.read_at(position).await.unwrap() {
        LogRecord::Prepare(prepare) => assert!(prepare.is_tombstone()),
        other => panic!("unexpected record {other:?}"),
    }

    let result = node
        .write_events("orders", ExpectedVersion::Any, events(1))
        .await;
    assert!(matches!(result, Err(NodeError::StreamDeleted(stream)) if stream == "orders"));
    node.close().await.unwrap();
}

#[tokio::test]
async fn test_rejected_batch_leaves_no_events_behind() {
    let dir = TempDir::new().unwrap();
    {
        let node = Node::open(config(&dir, 1)).await.unwrap();
        let batch = vec![
            NewEvent::json("Small", "{}"),
            NewEvent::new("Big", vec![0u8; 8000]),
        ];
        let result = node
            .write_events("orders", ExpectedVersion::NoStream, batch)
            .await;
        assert!(matches!(
            result,
            Err(NodeError::Storage(StorageError::RecordTooLarge { .. }))
        ));

        let acked = node
            .write_events(
                "orders",
                ExpectedVersion::NoStream,
                vec![NewEvent::json("Acked", "{}")],
            )
            .await
            .unwrap();
        assert_eq!(acked.first_event_number, 0);
        node.close().await.unwrap();
    }

    let node = Node::open(config(&dir, 1)).await.unwrap();
    assert_eq!(node.last_event_number("orders"), 0);
    match node.read_event("orders", 0).await.unwrap() {
        LogRecord::Prepare(prepare) => assert_eq!(prepare.event_type, "Acked"),
        other => panic!("unexpected record {other:?}"),
    }
    node.close().await.unwrap();
}

#[tokio::test]
async fn test_reopen_rebuilds_index() {
    let dir = TempDir::new().unwrap();
    {
        let node = Node::open(config(&dir, 1)).await.unwrap();
        node.write_events("orders", ExpectedVersion::NoStream, events(3))
            .await
            .unwrap();
        node.close().await.unwrap();
    }

    let node = Node::open(config(&dir, 1)).await.unwrap();
    assert_eq!(node.last_event_number("orders"), 2);
    let written = node
        .write_events("orders", ExpectedVersion::Exact(2), events(1))
        .await
        .unwrap();
    assert_eq!(written.first_event_number, 3);
    node.close().await.unwrap();
}

#[tokio::test]
async fn test_single_node_promotion_writes_epoch() {
    let dir = TempDir::new().unwrap();
    let node = Node::open(config(&dir, 1)).await.unwrap();

    let epoch = node.become_leader().await.unwrap();
    assert_eq!(epoch.epoch_number, 0);
    assert_eq!(node.leader_state(), LeaderState::Active);
    assert_eq!(node.checkpoint(CheckpointKind::Epoch), epoch.position);

    match node.read_at(epoch.position).await.unwrap() {
        LogRecord::System(system) => {
            let SystemPayload::Epoch(record) = system.payload;
            assert_eq!(record.epoch_id, epoch.epoch_id);
            assert_eq!(record.prev_epoch_position, -1);
            assert_eq!(record.leader_instance_id, node.instance_id());
        }
        other => panic!("unexpected record {other:?}"),
    }
    node.close().await.unwrap();
}

#[tokio::test]
async fn test_epoch_number_continues_after_restart() {
    let dir = TempDir::new().unwrap();
    let first = {
        let node = Node::open(config(&dir, 1)).await.unwrap();
        let epoch = node.become_leader().await.unwrap();
        node.close().await.unwrap();
        epoch
    };

    let node = Node::open(config(&dir, 1)).await.unwrap();
    let second = node.become_leader().await.unwrap();
    assert_eq!(second.epoch_number, first.epoch_number + 1);
    assert!(second.position > first.position);

    match node.read_at(second.position).await.unwrap() {
        LogRecord::System(system) => {
            let SystemPayload::Epoch(record) = system.payload;
            assert_eq!(record.prev_epoch_position, first.position);
        }
        other => panic!("unexpected record {other:?}"),
    }
    node.close().await.unwrap();
}

#[tokio::test]
async fn test_single_node_commits_own_writes() {
    let dir = TempDir::new().unwrap();
    let node = Node::open(config(&dir, 1)).await.unwrap();
    let mut commits = node.subscribe();
    node.become_leader().await.unwrap();

    let written = node
        .write_events("orders", ExpectedVersion::Any, events(2))
        .await
        .unwrap();
    let committed = node.wait_for_commit(written.end_position).await.unwrap();
    assert!(committed >= written.end_position);
    assert!(node.checkpoint(CheckpointKind::Replication) >= written.end_position);

    let event = tokio::time::timeout(Duration::from_secs(1), commits.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, ReplicationEvent::CommitAdvanced(_)));
    node.close().await.unwrap();
}

#[tokio::test]
async fn test_promotion_times_out_without_replicas() {
    let dir = TempDir::new().unwrap();
    let node = Node::open(config(&dir, 3)).await.unwrap();

    let result = node.become_leader().await;
    assert!(matches!(
        result,
        Err(NodeError::PromotionTimedOut { connected: 1, required: 2 })
    ));
    assert_eq!(node.leader_state(), LeaderState::Idle);
    node.close().await.unwrap();
}

#[tokio::test]
async fn test_promotion_waits_for_replica() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir, 3);
    config.promotion_timeout = Duration::from_secs(5);
    let node = Node::open(config).await.unwrap();

    let (epoch, replica) = tokio::join!(node.become_leader(), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        node.replica_connected("b:1112", true)
    });
    tokio_test::assert_ok!(epoch);
    assert!(node.is_leader());
    assert!(node.replica_ack(replica, 0).is_ok());
    node.close().await.unwrap();
}

#[tokio::test]
async fn test_replica_ack_releases_writer() {
    let dir = TempDir::new().unwrap();
    let node = Node::open(config(&dir, 3)).await.unwrap();
    let b = node.replica_connected("b:1112", true);
    node.become_leader().await.unwrap();

    let written = node
        .write_events("orders", ExpectedVersion::Any, events(1))
        .await
        .unwrap();
    assert!(node.commit_position() < written.end_position);

    let (committed, ack) = tokio::join!(node.wait_for_commit(written.end_position), async {
        node.replica_ack(b, written.end_position)
    });
    assert_eq!(ack.unwrap(), Some(written.end_position));
    assert_eq!(committed.unwrap(), written.end_position);
    assert_eq!(node.commit_position(), written.end_position);
    node.close().await.unwrap();
}

#[tokio::test]
async fn test_commit_notified_once_and_never_retracted() {
    let dir = TempDir::new().unwrap();
    let node = Node::open(config(&dir, 3)).await.unwrap();
    let b = node.replica_connected("b:1112", true);
    node.become_leader().await.unwrap();
    let mut commits = node.subscribe();

    let written = node
        .write_events("orders", ExpectedVersion::NoStream, events(3))
        .await
        .unwrap();
    node.replica_ack(b, written.positions[2]).unwrap();
    node.replica_ack(b, written.end_position).unwrap();
    node.replica_ack(b, written.positions[1]).unwrap();

    let mut advances = Vec::new();
    while let Ok(event) = commits.try_recv() {
        advances.push(event);
    }
    assert_eq!(
        advances,
        vec![
            ReplicationEvent::CommitAdvanced(written.positions[2]),
            ReplicationEvent::CommitAdvanced(written.end_position),
        ]
    );

    node.replica_disconnected(b).unwrap();
    assert_eq!(node.commit_position(), written.end_position);
    node.close().await.unwrap();
}

#[tokio::test]
async fn test_non_promotable_replica_does_not_count() {
    let dir = TempDir::new().unwrap();
    let node = Node::open(config(&dir, 3)).await.unwrap();
    let b = node.replica_connected("b:1112", false);
    assert!(node.become_leader().await.is_err());

    let c = node.replica_connected("c:1112", true);
    node.become_leader().await.unwrap();
    let written = node
        .write_events("orders", ExpectedVersion::Any, events(1))
        .await
        .unwrap();

    node.replica_ack(b, written.end_position).unwrap();
    assert!(node.commit_position() < written.end_position);
    node.replica_ack(c, written.end_position).unwrap();
    assert_eq!(node.commit_position(), written.end_position);
    node.close().await.unwrap();
}

#[tokio::test]
async fn test_step_down_fails_pending_writes() {
    let dir = TempDir::new().unwrap();
    let node = Node::open(config(&dir, 3)).await.unwrap();
    node.replica_connected("b:1112", true);
    node.become_leader().await.unwrap();

    let written = node
        .write_events("orders", ExpectedVersion::Any, events(1))
        .await
        .unwrap();
    let (committed, _) = tokio::join!(node.wait_for_commit(written.end_position), async {
        node.step_down()
    });
    assert!(matches!(
        committed,
        Err(NodeError::Replication(ReplicationError::NotReady(_)))
    ));
    assert_eq!(node.leader_state(), LeaderState::Idle);
    node.close().await.unwrap();
}

#[tokio::test]
async fn test_disconnected_replica_rejected() {
    let dir = TempDir::new().unwrap();
    let node = Node::open(config(&dir, 3)).await.unwrap();
    let b = node.replica_connected("b:1112", true);
    node.replica_disconnected(b).unwrap();

    assert!(matches!(
        node.replica_ack(b, 10),
        Err(NodeError::Replication(ReplicationError::UnknownReplica(_)))
    ));
    assert_eq!(node.replicas().len(), 1);
    node.close().await.unwrap();
}

#[tokio::test]
async fn test_scavenge_applies_stream_metadata() {
    let dir = TempDir::new().unwrap();
    let node = Node::open(config(&dir, 1)).await.unwrap();

    node.write_events("orders", ExpectedVersion::NoStream, events(10))
        .await
        .unwrap();
    node.set_stream_metadata("orders", &StreamMetadata::default().with_max_count(2))
        .await
        .unwrap();
    while node.db().manager().chunk_count() < 3 {
        node.write_events("filler", ExpectedVersion::Any, events(1))
            .await
            .unwrap();
    }

    let scavenge_id = node.start_scavenge(ScavengeOptions::default()).unwrap();
    assert_eq!(
        node.wait_scavenge(&scavenge_id).await.unwrap(),
        ScavengeStatus::Success
    );

    assert!(matches!(
        node.read_event("orders", 0).await,
        Err(NodeError::Storage(StorageError::NotFound(_)))
    ));
    assert!(node.read_event("orders", 9).await.is_ok());

    let history = node.scavenge_history().await;
    assert_eq!(history[0].scavenge_id, scavenge_id);
    assert_eq!(history[0].status, ScavengeStatus::Success);
    assert!(history[0].space_saved > 0);
    node.close().await.unwrap();
}

#[tokio::test]
async fn test_unknown_scavenge_rejected() {
    let dir = TempDir::new().unwrap();
    let node = Node::open(config(&dir, 1)).await.unwrap();
    assert!(matches!(
        node.stop_scavenge("missing"),
        Err(NodeError::Storage(StorageError::UnknownScavenge(_)))
    ));
    node.close().await.unwrap();
}
