//! Produce/consume flows over a three-peer in-process partition.

mod common;

use common::{test_config, wait_until, Cluster, WAIT};
use std::time::Duration;
use tidelog::replication::messages::ConsumerEvent;
use tidelog::ReplicationRole;

#[test]
fn producer_and_consumer_roundtrip() {
  let cluster = Cluster::start(3, test_config());
  cluster.elect(0);

  let writer = cluster.client(1);
  let index = writer
    .producer()
    .append(b"Hello world!".as_slice())
    .expect("append");
  assert!(index >= 1);

  let reader = cluster.client(2);
  let mut consumer = reader.subscribe(1).expect("subscribe");
  let record = consumer.next_record(WAIT).expect("record");
  assert_eq!(record.index, index);
  assert_eq!(record.value, b"Hello world!");

  writer.close().expect("close writer");
  reader.close().expect("close reader");
}

#[test]
fn subscription_from_offset_sees_exactly_that_record() {
  let cluster = Cluster::start(3, test_config());
  cluster.elect(0);

  let writer = cluster.client(1);
  let producer = writer.producer();
  for i in 1..=10u32 {
    let index = producer.append(i.to_string().into_bytes()).expect("append");
    assert_eq!(index, u64::from(i));
  }

  let reader = cluster.client(2);
  let mut consumer = reader.subscribe(10).expect("subscribe at 10");
  let record = consumer.next_record(WAIT).expect("record");
  assert_eq!(record.index, 10);
  assert_eq!(record.value, b"10");

  writer.close().expect("close writer");
  reader.close().expect("close reader");
}

#[test]
fn consumer_rides_the_live_tail_in_order() {
  let cluster = Cluster::start(3, test_config());
  cluster.elect(0);

  let reader = cluster.client(7);
  let mut consumer = reader.subscribe(1).expect("subscribe");

  let writer = cluster.client(8);
  let producer = writer.producer();
  let total = 50u64;
  for i in 0..total {
    producer.append(format!("tail-{i}")).expect("append");
  }

  let mut seen = Vec::new();
  while seen.len() < total as usize {
    match consumer.next_event(WAIT).expect("event") {
      ConsumerEvent::Records { records } => {
        seen.extend(records.into_iter().map(|record| record.index));
      }
      ConsumerEvent::CompactedSkip { .. } => panic!("nothing was compacted"),
    }
  }
  // Strictly increasing, gap-free, no duplicates.
  assert_eq!(seen, (1..=total).collect::<Vec<_>>());

  writer.close().expect("close writer");
  reader.close().expect("close reader");
}

#[test]
fn committed_prefix_agrees_across_peers() {
  let cluster = Cluster::start(3, test_config());
  cluster.elect(0);

  let writer = cluster.client(1);
  let producer = writer.producer();
  for i in 0..20u32 {
    producer.append(format!("agree-{i}")).expect("append");
  }
  writer.close().expect("close writer");

  for i in 0..3 {
    cluster.wait_for_commit(i, 20);
  }
  let reference = cluster.committed_log(0);
  assert_eq!(reference.len(), 20);
  for i in 1..3 {
    assert_eq!(cluster.committed_log(i), reference, "peer {i} diverges");
  }
}

#[test]
fn restart_reproduces_committed_prefix() {
  let mut cluster = Cluster::start(3, test_config());
  cluster.elect(0);

  let writer = cluster.client(1);
  let producer = writer.producer();
  for i in 0..12u32 {
    producer.append(format!("durable-{i}")).expect("append");
  }
  writer.close().expect("close writer");
  cluster.wait_for_commit(0, 12);
  let before = cluster.committed_log(0);

  cluster.restart(0);
  let handle = cluster.handle(0);
  assert!(wait_until(WAIT, || handle
    .status(WAIT)
    .map(|status| status.commit_index == 12)
    .unwrap_or(false)));
  assert_eq!(cluster.committed_log(0), before);

  // The restarted peer rejoins the term as a backup and keeps serving.
  cluster.election.elect(cluster.members[0].clone());
  cluster.wait_for_role(0, ReplicationRole::Primary);
}

#[test]
fn session_expires_without_heartbeats() {
  let config = test_config().session_timeout_ms(150).expire_interval_ms(20);
  let cluster = Cluster::start(3, config);
  cluster.elect(0);

  let handle = cluster.handle(0);
  handle.open_session(99, WAIT).expect("open");
  handle.heartbeat(99, WAIT).expect("heartbeat");

  // Stop heartbeating; the sweeper drops the session.
  assert!(wait_until(Duration::from_secs(3), || handle
    .heartbeat(99, WAIT)
    .is_err()));
}
