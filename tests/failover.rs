//! Primary failover: idempotent producer retry and divergent tail repair.

mod common;

use common::{test_config, wait_until, Cluster, WAIT};
use tidelog::replication::messages::WriteRequest;
use tidelog::{ReplicationRole, TideError};

fn occurrences(log: &[(u64, Vec<u8>)], value: &[u8]) -> usize {
  log.iter().filter(|(_, v)| v == value).count()
}

#[test]
fn retry_after_failover_is_idempotent() {
  // The write commits, but the ack is lost with the dying primary; the
  // retry under the same seq must resolve to the same index.
  let mut cluster = Cluster::start(3, test_config());
  cluster.elect(0);

  let old_primary = cluster.handle(0);
  old_primary.open_session(11, WAIT).expect("open");
  let request = WriteRequest {
    session_id: 11,
    seq: 42,
    value: b"exactly-once".to_vec(),
    ttl_ms: None,
  };
  let first = old_primary.write(request.clone(), WAIT).expect("write");

  // Backups must hold the entry before the primary dies.
  cluster.wait_for_commit(1, first.index);
  cluster.kill(0);
  cluster.elect(1);

  let new_primary = cluster.handle(1);
  new_primary.open_session(11, WAIT).expect("reopen");
  let retry = new_primary.write(request, WAIT).expect("retry");
  assert_eq!(retry.index, first.index);

  cluster.wait_for_commit(1, first.index);
  let log = cluster.committed_log(1);
  assert_eq!(occurrences(&log, b"exactly-once"), 1);
}

#[test]
fn retry_of_unreplicated_write_lands_once() {
  // The entry never left the dying primary; the retry appends it fresh on
  // the new primary, and the final log holds it at exactly one index.
  let config = test_config().commit_timeout_ms(300);
  let mut cluster = Cluster::start(3, config);
  cluster.elect(0);

  let old_primary = cluster.handle(0);
  old_primary.open_session(11, WAIT).expect("open");

  cluster.isolate(0);
  let request = WriteRequest {
    session_id: 11,
    seq: 42,
    value: b"phantom".to_vec(),
    ttl_ms: None,
  };
  let lost = old_primary.write(request.clone(), WAIT);
  assert!(lost.is_err(), "write without a quorum must not be acked");

  cluster.kill(0);
  cluster.elect(1);

  let new_primary = cluster.handle(1);
  new_primary.open_session(11, WAIT).expect("reopen");
  let retry = new_primary.write(request, WAIT).expect("retry");

  cluster.wait_for_commit(1, retry.index);
  let log = cluster.committed_log(1);
  assert_eq!(occurrences(&log, b"phantom"), 1);
}

#[test]
fn divergent_tail_is_truncated_on_rejoin() {
  let config = test_config().commit_timeout_ms(300);
  let cluster = Cluster::start(3, config);
  cluster.elect(0);

  // A committed baseline record everywhere.
  let old_primary = cluster.handle(0);
  old_primary.open_session(3, WAIT).expect("open");
  let base = old_primary
    .write(
      WriteRequest {
        session_id: 3,
        seq: 1,
        value: b"committed".to_vec(),
        ttl_ms: None,
      },
      WAIT,
    )
    .expect("baseline");
  cluster.wait_for_commit(1, base.index);
  cluster.wait_for_commit(2, base.index);

  // Cut the primary off, then let it append an uncommitted record.
  cluster.isolate(0);
  let orphan = old_primary.write(
    WriteRequest {
      session_id: 3,
      seq: 2,
      value: b"orphan".to_vec(),
      ttl_ms: Some(400),
    },
    WAIT,
  );
  assert!(orphan.is_err());
  assert!(wait_until(WAIT, || old_primary
    .status(WAIT)
    .map(|status| status.last_index > status.commit_index)
    .unwrap_or(false)));

  // New term from the surviving majority.
  cluster.elect(1);
  let new_primary = cluster.handle(1);
  new_primary.open_session(4, WAIT).expect("open");
  let replacement = new_primary
    .write(
      WriteRequest {
        session_id: 4,
        seq: 1,
        value: b"replacement".to_vec(),
        ttl_ms: None,
      },
      WAIT,
    )
    .expect("write at new primary");

  // Old primary rejoins; its orphaned tail must be truncated and replaced.
  cluster.heal(0);
  cluster.wait_for_role(0, ReplicationRole::Backup);
  assert!(wait_until(WAIT, || old_primary
    .status(WAIT)
    .map(|status| status.commit_index >= replacement.index)
    .unwrap_or(false)));

  let reference = cluster.committed_log(1);
  assert_eq!(occurrences(&reference, b"committed"), 1);
  assert_eq!(occurrences(&reference, b"replacement"), 1);
  assert_eq!(occurrences(&reference, b"orphan"), 0);
  for i in [0usize, 2] {
    assert_eq!(cluster.committed_log(i), reference, "peer {i} diverges");
  }
}

#[test]
fn stale_primary_writes_are_fenced() {
  let cluster = Cluster::start(3, test_config());
  cluster.elect(0);

  let old_primary = cluster.handle(0);
  old_primary.open_session(6, WAIT).expect("open");

  // A new term elsewhere fences the old primary as soon as it hears of it.
  cluster.elect(1);
  assert!(wait_until(WAIT, || old_primary
    .status(WAIT)
    .map(|status| status.role != ReplicationRole::Primary)
    .unwrap_or(false)));

  let result = old_primary.write(
    WriteRequest {
      session_id: 6,
      seq: 1,
      value: b"fenced".to_vec(),
      ttl_ms: None,
    },
    WAIT,
  );
  assert!(matches!(result, Err(TideError::Unavailable(_))));
}

#[test]
fn producer_retries_transparently_across_failover() {
  let mut cluster = Cluster::start(3, test_config());
  cluster.elect(0);

  let client = cluster.client(21);
  let producer = client.producer();
  producer.append(b"before".as_slice()).expect("append before");

  cluster.kill(0);
  cluster.elect(1);

  // The client rediscovers the new primary and the append still succeeds.
  let index = producer.append(b"after".as_slice()).expect("append after");
  cluster.wait_for_commit(1, index);

  let log = cluster.committed_log(1);
  assert_eq!(occurrences(&log, b"before"), 1);
  assert_eq!(occurrences(&log, b"after"), 1);

  client.close().expect("close client");
}
