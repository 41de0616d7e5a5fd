//! In-process cluster harness shared by the integration tests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tidelog::client::{ClientConfig, ClientSession};
use tidelog::cluster::{Election, LocalNetwork, StaticMembership};
use tidelog::{
  MemberId, Partition, PartitionConfig, PartitionHandle, ReplicationRole, SessionId,
};

pub const WAIT: Duration = Duration::from_secs(5);

pub struct Cluster {
  pub dir: TempDir,
  pub network: Arc<LocalNetwork>,
  pub election: Arc<Election>,
  pub members: Vec<MemberId>,
  pub config: PartitionConfig,
  membership: Arc<StaticMembership>,
  partitions: Vec<Option<Partition>>,
}

impl Cluster {
  pub fn start(n: usize, config: PartitionConfig) -> Self {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().expect("tempdir");
    let network = LocalNetwork::new();
    let election = Election::new();
    let members: Vec<MemberId> = (0..n).map(|i| format!("peer-{i}")).collect();
    let membership = Arc::new(StaticMembership::new(members.clone()));

    let mut cluster = Self {
      dir,
      network,
      election,
      members,
      config,
      membership,
      partitions: Vec::new(),
    };
    for i in 0..n {
      let partition = cluster.spawn(i);
      cluster.network.register(partition.handle());
      cluster.partitions.push(Some(partition));
    }
    cluster
  }

  fn spawn(&self, i: usize) -> Partition {
    Partition::spawn(
      self.members[i].clone(),
      self.dir.path().join(&self.members[i]),
      self.config.clone(),
      self.membership.clone(),
      self.network.clone(),
      self.election.as_ref(),
    )
    .expect("spawn partition")
  }

  pub fn handle(&self, i: usize) -> PartitionHandle {
    self.partitions[i].as_ref().expect("member is down").handle()
  }

  /// Starts the next term with member `i` as primary and waits until it
  /// actually accepts writes.
  pub fn elect(&self, i: usize) {
    self.election.elect(self.members[i].clone());
    let handle = self.handle(i);
    assert!(
      wait_until(WAIT, || handle
        .status(WAIT)
        .map(|status| status.role == ReplicationRole::Primary && status.accepting)
        .unwrap_or(false)),
      "{} never became an accepting primary",
      self.members[i]
    );
  }

  pub fn wait_for_role(&self, i: usize, role: ReplicationRole) {
    let handle = self.handle(i);
    assert!(
      wait_until(WAIT, || handle
        .status(WAIT)
        .map(|status| status.role == role)
        .unwrap_or(false)),
      "{} never reached {role:?}",
      self.members[i]
    );
  }

  pub fn wait_for_commit(&self, i: usize, index: u64) {
    let handle = self.handle(i);
    assert!(
      wait_until(WAIT, || handle
        .status(WAIT)
        .map(|status| status.commit_index >= index)
        .unwrap_or(false)),
      "{} never committed {index}",
      self.members[i]
    );
  }

  /// Makes member `i` unreachable for peers and clients alike.
  pub fn kill(&mut self, i: usize) {
    self.network.remove(&self.members[i]);
    if let Some(partition) = self.partitions[i].take() {
      let _ = partition.shutdown(WAIT);
    }
  }

  /// Stops member `i` cleanly and restarts it over the same journal dir.
  pub fn restart(&mut self, i: usize) {
    self.network.remove(&self.members[i]);
    if let Some(partition) = self.partitions[i].take() {
      partition.shutdown(WAIT).expect("shutdown");
    }
    let partition = self.spawn(i);
    self.network.register(partition.handle());
    self.partitions[i] = Some(partition);
  }

  /// Severs the peer links between `a` and every other member.
  pub fn isolate(&self, a: usize) {
    self.network.isolate(&self.members[a]);
  }

  pub fn heal(&self, a: usize) {
    self.network.heal(&self.members[a]);
  }

  pub fn client(&self, session_id: SessionId) -> ClientSession {
    ClientSession::connect(
      self.network.clone(),
      self.election.clone(),
      session_id,
      ClientConfig::new()
        .request_timeout_ms(2_000)
        .retry_backoff_ms(10)
        .heartbeat_interval_ms(100),
    )
    .expect("connect client")
  }

  /// Fully committed `(index, value)` pairs as served by member `i`.
  pub fn committed_log(&self, i: usize) -> Vec<(u64, Vec<u8>)> {
    let handle = self.handle(i);
    let response = handle
      .read(
        tidelog::replication::messages::ReadRequest {
          from_index: 1,
          max_bytes: u64::MAX,
        },
        WAIT,
      )
      .expect("read");
    response
      .records
      .into_iter()
      .map(|record| (record.index, record.value))
      .collect()
  }
}

pub fn test_config() -> PartitionConfig {
  PartitionConfig::new()
    .replication_factor(2)
    .tick_interval_ms(2)
    .commit_timeout_ms(2_000)
    .primary_timeout_ms(1_500)
    .session_timeout_ms(30_000)
    .expire_interval_ms(50)
}

pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
  let deadline = Instant::now() + timeout;
  loop {
    if check() {
      return true;
    }
    if Instant::now() >= deadline {
      return false;
    }
    std::thread::sleep(Duration::from_millis(5));
  }
}
