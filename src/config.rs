//! Partition configuration.

use crate::constants::*;

/// Synchronization mode for journal writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
  /// fsync on every append
  Always,
  /// fsync on commit advance and segment seal (default)
  OnCommit,
  /// leave flushing to the OS
  Never,
}

/// Replication acknowledgement mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMode {
  /// A write commits once `replication_factor - 1` backups acknowledged it.
  Synchronous,
  /// A write commits immediately after the primary's local append.
  Asynchronous,
}

/// Options controlling one partition instance
#[derive(Debug, Clone)]
pub struct PartitionConfig {
  /// Seal threshold for the active segment (bytes)
  pub max_segment_bytes: u64,
  /// Total size cap triggering size-based compaction (bytes, 0 = unbounded)
  pub max_log_bytes: u64,
  /// Per-segment age cap triggering age-based compaction (None = disabled)
  pub max_log_age_ms: Option<u64>,
  /// Number of peers whose durable copy constitutes a quorum (primary included)
  pub replication_factor: usize,
  /// Synchronous or asynchronous commit rule
  pub replication_mode: ReplicationMode,
  /// Journal fsync policy
  pub sync_mode: SyncMode,
  /// Quorum wait before a synchronous write fails with Unavailable
  pub commit_timeout_ms: u64,
  /// Heartbeat timeout after which a session expires
  pub session_timeout_ms: u64,
  /// Client heartbeat interval
  pub heartbeat_interval_ms: u64,
  /// Session expiry sweep interval
  pub expire_interval_ms: u64,
  /// Quorum-contact loss window before a primary self-demotes
  pub primary_timeout_ms: u64,
  /// Per-backup in-flight unacknowledged byte window
  pub window_bytes: u64,
  /// Bound on one consumer push batch (bytes)
  pub max_push_bytes: u64,
  /// Partition thread timer granularity
  pub tick_interval_ms: u64,
}

impl Default for PartitionConfig {
  fn default() -> Self {
    Self {
      max_segment_bytes: DEFAULT_MAX_SEGMENT_BYTES,
      max_log_bytes: 0,
      max_log_age_ms: None,
      replication_factor: 2,
      replication_mode: ReplicationMode::Synchronous,
      sync_mode: SyncMode::OnCommit,
      commit_timeout_ms: DEFAULT_COMMIT_TIMEOUT_MS,
      session_timeout_ms: DEFAULT_SESSION_TIMEOUT_MS,
      heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
      expire_interval_ms: DEFAULT_EXPIRE_INTERVAL_MS,
      primary_timeout_ms: DEFAULT_PRIMARY_TIMEOUT_MS,
      window_bytes: DEFAULT_WINDOW_BYTES,
      max_push_bytes: DEFAULT_MAX_PUSH_BYTES,
      tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
    }
  }
}

impl PartitionConfig {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn max_segment_bytes(mut self, value: u64) -> Self {
    self.max_segment_bytes = value.max(1);
    self
  }

  pub fn max_log_bytes(mut self, value: u64) -> Self {
    self.max_log_bytes = value;
    self
  }

  pub fn max_log_age_ms(mut self, value: u64) -> Self {
    self.max_log_age_ms = Some(value);
    self
  }

  pub fn replication_factor(mut self, value: usize) -> Self {
    self.replication_factor = value.max(1);
    self
  }

  pub fn replication_mode(mut self, value: ReplicationMode) -> Self {
    self.replication_mode = value;
    self
  }

  pub fn sync_mode(mut self, value: SyncMode) -> Self {
    self.sync_mode = value;
    self
  }

  pub fn commit_timeout_ms(mut self, value: u64) -> Self {
    self.commit_timeout_ms = value;
    self
  }

  pub fn session_timeout_ms(mut self, value: u64) -> Self {
    self.session_timeout_ms = value;
    self
  }

  pub fn heartbeat_interval_ms(mut self, value: u64) -> Self {
    self.heartbeat_interval_ms = value;
    self
  }

  pub fn expire_interval_ms(mut self, value: u64) -> Self {
    self.expire_interval_ms = value;
    self
  }

  pub fn primary_timeout_ms(mut self, value: u64) -> Self {
    self.primary_timeout_ms = value;
    self
  }

  pub fn window_bytes(mut self, value: u64) -> Self {
    self.window_bytes = value.max(1);
    self
  }

  pub fn max_push_bytes(mut self, value: u64) -> Self {
    self.max_push_bytes = value.max(1);
    self
  }

  pub fn tick_interval_ms(mut self, value: u64) -> Self {
    self.tick_interval_ms = value.max(1);
    self
  }

  /// Backup acknowledgements required before an index commits.
  pub fn required_backup_acks(&self) -> usize {
    match self.replication_mode {
      ReplicationMode::Synchronous => self.replication_factor.saturating_sub(1),
      ReplicationMode::Asynchronous => 0,
    }
  }
}
