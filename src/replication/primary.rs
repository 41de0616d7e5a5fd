//! Primary-side replication state: per-backup progress, pending writes
//! awaiting quorum, and piggybacked producer metadata.

use crate::constants::*;
use crate::error::Result;
use crate::replication::messages::{SessionMeta, WriteResponse};
use crate::types::{LogIndex, MemberId, Term};
use crossbeam_channel::Sender;
use indexmap::IndexMap;
use std::collections::BTreeMap;
use std::time::Instant;

/// Catch-up stage of one backup within the current term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
  /// Probe sent, tail position unknown.
  Probing,
  /// Streaming entries toward the primary's tail.
  CatchingUp,
  /// At the tail; steady-state replication.
  Ready,
  /// Needs records below the compaction floor; cannot be caught up by
  /// streaming.
  Stalled,
}

/// One in-flight `Replicate` batch.
#[derive(Debug, Clone, Copy)]
pub struct Outstanding {
  pub upto: LogIndex,
  pub sent_at: Instant,
}

#[derive(Debug)]
pub struct BackupProgress {
  pub stage: SyncStage,
  /// Highest index durably acknowledged by this backup.
  pub acked_index: LogIndex,
  /// Next index to stream.
  pub next_index: LogIndex,
  pub outstanding: Option<Outstanding>,
  pub last_contact: Instant,
  pub backoff_ms: u64,
  pub retry_at: Instant,
}

impl BackupProgress {
  fn new(now: Instant) -> Self {
    Self {
      stage: SyncStage::Probing,
      acked_index: 0,
      next_index: 1,
      outstanding: None,
      last_contact: now,
      backoff_ms: REPLICATE_BACKOFF_MIN_MS,
      retry_at: now,
    }
  }

  pub fn contact(&mut self, now: Instant) {
    self.last_contact = now;
    self.backoff_ms = REPLICATE_BACKOFF_MIN_MS;
    self.retry_at = now;
  }

  pub fn back_off(&mut self, now: Instant) {
    self.retry_at = now + std::time::Duration::from_millis(self.backoff_ms);
    self.backoff_ms = (self.backoff_ms * 2).min(REPLICATE_BACKOFF_MAX_MS);
  }
}

/// A producer write parked until the quorum acknowledges its index.
#[derive(Debug)]
pub struct PendingWrite {
  pub reply: Sender<Result<WriteResponse>>,
  pub quorum_deadline: Instant,
  pub request_deadline: Option<Instant>,
}

#[derive(Debug)]
pub struct PrimaryState {
  pub term: Term,
  /// Writes are refused until a quorum of backups has caught up.
  pub accepting: bool,
  pub backups: IndexMap<MemberId, BackupProgress>,
  pub pending: BTreeMap<LogIndex, PendingWrite>,
  /// Producer metadata for entries not yet committed, keyed by index, so
  /// replication can piggyback it. Pruned on commit advance.
  pub session_meta: BTreeMap<LogIndex, SessionMeta>,
}

impl PrimaryState {
  pub fn new(term: Term, backups: impl IntoIterator<Item = MemberId>, now: Instant) -> Self {
    Self {
      term,
      accepting: false,
      backups: backups
        .into_iter()
        .map(|member| (member, BackupProgress::new(now)))
        .collect(),
      pending: BTreeMap::new(),
      session_meta: BTreeMap::new(),
    }
  }

  /// Required backup acknowledgements, clamped to the backups that exist.
  pub fn effective_required(&self, configured: usize) -> usize {
    configured.min(self.backups.len())
  }

  pub fn ready_count(&self) -> usize {
    self
      .backups
      .values()
      .filter(|progress| matches!(progress.stage, SyncStage::Ready))
      .count()
  }

  /// Greatest index acknowledged by at least `required` backups, clamped to
  /// the primary's `last_index`.
  pub fn quorum_commit(&self, last_index: LogIndex, required: usize) -> LogIndex {
    if required == 0 {
      return last_index;
    }
    let mut acked: Vec<LogIndex> = self
      .backups
      .values()
      .map(|progress| progress.acked_index)
      .collect();
    if acked.len() < required {
      return 0;
    }
    acked.sort_unstable_by(|a, b| b.cmp(a));
    acked[required - 1].min(last_index)
  }

  /// Completes every pending write at or below `commit_index`, returning the
  /// `(index, pending)` pairs for the caller to acknowledge.
  pub fn take_committed(&mut self, commit_index: LogIndex) -> Vec<(LogIndex, PendingWrite)> {
    let mut done = Vec::new();
    while let Some((&index, _)) = self.pending.first_key_value() {
      if index > commit_index {
        break;
      }
      if let Some(pending) = self.pending.remove(&index) {
        done.push((index, pending));
      }
    }
    self.session_meta.retain(|&index, _| index > commit_index);
    done
  }

  /// Fails and drains every pending write; used on step-down and shutdown.
  pub fn take_all_pending(&mut self) -> Vec<(LogIndex, PendingWrite)> {
    std::mem::take(&mut self.pending).into_iter().collect()
  }

  /// Pending writes whose deadline has passed. The returned flag is true
  /// when the request's own deadline fired before the quorum window.
  pub fn take_expired(&mut self, now: Instant) -> Vec<(LogIndex, PendingWrite, bool)> {
    let expired: Vec<LogIndex> = self
      .pending
      .iter()
      .filter(|(_, pending)| {
        now >= pending.quorum_deadline
          || pending
            .request_deadline
            .is_some_and(|deadline| now >= deadline)
      })
      .map(|(&index, _)| index)
      .collect();
    expired
      .into_iter()
      .filter_map(|index| {
        self.pending.remove(&index).map(|pending| {
          let by_request = pending
            .request_deadline
            .is_some_and(|deadline| now >= deadline && deadline < pending.quorum_deadline);
          (index, pending, by_request)
        })
      })
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn state(backups: &[&str]) -> PrimaryState {
    PrimaryState::new(
      3,
      backups.iter().map(|member| member.to_string()),
      Instant::now(),
    )
  }

  #[test]
  fn quorum_commit_takes_kth_largest_ack() {
    let mut primary = state(&["b1", "b2"]);
    primary.backups.get_mut("b1").unwrap().acked_index = 7;
    primary.backups.get_mut("b2").unwrap().acked_index = 4;

    assert_eq!(primary.quorum_commit(10, 0), 10);
    assert_eq!(primary.quorum_commit(10, 1), 7);
    assert_eq!(primary.quorum_commit(10, 2), 4);
    // Clamped to the primary's own tail.
    assert_eq!(primary.quorum_commit(5, 1), 5);
  }

  #[test]
  fn quorum_commit_with_too_few_backups_is_zero() {
    let primary = state(&["b1"]);
    assert_eq!(primary.quorum_commit(10, 2), 0);
  }

  #[test]
  fn take_committed_drains_prefix_only() {
    let mut primary = state(&["b1"]);
    let (tx, _rx) = crossbeam_channel::bounded(1);
    let now = Instant::now();
    for index in [3u64, 4, 5] {
      primary.pending.insert(
        index,
        PendingWrite {
          reply: tx.clone(),
          quorum_deadline: now + std::time::Duration::from_secs(1),
          request_deadline: None,
        },
      );
    }

    let done = primary.take_committed(4);
    assert_eq!(done.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![3, 4]);
    assert_eq!(primary.pending.len(), 1);
  }
}
