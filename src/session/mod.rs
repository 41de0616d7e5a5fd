//! Per-partition session registry: producer dedupe state, consumer cursors,
//! heartbeat expiry, and ordered push to consumer sinks.
//!
//! Sessions are an arena keyed by id; sinks are plain channel senders, so
//! nothing here holds a back-pointer into the transport.

use crate::error::{Result, TideError};
use crate::journal::Journal;
use crate::replication::messages::ConsumerEvent;
use crate::types::{LogIndex, SessionId};
use crossbeam_channel::Sender;
use indexmap::IndexMap;
use log::{debug, info};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct ProducerState {
  last_seq: u64,
  last_index: LogIndex,
}

#[derive(Debug)]
pub struct ConsumerCursor {
  /// Next record the server must deliver.
  next_index: LogIndex,
  /// Live outbound channel, dropped on disconnect. The cursor itself
  /// survives so a reconnect can resume.
  sink: Option<Sender<ConsumerEvent>>,
}

#[derive(Debug)]
struct Session {
  last_heartbeat: Instant,
  producer: Option<ProducerState>,
  consumer: Option<ConsumerCursor>,
}

#[derive(Debug)]
pub struct SessionRegistry {
  sessions: IndexMap<SessionId, Session>,
  session_timeout: Duration,
}

impl SessionRegistry {
  pub fn new(session_timeout: Duration) -> Self {
    Self {
      sessions: IndexMap::new(),
      session_timeout,
    }
  }

  pub fn len(&self) -> usize {
    self.sessions.len()
  }

  pub fn is_empty(&self) -> bool {
    self.sessions.is_empty()
  }

  pub fn contains(&self, session_id: SessionId) -> bool {
    self.sessions.contains_key(&session_id)
  }

  /// Creates the session, or refreshes it if it already exists (reconnect).
  pub fn open(&mut self, session_id: SessionId, now: Instant) {
    let session = self.sessions.entry(session_id).or_insert_with(|| Session {
      last_heartbeat: now,
      producer: None,
      consumer: None,
    });
    session.last_heartbeat = now;
  }

  pub fn close(&mut self, session_id: SessionId) -> bool {
    self.sessions.shift_remove(&session_id).is_some()
  }

  pub fn heartbeat(&mut self, session_id: SessionId, now: Instant) -> Result<()> {
    match self.sessions.get_mut(&session_id) {
      Some(session) => {
        session.last_heartbeat = now;
        Ok(())
      }
      None => Err(TideError::SessionExpired(session_id)),
    }
  }

  /// Returns the previously assigned index when `seq` is a duplicate of a
  /// seen producer sequence number.
  pub fn dedupe(&self, session_id: SessionId, seq: u64) -> Option<LogIndex> {
    self
      .sessions
      .get(&session_id)
      .and_then(|session| session.producer)
      .filter(|producer| seq <= producer.last_seq)
      .map(|producer| producer.last_index)
  }

  /// Records a producer sequence assignment. Creates a shadow session when
  /// the id is unknown, which is how backups learn dedupe state from
  /// piggybacked replication metadata.
  pub fn record_producer(&mut self, session_id: SessionId, seq: u64, index: LogIndex, now: Instant) {
    let session = self.sessions.entry(session_id).or_insert_with(|| Session {
      last_heartbeat: now,
      producer: None,
      consumer: None,
    });
    match &mut session.producer {
      Some(producer) if producer.last_seq >= seq => {}
      slot => {
        *slot = Some(ProducerState {
          last_seq: seq,
          last_index: index,
        });
      }
    }
  }

  /// Registers (or replaces) the session's consumer cursor. Emits
  /// `CompactedSkip` into the sink before any record when the requested
  /// offset was compacted away.
  pub fn consume(
    &mut self,
    session_id: SessionId,
    requested_from: LogIndex,
    first_index: LogIndex,
    sink: Sender<ConsumerEvent>,
  ) -> Result<LogIndex> {
    let session = self
      .sessions
      .get_mut(&session_id)
      .ok_or(TideError::SessionExpired(session_id))?;

    let requested = requested_from.max(1);
    let from = requested.max(first_index);
    if requested < from {
      let _ = sink.send(ConsumerEvent::CompactedSkip { next_index: from });
    }
    session.consumer = Some(ConsumerCursor {
      next_index: from,
      sink: Some(sink),
    });
    Ok(from)
  }

  /// Expires sessions whose heartbeat is older than the timeout. Close
  /// callbacks are the caller's concern; expired ids are returned.
  pub fn sweep(&mut self, now: Instant) -> Vec<SessionId> {
    let timeout = self.session_timeout;
    let expired: Vec<SessionId> = self
      .sessions
      .iter()
      .filter(|(_, session)| now.duration_since(session.last_heartbeat) > timeout)
      .map(|(id, _)| *id)
      .collect();
    for id in &expired {
      self.sessions.shift_remove(id);
      info!("session {id} expired");
    }
    expired
  }

  /// Grants every session a fresh heartbeat, used when a peer becomes
  /// primary and inherits shadow sessions that never heartbeated it.
  pub fn refresh_all(&mut self, now: Instant) {
    for session in self.sessions.values_mut() {
      session.last_heartbeat = now;
    }
  }

  /// Pushes newly committed records, in strict index order, to one session's
  /// consumer. The cursor advances on send; a dead sink detaches but the
  /// cursor position is kept for reconnect.
  pub fn push_session(
    &mut self,
    session_id: SessionId,
    journal: &Journal,
    commit_index: LogIndex,
    max_push_bytes: u64,
  ) -> Result<()> {
    let Some(session) = self.sessions.get_mut(&session_id) else {
      return Ok(());
    };
    let Some(cursor) = &mut session.consumer else {
      return Ok(());
    };
    push_cursor(cursor, journal, commit_index, max_push_bytes)
  }

  /// Pushes newly committed records to every attached consumer.
  pub fn push_all(
    &mut self,
    journal: &Journal,
    commit_index: LogIndex,
    max_push_bytes: u64,
  ) -> Result<()> {
    for session in self.sessions.values_mut() {
      if let Some(cursor) = &mut session.consumer {
        push_cursor(cursor, journal, commit_index, max_push_bytes)?;
      }
    }
    Ok(())
  }
}

fn push_cursor(
  cursor: &mut ConsumerCursor,
  journal: &Journal,
  commit_index: LogIndex,
  max_push_bytes: u64,
) -> Result<()> {
  let Some(sink) = cursor.sink.clone() else {
    return Ok(());
  };
  while cursor.next_index <= commit_index {
    let (records, _) = journal.read(cursor.next_index, max_push_bytes)?;
    let records: Vec<_> = records
      .into_iter()
      .filter(|record| record.index <= commit_index)
      .collect();
    let Some(first) = records.first() else {
      break;
    };

    // A lagging cursor can fall below the compaction floor between pushes;
    // announce the skip before resuming.
    if first.index > cursor.next_index {
      if sink
        .send(ConsumerEvent::CompactedSkip {
          next_index: first.index,
        })
        .is_err()
      {
        debug!("consumer sink disconnected, detaching");
        cursor.sink = None;
        return Ok(());
      }
      cursor.next_index = first.index;
    }

    let next = records.last().map(|record| record.index + 1).unwrap_or(cursor.next_index);
    if sink.send(ConsumerEvent::Records { records }).is_err() {
      debug!("consumer sink disconnected, detaching");
      cursor.sink = None;
      return Ok(());
    }
    cursor.next_index = next;
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::SyncMode;
  use crate::journal::JournalOptions;
  use crossbeam_channel::unbounded;

  fn journal_with(n: usize) -> (tempfile::TempDir, Journal) {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut journal = Journal::open(
      dir.path(),
      JournalOptions {
        max_segment_bytes: 1 << 20,
        max_log_bytes: 0,
        max_log_age_ms: None,
        sync_mode: SyncMode::OnCommit,
      },
    )
    .expect("open");
    for i in 0..n {
      journal.append(format!("v{i}").into_bytes()).expect("append");
    }
    (dir, journal)
  }

  #[test]
  fn expiry_sweep_removes_stale_sessions() {
    let mut registry = SessionRegistry::new(Duration::from_millis(0));
    let now = Instant::now();
    registry.open(7, now);
    assert!(registry.contains(7));

    let expired = registry.sweep(now + Duration::from_millis(5));
    assert_eq!(expired, vec![7]);
    assert!(!registry.contains(7));
    assert!(registry.heartbeat(7, now).is_err());
  }

  #[test]
  fn dedupe_returns_previous_index() {
    let mut registry = SessionRegistry::new(Duration::from_secs(10));
    let now = Instant::now();
    registry.open(1, now);
    registry.record_producer(1, 42, 9, now);

    assert_eq!(registry.dedupe(1, 42), Some(9));
    assert_eq!(registry.dedupe(1, 41), Some(9));
    assert_eq!(registry.dedupe(1, 43), None);
    assert_eq!(registry.dedupe(2, 42), None);
  }

  #[test]
  fn consume_snaps_below_first_index() {
    let mut registry = SessionRegistry::new(Duration::from_secs(10));
    let now = Instant::now();
    registry.open(1, now);

    let (sink, events) = unbounded();
    let from = registry.consume(1, 1, 5, sink).expect("consume");
    assert_eq!(from, 5);
    assert_eq!(
      events.try_recv().expect("skip event"),
      ConsumerEvent::CompactedSkip { next_index: 5 }
    );
  }

  #[test]
  fn push_delivers_in_order_up_to_commit() {
    let (_dir, mut journal) = journal_with(6);
    journal.commit(4).expect("commit");

    let mut registry = SessionRegistry::new(Duration::from_secs(10));
    let now = Instant::now();
    registry.open(1, now);
    let (sink, events) = unbounded();
    registry.consume(1, 1, journal.first_index(), sink).expect("consume");
    registry
      .push_all(&journal, journal.commit_index(), 1 << 20)
      .expect("push");

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
      if let ConsumerEvent::Records { records } = event {
        seen.extend(records.into_iter().map(|record| record.index));
      }
    }
    assert_eq!(seen, vec![1, 2, 3, 4]);

    // Nothing past the commit index leaks out.
    registry
      .push_all(&journal, journal.commit_index(), 1 << 20)
      .expect("push again");
    assert!(events.try_recv().is_err());
  }
}
