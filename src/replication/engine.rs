//! The partition engine: one thread per partition serialising journal
//! mutation, role transitions, commit advances, and session updates.
//!
//! Roles are a tagged variant replaced atomically on the partition thread.
//! Peer messages, client requests, and election observations all arrive
//! through one command queue; timers run on a coarse tick.

use crate::cluster::{ElectionObserver, Membership, PeerTransport};
use crate::config::{PartitionConfig, ReplicationMode, SyncMode};
use crate::constants::*;
use crate::error::{Result, TideError};
use crate::journal::{CompactionOutcome, Journal, JournalOptions, SegmentInfo};
use crate::replication::messages::*;
use crate::replication::primary::{Outstanding, PendingWrite, PrimaryState, SyncStage};
use crate::session::SessionRegistry;
use crate::types::{LogIndex, MemberId, ReplicationRole, SessionId, Term, TermInfo};
use crate::util::time::now_ms;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, trace, warn};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Commands accepted by the partition thread.
#[derive(Debug)]
pub enum Command {
  Open {
    session_id: SessionId,
    reply: Sender<Result<()>>,
  },
  Close {
    session_id: SessionId,
    reply: Sender<Result<()>>,
  },
  Heartbeat {
    session_id: SessionId,
    reply: Sender<Result<()>>,
  },
  Write {
    request: WriteRequest,
    reply: Sender<Result<WriteResponse>>,
  },
  Read {
    request: ReadRequest,
    reply: Sender<Result<ReadResponse>>,
  },
  Consume {
    session_id: SessionId,
    from_index: LogIndex,
    sink: Sender<ConsumerEvent>,
    reply: Sender<Result<()>>,
  },
  Peer(PeerMessage),
  Election(TermInfo),
  Status(Sender<PartitionStatus>),
  Segments(Sender<Vec<SegmentInfo>>),
  Compact(Sender<Result<CompactionOutcome>>),
  Shutdown(Sender<()>),
}

/// Lag of one backup as seen by the primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupLag {
  pub member: MemberId,
  pub acked_index: LogIndex,
  pub caught_up: bool,
}

/// Introspection snapshot of one partition peer.
#[derive(Debug, Clone)]
pub struct PartitionStatus {
  pub member: MemberId,
  pub role: ReplicationRole,
  pub term: Term,
  /// Primary only: whether writes are currently accepted (quorum caught up).
  pub accepting: bool,
  pub first_index: LogIndex,
  pub last_index: LogIndex,
  pub commit_index: LogIndex,
  pub session_count: usize,
  pub append_attempts: u64,
  pub append_failures: u64,
  pub backups: Vec<BackupLag>,
}

/// Cheap cloneable endpoint for one partition peer.
#[derive(Debug, Clone)]
pub struct PartitionHandle {
  member: MemberId,
  sender: Sender<Command>,
}

impl PartitionHandle {
  pub fn member_id(&self) -> &MemberId {
    &self.member
  }

  fn request<T>(
    &self,
    timeout: Duration,
    build: impl FnOnce(Sender<Result<T>>) -> Command,
  ) -> Result<T> {
    let (tx, rx) = bounded(1);
    self.sender.send(build(tx)).map_err(|_| TideError::Closed)?;
    match rx.recv_timeout(timeout) {
      Ok(result) => result,
      Err(_) => Err(TideError::Timeout),
    }
  }

  pub fn open_session(&self, session_id: SessionId, timeout: Duration) -> Result<()> {
    self.request(timeout, |reply| Command::Open { session_id, reply })
  }

  pub fn close_session(&self, session_id: SessionId, timeout: Duration) -> Result<()> {
    self.request(timeout, |reply| Command::Close { session_id, reply })
  }

  pub fn heartbeat(&self, session_id: SessionId, timeout: Duration) -> Result<()> {
    self.request(timeout, |reply| Command::Heartbeat { session_id, reply })
  }

  pub fn write(&self, request: WriteRequest, timeout: Duration) -> Result<WriteResponse> {
    self.request(timeout, |reply| Command::Write { request, reply })
  }

  pub fn read(&self, request: ReadRequest, timeout: Duration) -> Result<ReadResponse> {
    self.request(timeout, |reply| Command::Read { request, reply })
  }

  pub fn consume(
    &self,
    session_id: SessionId,
    from_index: LogIndex,
    sink: Sender<ConsumerEvent>,
    timeout: Duration,
  ) -> Result<()> {
    self.request(timeout, |reply| Command::Consume {
      session_id,
      from_index,
      sink,
      reply,
    })
  }

  pub fn status(&self, timeout: Duration) -> Result<PartitionStatus> {
    let (tx, rx) = bounded(1);
    self
      .sender
      .send(Command::Status(tx))
      .map_err(|_| TideError::Closed)?;
    rx.recv_timeout(timeout).map_err(|_| TideError::Timeout)
  }

  pub fn segments(&self, timeout: Duration) -> Result<Vec<SegmentInfo>> {
    let (tx, rx) = bounded(1);
    self
      .sender
      .send(Command::Segments(tx))
      .map_err(|_| TideError::Closed)?;
    rx.recv_timeout(timeout).map_err(|_| TideError::Timeout)
  }

  pub fn compact(&self, timeout: Duration) -> Result<CompactionOutcome> {
    self.request(timeout, Command::Compact)
  }

  pub(crate) fn deliver_peer(&self, message: PeerMessage) -> Result<()> {
    self
      .sender
      .send(Command::Peer(message))
      .map_err(|_| TideError::Closed)
  }
}

/// One partition peer: the engine thread plus its endpoint.
#[derive(Debug)]
pub struct Partition {
  handle: PartitionHandle,
  thread: Option<JoinHandle<()>>,
}

impl Partition {
  /// Opens the journal (failing fast on a poisoned or locked directory) and
  /// starts the partition thread. The peer begins with no role and waits
  /// for the election service.
  pub fn spawn(
    member_id: impl Into<MemberId>,
    dir: impl AsRef<Path>,
    config: PartitionConfig,
    membership: Arc<dyn Membership>,
    transport: Arc<dyn PeerTransport>,
    election: &dyn ElectionObserver,
  ) -> Result<Self> {
    let member_id = member_id.into();
    let journal = Journal::open(dir, JournalOptions::from(&config))?;
    let (sender, receiver) = unbounded();

    let observations = election.subscribe();
    {
      let sender = sender.clone();
      thread::Builder::new()
        .name(format!("{member_id}-election"))
        .spawn(move || {
          for info in observations {
            if sender.send(Command::Election(info)).is_err() {
              break;
            }
          }
        })?;
    }

    let session_timeout = Duration::from_millis(config.session_timeout_ms);
    let engine = Engine {
      member_id: member_id.clone(),
      config,
      journal,
      registry: SessionRegistry::new(session_timeout),
      transport,
      membership,
      role: Role::None,
      current_term: 0,
      receiver,
      last_sweep: Instant::now(),
      append_attempts: 0,
      append_failures: 0,
    };
    let thread = thread::Builder::new()
      .name(format!("{member_id}-partition"))
      .spawn(move || engine.run())?;

    Ok(Self {
      handle: PartitionHandle {
        member: member_id,
        sender,
      },
      thread: Some(thread),
    })
  }

  pub fn handle(&self) -> PartitionHandle {
    self.handle.clone()
  }

  pub fn member_id(&self) -> &MemberId {
    self.handle.member_id()
  }

  /// Clean shutdown: stop intake, fail pending writes, fsync and close.
  pub fn shutdown(mut self, timeout: Duration) -> Result<()> {
    let (tx, rx) = bounded(1);
    self
      .handle
      .sender
      .send(Command::Shutdown(tx))
      .map_err(|_| TideError::Closed)?;
    let _ = rx.recv_timeout(timeout);
    if let Some(thread) = self.thread.take() {
      let _ = thread.join();
    }
    Ok(())
  }
}

impl Drop for Partition {
  fn drop(&mut self) {
    if self.thread.is_some() {
      let (tx, _rx) = bounded(1);
      let _ = self.handle.sender.send(Command::Shutdown(tx));
    }
  }
}

// ============================================================================
// Engine internals
// ============================================================================

#[derive(Debug)]
struct BackupState {
  term: Term,
  primary: MemberId,
}

#[derive(Debug)]
enum Role {
  None,
  Backup(BackupState),
  Primary(PrimaryState),
}

struct Engine {
  member_id: MemberId,
  config: PartitionConfig,
  journal: Journal,
  registry: SessionRegistry,
  transport: Arc<dyn PeerTransport>,
  membership: Arc<dyn Membership>,
  role: Role,
  current_term: Term,
  receiver: Receiver<Command>,
  last_sweep: Instant,
  append_attempts: u64,
  append_failures: u64,
}

/// Split borrow of the engine fields a primary-side operation needs.
struct PrimaryCtx<'a> {
  journal: &'a mut Journal,
  registry: &'a mut SessionRegistry,
  transport: &'a dyn PeerTransport,
  me: &'a MemberId,
  config: &'a PartitionConfig,
  state: &'a mut PrimaryState,
}

impl Engine {
  fn run(mut self) {
    info!("partition {} started", self.member_id);
    let tick = Duration::from_millis(self.config.tick_interval_ms);
    loop {
      match self.receiver.recv_timeout(tick) {
        Ok(command) => {
          if !self.handle_command(command) {
            break;
          }
          let mut open = true;
          while let Ok(command) = self.receiver.try_recv() {
            if !self.handle_command(command) {
              open = false;
              break;
            }
          }
          if !open {
            break;
          }
        }
        Err(RecvTimeoutError::Timeout) => {}
        Err(RecvTimeoutError::Disconnected) => break,
      }
      self.tick(Instant::now());
    }
    self.finish();
  }

  fn handle_command(&mut self, command: Command) -> bool {
    match command {
      Command::Open { session_id, reply } => {
        let _ = reply.send(self.on_open(session_id));
      }
      Command::Close { session_id, reply } => {
        self.registry.close(session_id);
        let _ = reply.send(Ok(()));
      }
      Command::Heartbeat { session_id, reply } => {
        let _ = reply.send(self.on_heartbeat(session_id));
      }
      Command::Write { request, reply } => self.on_write(request, reply),
      Command::Read { request, reply } => {
        let _ = reply.send(self.on_read(request));
      }
      Command::Consume {
        session_id,
        from_index,
        sink,
        reply,
      } => self.on_consume(session_id, from_index, sink, reply),
      Command::Peer(message) => self.on_peer(message),
      Command::Election(info) => self.on_election(info),
      Command::Status(reply) => {
        let _ = reply.send(self.status());
      }
      Command::Segments(reply) => {
        let _ = reply.send(self.journal.segments());
      }
      Command::Compact(reply) => {
        let _ = reply.send(self.journal.compact(now_ms()));
      }
      Command::Shutdown(reply) => {
        let _ = reply.send(());
        return false;
      }
    }
    true
  }

  fn finish(mut self) {
    self.demote("shutdown");
    if let Err(error) = self.journal.close() {
      warn!("{}: journal close failed: {error}", self.member_id);
    }
    info!("partition {} stopped", self.member_id);
  }

  // ==========================================================================
  // Role transitions
  // ==========================================================================

  fn on_election(&mut self, info: TermInfo) {
    if info.number < self.current_term {
      return;
    }
    if info.number == self.current_term {
      let already = match &self.role {
        Role::Primary(_) => info.primary == self.member_id,
        Role::Backup(backup) => backup.primary == info.primary,
        Role::None => false,
      };
      if already {
        return;
      }
    }
    self.current_term = info.number;
    if info.primary == self.member_id {
      self.become_primary(info.number, Instant::now());
    } else {
      self.become_backup(info.number, info.primary);
    }
  }

  fn become_primary(&mut self, term: Term, now: Instant) {
    self.demote("new term");
    if self.journal.is_poisoned() {
      warn!(
        "{} elected for term {term} but its journal is poisoned; staying down",
        self.member_id
      );
      return;
    }
    let backups: Vec<MemberId> = self
      .membership
      .peers()
      .into_iter()
      .filter(|member| *member != self.member_id)
      .collect();
    let mut state = PrimaryState::new(term, backups, now);
    let required = state.effective_required(self.config.required_backup_acks());
    state.accepting =
      required == 0 || matches!(self.config.replication_mode, ReplicationMode::Asynchronous);
    info!(
      "{} became primary for term {term} with {} backup(s)",
      self.member_id,
      state.backups.len()
    );
    for member in state.backups.keys() {
      let _ = self.transport.send(
        &self.member_id,
        member,
        PeerMessage::Probe {
          term,
          from: self.member_id.clone(),
        },
      );
    }
    self.role = Role::Primary(state);
    // Inherited shadow sessions never heartbeated this peer; give them a
    // full timeout before the sweeper may expire them.
    self.registry.refresh_all(now);
    self.last_sweep = now;
  }

  fn become_backup(&mut self, term: Term, primary: MemberId) {
    self.demote("new term");
    info!("{} following primary {primary} for term {term}", self.member_id);
    self.role = Role::Backup(BackupState { term, primary });
  }

  fn demote(&mut self, reason: &str) {
    match std::mem::replace(&mut self.role, Role::None) {
      Role::Primary(mut state) => {
        info!(
          "{} stepping down from primary of term {}: {reason}",
          self.member_id, state.term
        );
        for (_, pending) in state.take_all_pending() {
          let _ = pending.reply.send(Err(TideError::Unavailable(format!(
            "primary stepped down: {reason}"
          ))));
        }
      }
      Role::Backup(state) => {
        debug!(
          "{} leaving backup role of term {}: {reason}",
          self.member_id, state.term
        );
      }
      Role::None => {}
    }
  }

  fn with_primary<T>(&mut self, f: impl FnOnce(&mut PrimaryCtx) -> T) -> Option<T> {
    let Role::Primary(state) = &mut self.role else {
      return None;
    };
    let mut ctx = PrimaryCtx {
      journal: &mut self.journal,
      registry: &mut self.registry,
      transport: self.transport.as_ref(),
      me: &self.member_id,
      config: &self.config,
      state,
    };
    Some(f(&mut ctx))
  }

  fn after_primary_op(&mut self, result: Result<()>) {
    if self.journal.is_poisoned() {
      self.demote("journal poisoned by I/O failure");
      return;
    }
    if let Err(error) = result {
      warn!("{}: replication step failed: {error}", self.member_id);
    }
  }

  // ==========================================================================
  // Client requests
  // ==========================================================================

  fn on_open(&mut self, session_id: SessionId) -> Result<()> {
    if !matches!(self.role, Role::Primary(_)) {
      return Err(TideError::Unavailable("not the primary".to_string()));
    }
    self.registry.open(session_id, Instant::now());
    Ok(())
  }

  fn on_heartbeat(&mut self, session_id: SessionId) -> Result<()> {
    if !matches!(self.role, Role::Primary(_)) {
      return Err(TideError::Unavailable("not the primary".to_string()));
    }
    self.registry.heartbeat(session_id, Instant::now())
  }

  fn on_write(&mut self, request: WriteRequest, reply: Sender<Result<WriteResponse>>) {
    let now = Instant::now();
    self.append_attempts += 1;

    let accepting = matches!(&self.role, Role::Primary(state) if state.accepting);
    if !accepting {
      self.append_failures += 1;
      let _ = reply.send(Err(TideError::Unavailable(
        "not an accepting primary".to_string(),
      )));
      return;
    }
    if !self.registry.contains(request.session_id) {
      self.append_failures += 1;
      let _ = reply.send(Err(TideError::SessionExpired(request.session_id)));
      return;
    }
    if let Some(index) = self.registry.dedupe(request.session_id, request.seq) {
      debug!(
        "duplicate write seq {} on session {}, returning index {index}",
        request.seq, request.session_id
      );
      let _ = reply.send(Ok(WriteResponse { index }));
      return;
    }

    let record = match self.journal.append(request.value) {
      Ok(record) => record,
      Err(error) => {
        self.append_failures += 1;
        let _ = reply.send(Err(error));
        self.demote("journal poisoned by I/O failure");
        return;
      }
    };
    self
      .registry
      .record_producer(request.session_id, request.seq, record.index, now);

    let session_id = request.session_id;
    let seq = request.seq;
    let ttl = request.ttl_ms.map(|ms| now + Duration::from_millis(ms));
    let commit_timeout = Duration::from_millis(self.config.commit_timeout_ms);
    let result = self.with_primary(move |ctx| {
      ctx.state.session_meta.insert(
        record.index,
        SessionMeta {
          session_id,
          producer_seq: seq,
        },
      );
      match ctx.config.replication_mode {
        ReplicationMode::Asynchronous => {
          ctx.journal.commit(record.index)?;
          let committed = ctx.journal.commit_index();
          let _ = reply.send(Ok(WriteResponse {
            index: record.index,
          }));
          ctx.finish_commit(committed)?;
          ctx.pump_all(now)
        }
        ReplicationMode::Synchronous => {
          ctx.state.pending.insert(
            record.index,
            PendingWrite {
              reply,
              quorum_deadline: now + commit_timeout,
              request_deadline: ttl,
            },
          );
          ctx.pump_all(now)?;
          ctx.advance_commit()
        }
      }
    });
    if let Some(result) = result {
      self.after_primary_op(result);
    }
  }

  fn on_read(&mut self, request: ReadRequest) -> Result<ReadResponse> {
    let commit = self.journal.commit_index();
    let (records, _) = self.journal.read(request.from_index, request.max_bytes)?;
    let records: Vec<_> = records
      .into_iter()
      .filter(|record| record.index <= commit)
      .collect();
    let next_index = records
      .last()
      .map(|record| record.index + 1)
      .unwrap_or_else(|| {
        request
          .from_index
          .max(self.journal.first_index())
          .min(commit + 1)
      });
    Ok(ReadResponse {
      records,
      next_index,
    })
  }

  fn on_consume(
    &mut self,
    session_id: SessionId,
    from_index: LogIndex,
    sink: Sender<ConsumerEvent>,
    reply: Sender<Result<()>>,
  ) {
    if !matches!(self.role, Role::Primary(_)) {
      let _ = reply.send(Err(TideError::Unavailable("not the primary".to_string())));
      return;
    }
    let first = self.journal.first_index();
    match self.registry.consume(session_id, from_index, first, sink) {
      Ok(_) => {
        // Backfill up to the commit index, then the cursor rides the tail.
        let commit = self.journal.commit_index();
        let result = self.registry.push_session(
          session_id,
          &self.journal,
          commit,
          self.config.max_push_bytes,
        );
        let _ = reply.send(result);
      }
      Err(error) => {
        let _ = reply.send(Err(error));
      }
    }
  }

  // ==========================================================================
  // Peer messages
  // ==========================================================================

  fn on_peer(&mut self, message: PeerMessage) {
    let now = Instant::now();
    let term = message.term();

    if term < self.current_term {
      // Inform the stale sender where the protocol has a reply for it.
      if let PeerMessage::Replicate { from, .. } | PeerMessage::Probe { from, .. } = &message {
        let _ = self.transport.send(
          &self.member_id,
          from,
          PeerMessage::ReplicateReject {
            term: self.current_term,
            from: self.member_id.clone(),
            last_index: self.journal.last_index(),
          },
        );
      }
      debug!(
        "{} dropping message from {}: {}",
        self.member_id,
        message.from(),
        TideError::StaleTerm {
          observed: term,
          current: self.current_term,
        }
      );
      return;
    }

    if term > self.current_term {
      info!(
        "{} observed term {term} above current {}, dropping role",
        self.member_id, self.current_term
      );
      self.demote("higher term observed");
      self.current_term = term;
      if message.is_from_primary() {
        self.become_backup(term, message.from().clone());
      }
    } else if matches!(self.role, Role::None) && message.is_from_primary() {
      // Election news can arrive through the primary first.
      self.become_backup(term, message.from().clone());
    }

    match message {
      PeerMessage::Probe { from, .. } => self.on_probe(from),
      PeerMessage::ProbeAck {
        from,
        last_index,
        commit_index,
        tail_hashes,
        ..
      } => {
        let result =
          self.with_primary(|ctx| ctx.handle_probe_ack(from, last_index, commit_index, tail_hashes, now));
        if let Some(result) = result {
          self.after_primary_op(result);
        }
      }
      PeerMessage::Replicate {
        from,
        prev_index,
        entries,
        commit_index,
        ..
      } => self.on_replicate(from, prev_index, entries, commit_index, now),
      PeerMessage::ReplicateAck {
        from, last_index, ..
      } => {
        let result = self.with_primary(|ctx| ctx.handle_replicate_ack(from, last_index, now));
        if let Some(result) = result {
          self.after_primary_op(result);
        }
      }
      PeerMessage::ReplicateReject {
        from, last_index, ..
      } => {
        let result = self.with_primary(|ctx| ctx.handle_replicate_reject(from, last_index, now));
        if let Some(result) = result {
          self.after_primary_op(result);
        }
      }
      PeerMessage::Truncate {
        from,
        through_index,
        ..
      } => self.on_truncate(from, through_index),
      PeerMessage::TruncateAck {
        from, last_index, ..
      } => {
        let result = self.with_primary(|ctx| ctx.handle_truncate_ack(from, last_index, now));
        if let Some(result) = result {
          self.after_primary_op(result);
        }
      }
      PeerMessage::TruncateReject {
        from, commit_index, ..
      } => {
        let result = self.with_primary(|ctx| ctx.handle_truncate_reject(from, commit_index, now));
        if let Some(result) = result {
          self.after_primary_op(result);
        }
      }
      PeerMessage::Commit { index, .. } => self.on_commit(index),
    }
  }

  fn backup_primary(&self, from: &MemberId) -> Option<MemberId> {
    match &self.role {
      Role::Backup(backup) if backup.primary == *from => Some(backup.primary.clone()),
      Role::Backup(backup) => {
        warn!(
          "{}: message from {from} but the term {} primary is {}",
          self.member_id, backup.term, backup.primary
        );
        None
      }
      _ => None,
    }
  }

  fn on_probe(&mut self, from: MemberId) {
    if self.backup_primary(&from).is_none() {
      return;
    }
    if self.journal.is_poisoned() {
      self.demote("journal poisoned by I/O failure");
      return;
    }
    let last = self.journal.last_index();
    let commit = self.journal.commit_index();
    let tail_hashes = match self.journal.payload_hashes(commit + 1, last) {
      Ok(hashes) => hashes
        .into_iter()
        .map(|(index, hash)| TailHash { index, hash })
        .collect(),
      Err(error) => {
        warn!("{}: tail hash scan failed: {error}", self.member_id);
        return;
      }
    };
    let _ = self.transport.send(
      &self.member_id,
      &from,
      PeerMessage::ProbeAck {
        term: self.current_term,
        from: self.member_id.clone(),
        last_index: last,
        commit_index: commit,
        tail_hashes,
      },
    );
  }

  fn on_replicate(
    &mut self,
    from: MemberId,
    prev_index: LogIndex,
    entries: Vec<ReplicatedEntry>,
    commit_index: LogIndex,
    now: Instant,
  ) {
    if self.backup_primary(&from).is_none() {
      return;
    }
    if self.journal.is_poisoned() {
      self.demote("journal poisoned by I/O failure");
      return;
    }
    let last = self.journal.last_index();
    if prev_index > last {
      let _ = self.transport.send(
        &self.member_id,
        &from,
        PeerMessage::ReplicateReject {
          term: self.current_term,
          from: self.member_id.clone(),
          last_index: last,
        },
      );
      return;
    }

    let mut result: Result<()> = Ok(());
    for entry in &entries {
      if entry.record.index <= self.journal.last_index() {
        continue;
      }
      if let Err(error) = self.journal.append_entry(&entry.record) {
        result = Err(error);
        break;
      }
      if let Some(meta) = entry.session {
        self
          .registry
          .record_producer(meta.session_id, meta.producer_seq, entry.record.index, now);
      }
    }
    if result.is_ok() && !matches!(self.config.sync_mode, SyncMode::Never) {
      result = self.journal.sync();
    }
    if result.is_ok() {
      result = self.journal.commit(commit_index).map(|_| ());
    }

    match result {
      Ok(()) => {
        let _ = self.transport.send(
          &self.member_id,
          &from,
          PeerMessage::ReplicateAck {
            term: self.current_term,
            from: self.member_id.clone(),
            last_index: self.journal.last_index(),
          },
        );
      }
      Err(error) => {
        warn!("{}: replicate apply failed: {error}", self.member_id);
        self.demote("journal poisoned by I/O failure");
      }
    }
  }

  fn on_truncate(&mut self, from: MemberId, through_index: LogIndex) {
    if self.backup_primary(&from).is_none() {
      return;
    }
    let commit = self.journal.commit_index();
    if through_index < commit {
      // Should be unreachable under the quorum rule; reject and flag it.
      warn!(
        "{}: rejecting truncate through {through_index} below commit {commit}; protocol bug signal",
        self.member_id
      );
      let _ = self.transport.send(
        &self.member_id,
        &from,
        PeerMessage::TruncateReject {
          term: self.current_term,
          from: self.member_id.clone(),
          commit_index: commit,
        },
      );
      return;
    }
    match self.journal.truncate_suffix(through_index) {
      Ok(()) => {
        info!(
          "{} truncated divergent tail through {through_index}",
          self.member_id
        );
        let _ = self.transport.send(
          &self.member_id,
          &from,
          PeerMessage::TruncateAck {
            term: self.current_term,
            from: self.member_id.clone(),
            last_index: self.journal.last_index(),
          },
        );
      }
      Err(TideError::InvalidTruncate { commit, .. }) => {
        let _ = self.transport.send(
          &self.member_id,
          &from,
          PeerMessage::TruncateReject {
            term: self.current_term,
            from: self.member_id.clone(),
            commit_index: commit,
          },
        );
      }
      Err(error) => {
        warn!("{}: truncate failed: {error}", self.member_id);
        self.demote("journal poisoned by I/O failure");
      }
    }
  }

  fn on_commit(&mut self, index: LogIndex) {
    if !matches!(self.role, Role::Backup(_)) {
      return;
    }
    if let Err(error) = self.journal.commit(index) {
      warn!("{}: commit advance failed: {error}", self.member_id);
      self.demote("journal poisoned by I/O failure");
    }
  }

  // ==========================================================================
  // Timers
  // ==========================================================================

  fn tick(&mut self, now: Instant) {
    if self.primary_lost_quorum(now) {
      self.demote("lost contact with a quorum of backups");
    }
    let result = self.with_primary(|ctx| ctx.tick(now));
    if let Some(result) = result {
      self.after_primary_op(result);
    }
    if matches!(self.role, Role::Primary(_))
      && now.duration_since(self.last_sweep)
        >= Duration::from_millis(self.config.expire_interval_ms)
    {
      self.last_sweep = now;
      self.registry.sweep(now);
    }
  }

  fn primary_lost_quorum(&self, now: Instant) -> bool {
    let Role::Primary(state) = &self.role else {
      return false;
    };
    let required = state.effective_required(self.config.required_backup_acks());
    if required == 0 {
      return false;
    }
    let window = Duration::from_millis(self.config.primary_timeout_ms);
    let responsive = state
      .backups
      .values()
      .filter(|progress| now.duration_since(progress.last_contact) < window)
      .count();
    responsive < required
  }

  fn status(&self) -> PartitionStatus {
    let (role, term, accepting, backups) = match &self.role {
      Role::Primary(state) => (
        ReplicationRole::Primary,
        state.term,
        state.accepting,
        state
          .backups
          .iter()
          .map(|(member, progress)| BackupLag {
            member: member.clone(),
            acked_index: progress.acked_index,
            caught_up: matches!(progress.stage, SyncStage::Ready),
          })
          .collect(),
      ),
      Role::Backup(state) => (ReplicationRole::Backup, state.term, false, Vec::new()),
      Role::None => (ReplicationRole::None, self.current_term, false, Vec::new()),
    };
    PartitionStatus {
      member: self.member_id.clone(),
      role,
      term,
      accepting,
      first_index: self.journal.first_index(),
      last_index: self.journal.last_index(),
      commit_index: self.journal.commit_index(),
      session_count: self.registry.len(),
      append_attempts: self.append_attempts,
      append_failures: self.append_failures,
      backups,
    }
  }
}

// ============================================================================
// Primary-side operations over split borrows
// ============================================================================

impl<'a> PrimaryCtx<'a> {
  fn tick(&mut self, now: Instant) -> Result<()> {
    // Re-probe unresponsive backups.
    let reprobe: Vec<MemberId> = self
      .state
      .backups
      .iter()
      .filter(|(_, progress)| matches!(progress.stage, SyncStage::Probing) && now >= progress.retry_at)
      .map(|(member, _)| member.clone())
      .collect();
    for member in reprobe {
      let _ = self.transport.send(
        self.me,
        &member,
        PeerMessage::Probe {
          term: self.state.term,
          from: self.me.clone(),
        },
      );
      if let Some(progress) = self.state.backups.get_mut(&member) {
        progress.back_off(now);
      }
    }

    self.pump_all(now)?;
    self.advance_commit()?;
    self.update_accepting();

    for (index, pending, by_request) in self.state.take_expired(now) {
      let error = if by_request {
        TideError::Timeout
      } else {
        TideError::Unavailable(
          "replication quorum not reached within the commit timeout".to_string(),
        )
      };
      debug!("write at index {index} expired before commit");
      let _ = pending.reply.send(Err(error));
    }
    Ok(())
  }

  fn handle_probe_ack(
    &mut self,
    from: MemberId,
    their_last: LogIndex,
    their_commit: LogIndex,
    tail_hashes: Vec<TailHash>,
    now: Instant,
  ) -> Result<()> {
    if !self.state.backups.contains_key(&from) {
      return Ok(());
    }
    let my_last = self.journal.last_index();
    let ours: HashMap<LogIndex, u64> = self
      .journal
      .payload_hashes(their_commit + 1, my_last.min(their_last))?
      .into_iter()
      .collect();

    // Backward walk over the backup's uncommitted tail: the highest index
    // whose payload hash matches ours is the last agreed record.
    let mut last_match = their_commit.min(my_last);
    for tail in tail_hashes.iter().rev() {
      if tail.index <= my_last && ours.get(&tail.index) == Some(&tail.hash) {
        last_match = last_match.max(tail.index);
        break;
      }
    }

    let needs_truncate = their_last > last_match;
    if let Some(progress) = self.state.backups.get_mut(&from) {
      progress.contact(now);
      progress.outstanding = None;
      progress.stage = SyncStage::CatchingUp;
      if needs_truncate {
        progress.acked_index = their_commit;
        progress.next_index = last_match + 1;
      } else {
        progress.acked_index = their_last;
        progress.next_index = their_last + 1;
      }
    }
    if needs_truncate {
      info!(
        "backup {from}: {}; truncating its tail back from {their_last}",
        TideError::Divergence {
          index: last_match + 1,
        }
      );
      let _ = self.transport.send(
        self.me,
        &from,
        PeerMessage::Truncate {
          term: self.state.term,
          from: self.me.clone(),
          through_index: last_match,
        },
      );
    } else {
      self.pump_one(&from, now)?;
    }
    self.advance_commit()?;
    self.update_accepting();
    Ok(())
  }

  fn handle_truncate_ack(&mut self, from: MemberId, their_last: LogIndex, now: Instant) -> Result<()> {
    let Some(progress) = self.state.backups.get_mut(&from) else {
      return Ok(());
    };
    progress.contact(now);
    progress.outstanding = None;
    progress.stage = SyncStage::CatchingUp;
    progress.acked_index = progress.acked_index.min(their_last);
    progress.next_index = their_last + 1;
    self.pump_one(&from, now)
  }

  fn handle_truncate_reject(
    &mut self,
    from: MemberId,
    their_commit: LogIndex,
    now: Instant,
  ) -> Result<()> {
    warn!(
      "backup {from} rejected truncate below its commit index {their_commit}; protocol bug signal, re-probing"
    );
    if let Some(progress) = self.state.backups.get_mut(&from) {
      progress.contact(now);
      progress.outstanding = None;
      progress.stage = SyncStage::Probing;
      let _ = self.transport.send(
        self.me,
        &from,
        PeerMessage::Probe {
          term: self.state.term,
          from: self.me.clone(),
        },
      );
    }
    Ok(())
  }

  fn handle_replicate_ack(&mut self, from: MemberId, their_last: LogIndex, now: Instant) -> Result<()> {
    if let Some(progress) = self.state.backups.get_mut(&from) {
      progress.contact(now);
      progress.acked_index = progress.acked_index.max(their_last);
      progress.next_index = progress.next_index.max(their_last + 1);
      if progress
        .outstanding
        .is_some_and(|outstanding| outstanding.upto <= their_last)
      {
        progress.outstanding = None;
      }
    } else {
      return Ok(());
    }
    self.advance_commit()?;
    self.pump_one(&from, now)?;
    self.update_accepting();
    Ok(())
  }

  fn handle_replicate_reject(
    &mut self,
    from: MemberId,
    their_last: LogIndex,
    now: Instant,
  ) -> Result<()> {
    // The backup's log is shorter than the prefix we assumed; back up to its
    // tail and stream from there.
    let Some(progress) = self.state.backups.get_mut(&from) else {
      return Ok(());
    };
    progress.contact(now);
    progress.outstanding = None;
    progress.stage = SyncStage::CatchingUp;
    progress.next_index = their_last + 1;
    self.pump_one(&from, now)
  }

  fn pump_all(&mut self, now: Instant) -> Result<()> {
    let members: Vec<MemberId> = self.state.backups.keys().cloned().collect();
    for member in members {
      self.pump_one(&member, now)?;
    }
    Ok(())
  }

  /// Streams the next batch to one backup, bounded by the in-flight window.
  /// At most one batch is outstanding per backup; the window caps its size.
  fn pump_one(&mut self, member: &MemberId, now: Instant) -> Result<()> {
    let last = self.journal.last_index();
    let first = self.journal.first_index();
    let commit = self.journal.commit_index();
    let term = self.state.term;

    let Some(progress) = self.state.backups.get_mut(member) else {
      return Ok(());
    };
    if matches!(progress.stage, SyncStage::Probing | SyncStage::Stalled) {
      return Ok(());
    }
    if let Some(outstanding) = progress.outstanding {
      if now.duration_since(outstanding.sent_at)
        < Duration::from_millis(REPLICATE_RESEND_TIMEOUT_MS)
      {
        return Ok(());
      }
      // Assume the batch was lost; resend after backoff.
      progress.outstanding = None;
      progress.back_off(now);
      return Ok(());
    }
    if now < progress.retry_at {
      return Ok(());
    }
    if progress.next_index > last {
      if !matches!(progress.stage, SyncStage::Ready) {
        info!("backup {member} caught up to index {last}");
        progress.stage = SyncStage::Ready;
      }
      return Ok(());
    }
    if progress.next_index < first {
      warn!(
        "backup {member} needs records below the compaction floor {first}; cannot stream catch-up"
      );
      progress.stage = SyncStage::Stalled;
      return Ok(());
    }

    let from_index = progress.next_index;
    let batch_bytes = self.config.window_bytes.min(CATCH_UP_BATCH_BYTES);
    let (records, _) = self.journal.read(from_index, batch_bytes)?;
    let Some(last_record) = records.last() else {
      return Ok(());
    };
    let upto = last_record.index;
    let entries: Vec<ReplicatedEntry> = records
      .into_iter()
      .map(|record| ReplicatedEntry {
        session: self.state.session_meta.get(&record.index).copied(),
        record,
      })
      .collect();

    let message = PeerMessage::Replicate {
      term,
      from: self.me.clone(),
      prev_index: from_index - 1,
      entries,
      commit_index: commit,
    };
    let sent = self.transport.send(self.me, member, message);
    let Some(progress) = self.state.backups.get_mut(member) else {
      return Ok(());
    };
    match sent {
      Ok(()) => {
        progress.outstanding = Some(Outstanding {
          upto,
          sent_at: now,
        });
      }
      Err(error) => {
        trace!("replicate to {member} failed: {error}");
        progress.back_off(now);
      }
    }
    Ok(())
  }

  fn advance_commit(&mut self) -> Result<()> {
    let required = self.state.effective_required(self.config.required_backup_acks());
    let target = self.state.quorum_commit(self.journal.last_index(), required);
    if target <= self.journal.commit_index() {
      return Ok(());
    }
    let committed = self.journal.commit(target)?;
    self.finish_commit(committed)
  }

  /// Completes pending writes, pushes to consumers, and fans the new commit
  /// index out to backups.
  fn finish_commit(&mut self, committed: LogIndex) -> Result<()> {
    for (index, pending) in self.state.take_committed(committed) {
      let _ = pending.reply.send(Ok(WriteResponse { index }));
    }
    self
      .registry
      .push_all(self.journal, committed, self.config.max_push_bytes)?;
    for member in self.state.backups.keys() {
      let _ = self.transport.send(
        self.me,
        member,
        PeerMessage::Commit {
          term: self.state.term,
          from: self.me.clone(),
          index: committed,
        },
      );
    }
    Ok(())
  }

  fn update_accepting(&mut self) {
    if self.state.accepting {
      return;
    }
    let required = self.state.effective_required(self.config.required_backup_acks());
    if self.state.ready_count() >= required {
      self.state.accepting = true;
      info!(
        "{} accepting writes for term {} (quorum caught up)",
        self.me, self.state.term
      );
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cluster::{Election, LocalNetwork, StaticMembership};

  fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
      if check() {
        return true;
      }
      thread::sleep(Duration::from_millis(2));
    }
    false
  }

  fn single_peer(dir: &Path) -> (Partition, Arc<LocalNetwork>, Arc<crate::cluster::Election>) {
    let network = LocalNetwork::new();
    let election = Election::new();
    let membership = Arc::new(StaticMembership::new(["solo"]));
    let config = PartitionConfig::new()
      .replication_factor(1)
      .tick_interval_ms(2);
    let partition = Partition::spawn(
      "solo",
      dir,
      config,
      membership,
      network.clone(),
      election.as_ref(),
    )
    .expect("spawn");
    network.register(partition.handle());
    (partition, network, election)
  }

  #[test]
  fn single_peer_write_commit_consume() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (partition, _network, election) = single_peer(dir.path());
    let handle = partition.handle();
    election.elect("solo");

    let timeout = Duration::from_secs(2);
    assert!(wait_until(timeout, || {
      handle
        .status(timeout)
        .map(|status| status.role == ReplicationRole::Primary)
        .unwrap_or(false)
    }));

    handle.open_session(1, timeout).expect("open session");
    let response = handle
      .write(
        WriteRequest {
          session_id: 1,
          seq: 1,
          value: b"first".to_vec(),
          ttl_ms: None,
        },
        timeout,
      )
      .expect("write");
    assert_eq!(response.index, 1);

    // A single-peer quorum commits immediately.
    let status = handle.status(timeout).expect("status");
    assert_eq!(status.commit_index, 1);

    let read = handle
      .read(
        ReadRequest {
          from_index: 1,
          max_bytes: u64::MAX,
        },
        timeout,
      )
      .expect("read");
    assert_eq!(read.records.len(), 1);
    assert_eq!(read.records[0].value, b"first");
    assert_eq!(read.next_index, 2);

    let (sink, events) = unbounded();
    handle.consume(1, 1, sink, timeout).expect("consume");
    match events.recv_timeout(timeout).expect("pushed records") {
      ConsumerEvent::Records { records } => {
        assert_eq!(records[0].index, 1);
        assert_eq!(records[0].value, b"first");
      }
      other => panic!("unexpected event: {other:?}"),
    }

    partition.shutdown(timeout).expect("shutdown");
  }

  #[test]
  fn duplicate_seq_returns_same_index() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (partition, _network, election) = single_peer(dir.path());
    let handle = partition.handle();
    election.elect("solo");

    let timeout = Duration::from_secs(2);
    assert!(wait_until(timeout, || {
      handle
        .status(timeout)
        .map(|status| status.role == ReplicationRole::Primary)
        .unwrap_or(false)
    }));

    handle.open_session(9, timeout).expect("open session");
    let request = WriteRequest {
      session_id: 9,
      seq: 42,
      value: b"once".to_vec(),
      ttl_ms: None,
    };
    let first = handle.write(request.clone(), timeout).expect("write");
    let retry = handle.write(request, timeout).expect("retry");
    assert_eq!(first.index, retry.index);

    let status = handle.status(timeout).expect("status");
    assert_eq!(status.last_index, first.index);

    partition.shutdown(timeout).expect("shutdown");
  }

  #[test]
  fn writes_unavailable_without_primary() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (partition, _network, _election) = single_peer(dir.path());
    let handle = partition.handle();

    let timeout = Duration::from_millis(500);
    let result = handle.write(
      WriteRequest {
        session_id: 1,
        seq: 1,
        value: b"nope".to_vec(),
        ttl_ms: None,
      },
      timeout,
    );
    assert!(matches!(result, Err(TideError::Unavailable(_))));

    partition.shutdown(Duration::from_secs(1)).expect("shutdown");
  }
}
