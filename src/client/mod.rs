//! Client session: primary discovery, keepalive, idempotent producer, and
//! ordered consumer with reattach across failover.
//!
//! The producer retries under the same session sequence number, so a write
//! acknowledged by a primary that died mid-request lands at exactly one
//! index. The consumer tracks the next index it has handed to the
//! application; replayed records after a reattach are filtered out, giving
//! in-order, duplicate-free delivery per connection and at-least-once across
//! failover.

use crate::cluster::{ElectionObserver, EndpointResolver};
use crate::constants::DEFAULT_HEARTBEAT_INTERVAL_MS;
use crate::error::{Result, TideError};
use crate::replication::messages::{ConsumerEvent, WriteRequest};
use crate::replication::PartitionHandle;
use crate::types::{LogIndex, Record, SessionId, TermInfo};
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::debug;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Client-side knobs.
#[derive(Debug, Clone)]
pub struct ClientConfig {
  /// Per-request reply timeout.
  pub request_timeout_ms: u64,
  /// Overall bound on one `append` call across retries.
  pub append_timeout_ms: u64,
  /// Wait for a primary to appear at connect time.
  pub connect_timeout_ms: u64,
  /// Backoff between retries.
  pub retry_backoff_ms: u64,
  /// Keepalive heartbeat interval.
  pub heartbeat_interval_ms: u64,
}

impl Default for ClientConfig {
  fn default() -> Self {
    Self {
      request_timeout_ms: 5_000,
      append_timeout_ms: 30_000,
      connect_timeout_ms: 10_000,
      retry_backoff_ms: 20,
      heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
    }
  }
}

impl ClientConfig {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn request_timeout_ms(mut self, value: u64) -> Self {
    self.request_timeout_ms = value.max(1);
    self
  }

  pub fn append_timeout_ms(mut self, value: u64) -> Self {
    self.append_timeout_ms = value.max(1);
    self
  }

  pub fn connect_timeout_ms(mut self, value: u64) -> Self {
    self.connect_timeout_ms = value;
    self
  }

  pub fn retry_backoff_ms(mut self, value: u64) -> Self {
    self.retry_backoff_ms = value.max(1);
    self
  }

  pub fn heartbeat_interval_ms(mut self, value: u64) -> Self {
    self.heartbeat_interval_ms = value.max(1);
    self
  }
}

struct ConsumerAttachment {
  /// Next index the application has not yet seen; the resume point after
  /// failover.
  next_index: Arc<AtomicU64>,
  sink: Sender<ConsumerEvent>,
}

struct Shared {
  session_id: SessionId,
  resolver: Arc<dyn EndpointResolver>,
  election: Arc<dyn ElectionObserver>,
  config: ClientConfig,
  producer_seq: AtomicU64,
  consumer: Mutex<Option<ConsumerAttachment>>,
  /// Term we last opened the session under; a mismatch triggers reattach.
  attached: Mutex<Option<TermInfo>>,
  running: AtomicBool,
}

impl Shared {
  fn request_timeout(&self) -> Duration {
    Duration::from_millis(self.config.request_timeout_ms)
  }

  /// Resolves the current primary's endpoint, waiting up to `deadline`.
  fn primary(&self, deadline: Instant) -> Result<(TermInfo, PartitionHandle)> {
    loop {
      if let Some(info) = self.election.current() {
        if let Some(handle) = self.resolver.endpoint(&info.primary) {
          return Ok((info, handle));
        }
      }
      if Instant::now() >= deadline {
        return Err(TideError::Unavailable("no reachable primary".to_string()));
      }
      thread::sleep(Duration::from_millis(self.config.retry_backoff_ms));
    }
  }

  /// Opens the session at the current primary and re-registers the consumer
  /// cursor, if the term changed since the last attach.
  fn ensure_attached(&self, deadline: Instant) -> Result<(TermInfo, PartitionHandle)> {
    let (info, handle) = self.primary(deadline)?;
    if self.attached.lock().as_ref() == Some(&info) {
      return Ok((info, handle));
    }
    let timeout = self.request_timeout();
    handle.open_session(self.session_id, timeout)?;
    if let Some(attachment) = self.consumer.lock().as_ref() {
      handle.consume(
        self.session_id,
        attachment.next_index.load(Ordering::SeqCst),
        attachment.sink.clone(),
        timeout,
      )?;
    }
    *self.attached.lock() = Some(info.clone());
    Ok((info, handle))
  }

  fn detach(&self) {
    *self.attached.lock() = None;
  }

  fn keepalive_loop(&self) {
    let interval = Duration::from_millis(self.config.heartbeat_interval_ms);
    while self.running.load(Ordering::SeqCst) {
      thread::park_timeout(interval);
      if !self.running.load(Ordering::SeqCst) {
        break;
      }
      let deadline = Instant::now() + self.request_timeout();
      let result = self
        .ensure_attached(deadline)
        .and_then(|(_, handle)| handle.heartbeat(self.session_id, self.request_timeout()));
      if let Err(error) = result {
        debug!("session {} keepalive failed: {error}", self.session_id);
        self.detach();
      }
    }
  }
}

/// A client's logical connection to one partition.
pub struct ClientSession {
  shared: Arc<Shared>,
  keepalive: Option<JoinHandle<()>>,
}

impl ClientSession {
  /// Discovers the primary, opens the session, and starts the keepalive
  /// thread that heartbeats and reattaches after failover.
  pub fn connect(
    resolver: Arc<dyn EndpointResolver>,
    election: Arc<dyn ElectionObserver>,
    session_id: SessionId,
    config: ClientConfig,
  ) -> Result<Self> {
    let connect_deadline = Instant::now() + Duration::from_millis(config.connect_timeout_ms);
    let shared = Arc::new(Shared {
      session_id,
      resolver,
      election,
      config,
      producer_seq: AtomicU64::new(0),
      consumer: Mutex::new(None),
      attached: Mutex::new(None),
      running: AtomicBool::new(true),
    });
    shared.ensure_attached(connect_deadline)?;

    let keepalive = {
      let shared = Arc::clone(&shared);
      thread::Builder::new()
        .name(format!("session-{session_id}-keepalive"))
        .spawn(move || shared.keepalive_loop())?
    };

    Ok(Self {
      shared,
      keepalive: Some(keepalive),
    })
  }

  pub fn session_id(&self) -> SessionId {
    self.shared.session_id
  }

  /// Send-only handle for this session.
  pub fn producer(&self) -> Producer {
    Producer {
      shared: Arc::clone(&self.shared),
    }
  }

  /// Subscribes from `from_index` (snapped up past compacted records by the
  /// server, announced via `CompactedSkip`).
  pub fn subscribe(&self, from_index: LogIndex) -> Result<Consumer> {
    let (sink, receiver) = unbounded();
    let next_index = Arc::new(AtomicU64::new(from_index.max(1)));
    *self.shared.consumer.lock() = Some(ConsumerAttachment {
      next_index: Arc::clone(&next_index),
      sink: sink.clone(),
    });

    let deadline = Instant::now() + self.shared.request_timeout();
    let (_, handle) = self.shared.ensure_attached(deadline)?;
    handle.consume(
      self.shared.session_id,
      next_index.load(Ordering::SeqCst),
      sink,
      self.shared.request_timeout(),
    )?;

    Ok(Consumer {
      shared: Arc::clone(&self.shared),
      receiver,
      next_index,
      ready: VecDeque::new(),
    })
  }

  /// Stops the keepalive and closes the session at the server.
  pub fn close(mut self) -> Result<()> {
    self.shared.running.store(false, Ordering::SeqCst);
    if let Some(keepalive) = self.keepalive.take() {
      keepalive.thread().unpark();
      let _ = keepalive.join();
    }
    let deadline = Instant::now() + self.shared.request_timeout();
    if let Ok((_, handle)) = self.shared.primary(deadline) {
      let _ = handle.close_session(self.shared.session_id, self.shared.request_timeout());
    }
    Ok(())
  }
}

impl Drop for ClientSession {
  fn drop(&mut self) {
    self.shared.running.store(false, Ordering::SeqCst);
    if let Some(keepalive) = self.keepalive.take() {
      keepalive.thread().unpark();
    }
  }
}

/// Appends records with idempotent retry across primary failover.
pub struct Producer {
  shared: Arc<Shared>,
}

impl Producer {
  pub fn append(&self, value: impl Into<Vec<u8>>) -> Result<LogIndex> {
    let seq = self.shared.producer_seq.fetch_add(1, Ordering::SeqCst) + 1;
    self.append_with_seq(seq, value.into())
  }

  /// Retries the same `(session, seq)` until the append deadline; the server
  /// dedupes, so the record lands at exactly one index.
  fn append_with_seq(&self, seq: u64, value: Vec<u8>) -> Result<LogIndex> {
    let deadline = Instant::now() + Duration::from_millis(self.shared.config.append_timeout_ms);
    let backoff = Duration::from_millis(self.shared.config.retry_backoff_ms);
    loop {
      let attempt = self
        .shared
        .ensure_attached(deadline.min(Instant::now() + self.shared.request_timeout()))
        .and_then(|(_, handle)| {
          handle.write(
            WriteRequest {
              session_id: self.shared.session_id,
              seq,
              value: value.clone(),
              ttl_ms: Some(self.shared.config.request_timeout_ms),
            },
            self.shared.request_timeout(),
          )
        });
      match attempt {
        Ok(response) => return Ok(response.index),
        Err(error) if error.is_retryable() || matches!(error, TideError::SessionExpired(_)) => {
          debug!(
            "append seq {seq} on session {} retrying: {error}",
            self.shared.session_id
          );
          self.shared.detach();
          if Instant::now() + backoff >= deadline {
            return Err(error);
          }
          thread::sleep(backoff);
        }
        Err(error) => return Err(error),
      }
    }
  }
}

/// Receives committed records in strict index order.
pub struct Consumer {
  shared: Arc<Shared>,
  receiver: Receiver<ConsumerEvent>,
  next_index: Arc<AtomicU64>,
  ready: VecDeque<Record>,
}

impl Consumer {
  /// Next stream event: a `CompactedSkip` or a non-empty in-order batch.
  /// Records already delivered (replays after a reattach) are filtered out.
  pub fn next_event(&mut self, timeout: Duration) -> Result<ConsumerEvent> {
    let deadline = Instant::now() + timeout;
    loop {
      let remaining = deadline
        .checked_duration_since(Instant::now())
        .ok_or(TideError::Timeout)?;
      let event = self
        .receiver
        .recv_timeout(remaining)
        .map_err(|_| TideError::Timeout)?;
      let next = self.next_index.load(Ordering::SeqCst);
      match event {
        ConsumerEvent::CompactedSkip { next_index } => {
          if next_index > next {
            self.next_index.store(next_index, Ordering::SeqCst);
            return Ok(ConsumerEvent::CompactedSkip { next_index });
          }
          // Stale skip from a replayed registration.
        }
        ConsumerEvent::Records { records } => {
          let records: Vec<Record> = records
            .into_iter()
            .filter(|record| record.index >= next)
            .collect();
          if let Some(last) = records.last() {
            self.next_index.store(last.index + 1, Ordering::SeqCst);
            return Ok(ConsumerEvent::Records { records });
          }
        }
      }
    }
  }

  /// Next single record, skipping over `CompactedSkip` notices.
  pub fn next_record(&mut self, timeout: Duration) -> Result<Record> {
    let deadline = Instant::now() + timeout;
    loop {
      if let Some(record) = self.ready.pop_front() {
        return Ok(record);
      }
      let remaining = deadline
        .checked_duration_since(Instant::now())
        .ok_or(TideError::Timeout)?;
      if let ConsumerEvent::Records { records } = self.next_event(remaining)? {
        self.ready.extend(records);
      }
    }
  }

  /// The next index this consumer has not yet handed to the application.
  pub fn next_index(&self) -> LogIndex {
    self.next_index.load(Ordering::SeqCst)
  }

  pub fn session_id(&self) -> SessionId {
    self.shared.session_id
  }
}
