//! Typed wire messages for the peer replication protocol and the client
//! session protocol. Encoding is left to the transport; these are the fields.

use crate::types::{LogIndex, MemberId, Record, SessionId, Term};
use serde::{Deserialize, Serialize};

/// Producer metadata piggybacked on a replicated entry so backups learn
/// session dedupe state lazily.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMeta {
  pub session_id: SessionId,
  pub producer_seq: u64,
}

/// One log entry as shipped between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatedEntry {
  pub record: Record,
  pub session: Option<SessionMeta>,
}

/// Hash of one uncommitted tail record, used for divergence detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TailHash {
  pub index: LogIndex,
  pub hash: u64,
}

/// Peer-to-peer replication protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
  /// New primary queries a backup's position and uncommitted tail.
  Probe { term: Term, from: MemberId },
  ProbeAck {
    term: Term,
    from: MemberId,
    last_index: LogIndex,
    commit_index: LogIndex,
    /// Hashes of records in `(commit_index, last_index]`.
    tail_hashes: Vec<TailHash>,
  },
  Replicate {
    term: Term,
    from: MemberId,
    /// Index immediately preceding `entries[0]`.
    prev_index: LogIndex,
    entries: Vec<ReplicatedEntry>,
    /// Primary's commit index, piggybacked.
    commit_index: LogIndex,
  },
  ReplicateAck {
    term: Term,
    from: MemberId,
    last_index: LogIndex,
  },
  ReplicateReject {
    term: Term,
    from: MemberId,
    last_index: LogIndex,
  },
  Truncate {
    term: Term,
    from: MemberId,
    through_index: LogIndex,
  },
  TruncateAck {
    term: Term,
    from: MemberId,
    last_index: LogIndex,
  },
  TruncateReject {
    term: Term,
    from: MemberId,
    commit_index: LogIndex,
  },
  /// One-way commit advance notification.
  Commit {
    term: Term,
    from: MemberId,
    index: LogIndex,
  },
}

impl PeerMessage {
  pub fn term(&self) -> Term {
    match self {
      PeerMessage::Probe { term, .. }
      | PeerMessage::ProbeAck { term, .. }
      | PeerMessage::Replicate { term, .. }
      | PeerMessage::ReplicateAck { term, .. }
      | PeerMessage::ReplicateReject { term, .. }
      | PeerMessage::Truncate { term, .. }
      | PeerMessage::TruncateAck { term, .. }
      | PeerMessage::TruncateReject { term, .. }
      | PeerMessage::Commit { term, .. } => *term,
    }
  }

  pub fn from(&self) -> &MemberId {
    match self {
      PeerMessage::Probe { from, .. }
      | PeerMessage::ProbeAck { from, .. }
      | PeerMessage::Replicate { from, .. }
      | PeerMessage::ReplicateAck { from, .. }
      | PeerMessage::ReplicateReject { from, .. }
      | PeerMessage::Truncate { from, .. }
      | PeerMessage::TruncateAck { from, .. }
      | PeerMessage::TruncateReject { from, .. }
      | PeerMessage::Commit { from, .. } => from,
    }
  }

  /// Whether this message kind originates from the term's primary, which
  /// makes the sender the primary to follow after a term bump.
  pub fn is_from_primary(&self) -> bool {
    matches!(
      self,
      PeerMessage::Probe { .. }
        | PeerMessage::Replicate { .. }
        | PeerMessage::Truncate { .. }
        | PeerMessage::Commit { .. }
    )
  }
}

// ============================================================================
// Client protocol
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRequest {
  pub session_id: SessionId,
  pub seq: u64,
  pub value: Vec<u8>,
  /// Optional request deadline, milliseconds from receipt.
  pub ttl_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResponse {
  pub index: LogIndex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRequest {
  pub from_index: LogIndex,
  pub max_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadResponse {
  pub records: Vec<Record>,
  pub next_index: LogIndex,
}

/// Server-initiated consumer stream events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsumerEvent {
  /// The subscription start was compacted away; delivery resumes at
  /// `next_index`. Always precedes the first record when it fires.
  CompactedSkip { next_index: LogIndex },
  /// In-order batch of committed records.
  Records { records: Vec<Record> },
}
