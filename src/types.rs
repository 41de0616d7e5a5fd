//! Core identifier and record types shared across the crate.

use serde::{Deserialize, Serialize};

/// Index of a record within a partition. 1 is the first record; 0 means
/// "before the log".
pub type LogIndex = u64;

/// Monotone identifier of a primary regime, assigned by the election service.
pub type Term = u64;

/// Identifier of a partition peer.
pub type MemberId = String;

/// Identifier of a client session within a partition.
pub type SessionId = u64;

/// One record of the partition log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
  /// Monotonic, gap-free index assigned by the primary.
  pub index: LogIndex,
  /// Primary wall-clock at append, milliseconds since the Unix epoch.
  pub timestamp_ms: u64,
  /// Opaque payload.
  pub value: Vec<u8>,
}

impl Record {
  pub fn new(index: LogIndex, timestamp_ms: u64, value: Vec<u8>) -> Self {
    Self {
      index,
      timestamp_ms,
      value,
    }
  }

  /// Encoded frame payload size, used for size accounting before writing.
  pub fn frame_payload_len(&self) -> usize {
    crate::util::varint::encoded_len(self.index)
      + crate::util::varint::encoded_len(self.timestamp_ms)
      + self.value.len()
  }
}

/// A term observation from the election service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermInfo {
  pub number: Term,
  pub primary: MemberId,
}

/// Replication role of a peer within a term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationRole {
  Primary,
  Backup,
  None,
}
