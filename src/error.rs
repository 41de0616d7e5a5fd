//! Error types for TideLog

use thiserror::Error;

use crate::types::SessionId;

/// Crate-wide error type
#[derive(Debug, Error)]
pub enum TideError {
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("CRC mismatch: stored 0x{stored:08X}, computed 0x{computed:08X}")]
  CrcMismatch { stored: u32, computed: u32 },

  #[error("invalid magic: 0x{0:08X}")]
  InvalidMagic(u32),

  #[error("unsupported version: found {found}, supported {supported}")]
  VersionMismatch { found: u16, supported: u16 },

  #[error("invalid segment: {0}")]
  InvalidSegment(String),

  #[error("truncate through {through} would drop committed records (commit index {commit})")]
  InvalidTruncate { through: u64, commit: u64 },

  #[error("journal is poisoned by a prior I/O failure")]
  Poisoned,

  #[error("stale term {observed}, current term is {current}")]
  StaleTerm { observed: u64, current: u64 },

  #[error("divergent log at index {index}")]
  Divergence { index: u64 },

  #[error("unavailable: {0}")]
  Unavailable(String),

  #[error("deadline exceeded")]
  Timeout,

  #[error("session {0} expired")]
  SessionExpired(SessionId),

  #[error("lock failed: {0}")]
  LockFailed(String),

  #[error("serialization error: {0}")]
  Serialization(String),

  #[error("partition is shut down")]
  Closed,

  #[error("internal error: {0}")]
  Internal(String),
}

/// Result type alias using TideError
pub type Result<T> = std::result::Result<T, TideError>;

impl TideError {
  /// Whether a producer may retry the request under the same sequence number.
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      TideError::Unavailable(_) | TideError::Timeout | TideError::StaleTerm { .. }
    )
  }
}
