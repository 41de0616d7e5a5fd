//! Magic numbers and defaults for TideLog

// ============================================================================
// Segment file format (little-endian)
// ============================================================================

/// Segment header magic: "TLSG"
pub const MAGIC_SEGMENT: u32 = 0x4753_4C54;

/// Current segment format version
pub const VERSION_SEGMENT: u16 = 1;

/// Segment header size: magic u32, version u16, reserved u16,
/// first_index u64, max_bytes u64, created_at_ms u64
pub const SEGMENT_HEADER_SIZE: usize = 32;

/// Frame header size: payload_len u32, crc32c u32
pub const FRAME_HEADER_SIZE: usize = 8;

/// Upper bound on a single frame payload
pub const MAX_FRAME_PAYLOAD_BYTES: usize = 64 * 1024 * 1024;

/// Sealed segment file suffix
pub const EXT_SEALED: &str = ".log";

/// Active segment file suffix
pub const EXT_ACTIVE: &str = ".active";

/// Journal metadata sidecar file name
pub const META_FILE_NAME: &str = "meta";

/// Journal directory lock file name
pub const JOURNAL_LOCK_FILE_NAME: &str = "journal.lock";

// ============================================================================
// Defaults
// ============================================================================

/// Default seal threshold for the active segment (64MB)
pub const DEFAULT_MAX_SEGMENT_BYTES: u64 = 64 * 1024 * 1024;

/// Default per-backup in-flight window (4MB)
pub const DEFAULT_WINDOW_BYTES: u64 = 4 * 1024 * 1024;

/// Default bound on one consumer push batch (1MB)
pub const DEFAULT_MAX_PUSH_BYTES: u64 = 1024 * 1024;

/// Default quorum wait before a synchronous write fails
pub const DEFAULT_COMMIT_TIMEOUT_MS: u64 = 5_000;

/// Default session heartbeat timeout
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 10_000;

/// Default client heartbeat interval
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1_000;

/// Default session expiry sweep interval
pub const DEFAULT_EXPIRE_INTERVAL_MS: u64 = 500;

/// Default quorum-contact loss window before a primary self-demotes
pub const DEFAULT_PRIMARY_TIMEOUT_MS: u64 = 5_000;

/// Default partition thread timer granularity
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 10;

/// Replicate retry backoff floor and ceiling
pub const REPLICATE_BACKOFF_MIN_MS: u64 = 10;
pub const REPLICATE_BACKOFF_MAX_MS: u64 = 1_000;

/// In-flight Replicate batch is presumed lost after this long without an ack
pub const REPLICATE_RESEND_TIMEOUT_MS: u64 = 1_000;

/// Entries streamed per catch-up batch to a lagging backup
pub const CATCH_UP_BATCH_BYTES: u64 = 1024 * 1024;
