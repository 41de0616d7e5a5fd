//! TideLog - partitioned, replicated, append-only log
//!
//! # Architecture
//!
//! Each partition is a small group of peers, one elected **primary** and the
//! rest **backups**, all hosting the same three pieces:
//!
//! - **Journal**: segmented on-disk log with CRC'd frames, truncation, and
//!   size/age compaction
//! - **Replication engine**: term-scoped primary/backup roles, divergence
//!   detection with truncate-on-rejoin, quorum commit
//! - **Session registry**: producer dedupe and consumer cursors with ordered
//!   push
//!
//! Election, membership, and the wire transport are injected; in-process
//! implementations with fault injection live in [`cluster`].
//!
//! # Features
//!
//! - Gap-free monotonic record indices, byte-for-byte agreement across peers
//! - Idempotent producer retry across primary failover
//! - Consumers subscribe at any offset and ride the committed tail
//! - Single partition thread; no locks around journal or role state

#![deny(clippy::all)]

// Core modules
pub mod config;
pub mod constants;
pub mod error;
pub mod types;
pub mod util;

// Storage layer
pub mod journal;

// Replication layer
pub mod cluster;
pub mod replication;

// Session layer
pub mod client;
pub mod session;

// Re-export commonly used items
pub use config::{PartitionConfig, ReplicationMode, SyncMode};
pub use error::{Result, TideError};

pub use client::{ClientConfig, ClientSession, Consumer, Producer};
pub use replication::{Partition, PartitionHandle, PartitionStatus};
pub use types::{LogIndex, MemberId, Record, ReplicationRole, SessionId, Term, TermInfo};
