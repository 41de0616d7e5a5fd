//! Primary-backup replication: the partition engine, role state, and the
//! typed message protocol.

pub mod messages;

mod engine;
mod primary;

pub use engine::{BackupLag, Partition, PartitionHandle, PartitionStatus};
