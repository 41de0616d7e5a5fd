//! Payload hashes used by divergence detection.

use xxhash_rust::xxh64::xxh64;

const PAYLOAD_HASH_SEED: u64 = 0x7469_6465;

/// Position-independent hash of a record payload. Equal payloads at equal
/// indices hash equally across peers.
pub fn payload_hash(index: u64, value: &[u8]) -> u64 {
  xxh64(value, PAYLOAD_HASH_SEED ^ index)
}
