//! CRC32C checksums over one or many slices.

/// CRC32C of a single slice.
pub fn crc32c(bytes: &[u8]) -> u32 {
  ::crc32c::crc32c(bytes)
}

/// CRC32C over the concatenation of the given slices.
pub fn crc32c_multi(segments: &[&[u8]]) -> u32 {
  let mut crc = 0;
  for segment in segments {
    crc = ::crc32c::crc32c_append(crc, segment);
  }
  crc
}
