//! Segment files: frame codec, the single mutable active segment, and
//! immutable sealed segments.
//!
//! A segment file is a fixed header followed by length-prefixed record
//! frames: `{ u32 payload_len, u32 crc32c, payload }` where the payload is
//! `varint index | varint timestamp_ms | value`.

use crate::constants::*;
use crate::error::{Result, TideError};
use crate::types::{LogIndex, Record};
use crate::util::crc::{crc32c, crc32c_multi};
use crate::util::varint;
use byteorder::{LittleEndian, ReadBytesExt};
use log::warn;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Fixed per-file header written when a segment is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
  pub first_index: LogIndex,
  pub max_bytes: u64,
  pub created_at_ms: u64,
}

impl SegmentHeader {
  pub fn encode(&self) -> [u8; SEGMENT_HEADER_SIZE] {
    let mut buf = [0u8; SEGMENT_HEADER_SIZE];
    buf[0..4].copy_from_slice(&MAGIC_SEGMENT.to_le_bytes());
    buf[4..6].copy_from_slice(&VERSION_SEGMENT.to_le_bytes());
    // bytes 6..8 reserved
    buf[8..16].copy_from_slice(&self.first_index.to_le_bytes());
    buf[16..24].copy_from_slice(&self.max_bytes.to_le_bytes());
    buf[24..32].copy_from_slice(&self.created_at_ms.to_le_bytes());
    buf
  }

  pub fn decode(reader: &mut impl Read) -> Result<Self> {
    let magic = reader.read_u32::<LittleEndian>()?;
    if magic != MAGIC_SEGMENT {
      return Err(TideError::InvalidMagic(magic));
    }
    let version = reader.read_u16::<LittleEndian>()?;
    if version != VERSION_SEGMENT {
      return Err(TideError::VersionMismatch {
        found: version,
        supported: VERSION_SEGMENT,
      });
    }
    let _reserved = reader.read_u16::<LittleEndian>()?;
    let first_index = reader.read_u64::<LittleEndian>()?;
    let max_bytes = reader.read_u64::<LittleEndian>()?;
    let created_at_ms = reader.read_u64::<LittleEndian>()?;
    Ok(Self {
      first_index,
      max_bytes,
      created_at_ms,
    })
  }
}

/// Encoded size of one frame for `record`.
pub fn frame_len(record: &Record) -> u64 {
  (FRAME_HEADER_SIZE + record.frame_payload_len()) as u64
}

fn encode_frame(record: &Record, out: &mut Vec<u8>) -> Result<()> {
  let mut prefix = Vec::with_capacity(20);
  varint::encode(record.index, &mut prefix);
  varint::encode(record.timestamp_ms, &mut prefix);

  let payload_len = prefix.len() + record.value.len();
  if payload_len > MAX_FRAME_PAYLOAD_BYTES {
    return Err(TideError::InvalidSegment(format!(
      "frame payload too large: {payload_len} bytes"
    )));
  }

  let crc = crc32c_multi(&[prefix.as_slice(), record.value.as_slice()]);
  out.extend_from_slice(&(payload_len as u32).to_le_bytes());
  out.extend_from_slice(&crc.to_le_bytes());
  out.extend_from_slice(&prefix);
  out.extend_from_slice(&record.value);
  Ok(())
}

fn decode_payload(payload: &[u8]) -> Result<Record> {
  let (index, used) = varint::decode(payload)?;
  let (timestamp_ms, used_ts) = varint::decode(&payload[used..])?;
  let value = payload[used + used_ts..].to_vec();
  Ok(Record {
    index,
    timestamp_ms,
    value,
  })
}

/// Why a scan stopped before the end of the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanStop {
  /// Clean end of file.
  Eof,
  /// A frame extended past the end of the file.
  PartialFrame,
  /// A frame failed its checksum.
  CrcMismatch { stored: u32, computed: u32 },
}

/// Result of scanning a segment file.
#[derive(Debug)]
pub struct ScanOutcome {
  pub header: SegmentHeader,
  pub last_index: Option<LogIndex>,
  /// Byte length of the valid prefix (header plus whole good frames).
  pub valid_len: u64,
  pub stop: ScanStop,
}

/// Scans every frame of a segment file, calling `visit` with each decoded
/// record and the byte offset just past its frame. Corruption stops the scan
/// at the last good frame instead of failing.
pub fn scan_segment(
  path: &Path,
  mut visit: impl FnMut(Record, u64) -> Result<()>,
) -> Result<ScanOutcome> {
  let file = OpenOptions::new().read(true).open(path)?;
  let mut reader = BufReader::new(file);
  let header = SegmentHeader::decode(&mut reader)?;

  let mut offset = SEGMENT_HEADER_SIZE as u64;
  let mut last_index = None;
  loop {
    let payload_len = match reader.read_u32::<LittleEndian>() {
      Ok(value) => value as usize,
      Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => {
        return Ok(ScanOutcome {
          header,
          last_index,
          valid_len: offset,
          stop: ScanStop::Eof,
        });
      }
      Err(error) => return Err(TideError::Io(error)),
    };
    if payload_len > MAX_FRAME_PAYLOAD_BYTES {
      // Treat an absurd length as tail corruption.
      return Ok(ScanOutcome {
        header,
        last_index,
        valid_len: offset,
        stop: ScanStop::PartialFrame,
      });
    }
    let stored_crc = match reader.read_u32::<LittleEndian>() {
      Ok(value) => value,
      Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => {
        return Ok(ScanOutcome {
          header,
          last_index,
          valid_len: offset,
          stop: ScanStop::PartialFrame,
        });
      }
      Err(error) => return Err(TideError::Io(error)),
    };
    let mut payload = vec![0u8; payload_len];
    match reader.read_exact(&mut payload) {
      Ok(()) => {}
      Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => {
        return Ok(ScanOutcome {
          header,
          last_index,
          valid_len: offset,
          stop: ScanStop::PartialFrame,
        });
      }
      Err(error) => return Err(TideError::Io(error)),
    }

    let computed = crc32c(&payload);
    if computed != stored_crc {
      return Ok(ScanOutcome {
        header,
        last_index,
        valid_len: offset,
        stop: ScanStop::CrcMismatch {
          stored: stored_crc,
          computed,
        },
      });
    }

    let record = decode_payload(&payload)?;
    offset += (FRAME_HEADER_SIZE + payload_len) as u64;
    last_index = Some(record.index);
    visit(record, offset)?;
  }
}

// ============================================================================
// File naming
// ============================================================================

pub fn sealed_file_name(first_index: LogIndex, last_index: LogIndex) -> String {
  format!("segment-{first_index:020}-{last_index:020}{EXT_SEALED}")
}

pub fn active_file_name(first_index: LogIndex) -> String {
  format!("segment-{first_index:020}{EXT_ACTIVE}")
}

/// Parses a sealed segment file name into `(first_index, last_index)`.
pub fn parse_sealed_file_name(name: &str) -> Option<(LogIndex, LogIndex)> {
  let stem = name.strip_prefix("segment-")?.strip_suffix(EXT_SEALED)?;
  let (first, last) = stem.split_once('-')?;
  Some((first.parse().ok()?, last.parse().ok()?))
}

/// Parses an active segment file name into its `first_index`.
pub fn parse_active_file_name(name: &str) -> Option<LogIndex> {
  let stem = name.strip_prefix("segment-")?.strip_suffix(EXT_ACTIVE)?;
  stem.parse().ok()
}

// ============================================================================
// Sealed segments
// ============================================================================

/// An immutable, fully validated segment.
#[derive(Debug, Clone)]
pub struct SealedSegment {
  pub path: PathBuf,
  pub first_index: LogIndex,
  pub last_index: LogIndex,
  pub size_bytes: u64,
  pub created_at_ms: u64,
}

impl SealedSegment {
  /// Reads records with `index >= from`, appending to `out` until `budget`
  /// bytes of values have been collected. At least one record is returned if
  /// any qualifies. Returns the bytes consumed from the budget.
  pub fn read_from(&self, from: LogIndex, budget: u64, out: &mut Vec<Record>) -> Result<u64> {
    read_records(&self.path, from, budget, out)
  }
}

fn read_records(path: &Path, from: LogIndex, budget: u64, out: &mut Vec<Record>) -> Result<u64> {
  let mut consumed = 0u64;
  let mut done = false;
  scan_segment(path, |record, _| {
    if done || record.index < from {
      return Ok(());
    }
    let cost = frame_len(&record);
    if consumed > 0 && consumed + cost > budget {
      done = true;
      return Ok(());
    }
    consumed += cost;
    out.push(record);
    Ok(())
  })?;
  Ok(consumed)
}

// ============================================================================
// The active segment
// ============================================================================

/// The single mutable tail segment of a journal.
#[derive(Debug)]
pub struct ActiveSegment {
  pub path: PathBuf,
  pub header: SegmentHeader,
  file: File,
  /// Last index written, or `first_index - 1` while empty.
  pub last_index: LogIndex,
  pub size_bytes: u64,
}

impl ActiveSegment {
  /// Creates a fresh active segment whose first record will be `first_index`.
  pub fn create(
    dir: &Path,
    first_index: LogIndex,
    max_bytes: u64,
    created_at_ms: u64,
  ) -> Result<Self> {
    let path = dir.join(active_file_name(first_index));
    let mut file = OpenOptions::new()
      .create(true)
      .truncate(true)
      .read(true)
      .write(true)
      .open(&path)?;
    let header = SegmentHeader {
      first_index,
      max_bytes,
      created_at_ms,
    };
    file.write_all(&header.encode())?;
    file.sync_all()?;
    Ok(Self {
      path,
      header,
      file,
      last_index: first_index.saturating_sub(1),
      size_bytes: SEGMENT_HEADER_SIZE as u64,
    })
  }

  /// Reopens an existing active segment file after a validating scan has
  /// established its `last_index` and valid length. The file is truncated to
  /// the valid prefix.
  pub fn reopen(path: PathBuf, outcome: &ScanOutcome) -> Result<Self> {
    let file = OpenOptions::new().read(true).write(true).open(&path)?;
    file.set_len(outcome.valid_len)?;
    let mut segment = Self {
      path,
      header: outcome.header,
      file,
      last_index: outcome
        .last_index
        .unwrap_or(outcome.header.first_index.saturating_sub(1)),
      size_bytes: outcome.valid_len,
    };
    segment.file.seek(SeekFrom::End(0))?;
    if !matches!(outcome.stop, ScanStop::Eof) {
      warn!(
        "truncated corrupt tail of {} at offset {} ({:?})",
        segment.path.display(),
        outcome.valid_len,
        outcome.stop
      );
      segment.file.sync_all()?;
    }
    Ok(segment)
  }

  pub fn is_empty(&self) -> bool {
    self.last_index < self.header.first_index
  }

  /// Appends one record frame. The caller is responsible for index
  /// continuity; this only rejects non-consecutive indices.
  pub fn append(&mut self, record: &Record) -> Result<u64> {
    let expected = self.last_index + 1;
    if record.index != expected {
      return Err(TideError::Internal(format!(
        "active segment expected index {expected}, got {}",
        record.index
      )));
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + record.frame_payload_len());
    encode_frame(record, &mut frame)?;
    self.file.write_all(&frame)?;
    self.last_index = record.index;
    self.size_bytes += frame.len() as u64;
    Ok(frame.len() as u64)
  }

  pub fn sync(&mut self) -> Result<()> {
    self.file.sync_all()?;
    Ok(())
  }

  /// Removes every frame with `index > through`, rescanning the file to find
  /// the cut offset. `through` below `first_index - 1` empties the segment.
  pub fn truncate_to(&mut self, through: LogIndex) -> Result<()> {
    if through >= self.last_index {
      return Ok(());
    }
    let mut cut = SEGMENT_HEADER_SIZE as u64;
    scan_segment(&self.path, |record, end_offset| {
      if record.index <= through {
        cut = end_offset;
      }
      Ok(())
    })?;
    self.file.set_len(cut)?;
    self.file.seek(SeekFrom::End(0))?;
    self.file.sync_all()?;
    self.size_bytes = cut;
    self.last_index = if cut > SEGMENT_HEADER_SIZE as u64 {
      through
    } else {
      self.header.first_index.saturating_sub(1)
    };
    Ok(())
  }

  /// Seals this segment: fsync, then rename into the sealed naming scheme.
  /// The segment must be non-empty. The caller replaces `self` with a fresh
  /// active segment afterwards; sealing happens first so a crash never
  /// leaves two mutable tails on disk.
  pub fn seal(&mut self) -> Result<SealedSegment> {
    if self.is_empty() {
      return Err(TideError::Internal(
        "refusing to seal an empty active segment".to_string(),
      ));
    }
    self.file.sync_all()?;
    let sealed_path = self
      .path
      .parent()
      .map(|parent| parent.join(sealed_file_name(self.header.first_index, self.last_index)))
      .ok_or_else(|| TideError::Internal("active segment has no parent directory".to_string()))?;
    fs::rename(&self.path, &sealed_path)?;
    self.path = sealed_path.clone();
    Ok(SealedSegment {
      path: sealed_path,
      first_index: self.header.first_index,
      last_index: self.last_index,
      size_bytes: self.size_bytes,
      created_at_ms: self.header.created_at_ms,
    })
  }

  /// Reads records with `index >= from` up to `budget` bytes, like
  /// [`SealedSegment::read_from`].
  pub fn read_from(&self, from: LogIndex, budget: u64, out: &mut Vec<Record>) -> Result<u64> {
    if self.is_empty() || from > self.last_index {
      return Ok(0);
    }
    read_records(&self.path, from, budget, out)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::util::time::now_ms;

  fn record(index: u64, value: &[u8]) -> Record {
    Record::new(index, 1_700_000_000_000 + index, value.to_vec())
  }

  #[test]
  fn append_then_scan_roundtrip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut active = ActiveSegment::create(dir.path(), 1, 1024 * 1024, now_ms()).expect("create");
    active.append(&record(1, b"hello")).expect("append");
    active.append(&record(2, b"world")).expect("append");
    active.sync().expect("sync");

    let mut seen = Vec::new();
    let outcome = scan_segment(&active.path, |r, _| {
      seen.push(r);
      Ok(())
    })
    .expect("scan");

    assert_eq!(outcome.last_index, Some(2));
    assert_eq!(outcome.stop, ScanStop::Eof);
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].value, b"hello");
    assert_eq!(seen[1].value, b"world");
  }

  #[test]
  fn partial_trailing_frame_is_detected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut active = ActiveSegment::create(dir.path(), 1, 1024, now_ms()).expect("create");
    active.append(&record(1, b"abc")).expect("append");
    active.append(&record(2, b"def")).expect("append");
    active.sync().expect("sync");

    let len = fs::metadata(&active.path).expect("metadata").len();
    let file = OpenOptions::new()
      .write(true)
      .open(&active.path)
      .expect("open");
    file.set_len(len - 2).expect("chop tail");

    let outcome = scan_segment(&active.path, |_, _| Ok(())).expect("scan");
    assert_eq!(outcome.last_index, Some(1));
    assert_eq!(outcome.stop, ScanStop::PartialFrame);
  }

  #[test]
  fn crc_mismatch_stops_at_prior_frame() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut active = ActiveSegment::create(dir.path(), 1, 1024, now_ms()).expect("create");
    active.append(&record(1, b"good")).expect("append");
    let second_start = active.size_bytes;
    active.append(&record(2, b"flip")).expect("append");
    active.sync().expect("sync");

    // Flip a payload byte of the second frame.
    let mut bytes = fs::read(&active.path).expect("read");
    let victim = second_start as usize + FRAME_HEADER_SIZE + 1;
    bytes[victim] ^= 0xFF;
    fs::write(&active.path, bytes).expect("write");

    let outcome = scan_segment(&active.path, |_, _| Ok(())).expect("scan");
    assert_eq!(outcome.last_index, Some(1));
    assert!(matches!(outcome.stop, ScanStop::CrcMismatch { .. }));
    assert_eq!(outcome.valid_len, second_start);
  }

  #[test]
  fn seal_renames_with_index_range() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut active = ActiveSegment::create(dir.path(), 5, 1024, now_ms()).expect("create");
    active.append(&record(5, b"x")).expect("append");
    active.append(&record(6, b"y")).expect("append");

    let sealed = active.seal().expect("seal");
    assert_eq!(sealed.first_index, 5);
    assert_eq!(sealed.last_index, 6);
    assert!(sealed.path.exists());
    assert_eq!(
      parse_sealed_file_name(sealed.path.file_name().unwrap().to_str().unwrap()),
      Some((5, 6))
    );
  }

  #[test]
  fn truncate_to_drops_suffix() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut active = ActiveSegment::create(dir.path(), 1, 4096, now_ms()).expect("create");
    for i in 1..=5 {
      active.append(&record(i, b"payload")).expect("append");
    }
    active.truncate_to(3).expect("truncate");
    assert_eq!(active.last_index, 3);

    let outcome = scan_segment(&active.path, |_, _| Ok(())).expect("scan");
    assert_eq!(outcome.last_index, Some(3));
    assert_eq!(outcome.stop, ScanStop::Eof);
  }

  #[test]
  fn read_from_respects_budget() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut active = ActiveSegment::create(dir.path(), 1, 1 << 20, now_ms()).expect("create");
    for i in 1..=10 {
      active.append(&record(i, &[0u8; 100])).expect("append");
    }
    let mut out = Vec::new();
    active.read_from(4, 250, &mut out).expect("read");
    // Budget fits two ~110 byte frames; at least one is always returned.
    assert!(!out.is_empty() && out.len() <= 3);
    assert_eq!(out[0].index, 4);
  }
}
