//! Segmented on-disk journal.
//!
//! A journal is an ordered run of segment files plus a durable `meta`
//! sidecar. Exactly one segment (the tail) is mutable; sealing renames it
//! into the immutable naming scheme. Compaction deletes whole sealed
//! segments from the front, by total size or by age, never past the commit
//! index.

use crate::config::{PartitionConfig, SyncMode};
use crate::constants::*;
use crate::error::{Result, TideError};
use crate::types::{LogIndex, Record};
use crate::util::hash::payload_hash;
use crate::util::time::now_ms;
use fs2::FileExt;
use log::{info, warn};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

pub mod meta;
pub mod segment;

use meta::{JournalMeta, MetaStore};
use segment::{ActiveSegment, ScanStop, SealedSegment};

/// Journal-level knobs, extracted from the partition configuration.
#[derive(Debug, Clone)]
pub struct JournalOptions {
  pub max_segment_bytes: u64,
  pub max_log_bytes: u64,
  pub max_log_age_ms: Option<u64>,
  pub sync_mode: SyncMode,
}

impl Default for JournalOptions {
  fn default() -> Self {
    Self {
      max_segment_bytes: DEFAULT_MAX_SEGMENT_BYTES,
      max_log_bytes: 0,
      max_log_age_ms: None,
      sync_mode: SyncMode::OnCommit,
    }
  }
}

impl From<&PartitionConfig> for JournalOptions {
  fn from(config: &PartitionConfig) -> Self {
    Self {
      max_segment_bytes: config.max_segment_bytes,
      max_log_bytes: config.max_log_bytes,
      max_log_age_ms: config.max_log_age_ms,
      sync_mode: config.sync_mode,
    }
  }
}

/// Introspection data for one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
  pub first_index: LogIndex,
  pub last_index: LogIndex,
  pub size_bytes: u64,
  pub created_at_ms: u64,
  pub sealed: bool,
}

/// Outcome of a compaction pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompactionOutcome {
  pub deleted_segments: usize,
  pub first_index: LogIndex,
}

#[derive(Debug)]
pub struct Journal {
  dir: PathBuf,
  options: JournalOptions,
  sealed: Vec<SealedSegment>,
  active: ActiveSegment,
  commit_index: LogIndex,
  meta_store: MetaStore,
  poisoned: bool,
  _lock_file: File,
}

impl Journal {
  /// Opens (or creates) the journal in `dir`, validating every segment by a
  /// full scan. Corrupt tails are truncated at the last good frame.
  pub fn open(dir: impl AsRef<Path>, options: JournalOptions) -> Result<Self> {
    let dir = dir.as_ref().to_path_buf();
    fs::create_dir_all(&dir)?;

    let lock_path = dir.join(JOURNAL_LOCK_FILE_NAME);
    let lock_file = OpenOptions::new()
      .create(true)
      .read(true)
      .write(true)
      .open(&lock_path)?;
    lock_file.try_lock_exclusive().map_err(|error| {
      TideError::LockFailed(format!(
        "journal directory is locked by another process: {} ({error})",
        lock_path.display()
      ))
    })?;

    let meta_store = MetaStore::new(dir.join(META_FILE_NAME));
    let meta = meta_store.load()?;

    let (sealed, active) = Self::recover_segments(&dir, &options, &meta)?;

    let last_index = active.last_index;
    if meta.commit_index > last_index {
      warn!(
        "journal {} lost records past the durable commit index ({} > {})",
        dir.display(),
        meta.commit_index,
        last_index
      );
    }
    let commit_index = meta.commit_index.min(last_index);

    let mut journal = Self {
      dir,
      options,
      sealed,
      active,
      commit_index,
      meta_store,
      poisoned: false,
      _lock_file: lock_file,
    };
    journal.persist_meta()?;
    Ok(journal)
  }

  fn recover_segments(
    dir: &Path,
    options: &JournalOptions,
    meta: &JournalMeta,
  ) -> Result<(Vec<SealedSegment>, ActiveSegment)> {
    let mut sealed_names: Vec<(LogIndex, LogIndex, PathBuf)> = Vec::new();
    let mut active_name: Option<(LogIndex, PathBuf)> = None;

    for entry in fs::read_dir(dir)? {
      let entry = entry?;
      let name = entry.file_name();
      let Some(name) = name.to_str() else { continue };
      if let Some((first, last)) = segment::parse_sealed_file_name(name) {
        sealed_names.push((first, last, entry.path()));
      } else if let Some(first) = segment::parse_active_file_name(name) {
        if let Some((other, _)) = &active_name {
          return Err(TideError::InvalidSegment(format!(
            "multiple active segments in {}: first indices {other} and {first}",
            dir.display()
          )));
        }
        active_name = Some((first, entry.path()));
      }
    }
    sealed_names.sort_by_key(|(first, _, _)| *first);

    let mut sealed: Vec<SealedSegment> = Vec::with_capacity(sealed_names.len());
    let mut broken_tail: Option<ActiveSegment> = None;

    for (first, last, path) in &sealed_names {
      if let Some(previous) = sealed.last() {
        if previous.last_index + 1 != *first {
          return Err(TideError::InvalidSegment(format!(
            "gap between segments: {} then {}",
            previous.last_index, first
          )));
        }
      }
      let outcome = segment::scan_segment(path, |_, _| Ok(()))?;
      if outcome.header.first_index != *first {
        return Err(TideError::InvalidSegment(format!(
          "segment {} header claims first index {}",
          path.display(),
          outcome.header.first_index
        )));
      }
      let intact = matches!(outcome.stop, ScanStop::Eof) && outcome.last_index == Some(*last);
      if intact {
        sealed.push(SealedSegment {
          path: path.clone(),
          first_index: *first,
          last_index: *last,
          size_bytes: outcome.valid_len,
          created_at_ms: outcome.header.created_at_ms,
        });
        continue;
      }

      // A sealed segment with a bad tail becomes the new mutable tail; every
      // later file is unreachable without a gap and is dropped.
      warn!(
        "sealed segment {} is damaged ({:?}); reopening as the tail",
        path.display(),
        outcome.stop
      );
      let reopened_path = dir.join(segment::active_file_name(*first));
      fs::rename(path, &reopened_path)?;
      broken_tail = Some(ActiveSegment::reopen(reopened_path, &outcome)?);
      break;
    }

    if let Some(tail) = broken_tail {
      let keep_below = tail.header.first_index;
      for (first, _, path) in &sealed_names {
        if *first > keep_below {
          warn!("dropping unreachable segment {}", path.display());
          fs::remove_file(path)?;
        }
      }
      if let Some((_, path)) = &active_name {
        warn!("dropping unreachable segment {}", path.display());
        fs::remove_file(path)?;
      }
      return Ok((sealed, tail));
    }

    let expected_first = sealed
      .last()
      .map(|segment| segment.last_index + 1)
      .unwrap_or_else(|| meta.last_index.max(meta.first_index.saturating_sub(1)) + 1);

    let active = match active_name {
      Some((first, path)) => {
        if first != expected_first {
          return Err(TideError::InvalidSegment(format!(
            "active segment starts at {first}, expected {expected_first}"
          )));
        }
        let outcome = segment::scan_segment(&path, |_, _| Ok(()))?;
        ActiveSegment::reopen(path, &outcome)?
      }
      None => ActiveSegment::create(dir, expected_first, options.max_segment_bytes, now_ms())?,
    };

    Ok((sealed, active))
  }

  // ==========================================================================
  // Accessors
  // ==========================================================================

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  /// Index of the oldest retained record (1 when nothing was compacted).
  pub fn first_index(&self) -> LogIndex {
    self
      .sealed
      .first()
      .map(|segment| segment.first_index)
      .unwrap_or(self.active.header.first_index)
  }

  pub fn last_index(&self) -> LogIndex {
    self.active.last_index
  }

  pub fn commit_index(&self) -> LogIndex {
    self.commit_index
  }

  pub fn is_poisoned(&self) -> bool {
    self.poisoned
  }

  pub fn total_bytes(&self) -> u64 {
    self
      .sealed
      .iter()
      .map(|segment| segment.size_bytes)
      .sum::<u64>()
      + self.active.size_bytes
  }

  pub fn segments(&self) -> Vec<SegmentInfo> {
    let mut infos: Vec<SegmentInfo> = self
      .sealed
      .iter()
      .map(|segment| SegmentInfo {
        first_index: segment.first_index,
        last_index: segment.last_index,
        size_bytes: segment.size_bytes,
        created_at_ms: segment.created_at_ms,
        sealed: true,
      })
      .collect();
    infos.push(SegmentInfo {
      first_index: self.active.header.first_index,
      last_index: self.active.last_index,
      size_bytes: self.active.size_bytes,
      created_at_ms: self.active.header.created_at_ms,
      sealed: false,
    });
    infos
  }

  // ==========================================================================
  // Mutation
  // ==========================================================================

  /// Appends a new record with the next index and the current wall clock.
  /// Returns the stored record so callers can replicate it verbatim.
  pub fn append(&mut self, value: Vec<u8>) -> Result<Record> {
    let record = Record::new(self.last_index() + 1, now_ms(), value);
    self.append_entry(&record)?;
    Ok(record)
  }

  /// Appends a replicated record at its exact index and timestamp. The index
  /// must be `last_index + 1`.
  pub fn append_entry(&mut self, record: &Record) -> Result<()> {
    if self.poisoned {
      return Err(TideError::Poisoned);
    }
    let expected = self.last_index() + 1;
    if record.index != expected {
      return Err(TideError::Internal(format!(
        "journal expected index {expected}, got {}",
        record.index
      )));
    }

    let frame = segment::frame_len(record);
    if !self.active.is_empty() && self.active.size_bytes + frame > self.options.max_segment_bytes {
      let result = self.roll_active(record.index);
      self.poison_on_err(&result)?;
    }

    let result = self.active.append(record).map(|_| ());
    self.poison_on_err(&result)?;

    if matches!(self.options.sync_mode, SyncMode::Always) {
      let result = self.active.sync();
      self.poison_on_err(&result)?;
    }
    Ok(())
  }

  fn roll_active(&mut self, next_index: LogIndex) -> Result<()> {
    let sealed = self.active.seal()?;
    info!(
      "sealed segment [{}, {}] ({} bytes)",
      sealed.first_index, sealed.last_index, sealed.size_bytes
    );
    self.sealed.push(sealed);
    self.active = ActiveSegment::create(
      &self.dir,
      next_index,
      self.options.max_segment_bytes,
      now_ms(),
    )?;
    Ok(())
  }

  /// Returns records starting at `max(from, first_index)`, bounded by
  /// `max_bytes` of frame data (always at least one record when any
  /// qualifies), plus the next index to read from.
  pub fn read(&self, from: LogIndex, max_bytes: u64) -> Result<(Vec<Record>, LogIndex)> {
    let from = from.max(self.first_index());
    if from > self.last_index() {
      return Ok((Vec::new(), from));
    }

    let mut out = Vec::new();
    let mut budget = max_bytes.max(1);
    for segment in &self.sealed {
      if segment.last_index < from {
        continue;
      }
      let consumed = segment.read_from(from, budget, &mut out)?;
      budget = budget.saturating_sub(consumed);
      if budget == 0 {
        break;
      }
    }
    if budget > 0 {
      self.active.read_from(from, budget, &mut out)?;
    }

    let next = out.last().map(|record| record.index + 1).unwrap_or(from);
    Ok((out, next))
  }

  /// xxh64 payload hashes for records in `[from, to]`, used by divergence
  /// detection. Missing (compacted or absent) indices are skipped.
  pub fn payload_hashes(&self, from: LogIndex, to: LogIndex) -> Result<Vec<(LogIndex, u64)>> {
    if from > to {
      return Ok(Vec::new());
    }
    let (records, _) = self.read(from, u64::MAX)?;
    Ok(
      records
        .into_iter()
        .take_while(|record| record.index <= to)
        .map(|record| (record.index, payload_hash(record.index, &record.value)))
        .collect(),
    )
  }

  /// Removes all records with index greater than `through`. Fails when that
  /// would drop committed records.
  pub fn truncate_suffix(&mut self, through: LogIndex) -> Result<()> {
    if self.poisoned {
      return Err(TideError::Poisoned);
    }
    if through < self.commit_index {
      return Err(TideError::InvalidTruncate {
        through,
        commit: self.commit_index,
      });
    }
    if through >= self.last_index() {
      return Ok(());
    }

    let result = self.truncate_suffix_inner(through);
    self.poison_on_err(&result)?;
    self.persist_meta()
  }

  fn truncate_suffix_inner(&mut self, through: LogIndex) -> Result<()> {
    if through + 1 >= self.active.header.first_index {
      return self.active.truncate_to(through);
    }

    // The cut lands before the active segment: drop it and every sealed
    // segment wholly above the cut.
    fs::remove_file(&self.active.path)?;
    while let Some(segment) = self.sealed.last() {
      if segment.first_index > through {
        fs::remove_file(&segment.path)?;
        self.sealed.pop();
      } else {
        break;
      }
    }

    match self.sealed.last() {
      Some(segment) if segment.last_index > through => {
        // The cut lands inside this sealed segment: rebuild it as the tail.
        let segment = self.sealed.pop().ok_or_else(|| {
          TideError::Internal("sealed segment vanished during truncate".to_string())
        })?;
        let mut records = Vec::new();
        segment.read_from(segment.first_index, u64::MAX, &mut records)?;
        let mut tail = ActiveSegment::create(
          &self.dir,
          segment.first_index,
          self.options.max_segment_bytes,
          segment.created_at_ms,
        )?;
        for record in records.iter().take_while(|record| record.index <= through) {
          tail.append(record)?;
        }
        tail.sync()?;
        fs::remove_file(&segment.path)?;
        self.active = tail;
      }
      _ => {
        self.active = ActiveSegment::create(
          &self.dir,
          through + 1,
          self.options.max_segment_bytes,
          now_ms(),
        )?;
      }
    }
    Ok(())
  }

  /// Advances the commit index to `min(index, last_index)`, never regressing.
  /// An actual advance durably persists the meta sidecar (and fsyncs the
  /// tail under the default flush policy).
  pub fn commit(&mut self, index: LogIndex) -> Result<LogIndex> {
    if self.poisoned {
      return Err(TideError::Poisoned);
    }
    let target = index.min(self.last_index());
    if target <= self.commit_index {
      return Ok(self.commit_index);
    }
    if !matches!(self.options.sync_mode, SyncMode::Never) {
      let result = self.active.sync();
      self.poison_on_err(&result)?;
    }
    self.commit_index = target;
    self.persist_meta()?;
    Ok(self.commit_index)
  }

  /// Deletes sealed segments that lie entirely below the commit index,
  /// size policy first (oldest-first until under `max_log_bytes`), then age
  /// policy on whatever remains.
  pub fn compact(&mut self, now_ms: u64) -> Result<CompactionOutcome> {
    if self.poisoned {
      return Err(TideError::Poisoned);
    }
    let mut deleted = 0usize;

    if self.options.max_log_bytes > 0 {
      let mut total = self.total_bytes();
      while total > self.options.max_log_bytes {
        let Some(oldest) = self.sealed.first() else {
          break;
        };
        if oldest.last_index >= self.commit_index {
          break;
        }
        total -= oldest.size_bytes;
        self.delete_oldest()?;
        deleted += 1;
      }
    }

    if let Some(max_age) = self.options.max_log_age_ms {
      while let Some(oldest) = self.sealed.first() {
        if oldest.last_index >= self.commit_index {
          break;
        }
        if now_ms.saturating_sub(oldest.created_at_ms) <= max_age {
          break;
        }
        self.delete_oldest()?;
        deleted += 1;
      }
    }

    if deleted > 0 {
      self.persist_meta()?;
      info!(
        "compacted {} segment(s), first index now {}",
        deleted,
        self.first_index()
      );
    }
    Ok(CompactionOutcome {
      deleted_segments: deleted,
      first_index: self.first_index(),
    })
  }

  fn delete_oldest(&mut self) -> Result<()> {
    let oldest = self.sealed.remove(0);
    fs::remove_file(&oldest.path)?;
    Ok(())
  }

  /// Fsyncs the tail segment; backups call this before acknowledging
  /// replicated entries as durable.
  pub fn sync(&mut self) -> Result<()> {
    if self.poisoned {
      return Err(TideError::Poisoned);
    }
    let result = self.active.sync();
    self.poison_on_err(&result)
  }

  /// Flushes and fsyncs the tail segment and meta; used at shutdown.
  pub fn close(&mut self) -> Result<()> {
    if self.poisoned {
      return Err(TideError::Poisoned);
    }
    self.active.sync()?;
    self.persist_meta()
  }

  fn persist_meta(&mut self) -> Result<()> {
    let meta = JournalMeta {
      first_index: self.first_index(),
      last_index: self.last_index(),
      commit_index: self.commit_index,
    };
    let result = self.meta_store.store(&meta);
    self.poison_on_err(&result)
  }

  fn poison_on_err<T>(&mut self, result: &Result<T>) -> Result<()> {
    match result {
      Ok(_) => Ok(()),
      Err(error) => {
        self.poisoned = true;
        Err(TideError::Unavailable(format!(
          "journal poisoned by I/O failure: {error}"
        )))
      }
    }
  }
}
