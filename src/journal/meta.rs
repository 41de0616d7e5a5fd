//! Durable journal metadata sidecar.

use crate::error::{Result, TideError};
use crate::types::LogIndex;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Contents of the `meta` sidecar, rewritten atomically on commit advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalMeta {
  pub first_index: LogIndex,
  pub last_index: LogIndex,
  pub commit_index: LogIndex,
}

impl Default for JournalMeta {
  fn default() -> Self {
    Self {
      first_index: 1,
      last_index: 0,
      commit_index: 0,
    }
  }
}

#[derive(Debug)]
pub struct MetaStore {
  path: PathBuf,
}

impl MetaStore {
  pub fn new(path: PathBuf) -> Self {
    Self { path }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn load(&self) -> Result<JournalMeta> {
    if !self.path.exists() {
      return Ok(JournalMeta::default());
    }
    let bytes = std::fs::read(&self.path)?;
    serde_json::from_slice(&bytes)
      .map_err(|error| TideError::Serialization(format!("decode journal meta failed: {error}")))
  }

  pub fn store(&self, meta: &JournalMeta) -> Result<()> {
    let bytes = serde_json::to_vec(meta)
      .map_err(|error| TideError::Serialization(format!("encode journal meta failed: {error}")))?;

    let tmp_path = self.path.with_extension("tmp");
    let mut file = OpenOptions::new()
      .create(true)
      .truncate(true)
      .write(true)
      .open(&tmp_path)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    std::fs::rename(&tmp_path, &self.path)?;
    sync_parent_dir(self.path.parent())?;
    Ok(())
  }
}

fn sync_parent_dir(parent: Option<&Path>) -> Result<()> {
  #[cfg(unix)]
  {
    if let Some(parent) = parent {
      std::fs::File::open(parent)?.sync_all()?;
    }
  }

  #[cfg(not(unix))]
  {
    let _ = parent;
  }

  Ok(())
}
