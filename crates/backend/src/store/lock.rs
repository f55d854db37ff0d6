// Single-writer ownership of a store directory

use std::{
  fs::{File, OpenOptions},
  path::{Path, PathBuf},
};

use fs4::fs_std::FileExt;
use tracing::debug;

use super::{Result, StoreError};

/// Exclusive advisory lock on `<store>.lock`, held while the value lives.
///
/// Only one process may write a store at a time: the daemon, or a one-shot
/// `backfill`/`resync`. Read-only commands do not take it.
#[derive(Debug)]
pub struct StoreLock {
  path: PathBuf,
  _file: File,
}

impl StoreLock {
  pub fn acquire(db_path: &Path) -> Result<Self> {
    let path = lock_path(db_path);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new().create(true).truncate(false).write(true).open(&path)?;
    if !file.try_lock_exclusive()? {
      return Err(StoreError::Locked(path));
    }

    debug!(path = %path.display(), "Store lock acquired");
    Ok(Self { path, _file: file })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

fn lock_path(db_path: &Path) -> PathBuf {
  let mut name = db_path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
  name.push(".lock");
  db_path.with_file_name(name)
}
