//! Store directory layout and single-process locking.
//!
//! ```text
//! <store_path>/
//! ├─ LOCK             # Advisory lock for single-writer access
//! ├─ ferry.sqlite3    # Relational store
//! └─ blobs/           # Content-addressed attachment bodies
//! ```

use crate::config::StoreConfig;
use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";

/// Holds the store directory and its exclusive advisory lock.
///
/// Only one `StoreDir` can exist per directory at a time; a second open
/// fails with [`CoreError::StoreLocked`].
#[derive(Debug)]
pub struct StoreDir {
    path: PathBuf,
    _lock_file: File,
}

impl StoreDir {
    /// Opens or creates a store directory and takes its lock.
    pub fn open(path: &Path, config: &StoreConfig) -> CoreResult<Self> {
        if !path.exists() {
            if config.create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_format(format!(
                    "store directory does not exist: {}",
                    path.display()
                )));
            }
        }
        if !path.is_dir() {
            return Err(CoreError::invalid_format(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::StoreLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Path to the store directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path to the SQLite database file.
    pub fn database_path(&self, config: &StoreConfig) -> PathBuf {
        self.path.join(&config.database_file)
    }

    /// Path to the blob directory.
    pub fn blob_path(&self, config: &StoreConfig) -> PathBuf {
        self.path.join(&config.blob_dir)
    }
}
