//! Content-addressed blob store for attachment bodies.
//!
//! Blobs live in a flat directory, one file per distinct content, named by
//! the lowercase hex SHA-1 of the bytes. Writes stream through a temp file
//! in the same directory and finish with an atomic rename, so concurrent
//! writers of identical content race harmlessly (last writer wins with the
//! same bytes). Temp files orphaned by a crash carry a `temp-` prefix and
//! are removed by the startup sweep.

use crate::error::{CoreError, CoreResult};
use sha1::{Digest, Sha1};
use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

const TEMP_PREFIX: &str = "temp-";

/// SHA-1 key of a stored blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobKey(pub [u8; 20]);

impl BlobKey {
    /// Parses a key from lowercase hex.
    pub fn from_hex(s: &str) -> CoreResult<Self> {
        let bytes = hex::decode(s)
            .map_err(|_| CoreError::invalid_argument(format!("bad blob key: {s}")))?;
        Self::from_bytes(&bytes)
    }

    /// Builds a key from a 20-byte digest.
    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        let arr: [u8; 20] = bytes
            .try_into()
            .map_err(|_| CoreError::invalid_argument("blob key must be 20 bytes"))?;
        Ok(Self(arr))
    }

    /// Returns the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Directory-backed content-addressed store.
pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    /// Opens the blob directory, creating it if needed, and sweeps any
    /// orphaned temp files left by a crashed writer.
    pub fn open(dir: &Path) -> CoreResult<Self> {
        fs::create_dir_all(dir)?;
        let store = Self {
            dir: dir.to_path_buf(),
        };
        let swept = store.sweep_temp_files()?;
        if swept > 0 {
            warn!(count = swept, "removed orphaned temp blob files");
        }
        Ok(store)
    }

    /// Streams `reader` into the store.
    ///
    /// Returns the content key and the number of bytes written. The digest
    /// is computed incrementally while copying, so the input is read once.
    pub fn put(&self, reader: &mut dyn Read) -> CoreResult<(BlobKey, u64)> {
        let temp_path = self.dir.join(format!("{TEMP_PREFIX}{}", Uuid::new_v4()));
        let mut file = File::create(&temp_path)?;
        let mut hasher = Sha1::new();
        let mut length = 0u64;
        let mut buf = [0u8; 16 * 1024];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    drop(file);
                    let _ = fs::remove_file(&temp_path);
                    return Err(e.into());
                }
            };
            hasher.update(&buf[..n]);
            if let Err(e) = file.write_all(&buf[..n]) {
                drop(file);
                let _ = fs::remove_file(&temp_path);
                return Err(e.into());
            }
            length += n as u64;
        }
        file.sync_all()?;
        drop(file);

        let key = BlobKey(hasher.finalize().into());
        // Atomic on the same filesystem; identical content makes the
        // last-writer-wins race benign.
        fs::rename(&temp_path, self.path_for(&key))?;
        debug!(%key, length, "stored blob");
        Ok((key, length))
    }

    /// Stores a byte slice. Convenience over [`BlobStore::put`].
    pub fn put_bytes(&self, bytes: &[u8]) -> CoreResult<(BlobKey, u64)> {
        let mut cursor = io::Cursor::new(bytes);
        self.put(&mut cursor)
    }

    /// Opens the blob for reading.
    pub fn get(&self, key: &BlobKey) -> CoreResult<File> {
        OpenOptions::new()
            .read(true)
            .open(self.path_for(key))
            .map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    CoreError::AttachmentMissing {
                        key: key.to_string(),
                    }
                } else {
                    e.into()
                }
            })
    }

    /// Returns true if the blob is present.
    pub fn exists(&self, key: &BlobKey) -> bool {
        self.path_for(key).exists()
    }

    /// Removes the blob if present. Removing an absent blob is a no-op.
    pub fn remove(&self, key: &BlobKey) -> CoreResult<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes every blob whose key is not in `live`.
    ///
    /// Returns the number of blobs removed.
    pub fn gc(&self, live: &HashSet<BlobKey>) -> CoreResult<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(TEMP_PREFIX) {
                continue;
            }
            let Ok(key) = BlobKey::from_hex(name) else {
                continue;
            };
            if !live.contains(&key) {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        debug!(removed, "blob gc complete");
        Ok(removed)
    }

    /// Removes `temp-` prefixed files, returning how many were deleted.
    pub fn sweep_temp_files(&self) -> CoreResult<usize> {
        let mut swept = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.starts_with(TEMP_PREFIX))
            {
                fs::remove_file(entry.path())?;
                swept += 1;
            }
        }
        Ok(swept)
    }

    fn path_for(&self, key: &BlobKey) -> PathBuf {
        self.dir.join(key.to_string())
    }
}
