//! Tile files on disk.
//!
//! Writes go through a temporary file and a rename so readers never see a
//! partial tile.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::error::{Error, Result};
use crate::tile::now_millis;

/// Tile files addressed by relative path.
///
/// New files are written under the write root. Lookups also search the
/// read-only roots, in order, after the write root.
#[derive(Debug, Clone)]
pub struct FileStore {
    write_root: PathBuf,
    read_roots: Vec<PathBuf>,
}

impl FileStore {
    #[must_use]
    pub fn new(write_root: impl Into<PathBuf>) -> Self {
        Self {
            write_root: write_root.into(),
            read_roots: Vec::new(),
        }
    }

    /// Add a read-only root searched after the write root.
    #[must_use]
    pub fn with_read_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.read_roots.push(root.into());
        self
    }

    #[must_use]
    pub fn write_root(&self) -> &Path {
        &self.write_root
    }

    /// Absolute location of an existing file, if any root holds it.
    #[must_use]
    pub fn find(&self, path: &str) -> Option<PathBuf> {
        std::iter::once(&self.write_root)
            .chain(&self.read_roots)
            .map(|root| root.join(path))
            .find(|candidate| candidate.is_file())
    }

    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.find(path).is_some()
    }

    /// Location for a new file under the write root, creating parent
    /// directories as needed.
    pub fn new_file(&self, path: &str) -> Result<PathBuf> {
        let target = self.write_root.join(path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::io("create directory", parent, e))?;
        }
        Ok(target)
    }

    /// Write `bytes` to `path` through a temporary file and a rename, so
    /// readers never observe a partial file.
    pub fn write_atomic(&self, path: &str, bytes: &[u8]) -> Result<PathBuf> {
        let target = self.new_file(path)?;
        let mut temp_name = target.as_os_str().to_owned();
        temp_name.push(".tmp");
        let temp = PathBuf::from(temp_name);

        std::fs::write(&temp, bytes).map_err(|e| Error::io("write", &temp, e))?;
        if let Err(e) = std::fs::rename(&temp, &target) {
            let _ = std::fs::remove_file(&temp);
            return Err(Error::io("rename", &target, e));
        }
        Ok(target)
    }

    /// Remove a file previously returned by [`FileStore::find`].
    pub fn remove_file(&self, file: &Path) -> Result<()> {
        match std::fs::remove_file(file) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io("remove", file, e)),
        }
    }

    /// Whether `file` was last modified before `expiry_time` (ms since the
    /// epoch). Unset or future expiry times never expire anything.
    #[must_use]
    pub fn is_file_expired(&self, file: &Path, expiry_time: i64) -> bool {
        if expiry_time <= 0 || expiry_time > now_millis() {
            return false;
        }
        let Ok(modified) = std::fs::metadata(file).and_then(|m| m.modified()) else {
            return false;
        };
        modified
            .duration_since(UNIX_EPOCH)
            .map_or(true, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX) < expiry_time)
    }

    /// Size in bytes of a stored file.
    #[must_use]
    pub fn file_size(&self, path: &str) -> Option<u64> {
        let file = self.find(path)?;
        std::fs::metadata(file).ok().map(|m| m.len())
    }
}
