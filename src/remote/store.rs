//! Node-local object storage for the remote filesystem.

use crate::util::fs as ufs;
use std::io;
use std::path::{Path, PathBuf};

/// Content-addressed file store keyed by `(hash, name)`.
///
/// Objects land at `<root>/<hash as hex>/<name with separators flattened>`;
/// writes are atomic so concurrent readers never observe partial objects.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Opens a store rooted at `root` (created lazily).
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, hash: u64, name: &str) -> PathBuf {
        let flat: String = name
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.root.join(format!("{hash:016x}")).join(flat)
    }

    /// Whether the object exists.
    #[must_use]
    pub fn contains(&self, hash: u64, name: &str) -> bool {
        self.path(hash, name).is_file()
    }

    /// Reads an object; `None` when absent.
    pub fn get(&self, hash: u64, name: &str) -> io::Result<Option<Vec<u8>>> {
        match std::fs::read(self.path(hash, name)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Writes an object. Idempotent; a second write of the same object
    /// replaces it atomically.
    pub fn put(&self, hash: u64, name: &str, data: &[u8]) -> io::Result<()> {
        ufs::atomic_write(&self.path(hash, name), data)
    }

    /// The store's root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}
