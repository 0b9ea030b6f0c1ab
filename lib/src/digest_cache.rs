//! Per-file content digest caching.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::hash::{sha256_reader, Digest};
use crate::Result;

/// Caches content digests keyed by canonical path, so an input referenced
/// from many targets (or many concurrent layer writers) is hashed once.
///
/// Shared between writers behind an `Arc`; lookups take a read lock and
/// insertion is double-checked, so concurrent `digest` calls for the same
/// path settle on a single value.
#[derive(Debug, Default)]
pub struct FileDigestCache {
    inner: RwLock<HashMap<PathBuf, (Digest, u64)>>,
}

impl FileDigestCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// The content digest and size of the file at `path`.
    ///
    /// Symlinks are resolved before consulting the cache, so every alias of
    /// a file shares one entry. I/O errors propagate; nothing is cached for
    /// a failed read.
    pub fn digest(&self, path: &Path) -> Result<(Digest, u64)> {
        let real = std::fs::canonicalize(path)?;
        if let Some(hit) = self.inner.read().unwrap().get(&real) {
            return Ok(hit.clone());
        }
        let computed = sha256_reader(File::open(&real)?)?;
        let mut entries = self.inner.write().unwrap();
        // A concurrent caller may have inserted while we hashed; keep the
        // first value so all callers observe the same one.
        let entry = entries.entry(real).or_insert(computed);
        Ok(entry.clone())
    }

    /// Forget the cached digest for `path`, if any. Cached values are
    /// never evicted otherwise.
    pub fn invalidate(&self, path: &Path) -> Result<()> {
        let real = std::fs::canonicalize(path)?;
        self.inner.write().unwrap().remove(&real);
        Ok(())
    }
}
