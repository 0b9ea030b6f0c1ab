//! Read-only filesystem capability used for tree artifacts.
//!
//! Tree artifacts are hashed ([`crate::merkle`]) and serialized
//! ([`crate::cas::TarCas::store_tree`]) through this narrow trait rather
//! than ambient filesystem access, so callers can hand in a sandboxed
//! directory, and tests can hand in synthetic trees.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use camino::Utf8Path;
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;

use crate::{Error, Result};

/// The kind of a tree entry, after symlink resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeEntryKind {
    /// A regular file (or a symlink resolving to one).
    File,
    /// A directory (or a symlink resolving to one).
    Directory,
    /// Anything else (fifo, socket, device).
    Other,
}

/// Metadata for a tree entry, after symlink resolution.
#[derive(Debug, Clone)]
pub struct TreeMeta {
    /// Entry kind.
    pub kind: TreeEntryKind,
    /// Size in bytes; zero for directories.
    pub size: u64,
    /// Unix permission bits, when the backing store has them.
    pub mode: Option<u32>,
    /// Modification time as seconds since the epoch, when available.
    pub mtime: Option<u64>,
}

/// A read-only view of a filesystem subtree.
///
/// Paths are relative to the tree root; the root itself is `.`. All
/// operations follow symlinks, so a symlink to a file is indistinguishable
/// from the file itself.
pub trait TreeFs {
    /// List the names of the children of directory `path`, in any order.
    fn read_dir(&self, path: &Utf8Path) -> Result<Vec<String>>;

    /// Metadata for `path`.
    fn metadata(&self, path: &Utf8Path) -> Result<TreeMeta>;

    /// Open the regular file at `path` for reading.
    fn open(&self, path: &Utf8Path) -> Result<Box<dyn Read + '_>>;

    /// The on-disk path backing `path`, for trees that are real
    /// directories. Used to route content hashing through the shared
    /// [`crate::digest_cache::FileDigestCache`].
    fn os_path(&self, _path: &Utf8Path) -> Option<PathBuf> {
        None
    }
}

/// A [`TreeFs`] over an on-disk directory, opened via `cap-std` so reads
/// cannot escape the tree root.
#[derive(Debug)]
pub struct DiskTree {
    dir: Dir,
    root: PathBuf,
}

impl DiskTree {
    /// Open the directory at `path` as a tree root.
    pub fn open(path: &Path) -> Result<Self> {
        let dir = Dir::open_ambient_dir(path, cap_std::ambient_authority())?;
        Ok(Self {
            dir,
            root: path.to_owned(),
        })
    }
}

impl TreeFs for DiskTree {
    fn read_dir(&self, path: &Utf8Path) -> Result<Vec<String>> {
        let mut ret = Vec::new();
        for entry in self.dir.read_dir(path.as_std_path())? {
            let entry = entry?;
            let name = entry.file_name().into_string().map_err(|name| {
                Error::UnsupportedEntry(path.join(name.to_string_lossy().as_ref()))
            })?;
            ret.push(name);
        }
        Ok(ret)
    }

    fn metadata(&self, path: &Utf8Path) -> Result<TreeMeta> {
        let meta = self.dir.metadata(path.as_std_path())?;
        let kind = if meta.is_file() {
            TreeEntryKind::File
        } else if meta.is_dir() {
            TreeEntryKind::Directory
        } else {
            TreeEntryKind::Other
        };
        #[cfg(unix)]
        let mode = {
            use cap_std_ext::cap_std::fs::MetadataExt;
            Some(meta.mode() & 0o7777)
        };
        #[cfg(not(unix))]
        let mode = None;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.into_std().duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs());
        Ok(TreeMeta {
            kind,
            size: meta.len(),
            mode,
            mtime,
        })
    }

    fn open(&self, path: &Utf8Path) -> Result<Box<dyn Read + '_>> {
        let f = self.dir.open(path.as_std_path())?;
        Ok(Box::new(f.into_std()))
    }

    fn os_path(&self, path: &Utf8Path) -> Option<PathBuf> {
        Some(self.root.join(path.as_std_path()))
    }
}
