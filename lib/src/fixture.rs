//! Test infrastructure; see the `internal-testing-api` feature.
//!
//! Nothing in here is subject to semver.

use std::collections::BTreeMap;
use std::io::{self, Cursor, Read, Write};
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};

use crate::treefs::{TreeEntryKind, TreeFs, TreeMeta};
use crate::{Error, Result};

/// A cloneable in-memory sink; every clone appends to the same buffer, so
/// tests can hand one clone to an appender and keep another to inspect the
/// output.
#[derive(Debug, Clone, Default)]
pub struct VecSink(Arc<Mutex<Vec<u8>>>);

impl VecSink {
    /// An empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of everything written so far.
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl Write for VecSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum MemEntry {
    File {
        data: Vec<u8>,
        mode: u32,
        mtime: u64,
    },
    Dir,
}

/// An in-memory [`TreeFs`], with a controllable listing order so tests can
/// prove traversal-order independence.
#[derive(Debug, Default)]
pub struct MemTree {
    entries: BTreeMap<Utf8PathBuf, MemEntry>,
    reverse_listing: bool,
}

impl MemTree {
    /// An empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// When set, `read_dir` yields names in reverse order.
    pub fn set_reverse_listing(&mut self, reverse: bool) {
        self.reverse_listing = reverse;
    }

    /// Add (or replace) a regular file with mode `0644` and a zero mtime,
    /// creating parent directories.
    pub fn add_file(&mut self, path: &str, data: &[u8]) {
        self.add_file_with(path, data, 0o644, 0);
    }

    /// Add (or replace) a regular file with explicit metadata.
    pub fn add_file_with(&mut self, path: &str, data: &[u8], mode: u32, mtime: u64) {
        let path = Utf8PathBuf::from(path);
        self.add_parents(&path);
        self.entries.insert(
            path,
            MemEntry::File {
                data: data.to_vec(),
                mode,
                mtime,
            },
        );
    }

    /// Add an (empty, until populated) directory.
    pub fn add_dir(&mut self, path: &str) {
        let path = Utf8PathBuf::from(path);
        self.add_parents(&path);
        self.entries.insert(path, MemEntry::Dir);
    }

    /// Remove an entry.
    pub fn remove(&mut self, path: &str) {
        self.entries.remove(Utf8Path::new(path));
    }

    fn add_parents(&mut self, path: &Utf8Path) {
        let mut ancestors: Vec<_> = path
            .ancestors()
            .skip(1)
            .filter(|p| !p.as_str().is_empty())
            .map(Utf8Path::to_owned)
            .collect();
        ancestors.reverse();
        for dir in ancestors {
            self.entries.entry(dir).or_insert(MemEntry::Dir);
        }
    }

    fn get(&self, path: &Utf8Path) -> Result<&MemEntry> {
        static ROOT_DIR: MemEntry = MemEntry::Dir;
        if path == "." {
            return Ok(&ROOT_DIR);
        }
        self.entries
            .get(path)
            .ok_or_else(|| Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, path.to_string())))
    }
}

impl TreeFs for MemTree {
    fn read_dir(&self, path: &Utf8Path) -> Result<Vec<String>> {
        let _ = self.get(path)?;
        let mut names: Vec<String> = self
            .entries
            .keys()
            .filter_map(|p| {
                let rel = if path == "." {
                    p.as_path()
                } else {
                    p.strip_prefix(path).ok()?
                };
                let mut parts = rel.components();
                let first = parts.next()?;
                parts.next().is_none().then(|| first.as_str().to_string())
            })
            .collect();
        names.sort_unstable();
        if self.reverse_listing {
            names.reverse();
        }
        Ok(names)
    }

    fn metadata(&self, path: &Utf8Path) -> Result<TreeMeta> {
        Ok(match self.get(path)? {
            MemEntry::File { data, mode, mtime } => TreeMeta {
                kind: TreeEntryKind::File,
                size: data.len() as u64,
                mode: Some(*mode),
                mtime: Some(*mtime),
            },
            MemEntry::Dir => TreeMeta {
                kind: TreeEntryKind::Directory,
                size: 0,
                mode: Some(0o755),
                mtime: Some(0),
            },
        })
    }

    fn open(&self, path: &Utf8Path) -> Result<Box<dyn Read + '_>> {
        match self.get(path)? {
            MemEntry::File { data, .. } => Ok(Box::new(Cursor::new(data.clone()))),
            MemEntry::Dir => Err(Error::UnsupportedEntry(path.to_owned())),
        }
    }
}
