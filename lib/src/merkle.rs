//! Canonical fingerprints for tree artifacts.
//!
//! A tree artifact is addressed by the Merkle root over its contents: every
//! regular file contributes its name, size, content hash and retained
//! metadata; every directory contributes the hash of its sorted children.
//! The result depends only on the tree's contents, never on traversal or
//! insertion order, so identical trees referenced from different layers
//! share a single `.cas/tree/…` entry.

use camino::{Utf8Path, Utf8PathBuf};

use crate::digest_cache::FileDigestCache;
use crate::hash::{sha256, sha256_reader, Digest};
use crate::treefs::{TreeEntryKind, TreeFs, TreeMeta};
use crate::{Error, Result};

/// Node tag bytes, preventing cross-kind fingerprint collisions.
const TAG_FILE: u8 = 0x01;
const TAG_DIR: u8 = 0x02;
/// Reserved for symlink nodes, should they stop being resolved eagerly.
#[allow(dead_code)]
const TAG_SYMLINK: u8 = 0x03;
const TAG_ROOT: u8 = 0xFF;

/// A regular file recorded during the tree walk.
#[derive(Debug, Clone)]
pub struct TreeFile {
    /// Path relative to the tree root.
    pub path: Utf8PathBuf,
    /// Payload size in bytes.
    pub size: u64,
    /// Digest of the payload.
    pub content_hash: Digest,
}

/// The result of hashing a tree: the root hash plus every regular file
/// encountered, in sorted traversal order. The file list lets the tar-CAS
/// serialize the tree without re-hashing any payload.
#[derive(Debug)]
pub struct TreeManifest {
    /// The Merkle root of the tree.
    pub hash: Digest,
    /// All regular files, sorted by path component.
    pub files: Vec<TreeFile>,
}

struct FileNode {
    name: String,
    size: u64,
    content_hash: Digest,
    mtime: Option<u64>,
    mode: Option<u32>,
}

impl FileNode {
    fn fingerprint(&self, buf: &mut Vec<u8>) {
        buf.push(TAG_FILE);
        buf.extend_from_slice(&(self.name.len() as u64).to_be_bytes());
        buf.extend_from_slice(self.name.as_bytes());
        buf.extend_from_slice(&self.size.to_be_bytes());
        let ch = self.content_hash.as_bytes();
        buf.extend_from_slice(&(ch.len() as u64).to_be_bytes());
        buf.extend_from_slice(ch);
        buf.extend_from_slice(&self.mtime.unwrap_or(0).to_be_bytes());
        buf.extend_from_slice(&self.mode.unwrap_or(0).to_be_bytes());
    }
}

struct DirNode {
    name: String,
    hash: Digest,
}

impl DirNode {
    fn fingerprint(&self, buf: &mut Vec<u8>) {
        buf.push(TAG_DIR);
        buf.extend_from_slice(&(self.name.len() as u64).to_be_bytes());
        buf.extend_from_slice(self.name.as_bytes());
        let h = self.hash.as_bytes();
        buf.extend_from_slice(&(h.len() as u64).to_be_bytes());
        buf.extend_from_slice(h);
    }
}

/// Computes Merkle roots over a [`TreeFs`].
pub struct MerkleTreeHasher<'a> {
    fs: &'a dyn TreeFs,
    cache: Option<&'a FileDigestCache>,
}

impl<'a> MerkleTreeHasher<'a> {
    /// A hasher over `fs`, streaming every file payload.
    pub fn new(fs: &'a dyn TreeFs) -> Self {
        Self { fs, cache: None }
    }

    /// Route content hashing through `cache` for entries the filesystem can
    /// name on disk (see [`TreeFs::os_path`]).
    pub fn with_digest_cache(mut self, cache: &'a FileDigestCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Compute the root hash.
    pub fn compute(&self) -> Result<Digest> {
        Ok(self.compute_manifest()?.hash)
    }

    /// Compute the root hash along with the flattened file list.
    pub fn compute_manifest(&self) -> Result<TreeManifest> {
        let mut files = Vec::new();
        let hash = self.hash_dir(Utf8Path::new("."), true, &mut files)?;
        Ok(TreeManifest { hash, files })
    }

    fn hash_dir(
        &self,
        path: &Utf8Path,
        is_root: bool,
        manifest: &mut Vec<TreeFile>,
    ) -> Result<Digest> {
        let mut names = self.fs.read_dir(path)?;
        // Byte-wise name order; this is the canonical order for both the
        // fingerprint and the manifest.
        names.sort_unstable();
        if names.is_empty() && !is_root {
            // The producing build system is inconsistent about empty
            // directories, so refuse them rather than guess.
            return Err(Error::EmptyDirectoryInTreeArtifact(path.to_owned()));
        }

        let mut file_nodes = Vec::new();
        let mut dir_nodes = Vec::new();
        for name in names {
            let child = if is_root {
                Utf8PathBuf::from(&name)
            } else {
                path.join(&name)
            };
            let meta = self.fs.metadata(&child)?;
            match meta.kind {
                TreeEntryKind::File => {
                    let content_hash = self.content_hash(&child, &meta)?;
                    manifest.push(TreeFile {
                        path: child,
                        size: meta.size,
                        content_hash: content_hash.clone(),
                    });
                    file_nodes.push(FileNode {
                        name,
                        size: meta.size,
                        content_hash,
                        mtime: meta.mtime,
                        mode: meta.mode,
                    });
                }
                TreeEntryKind::Directory => {
                    let hash = self.hash_dir(&child, false, manifest)?;
                    dir_nodes.push(DirNode { name, hash });
                }
                TreeEntryKind::Other => {
                    return Err(Error::UnsupportedEntry(child));
                }
            }
        }

        let mut buf = Vec::new();
        buf.push(if is_root { TAG_ROOT } else { TAG_DIR });
        buf.extend_from_slice(&(file_nodes.len() as u64).to_be_bytes());
        for f in &file_nodes {
            f.fingerprint(&mut buf);
        }
        buf.extend_from_slice(&(dir_nodes.len() as u64).to_be_bytes());
        for d in &dir_nodes {
            d.fingerprint(&mut buf);
        }
        Ok(sha256(&buf))
    }

    fn content_hash(&self, path: &Utf8Path, meta: &TreeMeta) -> Result<Digest> {
        if let Some(cache) = self.cache {
            if let Some(os_path) = self.fs.os_path(path) {
                let (digest, size) = cache.digest(&os_path)?;
                if size != meta.size {
                    return Err(Error::InconsistentSize {
                        expected: meta.size,
                        actual: size,
                    });
                }
                return Ok(digest);
            }
        }
        let mut src = self.fs.open(path)?;
        let (digest, _) = sha256_reader(&mut src)?;
        Ok(digest)
    }
}
