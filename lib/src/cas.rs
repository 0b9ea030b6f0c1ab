//! The in-tar content-addressable substore.
//!
//! A [`TarCas`] turns `(header, payload)` pairs into a tar stream in which
//! every distinct payload is written once, under `.cas/blob/<hex>` (content
//! addressed), `.cas/node/<hex>` (content plus caller metadata) or
//! `.cas/tree/<hex>/` (a whole directory tree addressed by its Merkle
//! root). Later references to the same content become tar hardlinks, which
//! carry no payload bytes.
//!
//! The dedup sets can be exported ([`TarCas::export`]) and imported into
//! the CAS of a later layer, so a derived layer emits neither payload nor
//! hardlink for content its base already carries, only the references the
//! caller asks for.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::appender::{AppenderState, TarAppender};
use crate::digest_cache::FileDigestCache;
use crate::hash::{sha256, sha256_reader, Digest, HashAlgorithm, ResumableSha256};
use crate::merkle::MerkleTreeHasher;
use crate::tarstream::{serialize_header, PaddedReader};
use crate::treefs::TreeFs;
use crate::{Error, Result};

/// Root directory of the substore inside the tar stream.
const CAS_ROOT: &str = ".cas";

/// Spool/copy buffer size.
const BUF_CAPACITY: usize = 131072;

/// Where CAS objects land relative to the entries that reference them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TarStructure {
    /// CAS objects are emitted as stored; every other header is deferred
    /// and replayed on close, so the whole substore precedes the
    /// referencing entries.
    #[default]
    CasFirst,
    /// Only the substore is emitted; non-CAS headers are accepted and
    /// dropped.
    CasOnly,
    /// Entries appear in exactly the order they were submitted.
    Intertwined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CasKind {
    Blob,
    Node,
    Tree,
}

impl CasKind {
    fn dirname(&self) -> &'static str {
        match self {
            CasKind::Blob => "blob",
            CasKind::Node => "node",
            CasKind::Tree => "tree",
        }
    }
}

fn cas_object_path(kind: CasKind, digest: &Digest) -> Utf8PathBuf {
    format!("{CAS_ROOT}/{}/{}", kind.dirname(), digest.hex()).into()
}

/// Parse `.cas/<kind>/<hex>[/…]` back into its kind and digest.
fn parse_cas_path(path: &Utf8Path) -> Option<(CasKind, Digest)> {
    let rest = path.strip_prefix(CAS_ROOT).ok()?;
    let mut parts = rest.components();
    let kind = match parts.next()?.as_str() {
        "blob" => CasKind::Blob,
        "node" => CasKind::Node,
        "tree" => CasKind::Tree,
        _ => return None,
    };
    let bytes = hex::decode(parts.next()?.as_str()).ok()?;
    let digest = Digest::new(HashAlgorithm::Sha256, bytes).ok()?;
    Some((kind, digest))
}

/// The result of storing one payload.
#[derive(Debug, Clone)]
pub struct Stored {
    /// In-tar path of the object holding the payload.
    pub path: Utf8PathBuf,
    /// Digest of the payload bytes.
    pub blob_hash: Digest,
    /// For node objects, the digest of (normalized header ∥ payload hash).
    pub node_hash: Option<Digest>,
    /// Payload size in bytes.
    pub size: u64,
}

/// Exportable dedup state: object hashes in first-store order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CasState {
    /// Blob hashes stored by the exporting writer.
    pub blobs: Vec<Digest>,
    /// Node hashes stored by the exporting writer.
    pub nodes: Vec<Digest>,
    /// Tree hashes stored by the exporting writer.
    pub trees: Vec<Digest>,
}

impl CasState {
    /// Serialize to JSON for persistence between layer builds.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse the JSON form.
    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }
}

/// Lazily supplies CAS hashes for [`TarCas::import`].
pub trait CasStateSupplier {
    /// Blob hashes, in their original store order.
    fn blobs(&self) -> Box<dyn Iterator<Item = Digest> + '_>;
    /// Node hashes, in their original store order.
    fn nodes(&self) -> Box<dyn Iterator<Item = Digest> + '_>;
    /// Tree hashes, in their original store order.
    fn trees(&self) -> Box<dyn Iterator<Item = Digest> + '_>;
}

impl CasStateSupplier for CasState {
    fn blobs(&self) -> Box<dyn Iterator<Item = Digest> + '_> {
        Box::new(self.blobs.iter().cloned())
    }

    fn nodes(&self) -> Box<dyn Iterator<Item = Digest> + '_> {
        Box::new(self.nodes.iter().cloned())
    }

    fn trees(&self) -> Box<dyn Iterator<Item = Digest> + '_> {
        Box::new(self.trees.iter().cloned())
    }
}

type CallbackFn = dyn FnMut(&tar::Header, &Utf8Path, Option<&Utf8Path>) -> Result<()> + Send;

struct HeaderCallback {
    kinds: Vec<tar::EntryType>,
    func: Box<CallbackFn>,
}

struct DeferredHeader {
    header: tar::Header,
    path: Utf8PathBuf,
    link: Option<Utf8PathBuf>,
}

/// The deduplicating tar writer.
pub struct TarCas {
    appender: Option<Box<dyn TarAppender>>,
    structure: TarStructure,
    stored_blobs: IndexSet<Digest>,
    stored_nodes: IndexSet<Digest>,
    stored_trees: IndexSet<Digest>,
    imported_blobs: HashSet<Digest>,
    imported_nodes: HashSet<Digest>,
    imported_trees: HashSet<Digest>,
    deferred: Vec<DeferredHeader>,
    callback: Option<HeaderCallback>,
    digest_cache: Option<Arc<FileDigestCache>>,
}

impl std::fmt::Debug for TarCas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TarCas")
            .field("structure", &self.structure)
            .field("blobs", &self.stored_blobs.len())
            .field("nodes", &self.stored_nodes.len())
            .field("trees", &self.stored_trees.len())
            .field("deferred", &self.deferred.len())
            .finish_non_exhaustive()
    }
}

/// The canonical header for blob objects: regular file, `0755`, root/root,
/// zero mtime.
fn blob_header(size: u64) -> tar::Header {
    let mut h = tar::Header::new_gnu();
    h.set_entry_type(tar::EntryType::Regular);
    h.set_mode(0o755);
    h.set_uid(0);
    h.set_gid(0);
    h.set_mtime(0);
    h.set_size(size);
    h
}

fn default_dir_header() -> tar::Header {
    let mut h = tar::Header::new_gnu();
    h.set_entry_type(tar::EntryType::Directory);
    h.set_mode(0o755);
    h.set_uid(0);
    h.set_gid(0);
    h.set_mtime(0);
    h.set_size(0);
    h
}

fn default_hardlink_header() -> tar::Header {
    let mut h = tar::Header::new_gnu();
    h.set_entry_type(tar::EntryType::Link);
    h.set_mode(0o755);
    h.set_uid(0);
    h.set_gid(0);
    h.set_mtime(0);
    h.set_size(0);
    h
}

/// True when `header` carries only the metadata a blob object would get
/// anyway; such writes dedup by content alone, others via node objects.
fn has_default_metadata(header: &tar::Header) -> Result<bool> {
    Ok(header.mode()? == 0o755
        && header.uid()? == 0
        && header.gid()? == 0
        && header.mtime()? == 0)
}

/// The header bytes hashed into a node hash: everything the caller set,
/// minus the name (and the checksum, which covers it).
fn normalized_header_bytes(header: &tar::Header) -> Result<Vec<u8>> {
    let mut h = tar::Header::new_gnu();
    h.set_entry_type(header.entry_type());
    h.set_mode(header.mode()?);
    h.set_uid(header.uid()?);
    h.set_gid(header.gid()?);
    h.set_mtime(header.mtime()?);
    h.set_size(header.size()?);
    if let Ok(Some(major)) = header.device_major() {
        h.set_device_major(major)?;
    }
    if let Ok(Some(minor)) = header.device_minor() {
        h.set_device_minor(minor)?;
    }
    if let Some(link) = header.link_name_bytes() {
        let link = std::str::from_utf8(&link)
            .map_err(|_| Error::InvalidHeader("non-UTF-8 link target".into()))?
            .to_string();
        // Raw copy; long link targets contribute their prefix, which is
        // enough to keep distinct targets distinct in practice.
        let field = &mut h.as_old_mut().linkname;
        let n = link.len().min(field.len());
        field[..n].copy_from_slice(&link.as_bytes()[..n]);
    }
    Ok(h.as_bytes().to_vec())
}

fn node_hash(header: &tar::Header, blob_hash: &Digest) -> Result<Digest> {
    let mut buf = normalized_header_bytes(header)?;
    buf.extend_from_slice(blob_hash.as_bytes());
    Ok(sha256(&buf))
}

/// Spool a payload to a temporary file while hashing it, so the digest is
/// known before any tar bytes are committed.
fn spool_payload(reader: &mut dyn Read) -> Result<(File, Digest, u64)> {
    let mut spool = tempfile::tempfile()?;
    let mut hasher = ResumableSha256::new();
    let mut buf = vec![0u8; BUF_CAPACITY];
    let mut size = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        spool.write_all(&buf[..n])?;
        size += n as u64;
    }
    spool.seek(SeekFrom::Start(0))?;
    Ok((spool, hasher.finalize(), size))
}

impl TarCas {
    /// A fresh CAS writing through `appender` under the given structure
    /// policy.
    pub fn new(appender: Box<dyn TarAppender>, structure: TarStructure) -> Self {
        Self {
            appender: Some(appender),
            structure,
            stored_blobs: IndexSet::new(),
            stored_nodes: IndexSet::new(),
            stored_trees: IndexSet::new(),
            imported_blobs: HashSet::new(),
            imported_nodes: HashSet::new(),
            imported_trees: HashSet::new(),
            deferred: Vec::new(),
            callback: None,
            digest_cache: None,
        }
    }

    /// Share a digest cache with other writers; used by path-based writes
    /// and tree hashing.
    pub fn with_digest_cache(mut self, cache: Arc<FileDigestCache>) -> Self {
        self.digest_cache = Some(cache);
        self
    }

    /// Register a callback observing every header of the given types as it
    /// is written (deferred headers are observed at replay). An error
    /// return suppresses the write and surfaces as
    /// [`Error::CallbackRejected`]; the writer stays usable.
    pub fn set_write_callback<F>(&mut self, kinds: &[tar::EntryType], func: F)
    where
        F: FnMut(&tar::Header, &Utf8Path, Option<&Utf8Path>) -> Result<()> + Send + 'static,
    {
        self.callback = Some(HeaderCallback {
            kinds: kinds.to_vec(),
            func: Box::new(func),
        });
    }

    /// Seed the dedup sets from an ancestor layer's exported state.
    /// Objects already present in the ancestor are neither re-stored nor
    /// hardlinked; `store*` still returns their CAS paths.
    pub fn import(&mut self, supplier: &dyn CasStateSupplier) {
        self.imported_blobs.extend(supplier.blobs());
        self.imported_nodes.extend(supplier.nodes());
        self.imported_trees.extend(supplier.trees());
        debug!(
            blobs = self.imported_blobs.len(),
            nodes = self.imported_nodes.len(),
            trees = self.imported_trees.len(),
            "imported ancestor CAS state"
        );
    }

    /// The hashes stored by this writer itself, in insertion order.
    pub fn export(&self) -> CasState {
        CasState {
            blobs: self.stored_blobs.iter().cloned().collect(),
            nodes: self.stored_nodes.iter().cloned().collect(),
            trees: self.stored_trees.iter().cloned().collect(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.appender.is_none() {
            return Err(Error::AlreadyClosed);
        }
        Ok(())
    }

    fn knows(&self, kind: CasKind, digest: &Digest) -> bool {
        match kind {
            CasKind::Blob => {
                self.stored_blobs.contains(digest) || self.imported_blobs.contains(digest)
            }
            CasKind::Node => {
                self.stored_nodes.contains(digest) || self.imported_nodes.contains(digest)
            }
            CasKind::Tree => {
                self.stored_trees.contains(digest) || self.imported_trees.contains(digest)
            }
        }
    }

    /// Run the callback (if any), then frame and append one record.
    /// Returns the number of payload bytes consumed.
    fn emit(
        &mut self,
        header: &tar::Header,
        path: &Utf8Path,
        link: Option<&Utf8Path>,
        payload: Option<&mut dyn Read>,
    ) -> Result<u64> {
        if let Some(cb) = self.callback.as_mut() {
            if cb.kinds.contains(&header.entry_type()) {
                (cb.func)(header, path, link).map_err(|e| Error::CallbackRejected {
                    path: path.to_owned(),
                    source: Box::new(e),
                })?;
            }
        }
        let header_bytes = serialize_header(header, path, link)?;
        let appender = self.appender.as_mut().ok_or(Error::AlreadyClosed)?;
        match payload {
            None => {
                appender.append_tar(&mut Cursor::new(header_bytes))?;
                Ok(0)
            }
            Some(payload) => {
                let mut padded = PaddedReader::new(payload);
                {
                    let mut framed = Cursor::new(header_bytes).chain(&mut padded);
                    appender.append_tar(&mut framed)?;
                }
                Ok(padded.bytes_read())
            }
        }
    }

    fn store_payload(
        &mut self,
        digest: Digest,
        size: u64,
        payload: &mut dyn Read,
    ) -> Result<Stored> {
        let path = cas_object_path(CasKind::Blob, &digest);
        if self.knows(CasKind::Blob, &digest) {
            trace!(%digest, "blob already present");
            return Ok(Stored {
                path,
                blob_hash: digest,
                node_hash: None,
                size,
            });
        }
        let n = self.emit(&blob_header(size), &path, None, Some(payload))?;
        if n != size {
            return Err(Error::InconsistentSize {
                expected: size,
                actual: n,
            });
        }
        self.stored_blobs.insert(digest.clone());
        Ok(Stored {
            path,
            blob_hash: digest,
            node_hash: None,
            size,
        })
    }

    /// Hash the payload and store it once under `.cas/blob/<hex>`.
    pub fn store(&mut self, reader: &mut dyn Read) -> Result<Stored> {
        self.ensure_open()?;
        let (mut spool, digest, size) = spool_payload(reader)?;
        self.store_payload(digest, size, &mut spool)
    }

    /// Like [`TarCas::store`], with a digest the caller already computed.
    /// The reader is only consumed (and its byte count verified) when the
    /// payload is not yet present.
    pub fn store_known_hash_and_size(
        &mut self,
        reader: &mut dyn Read,
        hash: &Digest,
        size: u64,
    ) -> Result<Stored> {
        self.ensure_open()?;
        if self.knows(CasKind::Blob, hash) {
            trace!(digest = %hash, "blob already present");
            return Ok(Stored {
                path: cas_object_path(CasKind::Blob, hash),
                blob_hash: hash.clone(),
                node_hash: None,
                size,
            });
        }
        self.store_payload(hash.clone(), size, reader)
    }

    fn store_node_known(
        &mut self,
        header: &tar::Header,
        blob_hash: Digest,
        size: u64,
        payload: &mut dyn Read,
    ) -> Result<Stored> {
        if header.entry_type() != tar::EntryType::Regular {
            return Err(Error::InvalidHeader(
                "node objects hold regular files".into(),
            ));
        }
        let node = node_hash(header, &blob_hash)?;
        let path = cas_object_path(CasKind::Node, &node);
        if self.knows(CasKind::Node, &node) {
            trace!(digest = %node, "node already present");
            return Ok(Stored {
                path,
                blob_hash,
                node_hash: Some(node),
                size,
            });
        }
        let mut h = header.clone();
        h.set_size(size);
        let n = self.emit(&h, &path, None, Some(payload))?;
        if n != size {
            return Err(Error::InconsistentSize {
                expected: size,
                actual: n,
            });
        }
        self.stored_nodes.insert(node.clone());
        Ok(Stored {
            path,
            blob_hash,
            node_hash: Some(node),
            size,
        })
    }

    /// Store a payload together with the caller's header metadata under
    /// `.cas/node/<hex>`; two payloads with identical bytes but different
    /// metadata land in distinct objects.
    pub fn store_node(&mut self, reader: &mut dyn Read, header: &tar::Header) -> Result<Stored> {
        self.ensure_open()?;
        let (mut spool, blob_hash, size) = spool_payload(reader)?;
        self.store_node_known(header, blob_hash, size, &mut spool)
    }

    /// Store a whole directory tree under `.cas/tree/<hex>/`, returning
    /// that path. File payloads are stored as blobs and hardlinked into
    /// the tree; everything is skipped if the tree hash is already known.
    pub fn store_tree(&mut self, fs: &dyn TreeFs) -> Result<Utf8PathBuf> {
        self.ensure_open()?;
        let cache = self.digest_cache.clone();
        let mut hasher = MerkleTreeHasher::new(fs);
        if let Some(cache) = cache.as_deref() {
            hasher = hasher.with_digest_cache(cache);
        }
        let manifest = hasher.compute_manifest()?;
        let tree_path = cas_object_path(CasKind::Tree, &manifest.hash);
        if self.knows(CasKind::Tree, &manifest.hash) {
            trace!(digest = %manifest.hash, "tree already present");
            return Ok(tree_path);
        }
        debug!(digest = %manifest.hash, files = manifest.files.len(), "storing tree");
        self.emit(&default_dir_header(), &tree_path, None, None)?;
        for file in &manifest.files {
            let stored = {
                let mut src = fs.open(&file.path)?;
                self.store_known_hash_and_size(&mut src, &file.content_hash, file.size)?
            };
            let link_path = tree_path.join(&file.path);
            self.emit(
                &default_hardlink_header(),
                &link_path,
                Some(&stored.path),
                None,
            )?;
        }
        self.stored_trees.insert(manifest.hash);
        Ok(tree_path)
    }

    /// Write a non-regular entry (directory, symlink, hardlink),
    /// honouring the structure policy.
    pub fn write_header(
        &mut self,
        header: &tar::Header,
        path: &Utf8Path,
        link: Option<&Utf8Path>,
    ) -> Result<()> {
        self.ensure_open()?;
        match header.entry_type() {
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                return Err(Error::InvalidHeader(
                    "regular files must go through write_regular or a deduplicated write".into(),
                ));
            }
            tar::EntryType::Link | tar::EntryType::Symlink => {
                let link = link.ok_or_else(|| {
                    Error::InvalidHeader(format!("link entry {path} without a target"))
                })?;
                // A hardlink into the substore must reference an object
                // this stream (or an imported ancestor) actually has.
                if header.entry_type() == tar::EntryType::Link {
                    if let Some((kind, digest)) = parse_cas_path(link) {
                        if !self.knows(kind, &digest) {
                            return Err(Error::InvalidHeader(format!(
                                "hardlink target {link} was never stored"
                            )));
                        }
                    }
                }
            }
            _ => {}
        }
        match self.structure {
            TarStructure::CasFirst => {
                trace!(%path, "deferring non-CAS header");
                self.deferred.push(DeferredHeader {
                    header: header.clone(),
                    path: path.to_owned(),
                    link: link.map(Utf8Path::to_owned),
                });
                Ok(())
            }
            TarStructure::CasOnly => Ok(()),
            TarStructure::Intertwined => self.emit(header, path, link, None).map(|_| ()),
        }
    }

    /// Write a regular file verbatim at a caller-chosen (non-CAS) path,
    /// without deduplication.
    pub fn write_regular(
        &mut self,
        header: &tar::Header,
        path: &Utf8Path,
        reader: &mut dyn Read,
    ) -> Result<()> {
        self.ensure_open()?;
        if header.entry_type() != tar::EntryType::Regular {
            return Err(Error::InvalidHeader(format!(
                "write_regular called with {:?} header",
                header.entry_type()
            )));
        }
        if path.starts_with(CAS_ROOT) {
            return Err(Error::InvalidHeader(format!(
                "{path} is reserved for the substore"
            )));
        }
        match self.structure {
            TarStructure::CasFirst => Err(Error::InvalidHeader(
                "regular payload entries cannot be deferred; use a deduplicated write".into(),
            )),
            TarStructure::CasOnly => Ok(()),
            TarStructure::Intertwined => {
                let n = self.emit(header, path, None, Some(reader))?;
                if n != header.size()? {
                    return Err(Error::InconsistentSize {
                        expected: header.size()?,
                        actual: n,
                    });
                }
                Ok(())
            }
        }
    }

    fn link_to_stored(
        &mut self,
        header: &tar::Header,
        path: &Utf8Path,
        stored: &Stored,
    ) -> Result<()> {
        if imglayer_utils::clean(path) == stored.path {
            // The caller-chosen name is the CAS path itself; the object is
            // already on disk there.
            return Ok(());
        }
        let mut h = header.clone();
        h.set_entry_type(tar::EntryType::Link);
        h.set_size(0);
        self.write_header(&h, path, Some(&stored.path))
    }

    /// The primary path for user content: store the payload once (as a
    /// blob, or as a node when the header carries non-default metadata)
    /// and reference it from `path` with a hardlink.
    pub fn write_regular_deduplicated(
        &mut self,
        header: &tar::Header,
        path: &Utf8Path,
        reader: &mut dyn Read,
    ) -> Result<Stored> {
        self.ensure_open()?;
        if header.entry_type() != tar::EntryType::Regular {
            return Err(Error::InvalidHeader(format!(
                "deduplicated write with {:?} header",
                header.entry_type()
            )));
        }
        let stored = if has_default_metadata(header)? {
            self.store(reader)?
        } else {
            self.store_node(reader, header)?
        };
        self.link_to_stored(header, path, &stored)?;
        Ok(stored)
    }

    /// Deduplicated write reading the payload from disk, with the content
    /// digest served by the shared cache when one is attached.
    pub fn write_regular_deduplicated_from_path(
        &mut self,
        header: &tar::Header,
        path: &Utf8Path,
        source: &Path,
    ) -> Result<Stored> {
        self.ensure_open()?;
        if header.entry_type() != tar::EntryType::Regular {
            return Err(Error::InvalidHeader(format!(
                "deduplicated write with {:?} header",
                header.entry_type()
            )));
        }
        let (digest, size) = match self.digest_cache.as_deref() {
            Some(cache) => cache.digest(source)?,
            None => sha256_reader(File::open(source)?)?,
        };
        let stored = if has_default_metadata(header)? {
            let mut src = File::open(source)?;
            self.store_known_hash_and_size(&mut src, &digest, size)?
        } else {
            let node = node_hash(header, &digest)?;
            if self.knows(CasKind::Node, &node) {
                Stored {
                    path: cas_object_path(CasKind::Node, &node),
                    blob_hash: digest,
                    node_hash: Some(node),
                    size,
                }
            } else {
                let mut src = File::open(source)?;
                self.store_node_known(header, digest, size, &mut src)?
            }
        };
        self.link_to_stored(header, path, &stored)?;
        Ok(stored)
    }

    /// Replay deferred headers, terminate the tar stream and finish the
    /// appender, producing its state.
    pub fn close(mut self) -> Result<AppenderState> {
        self.ensure_open()?;
        let deferred = std::mem::take(&mut self.deferred);
        if !deferred.is_empty() {
            debug!(count = deferred.len(), "replaying deferred headers");
        }
        for d in deferred {
            self.emit(&d.header, &d.path, d.link.as_deref(), None)?;
        }
        let appender = self.appender.as_mut().ok_or(Error::AlreadyClosed)?;
        // End-of-archive marker; the seekable appender substitutes its own
        // after the TOC.
        appender.append_tar(&mut io::repeat(0).take(1024))?;
        let appender = self.appender.take().ok_or(Error::AlreadyClosed)?;
        appender.finish()
    }
}
