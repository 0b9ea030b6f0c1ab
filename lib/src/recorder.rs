//! High-level layer recording.
//!
//! [`LayerRecorder`] maps the build system's three artifact shapes onto
//! CAS operations: regular files become deduplicated payloads plus a
//! hardlink, tree artifacts become a `.cas/tree/…` store plus a relative
//! symlink, and executables bring a `<target>.runfiles/` directory whose
//! entries recurse into the first two shapes.

use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::appender::AppenderState;
use crate::cas::{Stored, TarCas};
use crate::treefs::TreeFs;
use crate::Result;

/// Where a runfiles entry's content comes from.
pub enum RunfileSource<'a> {
    /// A regular file on disk.
    File(&'a Path),
    /// A tree artifact.
    Tree(&'a dyn TreeFs),
}

impl std::fmt::Debug for RunfileSource<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunfileSource::File(p) => f.debug_tuple("File").field(p).finish(),
            RunfileSource::Tree(_) => f.debug_tuple("Tree").finish(),
        }
    }
}

/// One entry below an executable's runfiles directory.
#[derive(Debug)]
pub struct RunfilesEntry<'a> {
    /// Path relative to the runfiles root.
    pub path: Utf8PathBuf,
    /// Content source.
    pub source: RunfileSource<'a>,
}

fn dir_header() -> tar::Header {
    let mut h = tar::Header::new_gnu();
    h.set_entry_type(tar::EntryType::Directory);
    h.set_mode(0o755);
    h.set_uid(0);
    h.set_gid(0);
    h.set_mtime(0);
    h.set_size(0);
    h
}

fn symlink_header() -> tar::Header {
    let mut h = tar::Header::new_gnu();
    h.set_entry_type(tar::EntryType::Symlink);
    h.set_mode(0o777);
    h.set_uid(0);
    h.set_gid(0);
    h.set_mtime(0);
    h.set_size(0);
    h
}

/// Records build artifacts into a [`TarCas`].
#[derive(Debug)]
pub struct LayerRecorder {
    cas: TarCas,
}

impl LayerRecorder {
    /// Wrap a CAS writer.
    pub fn new(cas: TarCas) -> Self {
        Self { cas }
    }

    /// Direct access to the underlying CAS, for callers that need to emit
    /// plain headers (directories, extra symlinks) alongside artifacts.
    pub fn cas_mut(&mut self) -> &mut TarCas {
        &mut self.cas
    }

    /// Record the regular file `source` at `target`.
    ///
    /// The tar header is synthesized from the source metadata: permission
    /// bits are kept (so executables stay executable), ownership and
    /// timestamps are stripped for reproducibility. Use
    /// [`LayerRecorder::add_file_with_header`] to preserve them.
    pub fn add_file(&mut self, target: &Utf8Path, source: &Path) -> Result<Stored> {
        let meta = std::fs::metadata(source)?;
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            header.set_mode(meta.permissions().mode() & 0o7777);
        }
        #[cfg(not(unix))]
        header.set_mode(0o755);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(0);
        header.set_size(meta.len());
        self.cas
            .write_regular_deduplicated_from_path(&header, target, source)
    }

    /// Record `source` at `target` with caller-supplied metadata.
    pub fn add_file_with_header(
        &mut self,
        target: &Utf8Path,
        source: &Path,
        header: &tar::Header,
    ) -> Result<Stored> {
        self.cas
            .write_regular_deduplicated_from_path(header, target, source)
    }

    /// Record a tree artifact: store the tree in the substore and place a
    /// relative symlink to it at `target`. Returns the in-tar tree path.
    pub fn add_tree(&mut self, target: &Utf8Path, fs: &dyn TreeFs) -> Result<Utf8PathBuf> {
        let tree_path = self.cas.store_tree(fs)?;
        let link = imglayer_utils::relative_link_target(target, &tree_path);
        debug!(%target, %link, "linking tree artifact");
        self.cas
            .write_header(&symlink_header(), target, Some(&link))?;
        Ok(tree_path)
    }

    /// Record an executable plus its runfiles: the binary at `target`, a
    /// `<target>.runfiles/` directory, and each runfiles entry below it.
    pub fn add_executable(
        &mut self,
        target: &Utf8Path,
        source: &Path,
        runfiles: &[RunfilesEntry<'_>],
    ) -> Result<()> {
        self.add_file(target, source)?;
        let runfiles_dir = Utf8PathBuf::from(format!("{target}.runfiles"));
        self.cas.write_header(&dir_header(), &runfiles_dir, None)?;
        for entry in runfiles {
            let dest = runfiles_dir.join(&entry.path);
            match entry.source {
                RunfileSource::File(path) => {
                    self.add_file(&dest, path)?;
                }
                RunfileSource::Tree(fs) => {
                    self.add_tree(&dest, fs)?;
                }
            }
        }
        Ok(())
    }

    /// Close the underlying CAS and its appender.
    pub fn finish(self) -> Result<AppenderState> {
        self.cas.close()
    }
}
