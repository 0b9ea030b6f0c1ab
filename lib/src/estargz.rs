//! Seekable layer compression (estargz) with TOC emission.
//!
//! The seekable variants compress each tar entry (and each chunk of large
//! regular files) as its own gzip member or zstd frame, so a lazy-fetching
//! client can inflate any file from its recorded compressed offset. The
//! table of contents mapping entries to offsets is itself appended as the
//! tar entry `stargz.index.json` before the stream trailer, and a footer
//! member records where the TOC starts. The TOC digest is surfaced as a
//! descriptor annotation so consumers can validate the index without
//! reading the whole blob.
//!
//! The contract mirrors [`crate::appender::CompressionAppender`], except
//! that input arrives as framed tar records via
//! [`SeekableAppender::append_tar`] (the member layout needs record
//! boundaries) and parallel compression is rejected.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use camino::{Utf8Path, Utf8PathBuf};
use flate2::write::GzEncoder;
use serde::Serialize;
use tracing::debug;

use crate::appender::{
    classify_pipeline_error, magic_for, AppenderOptions, AppenderState, SharedSink, TarAppender,
};
use crate::hash::{sha256, HashAlgorithm, ResumableSha256};
use crate::tarstream::{padding_for, serialize_header, BLOCK};
use crate::{Error, Result};

/// Descriptor annotation carrying the TOC digest.
pub const TOC_DIGEST_ANNOTATION: &str = "containerd.io/snapshot/stargz/toc.digest";
/// Descriptor annotation carrying the uncompressed tar size.
pub const UNCOMPRESSED_SIZE_ANNOTATION: &str = "io.containers.estargz.uncompressed-size";

/// In-tar name of the table of contents.
const TOC_NAME: &str = "stargz.index.json";

/// Regular files larger than this are split into per-chunk members.
const CHUNK_SIZE: u64 = 4 << 20;

/// The wire format of a seekable layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekableVariant {
    /// One gzip member per entry/chunk (classic estargz).
    Gzip,
    /// One zstd frame per entry/chunk (zstd:chunked).
    ZstdChunked,
}

impl SeekableVariant {
    /// The tag recorded in the state magic.
    pub fn magic_tag(&self) -> &'static str {
        match self {
            SeekableVariant::Gzip => "estargz",
            SeekableVariant::ZstdChunked => "zstd-chunked",
        }
    }

    /// The OCI layer media type.
    pub fn media_type(&self) -> &'static str {
        match self {
            SeekableVariant::Gzip => "application/vnd.oci.image.layer.v1.tar+gzip",
            SeekableVariant::ZstdChunked => "application/vnd.oci.image.layer.v1.tar+zstd",
        }
    }
}

fn u64_is_zero(v: &u64) -> bool {
    *v == 0
}

#[derive(Debug, Clone, Serialize)]
struct TocEntry {
    name: String,
    #[serde(rename = "type")]
    entry_type: &'static str,
    #[serde(skip_serializing_if = "u64_is_zero")]
    size: u64,
    mode: u32,
    #[serde(skip_serializing_if = "u64_is_zero")]
    uid: u64,
    #[serde(skip_serializing_if = "u64_is_zero")]
    gid: u64,
    #[serde(rename = "linkName", skip_serializing_if = "Option::is_none")]
    link_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    digest: Option<String>,
    #[serde(rename = "chunkOffset", skip_serializing_if = "u64_is_zero")]
    chunk_offset: u64,
    #[serde(rename = "chunkSize", skip_serializing_if = "u64_is_zero")]
    chunk_size: u64,
    #[serde(rename = "chunkDigest", skip_serializing_if = "Option::is_none")]
    chunk_digest: Option<String>,
    offset: u64,
}

#[derive(Debug, Serialize)]
struct Toc {
    version: u32,
    entries: Vec<TocEntry>,
}

fn entry_type_name(kind: tar::EntryType) -> Result<&'static str> {
    use tar::EntryType::*;
    Ok(match kind {
        Regular | Continuous => "reg",
        Directory => "dir",
        Symlink => "symlink",
        Link => "hardlink",
        Fifo => "fifo",
        Char => "chardev",
        Block => "blockdev",
        other => {
            return Err(Error::InvalidHeader(format!(
                "unsupported tar entry type {other:?} for seekable output"
            )))
        }
    })
}

/// The tar-aware, seekable counterpart of
/// [`crate::appender::CompressionAppender`].
pub struct SeekableAppender {
    outer: SharedSink,
    content_hash: ResumableSha256,
    uncompressed_size: u64,
    magic: String,
    variant: SeekableVariant,
    level: Option<i32>,
    entries: Vec<TocEntry>,
    annotations: BTreeMap<String, String>,
}

impl std::fmt::Debug for SeekableAppender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeekableAppender")
            .field("magic", &self.magic)
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl SeekableAppender {
    /// Start a fresh seekable appender writing to `sink`.
    pub fn new(
        sink: Box<dyn Write + Send>,
        algorithm: HashAlgorithm,
        variant: SeekableVariant,
        options: AppenderOptions,
    ) -> Result<Self> {
        let magic = magic_for(
            true,
            algorithm,
            variant.magic_tag(),
            options.content_type.as_deref(),
        );
        Self::build(
            magic,
            sink,
            variant,
            &options,
            ResumableSha256::new(),
            ResumableSha256::new(),
            0,
            0,
            BTreeMap::new(),
        )
    }

    /// Reconstruct from a prior snapshot; the hash states and byte counts
    /// continue, while the TOC covers only entries appended this session.
    pub fn resume(
        state: &AppenderState,
        sink: Box<dyn Write + Send>,
        algorithm: HashAlgorithm,
        variant: SeekableVariant,
        options: AppenderOptions,
    ) -> Result<Self> {
        let expected = magic_for(
            true,
            algorithm,
            variant.magic_tag(),
            options.content_type.as_deref(),
        );
        if state.magic != expected {
            return Err(Error::MagicMismatch {
                expected,
                found: state.magic.clone(),
            });
        }
        let outer_hash = ResumableSha256::restore(&state.outer_hash_state)?;
        let content_hash = ResumableSha256::restore(&state.content_hash_state)?;
        Self::build(
            state.magic.clone(),
            sink,
            variant,
            &options,
            outer_hash,
            content_hash,
            state.compressed_size,
            state.uncompressed_size,
            state.layer_annotations.clone(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        magic: String,
        sink: Box<dyn Write + Send>,
        variant: SeekableVariant,
        options: &AppenderOptions,
        outer_hash: ResumableSha256,
        content_hash: ResumableSha256,
        compressed_size: u64,
        uncompressed_size: u64,
        annotations: BTreeMap<String, String>,
    ) -> Result<Self> {
        if options.jobs.map_or(0, |j| j.get()) > 1 {
            // The TOC is built while compressing; members must land in
            // submission order.
            return Err(Error::Compressor(io::Error::other(
                "parallel compression is not supported for seekable output",
            )));
        }
        Ok(Self {
            outer: SharedSink::new(sink, outer_hash, compressed_size),
            content_hash,
            uncompressed_size,
            magic,
            variant,
            level: options.level,
            entries: Vec::new(),
            annotations,
        })
    }

    /// The configuration magic this appender records in its state.
    pub fn magic(&self) -> &str {
        &self.magic
    }

    /// Compress `bytes` as one self-contained member.
    fn write_member(&mut self, bytes: &[u8]) -> Result<()> {
        self.content_hash.update(bytes);
        self.uncompressed_size += bytes.len() as u64;
        match self.variant {
            SeekableVariant::Gzip => {
                let level = self.level.unwrap_or(flate2::Compression::default().level() as i32);
                let mut enc = GzEncoder::new(
                    self.outer.clone(),
                    flate2::Compression::new(level as u32),
                );
                enc.write_all(bytes).map_err(classify_pipeline_error)?;
                enc.finish().map_err(classify_pipeline_error)?;
            }
            SeekableVariant::ZstdChunked => {
                let level = self.level.unwrap_or(zstd::DEFAULT_COMPRESSION_LEVEL);
                let mut enc = zstd::stream::write::Encoder::new(self.outer.clone(), level)
                    .map_err(classify_pipeline_error)?;
                enc.write_all(bytes).map_err(classify_pipeline_error)?;
                enc.finish().map_err(classify_pipeline_error)?;
            }
        }
        Ok(())
    }

    fn append_entry<R: Read>(&mut self, entry: &mut tar::Entry<'_, R>) -> Result<()> {
        let header = entry.header().clone();
        let path = String::from_utf8(entry.path_bytes().to_vec())
            .map_err(|_| Error::InvalidHeader("non-UTF-8 entry name".into()))?;
        let path = Utf8PathBuf::from(path);
        let link = entry
            .link_name_bytes()
            .map(|l| {
                String::from_utf8(l.to_vec())
                    .map_err(|_| Error::InvalidHeader("non-UTF-8 link target".into()))
            })
            .transpose()?
            .map(Utf8PathBuf::from);
        let entry_type = entry_type_name(header.entry_type())?;
        let size = header.size()?;
        let name = imglayer_utils::clean(&path).to_string();

        let offset = self.outer.compressed_size();
        let mut toc = TocEntry {
            name,
            entry_type,
            size,
            mode: header.mode()?,
            uid: header.uid()?,
            gid: header.gid()?,
            link_name: link.as_ref().map(|l| l.to_string()),
            digest: None,
            chunk_offset: 0,
            chunk_size: 0,
            chunk_digest: None,
            offset,
        };

        let mut member = serialize_header(&header, &path, link.as_deref())?;
        if entry_type == "reg" && size > 0 {
            let chunked = size > CHUNK_SIZE;
            let mut file_hash = ResumableSha256::new();
            let mut continuations = Vec::new();
            let mut consumed = 0u64;
            while consumed < size {
                let want = (size - consumed).min(CHUNK_SIZE);
                let mut chunk = Vec::with_capacity(want as usize);
                entry.by_ref().take(want).read_to_end(&mut chunk)?;
                if chunk.len() as u64 != want {
                    return Err(Error::InconsistentSize {
                        expected: size,
                        actual: consumed + chunk.len() as u64,
                    });
                }
                file_hash.update(&chunk);
                let chunk_digest = sha256(&chunk).to_string();
                let last = consumed + want == size;
                if consumed == 0 {
                    // First chunk rides in the same member as the header.
                    if chunked {
                        toc.chunk_size = want;
                    }
                    toc.chunk_digest = Some(chunk_digest);
                    member.extend_from_slice(&chunk);
                    if last {
                        member.resize(member.len() + padding_for(size), 0);
                    }
                    self.write_member(&member)?;
                } else {
                    let chunk_member_offset = self.outer.compressed_size();
                    continuations.push(TocEntry {
                        name: toc.name.clone(),
                        entry_type: "chunk",
                        size: 0,
                        mode: 0,
                        uid: 0,
                        gid: 0,
                        link_name: None,
                        digest: None,
                        chunk_offset: consumed,
                        chunk_size: want,
                        chunk_digest: Some(chunk_digest),
                        offset: chunk_member_offset,
                    });
                    let mut chunk_bytes = chunk;
                    if last {
                        chunk_bytes.resize(chunk_bytes.len() + padding_for(size), 0);
                    }
                    self.write_member(&chunk_bytes)?;
                }
                consumed += want;
            }
            toc.digest = Some(file_hash.finalize().to_string());
            self.entries.push(toc);
            self.entries.extend(continuations);
        } else {
            self.write_member(&member)?;
            self.entries.push(toc);
        }
        Ok(())
    }

    fn footer(&self, toc_offset: u64) -> Vec<u8> {
        let label = format!("{toc_offset:016x}STARGZ").into_bytes();
        match self.variant {
            SeekableVariant::Gzip => {
                // An empty gzip member whose extra field carries the TOC
                // offset; decompressors that ignore extra fields see zero
                // bytes of output.
                let mut f = Vec::with_capacity(44);
                f.extend_from_slice(&[0x1f, 0x8b, 0x08, 0x04, 0, 0, 0, 0, 0, 0xff]);
                f.extend_from_slice(&(label.len() as u16).to_le_bytes());
                f.extend_from_slice(&label);
                f.extend_from_slice(&[0x03, 0x00]);
                f.extend_from_slice(&0u32.to_le_bytes());
                f.extend_from_slice(&0u32.to_le_bytes());
                f
            }
            SeekableVariant::ZstdChunked => {
                // A zstd skippable frame with the same payload.
                let mut f = Vec::with_capacity(8 + label.len());
                f.extend_from_slice(&0x184D2A50u32.to_le_bytes());
                f.extend_from_slice(&(label.len() as u32).to_le_bytes());
                f.extend_from_slice(&label);
                f
            }
        }
    }

    /// Emit the TOC, the stream trailer and the locator footer, then
    /// produce the final state.
    pub fn finalize(mut self) -> Result<AppenderState> {
        // The annotated size is what the caller fed in: everything before
        // the TOC entry.
        let input_size = self.uncompressed_size;

        let toc = Toc {
            version: 1,
            entries: std::mem::take(&mut self.entries),
        };
        let json = serde_json::to_vec(&toc)?;
        let toc_digest = sha256(&json);

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o444);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(0);
        header.set_size(json.len() as u64);

        let toc_offset = self.outer.compressed_size();
        let mut member = serialize_header(&header, Utf8Path::new(TOC_NAME), None)?;
        member.extend_from_slice(&json);
        member.resize(member.len() + padding_for(json.len() as u64), 0);
        // End-of-archive marker.
        member.resize(member.len() + 2 * BLOCK, 0);
        self.write_member(&member)?;

        let footer = self.footer(toc_offset);
        self.outer
            .write_all(&footer)
            .map_err(classify_pipeline_error)?;
        self.outer.flush().map_err(classify_pipeline_error)?;

        self.annotations
            .insert(TOC_DIGEST_ANNOTATION.to_string(), toc_digest.to_string());
        self.annotations.insert(
            UNCOMPRESSED_SIZE_ANNOTATION.to_string(),
            input_size.to_string(),
        );
        debug!(
            magic = self.magic.as_str(),
            toc_offset,
            toc_digest = %toc_digest,
            "finalized seekable layer"
        );

        let (outer_hash, compressed_size) = self.outer.state();
        Ok(AppenderState {
            magic: self.magic,
            outer_hash_state: outer_hash.snapshot(),
            content_hash_state: self.content_hash.snapshot(),
            outer_hash: outer_hash.finalize().as_bytes().to_vec(),
            content_hash: self.content_hash.finalize().as_bytes().to_vec(),
            compressed_size,
            uncompressed_size: self.uncompressed_size,
            layer_annotations: self.annotations,
        })
    }
}

impl TarAppender for SeekableAppender {
    fn append_tar(&mut self, src: &mut dyn Read) -> Result<()> {
        let mut archive = tar::Archive::new(src);
        for entry in archive.entries()? {
            let mut entry = entry?;
            self.append_entry(&mut entry)?;
        }
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<AppenderState> {
        self.finalize()
    }
}
