//! Compressing, dual-hashing byte appenders with resumable state.
//!
//! A [`CompressionAppender`] tees its uncompressed input into a content
//! hash (the OCI DiffID) and a compressor, and tees the compressor's output
//! into an outer hash (the OCI blob digest) and the caller's sink.
//! [`CompressionAppender::finalize`] closes the compressor so the format
//! trailer lands in the output, and returns an [`AppenderState`]: both hash
//! states, both byte counts and any layer annotations, serializable as JSON.
//!
//! A later invocation can [`CompressionAppender::resume`] from that state
//! and keep appending; the digests then cover the concatenation of all
//! sessions. The `magic` field fingerprints the pipeline configuration so a
//! snapshot cannot silently resume under a different hash, compression or
//! content type.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::compression::{new_compressor, Compression};
use crate::hash::{Digest, HashAlgorithm, ResumableSha256};
use crate::{Error, Result};

/// Copy buffer size; system calls are expensive.
const BUF_CAPACITY: usize = 131072;

/// Options common to appender construction and resume.
#[derive(Debug, Default, Clone)]
#[non_exhaustive]
pub struct AppenderOptions {
    /// Free-form content tag recorded in the state magic (for example a
    /// payload kind). Resuming requires the same tag.
    pub content_type: Option<String>,
    /// Compression level override; each backend has its own default.
    pub level: Option<i32>,
    /// Worker threads for parallel compression backends. `None` (or one)
    /// selects the sequential backend.
    pub jobs: Option<NonZeroUsize>,
}

/// The serializable snapshot of a finalized appender.
///
/// Callers persist this verbatim (see [`AppenderState::to_json`]) between
/// invocations; all binary fields are base64 in the JSON form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppenderState {
    /// Fingerprint of the pipeline configuration; the only compatibility
    /// gate checked on resume.
    pub magic: String,
    /// Serialized internal state of the outer (compressed stream) hash.
    #[serde(with = "base64_bytes")]
    pub outer_hash_state: Vec<u8>,
    /// Serialized internal state of the content (uncompressed stream) hash.
    #[serde(with = "base64_bytes")]
    pub content_hash_state: Vec<u8>,
    /// Digest of the compressed bytes at snapshot time.
    #[serde(with = "base64_bytes")]
    pub outer_hash: Vec<u8>,
    /// Digest of the uncompressed bytes at snapshot time.
    #[serde(with = "base64_bytes")]
    pub content_hash: Vec<u8>,
    /// Cumulative bytes delivered to the output sink.
    pub compressed_size: u64,
    /// Cumulative bytes fed into the compressor, including tar padding.
    pub uncompressed_size: u64,
    /// Key/value metadata to surface on the OCI descriptor.
    pub layer_annotations: BTreeMap<String, String>,
}

mod base64_bytes {
    use super::*;
    use serde::de::Error as _;
    use serde::{Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(
        bytes: &[u8],
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        BASE64.decode(s).map_err(D::Error::custom)
    }
}

impl AppenderState {
    /// Serialize to the on-disk JSON form.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse the on-disk JSON form.
    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }

    /// The digest of the compressed blob (descriptor `digest`).
    pub fn outer_digest(&self) -> Result<Digest> {
        Digest::new(self.algorithm()?, self.outer_hash.clone())
    }

    /// The digest of the uncompressed stream (config `diff_id`).
    pub fn content_digest(&self) -> Result<Digest> {
        Digest::new(self.algorithm()?, self.content_hash.clone())
    }

    fn algorithm(&self) -> Result<HashAlgorithm> {
        self.magic
            .split('+')
            .find_map(|seg| HashAlgorithm::from_str(seg).ok())
            .ok_or_else(|| Error::BadState(format!("no hash algorithm in magic {:?}", self.magic)))
    }
}

/// Build a configuration magic string.
pub(crate) fn magic_for(
    tar_aware: bool,
    algorithm: HashAlgorithm,
    compression_tag: &str,
    content_type: Option<&str>,
) -> String {
    let mut magic = String::from("imgv1+");
    if tar_aware {
        magic.push_str("tar+");
    }
    magic.push_str("compressed+");
    magic.push_str(algorithm.as_str());
    magic.push('+');
    magic.push_str(compression_tag);
    if let Some(ct) = content_type {
        magic.push('+');
        magic.push_str(ct);
    }
    magic
}

/// Marker wrapped around sink I/O errors so they can be told apart from
/// compressor failures after passing through a compression backend.
#[derive(Debug)]
struct SinkError(io::Error);

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "output sink error: {}", self.0)
    }
}

impl std::error::Error for SinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

fn contains_sink_marker(err: &(dyn std::error::Error + 'static)) -> bool {
    if err.is::<SinkError>() {
        return true;
    }
    if let Some(io_err) = err.downcast_ref::<io::Error>() {
        if let Some(inner) = io_err.get_ref() {
            if contains_sink_marker(inner) {
                return true;
            }
        }
    }
    err.source().is_some_and(contains_sink_marker)
}

/// Classify an error from the compression pipeline: sink failures keep
/// their identity through the marker, everything else is the compressor's.
pub(crate) fn classify_pipeline_error(err: io::Error) -> Error {
    let from_sink = err.get_ref().is_some_and(|inner| contains_sink_marker(inner));
    if from_sink {
        Error::Write(err)
    } else {
        Error::Compressor(err)
    }
}

struct SinkState {
    sink: Box<dyn Write + Send>,
    hash: ResumableSha256,
    compressed_size: u64,
}

/// The outer tee: hashes and counts the compressed stream on its way to
/// the caller's sink. Shared between the appender and the compression
/// backend (which may write from a worker thread).
#[derive(Clone)]
pub(crate) struct SharedSink(Arc<Mutex<SinkState>>);

impl SharedSink {
    pub(crate) fn new(sink: Box<dyn Write + Send>, hash: ResumableSha256, compressed_size: u64) -> Self {
        Self(Arc::new(Mutex::new(SinkState {
            sink,
            hash,
            compressed_size,
        })))
    }

    /// Snapshot the outer hash plus the byte count.
    pub(crate) fn state(&self) -> (ResumableSha256, u64) {
        let st = self.0.lock().unwrap();
        (st.hash.clone(), st.compressed_size)
    }

    /// Current number of bytes delivered to the sink.
    pub(crate) fn compressed_size(&self) -> u64 {
        self.0.lock().unwrap().compressed_size
    }
}

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut st = self.0.lock().unwrap();
        st.sink
            .write_all(buf)
            .map_err(|e| io::Error::new(e.kind(), SinkError(e)))?;
        st.hash.update(buf);
        st.compressed_size += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut st = self.0.lock().unwrap();
        st.sink
            .flush()
            .map_err(|e| io::Error::new(e.kind(), SinkError(e)))
    }
}

/// A sink for framed tar bytes; implemented by both the free-byte
/// appender and the tar-aware seekable one, so the tar-CAS can drive
/// either.
pub trait TarAppender: Send {
    /// Append tar-framed bytes read from `src`.
    fn append_tar(&mut self, src: &mut dyn Read) -> Result<()>;

    /// Close the stream and produce the final state.
    fn finish(self: Box<Self>) -> Result<AppenderState>;
}

/// The write side of a compressed, dual-hashed blob.
pub struct CompressionAppender {
    compressor: Option<Box<dyn crate::compression::Compressor>>,
    outer: SharedSink,
    content_hash: ResumableSha256,
    uncompressed_size: u64,
    magic: String,
    annotations: BTreeMap<String, String>,
}

impl fmt::Debug for CompressionAppender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompressionAppender")
            .field("magic", &self.magic)
            .field("uncompressed_size", &self.uncompressed_size)
            .finish_non_exhaustive()
    }
}

impl CompressionAppender {
    /// Start a fresh appender writing to `sink`.
    pub fn new(
        sink: Box<dyn Write + Send>,
        algorithm: HashAlgorithm,
        compression: Compression,
        options: AppenderOptions,
    ) -> Result<Self> {
        let magic = magic_for(
            false,
            algorithm,
            compression.magic_tag(),
            options.content_type.as_deref(),
        );
        Self::build(
            magic,
            sink,
            compression,
            &options,
            ResumableSha256::new(),
            ResumableSha256::new(),
            0,
            0,
            BTreeMap::new(),
        )
    }

    /// Reconstruct an appender from a prior snapshot, writing further
    /// compressed bytes to `sink`.
    ///
    /// Fails with [`Error::MagicMismatch`] when `state` was produced under
    /// a different configuration, and with [`Error::BadState`] when the
    /// hash states do not restore.
    pub fn resume(
        state: &AppenderState,
        sink: Box<dyn Write + Send>,
        algorithm: HashAlgorithm,
        compression: Compression,
        options: AppenderOptions,
    ) -> Result<Self> {
        let expected = magic_for(
            false,
            algorithm,
            compression.magic_tag(),
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
        debug!(
            magic = state.magic.as_str(),
            compressed_size = state.compressed_size,
            uncompressed_size = state.uncompressed_size,
            "resuming appender"
        );
        Self::build(
            state.magic.clone(),
            sink,
            compression,
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
        compression: Compression,
        options: &AppenderOptions,
        outer_hash: ResumableSha256,
        content_hash: ResumableSha256,
        compressed_size: u64,
        uncompressed_size: u64,
        annotations: BTreeMap<String, String>,
    ) -> Result<Self> {
        let outer = SharedSink::new(sink, outer_hash, compressed_size);
        let jobs = options.jobs.map_or(1, NonZeroUsize::get);
        let compressor = new_compressor(compression, options.level, jobs, outer.clone())?;
        Ok(Self {
            compressor: Some(compressor),
            outer,
            content_hash,
            uncompressed_size,
            magic,
            annotations,
        })
    }

    /// Append uncompressed bytes.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let compressor = self.compressor.as_mut().ok_or(Error::AlreadyClosed)?;
        compressor.write_all(data).map_err(classify_pipeline_error)?;
        self.content_hash.update(data);
        self.uncompressed_size += data.len() as u64;
        Ok(())
    }

    /// Flush the compressor's internal buffers. This does not necessarily
    /// produce a decompressible boundary in the output.
    pub fn flush(&mut self) -> Result<()> {
        let compressor = self.compressor.as_mut().ok_or(Error::AlreadyClosed)?;
        compressor.flush().map_err(classify_pipeline_error)
    }

    /// The configuration magic this appender records in its state.
    pub fn magic(&self) -> &str {
        &self.magic
    }

    /// Attach a descriptor annotation to surface on the final state.
    pub fn insert_annotation(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.annotations.insert(key.into(), value.into());
    }

    /// Close the compressor (writing its trailer) and produce the state.
    pub fn finalize(mut self) -> Result<AppenderState> {
        let compressor = self.compressor.take().ok_or(Error::AlreadyClosed)?;
        compressor.finish().map_err(classify_pipeline_error)?;
        let (outer_hash, compressed_size) = self.outer.state();
        debug!(
            magic = self.magic.as_str(),
            compressed_size, uncompressed_size = self.uncompressed_size,
            "finalized appender"
        );
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

impl TarAppender for CompressionAppender {
    fn append_tar(&mut self, src: &mut dyn Read) -> Result<()> {
        let mut buf = vec![0u8; BUF_CAPACITY];
        loop {
            let n = src.read(&mut buf)?;
            if n == 0 {
                return Ok(());
            }
            self.write(&buf[..n])?;
        }
    }

    fn finish(self: Box<Self>) -> Result<AppenderState> {
        self.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::VecSink;
    use crate::hash::sha256;
    use quickcheck::{QuickCheck, TestResult};
    use std::io::Read as _;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    #[test]
    fn test_hashes_and_counts() -> anyhow::Result<()> {
        let input = payload(300_000);
        for (compression, jobs) in [
            (Compression::Uncompressed, None),
            (Compression::Gzip, None),
            (Compression::Gzip, NonZeroUsize::new(4)),
            (Compression::Zstd, None),
        ] {
            let sink = VecSink::new();
            let mut a = CompressionAppender::new(
                Box::new(sink.clone()),
                HashAlgorithm::Sha256,
                compression,
                AppenderOptions {
                    jobs,
                    ..Default::default()
                },
            )?;
            for chunk in input.chunks(7001) {
                a.write(chunk)?;
            }
            let state = a.finalize()?;
            let output = sink.contents();

            assert_eq!(state.uncompressed_size, input.len() as u64);
            assert_eq!(state.compressed_size, output.len() as u64);
            similar_asserts::assert_eq!(state.content_digest()?, sha256(&input));
            similar_asserts::assert_eq!(state.outer_digest()?, sha256(&output));

            // Round-trip.
            let decoded = match compression {
                Compression::Uncompressed => output,
                Compression::Gzip => {
                    let mut v = Vec::new();
                    flate2::read::MultiGzDecoder::new(&output[..]).read_to_end(&mut v)?;
                    v
                }
                Compression::Zstd => zstd::decode_all(&output[..])?,
            };
            assert_eq!(decoded, input);
        }
        Ok(())
    }

    fn run_split(
        compression: Compression,
        input: &[u8],
        split: usize,
    ) -> (AppenderState, Vec<u8>) {
        let sink1 = VecSink::new();
        let mut a = CompressionAppender::new(
            Box::new(sink1.clone()),
            HashAlgorithm::Sha256,
            compression,
            AppenderOptions::default(),
        )
        .unwrap();
        a.write(&input[..split]).unwrap();
        let state = a.finalize().unwrap();

        let sink2 = VecSink::new();
        let mut b = CompressionAppender::resume(
            &state,
            Box::new(sink2.clone()),
            HashAlgorithm::Sha256,
            compression,
            AppenderOptions::default(),
        )
        .unwrap();
        b.write(&input[split..]).unwrap();
        let state = b.finalize().unwrap();

        let mut combined = sink1.contents();
        combined.extend_from_slice(&sink2.contents());
        (state, combined)
    }

    #[test]
    fn test_resume_equivalence_gzip() -> anyhow::Result<()> {
        let input = payload(2 * 1024 * 1024);
        let (state, combined) = run_split(Compression::Gzip, &input, input.len() / 2);

        assert_eq!(state.uncompressed_size, input.len() as u64);
        assert_eq!(state.compressed_size, combined.len() as u64);
        similar_asserts::assert_eq!(state.content_digest()?, sha256(&input));
        similar_asserts::assert_eq!(state.outer_digest()?, sha256(&combined));

        // Concatenated gzip members decompress to the concatenated input.
        let mut decoded = Vec::new();
        flate2::read::MultiGzDecoder::new(&combined[..]).read_to_end(&mut decoded)?;
        assert_eq!(decoded, input);
        Ok(())
    }

    #[test]
    fn test_resume_equivalence_property() {
        fn prop(data: Vec<u8>, split: usize) -> TestResult {
            if data.is_empty() {
                return TestResult::discard();
            }
            let split = split % (data.len() + 1);
            let (state, combined) = run_split(Compression::Uncompressed, &data, split);
            TestResult::from_bool(
                combined == data
                    && state.content_hash == sha256(&data).as_bytes()
                    && state.outer_hash == sha256(&combined).as_bytes()
                    && state.uncompressed_size == data.len() as u64,
            )
        }
        QuickCheck::new()
            .tests(30)
            .quickcheck(prop as fn(Vec<u8>, usize) -> TestResult);
    }

    #[test]
    fn test_magic_protection() {
        let sink = VecSink::new();
        let a = CompressionAppender::new(
            Box::new(sink.clone()),
            HashAlgorithm::Sha256,
            Compression::Gzip,
            AppenderOptions::default(),
        )
        .unwrap();
        let state = a.finalize().unwrap();
        assert_eq!(state.magic, "imgv1+compressed+sha256+gzip");

        let err = CompressionAppender::resume(
            &state,
            Box::new(VecSink::new()),
            HashAlgorithm::Sha256,
            Compression::Zstd,
            AppenderOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::MagicMismatch { .. }));

        let err = CompressionAppender::resume(
            &state,
            Box::new(VecSink::new()),
            HashAlgorithm::Sha256,
            Compression::Gzip,
            AppenderOptions {
                content_type: Some("docs".into()),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::MagicMismatch { .. }));
    }

    #[test]
    fn test_corrupt_state_rejected() {
        let a = CompressionAppender::new(
            Box::new(VecSink::new()),
            HashAlgorithm::Sha256,
            Compression::Gzip,
            AppenderOptions::default(),
        )
        .unwrap();
        let mut state = a.finalize().unwrap();
        state.outer_hash_state.truncate(3);
        let err = CompressionAppender::resume(
            &state,
            Box::new(VecSink::new()),
            HashAlgorithm::Sha256,
            Compression::Gzip,
            AppenderOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::BadState(_)));
    }

    #[test]
    fn test_state_json_roundtrip() -> anyhow::Result<()> {
        let sink = VecSink::new();
        let mut a = CompressionAppender::new(
            Box::new(sink),
            HashAlgorithm::Sha256,
            Compression::Gzip,
            AppenderOptions {
                content_type: Some("layer".into()),
                ..Default::default()
            },
        )?;
        a.write(b"some bytes")?;
        a.insert_annotation("org.example.build-id", "42");
        let state = a.finalize()?;
        assert_eq!(state.layer_annotations["org.example.build-id"], "42");
        let json = state.to_json()?;
        let parsed = AppenderState::from_json(&json)?;
        similar_asserts::assert_eq!(parsed, state);
        assert!(json.contains("imgv1+compressed+sha256+gzip+layer"));
        Ok(())
    }

    #[test]
    fn test_sink_errors_classify_as_write_failures() {
        struct FailingSink;
        impl Write for FailingSink {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::Other, "disk full"))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        let mut a = CompressionAppender::new(
            Box::new(FailingSink),
            HashAlgorithm::Sha256,
            Compression::Uncompressed,
            AppenderOptions::default(),
        )
        .unwrap();
        let err = a.write(b"x").unwrap_err();
        assert!(matches!(err, Error::Write(_)), "got {err:?}");
    }
}
