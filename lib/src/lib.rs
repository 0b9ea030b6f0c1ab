//! # Content-addressed production of OCI image layers
//!
//! This crate is the write side of an image build pipeline: it ingests
//! files, directory trees and executables with their runfiles, and emits a
//! single tar stream whose regular-file payloads are deduplicated through an
//! in-tar content-addressable substore under `.cas/`. The stream is
//! compressed on the fly (gzip, zstd, seekable estargz variants or not at
//! all) while two digests are maintained: the *content hash* over the
//! uncompressed tar bytes (the OCI DiffID) and the *outer hash* over the
//! bytes delivered to the output sink (the OCI blob digest).
//!
//! Both digests use a hash implementation whose internal state can be
//! serialized, so a finished layer can be snapshotted via
//! [`appender::AppenderState`] and *resumed* later to append further
//! entries. Together with the exportable CAS state ([`cas::CasState`]) this
//! lets a derived layer deduplicate against blobs already present in a base
//! layer without re-reading it.
//!
//! The top-level entry point for most callers is [`recorder::LayerRecorder`];
//! the lower layers ([`cas::TarCas`], [`appender::CompressionAppender`],
//! [`estargz::SeekableAppender`]) are public for callers that need direct
//! control over tar structure or compression.

// SPDX-License-Identifier: MIT OR Apache-2.0

use std::io;

use camino::Utf8PathBuf;
use thiserror::Error;

pub mod appender;
pub mod cas;
pub mod compression;
pub mod digest_cache;
pub mod estargz;
#[cfg(any(test, feature = "internal-testing-api"))]
pub mod fixture;
pub mod hash;
pub mod merkle;
pub mod recorder;
mod tarstream;
pub mod treefs;

/// An error while producing a layer.
#[derive(Debug, Error)]
#[allow(missing_docs)]
#[non_exhaustive]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("compressor failure: {0}")]
    Compressor(io::Error),
    #[error("output sink write failure: {0}")]
    Write(io::Error),
    #[error("state magic mismatch: expected {expected}, found {found}")]
    MagicMismatch { expected: String, found: String },
    #[error("invalid resumable state: {0}")]
    BadState(String),
    #[error("write-header callback rejected {path}")]
    CallbackRejected {
        path: Utf8PathBuf,
        #[source]
        source: Box<Error>,
    },
    #[error("empty directory {0} in tree artifact")]
    EmptyDirectoryInTreeArtifact(Utf8PathBuf),
    #[error("unsupported entry type at {0}")]
    UnsupportedEntry(Utf8PathBuf),
    #[error("inconsistent payload size: expected {expected} bytes, read {actual}")]
    InconsistentSize { expected: u64, actual: u64 },
    #[error("operation on closed writer")]
    AlreadyClosed,
    #[error("invalid tar header: {0}")]
    InvalidHeader(String),
    #[error("unsupported hash algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The type of Result.
pub type Result<T> = std::result::Result<T, Error>;
