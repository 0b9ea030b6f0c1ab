//! Integration tests for `imglayer`.

use std::io::Read;
use std::sync::Arc;

use anyhow::Result;
use camino::Utf8Path;
use imglayer::appender::{AppenderOptions, AppenderState, CompressionAppender};
use imglayer::cas::{CasState, TarCas, TarStructure};
use imglayer::compression::Compression;
use imglayer::digest_cache::FileDigestCache;
use imglayer::estargz::{SeekableAppender, SeekableVariant, TOC_DIGEST_ANNOTATION};
use imglayer::fixture::{MemTree, VecSink};
use imglayer::hash::{sha256, HashAlgorithm};
use imglayer::recorder::{LayerRecorder, RunfileSource, RunfilesEntry};

fn gunzip(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    flate2::read::MultiGzDecoder::new(data)
        .read_to_end(&mut out)
        .unwrap();
    out
}

fn entry_list(data: &[u8]) -> Vec<(String, tar::EntryType, Vec<u8>)> {
    let mut ar = tar::Archive::new(data);
    ar.entries()
        .unwrap()
        .map(|e| {
            let mut e = e.unwrap();
            let path = String::from_utf8(e.path_bytes().to_vec()).unwrap();
            let mut content = Vec::new();
            e.read_to_end(&mut content).unwrap();
            (path, e.header().entry_type(), content)
        })
        .collect()
}

/// A full layer: plain files, a tree artifact and an executable with
/// runfiles, recorded through the gzip pipeline with CAS-first structure.
#[test]
fn test_record_full_layer() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let motd = dir.path().join("motd");
    std::fs::write(&motd, b"welcome\n")?;
    let bin = dir.path().join("server");
    std::fs::write(&bin, b"#!/bin/sh\nexec sleep inf\n")?;
    let mut words = MemTree::new();
    words.add_file("en/greetings.txt", b"hello\nhi\n");
    words.add_file("de/greetings.txt", b"hallo\n");

    let sink = VecSink::new();
    let appender = CompressionAppender::new(
        Box::new(sink.clone()),
        HashAlgorithm::Sha256,
        Compression::Gzip,
        AppenderOptions::default(),
    )?;
    let cache = Arc::new(FileDigestCache::new());
    let cas = TarCas::new(Box::new(appender), TarStructure::CasFirst)
        .with_digest_cache(cache.clone());
    let mut rec = LayerRecorder::new(cas);

    rec.add_file(Utf8Path::new("etc/motd"), &motd)?;
    // The same source at a second target only adds a reference.
    rec.add_file(Utf8Path::new("usr/share/motd"), &motd)?;
    rec.add_executable(
        Utf8Path::new("usr/bin/server"),
        &bin,
        &[RunfilesEntry {
            path: "words".into(),
            source: RunfileSource::Tree(&words),
        }],
    )?;
    let state = rec.finish()?;

    let output = sink.contents();
    let tarball = gunzip(&output);

    // Digest / DiffID / size invariants.
    assert_eq!(state.compressed_size, output.len() as u64);
    assert_eq!(state.uncompressed_size, tarball.len() as u64);
    assert_eq!(state.outer_digest()?, sha256(&output));
    assert_eq!(state.content_digest()?, sha256(&tarball));

    let entries = entry_list(&tarball);
    let paths: Vec<&str> = entries.iter().map(|(p, _, _)| p.as_str()).collect();

    // The substore precedes every entry outside it.
    let first_non_cas = paths
        .iter()
        .position(|p| !p.starts_with(".cas/"))
        .expect("non-CAS entries exist");
    assert!(
        paths[first_non_cas..].iter().all(|p| !p.starts_with(".cas/")),
        "substore entries must come first: {paths:?}"
    );

    // One payload for the twice-referenced file.
    let motd_payloads = entries
        .iter()
        .filter(|(p, t, _)| p.starts_with(".cas/") && *t == tar::EntryType::Regular)
        .filter(|(_, _, c)| c == b"welcome\n")
        .count();
    assert_eq!(motd_payloads, 1);
    assert!(paths.contains(&"etc/motd"));
    assert!(paths.contains(&"usr/share/motd"));
    assert!(paths.contains(&"usr/bin/server.runfiles/words"));
    Ok(())
}

/// Write 1 MiB, finalize, persist the state as JSON, resume into a second
/// sink, write another 1 MiB: the concatenated outputs decompress to the
/// full payload and the final digests cover all of it.
#[test]
fn test_resume_across_persisted_state() -> Result<()> {
    let payload: Vec<u8> = (0..2 * 1024 * 1024).map(|i| (i % 247) as u8).collect();
    let (first, second) = payload.split_at(1024 * 1024);

    let sink1 = VecSink::new();
    let mut a = CompressionAppender::new(
        Box::new(sink1.clone()),
        HashAlgorithm::Sha256,
        Compression::Gzip,
        AppenderOptions::default(),
    )?;
    a.write(first)?;
    let json = a.finalize()?.to_json()?;

    let state = AppenderState::from_json(&json)?;
    let sink2 = VecSink::new();
    let mut b = CompressionAppender::resume(
        &state,
        Box::new(sink2.clone()),
        HashAlgorithm::Sha256,
        Compression::Gzip,
        AppenderOptions::default(),
    )?;
    b.write(second)?;
    let final_state = b.finalize()?;

    let mut combined = sink1.contents();
    combined.extend_from_slice(&sink2.contents());
    assert_eq!(gunzip(&combined), payload);
    assert_eq!(final_state.content_digest()?, sha256(&payload));
    assert_eq!(final_state.outer_digest()?, sha256(&combined));
    assert_eq!(final_state.uncompressed_size, payload.len() as u64);
    assert_eq!(final_state.compressed_size, combined.len() as u64);
    Ok(())
}

/// The CAS drives the seekable appender: the result is a valid multi-member
/// gzip whose TOC digest annotation matches the emitted TOC bytes.
#[test]
fn test_cas_over_seekable_appender() -> Result<()> {
    let sink = VecSink::new();
    let appender = SeekableAppender::new(
        Box::new(sink.clone()),
        HashAlgorithm::Sha256,
        SeekableVariant::Gzip,
        AppenderOptions::default(),
    )?;
    let mut cas = TarCas::new(Box::new(appender), TarStructure::CasFirst);

    cas.store(&mut &b"seekable payload one"[..])?;
    cas.store(&mut &vec![9u8; 200 * 1024][..])?;
    cas.write_header(
        &{
            let mut h = tar::Header::new_gnu();
            h.set_entry_type(tar::EntryType::Directory);
            h.set_mode(0o755);
            h.set_uid(0);
            h.set_gid(0);
            h.set_mtime(0);
            h.set_size(0);
            h
        },
        Utf8Path::new("data/"),
        None,
    )?;
    let state = cas.close()?;

    let output = sink.contents();
    let tarball = gunzip(&output);
    let entries = entry_list(&tarball);

    let toc = entries
        .iter()
        .find(|(p, _, _)| p == "stargz.index.json")
        .expect("TOC entry");
    assert_eq!(
        state.layer_annotations[TOC_DIGEST_ANNOTATION],
        sha256(&toc.2).to_string()
    );
    // Blob entries and the deferred directory all made it through.
    let paths: Vec<&str> = entries.iter().map(|(p, _, _)| p.as_str()).collect();
    assert_eq!(paths.iter().filter(|p| p.starts_with(".cas/blob/")).count(), 2);
    assert!(paths.contains(&"data/"));
    assert_eq!(state.content_digest()?, sha256(&tarball));
    Ok(())
}

/// Chaining: a derived layer imports the base layer's CAS state and emits
/// no payload bytes for content the base already has.
#[test]
fn test_cross_layer_tree_dedup() -> Result<()> {
    let mut tree = MemTree::new();
    tree.add_file("lib/a.so", b"\x7fELF-a");
    tree.add_file("lib/b.so", b"\x7fELF-b");

    let base_sink = VecSink::new();
    let base_appender = CompressionAppender::new(
        Box::new(base_sink.clone()),
        HashAlgorithm::Sha256,
        Compression::Gzip,
        AppenderOptions::default(),
    )?;
    let mut base_rec = LayerRecorder::new(TarCas::new(
        Box::new(base_appender),
        TarStructure::CasFirst,
    ));
    base_rec.add_tree(Utf8Path::new("opt/libs"), &tree)?;
    let base_cas_state = {
        let cas = base_rec.cas_mut();
        cas.export()
    };
    base_rec.finish()?;
    assert_eq!(base_cas_state.trees.len(), 1);
    assert_eq!(base_cas_state.blobs.len(), 2);

    // Persist and reload the chain state, as a build system would between
    // layer actions.
    let chained = CasState::from_json(&base_cas_state.to_json()?)?;

    let derived_sink = VecSink::new();
    let derived_appender = CompressionAppender::new(
        Box::new(derived_sink.clone()),
        HashAlgorithm::Sha256,
        Compression::Gzip,
        AppenderOptions::default(),
    )?;
    let mut derived_cas = TarCas::new(Box::new(derived_appender), TarStructure::CasFirst);
    derived_cas.import(&chained);
    let mut derived_rec = LayerRecorder::new(derived_cas);
    derived_rec.add_tree(Utf8Path::new("srv/libs"), &tree)?;
    derived_rec.finish()?;

    let entries = entry_list(&gunzip(&derived_sink.contents()));
    // Only the caller-requested symlink: no blobs, no tree directory, no
    // hardlinks were re-emitted.
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0, "srv/libs");
    assert_eq!(entries[0].1, tar::EntryType::Symlink);
    Ok(())
}

/// Media types follow the configured compression.
#[test]
fn test_media_types() {
    assert_eq!(
        Compression::Gzip.media_type(),
        "application/vnd.oci.image.layer.v1.tar+gzip"
    );
    assert_eq!(
        Compression::Uncompressed.media_type(),
        "application/vnd.oci.image.layer.v1.tar"
    );
    assert_eq!(
        SeekableVariant::ZstdChunked.media_type(),
        "application/vnd.oci.image.layer.v1.tar+zstd"
    );
}
