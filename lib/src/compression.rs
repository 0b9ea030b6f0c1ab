//! Compressor backends for the layer appenders.
//!
//! The appenders treat compression as a capability set: construct a writer
//! over the output sink, feed it uncompressed bytes, and close it so the
//! format trailer lands in the output. Gzip optionally runs on a parallel
//! block compressor and zstd on its multithreaded mode; either way the
//! compressed bytes reach the sink in order.

use std::io::{self, Write};

use flate2::write::GzEncoder;
use gzp::par::compress::ParCompress;
use gzp::deflate::Gzip;
use gzp::ZWriter;

use crate::{Error, Result};

/// The compression applied to a layer's byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Pass bytes through unchanged.
    Uncompressed,
    /// Gzip via `flate2`, or the parallel block compressor when more than
    /// one job is requested.
    Gzip,
    /// Zstandard, optionally multithreaded.
    Zstd,
}

impl Compression {
    /// The tag recorded in the state magic.
    ///
    /// Parallel gzip shares the `gzip` tag: the wire format is identical,
    /// so snapshots taken under either backend are interchangeable.
    pub fn magic_tag(&self) -> &'static str {
        match self {
            Compression::Uncompressed => "uncompressed",
            Compression::Gzip => "gzip",
            Compression::Zstd => "zstd",
        }
    }

    /// The OCI layer media type for a tar stream under this compression.
    pub fn media_type(&self) -> &'static str {
        match self {
            Compression::Uncompressed => "application/vnd.oci.image.layer.v1.tar",
            Compression::Gzip => "application/vnd.oci.image.layer.v1.tar+gzip",
            Compression::Zstd => "application/vnd.oci.image.layer.v1.tar+zstd",
        }
    }
}

/// A running compressor over some sink.
pub(crate) trait Compressor: Write + Send {
    /// Write the format trailer (if any) and flush everything to the sink.
    fn finish(self: Box<Self>) -> io::Result<()>;
}

struct Passthrough<W>(W);

impl<W: Write + Send> Write for Passthrough<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<W: Write + Send> Compressor for Passthrough<W> {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        self.0.flush()
    }
}

struct GzipCompressor<W: Write>(GzEncoder<W>);

impl<W: Write + Send> Write for GzipCompressor<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<W: Write + Send> Compressor for GzipCompressor<W> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        self.0.finish()?.flush()
    }
}

struct ParGzipCompressor(ParCompress<Gzip>);

impl Write for ParGzipCompressor {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl Compressor for ParGzipCompressor {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        self.0.finish().map_err(io::Error::other)
    }
}

struct ZstdCompressor<W: Write>(zstd::stream::write::Encoder<'static, W>);

impl<W: Write + Send> Write for ZstdCompressor<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<W: Write + Send> Compressor for ZstdCompressor<W> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        self.0.finish()?.flush()
    }
}

/// Construct a compressor of the given kind over `sink`.
///
/// `jobs` is the resolved worker count; values above one select the
/// parallel gzip backend or zstd's multithreaded mode.
pub(crate) fn new_compressor<W: Write + Send + 'static>(
    compression: Compression,
    level: Option<i32>,
    jobs: usize,
    sink: W,
) -> Result<Box<dyn Compressor>> {
    match compression {
        Compression::Uncompressed => Ok(Box::new(Passthrough(sink))),
        Compression::Gzip => {
            let level = level.unwrap_or(flate2::Compression::default().level() as i32) as u32;
            if jobs > 1 {
                let parz: ParCompress<Gzip> = ParCompress::<Gzip>::builder()
                    .num_threads(jobs)
                    .map_err(|e| Error::Compressor(io::Error::other(e)))?
                    .compression_level(gzp::Compression::new(level))
                    .from_writer(sink);
                Ok(Box::new(ParGzipCompressor(parz)))
            } else {
                let enc = GzEncoder::new(sink, flate2::Compression::new(level));
                Ok(Box::new(GzipCompressor(enc)))
            }
        }
        Compression::Zstd => {
            let level = level.unwrap_or(zstd::DEFAULT_COMPRESSION_LEVEL);
            let mut enc =
                zstd::stream::write::Encoder::new(sink, level).map_err(Error::Compressor)?;
            if jobs > 1 {
                enc.multithread(jobs as u32).map_err(Error::Compressor)?;
            }
            Ok(Box::new(ZstdCompressor(enc)))
        }
    }
}
