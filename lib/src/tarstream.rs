//! Minimal tar record framing.
//!
//! The tar-CAS and the seekable appender frame entries by hand (the
//! deduplication and TOC logic both need to know exactly where records
//! start), so this module owns the raw record layout: 512-byte blocks,
//! trailing zero padding, and GNU `L`/`K` entries for names or link targets
//! over 100 bytes.

use std::io::{self, Read};

use camino::Utf8Path;

use crate::{Error, Result};

/// Tar block size.
pub(crate) const BLOCK: usize = 512;

/// Name used by GNU long-name/long-link pseudo entries.
const LONG_LINK_NAME: &str = "././@LongLink";

/// Zero bytes required to complete the last 512-byte block of a payload.
pub(crate) fn padding_for(size: u64) -> usize {
    ((BLOCK as u64 - (size % BLOCK as u64)) % BLOCK as u64) as usize
}

fn push_padded(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(data);
    out.resize(out.len() + padding_for(data.len() as u64), 0);
}

/// A GNU `L` (long name) or `K` (long link) record carrying `value`.
fn long_entry(kind: tar::EntryType, value: &str) -> Vec<u8> {
    let mut h = tar::Header::new_gnu();
    // The long-entry header itself always carries the magic placeholder
    // name, never the real one.
    h.set_path(LONG_LINK_NAME).expect("short constant path");
    h.set_entry_type(kind);
    h.set_mode(0o644);
    h.set_uid(0);
    h.set_gid(0);
    h.set_mtime(0);
    h.set_size(value.len() as u64 + 1);
    h.set_cksum();
    let mut out = Vec::with_capacity(2 * BLOCK);
    out.extend_from_slice(h.as_bytes());
    let mut payload = value.as_bytes().to_vec();
    payload.push(0);
    push_padded(&mut out, &payload);
    out
}

fn set_name_raw(header: &mut tar::Header, name: &str) {
    let field = &mut header.as_old_mut().name;
    let n = name.len().min(field.len());
    field[..n].copy_from_slice(&name.as_bytes()[..n]);
}

fn set_link_raw(header: &mut tar::Header, link: &str) {
    let field = &mut header.as_old_mut().linkname;
    let n = link.len().min(field.len());
    field[..n].copy_from_slice(&link.as_bytes()[..n]);
}

/// Serialize a header (plus any needed GNU long-name records) for the
/// entry at `path`, optionally linking to `link`. Returns whole 512-byte
/// records; the caller appends payload and padding separately.
pub(crate) fn serialize_header(
    header: &tar::Header,
    path: &Utf8Path,
    link: Option<&Utf8Path>,
) -> Result<Vec<u8>> {
    let path = path.as_str();
    if path.is_empty() {
        return Err(Error::InvalidHeader("empty entry name".into()));
    }
    let mut out = Vec::with_capacity(BLOCK);
    let mut h = tar::Header::new_gnu();
    h.set_entry_type(header.entry_type());
    h.set_mode(header.mode()?);
    h.set_uid(header.uid()?);
    h.set_gid(header.gid()?);
    h.set_mtime(header.mtime()?);
    h.set_size(header.size()?);
    // Device fields are only meaningful (or even reliably parseable) for
    // device entries.
    if let Ok(Some(major)) = header.device_major() {
        h.set_device_major(major)?;
    }
    if let Ok(Some(minor)) = header.device_minor() {
        h.set_device_minor(minor)?;
    }

    if path.len() >= 100 {
        out.extend_from_slice(&long_entry(tar::EntryType::GNULongName, path));
    }
    set_name_raw(&mut h, path);
    if let Some(link) = link {
        let link = link.as_str();
        if link.len() >= 100 {
            out.extend_from_slice(&long_entry(tar::EntryType::GNULongLink, link));
        }
        set_link_raw(&mut h, link);
    }
    h.set_cksum();
    out.extend_from_slice(h.as_bytes());
    Ok(out)
}

/// Adapts a payload reader so the stream ends on a 512-byte boundary,
/// without buffering the payload. Used to frame large file contents.
pub(crate) struct PaddedReader<R> {
    inner: R,
    count: u64,
    pad_left: Option<usize>,
}

impl<R: Read> PaddedReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            inner,
            count: 0,
            pad_left: None,
        }
    }

    /// Payload bytes read so far, excluding padding.
    pub(crate) fn bytes_read(&self) -> u64 {
        self.count
    }
}

impl<R: Read> Read for PaddedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.pad_left {
                None => {
                    let n = self.inner.read(buf)?;
                    if n > 0 {
                        self.count += n as u64;
                        return Ok(n);
                    }
                    self.pad_left = Some(padding_for(self.count));
                }
                Some(0) => return Ok(0),
                Some(pad) => {
                    let n = pad.min(buf.len());
                    buf[..n].fill(0);
                    self.pad_left = Some(pad - n);
                    return Ok(n);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padding_for() {
        assert_eq!(padding_for(0), 0);
        assert_eq!(padding_for(1), 511);
        assert_eq!(padding_for(511), 1);
        assert_eq!(padding_for(512), 0);
        assert_eq!(padding_for(513), 511);
        assert_eq!(padding_for(6), 506);
    }

    #[test]
    fn test_padded_reader() {
        let payload = vec![3u8; 700];
        let mut r = PaddedReader::new(&payload[..]);
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out.len(), 1024);
        assert_eq!(&out[..700], &payload[..]);
        assert!(out[700..].iter().all(|&b| b == 0));
        assert_eq!(r.bytes_read(), 700);
    }

    fn roundtrip(path: &str, link: Option<&str>) -> (String, Option<String>) {
        let mut h = tar::Header::new_gnu();
        h.set_entry_type(if link.is_some() {
            tar::EntryType::Link
        } else {
            tar::EntryType::Regular
        });
        h.set_mode(0o755);
        h.set_uid(0);
        h.set_gid(0);
        h.set_mtime(0);
        h.set_size(0);
        let mut bytes = serialize_header(&h, path.into(), link.map(Utf8Path::new)).unwrap();
        bytes.resize(bytes.len() + 2 * BLOCK, 0);
        let mut ar = tar::Archive::new(&bytes[..]);
        let entry = ar.entries().unwrap().next().unwrap().unwrap();
        let got_path = String::from_utf8(entry.path_bytes().to_vec()).unwrap();
        let got_link = entry
            .link_name_bytes()
            .map(|l| String::from_utf8(l.to_vec()).unwrap());
        (got_path, got_link)
    }

    #[test]
    fn test_serialize_header_short_and_long() {
        let (p, l) = roundtrip("bin/tool", None);
        assert_eq!(p, "bin/tool");
        assert_eq!(l, None);

        let long = format!(".cas/tree/{}/deeply/nested/directory/name/file", "ab".repeat(32));
        assert!(long.len() >= 100);
        let (p, _) = roundtrip(&long, None);
        assert_eq!(p, long);

        let (p, l) = roundtrip("short", Some(long.as_str()));
        assert_eq!(p, "short");
        assert_eq!(l.as_deref(), Some(long.as_str()));
    }
}
