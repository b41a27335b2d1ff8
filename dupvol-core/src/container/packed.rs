//! Single-file archive container.
//!
//! Layout: header, entry payloads back to back, then a directory and a fixed-size
//! trailer at EOF pointing at the directory. Compressible entries are stored zstd
//! compressed; everything else is stored raw. Every payload and the directory carry
//! a CRC32 so damage is detected on read.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{matches_prefix, CompressionHint, VolumeContainer};

const HEADER_MAGIC: &[u8] = b"DVOLPAK\0"; // 8 bytes
const HEADER_LEN: u64 = 8 + 4; // magic + format version
const FORMAT_VERSION: u32 = 1;

/// Constants for trailer format (directory locator at EOF)
const TRAILER_MAGIC: &[u8] = b"DVOLINDEX"; // 9 bytes
const TRAILER_LEN: u64 = 9 + 1 + 8 + 4 + 4; // magic + NUL + off + len + crc

/// Directory descriptor placed immediately before the compressed directory payload.
/// Format: magic (8) + NUL (1) + schema_version (u32 LE) + codec_id (u32 LE) + flags (u32 LE)
const DIR_DESC_MAGIC: &[u8] = b"DVOLDIRD"; // 8 bytes
const DIR_DESC_LEN: usize = DIR_DESC_MAGIC.len() + 1 + 4 + 4 + 4;

const ZSTD_LEVEL: i32 = 3;

#[derive(Serialize, Deserialize, Clone, Debug)]
struct PackedEntry {
    name: String,
    offset: u64,
    stored_len: u64,
    plain_len: u64,
    compressed: bool,
    modified_unix: i64,
    crc32: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct DirectoryLimits {
    pub max_uncompressed_bytes: usize,
    pub max_entries: usize,
}

impl Default for DirectoryLimits {
    fn default() -> Self {
        Self { max_uncompressed_bytes: 32 * 1024 * 1024, max_entries: 5_000_000 }
    }
}

fn unsupported(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, format!("packed archive: {what}"))
}

struct WriterState {
    out: BufWriter<File>,
    pos: u64,
    entries: Vec<PackedEntry>,
    /// Write failure inside an entry stream, reported by the next container call.
    deferred: Option<io::Error>,
}

impl WriterState {
    fn take_deferred(&mut self) -> io::Result<()> {
        match self.deferred.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Write side of the packed archive.
pub struct PackedWriter {
    path: PathBuf,
    state: WriterState,
    finished: bool,
}

impl PackedWriter {
    pub fn create(path: &Path) -> io::Result<Self> {
        let f = OpenOptions::new().create(true).write(true).truncate(true).open(path)?;
        let mut out = BufWriter::new(f);
        out.write_all(HEADER_MAGIC)?;
        out.write_all(&FORMAT_VERSION.to_le_bytes())?;
        Ok(Self {
            path: path.to_path_buf(),
            state: WriterState { out, pos: HEADER_LEN, entries: Vec::new(), deferred: None },
            finished: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl VolumeContainer for PackedWriter {
    fn open_read(&self, _name: &str) -> io::Result<Box<dyn Read + '_>> {
        Err(unsupported("archive is open for writing"))
    }

    fn create_file(
        &mut self,
        name: &str,
        hint: CompressionHint,
        modified: DateTime<Utc>,
    ) -> io::Result<Box<dyn Write + '_>> {
        if self.finished {
            return Err(unsupported("archive is already finished"));
        }
        self.state.take_deferred()?;
        let compressed = hint == CompressionHint::Compressible;
        let offset = self.state.pos;
        let counting = CountingWriter { state: &mut self.state, crc: Crc32::new(), written: 0 };
        let sink = if compressed {
            EntrySink::Zstd(zstd::stream::write::Encoder::new(counting, ZSTD_LEVEL)?)
        } else {
            EntrySink::Raw(counting)
        };
        Ok(Box::new(PackedEntryWriter {
            sink: Some(sink),
            name: name.to_string(),
            offset,
            plain_len: 0,
            compressed,
            modified_unix: modified.timestamp(),
        }))
    }

    fn list_files_with_size(&self, prefix: Option<&str>) -> io::Result<Vec<(String, u64)>> {
        Ok(self
            .state
            .entries
            .iter()
            .filter(|e| matches_prefix(&e.name, prefix))
            .map(|e| (e.name.clone(), e.plain_len))
            .collect())
    }

    fn size(&self) -> u64 {
        self.state.pos
    }

    /// Write the compressed (zstd) bincode directory at EOF and append a CRC'd trailer.
    fn finish(&mut self) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }
        self.state.take_deferred()?;
        let raw = bincode::serialize(&self.state.entries)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let compressed = zstd::stream::encode_all(&raw[..], ZSTD_LEVEL)?;
        let mut desc = Vec::with_capacity(DIR_DESC_LEN);
        desc.extend_from_slice(DIR_DESC_MAGIC);
        desc.push(0);
        desc.extend_from_slice(&1u32.to_le_bytes()); // schema_version = 1
        desc.extend_from_slice(&1u32.to_le_bytes()); // codec_id: 1 = zstd
        desc.extend_from_slice(&0u32.to_le_bytes()); // flags
        let dir_off = self.state.pos;
        let dir_len = (desc.len() + compressed.len()) as u32;
        let mut h = Crc32::new();
        h.update(&desc);
        h.update(&compressed);
        let crc = h.finalize();
        let out = &mut self.state.out;
        out.write_all(&desc)?;
        out.write_all(&compressed)?;
        let mut tr = Vec::with_capacity(TRAILER_LEN as usize);
        tr.extend_from_slice(TRAILER_MAGIC);
        tr.push(0);
        tr.extend_from_slice(&dir_off.to_le_bytes());
        tr.extend_from_slice(&dir_len.to_le_bytes());
        tr.extend_from_slice(&crc.to_le_bytes());
        out.write_all(&tr)?;
        out.flush()?;
        out.get_ref().sync_all()?;
        self.state.pos += dir_len as u64 + TRAILER_LEN;
        self.finished = true;
        debug!(
            path = %self.path.display(),
            entries = self.state.entries.len(),
            "packed archive finished"
        );
        Ok(())
    }
}

struct CountingWriter<'a> {
    state: &'a mut WriterState,
    crc: Crc32,
    written: u64,
}

impl Write for CountingWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = match self.state.out.write(buf) {
            Ok(n) => n,
            Err(e) => {
                self.state.deferred = Some(io::Error::new(e.kind(), e.to_string()));
                return Err(e);
            }
        };
        self.crc.update(&buf[..n]);
        self.written += n as u64;
        self.state.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.state.out.flush()
    }
}

enum EntrySink<'a> {
    Raw(CountingWriter<'a>),
    Zstd(zstd::stream::write::Encoder<'static, CountingWriter<'a>>),
}

struct PackedEntryWriter<'a> {
    sink: Option<EntrySink<'a>>,
    name: String,
    offset: u64,
    plain_len: u64,
    compressed: bool,
    modified_unix: i64,
}

impl Write for PackedEntryWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = match self.sink.as_mut() {
            Some(EntrySink::Raw(w)) => w.write(buf)?,
            Some(EntrySink::Zstd(w)) => w.write(buf)?,
            None => return Err(unsupported("entry already closed")),
        };
        self.plain_len += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.sink.as_mut() {
            Some(EntrySink::Raw(w)) => w.flush(),
            Some(EntrySink::Zstd(w)) => w.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for PackedEntryWriter<'_> {
    fn drop(&mut self) {
        let counting = match self.sink.take() {
            Some(EntrySink::Raw(w)) => Ok(w),
            Some(EntrySink::Zstd(w)) => w.finish(),
            None => return,
        };
        match counting {
            Ok(w) => {
                let entry = PackedEntry {
                    name: std::mem::take(&mut self.name),
                    offset: self.offset,
                    stored_len: w.written,
                    plain_len: self.plain_len,
                    compressed: self.compressed,
                    modified_unix: self.modified_unix,
                    crc32: w.crc.finalize(),
                };
                w.state.entries.push(entry);
            }
            // The underlying write failure is already recorded in `deferred`.
            Err(e) => {
                tracing::error!(entry = %self.name, error = %e, "failed to finish packed entry")
            }
        }
    }
}

/// Read side of the packed archive.
pub struct PackedReader {
    path: PathBuf,
    len: u64,
    entries: Vec<PackedEntry>,
}

impl PackedReader {
    pub fn open(path: &Path) -> io::Result<Self> {
        Self::open_with_limits(path, &DirectoryLimits::default())
    }

    pub fn open_with_limits(path: &Path, limits: &DirectoryLimits) -> io::Result<Self> {
        let mut f = File::open(path)?;
        let len = f.metadata()?.len();
        if len < HEADER_LEN + TRAILER_LEN {
            return Err(invalid("too short"));
        }
        let mut hdr = [0u8; HEADER_LEN as usize];
        f.read_exact(&mut hdr)?;
        if &hdr[..8] != HEADER_MAGIC {
            return Err(invalid("bad header magic"));
        }
        let version = u32::from_le_bytes([hdr[8], hdr[9], hdr[10], hdr[11]]);
        if version > FORMAT_VERSION {
            return Err(invalid(&format!("unsupported format version {version}")));
        }
        let (off, dlen, crc) = read_trailer(&mut f, len)?;
        let entries = read_directory(&mut f, off, dlen, crc, limits)?;
        debug!(path = %path.display(), entries = entries.len(), "opened packed archive");
        Ok(Self { path: path.to_path_buf(), len, entries })
    }

    fn find(&self, name: &str) -> Option<&PackedEntry> {
        self.entries.iter().rev().find(|e| e.name == name)
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("packed archive: {msg}"))
}

/// Read trailer at EOF; returns (dir_off, dir_len, crc32)
fn read_trailer(f: &mut File, flen: u64) -> io::Result<(u64, u32, u32)> {
    f.seek(SeekFrom::Start(flen - TRAILER_LEN))?;
    let mut tr = vec![0u8; TRAILER_LEN as usize];
    f.read_exact(&mut tr)?;
    if &tr[0..9] != TRAILER_MAGIC || tr[9] != 0 {
        return Err(invalid("bad trailer magic (archive not finished?)"));
    }
    let mut off8 = [0u8; 8];
    off8.copy_from_slice(&tr[10..18]);
    let mut len4 = [0u8; 4];
    len4.copy_from_slice(&tr[18..22]);
    let mut crc4 = [0u8; 4];
    crc4.copy_from_slice(&tr[22..26]);
    Ok((u64::from_le_bytes(off8), u32::from_le_bytes(len4), u32::from_le_bytes(crc4)))
}

/// Verify CRC, decompress, and decode the directory with limits applied.
fn read_directory(
    f: &mut File,
    off: u64,
    len: u32,
    crc: u32,
    limits: &DirectoryLimits,
) -> io::Result<Vec<PackedEntry>> {
    let mut buf = vec![0u8; len as usize];
    f.seek(SeekFrom::Start(off))?;
    f.read_exact(&mut buf)?;
    let mut h = Crc32::new();
    h.update(&buf);
    if h.finalize() != crc {
        return Err(invalid("directory CRC mismatch"));
    }
    if buf.len() < DIR_DESC_LEN
        || &buf[..DIR_DESC_MAGIC.len()] != DIR_DESC_MAGIC
        || buf[DIR_DESC_MAGIC.len()] != 0
    {
        return Err(invalid("bad directory descriptor"));
    }
    let mut decoder = zstd::stream::read::Decoder::new(&buf[DIR_DESC_LEN..])?;
    let mut raw = Vec::new();
    (&mut decoder).take(limits.max_uncompressed_bytes as u64 + 1).read_to_end(&mut raw)?;
    if raw.len() > limits.max_uncompressed_bytes {
        return Err(invalid(&format!(
            "directory larger than {} bytes",
            limits.max_uncompressed_bytes
        )));
    }
    let entries: Vec<PackedEntry> =
        bincode::deserialize(&raw).map_err(|e| invalid(&format!("directory decode: {e}")))?;
    if entries.len() > limits.max_entries {
        return Err(invalid("too many directory entries"));
    }
    Ok(entries)
}

/// Verifies the payload CRC once the entry has been read to the end.
struct CrcCheckedReader<R> {
    inner: R,
    crc: Option<Crc32>,
    expected: u32,
    name: String,
}

impl<R: Read> Read for CrcCheckedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            if let Some(crc) = self.crc.as_mut() {
                crc.update(&buf[..n]);
            }
        } else if !buf.is_empty() {
            if let Some(crc) = self.crc.take() {
                if crc.finalize() != self.expected {
                    return Err(invalid(&format!("CRC mismatch in entry {}", self.name)));
                }
            }
        }
        Ok(n)
    }
}

impl VolumeContainer for PackedReader {
    fn open_read(&self, name: &str) -> io::Result<Box<dyn Read + '_>> {
        let e = self.find(name).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no entry named {name:?}"))
        })?;
        // A fresh handle per entry so several entries can be read at the same time.
        let mut f = File::open(&self.path)?;
        f.seek(SeekFrom::Start(e.offset))?;
        let stored = CrcCheckedReader {
            inner: f.take(e.stored_len),
            crc: Some(Crc32::new()),
            expected: e.crc32,
            name: e.name.clone(),
        };
        if e.compressed {
            Ok(Box::new(zstd::stream::read::Decoder::new(stored)?))
        } else {
            Ok(Box::new(stored))
        }
    }

    fn create_file(
        &mut self,
        _name: &str,
        _hint: CompressionHint,
        _modified: DateTime<Utc>,
    ) -> io::Result<Box<dyn Write + '_>> {
        Err(unsupported("archive is open for reading"))
    }

    fn list_files_with_size(&self, prefix: Option<&str>) -> io::Result<Vec<(String, u64)>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| matches_prefix(&e.name, prefix))
            .map(|e| (e.name.clone(), e.plain_len))
            .collect())
    }

    fn size(&self) -> u64 {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_finish_reopen() {
        let td = tempfile::tempdir().unwrap();
        let p = td.path().join("a.pak");
        let mut w = PackedWriter::create(&p).unwrap();
        let json = br#"{"k":"vvvvvvvvvvvvvvvvvvvvvvvvvvvvvvvvvvvvvvvvvvv"}"#;
        w.create_file("doc", CompressionHint::Compressible, crate::util::now())
            .unwrap()
            .write_all(json)
            .unwrap();
        w.create_file("blk", CompressionHint::Noncompressible, crate::util::now())
            .unwrap()
            .write_all(&[7u8; 100])
            .unwrap();
        w.finish().unwrap();

        let r = PackedReader::open(&p).unwrap();
        assert_eq!(
            r.list_files_with_size(None).unwrap(),
            vec![("doc".to_string(), json.len() as u64), ("blk".to_string(), 100)]
        );
        let mut got = Vec::new();
        r.open_read("doc").unwrap().read_to_end(&mut got).unwrap();
        assert_eq!(&got[..], &json[..]);
        got.clear();
        r.open_read("blk").unwrap().read_to_end(&mut got).unwrap();
        assert_eq!(got, vec![7u8; 100]);
    }

    #[test]
    fn unfinished_archive_does_not_open() {
        let td = tempfile::tempdir().unwrap();
        let p = td.path().join("b.pak");
        {
            let mut w = PackedWriter::create(&p).unwrap();
            w.create_file("blk", CompressionHint::Noncompressible, crate::util::now())
                .unwrap()
                .write_all(&[1u8; 64])
                .unwrap();
            // dropped without finish
        }
        assert!(PackedReader::open(&p).is_err());
    }

    #[test]
    fn corrupted_payload_is_detected() {
        let td = tempfile::tempdir().unwrap();
        let p = td.path().join("c.pak");
        let mut w = PackedWriter::create(&p).unwrap();
        w.create_file("blk", CompressionHint::Noncompressible, crate::util::now())
            .unwrap()
            .write_all(&[3u8; 32])
            .unwrap();
        w.finish().unwrap();
        let mut bytes = std::fs::read(&p).unwrap();
        bytes[HEADER_LEN as usize + 5] ^= 0xff;
        std::fs::write(&p, bytes).unwrap();

        let r = PackedReader::open(&p).unwrap();
        let mut got = Vec::new();
        assert!(r.open_read("blk").unwrap().read_to_end(&mut got).is_err());
    }
}
