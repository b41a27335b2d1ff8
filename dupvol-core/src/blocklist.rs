//! Blocklists: the raw digests of a run of blocks, concatenated.

use std::io::{self, Read, Seek, SeekFrom, Write};

use tracing::warn;

use crate::container::{CompressionHint, VolumeContainer};
use crate::error::{Result, VolumeError};
use crate::hash::{self, HashAlgorithm, Hasher};
use crate::util;
use crate::volume;

/// Entry name of a blocklist: `folder` followed by the URL-safe hash.
pub fn entry_name(folder: &str, hash: &str) -> String {
    format!("{folder}{}", hash::base64_plain_to_url(hash))
}

/// Lazy sequence of base64 hashes stored in one blocklist entry.
///
/// Single pass; read the entry again to start over. After the first error the
/// iterator is exhausted.
pub struct BlocklistHashes<'a> {
    entry: String,
    stream: Box<dyn Read + 'a>,
    buf: Vec<u8>,
    read: u64,
    verify: Option<(Hasher, String)>,
    done: bool,
}

impl<'a> BlocklistHashes<'a> {
    fn next_hash(&mut self) -> Result<Option<String>> {
        let n = util::force_read(&mut *self.stream, &mut self.buf)?;
        if n == 0 {
            if let Some((hasher, expected)) = self.verify.take() {
                let actual = hasher.finalize_base64();
                if actual != expected {
                    return Err(VolumeError::BlocklistHashMismatch { expected, actual });
                }
            }
            return Ok(None);
        }
        if n != self.buf.len() {
            return Err(VolumeError::TruncatedBlocklist {
                entry: self.entry.clone(),
                got: n,
                expected: self.buf.len(),
                offset: self.read * self.buf.len() as u64,
            });
        }
        self.read += 1;
        if let Some((hasher, _)) = self.verify.as_mut() {
            hasher.update(&self.buf);
        }
        Ok(Some(hash::to_base64(&self.buf)))
    }
}

impl Iterator for BlocklistHashes<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_hash() {
            Ok(Some(h)) => Some(Ok(h)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Read the hashes in `entry`, `hash_size` bytes at a time.
pub fn read<'a, C: VolumeContainer + ?Sized>(
    container: &'a C,
    entry: &str,
    hash_size: usize,
) -> Result<BlocklistHashes<'a>> {
    Ok(BlocklistHashes {
        entry: entry.to_string(),
        stream: container.open_read(entry)?,
        buf: vec![0; hash_size],
        read: 0,
        verify: None,
        done: false,
    })
}

/// Like [`read`], and once the entry is exhausted check that its bytes hash to `expected_hash`.
pub fn read_verified<'a, C: VolumeContainer + ?Sized>(
    container: &'a C,
    entry: &str,
    hash_size: usize,
    expected_hash: &str,
    algorithm: HashAlgorithm,
) -> Result<BlocklistHashes<'a>> {
    let mut hashes = read(container, entry, hash_size)?;
    hashes.verify = Some((algorithm.hasher(), expected_hash.to_string()));
    Ok(hashes)
}

fn check_alignment(hash: &str, len: u64, hash_size: usize) -> Result<()> {
    if hash_size == 0 || len % hash_size as u64 != 0 {
        return Err(VolumeError::MalformedBlocklist { hash: hash.to_string(), len, hash_size });
    }
    Ok(())
}

/// Write a blocklist into `entry`. Nothing is written when `data` is not a whole number of hashes.
pub fn write_at<C: VolumeContainer + ?Sized>(
    container: &mut C,
    entry: &str,
    hash: &str,
    data: &[u8],
    hash_size: usize,
) -> Result<()> {
    check_alignment(hash, data.len() as u64, hash_size)?;
    let mut w = container.create_file(entry, CompressionHint::Noncompressible, util::now())?;
    w.write_all(data)?;
    w.flush()?;
    Ok(())
}

/// Write a blocklist under its URL-safe hash at the container root.
pub fn write<C: VolumeContainer + ?Sized>(
    container: &mut C,
    hash: &str,
    data: &[u8],
    hash_size: usize,
) -> Result<()> {
    write_at(container, &entry_name("", hash), hash, data, hash_size)
}

/// Copy a blocklist from a stream, one hash at a time.
///
/// The stream is spooled first and the entry is only created once the length is
/// known to be hash aligned, so a misaligned stream writes nothing.
pub fn write_stream_at<C: VolumeContainer + ?Sized>(
    container: &mut C,
    entry: &str,
    hash: &str,
    data: &mut dyn Read,
    hash_size: usize,
) -> Result<u64> {
    check_alignment(hash, 0, hash_size)?;
    let mut spool = volume::new_spool();
    let mut buf = vec![0u8; hash_size];
    let mut total = 0u64;
    loop {
        let n = util::force_read(data, &mut buf)?;
        total += n as u64;
        if n == 0 {
            break;
        }
        if n != hash_size {
            warn!(entry, len = total, "blocklist stream is not hash aligned");
            return Err(VolumeError::MalformedBlocklist {
                hash: hash.to_string(),
                len: total,
                hash_size,
            });
        }
        spool.write_all(&buf)?;
    }
    spool.seek(SeekFrom::Start(0))?;
    let mut w = container.create_file(entry, CompressionHint::Noncompressible, util::now())?;
    io::copy(&mut spool, &mut w)?;
    w.flush()?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::MemoryContainer;

    #[test]
    fn names_use_the_url_safe_alphabet() {
        assert_eq!(entry_name("list/", "a+b/c="), "list/a-b_c=");
    }

    #[test]
    fn stream_copy_rejects_a_short_tail() {
        let mut c = MemoryContainer::new();
        let data = vec![7u8; 32 * 2 + 5];
        let err = write_stream_at(&mut c, "x", "h", &mut data.as_slice(), 32).unwrap_err();
        assert!(matches!(err, VolumeError::MalformedBlocklist { len: 69, .. }));
        assert!(c.is_empty(), "the whole hashes before the tail must not be stored");
    }

    #[test]
    fn verified_read_checks_the_digest_after_the_last_hash() {
        let mut c = MemoryContainer::new();
        let data: Vec<u8> = (0..64u8).collect();
        let right = HashAlgorithm::Sha256.hash_base64(&data);
        c.insert("bl", data);

        let ok: Vec<_> =
            read_verified(&c, "bl", 32, &right, HashAlgorithm::Sha256).unwrap().collect();
        assert_eq!(ok.len(), 2);
        assert!(ok.iter().all(|r| r.is_ok()));

        let wrong = HashAlgorithm::Sha256.hash_base64(b"other");
        let got: Vec<_> =
            read_verified(&c, "bl", 32, &wrong, HashAlgorithm::Sha256).unwrap().collect();
        assert_eq!(got.len(), 3);
        assert!(matches!(got[2], Err(VolumeError::BlocklistHashMismatch { .. })));
    }
}
