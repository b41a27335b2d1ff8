//! The archive-like capability every volume is stored in.
//!
//! Volumes never touch files or compression directly. They open, create and list
//! named entries through [`VolumeContainer`], which the compression/encryption
//! layer implements. Two implementations ship with the crate: [`MemoryContainer`]
//! and the single-file packed archive ([`PackedWriter`] / [`PackedReader`]).

use std::io::{self, Read, Write};

use chrono::{DateTime, Utc};

pub mod memory;
pub mod packed;

pub use memory::MemoryContainer;
pub use packed::{PackedReader, PackedWriter};

/// How well an entry is expected to compress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompressionHint {
    /// Let the container decide.
    Default,
    /// JSON and other text.
    Compressible,
    /// Block data: already hashed, usually already compressed.
    Noncompressible,
}

pub trait VolumeContainer {
    /// Open an entry for reading. Missing entries fail with [`io::ErrorKind::NotFound`].
    fn open_read(&self, name: &str) -> io::Result<Box<dyn Read + '_>>;

    /// Create an entry and return a stream for its content.
    ///
    /// The entry is complete once the returned stream is dropped.
    fn create_file(
        &mut self,
        name: &str,
        hint: CompressionHint,
        modified: DateTime<Utc>,
    ) -> io::Result<Box<dyn Write + '_>>;

    /// Entry names, in the order they were added, optionally restricted to a prefix.
    fn list_files(&self, prefix: Option<&str>) -> io::Result<Vec<String>> {
        Ok(self.list_files_with_size(prefix)?.into_iter().map(|(n, _)| n).collect())
    }

    /// Entry names with their uncompressed sizes.
    fn list_files_with_size(&self, prefix: Option<&str>) -> io::Result<Vec<(String, u64)>>;

    /// Current size of the container in bytes.
    fn size(&self) -> u64;

    /// Whether an entry exists.
    fn file_exists(&self, name: &str) -> io::Result<bool> {
        Ok(self.list_files(Some(name))?.iter().any(|n| n == name))
    }

    /// Flush everything and make the container complete. Called once by volume writers.
    fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<C: VolumeContainer + ?Sized> VolumeContainer for Box<C> {
    fn open_read(&self, name: &str) -> io::Result<Box<dyn Read + '_>> {
        (**self).open_read(name)
    }

    fn create_file(
        &mut self,
        name: &str,
        hint: CompressionHint,
        modified: DateTime<Utc>,
    ) -> io::Result<Box<dyn Write + '_>> {
        (**self).create_file(name, hint, modified)
    }

    fn list_files(&self, prefix: Option<&str>) -> io::Result<Vec<String>> {
        (**self).list_files(prefix)
    }

    fn list_files_with_size(&self, prefix: Option<&str>) -> io::Result<Vec<(String, u64)>> {
        (**self).list_files_with_size(prefix)
    }

    fn size(&self) -> u64 {
        (**self).size()
    }

    fn file_exists(&self, name: &str) -> io::Result<bool> {
        (**self).file_exists(name)
    }

    fn finish(&mut self) -> io::Result<()> {
        (**self).finish()
    }
}

pub(crate) fn matches_prefix(name: &str, prefix: Option<&str>) -> bool {
    prefix.map_or(true, |p| name.starts_with(p))
}
