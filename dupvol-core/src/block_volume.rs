//! Block volumes: a flat bag of blocks, each stored under its URL-safe hash.

use std::collections::HashSet;
use std::io::Write;

use tracing::{debug, trace};

use crate::config::VolumeOptions;
use crate::container::{CompressionHint, VolumeContainer};
use crate::error::{Result, VolumeError};
use crate::filename::VolumeType;
use crate::hash;
use crate::manifest::MANIFEST_FILENAME;
use crate::util;
use crate::volume::{self, WriterBase};

pub struct BlockVolumeWriter<C: VolumeContainer> {
    base: WriterBase<C>,
    written: HashSet<String>,
    source_size: u64,
}

impl<C: VolumeContainer> BlockVolumeWriter<C> {
    pub fn create(container: C, options: VolumeOptions) -> Result<Self> {
        let base = WriterBase::create(container, options, VolumeType::Blocks, None)?;
        Ok(Self { base, written: HashSet::new(), source_size: 0 })
    }

    /// Generated `dblock` filename of this volume.
    pub fn filename(&self) -> &str {
        self.base.filename()
    }

    /// Store `data` under the base64 `hash`.
    pub fn add_block(&mut self, hash: &str, data: &[u8]) -> Result<()> {
        self.base.ensure_open()?;
        let name = hash::base64_plain_to_url(hash);
        if self.written.contains(&name) {
            return Err(VolumeError::DuplicateBlock(hash.to_string()));
        }
        let mut w =
            self.base.container.create_file(&name, CompressionHint::Noncompressible, util::now())?;
        w.write_all(data)?;
        w.flush()?;
        drop(w);
        trace!(hash, len = data.len(), "added block");
        self.written.insert(name);
        self.source_size += data.len() as u64;
        Ok(())
    }

    /// Number of blocks written so far. Informational only.
    pub fn blocks(&self) -> u64 {
        self.written.len() as u64
    }

    /// Total bytes of block data written so far. Informational only.
    pub fn source_size(&self) -> u64 {
        self.source_size
    }

    /// Current size of the container.
    pub fn size(&self) -> u64 {
        self.base.container.size()
    }

    pub fn close(&mut self) -> Result<()> {
        if !self.base.is_closed() {
            debug!(volume = %self.base.filename(), blocks = self.blocks(), "closing block volume");
        }
        self.base.finish()
    }

    /// Close if still open and hand back the container.
    pub fn into_container(mut self) -> Result<C> {
        self.close()?;
        Ok(self.base.container)
    }
}

pub struct BlockVolumeReader<C: VolumeContainer> {
    container: C,
}

impl<C: VolumeContainer> BlockVolumeReader<C> {
    pub fn open(container: C, options: &VolumeOptions) -> Result<Self> {
        volume::check_manifest(&container, options)?;
        Ok(Self { container })
    }

    /// Read the block stored under `hash` into `buf`, returning the number of bytes read.
    ///
    /// `buf` should be one block size long; reading stops when it is full.
    pub fn read_block(&self, hash: &str, buf: &mut [u8]) -> Result<usize> {
        let mut s = self.container.open_read(&hash::base64_plain_to_url(hash))?;
        Ok(util::force_read(&mut *s, buf)?)
    }

    /// Every block in the volume as `(hash, size)`.
    ///
    /// Entries are listed once per call. Every name in URL-safe base64 form is a
    /// block, whatever digest length it decodes to; the manifest is skipped.
    pub fn blocks(&self) -> Result<BlockEntries> {
        Ok(BlockEntries { entries: self.container.list_files_with_size(None)?.into_iter() })
    }

    pub fn container(&self) -> &C {
        &self.container
    }

    pub fn into_container(self) -> C {
        self.container
    }
}

pub struct BlockEntries {
    entries: std::vec::IntoIter<(String, u64)>,
}

impl Iterator for BlockEntries {
    type Item = (String, u64);

    fn next(&mut self) -> Option<Self::Item> {
        self.entries
            .by_ref()
            .find(|(name, _)| name != MANIFEST_FILENAME && hash::is_urlsafe_base64(name))
            .map(|(name, size)| (hash::base64_url_to_plain(&name), size))
    }
}
