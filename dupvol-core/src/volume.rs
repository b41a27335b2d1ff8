//! Manifest-first discipline shared by every volume reader and writer.

use std::io::{self, Read, Seek, SeekFrom, Write};

use chrono::{DateTime, Utc};
use tempfile::SpooledTempFile;
use tracing::debug;

use crate::config::VolumeOptions;
use crate::container::{CompressionHint, VolumeContainer};
use crate::error::{Result, VolumeError};
use crate::filename::{self, VolumeType};
use crate::manifest;
use crate::util;

/// JSON streams larger than this move from memory to a temp file while they are built.
pub(crate) const SPOOL_MEMORY_LIMIT: usize = 4 << 20;

/// State every writer carries: the owned container, its options and the open/closed flag.
#[derive(Debug)]
pub(crate) struct WriterBase<C> {
    pub(crate) container: C,
    pub(crate) options: VolumeOptions,
    filename: String,
    closed: bool,
}

impl<C: VolumeContainer> WriterBase<C> {
    /// Name the volume and write its manifest before anything else goes in.
    pub(crate) fn create(
        mut container: C,
        options: VolumeOptions,
        file_type: VolumeType,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<Self> {
        let filename = filename::generate(
            file_type,
            &options.prefix,
            None,
            timestamp,
            &options.compression_module,
            options.encryption_module.as_deref(),
        );
        manifest::write(&mut container, options.blocksize, options.block_hash, options.file_hash)?;
        debug!(volume = %filename, "created volume");
        Ok(Self { container, options, filename, closed: false })
    }

    pub(crate) fn filename(&self) -> &str {
        &self.filename
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(VolumeError::WriterClosed);
        }
        Ok(())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    /// Mark the writer closed and finish the container. A second call does nothing.
    pub(crate) fn finish(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.container.finish()?;
        debug!(volume = %self.filename, size = self.container.size(), "closed volume");
        Ok(())
    }

    /// Copy a finished spool into a new container entry.
    pub(crate) fn commit_spool(
        &mut self,
        name: &str,
        spool: &mut SpooledTempFile,
        hint: CompressionHint,
    ) -> Result<u64> {
        spool.flush()?;
        spool.seek(SeekFrom::Start(0))?;
        let mut w = self.container.create_file(name, hint, util::now())?;
        let n = io::copy(spool, &mut w)?;
        w.flush()?;
        Ok(n)
    }
}

/// Verify the manifest of a volume being opened, unless the options opt out.
pub(crate) fn check_manifest<C: VolumeContainer + ?Sized>(
    container: &C,
    options: &VolumeOptions,
) -> Result<()> {
    if options.dont_read_manifests {
        debug!("manifest check disabled");
        return Ok(());
    }
    manifest::verify(container, options.blocksize, options.block_hash, options.file_hash)?;
    Ok(())
}

pub(crate) fn new_spool() -> SpooledTempFile {
    tempfile::spooled_tempfile(SPOOL_MEMORY_LIMIT)
}

/// Read a whole small entry, `None` when it does not exist.
pub(crate) fn read_optional<C: VolumeContainer + ?Sized>(
    container: &C,
    name: &str,
) -> Result<Option<Vec<u8>>> {
    let mut s = match container.open_read(name) {
        Ok(s) => s,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut data = Vec::new();
    s.read_to_end(&mut data)?;
    Ok(Some(data))
}
