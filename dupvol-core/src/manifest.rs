//! The manifest entry every volume starts with.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::RawOptions;
use crate::container::{CompressionHint, VolumeContainer};
use crate::error::{Result, VolumeError};
use crate::hash::HashAlgorithm;
use crate::util;

pub const MANIFEST_FILENAME: &str = "manifest";
/// Highest manifest version this crate understands, and the one it writes.
pub const MANIFEST_VERSION: u32 = 2;
pub const ENCODING: &str = "utf8";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Manifest {
    pub version: u32,
    pub created: String,
    pub encoding: String,
    pub blocksize: u64,
    pub block_hash: String,
    pub file_hash: String,
}

impl Manifest {
    pub fn new(blocksize: u32, block_hash: HashAlgorithm, file_hash: HashAlgorithm) -> Self {
        Self {
            version: MANIFEST_VERSION,
            created: util::serialize_datetime(&util::now()),
            encoding: ENCODING.to_string(),
            blocksize: blocksize as u64,
            block_hash: block_hash.name().to_string(),
            file_hash: file_hash.name().to_string(),
        }
    }

    fn check_version(&self) -> Result<()> {
        if self.version > MANIFEST_VERSION {
            return Err(VolumeError::manifest("Version", self.version, MANIFEST_VERSION));
        }
        Ok(())
    }

    /// Compare against the expected configuration, reporting the first field that differs.
    pub fn check(
        &self,
        blocksize: u32,
        block_hash: HashAlgorithm,
        file_hash: HashAlgorithm,
    ) -> Result<()> {
        self.check_version()?;
        if self.encoding != ENCODING {
            return Err(VolumeError::manifest("Encoding", &self.encoding, ENCODING));
        }
        if self.blocksize != blocksize as u64 {
            return Err(VolumeError::manifest("Blocksize", self.blocksize, blocksize));
        }
        if self.block_hash != block_hash.name() {
            return Err(VolumeError::manifest("BlockHash", &self.block_hash, block_hash));
        }
        if self.file_hash != file_hash.name() {
            return Err(VolumeError::manifest("FileHash", &self.file_hash, file_hash));
        }
        Ok(())
    }
}

/// Write the manifest entry. Volume writers call this before anything else.
pub fn write<C: VolumeContainer + ?Sized>(
    container: &mut C,
    blocksize: u32,
    block_hash: HashAlgorithm,
    file_hash: HashAlgorithm,
) -> Result<Manifest> {
    let manifest = Manifest::new(blocksize, block_hash, file_hash);
    let bytes = serde_json::to_vec(&manifest)
        .map_err(|e| VolumeError::Config(format!("serialize manifest: {e}")))?;
    let mut w =
        container.create_file(MANIFEST_FILENAME, CompressionHint::Compressible, util::now())?;
    w.write_all(&bytes)?;
    w.flush()?;
    Ok(manifest)
}

/// Read the manifest without checking it against anything.
pub fn read<C: VolumeContainer + ?Sized>(container: &C) -> Result<Manifest> {
    let mut s = match container.open_read(MANIFEST_FILENAME) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(VolumeError::manifest("manifest", "missing", "present"));
        }
        Err(e) => return Err(e.into()),
    };
    let mut data = Vec::new();
    s.read_to_end(&mut data)?;
    serde_json::from_slice(&data)
        .map_err(|e| VolumeError::manifest("manifest", format!("unparsable ({e})"), "valid JSON"))
}

/// Read the manifest and fail unless it matches the expected configuration.
pub fn verify<C: VolumeContainer + ?Sized>(
    container: &C,
    blocksize: u32,
    block_hash: HashAlgorithm,
    file_hash: HashAlgorithm,
) -> Result<Manifest> {
    let manifest = read(container)?;
    manifest.check(blocksize, block_hash, file_hash)?;
    Ok(manifest)
}

/// Read the manifest and use it to fill unset values in `options`.
///
/// Used to open a volume whose configuration is not known up front. Only the
/// version is checked.
pub fn harvest<C: VolumeContainer + ?Sized>(
    container: &C,
    options: &mut RawOptions,
) -> Result<Manifest> {
    let manifest = read(container)?;
    manifest.check_version()?;
    debug!(
        blocksize = manifest.blocksize,
        block_hash = %manifest.block_hash,
        file_hash = %manifest.file_hash,
        "harvesting options from manifest"
    );
    options.merge_manifest(&manifest);
    Ok(manifest)
}
