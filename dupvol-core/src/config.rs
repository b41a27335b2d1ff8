use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, VolumeError};
use crate::hash::HashAlgorithm;
use crate::manifest::Manifest;

pub const DEFAULT_BLOCKSIZE: u32 = 100 * 1024;
pub const DEFAULT_PREFIX: &str = "duplicati";
pub const DEFAULT_COMPRESSION: &str = "zst";
pub const DEFAULT_FILES_PER_FOLDER: u64 = 2000;

/// Settings as written by a user: everything optional, sizes as strings.
///
/// Loaded from a JSON file or assembled from command line flags, then turned
/// into [`VolumeOptions`] with [`RawOptions::resolve`].
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RawOptions {
    pub blocksize: Option<String>,
    pub block_hash_algorithm: Option<String>,
    pub file_hash_algorithm: Option<String>,
    pub compression_module: Option<String>,
    pub encryption_module: Option<String>,
    pub prefix: Option<String>,
    pub dont_read_manifests: Option<bool>,
    pub files_per_folder: Option<u64>,
}

impl RawOptions {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        serde_json::from_slice(&data)
            .map_err(|e| VolumeError::Config(format!("{}: {e}", path.display())))
    }

    /// Overlay `other` on top of `self`; values set in `other` win.
    pub fn overlay(mut self, other: RawOptions) -> Self {
        macro_rules! take {
            ($($f:ident),*) => { $( if other.$f.is_some() { self.$f = other.$f; } )* };
        }
        take!(
            blocksize,
            block_hash_algorithm,
            file_hash_algorithm,
            compression_module,
            encryption_module,
            prefix,
            dont_read_manifests,
            files_per_folder
        );
        self
    }

    /// Fill values the user did not set from a manifest. Explicit values are kept.
    pub fn merge_manifest(&mut self, manifest: &Manifest) {
        if self.blocksize.is_none() {
            self.blocksize = Some(format!("{}b", manifest.blocksize));
        }
        if self.block_hash_algorithm.is_none() {
            self.block_hash_algorithm = Some(manifest.block_hash.clone());
        }
        if self.file_hash_algorithm.is_none() {
            self.file_hash_algorithm = Some(manifest.file_hash.clone());
        }
        debug!(
            blocksize = ?self.blocksize,
            block_hash = ?self.block_hash_algorithm,
            file_hash = ?self.file_hash_algorithm,
            "options after manifest harvest"
        );
    }

    pub fn resolve(&self) -> Result<VolumeOptions> {
        let blocksize = match &self.blocksize {
            Some(s) => parse_size(s)?,
            None => DEFAULT_BLOCKSIZE as u64,
        };
        let blocksize = u32::try_from(blocksize)
            .ok()
            .filter(|b| *b > 0)
            .ok_or_else(|| VolumeError::Config(format!("blocksize {blocksize} out of range")))?;
        let block_hash = match &self.block_hash_algorithm {
            Some(s) => s.parse()?,
            None => HashAlgorithm::Sha256,
        };
        let file_hash = match &self.file_hash_algorithm {
            Some(s) => s.parse()?,
            None => HashAlgorithm::Sha256,
        };
        let prefix = self.prefix.clone().unwrap_or_else(|| DEFAULT_PREFIX.to_string());
        if prefix.is_empty() || prefix.contains('-') {
            return Err(VolumeError::Config(format!(
                "prefix {prefix:?} must be non-empty and must not contain '-'"
            )));
        }
        let files_per_folder = self.files_per_folder.unwrap_or(DEFAULT_FILES_PER_FOLDER);
        if files_per_folder == 0 {
            return Err(VolumeError::Config("files-per-folder must be at least 1".into()));
        }
        Ok(VolumeOptions {
            blocksize,
            block_hash,
            file_hash,
            compression_module: self
                .compression_module
                .clone()
                .unwrap_or_else(|| DEFAULT_COMPRESSION.to_string()),
            encryption_module: self.encryption_module.clone().filter(|s| !s.is_empty()),
            prefix,
            dont_read_manifests: self.dont_read_manifests.unwrap_or(false),
            files_per_folder,
        })
    }
}

/// Validated settings every volume reader and writer is built with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeOptions {
    pub blocksize: u32,
    pub block_hash: HashAlgorithm,
    pub file_hash: HashAlgorithm,
    pub compression_module: String,
    pub encryption_module: Option<String>,
    pub prefix: String,
    /// Skip manifest verification when opening volumes.
    pub dont_read_manifests: bool,
    pub files_per_folder: u64,
}

impl VolumeOptions {
    pub fn block_hash_size(&self) -> usize {
        self.block_hash.size()
    }
}

impl Default for VolumeOptions {
    fn default() -> Self {
        Self {
            blocksize: DEFAULT_BLOCKSIZE,
            block_hash: HashAlgorithm::Sha256,
            file_hash: HashAlgorithm::Sha256,
            compression_module: DEFAULT_COMPRESSION.to_string(),
            encryption_module: None,
            prefix: DEFAULT_PREFIX.to_string(),
            dont_read_manifests: false,
            files_per_folder: DEFAULT_FILES_PER_FOLDER,
        }
    }
}

/// Parse sizes like `100kb`, `1MB`, `512b` or a bare byte count.
pub fn parse_size(spec: &str) -> Result<u64> {
    let s = spec.trim().to_uppercase();
    let s = s.strip_suffix('B').unwrap_or(&s);
    let (num, mul) = if let Some(n) = s.strip_suffix('K') {
        (n, 1u64 << 10)
    } else if let Some(n) = s.strip_suffix('M') {
        (n, 1 << 20)
    } else if let Some(n) = s.strip_suffix('G') {
        (n, 1 << 30)
    } else {
        (s, 1)
    };
    let v: u64 =
        num.trim().parse().map_err(|_| VolumeError::Config(format!("bad size {spec:?}")))?;
    v.checked_mul(mul).ok_or_else(|| VolumeError::Config(format!("size {spec:?} overflows")))
}
