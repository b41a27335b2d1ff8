use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use sha2::Digest;

use crate::error::VolumeError;

/// Hash algorithms a volume can be configured with.
///
/// The names are the ones stored in the manifest, so they must never change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
    Blake3,
}

impl HashAlgorithm {
    pub const ALL: [HashAlgorithm; 3] =
        [HashAlgorithm::Sha256, HashAlgorithm::Sha512, HashAlgorithm::Blake3];

    pub fn name(self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "SHA256",
            HashAlgorithm::Sha512 => "SHA512",
            HashAlgorithm::Blake3 => "BLAKE3",
        }
    }

    /// Digest size in bytes.
    pub fn size(self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha512 => 64,
            HashAlgorithm::Blake3 => 32,
        }
    }

    pub fn hasher(self) -> Hasher {
        match self {
            HashAlgorithm::Sha256 => Hasher::Sha256(sha2::Sha256::new()),
            HashAlgorithm::Sha512 => Hasher::Sha512(sha2::Sha512::new()),
            HashAlgorithm::Blake3 => Hasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    /// One-shot digest of `data`, base64 encoded.
    pub fn hash_base64(self, data: &[u8]) -> String {
        let mut h = self.hasher();
        h.update(data);
        h.finalize_base64()
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = VolumeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HashAlgorithm::ALL
            .into_iter()
            .find(|a| a.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| VolumeError::Config(format!("unsupported hash algorithm {s:?}")))
    }
}

/// Incremental hasher for any [`HashAlgorithm`].
pub enum Hasher {
    Sha256(sha2::Sha256),
    Sha512(sha2::Sha512),
    Blake3(Box<blake3::Hasher>),
}

impl Hasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
            Hasher::Blake3(h) => {
                h.update(data);
            }
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            Hasher::Sha256(h) => h.finalize().to_vec(),
            Hasher::Sha512(h) => h.finalize().to_vec(),
            Hasher::Blake3(h) => h.finalize().as_bytes().to_vec(),
        }
    }

    pub fn finalize_base64(self) -> String {
        STANDARD.encode(self.finalize())
    }
}

pub fn to_base64(digest: &[u8]) -> String {
    STANDARD.encode(digest)
}

pub fn from_base64(hash: &str) -> Result<Vec<u8>, VolumeError> {
    STANDARD.decode(hash).map_err(|e| VolumeError::Config(format!("bad base64 hash {hash:?}: {e}")))
}

/// Plain base64 to the URL-safe form used for entry names (`+` → `-`, `/` → `_`).
pub fn base64_plain_to_url(hash: &str) -> String {
    hash.replace('+', "-").replace('/', "_")
}

/// Inverse of [`base64_plain_to_url`].
pub fn base64_url_to_plain(name: &str) -> String {
    name.replace('-', "+").replace('_', "/")
}

/// Length of a padded base64 string for a digest of `hash_size` bytes.
pub fn encoded_len(hash_size: usize) -> usize {
    hash_size.div_ceil(3) * 4
}

/// True if `name` is non-empty padded URL-safe base64, whatever length it decodes to.
pub fn is_urlsafe_base64(name: &str) -> bool {
    !name.is_empty() && name.len() % 4 == 0 && URL_SAFE.decode(name).is_ok()
}

/// True if `name` is a padded URL-safe base64 string that decodes to exactly `hash_size` bytes.
pub fn is_valid_urlsafe_hash(name: &str, hash_size: usize) -> bool {
    if name.len() != encoded_len(hash_size) {
        return false;
    }
    matches!(URL_SAFE.decode(name), Ok(v) if v.len() == hash_size)
}
