//! Error types for volume reading and writing.

/// All errors surfaced by the volume subsystem.
///
/// Nothing in this crate retries; every variant is reported to the immediate caller.
#[derive(Debug, thiserror::Error)]
pub enum VolumeError {
    /// The manifest disagrees with the expected configuration, is from a newer
    /// version, or is missing entirely.
    #[error("invalid manifest: {field} is {actual:?}, expected {expected:?}")]
    InvalidManifest { field: String, actual: String, expected: String },

    /// A token in the fileset JSON did not match what the format requires at that position.
    #[error("invalid fileset data: expected {expected}, but got {actual} ({context})")]
    InvalidFilesetData { expected: String, actual: String, context: String },

    /// Lexical JSON failure (bad escape, unterminated string, stray byte).
    #[error("invalid JSON at byte {offset}: {message}")]
    InvalidJson { offset: u64, message: String },

    /// A blocklist stream ended in the middle of a hash.
    #[error(
        "premature end-of-stream in blocklist {entry}: got {got} bytes of {expected} at offset {offset}"
    )]
    TruncatedBlocklist { entry: String, got: usize, expected: usize, offset: u64 },

    /// A blocklist to be written is not a whole number of hashes.
    #[error(
        "blocklist {hash} has {len} bytes, which is not a multiple of the hash size {hash_size}"
    )]
    MalformedBlocklist { hash: String, len: u64, hash_size: usize },

    /// The concatenated blocklist bytes do not hash to the name they are stored under.
    #[error("blocklist hash does not match: expected {expected}, got {actual}")]
    BlocklistHashMismatch { expected: String, actual: String },

    /// A writer was used out of order.
    #[error("invalid call sequence: {0}")]
    Sequence(&'static str),

    /// A writer was used after `close()`.
    #[error("volume writer is already closed")]
    WriterClosed,

    /// The same block hash was added twice to one block volume.
    #[error("block {0} was already written to this volume")]
    DuplicateBlock(String),

    /// A non-empty file stream has neither a block hash nor blocklists.
    #[error("entry {path} has {size} bytes of {stream} but no block or blocklist")]
    MissingContent { path: String, stream: &'static str, size: u64 },

    /// A file stream has both a block hash and blocklists.
    #[error("entry {path} has both a block hash and blocklists for its {stream}")]
    ConflictingContent { path: String, stream: &'static str },

    /// Invalid option value.
    #[error("configuration error: {0}")]
    Config(String),

    /// Container or stream failure, including entries that do not exist.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VolumeError {
    pub(crate) fn manifest(
        field: impl Into<String>,
        actual: impl ToString,
        expected: impl ToString,
    ) -> Self {
        VolumeError::InvalidManifest {
            field: field.into(),
            actual: actual.to_string(),
            expected: expected.to_string(),
        }
    }

    /// True when the error came from an entry missing in the container.
    pub fn is_not_found(&self) -> bool {
        matches!(self, VolumeError::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}

pub type Result<T> = std::result::Result<T, VolumeError>;
