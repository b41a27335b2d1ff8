pub mod block_volume;
pub mod blocklist;
pub mod config;
pub mod container;
pub mod error;
pub mod filename;
pub mod fileset_volume;
pub mod hash;
pub mod index_volume;
pub mod json;
pub mod manifest;
pub mod placement;
pub mod util;
mod volume;

pub use block_volume::{BlockVolumeReader, BlockVolumeWriter};
pub use config::{RawOptions, VolumeOptions};
pub use container::{CompressionHint, MemoryContainer, VolumeContainer};
pub use error::{Result, VolumeError};
pub use filename::{VolumeIdentity, VolumeType};
pub use fileset_volume::{FilesetVolumeReader, FilesetVolumeWriter};
pub use hash::HashAlgorithm;
pub use index_volume::{IndexVolumeReader, IndexVolumeWriter};
