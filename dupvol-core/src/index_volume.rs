//! Index volumes: a sidecar for each block volume.
//!
//! For every indexed block volume the entry `vol/<filename>` holds
//!
//! ```text
//! {"blocks":[{"hash":..,"size":..},..],"volumehash":..,"volumesize":..}
//! ```
//!
//! and blocklists are copied verbatim to `list/<urlsafe-hash>`.

use std::io::{Read, Write};

use tempfile::SpooledTempFile;
use tracing::{debug, error};

use crate::blocklist::{self, BlocklistHashes};
use crate::config::VolumeOptions;
use crate::container::{CompressionHint, VolumeContainer};
use crate::error::{Result, VolumeError};
use crate::filename::{self, VolumeType};
use crate::hash::{self, HashAlgorithm};
use crate::json::{JsonReader, Token, TokenKind};
use crate::volume::{self, WriterBase};

pub const INDEX_VOLUME_FOLDER: &str = "vol/";
pub const INDEX_BLOCKLIST_FOLDER: &str = "list/";

fn json_str(s: &str) -> String {
    // Serializing a str cannot fail.
    serde_json::to_string(s).unwrap_or_default()
}

/// A `vol/` entry between `start_volume` and `finish_volume`.
struct OpenVolume {
    filename: String,
    spool: SpooledTempFile,
    blocks: u64,
    finished: bool,
}

impl Drop for OpenVolume {
    fn drop(&mut self) {
        if !self.finished {
            error!(
                volume = %self.filename,
                blocks = self.blocks,
                "index entry dropped without finish_volume; the index volume is incomplete"
            );
        }
    }
}

pub struct IndexVolumeWriter<C: VolumeContainer> {
    base: WriterBase<C>,
    current: Option<OpenVolume>,
    volumes: u64,
    blocks: u64,
    blocklists: u64,
}

impl<C: VolumeContainer> IndexVolumeWriter<C> {
    pub fn create(container: C, options: VolumeOptions) -> Result<Self> {
        let base = WriterBase::create(container, options, VolumeType::Index, None)?;
        Ok(Self { base, current: None, volumes: 0, blocks: 0, blocklists: 0 })
    }

    pub fn filename(&self) -> &str {
        self.base.filename()
    }

    /// Begin the entry for the block volume named `filename`.
    pub fn start_volume(&mut self, filename: &str) -> Result<()> {
        self.base.ensure_open()?;
        if self.current.is_some() {
            return Err(VolumeError::Sequence("start_volume called before finish_volume"));
        }
        let mut spool = volume::new_spool();
        spool.write_all(br#"{"blocks":["#)?;
        self.current =
            Some(OpenVolume { filename: filename.to_string(), spool, blocks: 0, finished: false });
        Ok(())
    }

    pub fn add_block(&mut self, hash: &str, size: u64) -> Result<()> {
        self.base.ensure_open()?;
        let vol = self
            .current
            .as_mut()
            .ok_or(VolumeError::Sequence("add_block called outside start_volume/finish_volume"))?;
        if vol.blocks > 0 {
            vol.spool.write_all(b",")?;
        }
        write!(vol.spool, r#"{{"hash":{},"size":{size}}}"#, json_str(hash))?;
        vol.blocks += 1;
        self.blocks += 1;
        Ok(())
    }

    /// Close the entry with the block volume's own hash and size and store it.
    pub fn finish_volume(&mut self, volume_hash: &str, volume_size: u64) -> Result<()> {
        self.base.ensure_open()?;
        let mut vol = self
            .current
            .take()
            .ok_or(VolumeError::Sequence("finish_volume called without start_volume"))?;
        write!(
            vol.spool,
            r#"],"volumehash":{},"volumesize":{volume_size}}}"#,
            json_str(volume_hash)
        )?;
        let entry = format!("{INDEX_VOLUME_FOLDER}{}", vol.filename);
        // Marked before committing: a failed commit is reported through the error instead.
        vol.finished = true;
        self.base.commit_spool(&entry, &mut vol.spool, CompressionHint::Compressible)?;
        debug!(volume = %vol.filename, blocks = vol.blocks, "indexed block volume");
        self.volumes += 1;
        Ok(())
    }

    /// Store a blocklist under `list/`. Nothing is written unless it is hash aligned.
    pub fn write_blocklist(&mut self, hash: &str, data: &[u8]) -> Result<()> {
        self.base.ensure_open()?;
        let entry = blocklist::entry_name(INDEX_BLOCKLIST_FOLDER, hash);
        let hash_size = self.base.options.block_hash_size();
        blocklist::write_at(&mut self.base.container, &entry, hash, data, hash_size)?;
        self.blocklists += 1;
        Ok(())
    }

    /// Like [`write_blocklist`](Self::write_blocklist) but copying from a stream;
    /// alignment is checked as the stream is read.
    pub fn write_blocklist_stream(&mut self, hash: &str, data: &mut dyn Read) -> Result<u64> {
        self.base.ensure_open()?;
        let entry = blocklist::entry_name(INDEX_BLOCKLIST_FOLDER, hash);
        let hash_size = self.base.options.block_hash_size();
        let n =
            blocklist::write_stream_at(&mut self.base.container, &entry, hash, data, hash_size)?;
        self.blocklists += 1;
        Ok(n)
    }

    /// Copy every entry of another index volume, renaming the block volumes with `mapper`.
    ///
    /// Block order, volume hashes and sizes are kept; blocklists are copied byte for byte.
    pub fn copy_from<D: VolumeContainer>(
        &mut self,
        source: &IndexVolumeReader<D>,
        mut mapper: impl FnMut(&str) -> String,
    ) -> Result<()> {
        for mut vol in source.volumes()? {
            let renamed = mapper(vol.filename());
            debug!(from = %vol.filename(), to = %renamed, "copying index entry");
            self.start_volume(&renamed)?;
            for block in vol.blocks()? {
                let (hash, size) = block?;
                self.add_block(&hash, size)?;
            }
            let volume_hash = vol.volume_hash()?.to_string();
            let volume_size = vol.volume_size()?;
            self.finish_volume(&volume_hash, volume_size)?;
        }
        for list in source.block_lists()? {
            let mut data = list.data()?;
            self.write_blocklist_stream(list.hash(), &mut data)?;
        }
        Ok(())
    }

    /// Indexed block volumes so far.
    pub fn volumes(&self) -> u64 {
        self.volumes
    }

    /// Block records over all indexed volumes.
    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    pub fn blocklists(&self) -> u64 {
        self.blocklists
    }

    /// Finish the container. Fails if a block volume entry is still open.
    pub fn close(&mut self) -> Result<()> {
        if self.current.is_some() {
            return Err(VolumeError::Sequence("close called with an unfinished volume"));
        }
        self.base.finish()
    }

    pub fn into_container(mut self) -> Result<C> {
        self.close()?;
        Ok(self.base.container)
    }
}

pub struct IndexVolumeReader<C: VolumeContainer> {
    container: C,
    options: VolumeOptions,
}

impl<C: VolumeContainer> IndexVolumeReader<C> {
    pub fn open(container: C, options: &VolumeOptions) -> Result<Self> {
        volume::check_manifest(&container, options)?;
        Ok(Self { container, options: options.clone() })
    }

    /// Indexed block volumes, in container order. Entries under `vol/` whose name is
    /// not a volume filename are skipped.
    pub fn volumes(&self) -> Result<BlockVolumes<'_, C>> {
        Ok(BlockVolumes {
            container: &self.container,
            names: self.container.list_files(Some(INDEX_VOLUME_FOLDER))?.into_iter(),
        })
    }

    /// Stored blocklists. Entries not named by a hash of the configured size are skipped.
    pub fn block_lists(&self) -> Result<IndexBlocklists<'_, C>> {
        Ok(IndexBlocklists {
            container: &self.container,
            entries: self.container.list_files_with_size(Some(INDEX_BLOCKLIST_FOLDER))?.into_iter(),
            algorithm: self.options.block_hash,
        })
    }

    pub fn container(&self) -> &C {
        &self.container
    }
}

pub struct BlockVolumes<'a, C: VolumeContainer> {
    container: &'a C,
    names: std::vec::IntoIter<String>,
}

impl<'a, C: VolumeContainer> Iterator for BlockVolumes<'a, C> {
    type Item = BlockVolumeEntry<'a, C>;

    fn next(&mut self) -> Option<Self::Item> {
        for entry in self.names.by_ref() {
            let name = entry.strip_prefix(INDEX_VOLUME_FOLDER).unwrap_or(&entry);
            if filename::parse(name).is_none() {
                debug!(entry = %entry, "skipping index entry that does not name a volume");
                continue;
            }
            return Some(BlockVolumeEntry {
                container: self.container,
                filename: name.to_string(),
                entry,
                cursor: None,
                started: false,
                props: None,
            });
        }
        None
    }
}

/// Forward-only position inside one `vol/` entry.
struct BlockCursor<'a> {
    reader: JsonReader<Box<dyn Read + 'a>>,
    done: bool,
}

impl<'a> BlockCursor<'a> {
    fn open<C: VolumeContainer>(container: &'a C, entry: &str) -> Result<Self> {
        let mut reader = JsonReader::new(container.open_read(entry)?, entry);
        reader.expect(TokenKind::StartObject)?;
        match reader.read()? {
            Some(Token::PropertyName(p)) if p == "blocks" => {}
            other => return Err(reader.unexpected("property \"blocks\"", other.as_ref())),
        }
        reader.expect(TokenKind::StartArray)?;
        Ok(Self { reader, done: false })
    }

    fn next_block(&mut self) -> Result<Option<(String, u64)>> {
        if self.done {
            return Ok(None);
        }
        match self.reader.read()? {
            Some(Token::EndArray) => {
                self.done = true;
                Ok(None)
            }
            Some(Token::StartObject) => {
                let hash = self.reader.read_string_property("hash")?;
                let size = self.reader.read_i64_property("size")?;
                let size = u64::try_from(size).map_err(|_| {
                    self.reader.unexpected("non-negative size", Some(&Token::Integer(size)))
                })?;
                self.reader.skip_object()?;
                Ok(Some((hash, size)))
            }
            other => Err(self.reader.unexpected(TokenKind::StartObject, other.as_ref())),
        }
    }

    /// Skip the remaining blocks and read the trailing volume hash and size.
    fn read_volume_props(&mut self) -> Result<(String, u64)> {
        while self.next_block()?.is_some() {}
        let hash = self.reader.read_string_property("volumehash")?;
        let size = self.reader.read_i64_property("volumesize")?;
        let size = u64::try_from(size).map_err(|_| {
            self.reader.unexpected("non-negative volumesize", Some(&Token::Integer(size)))
        })?;
        Ok((hash, size))
    }
}

/// One indexed block volume.
///
/// The blocks can be read once. The volume hash and size come after the blocks in
/// the stream, so asking for either reads past whatever blocks are left; the result
/// is cached. After that the blocks can no longer be iterated.
pub struct BlockVolumeEntry<'a, C: VolumeContainer> {
    container: &'a C,
    entry: String,
    filename: String,
    cursor: Option<BlockCursor<'a>>,
    started: bool,
    props: Option<(String, u64)>,
}

impl<'a, C: VolumeContainer> BlockVolumeEntry<'a, C> {
    /// Filename of the indexed block volume.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    fn cursor(&mut self) -> Result<&mut BlockCursor<'a>> {
        if self.cursor.is_none() {
            self.cursor = Some(BlockCursor::open(self.container, &self.entry)?);
        }
        // Set just above.
        self.cursor.as_mut().ok_or(VolumeError::Sequence("block cursor missing"))
    }

    /// The `(hash, size)` records in write order. Only one call is allowed.
    pub fn blocks(&mut self) -> Result<Blocks<'_, 'a>> {
        if self.started {
            return Err(VolumeError::Sequence("the blocks of an index entry can only be read once"));
        }
        self.started = true;
        let cursor = self.cursor()?;
        Ok(Blocks { cursor, failed: false })
    }

    fn volume_props(&mut self) -> Result<&(String, u64)> {
        if self.props.is_none() {
            self.started = true;
            let props = self.cursor()?.read_volume_props()?;
            self.cursor = None;
            self.props = Some(props);
        }
        self.props.as_ref().ok_or(VolumeError::Sequence("volume properties missing"))
    }

    /// Hash of the block volume itself.
    pub fn volume_hash(&mut self) -> Result<&str> {
        Ok(self.volume_props()?.0.as_str())
    }

    /// Size of the block volume itself.
    pub fn volume_size(&mut self) -> Result<u64> {
        Ok(self.volume_props()?.1)
    }
}

pub struct Blocks<'e, 'a> {
    cursor: &'e mut BlockCursor<'a>,
    failed: bool,
}

impl Iterator for Blocks<'_, '_> {
    type Item = Result<(String, u64)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let next = self.cursor.next_block().transpose();
        if matches!(next, Some(Err(_))) {
            self.failed = true;
        }
        next
    }
}

pub struct IndexBlocklists<'a, C: VolumeContainer> {
    container: &'a C,
    entries: std::vec::IntoIter<(String, u64)>,
    algorithm: HashAlgorithm,
}

impl<'a, C: VolumeContainer> Iterator for IndexBlocklists<'a, C> {
    type Item = IndexBlocklist<'a, C>;

    fn next(&mut self) -> Option<Self::Item> {
        let hash_size = self.algorithm.size();
        for (entry, length) in self.entries.by_ref() {
            let name = entry.strip_prefix(INDEX_BLOCKLIST_FOLDER).unwrap_or(&entry);
            if !hash::is_valid_urlsafe_hash(name, hash_size) {
                debug!(entry = %entry, "skipping list entry that is not a hash");
                continue;
            }
            return Some(IndexBlocklist {
                container: self.container,
                hash: hash::base64_url_to_plain(name),
                entry,
                length,
                algorithm: self.algorithm,
            });
        }
        None
    }
}

/// A stored blocklist.
pub struct IndexBlocklist<'a, C: VolumeContainer> {
    container: &'a C,
    entry: String,
    hash: String,
    length: u64,
    algorithm: HashAlgorithm,
}

impl<'a, C: VolumeContainer> IndexBlocklist<'a, C> {
    /// Base64 hash of the blocklist bytes.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Byte length as reported by the container listing.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Raw bytes.
    pub fn data(&self) -> Result<Box<dyn Read + 'a>> {
        Ok(self.container.open_read(&self.entry)?)
    }

    /// The block hashes in the list, checked against [`hash`](Self::hash) at the end.
    pub fn hashes(&self) -> Result<BlocklistHashes<'a>> {
        blocklist::read_verified(
            self.container,
            &self.entry,
            self.algorithm.size(),
            &self.hash,
            self.algorithm,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::MemoryContainer;

    fn options() -> VolumeOptions {
        VolumeOptions::default()
    }

    #[test]
    fn misordered_calls_are_rejected() {
        let mut w = IndexVolumeWriter::create(MemoryContainer::new(), options()).unwrap();
        assert!(matches!(w.add_block("h", 1), Err(VolumeError::Sequence(_))));
        assert!(matches!(w.finish_volume("h", 1), Err(VolumeError::Sequence(_))));
        w.start_volume("duplicati-b00.dblock.zst").unwrap();
        assert!(matches!(w.start_volume("x"), Err(VolumeError::Sequence(_))));
        assert!(matches!(w.close(), Err(VolumeError::Sequence(_))));
        w.finish_volume("vh", 10).unwrap();
        w.close().unwrap();
        assert!(matches!(w.start_volume("y"), Err(VolumeError::WriterClosed)));
    }

    #[test]
    fn entry_json_shape() {
        let mut w = IndexVolumeWriter::create(MemoryContainer::new(), options()).unwrap();
        w.start_volume("p-b01.dblock.zst").unwrap();
        w.add_block("a/b+", 4).unwrap();
        w.add_block("cc==", 5).unwrap();
        w.finish_volume("vh", 9).unwrap();
        let c = w.into_container().unwrap();
        assert_eq!(
            c.get("vol/p-b01.dblock.zst").unwrap(),
            br#"{"blocks":[{"hash":"a/b+","size":4},{"hash":"cc==","size":5}],"volumehash":"vh","volumesize":9}"#
        );
    }

    #[test]
    fn blocks_cannot_be_read_twice() {
        let mut w = IndexVolumeWriter::create(MemoryContainer::new(), options()).unwrap();
        w.start_volume("p-b01.dblock.zst").unwrap();
        w.add_block("AAAA", 4).unwrap();
        w.finish_volume("vh", 4).unwrap();
        let r = IndexVolumeReader::open(w.into_container().unwrap(), &options()).unwrap();
        let mut vol = r.volumes().unwrap().next().unwrap();
        assert_eq!(vol.blocks().unwrap().count(), 1);
        assert!(matches!(vol.blocks(), Err(VolumeError::Sequence(_))));
        assert_eq!(vol.volume_size().unwrap(), 4);
    }

    #[test]
    fn foreign_entries_are_skipped() {
        let mut w = IndexVolumeWriter::create(MemoryContainer::new(), options()).unwrap();
        let bl = vec![1u8; 32];
        let bl_hash = HashAlgorithm::Sha256.hash_base64(&bl);
        w.write_blocklist(&bl_hash, &bl).unwrap();
        let mut c = w.into_container().unwrap();
        c.insert("vol/readme.txt", b"{}".to_vec());
        c.insert("list/not-a-hash", vec![0; 32]);

        let r = IndexVolumeReader::open(c, &options()).unwrap();
        assert_eq!(r.volumes().unwrap().count(), 0);
        let lists: Vec<_> = r.block_lists().unwrap().collect();
        assert_eq!(lists.len(), 1);
        assert_eq!(lists[0].hash(), bl_hash);
        assert_eq!(lists[0].length(), 32);
        assert_eq!(lists[0].hashes().unwrap().collect::<Result<Vec<_>>>().unwrap().len(), 1);
    }
}
