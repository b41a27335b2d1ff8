//! Fileset volumes: the file tree of one backup run.
//!
//! Entries are streamed into `filelist.json` as one JSON array. Each record has
//! the keys in a fixed order: `type`, `path`, then `hash`/`size`/`time` for file
//! streams, then the metadata keys, then either `blockhash`+`blocksize` or
//! `blocklists`. Control files live next to it under `extra/`.

use std::fmt;
use std::io::{Read, Write};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::SpooledTempFile;
use tracing::debug;

use crate::config::VolumeOptions;
use crate::container::{CompressionHint, VolumeContainer};
use crate::error::{Result, VolumeError};
use crate::filename::VolumeType;
use crate::json::{JsonReader, Token, TokenKind};
use crate::util;
use crate::volume::{self, WriterBase};

pub const FILELIST: &str = "filelist.json";
pub const FILESET_FILENAME: &str = "fileset";
pub const CONTROL_FILES_FOLDER: &str = "extra/";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileEntryType {
    File,
    Folder,
    Symlink,
    AlternateStream,
    Unknown,
}

impl FileEntryType {
    pub fn name(self) -> &'static str {
        match self {
            FileEntryType::File => "File",
            FileEntryType::Folder => "Folder",
            FileEntryType::Symlink => "Symlink",
            FileEntryType::AlternateStream => "AlternateStream",
            FileEntryType::Unknown => "Unknown",
        }
    }

    /// Case-insensitive; anything unrecognized is `Unknown`.
    pub fn parse(s: &str) -> Self {
        [Self::File, Self::Folder, Self::Symlink, Self::AlternateStream]
            .into_iter()
            .find(|t| t.name().eq_ignore_ascii_case(s))
            .unwrap_or(Self::Unknown)
    }

    /// File and AlternateStream records carry content.
    pub fn has_content(self) -> bool {
        matches!(self, FileEntryType::File | FileEntryType::AlternateStream)
    }
}

impl fmt::Display for FileEntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Content of a file or alternate stream.
///
/// Non-empty content needs exactly one of `blockhash` (single block) or
/// `blocklist_hashes`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentInfo {
    pub hash: String,
    pub size: u64,
    pub time: DateTime<Utc>,
    pub blockhash: Option<String>,
    /// Only stored alongside `blockhash`.
    pub blocksize: u64,
    pub blocklist_hashes: Vec<String>,
}

/// Metadata stream of any entry. Same exactly-one-of rule as [`ContentInfo`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetadataInfo {
    pub hash: String,
    pub size: u64,
    pub blockhash: Option<String>,
    pub blocklist_hashes: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileEntry {
    pub entry_type: FileEntryType,
    pub path: String,
    /// Set for File and AlternateStream.
    pub content: Option<ContentInfo>,
    pub metadata: Option<MetadataInfo>,
}

/// The `fileset` descriptor entry.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct FilesetData {
    #[serde(default = "full_backup_default")]
    pub is_full_backup: bool,
}

fn full_backup_default() -> bool {
    true
}

impl Default for FilesetData {
    fn default() -> Self {
        Self { is_full_backup: true }
    }
}

#[derive(Serialize)]
struct FileRecord<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    path: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    hash: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metahash: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metasize: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metablockhash: Option<&'a str>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    metablocklists: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    blockhash: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    blocksize: Option<u64>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    blocklists: &'a [String],
}

fn check_one_of(
    path: &str,
    stream: &'static str,
    size: u64,
    blockhash: Option<&str>,
    blocklists: &[String],
) -> Result<()> {
    match (blockhash.is_some(), blocklists.is_empty()) {
        (true, false) => Err(VolumeError::ConflictingContent { path: path.to_string(), stream }),
        (false, true) if size > 0 => {
            Err(VolumeError::MissingContent { path: path.to_string(), stream, size })
        }
        _ => Ok(()),
    }
}

pub struct FilesetVolumeWriter<C: VolumeContainer> {
    base: WriterBase<C>,
    spool: SpooledTempFile,
    entries: u64,
    fileset: FilesetData,
    /// `]` has been written to the spool.
    array_closed: bool,
    /// `filelist.json` is in the container.
    list_stored: bool,
}

impl<C: VolumeContainer> FilesetVolumeWriter<C> {
    /// Create a fileset volume named after the current time.
    pub fn create(container: C, options: VolumeOptions) -> Result<Self> {
        Self::create_at(container, options, util::now())
    }

    /// Create a fileset volume named after `timestamp`.
    pub fn create_at(
        container: C,
        options: VolumeOptions,
        timestamp: DateTime<Utc>,
    ) -> Result<Self> {
        let base = WriterBase::create(container, options, VolumeType::Files, Some(timestamp))?;
        let mut spool = volume::new_spool();
        spool.write_all(b"[")?;
        Ok(Self {
            base,
            spool,
            entries: 0,
            fileset: FilesetData::default(),
            array_closed: false,
            list_stored: false,
        })
    }

    pub fn filename(&self) -> &str {
        self.base.filename()
    }

    /// Entries added so far. Informational only.
    pub fn entries(&self) -> u64 {
        self.entries
    }

    fn append(&mut self, record: &FileRecord<'_>) -> Result<()> {
        if self.array_closed {
            return Err(VolumeError::WriterClosed);
        }
        if self.entries > 0 {
            self.spool.write_all(b",")?;
        }
        serde_json::to_writer(&mut self.spool, record).map_err(std::io::Error::from)?;
        self.entries += 1;
        Ok(())
    }

    fn add_stream(
        &mut self,
        kind: FileEntryType,
        path: &str,
        content: Option<&ContentInfo>,
        metadata: Option<&MetadataInfo>,
    ) -> Result<()> {
        self.base.ensure_open()?;
        if let Some(c) = content {
            check_one_of(path, "content", c.size, c.blockhash.as_deref(), &c.blocklist_hashes)?;
        }
        if let Some(m) = metadata {
            check_one_of(path, "metadata", m.size, m.blockhash.as_deref(), &m.blocklist_hashes)?;
        }
        let record = FileRecord {
            kind: kind.name(),
            path,
            hash: content.map(|c| c.hash.as_str()),
            size: content.map(|c| c.size),
            time: content.map(|c| util::serialize_datetime(&c.time)),
            metahash: metadata.map(|m| m.hash.as_str()),
            metasize: metadata.map(|m| m.size),
            metablockhash: metadata.and_then(|m| m.blockhash.as_deref()),
            metablocklists: metadata.map(|m| m.blocklist_hashes.as_slice()).unwrap_or_default(),
            blockhash: content.and_then(|c| c.blockhash.as_deref()),
            blocksize: content.and_then(|c| c.blockhash.as_ref().map(|_| c.blocksize)),
            blocklists: content.map(|c| c.blocklist_hashes.as_slice()).unwrap_or_default(),
        };
        self.append(&record)
    }

    pub fn add_file(
        &mut self,
        path: &str,
        content: &ContentInfo,
        metadata: Option<&MetadataInfo>,
    ) -> Result<()> {
        self.add_stream(FileEntryType::File, path, Some(content), metadata)
    }

    pub fn add_alternate_stream(
        &mut self,
        path: &str,
        content: &ContentInfo,
        metadata: Option<&MetadataInfo>,
    ) -> Result<()> {
        self.add_stream(FileEntryType::AlternateStream, path, Some(content), metadata)
    }

    pub fn add_directory(&mut self, path: &str, metadata: Option<&MetadataInfo>) -> Result<()> {
        self.add_stream(FileEntryType::Folder, path, None, metadata)
    }

    pub fn add_symlink(&mut self, path: &str, metadata: Option<&MetadataInfo>) -> Result<()> {
        self.add_stream(FileEntryType::Symlink, path, None, metadata)
    }

    /// Store an opaque blob under `extra/<name>`.
    pub fn add_control_file(
        &mut self,
        name: &str,
        hint: CompressionHint,
        data: &mut dyn Read,
    ) -> Result<u64> {
        self.base.ensure_open()?;
        let entry = format!("{CONTROL_FILES_FOLDER}{name}");
        let mut w = self.base.container.create_file(&entry, hint, util::now())?;
        let n = std::io::copy(data, &mut w)?;
        w.flush()?;
        Ok(n)
    }

    /// Record whether this run was a full backup. Defaults to `true`.
    pub fn set_full_backup(&mut self, full: bool) -> Result<()> {
        self.base.ensure_open()?;
        self.fileset.is_full_backup = full;
        Ok(())
    }

    /// Close the array, store `filelist.json` and the descriptor, and finish the container.
    pub fn close(&mut self) -> Result<()> {
        if self.base.is_closed() {
            return Ok(());
        }
        if !self.list_stored {
            if !self.array_closed {
                self.spool.write_all(b"]")?;
                self.array_closed = true;
            }
            self.base.commit_spool(FILELIST, &mut self.spool, CompressionHint::Compressible)?;
            self.list_stored = true;
        }
        let descriptor = serde_json::to_vec(&self.fileset).map_err(std::io::Error::from)?;
        let mut w = self.base.container.create_file(
            FILESET_FILENAME,
            CompressionHint::Compressible,
            util::now(),
        )?;
        w.write_all(&descriptor)?;
        w.flush()?;
        drop(w);
        debug!(volume = %self.base.filename(), entries = self.entries, "closing fileset volume");
        self.base.finish()
    }

    pub fn into_container(mut self) -> Result<C> {
        self.close()?;
        Ok(self.base.container)
    }
}

pub struct FilesetVolumeReader<C: VolumeContainer> {
    container: C,
    fileset: FilesetData,
}

impl<C: VolumeContainer> FilesetVolumeReader<C> {
    pub fn open(container: C, options: &VolumeOptions) -> Result<Self> {
        let fileset = Self::fileset_data(&container)?;
        volume::check_manifest(&container, options)?;
        Ok(Self { container, fileset })
    }

    /// Read the `fileset` descriptor without opening the volume. Absent means a full backup.
    pub fn fileset_data(container: &C) -> Result<FilesetData> {
        match volume::read_optional(container, FILESET_FILENAME)? {
            Some(data) => serde_json::from_slice(&data).map_err(|e| {
                VolumeError::InvalidFilesetData {
                    expected: "fileset descriptor".to_string(),
                    actual: e.to_string(),
                    context: FILESET_FILENAME.to_string(),
                }
            }),
            None => Ok(FilesetData::default()),
        }
    }

    pub fn is_full_backup(&self) -> bool {
        self.fileset.is_full_backup
    }

    /// Stream the entries of `filelist.json` in the order they were added.
    ///
    /// Each call starts over from the beginning of the entry.
    pub fn files(&self) -> Result<FileEntries<'_>> {
        let mut reader = JsonReader::new(self.container.open_read(FILELIST)?, FILELIST);
        reader.expect(TokenKind::StartArray)?;
        Ok(FileEntries { reader, done: false })
    }

    /// Control files as `(name, stream)`, names without the `extra/` prefix.
    pub fn control_files(&self) -> Result<ControlFiles<'_, C>> {
        Ok(ControlFiles {
            container: &self.container,
            names: self.container.list_files(Some(CONTROL_FILES_FOLDER))?.into_iter(),
        })
    }

    pub fn container(&self) -> &C {
        &self.container
    }
}

pub struct FileEntries<'a> {
    reader: JsonReader<Box<dyn Read + 'a>>,
    done: bool,
}

impl FileEntries<'_> {
    fn next_entry(&mut self) -> Result<Option<FileEntry>> {
        loop {
            match self.reader.read()? {
                Some(Token::EndArray) => return Ok(None),
                Some(Token::StartObject) => {
                    if let Some(entry) = decode_entry(&mut self.reader)? {
                        return Ok(Some(entry));
                    }
                }
                other => {
                    return Err(self.reader.unexpected(TokenKind::StartObject, other.as_ref()));
                }
            }
        }
    }
}

impl Iterator for FileEntries<'_> {
    type Item = Result<FileEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let next = self.next_entry().transpose();
        if !matches!(next, Some(Ok(_))) {
            self.done = true;
        }
        next
    }
}

fn next_token<R: Read>(r: &mut JsonReader<R>, path: &str) -> Result<Token> {
    r.read()?.ok_or_else(|| r.unexpected(format!("more of entry {path}"), None))
}

fn u64_property<R: Read>(r: &mut JsonReader<R>, name: &str) -> Result<u64> {
    let v = r.read_i64_property(name)?;
    u64::try_from(v)
        .map_err(|_| r.unexpected(format!("non-negative {name}"), Some(&Token::Integer(v))))
}

fn string_value<R: Read>(r: &mut JsonReader<R>) -> Result<String> {
    match r.expect(TokenKind::String)? {
        Token::String(s) => Ok(s),
        _ => unreachable!("expect() checked the kind"),
    }
}

fn string_array<R: Read>(r: &mut JsonReader<R>) -> Result<Vec<String>> {
    r.expect(TokenKind::StartArray)?;
    let mut out = Vec::new();
    loop {
        match r.read()? {
            Some(Token::String(s)) => out.push(s),
            Some(Token::EndArray) => return Ok(out),
            other => return Err(r.unexpected("String or EndArray", other.as_ref())),
        }
    }
}

fn is_property(t: &Token, name: &str) -> bool {
    matches!(t, Token::PropertyName(p) if p == name)
}

/// Decode one record after its `StartObject`. Unknown record types are skipped
/// whole and give `None`.
fn decode_entry<R: Read>(r: &mut JsonReader<R>) -> Result<Option<FileEntry>> {
    let type_name = r.read_string_property("type")?;
    let entry_type = FileEntryType::parse(&type_name);
    if entry_type == FileEntryType::Unknown {
        debug!(type_name = %type_name, "skipping fileset entry of unknown type");
        r.skip_object()?;
        return Ok(None);
    }

    let path = r.read_string_property("path")?;
    let mut content = None;
    if entry_type.has_content() {
        let hash = r.read_string_property("hash")?;
        let size = u64_property(r, "size")?;
        let time_str = r.read_string_property("time")?;
        let time = util::deserialize_datetime(&time_str).ok_or_else(|| {
            r.unexpected("compact UTC timestamp", Some(&Token::String(time_str.clone())))
        })?;
        content = Some(ContentInfo {
            hash,
            size,
            time,
            blockhash: None,
            blocksize: 0,
            blocklist_hashes: Vec::new(),
        });
    }

    let mut token = next_token(r, &path)?;
    let mut metadata = None;
    if is_property(&token, "metahash") {
        let hash = string_value(r)?;
        let size = u64_property(r, "metasize")?;
        let mut meta = MetadataInfo { hash, size, blockhash: None, blocklist_hashes: Vec::new() };
        token = next_token(r, &path)?;
        if is_property(&token, "metablocklists") {
            meta.blocklist_hashes = string_array(r)?;
            token = next_token(r, &path)?;
        } else if is_property(&token, "metablockhash") {
            meta.blockhash = Some(string_value(r)?);
            token = next_token(r, &path)?;
        }
        metadata = Some(meta);
    }

    match (&mut content, &token) {
        (Some(c), t) if is_property(t, "blocklists") => {
            c.blocklist_hashes = string_array(r)?;
            r.skip_object()?;
        }
        (Some(c), t) if is_property(t, "blockhash") => {
            c.blockhash = Some(string_value(r)?);
            c.blocksize = u64_property(r, "blocksize")?;
            r.skip_object()?;
        }
        (_, Token::EndObject) => {}
        (_, t) => return Err(r.unexpected(TokenKind::EndObject, Some(t))),
    }

    Ok(Some(FileEntry { entry_type, path, content, metadata }))
}

pub struct ControlFiles<'a, C: VolumeContainer> {
    container: &'a C,
    names: std::vec::IntoIter<String>,
}

impl<'a, C: VolumeContainer> Iterator for ControlFiles<'a, C> {
    type Item = Result<(String, Box<dyn Read + 'a>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let name = self.names.next()?;
        let short = name.strip_prefix(CONTROL_FILES_FOLDER).unwrap_or(&name).to_string();
        Some(self.container.open_read(&name).map(|s| (short, s)).map_err(VolumeError::from))
    }
}
