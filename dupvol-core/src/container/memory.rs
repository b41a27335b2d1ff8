use std::collections::HashMap;
use std::io::{self, Read, Write};

use chrono::{DateTime, Utc};

use super::{matches_prefix, CompressionHint, VolumeContainer};

#[derive(Clone, Debug)]
struct MemoryEntry {
    name: String,
    data: Vec<u8>,
    modified: DateTime<Utc>,
    hint: CompressionHint,
}

/// Container that keeps every entry in memory.
///
/// Cloning gives an independent snapshot, which is how tests reopen a freshly
/// written volume for reading.
#[derive(Clone, Debug, Default)]
pub struct MemoryContainer {
    entries: Vec<MemoryEntry>,
    by_name: HashMap<String, usize>,
}

impl MemoryContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw content of an entry.
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.by_name.get(name).map(|&i| self.entries[i].data.as_slice())
    }

    pub fn modified(&self, name: &str) -> Option<DateTime<Utc>> {
        self.by_name.get(name).map(|&i| self.entries[i].modified)
    }

    pub fn hint(&self, name: &str) -> Option<CompressionHint> {
        self.by_name.get(name).map(|&i| self.entries[i].hint)
    }

    /// Store an entry directly, bypassing any volume writer.
    pub fn insert(&mut self, name: &str, data: Vec<u8>) {
        let entry = MemoryEntry {
            name: name.to_string(),
            data,
            modified: crate::util::now(),
            hint: CompressionHint::Default,
        };
        match self.by_name.get(name) {
            Some(&i) => self.entries[i] = entry,
            None => {
                self.by_name.insert(name.to_string(), self.entries.len());
                self.entries.push(entry);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl VolumeContainer for MemoryContainer {
    fn open_read(&self, name: &str) -> io::Result<Box<dyn Read + '_>> {
        match self.by_name.get(name) {
            Some(&i) => Ok(Box::new(self.entries[i].data.as_slice())),
            None => {
                Err(io::Error::new(io::ErrorKind::NotFound, format!("no entry named {name:?}")))
            }
        }
    }

    fn create_file(
        &mut self,
        name: &str,
        hint: CompressionHint,
        modified: DateTime<Utc>,
    ) -> io::Result<Box<dyn Write + '_>> {
        self.insert(name, Vec::new());
        let i = self.by_name[name];
        let entry = &mut self.entries[i];
        entry.modified = modified;
        entry.hint = hint;
        Ok(Box::new(&mut entry.data))
    }

    fn list_files_with_size(&self, prefix: Option<&str>) -> io::Result<Vec<(String, u64)>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| matches_prefix(&e.name, prefix))
            .map(|e| (e.name.clone(), e.data.len() as u64))
            .collect())
    }

    fn size(&self) -> u64 {
        self.entries.iter().map(|e| e.data.len() as u64).sum()
    }

    fn file_exists(&self, name: &str) -> io::Result<bool> {
        Ok(self.by_name.contains_key(name))
    }
}
