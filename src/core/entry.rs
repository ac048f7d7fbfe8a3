//! Entry directory model
//!
//! Every entry of the container lives in a flat arena owned by
//! [`EntryDirectory`] and is addressed by [`EntryId`]. A name index maps each
//! live name to its slot. Removed and replaced entries stay in the arena as
//! tombstones until the next successful flush purges them.

use crate::allocator::Extent;
use crate::compression::CompressionMethod;
use crate::error::{Result, ZFileError};
use crate::zip::{
    CentralDirectoryHeader, DosDateTime, LocalFileHeader, DOS_DIRECTORY_ATTRIBUTE,
    FLAG_DATA_DESCRIPTOR, FLAG_UTF8, VERSION_DEFLATE, VERSION_STORED,
};
use std::collections::HashMap;

/// Index of an entry inside the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(usize);

impl EntryId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Entry variant; directories are zero-length entries whose name ends in `/`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    Directory,
}

impl EntryKind {
    pub fn for_name(name: &str) -> Self {
        if name.ends_with('/') {
            EntryKind::Directory
        } else {
            EntryKind::Regular
        }
    }
}

/// Where the entry's compressed payload currently lives
#[derive(Debug, Clone)]
pub(crate) enum EntrySource {
    /// Written in the container at `data_offset`
    Disk,
    /// Compressed in memory, waiting for the next flush
    Pending(Vec<u8>),
}

/// One archive entry
#[derive(Debug, Clone)]
pub struct StoredEntry {
    name: String,
    kind: EntryKind,
    method: CompressionMethod,
    crc32: u32,
    compressed_size: u64,
    uncompressed_size: u64,
    timestamp: DosDateTime,
    flags: u16,
    version_made_by: u16,
    external_attributes: u32,
    central_extra: Vec<u8>,
    comment: Vec<u8>,
    /// Local header + payload (+ data descriptor); `None` until written
    extent: Option<Extent>,
    data_offset: u64,
    pub(crate) source: EntrySource,
    generation: u64,
    dirty: bool,
    deleted: bool,
}

impl StoredEntry {
    /// A new entry whose payload is already compressed
    pub(crate) fn pending(
        name: &str,
        method: CompressionMethod,
        compressed: Vec<u8>,
        uncompressed_size: u64,
        crc32: u32,
        timestamp: DosDateTime,
    ) -> Result<Self> {
        validate_name(name)?;

        let kind = EntryKind::for_name(name);
        if kind == EntryKind::Directory && uncompressed_size > 0 {
            return Err(ZFileError::InvalidEntry {
                name: name.to_string(),
                reason: "directory entries cannot carry data".to_string(),
            });
        }

        let external_attributes = match kind {
            EntryKind::Directory => DOS_DIRECTORY_ATTRIBUTE,
            EntryKind::Regular => 0,
        };

        Ok(StoredEntry {
            name: name.to_string(),
            kind,
            method,
            crc32,
            compressed_size: compressed.len() as u64,
            uncompressed_size,
            timestamp,
            flags: if name.is_ascii() { 0 } else { FLAG_UTF8 },
            version_made_by: VERSION_DEFLATE,
            external_attributes,
            central_extra: Vec::new(),
            comment: Vec::new(),
            extent: None,
            data_offset: 0,
            source: EntrySource::Pending(compressed),
            generation: 0,
            dirty: true,
            deleted: false,
        })
    }

    /// An entry described by the central directory of an existing archive
    pub(crate) fn from_central(
        name: String,
        header: &CentralDirectoryHeader,
        method: CompressionMethod,
        extent: Extent,
        data_offset: u64,
    ) -> Self {
        StoredEntry {
            kind: EntryKind::for_name(&name),
            name,
            method,
            crc32: header.crc32,
            compressed_size: header.compressed_size as u64,
            uncompressed_size: header.uncompressed_size as u64,
            timestamp: DosDateTime {
                time: header.mod_time,
                date: header.mod_date,
            },
            flags: header.flags,
            version_made_by: header.version_made_by,
            external_attributes: header.external_attributes,
            central_extra: header.extra.clone(),
            comment: header.comment.clone(),
            extent: Some(extent),
            data_offset,
            source: EntrySource::Disk,
            generation: 0,
            dirty: false,
            deleted: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn method(&self) -> CompressionMethod {
        self.method
    }

    pub fn crc32(&self) -> u32 {
        self.crc32
    }

    pub fn compressed_size(&self) -> u64 {
        self.compressed_size
    }

    pub fn uncompressed_size(&self) -> u64 {
        self.uncompressed_size
    }

    pub fn timestamp(&self) -> DosDateTime {
        self.timestamp
    }

    /// Extent of local header and payload, `None` while pending
    pub fn extent(&self) -> Option<Extent> {
        self.extent
    }

    /// File offset of the local header
    pub fn header_offset(&self) -> Option<u64> {
        self.extent.map(|extent| extent.start)
    }

    /// File offset of the first payload byte
    pub fn data_offset(&self) -> Option<u64> {
        self.extent.map(|_| self.data_offset)
    }

    /// Bumped every time the name is given new content
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Local header for a pending entry about to be written
    pub(crate) fn local_header(&self) -> LocalFileHeader {
        LocalFileHeader {
            version_needed: self.version_needed(),
            flags: self.flags & !FLAG_DATA_DESCRIPTOR,
            method: self.method.as_u16(),
            mod_time: self.timestamp.time,
            mod_date: self.timestamp.date,
            crc32: self.crc32,
            compressed_size: self.compressed_size as u32,
            uncompressed_size: self.uncompressed_size as u32,
            name: self.name.as_bytes().to_vec(),
            extra: Vec::new(),
        }
    }

    /// Central directory record pointing at the written local header
    pub(crate) fn central_header(&self) -> CentralDirectoryHeader {
        CentralDirectoryHeader {
            version_made_by: self.version_made_by,
            version_needed: self.version_needed(),
            flags: self.flags,
            method: self.method.as_u16(),
            mod_time: self.timestamp.time,
            mod_date: self.timestamp.date,
            crc32: self.crc32,
            compressed_size: self.compressed_size as u32,
            uncompressed_size: self.uncompressed_size as u32,
            disk_number_start: 0,
            internal_attributes: 0,
            external_attributes: self.external_attributes,
            local_header_offset: self.header_offset().unwrap_or(0) as u32,
            name: self.name.as_bytes().to_vec(),
            extra: self.central_extra.clone(),
            comment: self.comment.clone(),
        }
    }

    /// Bytes between the local header start and the payload
    pub(crate) fn header_len(&self) -> u64 {
        match self.extent {
            Some(extent) => self.data_offset - extent.start,
            None => (LocalFileHeader::FIXED_SIZE + self.name.len()) as u64,
        }
    }

    fn version_needed(&self) -> u16 {
        match (self.kind, self.method) {
            (EntryKind::Directory, _) | (_, CompressionMethod::Deflate) => VERSION_DEFLATE,
            (EntryKind::Regular, CompressionMethod::Stored) => VERSION_STORED,
        }
    }

    /// Record where the entry now lives on disk
    pub(crate) fn mark_written(&mut self, extent: Extent, data_offset: u64) {
        self.extent = Some(extent);
        self.data_offset = data_offset;
        self.flags &= !FLAG_DATA_DESCRIPTOR;
        self.source = EntrySource::Disk;
        self.dirty = false;
    }

    /// Record that the entry's bytes moved by whole-extent copy
    pub(crate) fn relocate(&mut self, to: Extent) {
        if let Some(from) = self.extent {
            self.data_offset = to.start + (self.data_offset - from.start);
            self.extent = Some(to);
        }
    }
}

fn validate_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| ZFileError::InvalidEntry {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("empty name"));
    }
    if name.len() > u16::MAX as usize {
        return Err(invalid("name longer than 65535 bytes"));
    }
    if name.starts_with('/') {
        return Err(invalid("absolute names are not allowed"));
    }

    Ok(())
}

/// Arena of entries with a name index
#[derive(Debug, Default)]
pub struct EntryDirectory {
    arena: Vec<StoredEntry>,
    index: HashMap<String, EntryId>,
    next_generation: u64,
}

impl EntryDirectory {
    pub fn new() -> Self {
        EntryDirectory::default()
    }

    /// Live entry by name
    pub fn get(&self, name: &str) -> Option<&StoredEntry> {
        self.index.get(name).map(|id| &self.arena[id.0])
    }

    pub fn id_of(&self, name: &str) -> Option<EntryId> {
        self.index.get(name).copied()
    }

    pub fn entry(&self, id: EntryId) -> &StoredEntry {
        &self.arena[id.0]
    }

    pub(crate) fn entry_mut(&mut self, id: EntryId) -> &mut StoredEntry {
        &mut self.arena[id.0]
    }

    /// Live entries in arena order
    pub fn live(&self) -> impl Iterator<Item = (EntryId, &StoredEntry)> {
        self.arena
            .iter()
            .enumerate()
            .filter(|(_, entry)| !entry.deleted)
            .map(|(i, entry)| (EntryId(i), entry))
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Live entries waiting to be written
    pub fn dirty_ids(&self) -> Vec<EntryId> {
        self.live()
            .filter(|(_, entry)| entry.dirty)
            .map(|(id, _)| id)
            .collect()
    }

    /// Add an entry read from an existing archive
    ///
    /// A second live entry with the same name is a `NameConflict`.
    pub(crate) fn insert_existing(&mut self, entry: StoredEntry) -> Result<EntryId> {
        if self.index.contains_key(&entry.name) {
            return Err(ZFileError::NameConflict(entry.name.clone()));
        }
        Ok(self.push(entry))
    }

    /// Add an entry, failing if the name is taken
    pub(crate) fn add(&mut self, entry: StoredEntry) -> Result<EntryId> {
        self.insert_existing(entry)
    }

    /// Add or replace an entry
    ///
    /// Returns the new id and the replaced entry's extent (if it had been
    /// written) so the caller can release it.
    pub(crate) fn put(&mut self, entry: StoredEntry) -> (EntryId, Option<Extent>) {
        let released = self.tombstone(&entry.name);
        (self.push(entry), released)
    }

    /// Mark a live entry deleted
    ///
    /// Returns `None` if no live entry has the name, otherwise the extent to
    /// release (if the entry had been written).
    pub(crate) fn remove(&mut self, name: &str) -> Option<Option<Extent>> {
        if !self.index.contains_key(name) {
            return None;
        }
        Some(self.tombstone(name))
    }

    /// Drop tombstones and renumber the arena
    pub(crate) fn purge_deleted(&mut self) {
        if self.arena.iter().all(|entry| !entry.deleted) {
            return;
        }

        self.arena.retain(|entry| !entry.deleted);
        self.index = self
            .arena
            .iter()
            .enumerate()
            .map(|(i, entry)| (entry.name.clone(), EntryId(i)))
            .collect();
    }

    fn tombstone(&mut self, name: &str) -> Option<Extent> {
        let id = self.index.remove(name)?;
        let entry = &mut self.arena[id.0];
        entry.deleted = true;
        entry.dirty = false;
        entry.source = EntrySource::Disk;
        entry.extent
    }

    fn push(&mut self, mut entry: StoredEntry) -> EntryId {
        self.next_generation += 1;
        entry.generation = self.next_generation;

        let id = EntryId(self.arena.len());
        self.index.insert(entry.name.clone(), id);
        self.arena.push(entry);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(name: &str, data: &[u8]) -> StoredEntry {
        StoredEntry::pending(
            name,
            CompressionMethod::Stored,
            data.to_vec(),
            data.len() as u64,
            crc32fast::hash(data),
            DosDateTime::fixed(),
        )
        .unwrap()
    }

    #[test]
    fn test_kind_from_name() {
        assert_eq!(EntryKind::for_name("a/b/"), EntryKind::Directory);
        assert_eq!(EntryKind::for_name("a/b"), EntryKind::Regular);
    }

    #[test]
    fn test_put_replaces_live_entry() {
        let mut dir = EntryDirectory::new();
        let (first, _) = dir.put(pending("a.txt", b"one"));
        dir.entry_mut(first).mark_written(Extent::new(0, 40), 37);

        let (second, released) = dir.put(pending("a.txt", b"two"));
        assert_eq!(released, Some(Extent::new(0, 40)));
        assert_ne!(first, second);
        assert!(dir.entry(first).is_deleted());
        assert_eq!(dir.len(), 1);
        assert!(dir.entry(second).generation() > dir.entry(first).generation());
    }

    #[test]
    fn test_add_conflicts_with_live_name() {
        let mut dir = EntryDirectory::new();
        dir.add(pending("x", b"1")).unwrap();
        assert!(matches!(
            dir.add(pending("x", b"2")),
            Err(ZFileError::NameConflict(_))
        ));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut dir = EntryDirectory::new();
        dir.put(pending("x", b"1"));

        assert_eq!(dir.remove("x"), Some(None));
        assert_eq!(dir.remove("x"), None);
        assert_eq!(dir.remove("missing"), None);
        assert!(dir.get("x").is_none());
    }

    #[test]
    fn test_file_and_directory_may_share_prefix() {
        let mut dir = EntryDirectory::new();
        dir.add(pending("a", b"file")).unwrap();
        dir.add(pending("a/", b"")).unwrap();

        assert!(dir.get("a/").unwrap().is_directory());
        assert!(!dir.get("a").unwrap().is_directory());
    }

    #[test]
    fn test_directory_with_data_is_invalid() {
        let result = StoredEntry::pending(
            "dir/",
            CompressionMethod::Stored,
            b"x".to_vec(),
            1,
            0,
            DosDateTime::fixed(),
        );
        assert!(matches!(result, Err(ZFileError::InvalidEntry { .. })));
    }

    #[test]
    fn test_purge_renumbers() {
        let mut dir = EntryDirectory::new();
        dir.put(pending("a", b"1"));
        dir.put(pending("b", b"2"));
        dir.remove("a");
        dir.purge_deleted();

        let names: Vec<_> = dir.live().map(|(_, e)| e.name().to_string()).collect();
        assert_eq!(names, vec!["b"]);
        assert_eq!(dir.id_of("b").map(EntryId::index), Some(0));
    }

    #[test]
    fn test_relocate_keeps_header_length() {
        let mut entry = pending("z", b"zz");
        entry.mark_written(Extent::new(100, 33), 131);
        entry.relocate(Extent::new(10, 33));

        assert_eq!(entry.header_offset(), Some(10));
        assert_eq!(entry.data_offset(), Some(41));
        assert_eq!(entry.header_len(), 31);
    }
}
