//! Lifecycle hooks
//!
//! Extensions observe the entry set and answer with mutations instead of
//! touching the engine directly. The engine applies the mutations returned
//! by one hook before the next hook runs, and repeats the before-update
//! pass until nothing changes.

use crate::compression::CompressionMethod;
use crate::entry::{EntryDirectory, StoredEntry};
use crate::error::{Result, ZFileError};
use crate::io::ContainerFile;
use crate::options::ZFileOptions;
use crate::reader;
use parking_lot::Mutex;

/// A change requested by an extension
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryMutation {
    /// Add or replace an entry
    Put {
        name: String,
        data: Vec<u8>,
        method: Option<CompressionMethod>,
    },
    /// Remove an entry if it exists
    Remove { name: String },
    /// Force the directory (and any signing block) to be rewritten
    InvalidateDirectory,
}

impl EntryMutation {
    pub fn put(name: impl Into<String>, data: Vec<u8>) -> Self {
        EntryMutation::Put {
            name: name.into(),
            data,
            method: None,
        }
    }

    pub fn remove(name: impl Into<String>) -> Self {
        EntryMutation::Remove { name: name.into() }
    }
}

/// Read-only view of the entry set handed to hooks
///
/// The view is `Sync`, so extensions may read entries from worker threads.
#[derive(Clone, Copy)]
pub struct EntrySetView<'a> {
    pub(crate) entries: &'a EntryDirectory,
    pub(crate) file: &'a Mutex<ContainerFile>,
    pub(crate) options: &'a ZFileOptions,
    pub(crate) signing_block: Option<&'a [u8]>,
    pub(crate) dirty: bool,
}

impl<'a> EntrySetView<'a> {
    /// Live entry by name
    pub fn get(&self, name: &str) -> Option<&'a StoredEntry> {
        self.entries.get(name)
    }

    /// Live entries in arena order
    pub fn entries(&self) -> impl Iterator<Item = &'a StoredEntry> + 'a {
        self.entries.live().map(|(_, entry)| entry)
    }

    /// Names of the live entries, sorted
    pub fn names(&self) -> Vec<&'a str> {
        let mut names: Vec<&str> = self.entries().map(StoredEntry::name).collect();
        names.sort_unstable();
        names
    }

    /// Uncompressed, CRC-checked contents of a live entry
    pub fn read(&self, name: &str) -> Result<Vec<u8>> {
        let entry = self
            .get(name)
            .ok_or_else(|| ZFileError::EntryNotFound(name.to_string()))?;
        reader::read_verified(entry, self.file)
    }

    pub fn options(&self) -> &'a ZFileOptions {
        self.options
    }

    /// Signing block currently on disk (before this update rewrites it)
    pub fn signing_block(&self) -> Option<&'a [u8]> {
        self.signing_block
    }

    /// Whether the next flush will rewrite the directory
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// The archive as it will be written, minus the signing block
///
/// `contents` is `[0, entries_end)` of the file; `eocd` points its
/// directory offset at `entries_end`.
#[derive(Debug, Clone, Copy)]
pub struct ArchiveImage<'a> {
    pub contents: &'a [u8],
    pub central_directory: &'a [u8],
    pub eocd: &'a [u8],
}

impl ArchiveImage<'_> {
    /// Offset where the central directory would start without a signing block
    pub fn entries_end(&self) -> u64 {
        self.contents.len() as u64
    }
}

/// Hooks into the container lifecycle
///
/// Every hook defaults to doing nothing. Hooks must be idempotent: running
/// `before_update` again on the result of its own mutations must return no
/// effective change.
pub trait ZFileExtension: Send + Sync {
    /// Name used in log messages
    fn name(&self) -> &str;

    /// Inspect the entry set before anything is written
    fn before_update(&mut self, _view: &EntrySetView<'_>) -> Result<Vec<EntryMutation>> {
        Ok(Vec::new())
    }

    /// Inspect the final entry bytes; may return a signing block to insert
    /// before the central directory
    fn entries_written(&mut self, _image: &ArchiveImage<'_>) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    /// Called once the update is on disk
    fn after_update(&mut self, _view: &EntrySetView<'_>) -> Result<()> {
        Ok(())
    }

    /// Called when the container is closed
    fn on_close(&mut self) {}
}
