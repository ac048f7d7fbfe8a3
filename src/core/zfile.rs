//! Container engine
//!
//! [`ZFile`] keeps the parsed entry directory and the extent map of one ZIP
//! file in memory. Mutations only touch the model; [`ZFile::update`] writes
//! pending payloads into free extents, rebuilds the central directory and
//! lets extensions take part in the flush.

use crate::allocator::{Extent, ExtentMap, Placement, Relocation};
use crate::compression::{compress_if_beneficial, CompressionMethod};
use crate::entry::{EntryDirectory, EntryId, EntrySource, StoredEntry};
use crate::error::{Result, ZFileError};
use crate::extension::{ArchiveImage, EntryMutation, EntrySetView, ZFileExtension};
use crate::io::ContainerFile;
use crate::options::ZFileOptions;
use crate::reader::{self, EntryReader};
use crate::sign::{DigestAlgorithm, WorkerPool};
use crate::zip::{
    signing_block, CentralDirectoryHeader, EndOfCentralDirectory, LocalFileHeader, SigningBlock,
    DATA_DESCRIPTOR_SIGNATURE, FLAG_DATA_DESCRIPTOR, FLAG_ENCRYPTED,
};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// How far back from the end of the file the EOCD record can start
const EOCD_SEARCH_WINDOW: u64 =
    (EndOfCentralDirectory::FIXED_SIZE + EndOfCentralDirectory::MAX_COMMENT) as u64;

/// Where the records following the entries currently sit on disk
#[derive(Debug, Clone, Copy)]
struct DirectoryLayout {
    signing_block: Option<Extent>,
    central_directory: Extent,
    eocd: Extent,
    entries: u16,
}

impl DirectoryLayout {
    /// End record pointing at this directory, carrying `comment`
    fn end_record(&self, comment: &[u8]) -> Vec<u8> {
        EndOfCentralDirectory::new(
            self.entries,
            self.central_directory.length as u32,
            self.central_directory.start as u32,
            comment.to_vec(),
        )
        .to_bytes()
    }

    fn extents(&self) -> impl Iterator<Item = Extent> {
        [
            self.signing_block,
            Some(self.central_directory),
            Some(self.eocd),
        ]
        .into_iter()
        .flatten()
    }
}

/// Everything recovered from an existing archive
struct ParsedArchive {
    entries: EntryDirectory,
    map: ExtentMap,
    layout: DirectoryLayout,
    signing_block: Option<Vec<u8>>,
    comment: Vec<u8>,
}

/// Container statistics
#[derive(Debug, Clone)]
pub struct ZFileStats {
    pub entries: usize,
    pub file_size: u64,
    pub free_bytes: u64,
    pub fragmentation: f64,
    pub signing_block_size: u64,
}

/// An incrementally updated ZIP file
pub struct ZFile {
    /// Container path
    path: PathBuf,

    /// Disk-backed storage, shared with hook views and readers
    file: Mutex<ContainerFile>,

    /// Live entries and tombstones
    entries: EntryDirectory,

    /// Free/used byte ranges of the file
    map: ExtentMap,

    /// Signing block, central directory and EOCD as last written
    layout: Option<DirectoryLayout>,

    /// Extents of replaced or removed entries the on-disk directory still
    /// points at; freed once a new directory is in place
    retired: Vec<Extent>,

    /// Raw signing block as last written or found on open
    signing_block: Option<Vec<u8>>,

    /// Archive comment, preserved across rewrites
    comment: Vec<u8>,

    /// Registered extensions, in hook order
    extensions: Vec<Box<dyn ZFileExtension>>,

    options: ZFileOptions,

    /// Pending changes the file does not reflect yet
    dirty: bool,

    /// Compact on the next flush even if `compact_on_update` is off
    force_compact: bool,

    closed: bool,
}

impl ZFile {
    /// Open (or prepare to create) a container
    ///
    /// A missing or zero-length file yields an empty container that is
    /// written as a bare end-of-central-directory record on the first
    /// update. Nothing is written by opening.
    pub fn open<P: AsRef<Path>>(path: P, options: ZFileOptions) -> Result<Self> {
        options.validate()?;

        let path = path.as_ref().to_path_buf();
        let mut file = ContainerFile::open(&path)?;
        let len = file.len()?;

        info!("Opening container at {:?} ({} bytes)", path, len);

        let parsed = if len > 0 {
            Some(parse_archive(&mut file, len)?)
        } else {
            None
        };

        let mut zfile = ZFile {
            path,
            file: Mutex::new(file),
            entries: EntryDirectory::new(),
            map: ExtentMap::new(),
            layout: None,
            retired: Vec::new(),
            signing_block: None,
            comment: Vec::new(),
            extensions: Vec::new(),
            options,
            dirty: parsed.is_none(),
            force_compact: false,
            closed: false,
        };

        if let Some(parsed) = parsed {
            debug!(
                "Parsed {} entries, central directory at {}",
                parsed.entries.len(),
                parsed.layout.central_directory.start
            );

            zfile.entries = parsed.entries;
            zfile.map = parsed.map;
            zfile.layout = Some(parsed.layout);
            zfile.signing_block = parsed.signing_block;
            zfile.comment = parsed.comment;
        }

        Ok(zfile)
    }

    /// Register an extension; hooks run in registration order
    pub fn add_extension(&mut self, extension: Box<dyn ZFileExtension>) {
        debug!("Registering extension {}", extension.name());
        self.extensions.push(extension);
    }

    /// Add or replace an entry
    ///
    /// The payload is compressed now with `method`, or the configured
    /// default when `None`. DEFLATE falls back to stored when it does not
    /// shrink the data.
    pub fn put(
        &mut self,
        name: &str,
        data: &[u8],
        method: Option<CompressionMethod>,
    ) -> Result<()> {
        self.ensure_open()?;

        let entry = self.prepare_entry(name, data, method)?;
        let (_, released) = self.entries.put(entry);
        self.retired.extend(released);
        self.dirty = true;

        debug!("Put {} ({} bytes)", name, data.len());
        Ok(())
    }

    /// Add an entry, failing with `NameConflict` if the name is taken
    pub fn add(
        &mut self,
        name: &str,
        data: &[u8],
        method: Option<CompressionMethod>,
    ) -> Result<()> {
        self.ensure_open()?;

        let entry = self.prepare_entry(name, data, method)?;
        self.entries.add(entry)?;
        self.dirty = true;

        debug!("Added {} ({} bytes)", name, data.len());
        Ok(())
    }

    /// Remove an entry; returns `false` if no live entry has the name
    pub fn remove(&mut self, name: &str) -> Result<bool> {
        self.ensure_open()?;

        match self.entries.remove(name) {
            Some(released) => {
                self.retired.extend(released);
                self.dirty = true;
                debug!("Removed {}", name);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Live entry by name
    pub fn get(&self, name: &str) -> Option<&StoredEntry> {
        self.entries.get(name)
    }

    /// Uncompressed contents of an entry, CRC-32 and size checked
    pub fn read(&self, name: &str) -> Result<Vec<u8>> {
        self.ensure_open()?;

        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| ZFileError::EntryNotFound(name.to_string()))?;
        reader::read_verified(entry, &self.file)
    }

    /// Streaming reader over an entry, checked at end of stream
    pub fn reader(&self, name: &str) -> Result<EntryReader<'_>> {
        self.ensure_open()?;

        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| ZFileError::EntryNotFound(name.to_string()))?;
        EntryReader::new(entry, &self.file)
    }

    /// Live entries in directory order
    pub fn entries(&self) -> impl Iterator<Item = &StoredEntry> {
        self.entries.live().map(|(_, entry)| entry)
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the file lags behind the model
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &ZFileOptions {
        &self.options
    }

    /// Offset of the central directory as last written, `None` before the
    /// first write of a new container
    pub fn central_directory_offset(&self) -> Option<u64> {
        self.layout.map(|layout| layout.central_directory.start)
    }

    /// Signing block as last written (or found on open)
    pub fn signing_block(&self) -> Option<&[u8]> {
        self.signing_block.as_deref()
    }

    pub fn comment(&self) -> &[u8] {
        &self.comment
    }

    /// Replace the archive comment
    pub fn set_comment(&mut self, comment: &[u8]) -> Result<()> {
        self.ensure_open()?;

        if comment.len() > EndOfCentralDirectory::MAX_COMMENT {
            return Err(ZFileError::InvalidEntry {
                name: "<archive comment>".to_string(),
                reason: format!("comment of {} bytes is too long", comment.len()),
            });
        }

        if self.comment != comment {
            self.comment = comment.to_vec();
            self.dirty = true;
        }
        Ok(())
    }

    /// Fill `buf` with the raw file bytes at `offset`
    pub fn direct_fully_read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.ensure_open()?;
        self.file.lock().read_at(offset, buf)
    }

    /// Base64 digest of every live entry's uncompressed contents
    ///
    /// Entries are read and hashed in parallel on `pool`.
    pub fn content_digests(
        &self,
        algorithm: DigestAlgorithm,
        pool: &WorkerPool,
    ) -> Result<BTreeMap<String, String>> {
        self.ensure_open()?;

        let view = self.view();
        let names = view.names();

        let digests: Result<Vec<(String, String)>> = pool.install(|| {
            names
                .par_iter()
                .map(|name| {
                    let data = view.read(name)?;
                    Ok((name.to_string(), algorithm.digest_base64(&data)))
                })
                .collect()
        });

        Ok(digests?.into_iter().collect())
    }

    pub fn stats(&self) -> ZFileStats {
        ZFileStats {
            entries: self.entries.len(),
            file_size: self.map.size(),
            free_bytes: self.map.free_bytes(),
            fragmentation: self.map.fragmentation_score(),
            signing_block_size: self.signing_block.as_ref().map_or(0, |b| b.len() as u64),
        }
    }

    /// Rewrite the container now, moving trailing entries into holes
    pub fn compact(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.force_compact = true;
        self.dirty = true;
        self.update()
    }

    /// Bring the file in line with the model
    ///
    /// Runs the extension hooks; a clean container is left untouched.
    pub fn update(&mut self) -> Result<()> {
        self.ensure_open()?;

        let mut extensions = std::mem::take(&mut self.extensions);
        let result = self.update_with(&mut extensions);
        self.extensions = extensions;

        result
    }

    /// Final update, then release the file
    ///
    /// Mutations afterwards fail with `Closed`; derived facts such as
    /// [`ZFile::central_directory_offset`] stay available.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }

        self.update()?;

        for extension in self.extensions.iter_mut() {
            extension.on_close();
        }

        self.file.lock().release();
        self.closed = true;

        info!("Closed container at {:?}", self.path);
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(ZFileError::Closed);
        }
        Ok(())
    }

    fn view(&self) -> EntrySetView<'_> {
        EntrySetView {
            entries: &self.entries,
            file: &self.file,
            options: &self.options,
            signing_block: self.signing_block.as_deref(),
            dirty: self.dirty,
        }
    }

    fn prepare_entry(
        &self,
        name: &str,
        data: &[u8],
        method: Option<CompressionMethod>,
    ) -> Result<StoredEntry> {
        let method = method.unwrap_or(self.options.compression);
        let config = self.options.compression_config(method);
        let (compressed, used) = compress_if_beneficial(data, &config)?;

        StoredEntry::pending(
            name,
            used,
            compressed,
            data.len() as u64,
            crc32fast::hash(data),
            self.options.entry_timestamp(),
        )
    }

    fn update_with(&mut self, extensions: &mut [Box<dyn ZFileExtension>]) -> Result<()> {
        self.run_before_update(extensions)?;

        if !self.dirty {
            debug!("Container is clean, nothing to write");
            return Ok(());
        }

        let compact = self.options.compact_on_update || self.force_compact;
        self.flush(extensions, compact)?;

        // Space freed by this flush can only be reused by the next one
        if compact && self.can_compact() {
            debug!("Compacting holes left by the previous write");
            self.flush(extensions, true)?;
        }
        self.force_compact = false;

        let view = self.view();
        for extension in extensions.iter_mut() {
            extension.after_update(&view)?;
        }

        Ok(())
    }

    /// Run before-update hooks until a whole pass changes nothing
    fn run_before_update(&mut self, extensions: &mut [Box<dyn ZFileExtension>]) -> Result<()> {
        if extensions.is_empty() {
            return Ok(());
        }

        let max_passes = self.options.max_fixpoint_passes;

        for pass in 1..=max_passes {
            let mut changed = false;

            for extension in extensions.iter_mut() {
                let mutations = extension.before_update(&self.view())?;
                for mutation in mutations {
                    changed |= self.apply_mutation(mutation)?;
                }
            }

            if !changed {
                debug!("Extensions settled after {} pass(es)", pass);
                return Ok(());
            }
        }

        Err(ZFileError::FixpointDivergence(max_passes))
    }

    /// Apply one mutation; returns whether it changed anything
    fn apply_mutation(&mut self, mutation: EntryMutation) -> Result<bool> {
        match mutation {
            EntryMutation::Put { name, data, method } => {
                self.put(&name, &data, method)?;
                Ok(true)
            }
            EntryMutation::Remove { name } => self.remove(&name),
            EntryMutation::InvalidateDirectory => {
                let changed = !self.dirty;
                self.dirty = true;
                Ok(changed)
            }
        }
    }

    /// Write pending entries and a new directory
    ///
    /// Nothing the on-disk directory points at is overwritten before the
    /// new directory is complete, and the file always ends in a valid end
    /// record, so a crash at any point leaves either the old archive or the
    /// new one. Retired extents and the old directory are freed only after
    /// the commit.
    fn flush(&mut self, extensions: &mut [Box<dyn ZFileExtension>], compact: bool) -> Result<()> {
        let count = self.entries.len();
        if count >= u16::MAX as usize {
            return Err(ZFileError::Unsupported(format!(
                "{} entries need ZIP64",
                count
            )));
        }

        info!("Updating {:?} ({} entries)", self.path, count);

        let tail = self.write_payloads()?;
        if compact {
            self.compact_entries()?;
        }

        let plan = self.plan_directory(extensions, tail)?;
        self.stage_directory(&plan, tail)?;
        self.commit_directory(&plan, tail)?;

        let old_layout = self.layout.take();
        let released = std::mem::take(&mut self.retired)
            .into_iter()
            .chain(old_layout.iter().flat_map(|layout| layout.extents()));
        for extent in released {
            self.map.release(extent)?;
        }

        let layout = plan.layout();
        for extent in layout.extents() {
            self.map.mark_used(extent)?;
        }
        self.map.truncate_trailing_free();
        debug_assert_eq!(self.map.size(), plan.end());

        info!(
            "Wrote {} entries to {:?}, central directory at {}",
            count,
            self.path,
            plan.cd_offset()
        );

        self.layout = Some(layout);
        self.signing_block = plan.block;
        self.entries.purge_deleted();
        self.dirty = false;
        Ok(())
    }

    /// Allocate and write every pending entry
    ///
    /// When the payloads run past the end of the file, a copy of the
    /// current end record is written after them first so the file still
    /// ends in one.
    fn write_payloads(&mut self) -> Result<TailRecord> {
        let mut tail = TailRecord {
            file_len: self.map.size(),
            start: self.layout.map(|layout| layout.eocd.start),
        };

        let writes = self.allocate_pending();

        if let Some(layout) = self.layout {
            let grown_to = self.map.size();
            if grown_to > tail.file_len {
                let bridge = layout.end_record(&self.comment);
                let mut file = self.file.lock();
                file.write_at(grown_to, &bridge)?;
                file.sync()?;

                tail = TailRecord {
                    file_len: grown_to + bridge.len() as u64,
                    start: Some(grown_to),
                };
            }
        }

        self.write_pending(&writes)?;
        Ok(tail)
    }

    /// Serialize the directory and decide where it goes
    ///
    /// Right after the last entry if that leaves everything in use and the
    /// current end record alone, otherwise past everything in use. The
    /// signing block is requested for the chosen position.
    fn plan_directory(
        &self,
        extensions: &mut [Box<dyn ZFileExtension>],
        tail: TailRecord,
    ) -> Result<DirectoryPlan> {
        let count = self.entries.len() as u16;

        let mut central_directory = Vec::new();
        for (_, entry) in self.entries.live() {
            entry.central_header().write_to(&mut central_directory);
        }

        let entries_end = self
            .entries
            .live()
            .filter_map(|(_, entry)| entry.extent())
            .map(|extent| extent.end())
            .max()
            .unwrap_or(0);

        let mut plan = DirectoryPlan {
            start: entries_end,
            block: self.collect_signing_block(extensions, entries_end, count, &central_directory)?,
            central_directory,
            comment: self.comment.clone(),
            count,
        };

        if !self.directory_fits(&plan, tail) {
            plan.start = self.map.used_end().max(tail.file_len);
            plan.block =
                self.collect_signing_block(extensions, plan.start, count, &plan.central_directory)?;
        }

        if self.signing_block.is_some() && plan.block.is_none() {
            warn!("Dropping the signing block of {:?}", self.path);
        }

        if plan.end() >= u32::MAX as u64 || plan.central_directory.len() as u64 >= u32::MAX as u64 {
            return Err(ZFileError::Unsupported(format!(
                "archive of {} bytes needs ZIP64",
                plan.end()
            )));
        }

        Ok(plan)
    }

    /// Write signing block and central directory, still unreferenced
    ///
    /// When the directory lies below the current end, the new end record is
    /// written too; the file only adopts it on truncation. When the file
    /// grows, the old end record is first copied to the new end.
    fn stage_directory(&self, plan: &DirectoryPlan, tail: TailRecord) -> Result<()> {
        let mut file = self.file.lock();

        if plan.end() > tail.file_len {
            if let Some(layout) = self.layout {
                file.write_at(plan.eocd_offset(), &layout.end_record(&plan.comment))?;
                file.sync()?;
            }
        }

        if let Some(block) = &plan.block {
            file.write_at(plan.start, block)?;
        }
        file.write_at(plan.cd_offset(), &plan.central_directory)?;
        if plan.end() < tail.file_len {
            file.write_at(plan.eocd_offset(), &plan.eocd())?;
        }

        file.sync()
    }

    /// Make the new directory the one readers find
    fn commit_directory(&self, plan: &DirectoryPlan, tail: TailRecord) -> Result<()> {
        let mut file = self.file.lock();

        if plan.end() >= tail.file_len {
            file.write_at(plan.eocd_offset(), &plan.eocd())?;
        }
        file.set_len(plan.end())?;
        file.sync()
    }

    /// Whether the planned directory may be written where it is
    ///
    /// It must not touch anything in use, and the record currently ending
    /// the file must survive until the new end record replaces it.
    fn directory_fits(&self, plan: &DirectoryPlan, tail: TailRecord) -> bool {
        if !self.map.is_free(Extent::new(plan.start, plan.end() - plan.start)) {
            return false;
        }

        let end = plan.end();
        match tail.start {
            None => true,
            Some(record) => {
                end > tail.file_len
                    || end <= record
                    || (end == tail.file_len && record == plan.eocd_offset())
            }
        }
    }

    /// Reserve extents for every pending entry
    fn allocate_pending(&mut self) -> Vec<(EntryId, Extent, Vec<u8>)> {
        let mut writes = Vec::new();

        for id in self.entries.dirty_ids() {
            let entry = self.entries.entry(id);
            let payload_len = match &entry.source {
                EntrySource::Pending(bytes) => bytes.len() as u64,
                EntrySource::Disk => continue,
            };

            let header = entry.local_header().to_bytes();
            let placement = placement_for(&self.options, entry, header.len() as u64);
            let extent = self
                .map
                .allocate(header.len() as u64 + payload_len, placement);
            writes.push((id, extent, header));
        }

        writes
    }

    /// Write local headers and payloads into their reserved extents
    fn write_pending(&mut self, writes: &[(EntryId, Extent, Vec<u8>)]) -> Result<()> {
        for (id, extent, header) in writes {
            let header_len = header.len() as u64;
            {
                let entry = self.entries.entry(*id);
                let payload = match &entry.source {
                    EntrySource::Pending(bytes) => bytes,
                    EntrySource::Disk => continue,
                };

                let mut file = self.file.lock();
                file.write_at(extent.start, header)?;
                file.write_at(extent.start + header_len, payload)?;

                debug!(
                    "Wrote {} at [{}, {})",
                    entry.name(),
                    extent.start,
                    extent.end()
                );
            }

            self.entries
                .entry_mut(*id)
                .mark_written(*extent, extent.start + header_len);
        }

        Ok(())
    }

    /// Copy entries into earlier holes
    ///
    /// The vacated extents are retired like those of replaced entries.
    fn compact_entries(&mut self) -> Result<()> {
        let moves = plan_compaction(&self.entries, &self.options, &mut self.map);
        if moves.is_empty() {
            return Ok(());
        }

        {
            let mut file = self.file.lock();
            for (_, relocation) in &moves {
                file.copy_within(
                    relocation.from.start,
                    relocation.to.start,
                    relocation.from.length,
                )?;
            }
        }

        debug!("Compaction moved {} entries", moves.len());
        for (id, relocation) in moves {
            self.entries.entry_mut(id).relocate(relocation.to);
            self.retired.push(relocation.from);
        }

        Ok(())
    }

    /// Whether compaction would move any entry right now
    fn can_compact(&self) -> bool {
        let mut map = self.map.clone();
        !plan_compaction(&self.entries, &self.options, &mut map).is_empty()
    }

    /// Ask the extensions for a signing block covering the final bytes
    fn collect_signing_block(
        &self,
        extensions: &mut [Box<dyn ZFileExtension>],
        entries_end: u64,
        count: u16,
        central_directory: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let eocd = EndOfCentralDirectory::new(
            count,
            central_directory.len() as u32,
            entries_end as u32,
            self.comment.clone(),
        )
        .to_bytes();

        let mmap = self.file.lock().map()?;
        let contents: &[u8] = match &mmap {
            Some(map) => map.get(..entries_end as usize).ok_or_else(|| {
                ZFileError::CorruptContainer(format!(
                    "File is shorter than its {} bytes of entries",
                    entries_end
                ))
            })?,
            None => &[],
        };

        let image = ArchiveImage {
            contents,
            central_directory,
            eocd: &eocd,
        };

        let mut block: Option<Vec<u8>> = None;
        for extension in extensions.iter_mut() {
            let supplied = match extension.entries_written(&image)? {
                Some(bytes) => bytes,
                None => continue,
            };

            if block.is_some() {
                return Err(ZFileError::signing(
                    extension.name(),
                    "signing block",
                    "another extension already supplied a signing block",
                ));
            }

            SigningBlock::from_bytes(&supplied).map_err(|e| {
                ZFileError::signing(extension.name(), "signing block", e.to_string())
            })?;
            block = Some(supplied);
        }

        Ok(block)
    }
}

impl Drop for ZFile {
    fn drop(&mut self) {
        if !self.closed && self.dirty {
            warn!("Container {:?} dropped with unwritten changes", self.path);
        }
    }
}

/// Length of the file and start of the end record that closes it
#[derive(Debug, Clone, Copy)]
struct TailRecord {
    file_len: u64,
    start: Option<u64>,
}

/// A directory about to be written at `start`
struct DirectoryPlan {
    start: u64,
    block: Option<Vec<u8>>,
    central_directory: Vec<u8>,
    comment: Vec<u8>,
    count: u16,
}

impl DirectoryPlan {
    fn cd_offset(&self) -> u64 {
        self.start + self.block.as_ref().map_or(0, |b| b.len() as u64)
    }

    fn eocd_offset(&self) -> u64 {
        self.cd_offset() + self.central_directory.len() as u64
    }

    fn end(&self) -> u64 {
        self.eocd_offset() + (EndOfCentralDirectory::FIXED_SIZE + self.comment.len()) as u64
    }

    fn eocd(&self) -> Vec<u8> {
        EndOfCentralDirectory::new(
            self.count,
            self.central_directory.len() as u32,
            self.cd_offset() as u32,
            self.comment.clone(),
        )
        .to_bytes()
    }

    fn layout(&self) -> DirectoryLayout {
        DirectoryLayout {
            signing_block: self
                .block
                .as_ref()
                .map(|b| Extent::new(self.start, b.len() as u64)),
            central_directory: Extent::new(self.cd_offset(), self.central_directory.len() as u64),
            eocd: Extent::new(self.eocd_offset(), self.end() - self.eocd_offset()),
            entries: self.count,
        }
    }
}

/// Plan compaction of live entries on `map`
///
/// Directory records and extents that no live entry owns stay put.
fn plan_compaction(
    entries: &EntryDirectory,
    options: &ZFileOptions,
    map: &mut ExtentMap,
) -> Vec<(EntryId, Relocation)> {
    let by_start: HashMap<u64, EntryId> = entries
        .live()
        .filter_map(|(id, entry)| entry.header_offset().map(|start| (start, id)))
        .collect();

    map.compact(|extent| {
        let entry = entries.entry(*by_start.get(&extent.start)?);
        (entry.extent() == Some(extent))
            .then(|| placement_for(options, entry, entry.header_len()))
    })
    .into_iter()
    .filter_map(|relocation| Some((*by_start.get(&relocation.from.start)?, relocation)))
    .collect()
}

/// Allocation constraint of an entry's local header + payload
///
/// Only stored payloads are aligned; compressed ones cannot be mapped
/// directly anyway.
fn placement_for(options: &ZFileOptions, entry: &StoredEntry, header_len: u64) -> Placement {
    if entry.method() == CompressionMethod::Stored && !entry.is_directory() {
        Placement::aligned(options.alignment.alignment_for(entry.name()), header_len)
    } else {
        Placement::unaligned()
    }
}

fn parse_archive(file: &mut ContainerFile, len: u64) -> Result<ParsedArchive> {
    let tail_len = len.min(EOCD_SEARCH_WINDOW);
    let tail_start = len - tail_len;
    let tail = file.read_vec(tail_start, tail_len as usize)?;

    let at = EndOfCentralDirectory::locate(&tail).ok_or_else(|| {
        ZFileError::CorruptContainer("No end of central directory record found".to_string())
    })?;
    let eocd = EndOfCentralDirectory::from_bytes(&tail[at..])?;
    let eocd_offset = tail_start + at as u64;

    if eocd.is_zip64() {
        return Err(ZFileError::Unsupported("ZIP64 archives".to_string()));
    }
    if eocd.disk_number != 0
        || eocd.central_dir_disk != 0
        || eocd.entries_on_disk != eocd.entries_total
    {
        return Err(ZFileError::Unsupported("Multi-disk archives".to_string()));
    }

    let cd_offset = eocd.central_dir_offset as u64;
    let cd_size = eocd.central_dir_size as u64;
    if cd_offset + cd_size > eocd_offset {
        return Err(ZFileError::CorruptContainer(format!(
            "Central directory [{}, {}) runs into the end record at {}",
            cd_offset,
            cd_offset + cd_size,
            eocd_offset
        )));
    }

    let mut map = ExtentMap::with_free_space(len);
    let overlap = |what: &str| {
        ZFileError::CorruptContainer(format!("{} overlaps another record", what))
    };

    let (signing_block, block_extent) = read_signing_block(file, cd_offset)?;
    let layout = DirectoryLayout {
        signing_block: block_extent,
        central_directory: Extent::new(cd_offset, cd_size),
        eocd: Extent::new(eocd_offset, len - eocd_offset),
        entries: eocd.entries_total,
    };
    for extent in layout.extents() {
        map.mark_used(extent).map_err(|_| overlap("Directory record"))?;
    }

    let limit = block_extent.map_or(cd_offset, |extent| extent.start);
    let cd = file.read_vec(cd_offset, cd_size as usize)?;
    let mut entries = EntryDirectory::new();
    let mut pos = 0usize;

    for _ in 0..eocd.entries_total {
        let (header, consumed) = CentralDirectoryHeader::from_bytes(&cd[pos..])?;
        pos += consumed;

        let entry = load_entry(file, &header, limit)?;
        let name = entry.name().to_string();

        if let Some(extent) = entry.extent() {
            map.mark_used(extent)
                .map_err(|_| overlap(&format!("Entry '{}'", name)))?;
        }
        entries.insert_existing(entry).map_err(|e| match e {
            ZFileError::NameConflict(name) => {
                ZFileError::CorruptContainer(format!("Duplicate entry name '{}'", name))
            }
            other => other,
        })?;
    }

    if pos != cd.len() {
        return Err(ZFileError::CorruptContainer(format!(
            "Central directory holds {} bytes past its {} records",
            cd.len() - pos,
            eocd.entries_total
        )));
    }

    Ok(ParsedArchive {
        entries,
        map,
        layout,
        signing_block,
        comment: eocd.comment,
    })
}

/// Find a signing block ending right before the central directory
fn read_signing_block(
    file: &mut ContainerFile,
    cd_offset: u64,
) -> Result<(Option<Vec<u8>>, Option<Extent>)> {
    let footer_size = signing_block::FOOTER_SIZE as u64;
    if cd_offset < footer_size {
        return Ok((None, None));
    }

    let footer = file.read_vec(cd_offset - footer_size, signing_block::FOOTER_SIZE)?;
    let size = match SigningBlock::size_from_footer(&footer) {
        Some(size) => size,
        None => return Ok((None, None)),
    };

    if size < signing_block::MIN_SIZE as u64 || size > cd_offset {
        return Err(ZFileError::CorruptContainer(format!(
            "Signing block size {} out of range",
            size
        )));
    }

    let start = cd_offset - size;
    let bytes = file.read_vec(start, size as usize)?;
    SigningBlock::from_bytes(&bytes)?;

    debug!("Found {} byte signing block at {}", size, start);
    Ok((Some(bytes), Some(Extent::new(start, size))))
}

/// Rebuild an entry from its central record and local header
fn load_entry(
    file: &mut ContainerFile,
    header: &CentralDirectoryHeader,
    limit: u64,
) -> Result<StoredEntry> {
    let name = String::from_utf8(header.name.clone()).map_err(|_| {
        ZFileError::CorruptContainer(format!(
            "Entry name {:?} is not valid UTF-8",
            String::from_utf8_lossy(&header.name)
        ))
    })?;

    if header.is_zip64() {
        return Err(ZFileError::Unsupported(format!("ZIP64 entry '{}'", name)));
    }
    if header.flags & FLAG_ENCRYPTED != 0 {
        return Err(ZFileError::Unsupported(format!("Encrypted entry '{}'", name)));
    }
    let method = CompressionMethod::from_u16(header.method).ok_or_else(|| {
        ZFileError::Unsupported(format!(
            "Compression method {} of entry '{}'",
            header.method, name
        ))
    })?;

    let header_offset = header.local_header_offset as u64;
    let fixed_size = LocalFileHeader::FIXED_SIZE as u64;
    if header_offset + fixed_size > limit {
        return Err(ZFileError::CorruptContainer(format!(
            "Local header of '{}' lies past the entry area",
            name
        )));
    }

    let fixed = file.read_vec(header_offset, LocalFileHeader::FIXED_SIZE)?;
    let variable = LocalFileHeader::variable_data_size(&fixed)? as u64;
    let data_offset = header_offset + fixed_size + variable;
    let mut end = data_offset + header.compressed_size as u64;

    if header.flags & FLAG_DATA_DESCRIPTOR != 0 {
        let mut signature = [0u8; 4];
        if end + 4 <= limit {
            file.read_at(end, &mut signature)?;
        }
        end += if u32::from_le_bytes(signature) == DATA_DESCRIPTOR_SIGNATURE {
            16
        } else {
            12
        };
    }

    if end > limit {
        return Err(ZFileError::CorruptContainer(format!(
            "Entry '{}' runs past the entry area",
            name
        )));
    }

    Ok(StoredEntry::from_central(
        name,
        header,
        method,
        Extent::new(header_offset, end - header_offset),
        data_offset,
    ))
}
