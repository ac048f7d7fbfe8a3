//! Disk I/O for container files
//!
//! The file is opened read-only and only reopened for writing on the first
//! mutation, so sessions that never flush leave the file (and its mtime)
//! untouched. A missing file is created lazily the same way.

use crate::error::Result;
use memmap2::Mmap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const COPY_CHUNK: usize = 64 * 1024;

/// Disk-backed container storage
pub struct ContainerFile {
    file: Option<File>,
    writable: bool,
    path: PathBuf,
}

impl ContainerFile {
    /// Open a container path without creating or modifying it
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = if path.exists() {
            Some(OpenOptions::new().read(true).open(&path)?)
        } else {
            None
        };

        Ok(ContainerFile {
            file,
            writable: false,
            path,
        })
    }

    /// Current length of the file (0 if it does not exist yet)
    pub fn len(&self) -> Result<u64> {
        match &self.file {
            Some(file) => Ok(file.metadata()?.len()),
            None => Ok(0),
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Fill `buf` with the bytes at `offset`
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }

        let file = match self.file.as_mut() {
            Some(file) => file,
            None => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "Container file does not exist yet",
                )
                .into())
            }
        };

        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    /// Read `len` bytes at `offset` into a new buffer
    pub fn read_vec(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Write `data` at `offset`, growing the file if needed
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let file = self.writable_file()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    /// Copy `len` bytes from `from` to `to` inside the file
    ///
    /// Overlapping ranges are only allowed when moving towards the start.
    pub fn copy_within(&mut self, from: u64, to: u64, len: u64) -> Result<()> {
        let mut buffer = vec![0u8; COPY_CHUNK.min(len as usize)];
        let mut done = 0u64;

        while done < len {
            let chunk = (len - done).min(buffer.len() as u64) as usize;
            self.read_at(from + done, &mut buffer[..chunk])?;
            self.write_at(to + done, &buffer[..chunk])?;
            done += chunk as u64;
        }

        Ok(())
    }

    /// Truncate or extend the file
    pub fn set_len(&mut self, len: u64) -> Result<()> {
        let file = self.writable_file()?;
        file.set_len(len)?;
        Ok(())
    }

    /// Map the whole file read-only
    ///
    /// Returns `None` for a missing or empty file, which cannot be mapped.
    pub fn map(&self) -> Result<Option<Mmap>> {
        match &self.file {
            Some(file) if file.metadata()?.len() > 0 => {
                // The engine owns the path exclusively for the session, so the
                // mapping is not truncated underneath us while it is alive.
                let mmap = unsafe { Mmap::map(file)? };
                Ok(Some(mmap))
            }
            _ => Ok(None),
        }
    }

    /// Get file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file has been reopened for writing
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Sync all writes to disk
    pub fn sync(&mut self) -> Result<()> {
        if let (true, Some(file)) = (self.writable, self.file.as_mut()) {
            file.flush()?;
            file.sync_all()?;
        }
        Ok(())
    }

    /// Drop the file handle; later reads fail until something is written
    pub fn release(&mut self) {
        self.file = None;
        self.writable = false;
    }

    fn writable_file(&mut self) -> Result<&mut File> {
        if !self.writable {
            debug!("Reopening {} for writing", self.path.display());
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&self.path)?;
            self.file = Some(file);
            self.writable = true;
        }

        match self.file.as_mut() {
            Some(file) => Ok(file),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Container file handle missing",
            )
            .into()),
        }
    }
}
