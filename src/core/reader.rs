//! Entry payload access
//!
//! Reads go through the shared file handle one raw chunk at a time, so
//! decompression and hashing of different entries can run on different
//! threads while the lock is only held for the positioned read itself.

use crate::compression::{self, decompress};
use crate::entry::{EntrySource, StoredEntry};
use crate::error::{Result, ZFileError};
use crate::io::ContainerFile;
use parking_lot::Mutex;
use std::io::{self, Cursor, Read};

/// Raw (still compressed) payload of an entry
pub(crate) fn read_raw(entry: &StoredEntry, file: &Mutex<ContainerFile>) -> Result<Vec<u8>> {
    match &entry.source {
        EntrySource::Pending(bytes) => Ok(bytes.clone()),
        EntrySource::Disk => {
            let offset = entry
                .data_offset()
                .ok_or_else(|| ZFileError::corrupt_entry(entry.name(), "no payload on disk"))?;
            file.lock().read_vec(offset, entry.compressed_size() as usize)
        }
    }
}

/// Decompressed payload, checked against the recorded size and CRC-32
pub(crate) fn read_verified(entry: &StoredEntry, file: &Mutex<ContainerFile>) -> Result<Vec<u8>> {
    let raw = read_raw(entry, file)?;
    let data = decompress(&raw, entry.method(), entry.uncompressed_size())
        .map_err(|e| ZFileError::corrupt_entry(entry.name(), format!("cannot inflate: {}", e)))?;

    verify(entry.name(), entry.crc32(), entry.uncompressed_size(), &data)?;
    Ok(data)
}

fn verify(name: &str, expected_crc: u32, expected_size: u64, data: &[u8]) -> Result<()> {
    if data.len() as u64 != expected_size {
        return Err(ZFileError::corrupt_entry(
            name,
            format!(
                "size mismatch: expected {} bytes, got {}",
                expected_size,
                data.len()
            ),
        ));
    }

    let actual = crc32fast::hash(data);
    if actual != expected_crc {
        return Err(ZFileError::corrupt_entry(
            name,
            format!(
                "CRC-32 mismatch: expected {:08x}, got {:08x}",
                expected_crc, actual
            ),
        ));
    }

    Ok(())
}

/// Positioned reader over a range of the container file
struct RawPayload<'a> {
    file: &'a Mutex<ContainerFile>,
    offset: u64,
    remaining: u64,
}

impl Read for RawPayload<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = (buf.len() as u64).min(self.remaining) as usize;
        if n == 0 {
            return Ok(0);
        }

        self.file
            .lock()
            .read_at(self.offset, &mut buf[..n])
            .map_err(|e| match e {
                ZFileError::Io(err) => err,
                other => io::Error::other(other),
            })?;

        self.offset += n as u64;
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Streaming reader over an entry's uncompressed bytes
///
/// The CRC-32 and size are checked when the stream reaches its end; a
/// mismatch surfaces as an `InvalidData` I/O error wrapping
/// [`ZFileError::CorruptEntry`].
pub struct EntryReader<'a> {
    inner: Box<dyn Read + 'a>,
    hasher: crc32fast::Hasher,
    read: u64,
    name: String,
    expected_crc: u32,
    expected_size: u64,
    finished: bool,
}

impl<'a> EntryReader<'a> {
    pub(crate) fn new(entry: &StoredEntry, file: &'a Mutex<ContainerFile>) -> Result<Self> {
        let raw: Box<dyn Read + 'a> = match &entry.source {
            EntrySource::Pending(bytes) => Box::new(Cursor::new(bytes.clone())),
            EntrySource::Disk => {
                let offset = entry.data_offset().ok_or_else(|| {
                    ZFileError::corrupt_entry(entry.name(), "no payload on disk")
                })?;
                Box::new(RawPayload {
                    file,
                    offset,
                    remaining: entry.compressed_size(),
                })
            }
        };

        Ok(EntryReader {
            inner: compression::decoder(raw, entry.method()),
            hasher: crc32fast::Hasher::new(),
            read: 0,
            name: entry.name().to_string(),
            expected_crc: entry.crc32(),
            expected_size: entry.uncompressed_size(),
            finished: false,
        })
    }

    fn corrupt(&self, reason: String) -> io::Error {
        io::Error::new(
            io::ErrorKind::InvalidData,
            ZFileError::corrupt_entry(&self.name, reason),
        )
    }
}

impl Read for EntryReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.finished || buf.is_empty() {
            return Ok(0);
        }

        let n = self.inner.read(buf)?;
        if n == 0 {
            self.finished = true;

            if self.read != self.expected_size {
                return Err(self.corrupt(format!(
                    "size mismatch: expected {} bytes, got {}",
                    self.expected_size, self.read
                )));
            }

            let actual = self.hasher.clone().finalize();
            if actual != self.expected_crc {
                return Err(self.corrupt(format!(
                    "CRC-32 mismatch: expected {:08x}, got {:08x}",
                    self.expected_crc, actual
                )));
            }

            return Ok(0);
        }

        self.hasher.update(&buf[..n]);
        self.read += n as u64;

        if self.read > self.expected_size {
            self.finished = true;
            return Err(self.corrupt(format!(
                "entry longer than the recorded {} bytes",
                self.expected_size
            )));
        }

        Ok(n)
    }
}
