//! End of central directory record

use super::{le_u16, le_u32};
use crate::error::{Result, ZFileError};

/// End of central directory record
///
/// Always the last bytes of the archive, optionally followed by a comment.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EndOfCentralDirectory {
    pub disk_number: u16,
    pub central_dir_disk: u16,
    pub entries_on_disk: u16,
    pub entries_total: u16,
    pub central_dir_size: u32,
    pub central_dir_offset: u32,
    pub comment: Vec<u8>,
}

impl EndOfCentralDirectory {
    /// EOCD signature as u32
    pub const SIGNATURE: u32 = 0x06054b50;

    /// Size of the fixed part, signature included
    pub const FIXED_SIZE: usize = 22;

    /// Longest possible comment
    pub const MAX_COMMENT: usize = u16::MAX as usize;

    pub fn new(
        entries: u16,
        central_dir_size: u32,
        central_dir_offset: u32,
        comment: Vec<u8>,
    ) -> Self {
        EndOfCentralDirectory {
            disk_number: 0,
            central_dir_disk: 0,
            entries_on_disk: entries,
            entries_total: entries,
            central_dir_size,
            central_dir_offset,
            comment,
        }
    }

    pub fn encoded_len(&self) -> usize {
        Self::FIXED_SIZE + self.comment.len()
    }

    /// Check if any field holds a ZIP64 sentinel
    pub fn is_zip64(&self) -> bool {
        self.entries_total == u16::MAX
            || self.central_dir_offset == u32::MAX
            || self.central_dir_size == u32::MAX
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.encoded_len());

        bytes.extend_from_slice(&Self::SIGNATURE.to_le_bytes());
        bytes.extend_from_slice(&self.disk_number.to_le_bytes());
        bytes.extend_from_slice(&self.central_dir_disk.to_le_bytes());
        bytes.extend_from_slice(&self.entries_on_disk.to_le_bytes());
        bytes.extend_from_slice(&self.entries_total.to_le_bytes());
        bytes.extend_from_slice(&self.central_dir_size.to_le_bytes());
        bytes.extend_from_slice(&self.central_dir_offset.to_le_bytes());
        bytes.extend_from_slice(&(self.comment.len() as u16).to_le_bytes());
        bytes.extend_from_slice(&self.comment);

        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::FIXED_SIZE || le_u32(bytes, 0) != Self::SIGNATURE {
            return Err(ZFileError::CorruptContainer(
                "Bad end of central directory record".to_string(),
            ));
        }

        let comment_len = le_u16(bytes, 20) as usize;
        if bytes.len() < Self::FIXED_SIZE + comment_len {
            return Err(ZFileError::CorruptContainer(
                "Truncated archive comment".to_string(),
            ));
        }

        Ok(EndOfCentralDirectory {
            disk_number: le_u16(bytes, 4),
            central_dir_disk: le_u16(bytes, 6),
            entries_on_disk: le_u16(bytes, 8),
            entries_total: le_u16(bytes, 10),
            central_dir_size: le_u32(bytes, 12),
            central_dir_offset: le_u32(bytes, 16),
            comment: bytes[Self::FIXED_SIZE..Self::FIXED_SIZE + comment_len].to_vec(),
        })
    }

    /// Find the record inside the tail of an archive
    ///
    /// Scans backward for a signature whose declared comment ends exactly at
    /// the end of `tail`. Returns the offset of the record within `tail`.
    pub fn locate(tail: &[u8]) -> Option<usize> {
        if tail.len() < Self::FIXED_SIZE {
            return None;
        }

        let signature = Self::SIGNATURE.to_le_bytes();
        (0..=tail.len() - Self::FIXED_SIZE).rev().find(|&at| {
            tail[at..at + 4] == signature
                && at + Self::FIXED_SIZE + le_u16(tail, at + 20) as usize == tail.len()
        })
    }
}
