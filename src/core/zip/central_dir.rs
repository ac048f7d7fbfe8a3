//! Central directory file header

use super::{le_u16, le_u32};
use crate::error::{Result, ZFileError};

/// One record of the central directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CentralDirectoryHeader {
    pub version_made_by: u16,
    pub version_needed: u16,
    pub flags: u16,
    pub method: u16,
    pub mod_time: u16,
    pub mod_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub disk_number_start: u16,
    pub internal_attributes: u16,
    pub external_attributes: u32,
    pub local_header_offset: u32,
    pub name: Vec<u8>,
    pub extra: Vec<u8>,
    pub comment: Vec<u8>,
}

impl CentralDirectoryHeader {
    /// Central directory header signature as u32
    pub const SIGNATURE: u32 = 0x02014b50;

    /// Size of the fixed part, signature included
    pub const FIXED_SIZE: usize = 46;

    pub fn encoded_len(&self) -> usize {
        Self::FIXED_SIZE + self.name.len() + self.extra.len() + self.comment.len()
    }

    /// Check if any field holds a ZIP64 sentinel
    pub fn is_zip64(&self) -> bool {
        self.compressed_size == u32::MAX
            || self.uncompressed_size == u32::MAX
            || self.local_header_offset == u32::MAX
    }

    /// Append the encoded record
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&Self::SIGNATURE.to_le_bytes());
        out.extend_from_slice(&self.version_made_by.to_le_bytes());
        out.extend_from_slice(&self.version_needed.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.method.to_le_bytes());
        out.extend_from_slice(&self.mod_time.to_le_bytes());
        out.extend_from_slice(&self.mod_date.to_le_bytes());
        out.extend_from_slice(&self.crc32.to_le_bytes());
        out.extend_from_slice(&self.compressed_size.to_le_bytes());
        out.extend_from_slice(&self.uncompressed_size.to_le_bytes());
        out.extend_from_slice(&(self.name.len() as u16).to_le_bytes());
        out.extend_from_slice(&(self.extra.len() as u16).to_le_bytes());
        out.extend_from_slice(&(self.comment.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.disk_number_start.to_le_bytes());
        out.extend_from_slice(&self.internal_attributes.to_le_bytes());
        out.extend_from_slice(&self.external_attributes.to_le_bytes());
        out.extend_from_slice(&self.local_header_offset.to_le_bytes());
        out.extend_from_slice(&self.name);
        out.extend_from_slice(&self.extra);
        out.extend_from_slice(&self.comment);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.encoded_len());
        self.write_to(&mut bytes);
        bytes
    }

    /// Decode one record at the start of `bytes`
    ///
    /// Returns the record and the number of bytes it occupies.
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, usize)> {
        if bytes.len() < Self::FIXED_SIZE {
            return Err(ZFileError::CorruptContainer(
                "Truncated central directory header".to_string(),
            ));
        }
        if le_u32(bytes, 0) != Self::SIGNATURE {
            return Err(ZFileError::CorruptContainer(
                "Bad central directory header signature".to_string(),
            ));
        }

        let name_len = le_u16(bytes, 28) as usize;
        let extra_len = le_u16(bytes, 30) as usize;
        let comment_len = le_u16(bytes, 32) as usize;
        let total = Self::FIXED_SIZE + name_len + extra_len + comment_len;
        if bytes.len() < total {
            return Err(ZFileError::CorruptContainer(
                "Central directory header runs past the directory".to_string(),
            ));
        }

        let name_end = Self::FIXED_SIZE + name_len;
        let extra_end = name_end + extra_len;

        let header = CentralDirectoryHeader {
            version_made_by: le_u16(bytes, 4),
            version_needed: le_u16(bytes, 6),
            flags: le_u16(bytes, 8),
            method: le_u16(bytes, 10),
            mod_time: le_u16(bytes, 12),
            mod_date: le_u16(bytes, 14),
            crc32: le_u32(bytes, 16),
            compressed_size: le_u32(bytes, 20),
            uncompressed_size: le_u32(bytes, 24),
            disk_number_start: le_u16(bytes, 34),
            internal_attributes: le_u16(bytes, 36),
            external_attributes: le_u32(bytes, 38),
            local_header_offset: le_u32(bytes, 42),
            name: bytes[Self::FIXED_SIZE..name_end].to_vec(),
            extra: bytes[name_end..extra_end].to_vec(),
            comment: bytes[extra_end..total].to_vec(),
        };

        Ok((header, total))
    }
}
