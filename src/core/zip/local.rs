//! Local file header

use super::{le_u16, le_u32};
use crate::error::{Result, ZFileError};

/// Local file header preceding every entry payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFileHeader {
    pub version_needed: u16,
    pub flags: u16,
    pub method: u16,
    pub mod_time: u16,
    pub mod_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub name: Vec<u8>,
    pub extra: Vec<u8>,
}

impl LocalFileHeader {
    /// Local file header signature as u32
    pub const SIGNATURE: u32 = 0x04034b50;

    /// Size of the fixed part, signature included
    pub const FIXED_SIZE: usize = 30;

    /// Total encoded size
    pub fn encoded_len(&self) -> usize {
        Self::FIXED_SIZE + self.name.len() + self.extra.len()
    }

    /// Name and extra field length declared by a fixed header
    ///
    /// Only the first [`Self::FIXED_SIZE`] bytes are needed. Used to find the
    /// payload of an entry found through the central directory.
    pub fn variable_data_size(fixed: &[u8]) -> Result<usize> {
        if fixed.len() < Self::FIXED_SIZE || le_u32(fixed, 0) != Self::SIGNATURE {
            return Err(ZFileError::CorruptContainer(
                "Bad local file header signature".to_string(),
            ));
        }

        Ok(le_u16(fixed, 26) as usize + le_u16(fixed, 28) as usize)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.encoded_len());

        bytes.extend_from_slice(&Self::SIGNATURE.to_le_bytes());
        bytes.extend_from_slice(&self.version_needed.to_le_bytes());
        bytes.extend_from_slice(&self.flags.to_le_bytes());
        bytes.extend_from_slice(&self.method.to_le_bytes());
        bytes.extend_from_slice(&self.mod_time.to_le_bytes());
        bytes.extend_from_slice(&self.mod_date.to_le_bytes());
        bytes.extend_from_slice(&self.crc32.to_le_bytes());
        bytes.extend_from_slice(&self.compressed_size.to_le_bytes());
        bytes.extend_from_slice(&self.uncompressed_size.to_le_bytes());
        bytes.extend_from_slice(&(self.name.len() as u16).to_le_bytes());
        bytes.extend_from_slice(&(self.extra.len() as u16).to_le_bytes());
        bytes.extend_from_slice(&self.name);
        bytes.extend_from_slice(&self.extra);

        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let variable = Self::variable_data_size(bytes)?;
        if bytes.len() < Self::FIXED_SIZE + variable {
            return Err(ZFileError::CorruptContainer(
                "Truncated local file header".to_string(),
            ));
        }

        let name_len = le_u16(bytes, 26) as usize;
        let name_end = Self::FIXED_SIZE + name_len;

        Ok(LocalFileHeader {
            version_needed: le_u16(bytes, 4),
            flags: le_u16(bytes, 6),
            method: le_u16(bytes, 8),
            mod_time: le_u16(bytes, 10),
            mod_date: le_u16(bytes, 12),
            crc32: le_u32(bytes, 14),
            compressed_size: le_u32(bytes, 18),
            uncompressed_size: le_u32(bytes, 22),
            name: bytes[Self::FIXED_SIZE..name_end].to_vec(),
            extra: bytes[name_end..Self::FIXED_SIZE + variable].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> LocalFileHeader {
        LocalFileHeader {
            version_needed: 20,
            flags: 0,
            method: 8,
            mod_time: 0x0841,
            mod_date: 0x0221,
            crc32: 0xdeadbeef,
            compressed_size: 10,
            uncompressed_size: 20,
            name: b"res/raw/a.txt".to_vec(),
            extra: vec![0; 3],
        }
    }

    #[test]
    fn test_local_header_layout() {
        let header = sample();
        let bytes = header.to_bytes();

        assert_eq!(bytes.len(), 30 + 13 + 3);
        assert_eq!(&bytes[0..4], b"PK\x03\x04");
        assert_eq!(LocalFileHeader::variable_data_size(&bytes).unwrap(), 16);
        assert_eq!(LocalFileHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_bad_signature() {
        let mut bytes = sample().to_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            LocalFileHeader::from_bytes(&bytes),
            Err(ZFileError::CorruptContainer(_))
        ));
    }
}
