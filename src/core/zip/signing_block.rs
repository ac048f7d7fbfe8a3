//! Signing block placed between the last entry and the central directory
//!
//! Layout:
//!
//! ```text
//! u64   size of the block, excluding this field
//! pairs u64 length | u32 id | value   (length counts id + value)
//! u64   size of the block, excluding the first size field
//! [u8; 16] "APK Sig Block 42"
//! ```

use super::{le_u32, le_u64};
use crate::error::{Result, ZFileError};

/// Trailing magic of every signing block
pub const MAGIC: &[u8; 16] = b"APK Sig Block 42";

/// Bytes at the end of a block needed to learn its size (size field + magic)
pub const FOOTER_SIZE: usize = 24;

/// Smallest valid block: two size fields and the magic
pub const MIN_SIZE: usize = 8 + 8 + 16;

/// ID/value pairs of a signing block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SigningBlock {
    pairs: Vec<(u32, Vec<u8>)>,
}

impl SigningBlock {
    pub fn new() -> Self {
        SigningBlock::default()
    }

    /// Add or replace the value stored under `id`
    pub fn set(&mut self, id: u32, value: Vec<u8>) {
        match self.pairs.iter_mut().find(|(pair_id, _)| *pair_id == id) {
            Some(pair) => pair.1 = value,
            None => self.pairs.push((id, value)),
        }
    }

    pub fn get(&self, id: u32) -> Option<&[u8]> {
        self.pairs
            .iter()
            .find(|(pair_id, _)| *pair_id == id)
            .map(|(_, value)| value.as_slice())
    }

    pub fn pairs(&self) -> impl Iterator<Item = (u32, &[u8])> {
        self.pairs.iter().map(|(id, value)| (*id, value.as_slice()))
    }

    /// Total encoded size, both size fields and magic included
    pub fn encoded_len(&self) -> usize {
        let pairs: usize = self.pairs.iter().map(|(_, v)| 8 + 4 + v.len()).sum();
        MIN_SIZE + pairs
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let total = self.encoded_len();
        let size = (total - 8) as u64;
        let mut bytes = Vec::with_capacity(total);

        bytes.extend_from_slice(&size.to_le_bytes());
        for (id, value) in &self.pairs {
            bytes.extend_from_slice(&((4 + value.len()) as u64).to_le_bytes());
            bytes.extend_from_slice(&id.to_le_bytes());
            bytes.extend_from_slice(value);
        }
        bytes.extend_from_slice(&size.to_le_bytes());
        bytes.extend_from_slice(MAGIC);

        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let invalid =
            |reason: &str| ZFileError::CorruptContainer(format!("Signing block: {}", reason));

        if bytes.len() < MIN_SIZE {
            return Err(invalid("too short"));
        }
        if &bytes[bytes.len() - 16..] != MAGIC {
            return Err(invalid("bad magic"));
        }

        let expected = (bytes.len() - 8) as u64;
        let leading = le_u64(bytes, 0);
        let trailing = le_u64(bytes, bytes.len() - FOOTER_SIZE);
        if leading != expected || trailing != expected {
            return Err(invalid("size fields disagree"));
        }

        let pairs_end = bytes.len() - FOOTER_SIZE;
        let mut offset = 8;
        let mut pairs = Vec::new();

        while offset < pairs_end {
            if pairs_end - offset < 12 {
                return Err(invalid("truncated pair header"));
            }

            let length = le_u64(bytes, offset);
            if length < 4 || length > (pairs_end - offset - 8) as u64 {
                return Err(invalid("pair length out of range"));
            }

            let id = le_u32(bytes, offset + 8);
            let value_start = offset + 12;
            let value_end = offset + 8 + length as usize;
            pairs.push((id, bytes[value_start..value_end].to_vec()));
            offset = value_end;
        }

        Ok(SigningBlock { pairs })
    }

    /// Total block size announced by the 24 bytes preceding the directory
    ///
    /// Returns `None` if the footer does not end with the magic.
    pub fn size_from_footer(footer: &[u8]) -> Option<u64> {
        if footer.len() != FOOTER_SIZE || &footer[8..] != MAGIC {
            return None;
        }

        le_u64(footer, 0).checked_add(8)
    }
}
