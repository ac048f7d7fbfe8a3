//! ZIP record layouts
//!
//! Byte-exact encoders and decoders for the three ZIP records the container
//! manages (local file header, central directory header, end of central
//! directory) plus the signing block that may sit in front of the central
//! directory. All multi-byte fields are little-endian.

pub mod central_dir;
pub mod dos_time;
pub mod eocd;
pub mod local;
pub mod signing_block;

pub use central_dir::CentralDirectoryHeader;
pub use dos_time::DosDateTime;
pub use eocd::EndOfCentralDirectory;
pub use local::LocalFileHeader;
pub use signing_block::SigningBlock;

/// General purpose flag: entry is encrypted
pub const FLAG_ENCRYPTED: u16 = 1;

/// General purpose flag: sizes and CRC follow the payload
pub const FLAG_DATA_DESCRIPTOR: u16 = 1 << 3;

/// General purpose flag: name is UTF-8
pub const FLAG_UTF8: u16 = 1 << 11;

/// Optional signature in front of a data descriptor
pub const DATA_DESCRIPTOR_SIGNATURE: u32 = 0x08074b50;

/// Version needed to extract a stored entry
pub const VERSION_STORED: u16 = 10;

/// Version needed to extract a deflated entry or a directory
pub const VERSION_DEFLATE: u16 = 20;

/// MS-DOS directory attribute
pub const DOS_DIRECTORY_ATTRIBUTE: u32 = 0x10;

pub(crate) fn le_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

pub(crate) fn le_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

pub(crate) fn le_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}
