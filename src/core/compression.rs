//! Entry payload compression
//!
//! ZIP entries are either stored verbatim or raw-DEFLATE compressed (no zlib
//! header). Writes compress once at `put` time; reads decompress lazily.
//!
//! **Design**:
//! - Compression threshold: data below `threshold` bytes is stored
//! - Fallback: store uncompressed if the DEFLATE ratio is not below `min_ratio`
//! - Directories are always stored empty

use crate::error::Result;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// ZIP compression method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u16)]
pub enum CompressionMethod {
    /// Method 0
    Stored = 0,
    /// Method 8, raw DEFLATE
    Deflate = 8,
}

impl CompressionMethod {
    /// Convert from the ZIP method field
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(CompressionMethod::Stored),
            8 => Some(CompressionMethod::Deflate),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Compression configuration
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Preferred method
    pub method: CompressionMethod,

    /// DEFLATE level (0-9)
    pub level: u32,

    /// Minimum size to compress (bytes)
    pub threshold: usize,

    /// Compressed output is kept only if `compressed / original < min_ratio`
    pub min_ratio: f32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        CompressionConfig {
            method: CompressionMethod::Deflate,
            level: 6,
            threshold: 0,
            min_ratio: 1.0,
        }
    }
}

impl CompressionConfig {
    /// Store everything
    pub fn stored() -> Self {
        CompressionConfig {
            method: CompressionMethod::Stored,
            threshold: usize::MAX,
            min_ratio: 0.0,
            ..Default::default()
        }
    }

    pub fn deflate(level: u32) -> Self {
        CompressionConfig {
            level: level.min(9),
            ..Default::default()
        }
    }
}

/// Compress data using the specified method
pub fn compress(data: &[u8], method: CompressionMethod, level: u32) -> Result<Vec<u8>> {
    match method {
        CompressionMethod::Stored => Ok(data.to_vec()),
        CompressionMethod::Deflate => {
            let mut encoder = DeflateEncoder::new(
                Vec::with_capacity(data.len() / 2 + 16),
                Compression::new(level.min(9)),
            );
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
    }
}

/// Decompress a whole payload
///
/// `expected_len` is the uncompressed size recorded in the directory; it only
/// sizes the output buffer, verification happens in the caller.
pub fn decompress(data: &[u8], method: CompressionMethod, expected_len: u64) -> Result<Vec<u8>> {
    match method {
        CompressionMethod::Stored => Ok(data.to_vec()),
        CompressionMethod::Deflate => {
            let mut out = Vec::with_capacity(expected_len.min(64 * 1024 * 1024) as usize);
            DeflateDecoder::new(data).read_to_end(&mut out)?;
            Ok(out)
        }
    }
}

/// Wrap a raw payload reader in the matching decoder
pub fn decoder<'a, R: Read + 'a>(raw: R, method: CompressionMethod) -> Box<dyn Read + 'a> {
    match method {
        CompressionMethod::Stored => Box::new(raw),
        CompressionMethod::Deflate => Box::new(DeflateDecoder::new(raw)),
    }
}

/// Compress data if beneficial, returns (data, method_used)
pub fn compress_if_beneficial(
    data: &[u8],
    config: &CompressionConfig,
) -> Result<(Vec<u8>, CompressionMethod)> {
    if data.len() < config.threshold || data.is_empty() {
        return Ok((data.to_vec(), CompressionMethod::Stored));
    }

    if matches!(config.method, CompressionMethod::Stored) {
        return Ok((data.to_vec(), CompressionMethod::Stored));
    }

    let compressed = compress(data, config.method, config.level)?;

    let ratio = compressed.len() as f32 / data.len() as f32;
    if ratio < config.min_ratio {
        Ok((compressed, config.method))
    } else {
        Ok((data.to_vec(), CompressionMethod::Stored))
    }
}
