//! Container configuration
//!
//! Options are plain data so they can be built in code or loaded from TOML:
//!
//! ```toml
//! compression = "deflate"
//! compression_level = 9
//! min_sdk_version = 21
//!
//! [alignment]
//! kind = "per_extension"
//! default = 4
//!
//! [alignment.rules]
//! ".so" = 4096
//! ```

use crate::compression::{CompressionConfig, CompressionMethod};
use crate::error::{Result, ZFileError};
use crate::zip::DosDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Default bound on before-update passes
pub const DEFAULT_MAX_FIXPOINT_PASSES: usize = 16;

/// Payload alignment of stored entries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlignmentRule {
    /// Entries go wherever they fit
    #[default]
    None,
    /// Every stored payload starts on a multiple of `alignment`
    Constant { alignment: u64 },
    /// Alignment chosen by name suffix, `default` otherwise
    PerExtension {
        default: u64,
        rules: BTreeMap<String, u64>,
    },
}

impl AlignmentRule {
    /// The layout used for Android packages: 4 bytes, 4 KiB for native libraries
    pub fn android() -> Self {
        let mut rules = BTreeMap::new();
        rules.insert(".so".to_string(), 4096);
        AlignmentRule::PerExtension { default: 4, rules }
    }

    /// Alignment required for the payload of `name`
    pub fn alignment_for(&self, name: &str) -> u64 {
        match self {
            AlignmentRule::None => 1,
            AlignmentRule::Constant { alignment } => *alignment,
            AlignmentRule::PerExtension { default, rules } => rules
                .iter()
                .filter(|(suffix, _)| name.ends_with(suffix.as_str()))
                .max_by_key(|(suffix, _)| suffix.len())
                .map(|(_, alignment)| *alignment)
                .unwrap_or(*default),
        }
    }

    fn values(&self) -> Vec<u64> {
        match self {
            AlignmentRule::None => Vec::new(),
            AlignmentRule::Constant { alignment } => vec![*alignment],
            AlignmentRule::PerExtension { default, rules } => {
                std::iter::once(*default).chain(rules.values().copied()).collect()
            }
        }
    }
}

/// Options for one container session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZFileOptions {
    /// Payload alignment of stored entries
    pub alignment: AlignmentRule,

    /// Method used by `put` when the caller does not pick one
    pub compression: CompressionMethod,

    /// DEFLATE level (0-9)
    pub compression_level: u32,

    /// Whether directory entries are listed in the v1 manifest
    pub cover_directories: bool,

    /// Minimum platform level; selects SHA-1 or SHA-256 for v1 digests
    pub min_sdk_version: u32,

    /// Stamp new entries with the current time instead of a fixed one
    pub keep_timestamps: bool,

    /// Move trailing entries into holes before writing the directory
    pub compact_on_update: bool,

    /// Bound on before-update passes before giving up
    pub max_fixpoint_passes: usize,
}

impl Default for ZFileOptions {
    fn default() -> Self {
        ZFileOptions {
            alignment: AlignmentRule::None,
            compression: CompressionMethod::Deflate,
            compression_level: 6,
            cover_directories: false,
            min_sdk_version: 1,
            keep_timestamps: false,
            compact_on_update: true,
            max_fixpoint_passes: DEFAULT_MAX_FIXPOINT_PASSES,
        }
    }
}

impl ZFileOptions {
    /// Parse and validate options from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let options: ZFileOptions = toml::from_str(text)?;
        options.validate()?;
        Ok(options)
    }

    /// Parse and validate options from a TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Serialize to TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| ZFileError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        for alignment in self.alignment.values() {
            if alignment == 0 || !alignment.is_power_of_two() || alignment > 65536 {
                return Err(ZFileError::Config(format!(
                    "Alignment {} must be a power of two between 1 and 65536",
                    alignment
                )));
            }
        }

        if self.compression_level > 9 {
            return Err(ZFileError::Config(format!(
                "Compression level {} out of range 0-9",
                self.compression_level
            )));
        }

        if self.max_fixpoint_passes == 0 {
            return Err(ZFileError::Config(
                "max_fixpoint_passes must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Compression settings for a `put` with the given method
    pub fn compression_config(&self, method: CompressionMethod) -> CompressionConfig {
        match method {
            CompressionMethod::Stored => CompressionConfig::stored(),
            CompressionMethod::Deflate => CompressionConfig::deflate(self.compression_level),
        }
    }

    /// Timestamp for a newly written entry
    pub fn entry_timestamp(&self) -> DosDateTime {
        if self.keep_timestamps {
            DosDateTime::now()
        } else {
            DosDateTime::fixed()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let options = ZFileOptions::default();
        options.validate().unwrap();
        assert_eq!(options.alignment.alignment_for("lib/x86/libfoo.so"), 1);
        assert_eq!(options.entry_timestamp(), DosDateTime::fixed());
    }

    #[test]
    fn test_android_alignment() {
        let rule = AlignmentRule::android();
        assert_eq!(rule.alignment_for("lib/arm64-v8a/libfoo.so"), 4096);
        assert_eq!(rule.alignment_for("res/raw/data.bin"), 4);
    }

    #[test]
    fn test_longest_suffix_wins() {
        let mut rules = BTreeMap::new();
        rules.insert(".so".to_string(), 4096);
        rules.insert(".debug.so".to_string(), 16);
        let rule = AlignmentRule::PerExtension { default: 1, rules };

        assert_eq!(rule.alignment_for("libfoo.debug.so"), 16);
        assert_eq!(rule.alignment_for("libfoo.so"), 4096);
    }

    #[test]
    fn test_load_from_toml() {
        let options = ZFileOptions::from_toml_str(
            r#"
            compression = "stored"
            min_sdk_version = 24
            cover_directories = true

            [alignment]
            kind = "per_extension"
            default = 4

            [alignment.rules]
            ".so" = 4096
            "#,
        )
        .unwrap();

        assert_eq!(options.compression, CompressionMethod::Stored);
        assert_eq!(options.min_sdk_version, 24);
        assert!(options.cover_directories);
        assert_eq!(options.alignment, AlignmentRule::android());
        assert_eq!(options.max_fixpoint_passes, DEFAULT_MAX_FIXPOINT_PASSES);
    }

    #[test]
    fn test_toml_round_trip() {
        let options = ZFileOptions {
            alignment: AlignmentRule::Constant { alignment: 16 },
            ..Default::default()
        };
        let text = options.to_toml_string().unwrap();
        assert_eq!(ZFileOptions::from_toml_str(&text).unwrap(), options);
    }

    #[test]
    fn test_rejects_bad_alignment() {
        let result = ZFileOptions::from_toml_str(
            r#"
            [alignment]
            kind = "constant"
            alignment = 3
            "#,
        );
        assert!(matches!(result, Err(ZFileError::Config(_))));
    }
}
