//! # zfile-rs - Incrementally Updated ZIP Containers
//!
//! `zfile-rs` edits ZIP files in place. Entries can be added, replaced and
//! removed without rewriting the rest of the archive; the container keeps an
//! extent map of the file and only writes what changed.
//!
//! - **Incremental updates**: untouched entries stay where they are
//! - **Alignment** of stored payloads (e.g. `.so` files on 4 KiB boundaries)
//! - **Extensions** that take part in every update through hooks
//! - **Signing**: JAR (v1) manifests and signatures, and the v2 signing block
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use zfile_rs::{Result, ZFile, ZFileOptions};
//!
//! # fn main() -> Result<()> {
//! let mut zfile = ZFile::open("app.zip", ZFileOptions::default())?;
//!
//! zfile.put("assets/readme.txt", b"Hello, World!", None)?;
//! zfile.remove("assets/old.txt")?;
//!
//! // Nothing touches the disk until update() or close()
//! zfile.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Signing
//!
//! ```rust,no_run
//! use zfile_rs::{Result, SignerKey, ZFileBuilder, ZFileOptions};
//!
//! # fn main() -> Result<()> {
//! let key = SignerKey::from_files("release.pk8.pem", "release.x509.pem")?;
//!
//! let mut zfile = ZFileBuilder::new()
//!     .options(ZFileOptions::from_toml_file("zfile.toml")?)
//!     .signer(key)
//!     .open("app.apk")?;
//!
//! zfile.put("classes.dex", &std::fs::read("build/classes.dex")?, None)?;
//! zfile.close()?;
//! # Ok(())
//! # }
//! ```

pub mod core;

// Re-export core modules internally so crate:: paths in core still work
#[allow(unused_imports)]
pub(crate) use self::core::{
    allocator, compression, entry, error, extension, io, options, reader, sign, zfile, zip,
};

pub use crate::core::{
    allocator::{Extent, ExtentMap, Placement},
    compression::CompressionMethod,
    entry::{EntryId, EntryKind, StoredEntry},
    error::{Result, ZFileError},
    extension::{ArchiveImage, EntryMutation, EntrySetView, ZFileExtension},
    options::{AlignmentRule, ZFileOptions},
    reader::EntryReader,
    sign::{
        DigestAlgorithm, KeyKind, SignerKey, V1SignerConfig, V1SigningExtension,
        V2SigningExtension, WorkerPool,
    },
    zfile::{ZFile, ZFileStats},
    zip::DosDateTime,
};

use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Builder for opening a container with signing extensions attached
///
/// # Examples
///
/// ```rust,no_run
/// use zfile_rs::{SignerKey, WorkerPool, ZFileBuilder};
///
/// # fn main() -> zfile_rs::Result<()> {
/// let zfile = ZFileBuilder::new()
///     .signer(SignerKey::from_files("key.pk8", "cert.x509.pem")?)
///     .sign_v2(false)
///     .pool(WorkerPool::new(4)?)
///     .open("app.apk")?;
/// # Ok(())
/// # }
/// ```
pub struct ZFileBuilder {
    options: ZFileOptions,
    key: Option<Arc<SignerKey>>,
    v1_config: V1SignerConfig,
    sign_v1: bool,
    sign_v2: bool,
    pool: Option<WorkerPool>,
}

impl ZFileBuilder {
    /// Create a builder with default options and no signer
    pub fn new() -> Self {
        ZFileBuilder {
            options: ZFileOptions::default(),
            key: None,
            v1_config: V1SignerConfig::default(),
            sign_v1: true,
            sign_v2: true,
            pool: None,
        }
    }

    /// Set the container options
    pub fn options(mut self, options: ZFileOptions) -> Self {
        self.options = options;
        self
    }

    /// Sign with `key` (v1 and v2 unless disabled)
    pub fn signer(mut self, key: SignerKey) -> Self {
        self.key = Some(Arc::new(key));
        self
    }

    /// Share a key already used by other containers
    pub fn shared_signer(mut self, key: Arc<SignerKey>) -> Self {
        self.key = Some(key);
        self
    }

    /// Manifest and signature file settings
    pub fn v1_config(mut self, config: V1SignerConfig) -> Self {
        self.v1_config = config;
        self
    }

    pub fn sign_v1(mut self, enabled: bool) -> Self {
        self.sign_v1 = enabled;
        self
    }

    pub fn sign_v2(mut self, enabled: bool) -> Self {
        self.sign_v2 = enabled;
        self
    }

    /// Worker pool for digests (defaults to one thread per CPU)
    pub fn pool(mut self, pool: WorkerPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Open the container and register the signing extensions
    pub fn open<P: AsRef<Path>>(self, path: P) -> Result<ZFile> {
        let mut zfile = ZFile::open(path, self.options)?;

        let Some(key) = self.key else {
            return Ok(zfile);
        };

        let pool = match self.pool {
            Some(pool) => pool,
            None => WorkerPool::new(0)?,
        };
        debug!("Digest pool has {} threads", pool.threads());

        info!(
            "Signing {} with {} key (v1: {}, v2: {})",
            zfile.path().display(),
            key.kind().name(),
            self.sign_v1,
            self.sign_v2
        );

        if self.sign_v1 {
            let mut config = self.v1_config;
            config.apk_signed_v2 |= self.sign_v2;
            zfile.add_extension(Box::new(V1SigningExtension::new(
                Arc::clone(&key),
                config,
                pool.clone(),
            )));
        }

        if self.sign_v2 {
            zfile.add_extension(Box::new(V2SigningExtension::new(key, pool)));
        }

        Ok(zfile)
    }
}

impl Default for ZFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}
