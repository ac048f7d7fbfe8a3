//! Manifest and JAR signature generation
//!
//! Keeps `META-INF/MANIFEST.MF`, `META-INF/<SIGNER>.SF` and the PKCS#7
//! block `META-INF/<SIGNER>.<RSA|EC>` in step with the entry set. Each
//! before-update pass recomputes the three files and only asks for a
//! rewrite when bytes differ, so a second pass over its own output is a
//! no-op.

use super::digest::DigestAlgorithm;
use super::keys::{KeyKind, SignerKey};
use super::manifest::{Manifest, MANIFEST_NAME};
use super::pkcs7;
use super::pool::WorkerPool;
use crate::error::{Result, ZFileError};
use crate::extension::{EntryMutation, EntrySetView, ZFileExtension};
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

const META_INF: &str = "META-INF/";

/// Settings of the v1 signer
#[derive(Debug, Clone)]
pub struct V1SignerConfig {
    /// Base name of the `.SF` and block entries
    pub signer_name: String,
    /// `Created-By` of the manifest and the signature file
    pub created_by: String,
    /// `Built-By` of the manifest
    pub built_by: String,
    /// Announce v2 signing in the signature file (`X-Android-APK-Signed: 2`)
    pub apk_signed_v2: bool,
}

impl Default for V1SignerConfig {
    fn default() -> Self {
        V1SignerConfig {
            signer_name: "CERT".to_string(),
            created_by: "1.0 (Android)".to_string(),
            built_by: "zfile-rs".to_string(),
            apk_signed_v2: false,
        }
    }
}

/// Whether `name` is the manifest or a signature file of any signer
///
/// Only files directly inside `META-INF/` count; nested paths are signed
/// like any other entry.
pub fn is_signature_related(name: &str) -> bool {
    if name == MANIFEST_NAME {
        return true;
    }

    let Some(file) = name.strip_prefix(META_INF) else {
        return false;
    };
    if file.contains('/') {
        return false;
    }

    let upper = file.to_ascii_uppercase();
    upper.starts_with("SIG-")
        || [".SF", ".RSA", ".DSA", ".EC"]
            .iter()
            .any(|ext| upper.ends_with(ext))
}

/// Cached digest of one entry generation
#[derive(Debug, Clone)]
struct CachedDigest {
    generation: u64,
    algorithm: DigestAlgorithm,
    digest: String,
}

/// v1 (JAR) signing extension
pub struct V1SigningExtension {
    key: Arc<SignerKey>,
    config: V1SignerConfig,
    pool: WorkerPool,
    cache: HashMap<String, CachedDigest>,
}

impl V1SigningExtension {
    pub fn new(key: Arc<SignerKey>, config: V1SignerConfig, pool: WorkerPool) -> Self {
        V1SigningExtension {
            key,
            config,
            pool,
            cache: HashMap::new(),
        }
    }

    pub fn config(&self) -> &V1SignerConfig {
        &self.config
    }

    pub fn signature_file_name(&self) -> String {
        format!("{}{}.SF", META_INF, self.config.signer_name)
    }

    pub fn signature_block_name(&self) -> String {
        self.block_name(self.key.kind())
    }

    fn block_name(&self, kind: KeyKind) -> String {
        format!(
            "{}{}.{}",
            META_INF,
            self.config.signer_name,
            kind.block_extension()
        )
    }

    /// Digest every signed entry, reusing cached digests of unchanged entries
    fn entry_digests(
        &mut self,
        view: &EntrySetView<'_>,
        algorithm: DigestAlgorithm,
    ) -> Result<Vec<(String, String)>> {
        let cover_directories = view.options().cover_directories;
        let names: Vec<&str> = view
            .names()
            .into_iter()
            .filter(|name| !is_signature_related(name))
            .filter(|name| {
                cover_directories || view.get(name).map_or(false, |e| !e.is_directory())
            })
            .collect();

        let cache = &self.cache;
        let stale: Vec<(&str, u64)> = names
            .iter()
            .filter_map(|&name| {
                let generation = view.get(name)?.generation();
                match cache.get(name) {
                    Some(hit) if hit.generation == generation && hit.algorithm == algorithm => None,
                    _ => Some((name, generation)),
                }
            })
            .collect();

        if !stale.is_empty() {
            debug!("Digesting {} entries with {:?}", stale.len(), algorithm);
        }

        let fresh: Vec<(String, CachedDigest)> = self.pool.install(|| {
            stale
                .par_iter()
                .map(|&(name, generation)| {
                    let data = view.read(name)?;
                    Ok((
                        name.to_string(),
                        CachedDigest {
                            generation,
                            algorithm,
                            digest: algorithm.digest_base64(&data),
                        },
                    ))
                })
                .collect::<Result<Vec<_>>>()
        })?;
        self.cache.extend(fresh);
        self.cache.retain(|name, _| view.get(name).is_some());

        names
            .into_iter()
            .map(|name| {
                self.cache
                    .get(name)
                    .map(|hit| (name.to_string(), hit.digest.clone()))
                    .ok_or_else(|| ZFileError::EntryNotFound(name.to_string()))
            })
            .collect()
    }

    /// Existing manifest, or `None` when absent or unreadable
    fn existing_manifest(&self, view: &EntrySetView<'_>) -> Option<Manifest> {
        view.get(MANIFEST_NAME)?;
        match view.read(MANIFEST_NAME).and_then(|bytes| Manifest::parse(&bytes)) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                warn!("Ignoring unreadable {}: {}", MANIFEST_NAME, e);
                None
            }
        }
    }

    fn build_manifest(
        &self,
        existing: Option<&Manifest>,
        algorithm: DigestAlgorithm,
        digests: Vec<(String, String)>,
    ) -> Manifest {
        let mut manifest = Manifest::new();
        manifest.set_main_attribute("Manifest-Version", "1.0");
        manifest.set_main_attribute("Created-By", &self.config.created_by);
        manifest.set_main_attribute("Built-By", &self.config.built_by);

        if let Some(existing) = existing {
            for (name, value) in existing.main_attributes() {
                if manifest.main_attribute(name).is_none() {
                    manifest.set_main_attribute(name, value);
                }
            }
        }

        for (name, digest) in digests {
            manifest.set_section(&name, vec![(algorithm.attribute_name().to_string(), digest)]);
        }
        manifest
    }

    fn build_signature_file(&self, manifest: &Manifest, algorithm: DigestAlgorithm) -> Vec<u8> {
        let mut sf = Manifest::new();
        sf.set_main_attribute("Signature-Version", "1.0");
        sf.set_main_attribute("Created-By", &self.config.created_by);
        sf.set_main_attribute(
            algorithm.manifest_attribute_name(),
            &algorithm.digest_base64(&manifest.to_bytes()),
        );
        if self.config.apk_signed_v2 {
            sf.set_main_attribute("X-Android-APK-Signed", "2");
        }

        for (name, _) in manifest.sections() {
            if let Some(stanza) = manifest.section_bytes(name) {
                sf.set_section(
                    name,
                    vec![(
                        algorithm.attribute_name().to_string(),
                        algorithm.digest_base64(&stanza),
                    )],
                );
            }
        }
        sf.to_bytes()
    }
}

fn differs(view: &EntrySetView<'_>, name: &str, bytes: &[u8]) -> Result<bool> {
    match view.get(name) {
        Some(_) => Ok(view.read(name)? != bytes),
        None => Ok(true),
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

impl ZFileExtension for V1SigningExtension {
    fn name(&self) -> &str {
        "v1-signing"
    }

    fn before_update(&mut self, view: &EntrySetView<'_>) -> Result<Vec<EntryMutation>> {
        let algorithm = DigestAlgorithm::for_min_sdk(view.options().min_sdk_version, self.key.kind());
        let digests = self.entry_digests(view, algorithm)?;

        let existing = self.existing_manifest(view);
        let manifest = self.build_manifest(existing.as_ref(), algorithm, digests);
        let manifest_bytes = manifest.to_bytes();

        let sf_name = self.signature_file_name();
        let sf_bytes = self.build_signature_file(&manifest, algorithm);

        let mut mutations = Vec::new();

        if differs(view, MANIFEST_NAME, &manifest_bytes)? {
            debug!("Manifest changed ({} sections)", manifest.sections().count());
            mutations.push(EntryMutation::put(MANIFEST_NAME, manifest_bytes));
        }

        let sf_changed = differs(view, &sf_name, &sf_bytes)?;

        let block_name = self.signature_block_name();
        let block_current = match view.get(&block_name) {
            Some(_) => contains(&view.read(&block_name)?, self.key.certificate()),
            None => false,
        };

        if sf_changed || !block_current {
            let block = pkcs7::sign_detached(&self.key, &sf_bytes).map_err(|e| match e {
                ZFileError::SigningFailure {
                    algorithm, reason, ..
                } => ZFileError::signing(block_name.as_str(), algorithm, reason),
                other => other,
            })?;

            info!("Signing {} with {} key", sf_name, self.key.kind().name());
            if sf_changed {
                mutations.push(EntryMutation::put(sf_name.as_str(), sf_bytes));
            }
            mutations.push(EntryMutation::put(block_name.as_str(), block));
        }

        for kind in [KeyKind::Rsa, KeyKind::Ec, KeyKind::Dsa] {
            if kind == self.key.kind() {
                continue;
            }
            let stale = self.block_name(kind);
            if view.get(&stale).is_some() {
                warn!("Removing stale signature block {}", stale);
                mutations.push(EntryMutation::remove(stale));
            }
        }

        Ok(mutations)
    }

    fn on_close(&mut self) {
        self.cache.clear();
    }
}
