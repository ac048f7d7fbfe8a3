//! Whole-file signing block (APK Signature Scheme v2)
//!
//! The block signs a chunked digest of everything except itself: the entry
//! region, the central directory and an EOCD whose directory offset points
//! at the end of the entries. It carries one signer:
//!
//! ```text
//! signers   = lp(lp(signer))
//! signer    = lp(signed_data) | lp(signatures) | lp(public key info)
//! signed    = lp(digests) | lp(lp(certificate)...) | lp(attributes)
//! digests   = (u32 len | u32 algorithm | lp(digest))...
//! ```
//!
//! `lp` is a little-endian u32 length prefix.

use super::keys::{KeyKind, SignatureDigest, SignerKey};
use super::pool::WorkerPool;
use crate::error::{Result, ZFileError};
use crate::extension::{ArchiveImage, EntryMutation, EntrySetView, ZFileExtension};
use crate::zip::signing_block::SigningBlock;
use rayon::prelude::*;
use ring::digest;
use std::sync::Arc;
use tracing::{debug, info};

/// Pair ID of the v2 signature inside the signing block
pub const V2_BLOCK_ID: u32 = 0x7109_871a;

/// Size of a digested chunk
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Largest RSA modulus signed with SHA-256
const RSA_SHA256_MAX_BITS: usize = 3072;

/// Chunked content digest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentDigest {
    ChunkedSha256,
    ChunkedSha512,
}

impl ContentDigest {
    pub fn id(self) -> u32 {
        match self {
            ContentDigest::ChunkedSha256 => 1,
            ContentDigest::ChunkedSha512 => 2,
        }
    }

    fn ring_algorithm(self) -> &'static digest::Algorithm {
        match self {
            ContentDigest::ChunkedSha256 => &digest::SHA256,
            ContentDigest::ChunkedSha512 => &digest::SHA512,
        }
    }

    fn chunk_digest(self, chunk: &[u8]) -> Vec<u8> {
        let mut ctx = digest::Context::new(self.ring_algorithm());
        ctx.update(&[0xa5]);
        ctx.update(&(chunk.len() as u32).to_le_bytes());
        ctx.update(chunk);
        ctx.finish().as_ref().to_vec()
    }

    /// Digest `segments` in 1 MiB chunks on `pool`
    ///
    /// Empty segments contribute no chunks. Chunk digests are combined in
    /// index order regardless of which worker produced them.
    pub fn compute(self, segments: &[&[u8]], pool: &WorkerPool) -> Vec<u8> {
        let chunks: Vec<&[u8]> = segments
            .iter()
            .flat_map(|segment| segment.chunks(CHUNK_SIZE))
            .collect();

        let digests: Vec<Vec<u8>> = pool.install(|| {
            chunks
                .par_iter()
                .map(|chunk| self.chunk_digest(chunk))
                .collect()
        });

        let mut ctx = digest::Context::new(self.ring_algorithm());
        ctx.update(&[0x5a]);
        ctx.update(&(digests.len() as u32).to_le_bytes());
        for chunk_digest in &digests {
            ctx.update(chunk_digest);
        }
        ctx.finish().as_ref().to_vec()
    }
}

/// Signature algorithm of the v2 signer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    RsaPkcs1V15Sha256,
    RsaPkcs1V15Sha512,
    EcdsaSha256,
}

impl SignatureAlgorithm {
    /// Pick the algorithm for `key`: SHA-512 only for RSA keys above 3072 bits
    pub fn for_key(key: &SignerKey) -> Result<Self> {
        match key.kind() {
            KeyKind::Rsa => match key.rsa_modulus_bits() {
                Some(bits) if bits <= RSA_SHA256_MAX_BITS => Ok(SignatureAlgorithm::RsaPkcs1V15Sha256),
                _ => Ok(SignatureAlgorithm::RsaPkcs1V15Sha512),
            },
            KeyKind::Ec => Ok(SignatureAlgorithm::EcdsaSha256),
            KeyKind::Dsa => Err(ZFileError::signing(
                "signing block",
                "v2",
                "DSA keys are not supported",
            )),
        }
    }

    pub fn id(self) -> u32 {
        match self {
            SignatureAlgorithm::RsaPkcs1V15Sha256 => 0x0103,
            SignatureAlgorithm::RsaPkcs1V15Sha512 => 0x0104,
            SignatureAlgorithm::EcdsaSha256 => 0x0201,
        }
    }

    pub fn content_digest(self) -> ContentDigest {
        match self {
            SignatureAlgorithm::RsaPkcs1V15Sha512 => ContentDigest::ChunkedSha512,
            _ => ContentDigest::ChunkedSha256,
        }
    }

    fn signature_digest(self) -> SignatureDigest {
        match self {
            SignatureAlgorithm::RsaPkcs1V15Sha512 => SignatureDigest::Sha512,
            _ => SignatureDigest::Sha256,
        }
    }
}

fn length_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

/// Sequence of `u32 len | u32 id | lp(value)` records
fn id_value_pairs(pairs: &[(u32, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    for (id, value) in pairs {
        out.extend_from_slice(&(8 + value.len() as u32).to_le_bytes());
        out.extend_from_slice(&id.to_le_bytes());
        length_prefixed(&mut out, value);
    }
    out
}

/// Build the v2 signature value for `segments`
pub fn sign_segments(key: &SignerKey, segments: &[&[u8]], pool: &WorkerPool) -> Result<Vec<u8>> {
    let algorithm = SignatureAlgorithm::for_key(key)?;
    let content_digest = algorithm.content_digest();
    let digest = content_digest.compute(segments, pool);

    let mut certificates = Vec::new();
    for cert in key.certificates() {
        length_prefixed(&mut certificates, cert);
    }

    let mut signed_data = Vec::new();
    length_prefixed(
        &mut signed_data,
        &id_value_pairs(&[(content_digest.id(), digest.as_slice())]),
    );
    length_prefixed(&mut signed_data, &certificates);
    length_prefixed(&mut signed_data, &[]);

    let signature = key.sign(algorithm.signature_digest(), &signed_data)?;
    key.verify(algorithm.signature_digest(), &signed_data, &signature)
        .map_err(|_| {
            ZFileError::signing(
                "signing block",
                format!("{:#06x}", algorithm.id()),
                "generated signature does not verify with the certificate",
            )
        })?;

    let mut signer = Vec::new();
    length_prefixed(&mut signer, &signed_data);
    length_prefixed(&mut signer, &id_value_pairs(&[(algorithm.id(), signature.as_slice())]));
    length_prefixed(&mut signer, key.public_key_info());

    let mut signers = Vec::new();
    length_prefixed(&mut signers, &signer);

    let mut value = Vec::new();
    length_prefixed(&mut value, &signers);
    Ok(value)
}

/// v2 signing extension
pub struct V2SigningExtension {
    key: Arc<SignerKey>,
    pool: WorkerPool,
}

impl V2SigningExtension {
    pub fn new(key: Arc<SignerKey>, pool: WorkerPool) -> Self {
        V2SigningExtension { key, pool }
    }

    /// Whether `block` holds a v2 signature by this signer
    fn carries_signer(&self, block: &[u8]) -> bool {
        let Ok(block) = SigningBlock::from_bytes(block) else {
            return false;
        };
        let needle = self.key.public_key_info();
        block
            .get(V2_BLOCK_ID)
            .map_or(false, |value| value.windows(needle.len()).any(|w| w == needle))
    }
}

impl ZFileExtension for V2SigningExtension {
    fn name(&self) -> &str {
        "v2-signing"
    }

    fn before_update(&mut self, view: &EntrySetView<'_>) -> Result<Vec<EntryMutation>> {
        let current = view.signing_block().map_or(false, |b| self.carries_signer(b));
        if current {
            return Ok(Vec::new());
        }

        debug!("Signing block missing or foreign, requesting a rewrite");
        Ok(vec![EntryMutation::InvalidateDirectory])
    }

    fn entries_written(&mut self, image: &ArchiveImage<'_>) -> Result<Option<Vec<u8>>> {
        let segments = [image.contents, image.central_directory, image.eocd];
        let value = sign_segments(&self.key, &segments, &self.pool)?;

        let mut block = SigningBlock::new();
        block.set(V2_BLOCK_ID, value);
        let bytes = block.to_bytes();

        info!(
            "Signed {} bytes of entries, signing block is {} bytes",
            image.entries_end(),
            bytes.len()
        );
        Ok(Some(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sign::keys::tests::{ec_key, rsa_key};

    fn pool() -> WorkerPool {
        WorkerPool::new(4).unwrap()
    }

    #[test]
    fn test_empty_input_digest() {
        // No chunks at all: H(0x5a | 0u32)
        let expected = digest::digest(&digest::SHA256, &[0x5a, 0, 0, 0, 0]);
        let empty: &[u8] = &[];
        assert_eq!(
            ContentDigest::ChunkedSha256.compute(&[empty, empty], &pool()),
            expected.as_ref()
        );
    }

    #[test]
    fn test_chunking_matches_sequential_digest() {
        let data: Vec<u8> = (0..CHUNK_SIZE * 2 + 17).map(|i| (i % 251) as u8).collect();
        let (a, b) = data.split_at(CHUNK_SIZE + 5);

        let mut top = vec![0x5a];
        top.extend_from_slice(&4u32.to_le_bytes());
        for chunk in a.chunks(CHUNK_SIZE).chain(b.chunks(CHUNK_SIZE)) {
            top.extend(ContentDigest::ChunkedSha256.chunk_digest(chunk));
        }
        let expected = digest::digest(&digest::SHA256, &top);

        assert_eq!(
            ContentDigest::ChunkedSha256.compute(&[a, b], &pool()),
            expected.as_ref()
        );
        assert_eq!(
            ContentDigest::ChunkedSha256.compute(&[a, b], &WorkerPool::new(1).unwrap()),
            expected.as_ref()
        );
    }

    #[test]
    fn test_algorithm_selection() {
        let rsa = SignatureAlgorithm::for_key(&rsa_key()).unwrap();
        assert_eq!(rsa.id(), 0x0103);
        assert_eq!(rsa.content_digest().id(), 1);

        let ec = SignatureAlgorithm::for_key(&ec_key()).unwrap();
        assert_eq!(ec.id(), 0x0201);
        assert_eq!(ec.content_digest(), ContentDigest::ChunkedSha256);
    }

    #[test]
    fn test_rsa_value_is_deterministic() {
        let key = rsa_key();
        let segments: [&[u8]; 3] = [b"entries", b"directory", b"eocd"];
        let first = sign_segments(&key, &segments, &pool()).unwrap();
        assert_eq!(first, sign_segments(&key, &segments, &pool()).unwrap());

        let changed: [&[u8]; 3] = [b"entries!", b"directory", b"eocd"];
        assert_ne!(first, sign_segments(&key, &changed, &pool()).unwrap());
    }

    #[test]
    fn test_value_layout() {
        let key = ec_key();
        let value = sign_segments(&key, &[b"abc".as_slice()], &pool()).unwrap();

        let u32_at = |at: usize| {
            u32::from_le_bytes([value[at], value[at + 1], value[at + 2], value[at + 3]]) as usize
        };

        // signers, then the single signer
        assert_eq!(u32_at(0), value.len() - 4);
        assert_eq!(u32_at(4), value.len() - 8);

        // signed data opens with the digest sequence: one SHA-256 record
        let signed_data_len = u32_at(8);
        assert_eq!(u32_at(12), 4 + 4 + 4 + 32);
        assert_eq!(u32_at(16), 8 + 32);
        assert_eq!(u32_at(20), 1);
        assert_eq!(u32_at(24), 32);

        // public key info closes the signer
        let spki = key.public_key_info();
        assert!(value.ends_with(spki));
        assert_eq!(u32_at(value.len() - spki.len() - 4), spki.len());
        assert!(signed_data_len > 40 + key.certificate().len());
    }
}
