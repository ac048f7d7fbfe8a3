//! Signing extensions
//!
//! - [`v1`] - manifest, signature file and PKCS#7 block (JAR signing)
//! - [`v2`] - whole-file signing block in front of the central directory
//!
//! Both extensions take the signer key and a [`WorkerPool`] explicitly;
//! digests are computed on the pool's threads.

pub mod digest;
pub mod keys;
pub mod manifest;
pub mod pkcs7;
pub mod pool;
pub mod v1;
pub mod v2;

pub use digest::{DigestAlgorithm, API_SHA_256_ALL_ALGORITHMS, API_SHA_256_RSA_AND_ECDSA};
pub use keys::{KeyKind, SignatureDigest, SignerKey};
pub use manifest::{Manifest, MANIFEST_NAME};
pub use pool::WorkerPool;
pub use v1::{V1SignerConfig, V1SigningExtension};
pub use v2::{V2SigningExtension, V2_BLOCK_ID};
