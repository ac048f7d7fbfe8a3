//! Digest algorithms and the v1 digest policy

use super::keys::KeyKind;
use base64::{engine::general_purpose::STANDARD, Engine};
use ring::digest;

/// First platform level whose v1 verifier accepts SHA-256 with RSA and EC keys
pub const API_SHA_256_RSA_AND_ECDSA: u32 = 18;

/// First platform level whose v1 verifier accepts SHA-256 with every key type
pub const API_SHA_256_ALL_ALGORITHMS: u32 = 21;

/// Digest used in manifest and signature-file attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    Sha1,
    Sha256,
}

impl DigestAlgorithm {
    /// Strongest digest every platform at or above `min_sdk_version` verifies
    pub fn for_min_sdk(min_sdk_version: u32, key: KeyKind) -> Self {
        let cutover = match key {
            KeyKind::Rsa | KeyKind::Ec => API_SHA_256_RSA_AND_ECDSA,
            KeyKind::Dsa => API_SHA_256_ALL_ALGORITHMS,
        };

        if min_sdk_version < cutover {
            DigestAlgorithm::Sha1
        } else {
            DigestAlgorithm::Sha256
        }
    }

    /// Per-entry attribute name, e.g. `SHA-256-Digest`
    pub fn attribute_name(self) -> &'static str {
        match self {
            DigestAlgorithm::Sha1 => "SHA1-Digest",
            DigestAlgorithm::Sha256 => "SHA-256-Digest",
        }
    }

    /// Whole-manifest attribute name in the signature file
    pub fn manifest_attribute_name(self) -> &'static str {
        match self {
            DigestAlgorithm::Sha1 => "SHA1-Digest-Manifest",
            DigestAlgorithm::Sha256 => "SHA-256-Digest-Manifest",
        }
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        digest::digest(self.ring_algorithm(), data).as_ref().to_vec()
    }

    /// Digest as standard base64, the form used in manifests
    pub fn digest_base64(self, data: &[u8]) -> String {
        STANDARD.encode(digest::digest(self.ring_algorithm(), data).as_ref())
    }

    fn ring_algorithm(self) -> &'static digest::Algorithm {
        match self {
            DigestAlgorithm::Sha1 => &digest::SHA1_FOR_LEGACY_USE_ONLY,
            DigestAlgorithm::Sha256 => &digest::SHA256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digests() {
        assert_eq!(
            DigestAlgorithm::Sha1.digest_base64(b"useless text"),
            "OOQgIEXBissIvva3ydRoaXk29Rk="
        );
        assert_eq!(
            DigestAlgorithm::Sha256.digest_base64(b"abc"),
            "ungWv48Bz+pBQUDeXa4iI7ADYaOWF3qctBD/YfIAFa0="
        );
        assert_eq!(DigestAlgorithm::Sha1.digest(b"abc").len(), 20);
    }

    #[test]
    fn test_policy_cutovers() {
        use DigestAlgorithm::*;

        assert_eq!(DigestAlgorithm::for_min_sdk(1, KeyKind::Rsa), Sha1);
        assert_eq!(DigestAlgorithm::for_min_sdk(17, KeyKind::Ec), Sha1);
        assert_eq!(DigestAlgorithm::for_min_sdk(18, KeyKind::Rsa), Sha256);
        assert_eq!(DigestAlgorithm::for_min_sdk(18, KeyKind::Dsa), Sha1);
        assert_eq!(DigestAlgorithm::for_min_sdk(21, KeyKind::Dsa), Sha256);
    }

    #[test]
    fn test_attribute_names() {
        assert_eq!(DigestAlgorithm::Sha1.attribute_name(), "SHA1-Digest");
        assert_eq!(
            DigestAlgorithm::Sha256.manifest_attribute_name(),
            "SHA-256-Digest-Manifest"
        );
    }
}
