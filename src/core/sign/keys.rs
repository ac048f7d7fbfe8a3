//! Signing keys and certificates
//!
//! Private keys are PKCS#8 (or PKCS#1 for RSA), certificates X.509; both
//! may be PEM or DER. The first certificate must carry the public half of
//! the private key.

use crate::error::{Result, ZFileError};
use ring::rand::SystemRandom;
use ring::signature::{
    self, EcdsaKeyPair, KeyPair, RsaKeyPair, UnparsedPublicKey, VerificationAlgorithm,
};
use std::path::Path;
use x509_parser::prelude::*;

/// Key algorithm family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    Rsa,
    Ec,
    Dsa,
}

impl KeyKind {
    /// Extension of the v1 signature block entry (`CERT.RSA`, `CERT.EC`, ...)
    pub fn block_extension(self) -> &'static str {
        match self {
            KeyKind::Rsa => "RSA",
            KeyKind::Ec => "EC",
            KeyKind::Dsa => "DSA",
        }
    }

    pub fn name(self) -> &'static str {
        self.block_extension()
    }
}

/// Hash paired with the signature scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureDigest {
    Sha256,
    Sha512,
}

enum KeyPairKind {
    Rsa(RsaKeyPair),
    /// P-256 with SHA-256, ASN.1 encoded signatures
    EcdsaP256(EcdsaKeyPair),
}

/// Private key plus certificate chain
pub struct SignerKey {
    key_pair: KeyPairKind,
    certificates: Vec<Vec<u8>>,
    public_key_info: Vec<u8>,
    public_key_bits: Vec<u8>,
    issuer: Vec<u8>,
    serial: Vec<u8>,
    rng: SystemRandom,
}

fn key_error(reason: impl Into<String>) -> ZFileError {
    ZFileError::signing("signer key", "key loading", reason)
}

impl SignerKey {
    /// Load from a private key file and a certificate file (PEM or DER)
    pub fn from_files<P: AsRef<Path>, Q: AsRef<Path>>(private_key: P, certificates: Q) -> Result<Self> {
        let key = std::fs::read(private_key)?;
        let certs = std::fs::read(certificates)?;
        Self::from_pem(&key, &certs)
    }

    /// Load from PEM text; DER input is accepted as well
    pub fn from_pem(private_key: &[u8], certificates: &[u8]) -> Result<Self> {
        let (tag, key_der) = match ::pem::parse(private_key) {
            Ok(block) => (block.tag().to_string(), block.contents().to_vec()),
            Err(_) => ("PRIVATE KEY".to_string(), private_key.to_vec()),
        };

        let certs = match ::pem::parse_many(certificates) {
            Ok(blocks) if !blocks.is_empty() => blocks
                .into_iter()
                .filter(|block| block.tag() == "CERTIFICATE")
                .map(|block| block.contents().to_vec())
                .collect(),
            _ => vec![certificates.to_vec()],
        };

        let key_pair = match tag.as_str() {
            "RSA PRIVATE KEY" => KeyPairKind::Rsa(
                RsaKeyPair::from_der(&key_der)
                    .map_err(|e| key_error(format!("invalid PKCS#1 RSA key: {}", e)))?,
            ),
            "PRIVATE KEY" => Self::parse_pkcs8(&key_der)?,
            other => {
                return Err(key_error(format!("unsupported key format '{}'", other)));
            }
        };

        Self::new(key_pair, certs)
    }

    /// Load a DER PKCS#8 key with DER certificates, signing certificate first
    pub fn from_der(pkcs8: &[u8], certificates: Vec<Vec<u8>>) -> Result<Self> {
        Self::new(Self::parse_pkcs8(pkcs8)?, certificates)
    }

    fn parse_pkcs8(der: &[u8]) -> Result<KeyPairKind> {
        if let Ok(key) = RsaKeyPair::from_pkcs8(der) {
            return Ok(KeyPairKind::Rsa(key));
        }

        let rng = SystemRandom::new();
        EcdsaKeyPair::from_pkcs8(&signature::ECDSA_P256_SHA256_ASN1_SIGNING, der, &rng)
            .map(KeyPairKind::EcdsaP256)
            .map_err(|e| {
                key_error(format!(
                    "unsupported key (only RSA and EC P-256 can sign): {}",
                    e
                ))
            })
    }

    fn new(key_pair: KeyPairKind, certificates: Vec<Vec<u8>>) -> Result<Self> {
        let signing_cert = certificates
            .first()
            .ok_or_else(|| key_error("no certificate supplied"))?;

        let (_, cert) = X509Certificate::from_der(signing_cert)
            .map_err(|e| key_error(format!("invalid certificate: {}", e)))?;

        let spki = cert.public_key();
        let public_key_bits = spki.subject_public_key.data.to_vec();

        let own_public_key = match &key_pair {
            KeyPairKind::Rsa(key) => key.public_key().as_ref(),
            KeyPairKind::EcdsaP256(key) => key.public_key().as_ref(),
        };
        if own_public_key != public_key_bits.as_slice() {
            return Err(key_error(
                "certificate does not match the private key",
            ));
        }

        Ok(SignerKey {
            public_key_info: spki.raw.to_vec(),
            public_key_bits,
            issuer: cert.tbs_certificate.issuer.as_raw().to_vec(),
            serial: cert.tbs_certificate.raw_serial().to_vec(),
            key_pair,
            certificates,
            rng: SystemRandom::new(),
        })
    }

    pub fn kind(&self) -> KeyKind {
        match self.key_pair {
            KeyPairKind::Rsa(_) => KeyKind::Rsa,
            KeyPairKind::EcdsaP256(_) => KeyKind::Ec,
        }
    }

    /// Certificate chain as DER, signing certificate first
    pub fn certificates(&self) -> &[Vec<u8>] {
        &self.certificates
    }

    /// Signing certificate as DER
    pub fn certificate(&self) -> &[u8] {
        &self.certificates[0]
    }

    /// DER `SubjectPublicKeyInfo` of the signing certificate
    pub fn public_key_info(&self) -> &[u8] {
        &self.public_key_info
    }

    /// DER `Name` of the signing certificate's issuer
    pub fn issuer(&self) -> &[u8] {
        &self.issuer
    }

    /// Content octets of the signing certificate's serial number
    pub fn serial(&self) -> &[u8] {
        &self.serial
    }

    /// RSA modulus size in bits, `None` for EC keys
    pub fn rsa_modulus_bits(&self) -> Option<usize> {
        match &self.key_pair {
            KeyPairKind::Rsa(key) => Some(key.public().modulus_len() * 8),
            KeyPairKind::EcdsaP256(_) => None,
        }
    }

    /// Sign `message` (RSA PKCS#1 v1.5 or ECDSA)
    pub fn sign(&self, digest: SignatureDigest, message: &[u8]) -> Result<Vec<u8>> {
        let failed = |reason: String| ZFileError::signing("signature", self.kind().name(), reason);

        match (&self.key_pair, digest) {
            (KeyPairKind::Rsa(key), _) => {
                let padding: &'static dyn signature::RsaEncoding = match digest {
                    SignatureDigest::Sha256 => &signature::RSA_PKCS1_SHA256,
                    SignatureDigest::Sha512 => &signature::RSA_PKCS1_SHA512,
                };
                let mut sig = vec![0u8; key.public().modulus_len()];
                key.sign(padding, &self.rng, message, &mut sig)
                    .map_err(|e| failed(e.to_string()))?;
                Ok(sig)
            }
            (KeyPairKind::EcdsaP256(key), SignatureDigest::Sha256) => key
                .sign(&self.rng, message)
                .map(|sig| sig.as_ref().to_vec())
                .map_err(|e| failed(e.to_string())),
            (KeyPairKind::EcdsaP256(_), SignatureDigest::Sha512) => {
                Err(failed("P-256 keys sign with SHA-256 only".to_string()))
            }
        }
    }

    /// Check a signature against the certificate's public key
    pub fn verify(&self, digest: SignatureDigest, message: &[u8], sig: &[u8]) -> Result<()> {
        let algorithm: &'static dyn VerificationAlgorithm = match (self.kind(), digest) {
            (KeyKind::Rsa, SignatureDigest::Sha256) => &signature::RSA_PKCS1_2048_8192_SHA256,
            (KeyKind::Rsa, SignatureDigest::Sha512) => &signature::RSA_PKCS1_2048_8192_SHA512,
            _ => &signature::ECDSA_P256_SHA256_ASN1,
        };

        UnparsedPublicKey::new(algorithm, &self.public_key_bits)
            .verify(message, sig)
            .map_err(|_| {
                ZFileError::signing(
                    "signature",
                    self.kind().name(),
                    "signature does not verify with the certificate",
                )
            })
    }
}

impl std::fmt::Debug for SignerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignerKey")
            .field("kind", &self.kind())
            .field("certificates", &self.certificates.len())
            .finish()
    }
}
