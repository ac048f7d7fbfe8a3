//! PKCS#7 signature blocks for v1 signing
//!
//! Builds a detached `SignedData` over the signature file: no embedded
//! content, no authenticated attributes, the certificate chain and a single
//! `SignerInfo` identified by issuer and serial number.

use super::keys::{KeyKind, SignatureDigest, SignerKey};
use crate::error::{Result, ZFileError};
use simple_asn1::{oid, to_der, ASN1Block, ASN1Class, BigInt, BigUint, OID};

/// DER tag number of SEQUENCE
const TAG_SEQUENCE: u8 = 16;

fn algorithm_identifier(algorithm: OID, with_null: bool) -> ASN1Block {
    let mut fields = vec![ASN1Block::ObjectIdentifier(0, algorithm)];
    if with_null {
        fields.push(ASN1Block::Null(0));
    }
    ASN1Block::Sequence(0, fields)
}

/// Constructed element whose content is already DER
fn raw_constructed(class: ASN1Class, tag: u8, content: Vec<u8>) -> ASN1Block {
    ASN1Block::Unknown(class, true, 0, BigUint::from(tag), content)
}

fn encode(block: &ASN1Block, what: &str) -> Result<Vec<u8>> {
    to_der(block).map_err(|e| {
        ZFileError::signing("signature block", "PKCS#7", format!("cannot encode {}: {}", what, e))
    })
}

/// Detached PKCS#7 `SignedData` over `content`, signed with SHA-256
pub fn sign_detached(key: &SignerKey, content: &[u8]) -> Result<Vec<u8>> {
    let signature = key.sign(SignatureDigest::Sha256, content)?;
    key.verify(SignatureDigest::Sha256, content, &signature)?;

    let sha256 = oid!(2, 16, 840, 1, 101, 3, 4, 2, 1);
    let encryption_algorithm = match key.kind() {
        KeyKind::Rsa => algorithm_identifier(oid!(1, 2, 840, 113549, 1, 1, 1), true),
        KeyKind::Ec | KeyKind::Dsa => algorithm_identifier(oid!(1, 2, 840, 10045, 2, 1), false),
    };

    // IssuerAndSerialNumber keeps the certificate's issuer bytes verbatim
    let serial = encode(
        &ASN1Block::Integer(0, BigInt::from_signed_bytes_be(key.serial())),
        "serial number",
    )?;
    let mut issuer_and_serial = key.issuer().to_vec();
    issuer_and_serial.extend_from_slice(&serial);

    let signer_info = ASN1Block::Sequence(
        0,
        vec![
            ASN1Block::Integer(0, 1.into()),
            raw_constructed(ASN1Class::Universal, TAG_SEQUENCE, issuer_and_serial),
            algorithm_identifier(sha256.clone(), true),
            encryption_algorithm,
            ASN1Block::OctetString(0, signature),
        ],
    );

    let certificates: Vec<u8> = key.certificates().concat();

    let signed_data = ASN1Block::Sequence(
        0,
        vec![
            ASN1Block::Integer(0, 1.into()),
            ASN1Block::Set(0, vec![algorithm_identifier(sha256, true)]),
            ASN1Block::Sequence(
                0,
                vec![ASN1Block::ObjectIdentifier(
                    0,
                    oid!(1, 2, 840, 113549, 1, 7, 1),
                )],
            ),
            // certificates [0] IMPLICIT SET OF Certificate
            raw_constructed(ASN1Class::ContextSpecific, 0, certificates),
            ASN1Block::Set(0, vec![signer_info]),
        ],
    );

    let content_info = ASN1Block::Sequence(
        0,
        vec![
            ASN1Block::ObjectIdentifier(0, oid!(1, 2, 840, 113549, 1, 7, 2)),
            ASN1Block::Explicit(
                ASN1Class::ContextSpecific,
                0,
                BigUint::from(0u8),
                Box::new(signed_data),
            ),
        ],
    );

    encode(&content_info, "SignedData")
}
