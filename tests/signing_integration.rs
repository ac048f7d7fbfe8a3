//! Integration tests for v1 and v2 signing

use std::path::{Path, PathBuf};
use tempfile::TempDir;
use zfile_rs::core::sign::{Manifest, SignatureDigest, V2_BLOCK_ID};
use zfile_rs::core::zip::SigningBlock;
use zfile_rs::{DigestAlgorithm, SignerKey, WorkerPool, ZFile, ZFileBuilder, ZFileOptions};

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn rsa_key() -> SignerKey {
    SignerKey::from_files(fixture("rsa-2048.pk8.pem"), fixture("rsa-2048.x509.pem")).unwrap()
}

fn ec_key() -> SignerKey {
    SignerKey::from_files(fixture("ec-p256.pk8.pem"), fixture("ec-p256.x509.pem")).unwrap()
}

fn signed(path: &Path, key: SignerKey) -> ZFile {
    ZFileBuilder::new()
        .signer(key)
        .pool(WorkerPool::new(2).unwrap())
        .open(path)
        .unwrap()
}

/// Split `u32le len | bytes` off the front of `data`
fn take_prefixed<'a>(data: &mut &'a [u8]) -> &'a [u8] {
    let len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let (value, rest) = data[4..].split_at(len);
    *data = rest;
    value
}

fn read_u32(data: &mut &[u8]) -> u32 {
    let value = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    *data = &data[4..];
    value
}

/// Chunked SHA-256 over the given segments, computed sequentially
fn chunked_sha256(segments: &[&[u8]]) -> Vec<u8> {
    let mut count = 0u32;
    let mut top = Vec::new();
    for segment in segments {
        for chunk in segment.chunks(1024 * 1024) {
            let mut input = vec![0xa5];
            input.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
            input.extend_from_slice(chunk);
            top.extend_from_slice(ring::digest::digest(&ring::digest::SHA256, &input).as_ref());
            count += 1;
        }
    }

    let mut input = vec![0x5a];
    input.extend_from_slice(&count.to_le_bytes());
    input.extend_from_slice(&top);
    ring::digest::digest(&ring::digest::SHA256, &input)
        .as_ref()
        .to_vec()
}

#[test]
fn test_manifest_contents() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("m.apk");

    let mut zfile = signed(&path, rsa_key());
    zfile.put("directory/file", b"useless text", None).unwrap();
    zfile.close().unwrap();

    let zfile = ZFile::open(&path, ZFileOptions::default()).unwrap();
    let manifest = zfile.read("META-INF/MANIFEST.MF").unwrap();
    assert_eq!(
        String::from_utf8(manifest).unwrap(),
        "Manifest-Version: 1.0\r\n\
         Created-By: 1.0 (Android)\r\n\
         Built-By: zfile-rs\r\n\
         \r\n\
         Name: directory/file\r\n\
         SHA1-Digest: OOQgIEXBissIvva3ydRoaXk29Rk=\r\n\
         \r\n"
    );
}

#[test]
fn test_signature_file_contents() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sf.apk");

    let mut zfile = signed(&path, rsa_key());
    zfile.put("directory/file", b"useless text", None).unwrap();
    zfile.put("other.txt", b"more text", None).unwrap();
    zfile.close().unwrap();

    let zfile = ZFile::open(&path, ZFileOptions::default()).unwrap();
    let manifest_bytes = zfile.read("META-INF/MANIFEST.MF").unwrap();
    let manifest = Manifest::parse(&manifest_bytes).unwrap();
    let sf = Manifest::parse(&zfile.read("META-INF/CERT.SF").unwrap()).unwrap();

    assert_eq!(sf.main_attribute("Signature-Version"), Some("1.0"));
    assert_eq!(sf.main_attribute("Created-By"), Some("1.0 (Android)"));
    assert_eq!(sf.main_attribute("X-Android-APK-Signed"), Some("2"));
    assert_eq!(
        sf.main_attribute("SHA1-Digest-Manifest").unwrap(),
        DigestAlgorithm::Sha1.digest_base64(&manifest_bytes)
    );

    assert_eq!(sf.sections().count(), 2);
    for (name, attributes) in sf.sections() {
        let stanza = manifest.section_bytes(name).unwrap();
        assert_eq!(attributes[0].0, "SHA1-Digest");
        assert_eq!(attributes[0].1, DigestAlgorithm::Sha1.digest_base64(&stanza));
    }

    let block = zfile.read("META-INF/CERT.RSA").unwrap();
    assert_eq!(block[0], 0x30);
}

#[test]
fn test_modern_min_sdk_uses_sha256() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sha256.apk");
    let options = ZFileOptions {
        min_sdk_version: 24,
        ..Default::default()
    };

    let mut zfile = ZFileBuilder::new()
        .options(options)
        .signer(ec_key())
        .open(&path)
        .unwrap();
    zfile.put("a.txt", b"abc", None).unwrap();
    zfile.update().unwrap();

    let manifest = Manifest::parse(&zfile.read("META-INF/MANIFEST.MF").unwrap()).unwrap();
    assert_eq!(
        manifest.section("a.txt").unwrap()[0],
        (
            "SHA-256-Digest".to_string(),
            "ungWv48Bz+pBQUDeXa4iI7ADYaOWF3qctBD/YfIAFa0=".to_string()
        )
    );
    assert!(zfile.get("META-INF/CERT.EC").is_some());
    zfile.close().unwrap();
}

#[test]
fn test_directories_follow_cover_directories() {
    let dir = TempDir::new().unwrap();

    for cover in [false, true] {
        let path = dir.path().join(format!("dirs-{}.apk", cover));
        let options = ZFileOptions {
            cover_directories: cover,
            ..Default::default()
        };

        let mut zfile = ZFileBuilder::new()
            .options(options)
            .signer(rsa_key())
            .sign_v2(false)
            .open(&path)
            .unwrap();
        zfile.put("assets/", b"", None).unwrap();
        zfile.put("assets/a.txt", b"a", None).unwrap();
        zfile.update().unwrap();

        let manifest = Manifest::parse(&zfile.read("META-INF/MANIFEST.MF").unwrap()).unwrap();
        assert_eq!(manifest.section("assets/").is_some(), cover);
        assert!(manifest.section("assets/a.txt").is_some());
        zfile.close().unwrap();
    }
}

#[test]
fn test_signed_archive_update_is_idempotent() {
    let dir = TempDir::new().unwrap();

    for (name, key) in [("rsa.apk", rsa_key()), ("ec.apk", ec_key())] {
        let path = dir.path().join(name);
        let mut zfile = signed(&path, key);
        zfile.put("classes.dex", &[0xde; 3000], None).unwrap();
        zfile.close().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let modified = std::fs::metadata(&path).unwrap().modified().unwrap();

        let key = if name == "rsa.apk" { rsa_key() } else { ec_key() };
        let mut zfile = signed(&path, key);
        zfile.update().unwrap();
        assert!(!zfile.is_dirty());
        zfile.close().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), bytes, "{}", name);
        assert_eq!(
            std::fs::metadata(&path).unwrap().modified().unwrap(),
            modified
        );
    }
}

#[test]
fn test_change_triggers_resigning() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("resign.apk");

    let mut zfile = signed(&path, rsa_key());
    zfile.put("a.txt", b"first", None).unwrap();
    zfile.update().unwrap();

    let manifest = zfile.read("META-INF/MANIFEST.MF").unwrap();
    let sf = zfile.read("META-INF/CERT.SF").unwrap();
    let pkcs7 = zfile.read("META-INF/CERT.RSA").unwrap();
    let block = zfile.signing_block().unwrap().to_vec();

    zfile.put("b.txt", b"second", None).unwrap();
    zfile.update().unwrap();

    assert_ne!(zfile.read("META-INF/MANIFEST.MF").unwrap(), manifest);
    assert_ne!(zfile.read("META-INF/CERT.SF").unwrap(), sf);
    assert_ne!(zfile.read("META-INF/CERT.RSA").unwrap(), pkcs7);
    assert_ne!(zfile.signing_block().unwrap(), block.as_slice());
    zfile.close().unwrap();
}

#[test]
fn test_content_change_resigns_only_that_entry() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("content.apk");

    let mut zfile = signed(&path, rsa_key());
    zfile.put("directory/file", b"before", None).unwrap();
    zfile.put("other/one", b"unchanged", None).unwrap();
    zfile.put("other/two", b"also unchanged", None).unwrap();
    zfile.update().unwrap();

    let manifest_before = Manifest::parse(&zfile.read("META-INF/MANIFEST.MF").unwrap()).unwrap();
    let sf_before = Manifest::parse(&zfile.read("META-INF/CERT.SF").unwrap()).unwrap();

    zfile.put("directory/file", b"after", None).unwrap();
    zfile.update().unwrap();

    let manifest_after = Manifest::parse(&zfile.read("META-INF/MANIFEST.MF").unwrap()).unwrap();
    let sf_after = Manifest::parse(&zfile.read("META-INF/CERT.SF").unwrap()).unwrap();

    assert_eq!(manifest_after.main_attributes(), manifest_before.main_attributes());
    for (name, _) in manifest_before.sections() {
        let before = manifest_before.section_bytes(name).unwrap();
        let after = manifest_after.section_bytes(name).unwrap();
        if name == "directory/file" {
            assert_ne!(after, before);
        } else {
            assert_eq!(after, before, "manifest section {} changed", name);
        }
    }

    for (key, value) in sf_before.main_attributes() {
        let now = sf_after.main_attribute(key).unwrap();
        if key.ends_with("-Digest-Manifest") {
            assert_ne!(now, value);
        } else {
            assert_eq!(now, value, "signature file attribute {} changed", key);
        }
    }

    for (name, section) in sf_before.sections() {
        let now = sf_after.section(name).unwrap();
        if name == "directory/file" {
            assert_ne!(now, section);
        } else {
            assert_eq!(now, section, "signature file section {} changed", name);
        }
    }

    assert_eq!(zfile.read("directory/file").unwrap(), b"after");
    zfile.close().unwrap();
}

#[test]
fn test_v2_block_placement_and_digest() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("v2.apk");
    let key = rsa_key();

    let mut zfile = signed(&path, rsa_key());
    zfile.put("res/raw/data.bin", &vec![7u8; 200_000], None).unwrap();
    zfile.put("AndroidManifest.xml", b"<manifest/>", None).unwrap();
    zfile.close().unwrap();

    let bytes = std::fs::read(&path).unwrap();
    let zfile = ZFile::open(&path, ZFileOptions::default()).unwrap();
    let cd_offset = zfile.central_directory_offset().unwrap() as usize;
    assert_eq!(&bytes[cd_offset - 16..cd_offset], b"APK Sig Block 42");

    let raw_block = zfile.signing_block().unwrap();
    let block_start = cd_offset - raw_block.len();
    let block = SigningBlock::from_bytes(raw_block).unwrap();
    let mut value = block.get(V2_BLOCK_ID).unwrap();

    // signers -> signer -> signed data
    let mut signers = take_prefixed(&mut value);
    let mut signer = take_prefixed(&mut signers);
    let signed_data = take_prefixed(&mut signer);
    let mut signatures = take_prefixed(&mut signer);
    let public_key = take_prefixed(&mut signer);
    assert_eq!(public_key, key.public_key_info());

    let mut cursor = signed_data;
    let mut digests = take_prefixed(&mut cursor);
    let mut record = take_prefixed(&mut digests);
    assert_eq!(read_u32(&mut record), 1);
    let digest = take_prefixed(&mut record);

    let mut certificates = take_prefixed(&mut cursor);
    assert_eq!(take_prefixed(&mut certificates), key.certificate());

    // The digest covers the archive as if the block were absent
    let eocd_start = bytes.len() - 22;
    let mut eocd = bytes[eocd_start..].to_vec();
    eocd[16..20].copy_from_slice(&(block_start as u32).to_le_bytes());
    let expected = chunked_sha256(&[
        &bytes[..block_start],
        &bytes[cd_offset..eocd_start],
        &eocd,
    ]);
    assert_eq!(digest, expected.as_slice());

    let mut signature_record = take_prefixed(&mut signatures);
    assert_eq!(read_u32(&mut signature_record), 0x0103);
    let signature = take_prefixed(&mut signature_record);
    key.verify(SignatureDigest::Sha256, signed_data, signature)
        .unwrap();
}

#[test]
fn test_v1_only_leaves_no_signing_block() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("v1.apk");

    let mut zfile = ZFileBuilder::new()
        .signer(rsa_key())
        .sign_v2(false)
        .open(&path)
        .unwrap();
    zfile.put("a.txt", b"a", None).unwrap();
    zfile.close().unwrap();

    let zfile = ZFile::open(&path, ZFileOptions::default()).unwrap();
    assert!(zfile.signing_block().is_none());

    let sf = Manifest::parse(&zfile.read("META-INF/CERT.SF").unwrap()).unwrap();
    assert_eq!(sf.main_attribute("X-Android-APK-Signed"), None);
}

#[test]
fn test_unsigned_rewrite_drops_signing_block() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("drop.apk");

    let mut zfile = signed(&path, ec_key());
    zfile.put("a.txt", b"a", None).unwrap();
    zfile.close().unwrap();

    let mut zfile = ZFile::open(&path, ZFileOptions::default()).unwrap();
    assert!(zfile.signing_block().is_some());
    zfile.put("b.txt", b"b", None).unwrap();
    zfile.close().unwrap();

    let zfile = ZFile::open(&path, ZFileOptions::default()).unwrap();
    assert!(zfile.signing_block().is_none());
    assert_eq!(zfile.read("b.txt").unwrap(), b"b");
}
