//! JAR manifest text format
//!
//! A manifest is a main section followed by named sections, each a list of
//! `Name: value` lines ending in CRLF and closed by an empty line. Lines
//! longer than 72 bytes continue on the next line after a single space.

use crate::error::{Result, ZFileError};
use std::collections::BTreeMap;

/// Path of the manifest inside the archive
pub const MANIFEST_NAME: &str = "META-INF/MANIFEST.MF";

/// Longest physical line, CRLF excluded
pub const LINE_LIMIT: usize = 72;

type Attributes = Vec<(String, String)>;

/// Parsed or generated manifest (also used for signature files)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    main: Attributes,
    sections: BTreeMap<String, Attributes>,
}

impl Manifest {
    pub fn new() -> Self {
        Manifest::default()
    }

    /// Set a main attribute, keeping its position if it already exists
    pub fn set_main_attribute(&mut self, name: &str, value: &str) {
        match self
            .main
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
        {
            Some(attribute) => attribute.1 = value.to_string(),
            None => self.main.push((name.to_string(), value.to_string())),
        }
    }

    /// Main attribute lookup; names are case-insensitive
    pub fn main_attribute(&self, name: &str) -> Option<&str> {
        self.main
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn main_attributes(&self) -> &[(String, String)] {
        &self.main
    }

    /// Replace the attributes of the section for `name`
    pub fn set_section(&mut self, name: &str, attributes: Attributes) {
        self.sections.insert(name.to_string(), attributes);
    }

    pub fn section(&self, name: &str) -> Option<&[(String, String)]> {
        self.sections.get(name).map(Vec::as_slice)
    }

    /// Named sections in name order
    pub fn sections(&self) -> impl Iterator<Item = (&str, &[(String, String)])> {
        self.sections
            .iter()
            .map(|(name, attributes)| (name.as_str(), attributes.as_slice()))
    }

    /// Exact bytes of the main section, closing empty line included
    pub fn main_section_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, value) in &self.main {
            write_line(&mut out, name, value);
        }
        out.extend_from_slice(b"\r\n");
        out
    }

    /// Exact bytes of one named section, closing empty line included
    pub fn section_bytes(&self, name: &str) -> Option<Vec<u8>> {
        let attributes = self.sections.get(name)?;

        let mut out = Vec::new();
        write_line(&mut out, "Name", name);
        for (key, value) in attributes {
            write_line(&mut out, key, value);
        }
        out.extend_from_slice(b"\r\n");
        Some(out)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.main_section_bytes();
        for name in self.sections.keys() {
            if let Some(bytes) = self.section_bytes(name) {
                out.extend_from_slice(&bytes);
            }
        }
        out
    }

    /// Parse manifest text, accepting CRLF or LF line endings
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let corrupt = |reason: String| ZFileError::corrupt_entry(MANIFEST_NAME, reason);

        let mut sections: Vec<Vec<Vec<u8>>> = vec![Vec::new()];
        for raw in bytes.split(|&b| b == b'\n') {
            let line = raw.strip_suffix(b"\r").unwrap_or(raw);

            // The first blank line always ends the main section, even an empty one
            if line.is_empty() {
                if sections.len() == 1 || sections.last().map_or(false, |s| !s.is_empty()) {
                    sections.push(Vec::new());
                }
                continue;
            }

            let current = sections.last_mut().ok_or_else(|| corrupt("empty".to_string()))?;
            if let Some(continuation) = line.strip_prefix(b" ") {
                let previous = current
                    .last_mut()
                    .ok_or_else(|| corrupt("continuation line without a header".to_string()))?;
                previous.extend_from_slice(continuation);
            } else {
                current.push(line.to_vec());
            }
        }

        let mut manifest = Manifest::new();
        for (index, lines) in sections.into_iter().enumerate() {
            if lines.is_empty() {
                continue;
            }

            let mut attributes = Vec::with_capacity(lines.len());
            for line in lines {
                let text = String::from_utf8(line)
                    .map_err(|_| corrupt("attribute is not UTF-8".to_string()))?;
                let (key, value) = text
                    .split_once(": ")
                    .ok_or_else(|| corrupt(format!("malformed attribute line '{}'", text)))?;
                attributes.push((key.to_string(), value.to_string()));
            }

            if index == 0 {
                manifest.main = attributes;
                continue;
            }

            let (first_key, section_name) = attributes.remove(0);
            if !first_key.eq_ignore_ascii_case("Name") {
                return Err(corrupt(format!(
                    "section starts with '{}' instead of 'Name'",
                    first_key
                )));
            }
            manifest.sections.insert(section_name, attributes);
        }

        Ok(manifest)
    }
}

/// Append `name: value` folded to 72-byte lines
fn write_line(out: &mut Vec<u8>, name: &str, value: &str) {
    let line = format!("{}: {}", name, value).into_bytes();
    let (first, rest) = line.split_at(line.len().min(LINE_LIMIT));

    out.extend_from_slice(first);
    out.extend_from_slice(b"\r\n");
    for chunk in rest.chunks(LINE_LIMIT - 1) {
        out.push(b' ');
        out.extend_from_slice(chunk);
        out.extend_from_slice(b"\r\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Manifest {
        let mut manifest = Manifest::new();
        manifest.set_main_attribute("Manifest-Version", "1.0");
        manifest.set_main_attribute("Created-By", "1.0 (Android)");
        manifest.set_section(
            "directory/file",
            vec![(
                "SHA1-Digest".to_string(),
                "OOQgIEXBissIvva3ydRoaXk29Rk=".to_string(),
            )],
        );
        manifest
    }

    #[test]
    fn test_layout() {
        let text = String::from_utf8(sample().to_bytes()).unwrap();
        assert_eq!(
            text,
            "Manifest-Version: 1.0\r\nCreated-By: 1.0 (Android)\r\n\r\n\
             Name: directory/file\r\nSHA1-Digest: OOQgIEXBissIvva3ydRoaXk29Rk=\r\n\r\n"
        );
    }

    #[test]
    fn test_long_lines_are_folded() {
        let name = format!("res/{}.png", "x".repeat(150));
        let mut manifest = Manifest::new();
        manifest.set_section(&name, Vec::new());

        let bytes = manifest.section_bytes(&name).unwrap();
        for line in bytes.split(|&b| b == b'\n') {
            assert!(line.len() <= LINE_LIMIT + 1);
        }

        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with(&format!("Name: res/{}\r\n ", "x".repeat(62))));
        assert_eq!(Manifest::parse(&manifest.to_bytes()).unwrap(), manifest);
    }

    #[test]
    fn test_parse_round_trip() {
        let manifest = sample();
        let parsed = Manifest::parse(&manifest.to_bytes()).unwrap();
        assert_eq!(parsed, manifest);
        assert_eq!(parsed.main_attribute("manifest-version"), Some("1.0"));
    }

    #[test]
    fn test_parse_accepts_lf() {
        let parsed = Manifest::parse(b"Manifest-Version: 1.0\n\nName: a\nX: y\n").unwrap();
        assert_eq!(parsed.section("a").unwrap()[0].1, "y");
    }

    #[test]
    fn test_parse_empty_main_section() {
        let parsed = Manifest::parse(b"\r\nName: a\r\nX: y\r\n\r\n").unwrap();
        assert!(parsed.main_attributes().is_empty());
        assert_eq!(parsed.section("a").unwrap(), &[("X".to_string(), "y".to_string())][..]);
    }

    #[test]
    fn test_parse_rejects_section_without_name() {
        let result = Manifest::parse(b"Manifest-Version: 1.0\r\n\r\nX: y\r\n\r\n");
        assert!(matches!(result, Err(ZFileError::CorruptEntry { .. })));
    }

    #[test]
    fn test_set_main_attribute_keeps_position() {
        let mut manifest = sample();
        manifest.set_main_attribute("manifest-version", "2.0");
        assert_eq!(manifest.main_attributes()[0].1, "2.0");
        assert_eq!(manifest.main_attributes().len(), 2);
    }
}
