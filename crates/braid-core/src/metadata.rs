//! Ordered key/value call metadata.

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine as _;

use crate::Status;

/// Keys ending with this suffix carry raw bytes, base64-coded on the wire.
pub const BINARY_HEADER_SUFFIX: &str = "-bin";

// The wire form is unpadded; inbound values are accepted either way.
const WIRE_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// A single metadata value: printable ASCII or raw bytes for `-bin` keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataValue {
    Ascii(String),
    Binary(Vec<u8>),
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Ascii(s) => Some(s),
            MetadataValue::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            MetadataValue::Ascii(s) => s.as_bytes(),
            MetadataValue::Binary(b) => b,
        }
    }
}

/// An ordered multimap of call metadata.
///
/// Insertion order is preserved and duplicate keys are permitted. Keys match
/// `[a-z0-9._-]+` with an optional leading `:` for pseudo-headers; keys ending
/// in `-bin` carry raw bytes, all others visible ASCII plus space. The map is
/// not internally synchronized; ownership moves to the transport when a
/// message is enqueued.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, MetadataValue)>,
}

impl Metadata {
    pub fn new() -> Metadata {
        Metadata::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends an ASCII value.
    ///
    /// # Panics
    ///
    /// Panics if the key is malformed, names a binary header, or the value
    /// contains non-printable characters.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        assert!(is_valid_key(&key), "invalid metadata key: {:?}", key);
        assert!(
            !key.ends_with(BINARY_HEADER_SUFFIX),
            "binary header {:?} requires put_bin",
            key
        );
        assert!(
            is_visible_ascii(&value),
            "metadata value for {:?} contains non-printable characters",
            key
        );
        self.entries.push((key, MetadataValue::Ascii(value)));
    }

    /// Appends a binary value under a `-bin` key.
    ///
    /// # Panics
    ///
    /// Panics if the key is malformed or does not end in `-bin`.
    pub fn put_bin(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        let key = key.into();
        assert!(is_valid_key(&key), "invalid metadata key: {:?}", key);
        assert!(
            key.ends_with(BINARY_HEADER_SUFFIX),
            "non-binary header {:?} requires put",
            key
        );
        self.entries.push((key, MetadataValue::Binary(value.into())));
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// The last ASCII value for a key, mirroring "last value wins" reads.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.as_str())
    }

    /// The last binary value for a key.
    pub fn get_bin(&self, key: &str) -> Option<&[u8]> {
        self.entries.iter().rev().find(|(k, _)| k == key).map(|(_, v)| match v {
            MetadataValue::Binary(b) => b.as_slice(),
            MetadataValue::Ascii(s) => s.as_bytes(),
        })
    }

    /// All values for a key, in insertion order.
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a MetadataValue> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Removes and returns every value stored under a key.
    pub fn remove_all(&mut self, key: &str) -> Vec<MetadataValue> {
        let mut removed = Vec::new();
        self.entries.retain_mut(|(k, v)| {
            if k.as_str() == key {
                removed.push(std::mem::replace(v, MetadataValue::Ascii(String::new())));
                false
            } else {
                true
            }
        });
        removed
    }

    /// Appends every entry of `other`, preserving its order.
    pub fn merge(&mut self, other: Metadata) {
        self.entries.extend(other.entries);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Serializes to interleaved key/value byte vectors; element `2i` is a
    /// key, `2i + 1` its value, with binary values base64-coded.
    pub fn serialize(&self) -> Vec<Vec<u8>> {
        let mut out = Vec::with_capacity(self.entries.len() * 2);
        for (key, value) in &self.entries {
            out.push(key.as_bytes().to_vec());
            match value {
                MetadataValue::Ascii(s) => out.push(s.as_bytes().to_vec()),
                MetadataValue::Binary(b) => out.push(WIRE_BASE64.encode(b).into_bytes()),
            }
        }
        out
    }

    /// Parses the interleaved form produced by [`Metadata::serialize`].
    pub fn parse(serialized: &[Vec<u8>]) -> Result<Metadata, Status> {
        if serialized.len() % 2 != 0 {
            return Err(Status::internal(
                "metadata serialization has an odd number of elements",
            ));
        }
        let mut metadata = Metadata::new();
        for pair in serialized.chunks_exact(2) {
            let key = std::str::from_utf8(&pair[0])
                .map_err(|_| Status::internal("metadata key is not valid UTF-8"))?;
            if !is_valid_key(key) {
                return Err(Status::internal(format!("invalid metadata key: {:?}", key)));
            }
            if key.ends_with(BINARY_HEADER_SUFFIX) {
                let encoded = std::str::from_utf8(&pair[1])
                    .map_err(|_| Status::internal("binary metadata value is not base64 text"))?;
                let decoded = WIRE_BASE64.decode(encoded.trim_end()).map_err(|e| {
                    Status::internal(format!("base64 decoding failed for {:?}: {}", key, e))
                })?;
                metadata
                    .entries
                    .push((key.to_string(), MetadataValue::Binary(decoded)));
            } else {
                let value = std::str::from_utf8(&pair[1])
                    .map_err(|_| Status::internal("metadata value is not valid UTF-8"))?;
                if !is_visible_ascii(value) {
                    return Err(Status::internal(format!(
                        "metadata value for {:?} contains non-printable characters",
                        key
                    )));
                }
                metadata
                    .entries
                    .push((key.to_string(), MetadataValue::Ascii(value.to_string())));
            }
        }
        Ok(metadata)
    }
}

fn is_valid_key(key: &str) -> bool {
    let body = key.strip_prefix(':').unwrap_or(key);
    !body.is_empty()
        && body
            .bytes()
            .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-'))
}

fn is_visible_ascii(value: &str) -> bool {
    value.bytes().all(|b| (0x20..=0x7e).contains(&b))
}
