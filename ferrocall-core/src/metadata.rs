//! # Call Metadata
//!
//! Headers and trailers exchanged on a call are kept in [`Metadata`], an ordered multi-map.
//! Unlike a hash based header map, repeated keys and the relative order of *all* entries are
//! preserved exactly as they were inserted.
//!
//! Keys follow the gRPC rules: lowercase ASCII letters, digits, `-`, `_` and `.`.
//! Keys ending in `-bin` carry arbitrary bytes, every other key carries a printable ASCII value.
use bytes::Bytes;
use std::str::FromStr;
use tonic::metadata::{
    Ascii, Binary, KeyAndValueRef, MetadataKey, MetadataMap, MetadataValue as TonicValue,
};

/// Suffix marking a key whose values are binary.
pub const BINARY_HEADER_SUFFIX: &str = "-bin";

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum MetadataError {
    #[error("Metadata key cannot be empty")]
    EmptyKey,
    #[error("Invalid metadata key '{0}': only lowercase letters, digits, '-', '_' and '.' are allowed")]
    InvalidKey(String),
    #[error("Metadata key '{0}' ends with '-bin' and requires a binary value")]
    BinaryValueRequired(String),
    #[error("Metadata key '{0}' does not end with '-bin' and cannot carry a binary value")]
    AsciiValueRequired(String),
    #[error("Invalid value for metadata key '{0}': only printable ASCII is allowed")]
    InvalidAsciiValue(String),
    #[error("Metadata key '{0}' was rejected by tonic")]
    Tonic(String),
}

/// A single metadata value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataValue {
    Ascii(String),
    Binary(Bytes),
}

impl MetadataValue {
    /// Returns the value as a string, if it is an ASCII value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Ascii(v) => Some(v),
            MetadataValue::Binary(_) => None,
        }
    }

    /// Returns the raw bytes of the value, regardless of its kind.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            MetadataValue::Ascii(v) => v.as_bytes(),
            MetadataValue::Binary(v) => v,
        }
    }
}

/// Ordered mapping from keys to string or binary values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, MetadataValue)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an ASCII entry. Existing entries with the same key are kept.
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), MetadataError> {
        let key = normalize_key(key.into())?;
        if key.ends_with(BINARY_HEADER_SUFFIX) {
            return Err(MetadataError::BinaryValueRequired(key));
        }

        let value = value.into();
        if !value.bytes().all(|b| (0x20..=0x7e).contains(&b)) {
            return Err(MetadataError::InvalidAsciiValue(key));
        }

        self.entries.push((key, MetadataValue::Ascii(value)));
        Ok(())
    }

    /// Appends a binary entry. The key must end with `-bin`.
    pub fn insert_bin(
        &mut self,
        key: impl Into<String>,
        value: impl Into<Bytes>,
    ) -> Result<(), MetadataError> {
        let key = normalize_key(key.into())?;
        if !key.ends_with(BINARY_HEADER_SUFFIX) {
            return Err(MetadataError::AsciiValueRequired(key));
        }

        self.entries.push((key, MetadataValue::Binary(value.into())));
        Ok(())
    }

    /// Returns the first value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.get_all(key).next()
    }

    /// Returns every value stored under `key`, in insertion order.
    pub fn get_all<'a>(
        &'a self,
        key: &str,
    ) -> impl Iterator<Item = &'a MetadataValue> + use<'a> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .filter(move |(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Converts into a tonic `MetadataMap`.
    ///
    /// Values sharing a key keep their relative order, but `MetadataMap` groups entries by key,
    /// so the interleaving between different keys is not preserved.
    pub fn to_tonic(&self) -> Result<MetadataMap, MetadataError> {
        let mut map = MetadataMap::new();

        for (key, value) in &self.entries {
            match value {
                MetadataValue::Ascii(v) => {
                    let k = MetadataKey::<Ascii>::from_str(key)
                        .map_err(|_| MetadataError::Tonic(key.clone()))?;
                    let v = TonicValue::<Ascii>::from_str(v)
                        .map_err(|_| MetadataError::InvalidAsciiValue(key.clone()))?;
                    map.append(k, v);
                }
                MetadataValue::Binary(v) => {
                    let k = MetadataKey::<Binary>::from_bytes(key.as_bytes())
                        .map_err(|_| MetadataError::Tonic(key.clone()))?;
                    map.append_bin(k, TonicValue::<Binary>::from_bytes(v));
                }
            }
        }

        Ok(map)
    }

    /// Builds metadata out of a tonic `MetadataMap`.
    pub fn from_tonic(map: &MetadataMap) -> Result<Self, MetadataError> {
        let mut metadata = Metadata::new();

        for entry in map.iter() {
            match entry {
                KeyAndValueRef::Ascii(key, value) => {
                    let value = value
                        .to_str()
                        .map_err(|_| MetadataError::InvalidAsciiValue(key.as_str().to_string()))?;
                    metadata.insert(key.as_str(), value)?;
                }
                KeyAndValueRef::Binary(key, value) => {
                    let value = value
                        .to_bytes()
                        .map_err(|_| MetadataError::Tonic(key.as_str().to_string()))?;
                    metadata.insert_bin(key.as_str(), value)?;
                }
            }
        }

        Ok(metadata)
    }
}

impl<'a> IntoIterator for &'a Metadata {
    type Item = (&'a str, &'a MetadataValue);
    type IntoIter = Box<dyn Iterator<Item = Self::Item> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

fn normalize_key(key: String) -> Result<String, MetadataError> {
    if key.is_empty() {
        return Err(MetadataError::EmptyKey);
    }

    let key = key.to_ascii_lowercase();
    let valid = key
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'-' | b'_' | b'.'));

    if valid {
        Ok(key)
    } else {
        Err(MetadataError::InvalidKey(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_keys_keep_insertion_order() {
        let mut md = Metadata::new();
        md.insert("a", "1").unwrap();
        md.insert("b", "2").unwrap();
        md.insert("A", "3").unwrap();

        let all: Vec<_> = md.get_all("a").filter_map(|v| v.as_str()).collect();
        assert_eq!(all, vec!["1", "3"]);

        let keys: Vec<_> = md.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b", "a"]);
    }

    #[test]
    fn lookups_outlive_the_key() {
        let mut md = Metadata::new();
        md.insert("x-trace", "abc").unwrap();

        let value = {
            let key = String::from("X-Trace");
            md.get(&key)
        };
        assert_eq!(value.and_then(|v| v.as_str()), Some("abc"));
    }

    #[test]
    fn binary_keys_require_binary_values() {
        let mut md = Metadata::new();

        assert_eq!(
            md.insert("trace-bin", "x"),
            Err(MetadataError::BinaryValueRequired("trace-bin".into()))
        );
        assert_eq!(
            md.insert_bin("trace", Bytes::from_static(b"\x00\x01")),
            Err(MetadataError::AsciiValueRequired("trace".into()))
        );
        assert!(md.insert_bin("trace-bin", Bytes::from_static(b"\x00\x01")).is_ok());
        assert_eq!(md.get("trace-bin").unwrap().as_bytes(), b"\x00\x01");
    }

    #[test]
    fn rejects_invalid_keys_and_values() {
        let mut md = Metadata::new();

        assert_eq!(md.insert("", "v"), Err(MetadataError::EmptyKey));
        assert!(matches!(
            md.insert("bad key", "v"),
            Err(MetadataError::InvalidKey(_))
        ));
        assert!(matches!(
            md.insert("key", "line\nbreak"),
            Err(MetadataError::InvalidAsciiValue(_))
        ));
        assert!(md.is_empty());
    }

    #[test]
    fn converts_to_and_from_tonic() {
        let mut md = Metadata::new();
        md.insert("x-user", "alice").unwrap();
        md.insert("x-user", "bob").unwrap();
        md.insert_bin("blob-bin", Bytes::from_static(&[1, 2, 3]))
            .unwrap();

        let map = md.to_tonic().unwrap();
        let users: Vec<_> = map
            .get_all("x-user")
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(users, vec!["alice", "bob"]);

        let back = Metadata::from_tonic(&map).unwrap();
        assert_eq!(back.len(), 3);
        assert_eq!(back.get("blob-bin").unwrap().as_bytes(), &[1, 2, 3]);
    }
}
