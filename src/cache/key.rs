//! Cache Addressing
//!
//! Keys and part tags. Everything past this module takes a validated
//! [`CacheKey`], never raw guid/hash bytes.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Length of the artifact guid in bytes
pub const GUID_SIZE: usize = 16;

/// Length of the artifact version hash in bytes
pub const HASH_SIZE: usize = 16;

/// Cache key - artifact guid plus version hash
///
/// Serialized as a pair of hex strings.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    #[serde(with = "hex::serde")]
    guid: [u8; GUID_SIZE],
    #[serde(with = "hex::serde")]
    hash: [u8; HASH_SIZE],
}

impl CacheKey {
    /// Create a key, checking both lengths
    pub fn new(guid: &[u8], hash: &[u8]) -> Result<Self> {
        let guid: [u8; GUID_SIZE] = guid.try_into().map_err(|_| {
            Error::InvalidKey(format!(
                "guid must be {} bytes, got {}",
                GUID_SIZE,
                guid.len()
            ))
        })?;
        let hash: [u8; HASH_SIZE] = hash.try_into().map_err(|_| {
            Error::InvalidKey(format!(
                "hash must be {} bytes, got {}",
                HASH_SIZE,
                hash.len()
            ))
        })?;
        Ok(Self { guid, hash })
    }

    /// Parse a key from hex-encoded guid and hash
    pub fn from_hex(guid: &str, hash: &str) -> Result<Self> {
        let guid = hex::decode(guid).map_err(|e| Error::InvalidKey(format!("guid: {}", e)))?;
        let hash = hex::decode(hash).map_err(|e| Error::InvalidKey(format!("hash: {}", e)))?;
        Self::new(&guid, &hash)
    }

    /// Get the guid bytes
    #[inline]
    pub fn guid(&self) -> &[u8; GUID_SIZE] {
        &self.guid
    }

    /// Get the hash bytes
    #[inline]
    pub fn hash(&self) -> &[u8; HASH_SIZE] {
        &self.hash
    }

    /// Hex-encoded guid
    pub fn guid_hex(&self) -> String {
        hex::encode(self.guid)
    }

    /// Hex-encoded hash
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.guid_hex(), self.hash_hex())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self)
    }
}

/// Tag naming one sub-blob of an artifact
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "char", into = "char")]
pub struct PartTag(char);

impl PartTag {
    /// Artifact info (import metadata)
    pub const INFO: PartTag = PartTag('i');
    /// Artifact binary
    pub const BINARY: PartTag = PartTag('a');
    /// Artifact resource
    pub const RESOURCE: PartTag = PartTag('r');

    /// Create a tag; only printable ASCII characters are accepted
    pub fn new(tag: char) -> Result<Self> {
        if tag.is_ascii_graphic() {
            Ok(Self(tag))
        } else {
            Err(Error::InvalidPartTag(tag))
        }
    }

    /// Tag character
    #[inline]
    pub fn as_char(&self) -> char {
        self.0
    }
}

impl TryFrom<char> for PartTag {
    type Error = Error;

    fn try_from(tag: char) -> Result<Self> {
        Self::new(tag)
    }
}

impl From<PartTag> for char {
    fn from(tag: PartTag) -> char {
        tag.0
    }
}

impl fmt::Display for PartTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PartTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PartTag('{}')", self.0)
    }
}

/// The closed set of part tags a cache accepts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartTagSet(BTreeSet<PartTag>);

impl Default for PartTagSet {
    fn default() -> Self {
        Self::new([PartTag::INFO, PartTag::BINARY, PartTag::RESOURCE])
    }
}

impl PartTagSet {
    /// Create a tag set from the given tags
    pub fn new(tags: impl IntoIterator<Item = PartTag>) -> Self {
        Self(tags.into_iter().collect())
    }

    /// Check membership
    pub fn contains(&self, tag: PartTag) -> bool {
        self.0.contains(&tag)
    }

    /// Fail with `InvalidPartTag` unless the tag is in the set
    pub fn validate(&self, tag: PartTag) -> Result<()> {
        if self.contains(tag) {
            Ok(())
        } else {
            Err(Error::InvalidPartTag(tag.as_char()))
        }
    }

    /// Iterate tags in order
    pub fn iter(&self) -> impl Iterator<Item = PartTag> + '_ {
        self.0.iter().copied()
    }

    /// Number of tags
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if the set is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
