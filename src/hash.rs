//! Content digests and object identifiers

use crate::error::{IngestError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Suffix appended to the object name of a partial (chunk) object
pub const PARTIAL_SUFFIX: char = 'P';

/// A SHA-256 content digest
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hash a complete buffer in one go
    pub fn compute(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Create an incremental hasher
    pub fn hasher() -> ContentHasher {
        ContentHasher(Sha256::new())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| IngestError::invalid_parameter("digest", e.to_string()))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            IngestError::invalid_parameter("digest", format!("expected 32 bytes, got {}", v.len()))
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Incremental digest context
#[derive(Clone)]
pub struct ContentHasher(Sha256);

impl ContentHasher {
    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> ContentHash {
        ContentHash(self.0.finalize().into())
    }
}

impl fmt::Debug for ContentHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ContentHasher")
    }
}

/// Name of a stored object: a digest plus an optional type suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId {
    pub hash: ContentHash,
    pub suffix: Option<char>,
}

impl ObjectId {
    /// An object addressing a whole file
    pub fn bulk(hash: ContentHash) -> Self {
        Self { hash, suffix: None }
    }

    /// An object addressing one chunk of a file
    pub fn partial(hash: ContentHash) -> Self {
        Self {
            hash,
            suffix: Some(PARTIAL_SUFFIX),
        }
    }

    /// Relative path of the object below a repository's `data/` directory
    pub fn relative_path(&self) -> String {
        let name = self.to_string();
        format!("data/{}/{}", &name[..2], &name[2..])
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.suffix {
            Some(suffix) => write!(f, "{}{}", self.hash, suffix),
            None => write!(f, "{}", self.hash),
        }
    }
}
