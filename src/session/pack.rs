//! Object packs: size-bounded batches of small objects
//!
//! A pack serializes as a text header followed by the raw payloads of its
//! objects in commit order:
//!
//! ```text
//! V2
//! S<total payload size>
//! N<number of objects>
//! --
//! C <object id> <size>
//! N <object id> <size> <base64url name>
//! <payload bytes...>
//! ```

use crate::hash::ObjectId;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Default upper bound on the payload size of one pack (200 MiB)
pub const DEFAULT_PACK_LIMIT: u64 = 200 * 1024 * 1024;

/// Upper bound on the number of objects in one pack
pub const MAX_OBJECTS_PER_PACK: usize = 100_000;

pub const PACK_FORMAT_VERSION: u32 = 2;

/// How the gateway should store a committed bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketContentType {
    /// Content-addressed object
    Cas,
    /// Object stored under an explicit name
    Named,
}

impl BucketContentType {
    fn header_tag(&self) -> char {
        match self {
            BucketContentType::Cas => 'C',
            BucketContentType::Named => 'N',
        }
    }
}

/// An open accumulation area for one object
#[derive(Debug)]
pub struct Bucket {
    id: u64,
    content: Vec<u8>,
}

impl Bucket {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            content: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn write(&mut self, data: &[u8]) {
        self.content.extend_from_slice(data);
    }

    pub fn size(&self) -> u64 {
        self.content.len() as u64
    }

    pub(crate) fn into_content(self) -> Vec<u8> {
        self.content
    }
}

/// A committed bucket inside a pack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackEntry {
    pub content_type: BucketContentType,
    pub object_id: ObjectId,
    pub name: Option<String>,
    pub content: Vec<u8>,
}

impl PackEntry {
    pub fn size(&self) -> u64 {
        self.content.len() as u64
    }
}

/// An ordered, size-bounded collection of committed objects
#[derive(Debug, Clone)]
pub struct ObjectPack {
    limit: u64,
    size: u64,
    entries: Vec<PackEntry>,
}

impl ObjectPack {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            size: 0,
            entries: Vec::new(),
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Total payload size of the committed objects
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[PackEntry] {
        &self.entries
    }

    /// Whether an object of `size` bytes fits
    ///
    /// An empty pack takes any single object, however large.
    pub fn admits(&self, size: u64) -> bool {
        if self.entries.is_empty() {
            return true;
        }
        self.entries.len() < MAX_OBJECTS_PER_PACK && self.size + size <= self.limit
    }

    /// Commit an entry, handing it back if it does not fit
    pub fn commit(&mut self, entry: PackEntry) -> Result<(), PackEntry> {
        if !self.admits(entry.size()) {
            return Err(entry);
        }
        self.size += entry.size();
        self.entries.push(entry);
        Ok(())
    }

    /// Whether the pack is past its bound (only possible with one oversize object)
    pub fn is_overfull(&self) -> bool {
        self.size > self.limit
    }

    pub fn header(&self) -> String {
        let mut header = format!(
            "V{}\nS{}\nN{}\n--\n",
            PACK_FORMAT_VERSION,
            self.size,
            self.entries.len()
        );
        for entry in &self.entries {
            let _ = write!(
                header,
                "{} {} {}",
                entry.content_type.header_tag(),
                entry.object_id,
                entry.size()
            );
            if entry.content_type == BucketContentType::Named {
                let name = entry.name.as_deref().unwrap_or_default();
                let _ = write!(header, " {}", URL_SAFE.encode(name));
            }
            header.push('\n');
        }
        header
    }

    /// Header followed by every payload
    pub fn serialize(&self) -> Vec<u8> {
        let header = self.header();
        let mut out = Vec::with_capacity(header.len() + self.size as usize);
        out.extend_from_slice(header.as_bytes());
        for entry in &self.entries {
            out.extend_from_slice(&entry.content);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::ContentHash;

    fn entry(data: &[u8]) -> PackEntry {
        PackEntry {
            content_type: BucketContentType::Cas,
            object_id: ObjectId::partial(ContentHash::compute(data)),
            name: None,
            content: data.to_vec(),
        }
    }

    #[test]
    fn test_bucket_write() {
        let mut bucket = Bucket::new(3);
        bucket.write(b"abc");
        bucket.write(b"de");
        assert_eq!(bucket.id(), 3);
        assert_eq!(bucket.size(), 5);
        assert_eq!(bucket.into_content(), b"abcde");
    }

    #[test]
    fn test_pack_rejects_overflow() {
        let mut pack = ObjectPack::new(10);
        assert!(pack.commit(entry(b"12345")).is_ok());
        assert!(pack.commit(entry(b"67890")).is_ok());
        assert_eq!(pack.size(), 10);

        let rejected = pack.commit(entry(b"x")).unwrap_err();
        assert_eq!(rejected.content, b"x");
        assert_eq!(pack.len(), 2);
        assert!(!pack.is_overfull());
    }

    #[test]
    fn test_empty_pack_admits_oversize_object() {
        let mut pack = ObjectPack::new(4);
        assert!(pack.commit(entry(b"too large")).is_ok());
        assert!(pack.is_overfull());
        assert!(pack.commit(entry(b"a")).is_err());
    }

    #[test]
    fn test_serialize() {
        let mut pack = ObjectPack::new(DEFAULT_PACK_LIMIT);
        pack.commit(entry(b"hello")).unwrap();
        pack.commit(PackEntry {
            content_type: BucketContentType::Named,
            object_id: ObjectId::bulk(ContentHash::compute(b"!")),
            name: Some("tag".to_string()),
            content: b"!".to_vec(),
        })
        .unwrap();

        let header = pack.header();
        let expected = format!(
            "V2\nS6\nN2\n--\nC {}P 5\nN {} 1 dGFn\n",
            ContentHash::compute(b"hello"),
            ContentHash::compute(b"!"),
        );
        assert_eq!(header, expected);

        let bytes = pack.serialize();
        assert!(bytes.starts_with(header.as_bytes()));
        assert!(bytes.ends_with(b"hello!"));
        assert_eq!(bytes.len(), header.len() + 6);
    }
}
