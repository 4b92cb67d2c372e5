//! Content units flowing through the ingestion pipeline

use crate::error::{IngestError, Result};
use crate::hash::{ContentHash, ContentHasher};
use crate::upload::UploadStreamHandle;
use bytes::Bytes;
use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

static NEXT_CHUNK_TAG: AtomicU64 = AtomicU64::new(0);

/// Payload of a block
#[derive(Debug, Clone)]
pub enum BlockKind {
    /// A slice of the chunk's data
    Data(Bytes),
    /// End of the chunk's data stream
    Stop,
}

/// A unit of data travelling between pipeline stages
#[derive(Debug)]
pub struct Block {
    chunk: Arc<ChunkItem>,
    kind: BlockKind,
}

impl Block {
    pub fn data(chunk: Arc<ChunkItem>, data: impl Into<Bytes>) -> Self {
        Self {
            chunk,
            kind: BlockKind::Data(data.into()),
        }
    }

    pub fn stop(chunk: Arc<ChunkItem>) -> Self {
        Self {
            chunk,
            kind: BlockKind::Stop,
        }
    }

    pub fn chunk(&self) -> &Arc<ChunkItem> {
        &self.chunk
    }

    pub fn kind(&self) -> &BlockKind {
        &self.kind
    }

    pub fn size(&self) -> usize {
        match &self.kind {
            BlockKind::Data(data) => data.len(),
            BlockKind::Stop => 0,
        }
    }

    pub fn is_stop(&self) -> bool {
        matches!(self.kind, BlockKind::Stop)
    }
}

enum HashState {
    Hashing(ContentHasher),
    Finalized,
}

/// A content-addressed slice of a file
pub struct ChunkItem {
    tag: u64,
    file: Arc<FileItem>,
    offset: u64,
    size: u64,
    sole_piece: bool,
    bulk: AtomicBool,
    hash_state: Mutex<HashState>,
    digest: OnceCell<ContentHash>,
    upload_handle: OnceCell<Arc<UploadStreamHandle>>,
}

impl ChunkItem {
    pub fn new(file: Arc<FileItem>, offset: u64, size: u64, sole_piece: bool) -> Self {
        Self {
            tag: NEXT_CHUNK_TAG.fetch_add(1, Ordering::Relaxed),
            file,
            offset,
            size,
            sole_piece,
            bulk: AtomicBool::new(false),
            hash_state: Mutex::new(HashState::Hashing(ContentHash::hasher())),
            digest: OnceCell::new(),
            upload_handle: OnceCell::new(),
        }
    }

    /// Routing tag; all blocks of a chunk share it
    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn file(&self) -> &Arc<FileItem> {
        &self.file
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether this chunk is the only chunk of its file
    pub fn is_sole_piece(&self) -> bool {
        self.sole_piece
    }

    pub fn is_bulk(&self) -> bool {
        self.bulk.load(Ordering::SeqCst)
    }

    /// Mark the chunk as also representing its whole file
    pub fn make_bulk_chunk(&self) {
        self.bulk.store(true, Ordering::SeqCst);
    }

    /// Feed data into the chunk's digest
    pub fn update_hash(&self, data: &[u8]) -> Result<()> {
        let mut state = self.hash_state.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *state {
            HashState::Hashing(hasher) => {
                hasher.update(data);
                Ok(())
            }
            HashState::Finalized => Err(IngestError::contract_violation(format!(
                "hash update on finalized chunk {}",
                self.tag
            ))),
        }
    }

    /// Finalize the digest; it is immutable afterwards
    pub fn finalize_hash(&self) -> Result<ContentHash> {
        let mut state = self.hash_state.lock().unwrap_or_else(|e| e.into_inner());
        match std::mem::replace(&mut *state, HashState::Finalized) {
            HashState::Hashing(hasher) => {
                let digest = hasher.finalize();
                // The cell can only be filled here, under the state lock.
                let _ = self.digest.set(digest);
                Ok(digest)
            }
            HashState::Finalized => Err(IngestError::contract_violation(format!(
                "chunk {} finalized twice",
                self.tag
            ))),
        }
    }

    /// The finalized digest, once the Stop block has been hashed
    pub fn digest(&self) -> Option<ContentHash> {
        self.digest.get().copied()
    }

    /// The upload handle, opening it on first use
    ///
    /// Concurrent first callers block until the winner has finished opening;
    /// `open` runs at most once unless it fails.
    pub fn upload_handle_or_open<F>(&self, open: F) -> Result<Arc<UploadStreamHandle>>
    where
        F: FnOnce() -> Result<Arc<UploadStreamHandle>>,
    {
        self.upload_handle.get_or_try_init(open).cloned()
    }

    pub fn upload_handle(&self) -> Option<&Arc<UploadStreamHandle>> {
        self.upload_handle.get()
    }
}

impl std::fmt::Debug for ChunkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkItem")
            .field("tag", &self.tag)
            .field("file", &self.file.path())
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("sole_piece", &self.sole_piece)
            .field("bulk", &self.is_bulk())
            .field("digest", &self.digest())
            .finish()
    }
}

/// An acknowledged chunk of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileChunk {
    pub digest: ContentHash,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Default)]
struct ChunkRegistry {
    expected: Option<u64>,
    chunks: Vec<FileChunk>,
    processed: bool,
}

impl ChunkRegistry {
    /// Flip to processed if every expected chunk is present
    fn settle(&mut self) -> bool {
        if self.processed {
            return false;
        }
        match self.expected {
            Some(expected) if self.chunks.len() as u64 == expected => {
                self.processed = true;
                true
            }
            _ => false,
        }
    }
}

/// The chunks produced from one input file
#[derive(Debug)]
pub struct FileItem {
    path: PathBuf,
    size: u64,
    registry: Mutex<ChunkRegistry>,
    bulk_hash: OnceCell<ContentHash>,
}

impl FileItem {
    pub fn new(path: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
            registry: Mutex::new(ChunkRegistry::default()),
            bulk_hash: OnceCell::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Declare how many chunks the file consists of
    ///
    /// Returns `true` if the file became processed by this call.
    pub fn set_expected_chunks(&self, count: u64) -> bool {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        registry.expected = Some(count);
        registry.settle()
    }

    pub fn expected_chunks(&self) -> Option<u64> {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .expected
    }

    /// Register an acknowledged chunk
    ///
    /// Returns `true` for exactly one call: the one that completed the file.
    pub fn register_chunk(&self, chunk: FileChunk) -> bool {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        registry.chunks.push(chunk);
        registry.settle()
    }

    pub fn is_processed(&self) -> bool {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .processed
    }

    /// Acknowledged chunks, ordered by offset
    pub fn chunks(&self) -> Vec<FileChunk> {
        let mut chunks = self
            .registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .chunks
            .clone();
        chunks.sort_by_key(|c| c.offset);
        chunks
    }

    pub fn set_bulk_hash(&self, digest: ContentHash) {
        let _ = self.bulk_hash.set(digest);
    }

    /// Digest of the whole file, known when the file was a sole piece
    pub fn bulk_hash(&self) -> Option<ContentHash> {
        self.bulk_hash.get().copied()
    }
}
