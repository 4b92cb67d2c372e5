use crate::config::IngestConfig;
use crate::error::{IngestError, Result};
use crate::ingest::item::{Block, ChunkItem, FileItem};
use log::debug;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Cuts input into fixed-size chunks and the chunks into blocks
///
/// Every chunk is emitted as its data blocks followed by one Stop block.
/// The file's chunk count is declared before its first block is emitted;
/// an empty input still yields one empty chunk.
#[derive(Debug, Clone, Copy)]
pub struct FileSplitter {
    chunk_size: u64,
    block_size: u64,
}

impl FileSplitter {
    pub fn new(chunk_size: u64, block_size: u64) -> Result<Self> {
        if chunk_size == 0 || block_size == 0 {
            return Err(IngestError::invalid_parameter(
                "chunk-size",
                "Chunk and block size must be greater than 0",
            ));
        }
        Ok(Self {
            chunk_size,
            block_size: block_size.min(chunk_size),
        })
    }

    pub fn from_config(config: &IngestConfig) -> Result<Self> {
        Self::new(config.chunk_size, config.block_size)
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Number of chunks an input of `size` bytes is cut into
    pub fn chunk_count(&self, size: u64) -> u64 {
        size.div_ceil(self.chunk_size).max(1)
    }

    pub fn split_file<F>(&self, path: impl AsRef<Path>, emit: F) -> Result<Arc<FileItem>>
    where
        F: FnMut(Block) -> Result<()>,
    {
        let path = path.as_ref();
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        self.split_reader(path, size, BufReader::new(file), emit)
    }

    /// Split `size` bytes read from `reader`
    ///
    /// Fails with an I/O error if the reader ends early.
    pub fn split_reader<R, F>(
        &self,
        path: impl Into<PathBuf>,
        size: u64,
        mut reader: R,
        mut emit: F,
    ) -> Result<Arc<FileItem>>
    where
        R: Read,
        F: FnMut(Block) -> Result<()>,
    {
        let file = Arc::new(FileItem::new(path, size));
        let count = self.chunk_count(size);
        file.set_expected_chunks(count);
        debug!(
            "splitting {} ({} bytes) into {} chunks",
            file.path().display(),
            size,
            count
        );

        for index in 0..count {
            let offset = index * self.chunk_size;
            let chunk_size = self.chunk_size.min(size - offset);
            let chunk = Arc::new(ChunkItem::new(file.clone(), offset, chunk_size, count == 1));

            let mut remaining = chunk_size;
            while remaining > 0 {
                let len = self.block_size.min(remaining);
                let mut buffer = vec![0u8; len as usize];
                reader.read_exact(&mut buffer)?;
                emit(Block::data(chunk.clone(), buffer))?;
                remaining -= len;
            }
            emit(Block::stop(chunk))?;
        }
        Ok(file)
    }
}
