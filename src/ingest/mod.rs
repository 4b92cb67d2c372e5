//! Chunked ingestion
//!
//! Input files are cut into chunks of blocks, hashed chunk by chunk and
//! streamed to an [`Uploader`](crate::upload::Uploader). Stages run on their
//! own worker threads connected by bounded queues.

pub mod hash_stage;
pub mod item;
pub mod pipeline;
pub mod splitter;
pub mod write_stage;

pub use hash_stage::HashStage;
pub use item::{Block, BlockKind, ChunkItem, FileChunk, FileItem};
pub use pipeline::IngestionPipeline;
pub use splitter::FileSplitter;
pub use write_stage::WriteStage;

/// Queue index for a chunk tag among `lanes` queues
pub(crate) fn route(tag: u64, lanes: usize) -> usize {
    (tag % lanes.max(1) as u64) as usize
}
