use crate::error::{FailurePolicy, IngestError, Result};
use crate::ingest::item::{Block, BlockKind};
use crate::ingest::route;
use log::{debug, trace};
use tokio::sync::mpsc;

/// Computes the digest of every chunk from its blocks
///
/// Blocks are forwarded unchanged to one of the downstream queues, picked
/// by chunk tag so a chunk's blocks stay in order on a single worker.
pub struct HashStage {
    outputs: Vec<mpsc::Sender<Block>>,
    failure: FailurePolicy,
}

impl HashStage {
    pub fn new(outputs: Vec<mpsc::Sender<Block>>, failure: FailurePolicy) -> Self {
        Self { outputs, failure }
    }

    /// Hash one block and pass it on
    ///
    /// A contract violation is escalated and the block dropped. Fails only
    /// when the downstream queue is closed.
    pub fn process(&self, block: Block) -> Result<()> {
        let chunk = block.chunk().clone();
        let hashed = match block.kind() {
            BlockKind::Data(data) => chunk.update_hash(data),
            BlockKind::Stop => chunk.finalize_hash().map(|digest| {
                trace!("chunk {} at offset {}: {}", chunk.tag(), chunk.offset(), digest);
            }),
        };
        if let Err(e) = hashed {
            self.failure.escalate(e);
            return Ok(());
        }

        let output = self
            .outputs
            .get(route(chunk.tag(), self.outputs.len()))
            .ok_or_else(|| IngestError::resource_unavailable("write stage queue", "no outputs"))?;
        output
            .blocking_send(block)
            .map_err(|_| IngestError::resource_unavailable("write stage queue", "closed"))
    }

    /// Worker loop: process blocks until the input queue closes
    pub fn run(self, mut input: mpsc::Receiver<Block>) {
        debug!("hash worker started");
        while let Some(block) = input.blocking_recv() {
            if let Err(e) = self.process(block) {
                self.failure.escalate(e);
                break;
            }
        }
        debug!("hash worker stopped");
    }
}
