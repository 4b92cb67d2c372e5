//! Worker threads and queues connecting the ingestion stages
//!
//! ```text
//! caller ─ splitter ─▶ hash workers ─▶ write workers ─▶ uploader
//!                                                          │
//!                         processed files ◀── commit callbacks
//! ```

use crate::config::IngestConfig;
use crate::error::{FailurePolicy, IngestError, Result};
use crate::ingest::hash_stage::HashStage;
use crate::ingest::item::{Block, FileItem};
use crate::ingest::route;
use crate::ingest::splitter::FileSplitter;
use crate::ingest::write_stage::WriteStage;
use crate::upload::Uploader;
use log::{debug, error, info};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;

pub struct IngestionPipeline {
    splitter: FileSplitter,
    inputs: Vec<mpsc::Sender<Block>>,
    workers: Vec<JoinHandle<()>>,
    uploader: Arc<dyn Uploader>,
    processed: mpsc::UnboundedReceiver<Arc<FileItem>>,
    failure: FailurePolicy,
}

fn spawn_worker<F>(name: String, work: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name)
        .spawn(work)
        .map_err(|e| IngestError::resource_unavailable("pipeline worker thread", e.to_string()))
}

impl IngestionPipeline {
    /// Start the hash and write workers
    pub fn new(
        config: &IngestConfig,
        uploader: Arc<dyn Uploader>,
        failure: FailurePolicy,
    ) -> Result<Self> {
        config.validate()?;
        let splitter = FileSplitter::from_config(config)?;
        let (files_tx, processed) = mpsc::unbounded_channel();
        let mut workers = Vec::with_capacity(config.hash_workers + config.write_workers);

        let mut write_inputs = Vec::with_capacity(config.write_workers);
        for index in 0..config.write_workers {
            let (tx, rx) = mpsc::channel(config.queue_capacity);
            let stage = WriteStage::new(uploader.clone(), files_tx.clone(), failure.clone());
            workers.push(spawn_worker(format!("write-{}", index), move || stage.run(rx))?);
            write_inputs.push(tx);
        }

        let mut inputs = Vec::with_capacity(config.hash_workers);
        for index in 0..config.hash_workers {
            let (tx, rx) = mpsc::channel(config.queue_capacity);
            let stage = HashStage::new(write_inputs.clone(), failure.clone());
            workers.push(spawn_worker(format!("hash-{}", index), move || stage.run(rx))?);
            inputs.push(tx);
        }

        info!(
            "pipeline started: {} hash workers, {} write workers",
            config.hash_workers, config.write_workers
        );
        Ok(Self {
            splitter,
            inputs,
            workers,
            uploader,
            processed,
            failure,
        })
    }

    /// Feed a block into the hash stage
    pub fn submit(&self, block: Block) -> Result<()> {
        let input = self
            .inputs
            .get(route(block.chunk().tag(), self.inputs.len()))
            .ok_or_else(|| IngestError::resource_unavailable("hash stage queue", "closed"))?;
        input
            .blocking_send(block)
            .map_err(|_| IngestError::resource_unavailable("hash stage queue", "closed"))
    }

    pub fn process_file(&self, path: impl AsRef<Path>) -> Result<Arc<FileItem>> {
        debug!("ingesting {}", path.as_ref().display());
        self.splitter.split_file(path, |block| self.submit(block))
    }

    pub fn process_reader<R: Read>(
        &self,
        path: impl Into<PathBuf>,
        size: u64,
        reader: R,
    ) -> Result<Arc<FileItem>> {
        self.splitter
            .split_reader(path, size, reader, |block| self.submit(block))
    }

    /// A file whose every chunk has been committed, if one is ready
    pub fn try_next_processed(&mut self) -> Option<Arc<FileItem>> {
        self.processed.try_recv().ok()
    }

    /// Drain the pipeline and return the files processed since the last
    /// [`try_next_processed`](Self::try_next_processed)
    pub fn finish(mut self) -> Result<Vec<Arc<FileItem>>> {
        self.shutdown()?;
        let mut files = Vec::new();
        while let Ok(file) = self.processed.try_recv() {
            files.push(file);
        }
        self.failure.check()?;
        info!("pipeline finished: {} files processed", files.len());
        Ok(files)
    }

    /// Close the input queues, join the workers and wait for the uploader
    fn shutdown(&mut self) -> Result<()> {
        self.inputs.clear();
        let mut panicked = 0;
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                panicked += 1;
            }
        }
        let drained = self.uploader.wait_for_upload();
        if panicked > 0 {
            error!("{} pipeline workers panicked", panicked);
            return Err(IngestError::resource_unavailable(
                "pipeline worker thread",
                format!("{} workers panicked", panicked),
            ));
        }
        drained
    }
}

impl Drop for IngestionPipeline {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            let _ = self.shutdown();
        }
    }
}
