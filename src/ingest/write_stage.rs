use crate::error::{FailurePolicy, IngestError, Result};
use crate::ingest::item::{Block, BlockKind, ChunkItem, FileChunk, FileItem};
use crate::upload::{UploadCallback, UploadStreamHandle, Uploader};
use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Hands hashed blocks to the uploader
///
/// Each chunk gets one streamed upload, opened by its first block. Data
/// blocks are appended to the stream and released once written; the Stop
/// block commits the stream under the chunk's digest. Files whose every
/// chunk has been committed are sent to the processed-files queue.
pub struct WriteStage {
    uploader: Arc<dyn Uploader>,
    files: mpsc::UnboundedSender<Arc<FileItem>>,
    failure: FailurePolicy,
}

impl WriteStage {
    pub fn new(
        uploader: Arc<dyn Uploader>,
        files: mpsc::UnboundedSender<Arc<FileItem>>,
        failure: FailurePolicy,
    ) -> Self {
        Self {
            uploader,
            files,
            failure,
        }
    }

    pub fn process(&self, block: Block) {
        let chunk = block.chunk().clone();
        let handle = match self.stream_for(&chunk) {
            Ok(handle) => handle,
            Err(e) => {
                self.failure.escalate(e);
                return;
            }
        };

        let payload = match block.kind() {
            BlockKind::Data(data) => Some(data.clone()),
            BlockKind::Stop => None,
        };
        match payload {
            Some(data) => {
                let failure = self.failure.clone();
                self.uploader.schedule_upload(
                    &handle,
                    data,
                    Box::new(move |results| {
                        if !results.is_ok() {
                            failure.escalate(IngestError::upload_failed(
                                "block",
                                results.return_code,
                            ));
                        }
                        drop(block);
                    }),
                );
            }
            None => {
                if chunk.is_sole_piece() {
                    chunk.make_bulk_chunk();
                }
                match chunk.digest() {
                    Some(digest) => {
                        self.uploader
                            .schedule_commit(&handle, digest, chunk.is_bulk())
                    }
                    None => self.failure.escalate(IngestError::contract_violation(format!(
                        "stop block of chunk {} reached upload before its digest",
                        chunk.tag()
                    ))),
                }
            }
        }
    }

    /// Worker loop: process blocks until the input queue closes
    pub fn run(self, mut input: mpsc::Receiver<Block>) {
        debug!("write worker started");
        while let Some(block) = input.blocking_recv() {
            self.process(block);
        }
        debug!("write worker stopped");
    }

    fn stream_for(&self, chunk: &Arc<ChunkItem>) -> Result<Arc<UploadStreamHandle>> {
        chunk
            .upload_handle_or_open(|| {
                self.uploader
                    .init_streamed_upload(self.on_chunk_commit(chunk.clone()))
            })
            .map_err(|e| {
                IngestError::resource_unavailable(
                    format!("upload stream for chunk {}", chunk.tag()),
                    e.to_string(),
                )
            })
    }

    /// The callback owns the chunk until its commit has been acknowledged
    fn on_chunk_commit(&self, chunk: Arc<ChunkItem>) -> UploadCallback {
        let files = self.files.clone();
        let failure = self.failure.clone();
        Box::new(move |results| {
            if !results.is_ok() {
                failure.escalate(IngestError::upload_failed("chunk", results.return_code));
                return;
            }
            let Some(digest) = chunk.digest() else {
                failure.escalate(IngestError::contract_violation(format!(
                    "chunk {} committed without a digest",
                    chunk.tag()
                )));
                return;
            };

            let file = chunk.file();
            if chunk.is_bulk() {
                file.set_bulk_hash(digest);
            }
            let completed = file.register_chunk(FileChunk {
                digest,
                offset: chunk.offset(),
                size: chunk.size(),
            });
            if completed {
                debug!("{} processed", file.path().display());
                if files.send(file.clone()).is_err() {
                    warn!("processed file {} dropped", file.path().display());
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::ContentHash;
    use crate::upload::{respond, StreamTarget, UploadKind, UploaderResults};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Completes every operation synchronously on the caller's thread
    #[derive(Default)]
    struct ImmediateUploader {
        opened: AtomicUsize,
        next: AtomicU64,
        writes: Mutex<Vec<(u64, Bytes)>>,
        commits: Mutex<Vec<(u64, ContentHash, bool)>>,
        fail_writes: bool,
        fail_commits: bool,
    }

    impl Uploader for ImmediateUploader {
        fn init_streamed_upload(
            &self,
            on_commit: UploadCallback,
        ) -> Result<Arc<UploadStreamHandle>> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            let id = self.next.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(UploadStreamHandle::new(
                id,
                on_commit,
                StreamTarget::buffer(),
            )))
        }

        fn schedule_upload(
            &self,
            handle: &Arc<UploadStreamHandle>,
            buffer: Bytes,
            callback: UploadCallback,
        ) {
            self.writes.lock().unwrap().push((handle.id(), buffer));
            let results = if self.fail_writes {
                UploaderResults::failure(UploadKind::BufferUpload, 28)
            } else {
                UploaderResults::success(UploadKind::BufferUpload)
            };
            respond(callback, results);
        }

        fn schedule_commit(
            &self,
            handle: &Arc<UploadStreamHandle>,
            digest: ContentHash,
            bulk: bool,
        ) {
            self.commits.lock().unwrap().push((handle.id(), digest, bulk));
            let results = if self.fail_commits {
                UploaderResults::failure(UploadKind::ChunkCommit, 5)
            } else {
                UploaderResults::committed(vec![])
            };
            if let Some(callback) = handle.take_commit_callback() {
                respond(callback, results);
            }
        }

        fn wait_for_upload(&self) -> Result<()> {
            Ok(())
        }
    }

    fn hashed_chunk(file: &Arc<FileItem>, offset: u64, data: &[u8], sole: bool) -> Arc<ChunkItem> {
        let chunk = Arc::new(ChunkItem::new(file.clone(), offset, data.len() as u64, sole));
        chunk.update_hash(data).unwrap();
        chunk.finalize_hash().unwrap();
        chunk
    }

    #[test]
    fn test_sole_piece_is_bulk() {
        let uploader = Arc::new(ImmediateUploader::default());
        let (files_tx, mut files_rx) = mpsc::unbounded_channel();
        let stage = WriteStage::new(uploader.clone(), files_tx, FailurePolicy::Panic);

        let file = Arc::new(FileItem::new("/test/one", 4));
        file.set_expected_chunks(1);
        let chunk = hashed_chunk(&file, 0, b"data", true);

        stage.process(Block::data(chunk.clone(), &b"data"[..]));
        stage.process(Block::stop(chunk.clone()));

        let commits = uploader.commits.lock().unwrap();
        assert_eq!(*commits, vec![(0, ContentHash::compute(b"data"), true)]);
        assert_eq!(file.bulk_hash(), Some(ContentHash::compute(b"data")));
        assert!(Arc::ptr_eq(&files_rx.try_recv().unwrap(), &file));
        assert!(files_rx.try_recv().is_err());
    }

    #[test]
    fn test_handle_opened_once_per_chunk() {
        let uploader = Arc::new(ImmediateUploader::default());
        let (files_tx, _files_rx) = mpsc::unbounded_channel();
        let stage = WriteStage::new(uploader.clone(), files_tx, FailurePolicy::Panic);

        let file = Arc::new(FileItem::new("/test/two", 8));
        file.set_expected_chunks(2);
        let first = hashed_chunk(&file, 0, b"abcd", false);
        let second = hashed_chunk(&file, 4, b"efgh", false);

        for chunk in [&first, &second] {
            stage.process(Block::data(chunk.clone(), &b"ab"[..]));
            stage.process(Block::data(chunk.clone(), &b"cd"[..]));
            stage.process(Block::stop(chunk.clone()));
        }

        assert_eq!(uploader.opened.load(Ordering::SeqCst), 2);
        assert_eq!(uploader.writes.lock().unwrap().len(), 4);
        let commits = uploader.commits.lock().unwrap();
        assert!(commits.iter().all(|(_, _, bulk)| !bulk));
        assert!(file.is_processed());
        assert!(file.bulk_hash().is_none());
        assert_eq!(file.chunks().len(), 2);
    }

    #[test]
    fn test_failed_commit_escalates() {
        let uploader = Arc::new(ImmediateUploader {
            fail_commits: true,
            ..Default::default()
        });
        let (files_tx, mut files_rx) = mpsc::unbounded_channel();
        let (policy, latch) = FailurePolicy::collect();
        let stage = WriteStage::new(uploader, files_tx, policy);

        let file = Arc::new(FileItem::new("/test/fail", 1));
        file.set_expected_chunks(1);
        let chunk = hashed_chunk(&file, 0, b"x", true);
        stage.process(Block::stop(chunk));

        assert_eq!(latch.count(), 1);
        assert_eq!(
            latch.take().unwrap().to_string(),
            "chunk upload failed (code: 5)"
        );
        assert!(!file.is_processed());
        assert!(files_rx.try_recv().is_err());
    }

    #[test]
    fn test_failed_block_upload_escalates() {
        let uploader = Arc::new(ImmediateUploader {
            fail_writes: true,
            ..Default::default()
        });
        let (files_tx, mut files_rx) = mpsc::unbounded_channel();
        let (policy, latch) = FailurePolicy::collect();
        let stage = WriteStage::new(uploader.clone(), files_tx, policy);

        let file = Arc::new(FileItem::new("/test/full-disk", 4));
        file.set_expected_chunks(1);
        let chunk = hashed_chunk(&file, 0, b"data", true);
        stage.process(Block::data(chunk, &b"data"[..]));

        assert_eq!(uploader.writes.lock().unwrap().len(), 1);
        assert!(uploader.commits.lock().unwrap().is_empty());
        assert_eq!(latch.count(), 1);
        assert_eq!(
            latch.take().unwrap().to_string(),
            "block upload failed (code: 28)"
        );
        assert!(!file.is_processed());
        assert!(files_rx.try_recv().is_err());
    }
}
