//! The uploader shared by every backend
//!
//! All writes and commits go through one writer thread fed by a bounded
//! queue, so the operations on one stream are applied in the order they were
//! scheduled.

use crate::config::IngestConfig;
use crate::error::{FailurePolicy, IngestError, Result};
use crate::hash::ContentHash;
use crate::upload::backends::Backend;
use crate::upload::definition::SpoolerDefinition;
use crate::upload::types::{
    respond, UploadCallback, UploadKind, UploadStreamHandle, UploaderResults,
};
use crate::upload::uploader::Uploader;
use bytes::Bytes;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;

enum WriteJob {
    Upload {
        handle: Arc<UploadStreamHandle>,
        buffer: Bytes,
        callback: UploadCallback,
    },
    Commit {
        handle: Arc<UploadStreamHandle>,
        digest: ContentHash,
        bulk: bool,
    },
}

#[derive(Default)]
struct InFlightState {
    count: u64,
    writer_stopped: bool,
}

/// Number of scheduled operations whose callback has not fired yet
#[derive(Default)]
struct InFlight {
    state: Mutex<InFlightState>,
    idle: Condvar,
}

impl InFlight {
    fn lock(&self) -> MutexGuard<'_, InFlightState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn begin(&self) {
        self.lock().count += 1;
    }

    fn end(&self) {
        let mut state = self.lock();
        state.count = state.count.saturating_sub(1);
        if state.count == 0 {
            self.idle.notify_all();
        }
    }

    /// Mark the writer as gone and wake every waiter
    fn writer_stopped(&self) {
        self.lock().writer_stopped = true;
        self.idle.notify_all();
    }

    /// Block until nothing is in flight; fails once the writer has stopped
    fn wait_idle(&self) -> Result<()> {
        let mut state = self.lock();
        while state.count > 0 && !state.writer_stopped {
            state = self.idle.wait(state).unwrap_or_else(|e| e.into_inner());
        }
        if state.writer_stopped {
            return Err(IngestError::resource_unavailable(
                "uploader writer thread",
                format!("stopped with {} operations outstanding", state.count),
            ));
        }
        Ok(())
    }
}

/// Releases one in-flight operation, even if its callback unwinds
///
/// A callback that panics takes the writer down with it, so the writer is
/// marked stopped before the count drops.
struct JobGuard<'a>(&'a InFlight);

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.writer_stopped();
        }
        self.0.end();
    }
}

/// Marks the writer stopped when its loop exits, however it exits
struct WriterExit(Arc<InFlight>);

impl Drop for WriterExit {
    fn drop(&mut self) {
        self.0.writer_stopped();
    }
}

/// Return code reported to callbacks for a failed operation
fn return_code(error: &IngestError) -> i32 {
    match error {
        IngestError::Io(e) => e.raw_os_error().unwrap_or(1),
        IngestError::UploadFailed { code, .. } => *code,
        _ => 1,
    }
}

pub struct UploadFacility {
    backend: Arc<Backend>,
    queue: Mutex<Option<mpsc::Sender<WriteJob>>>,
    in_flight: Arc<InFlight>,
    next_stream: AtomicU64,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl UploadFacility {
    /// Start the writer thread for `backend`
    pub fn new(backend: Backend, queue_capacity: usize) -> Result<Self> {
        let backend = Arc::new(backend);
        let in_flight = Arc::new(InFlight::default());
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));

        let writer = {
            let backend = backend.clone();
            let in_flight = in_flight.clone();
            thread::Builder::new()
                .name(format!("{}-writer", backend.kind()))
                .spawn(move || write_loop(backend, in_flight, rx))
                .map_err(|e| {
                    IngestError::resource_unavailable("uploader writer thread", e.to_string())
                })?
        };

        info!("{} uploader started", backend.kind());
        Ok(Self {
            backend,
            queue: Mutex::new(Some(tx)),
            in_flight,
            next_stream: AtomicU64::new(1),
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Build the backend a spooler definition names and start the uploader
    pub fn from_definition(
        definition: &SpoolerDefinition,
        config: &IngestConfig,
        failure: FailurePolicy,
    ) -> Result<Self> {
        let backend = Backend::from_definition(definition, config, failure)?;
        Self::new(backend, config.queue_capacity)
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Queue a job; a closed queue fails the job on the caller's thread
    fn enqueue(&self, job: WriteJob) {
        let sender = self
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        self.in_flight.begin();
        let rejected = match sender {
            Some(sender) => sender.blocking_send(job).err().map(|e| e.0),
            None => Some(job),
        };
        if let Some(job) = rejected {
            let _guard = JobGuard(&self.in_flight);
            warn!("uploader is shut down, failing scheduled operation");
            fail(job, 1);
        }
    }
}

fn fail(job: WriteJob, code: i32) {
    match job {
        WriteJob::Upload { callback, .. } => {
            respond(callback, UploaderResults::failure(UploadKind::BufferUpload, code))
        }
        WriteJob::Commit { handle, .. } => {
            if let Some(callback) = handle.take_commit_callback() {
                respond(callback, UploaderResults::failure(UploadKind::ChunkCommit, code));
            }
        }
    }
}

fn write_loop(backend: Arc<Backend>, in_flight: Arc<InFlight>, mut jobs: mpsc::Receiver<WriteJob>) {
    debug!("uploader writer started");
    let _exit = WriterExit(in_flight.clone());
    while let Some(job) = jobs.blocking_recv() {
        let _guard = JobGuard(&in_flight);
        match job {
            WriteJob::Upload {
                handle,
                buffer,
                callback,
            } => {
                let results = match handle.with_target(|target| target.append(&buffer)) {
                    Ok(()) => UploaderResults::success(UploadKind::BufferUpload),
                    Err(e) => {
                        warn!("stream {}: write failed: {}", handle.id(), e);
                        UploaderResults::failure(UploadKind::BufferUpload, return_code(&e))
                    }
                };
                respond(callback, results);
            }
            WriteJob::Commit {
                handle,
                digest,
                bulk,
            } => {
                let results = match backend.commit(handle.close_target(), &digest, bulk) {
                    Ok(objects) => {
                        debug!("stream {}: committed {}", handle.id(), objects.join(", "));
                        UploaderResults::committed(objects)
                    }
                    Err(e) => {
                        warn!("stream {}: commit of {} failed: {}", handle.id(), digest, e);
                        UploaderResults::failure(UploadKind::ChunkCommit, return_code(&e))
                    }
                };
                match handle.take_commit_callback() {
                    Some(callback) => respond(callback, results),
                    None => error!("stream {} has no commit callback left", handle.id()),
                }
            }
        }
    }
    debug!("uploader writer stopped");
}

impl Uploader for UploadFacility {
    fn init_streamed_upload(&self, on_commit: UploadCallback) -> Result<Arc<UploadStreamHandle>> {
        let target = self.backend.open_target()?;
        let id = self.next_stream.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(UploadStreamHandle::new(id, on_commit, target)))
    }

    fn schedule_upload(
        &self,
        handle: &Arc<UploadStreamHandle>,
        buffer: Bytes,
        callback: UploadCallback,
    ) {
        self.enqueue(WriteJob::Upload {
            handle: handle.clone(),
            buffer,
            callback,
        });
    }

    fn schedule_commit(&self, handle: &Arc<UploadStreamHandle>, digest: ContentHash, bulk: bool) {
        self.enqueue(WriteJob::Commit {
            handle: handle.clone(),
            digest,
            bulk,
        });
    }

    fn wait_for_upload(&self) -> Result<()> {
        self.in_flight.wait_idle()?;
        self.backend.wait_for_upload();
        Ok(())
    }

    fn finalize_session(&self, old_root_hash: &str, new_root_hash: &str) -> Result<()> {
        self.wait_for_upload()?;
        self.backend.finalize_session(old_root_hash, new_root_hash)
    }
}

impl Drop for UploadFacility {
    fn drop(&mut self) {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).take();
        let writer = self.writer.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(writer) = writer {
            if writer.join().is_err() {
                error!("uploader writer panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::backends::MemoryBackend;
    use std::sync::mpsc as std_mpsc;

    fn facility() -> UploadFacility {
        UploadFacility::new(Backend::Memory(MemoryBackend::new()), 4).unwrap()
    }

    #[test]
    fn test_upload_and_commit() {
        let facility = facility();
        let (tx, rx) = std_mpsc::channel();

        let commit_tx = tx.clone();
        let handle = facility
            .init_streamed_upload(Box::new(move |results| {
                commit_tx.send(results).unwrap();
            }))
            .unwrap();

        for part in [&b"ab"[..], b"cd"] {
            let tx = tx.clone();
            facility.schedule_upload(
                &handle,
                Bytes::copy_from_slice(part),
                Box::new(move |results| tx.send(results).unwrap()),
            );
        }
        let digest = ContentHash::compute(b"abcd");
        facility.schedule_commit(&handle, digest, false);
        facility.wait_for_upload().unwrap();

        let results: Vec<_> = rx.try_iter().collect();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].kind, UploadKind::BufferUpload);
        assert_eq!(results[2].kind, UploadKind::ChunkCommit);
        assert!(results.iter().all(UploaderResults::is_ok));
        assert_eq!(results[2].objects, vec![format!("{}P", digest)]);

        let memory = facility.backend().as_memory().unwrap();
        assert_eq!(memory.get(&format!("{}P", digest)).unwrap(), b"abcd");
    }

    #[test]
    fn test_second_commit_fails_quietly() {
        let facility = facility();
        let (tx, rx) = std_mpsc::channel();
        let handle = facility
            .init_streamed_upload(Box::new(move |results| tx.send(results).unwrap()))
            .unwrap();

        let digest = ContentHash::compute(b"");
        facility.schedule_commit(&handle, digest, true);
        facility.schedule_commit(&handle, digest, true);
        facility.wait_for_upload().unwrap();

        let results: Vec<_> = rx.try_iter().collect();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].objects.len(), 2);
    }

    #[test]
    fn test_write_after_commit_reports_failure() {
        let facility = facility();
        let handle = facility.init_streamed_upload(Box::new(|_| {})).unwrap();
        facility.schedule_commit(&handle, ContentHash::compute(b""), false);

        let (tx, rx) = std_mpsc::channel();
        facility.schedule_upload(
            &handle,
            Bytes::from_static(b"late"),
            Box::new(move |results| tx.send(results).unwrap()),
        );
        facility.wait_for_upload().unwrap();

        let results = rx.recv().unwrap();
        assert!(!results.is_ok());
        assert_eq!(results.return_code, 1);
    }

    #[test]
    fn test_panicking_callback_stops_writer() {
        let facility = facility();
        let handle = facility.init_streamed_upload(Box::new(|_| {})).unwrap();
        facility.schedule_upload(
            &handle,
            Bytes::from_static(b"x"),
            Box::new(|_| panic!("callback failed")),
        );

        match facility.wait_for_upload() {
            Err(IngestError::ResourceUnavailable { resource, .. }) => {
                assert_eq!(resource, "uploader writer thread");
            }
            other => panic!("Expected ResourceUnavailable, got: {:?}", other),
        }
        assert!(facility
            .finalize_session(&"0".repeat(64), &"1".repeat(64))
            .is_err());
    }

    #[test]
    fn test_return_code() {
        let io = IngestError::from(std::io::Error::from_raw_os_error(28));
        assert_eq!(return_code(&io), 28);
        assert_eq!(return_code(&IngestError::upload_failed("block", 7)), 7);
        assert_eq!(return_code(&IngestError::session_error("x")), 1);
    }
}
