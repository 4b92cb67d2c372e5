//! Batched uploads for one publish operation
//!
//! A [`SessionContext`] lives from the start of a publish until its root hash
//! transition has been committed. Small objects are committed into buckets
//! of the current [`ObjectPack`]; full packs are sealed and handed to a single
//! background worker that uploads them while ingestion keeps filling the
//! next pack.

use crate::completion::{completion, CompletionFuture, CompletionResolver};
use crate::error::{FailurePolicy, IngestError, Result};
use crate::hash::ObjectId;
use crate::session::pack::{Bucket, BucketContentType, ObjectPack, PackEntry};
use crate::session::remote::{CommitRequest, SessionCredentials, SessionRemote};
use bytesize::ByteSize;
use log::{debug, error, info, warn};
use once_cell::sync::OnceCell;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;

/// Default capacity of the job queue and of the result queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Active,
    Draining,
    Finalized,
}

/// Counters describing a session's progress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub jobs_dispatched: u64,
    pub jobs_finished: u64,
    pub jobs_failed: u64,
    pub bytes_committed: u64,
    pub bytes_dispatched: u64,
}

/// A sealed pack and the slot its upload outcome is reported to
struct UploadJob {
    pack: ObjectPack,
    result: CompletionResolver<bool>,
}

#[derive(Default)]
struct JobCounters {
    counts: Mutex<(u64, u64)>,
    changed: Condvar,
}

impl JobCounters {
    fn lock(&self) -> MutexGuard<'_, (u64, u64)> {
        self.counts.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn increment_dispatched(&self) {
        self.lock().0 += 1;
    }

    fn increment_finished(&self) {
        let mut counts = self.lock();
        counts.1 += 1;
        debug_assert!(counts.1 <= counts.0);
        self.changed.notify_all();
    }

    fn snapshot(&self) -> (u64, u64) {
        *self.lock()
    }

    fn wait_drained(&self) {
        let mut counts = self.lock();
        while counts.0 != counts.1 {
            counts = self
                .changed
                .wait(counts)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}

#[derive(Default)]
struct PackState {
    current: Option<ObjectPack>,
    open_buckets: HashSet<u64>,
    next_bucket: u64,
    bytes_committed: u64,
    bytes_dispatched: u64,
}

struct Settings {
    credentials: SessionCredentials,
    max_pack_size: u64,
}

/// Batching upload context of one publish session
pub struct SessionContext {
    remote: Arc<dyn SessionRemote>,
    failure: FailurePolicy,
    queue_capacity: usize,
    state: Mutex<SessionState>,
    settings: OnceCell<Arc<Settings>>,
    pack: Mutex<PackState>,
    jobs: Mutex<Option<mpsc::Sender<UploadJob>>>,
    results: Mutex<VecDeque<CompletionFuture<bool>>>,
    jobs_failed: AtomicU64,
    counters: Arc<JobCounters>,
    terminate: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SessionContext {
    pub fn new(remote: Arc<dyn SessionRemote>) -> Self {
        Self {
            remote,
            failure: FailurePolicy::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            state: Mutex::new(SessionState::Uninitialized),
            settings: OnceCell::new(),
            pack: Mutex::new(PackState::default()),
            jobs: Mutex::new(None),
            results: Mutex::new(VecDeque::new()),
            jobs_failed: AtomicU64::new(0),
            counters: Arc::new(JobCounters::default()),
            terminate: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    /// Set how pack upload failures on the worker are escalated
    pub fn failure_policy(mut self, failure: FailurePolicy) -> Self {
        self.failure = failure;
        self
    }

    /// Set the capacity of the job and result queues
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Start the session and its upload worker
    pub fn initialize(&self, credentials: SessionCredentials, max_pack_size: u64) -> Result<()> {
        credentials.validate()?;
        if max_pack_size == 0 {
            return Err(IngestError::invalid_parameter(
                "max_pack_size",
                "Maximum pack size must be greater than 0",
            ));
        }

        let mut state = self.lock_state();
        if *state != SessionState::Uninitialized {
            return Err(IngestError::session_error(format!(
                "cannot initialize a session in state {:?}",
                *state
            )));
        }

        let settings = Arc::new(Settings {
            credentials,
            max_pack_size,
        });
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let worker = UploadWorker {
            remote: self.remote.clone(),
            settings: settings.clone(),
            counters: self.counters.clone(),
            terminate: self.terminate.clone(),
            failure: self.failure.clone(),
        };
        let handle = thread::Builder::new()
            .name("session-upload".to_string())
            .spawn(move || worker.run(rx))
            .map_err(|e| IngestError::resource_unavailable("session worker thread", e.to_string()))?;

        info!(
            "session started against {} (max pack size {})",
            settings.credentials.api_url,
            ByteSize(max_pack_size)
        );
        let _ = self.settings.set(settings);
        *self.jobs.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        *state = SessionState::Active;
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        *self.lock_state()
    }

    pub fn stats(&self) -> SessionStats {
        let (jobs_dispatched, jobs_finished) = self.counters.snapshot();
        let pack = self.lock_pack();
        SessionStats {
            jobs_dispatched,
            jobs_finished,
            jobs_failed: self.jobs_failed.load(Ordering::SeqCst),
            bytes_committed: pack.bytes_committed,
            bytes_dispatched: pack.bytes_dispatched,
        }
    }

    /// Open a new bucket in the current pack
    pub fn new_bucket(&self) -> Result<Bucket> {
        let max_pack_size = self.active_settings("new_bucket")?.max_pack_size;
        let mut pack = self.lock_pack();
        if pack.current.is_none() {
            pack.current = Some(ObjectPack::new(max_pack_size));
        }
        let id = pack.next_bucket;
        pack.next_bucket += 1;
        pack.open_buckets.insert(id);
        Ok(Bucket::new(id))
    }

    /// Commit a bucket into the current pack
    ///
    /// Seals and queues the current pack first when the bucket does not fit,
    /// and seals right after the commit when `force` is set or the bucket
    /// alone exceeds the pack bound. Blocks while the job queue is full.
    pub fn commit_bucket(
        &self,
        content_type: BucketContentType,
        object_id: ObjectId,
        bucket: Bucket,
        name: Option<&str>,
        force: bool,
    ) -> Result<()> {
        let max_pack_size = self.active_settings("commit_bucket")?.max_pack_size;
        if content_type == BucketContentType::Named && name.is_none() {
            return Err(IngestError::invalid_parameter(
                "name",
                "Named objects require a name",
            ));
        }

        let mut pack = self.lock_pack();
        if !pack.open_buckets.remove(&bucket.id()) {
            return Err(IngestError::contract_violation(format!(
                "bucket {} is not open in this session",
                bucket.id()
            )));
        }

        let entry = PackEntry {
            content_type,
            object_id,
            name: name.map(str::to_string),
            content: bucket.into_content(),
        };
        let size = entry.size();

        let rejected = pack
            .current
            .get_or_insert_with(|| ObjectPack::new(max_pack_size))
            .commit(entry)
            .err();
        if let Some(entry) = rejected {
            self.seal(&mut pack, max_pack_size)?;
            let mut fresh = ObjectPack::new(max_pack_size);
            fresh
                .commit(entry)
                .map_err(|_| IngestError::contract_violation("empty pack rejected an object"))?;
            pack.current = Some(fresh);
        }
        pack.bytes_committed += size;

        let overfull = pack.current.as_ref().is_some_and(ObjectPack::is_overfull);
        if force || overfull {
            self.seal(&mut pack, max_pack_size)?;
        }
        Ok(())
    }

    /// Block until every queued pack has been uploaded
    pub fn wait_for_upload(&self) {
        self.counters.wait_drained();
    }

    /// Drain the session and commit the root hash transition
    pub fn finalize(&self, old_root_hash: &str, new_root_hash: &str) -> Result<()> {
        self.finalize_with(CommitRequest::new(old_root_hash, new_root_hash))
    }

    /// Like [`finalize`](Self::finalize) with a fully specified commit request
    pub fn finalize_with(&self, request: CommitRequest) -> Result<()> {
        request.validate()?;
        let settings = self.active_settings("finalize")?;
        let sealed = {
            let mut pack = self.lock_pack();
            if !pack.open_buckets.is_empty() {
                return Err(IngestError::contract_violation(format!(
                    "finalize called with {} uncommitted buckets",
                    pack.open_buckets.len()
                )));
            }
            *self.lock_state() = SessionState::Draining;
            if pack.current.as_ref().is_some_and(|p| !p.is_empty()) {
                self.seal(&mut pack, settings.max_pack_size)
            } else {
                Ok(())
            }
        };
        if let Err(e) = sealed {
            // the last pack never reached the worker; the session is unusable
            self.stop_worker();
            *self.lock_state() = SessionState::Finalized;
            error!("session finalize failed: {}", e);
            return Err(e);
        }

        self.wait_for_upload();
        self.reap_all();

        let failed = self.jobs_failed.load(Ordering::SeqCst);
        let mut outcome = if failed > 0 {
            Err(IngestError::session_error(format!(
                "{} pack uploads failed, not committing",
                failed
            )))
        } else {
            self.remote.commit(&settings.credentials, &request)
        };

        self.stop_worker();

        let stats = self.stats();
        if outcome.is_ok() && stats.bytes_committed != stats.bytes_dispatched {
            outcome = Err(IngestError::session_error(format!(
                "committed {} bytes but dispatched {}",
                stats.bytes_committed, stats.bytes_dispatched
            )));
        }
        *self.lock_state() = SessionState::Finalized;

        match &outcome {
            Ok(()) => info!(
                "session committed {} -> {} ({} packs, {})",
                request.old_root_hash,
                request.new_root_hash,
                stats.jobs_finished,
                ByteSize(stats.bytes_dispatched)
            ),
            Err(e) => error!("session finalize failed: {}", e),
        }
        outcome
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_pack(&self) -> MutexGuard<'_, PackState> {
        self.pack.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn active_settings(&self, operation: &str) -> Result<Arc<Settings>> {
        let state = self.lock_state();
        match (*state, self.settings.get()) {
            (SessionState::Active, Some(settings)) => Ok(settings.clone()),
            (state, _) => Err(IngestError::contract_violation(format!(
                "{} on a session in state {:?}",
                operation, state
            ))),
        }
    }

    /// Seal the current pack and queue it; a fresh pack becomes current
    fn seal(&self, pack: &mut PackState, max_pack_size: u64) -> Result<()> {
        let sealed = pack.current.replace(ObjectPack::new(max_pack_size));
        match sealed {
            Some(sealed) if !sealed.is_empty() => {
                pack.bytes_dispatched += sealed.size();
                self.dispatch(sealed)
            }
            _ => Ok(()),
        }
    }

    fn dispatch(&self, sealed: ObjectPack) -> Result<()> {
        let sender = self
            .jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| IngestError::session_error("session worker is stopped"))?;

        let (resolver, future) = completion();
        debug!(
            "queueing pack {}: {} objects, {}",
            future.id(),
            sealed.len(),
            ByteSize(sealed.size())
        );
        self.counters.increment_dispatched();
        let job = UploadJob {
            pack: sealed,
            result: resolver,
        };
        if sender.blocking_send(job).is_err() {
            self.counters.increment_finished();
            return Err(IngestError::session_error("session worker is gone"));
        }
        self.push_result(future);
        Ok(())
    }

    fn push_result(&self, future: CompletionFuture<bool>) {
        let mut results = self.results.lock().unwrap_or_else(|e| e.into_inner());
        if results.len() >= self.queue_capacity {
            if let Some(oldest) = results.pop_front() {
                self.reap(oldest);
            }
        }
        results.push_back(future);
    }

    fn reap(&self, future: CompletionFuture<bool>) {
        let id = future.id();
        match future.wait() {
            Some(true) => {}
            Some(false) => {
                warn!("pack {} failed to upload", id);
                self.jobs_failed.fetch_add(1, Ordering::SeqCst);
            }
            None => {
                warn!("pack {} was never resolved", id);
                self.jobs_failed.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn reap_all(&self) {
        let pending: Vec<_> = self
            .results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for future in pending {
            self.reap(future);
        }
    }

    fn stop_worker(&self) {
        self.terminate.store(true, Ordering::SeqCst);
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).take();
        let handle = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("session upload worker panicked");
            }
        }
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

struct UploadWorker {
    remote: Arc<dyn SessionRemote>,
    settings: Arc<Settings>,
    counters: Arc<JobCounters>,
    terminate: Arc<AtomicBool>,
    failure: FailurePolicy,
}

impl UploadWorker {
    fn run(self, mut jobs: mpsc::Receiver<UploadJob>) {
        debug!("session upload worker started");
        while let Some(UploadJob { pack, result }) = jobs.blocking_recv() {
            let id = result.id();
            let outcome = self.remote.upload_pack(&self.settings.credentials, &pack);
            result.resolve(outcome.is_ok());
            self.counters.increment_finished();

            match outcome {
                Ok(()) => debug!("pack {} uploaded ({})", id, ByteSize(pack.size())),
                Err(e) => self.failure.escalate(IngestError::session_error(format!(
                    "pack {} upload failed: {}",
                    id, e
                ))),
            }

            if self.terminate.load(Ordering::SeqCst) && jobs.is_empty() {
                break;
            }
        }
        debug!("session upload worker stopped");
    }
}
