//! Recording doubles shared by the integration tests

#![allow(dead_code)]

use bytes::Bytes;
use publish_ingest::session::{CommitRequest, ObjectPack, SessionCredentials, SessionRemote};
use publish_ingest::upload::{
    respond, StreamTarget, UploadCallback, UploadKind, UploadStreamHandle, Uploader,
    UploaderResults,
};
use publish_ingest::{ContentHash, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Init(u64),
    Upload(u64, Vec<u8>),
    Commit(u64, ContentHash, bool),
}

/// Records every uploader call; buffer uploads complete immediately, commit
/// callbacks fire only on [`complete_commits`](Self::complete_commits)
#[derive(Default)]
pub struct RecordingUploader {
    next: AtomicU64,
    calls: Mutex<Vec<Call>>,
    pending: Mutex<Vec<Arc<UploadStreamHandle>>>,
}

impl RecordingUploader {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn init_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Init(_)))
            .count()
    }

    /// Fire the callbacks of every commit seen so far
    pub fn complete_commits(&self) {
        let pending: Vec<_> = self.pending.lock().unwrap().drain(..).collect();
        for handle in pending {
            if let Some(callback) = handle.take_commit_callback() {
                respond(callback, UploaderResults::committed(vec![]));
            }
        }
    }
}

impl Uploader for RecordingUploader {
    fn init_streamed_upload(&self, on_commit: UploadCallback) -> Result<Arc<UploadStreamHandle>> {
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().unwrap().push(Call::Init(id));
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
        self.calls
            .lock()
            .unwrap()
            .push(Call::Upload(handle.id(), buffer.to_vec()));
        respond(callback, UploaderResults::success(UploadKind::BufferUpload));
    }

    fn schedule_commit(&self, handle: &Arc<UploadStreamHandle>, digest: ContentHash, bulk: bool) {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Commit(handle.id(), digest, bulk));
        self.pending.lock().unwrap().push(handle.clone());
    }

    fn wait_for_upload(&self) -> Result<()> {
        self.complete_commits();
        Ok(())
    }
}

/// A session remote that keeps every pack it is sent
#[derive(Default)]
pub struct RecordingRemote {
    pub packs: Mutex<Vec<ObjectPack>>,
    pub commits: Mutex<Vec<CommitRequest>>,
}

impl RecordingRemote {
    pub fn pack_sizes(&self) -> Vec<u64> {
        self.packs.lock().unwrap().iter().map(ObjectPack::size).collect()
    }
}

impl SessionRemote for RecordingRemote {
    fn upload_pack(&self, _credentials: &SessionCredentials, pack: &ObjectPack) -> Result<()> {
        self.packs.lock().unwrap().push(pack.clone());
        Ok(())
    }

    fn commit(&self, _credentials: &SessionCredentials, request: &CommitRequest) -> Result<()> {
        self.commits.lock().unwrap().push(request.clone());
        Ok(())
    }
}

pub fn credentials() -> SessionCredentials {
    SessionCredentials::new("http://localhost:4929/api/v1", "token", "key", "secret")
}
