use crate::error::Result;
use crate::hash::ContentHash;
use crate::upload::types::{self, UploadCallback, UploadStreamHandle, UploaderResults};
use bytes::Bytes;
use std::sync::Arc;

/// Capability interface the upload dispatch stage talks to
///
/// Scheduling calls return immediately. Each callback handed to the uploader
/// fires exactly once, on the uploader's own thread, with the outcome of the
/// operation it belongs to.
pub trait Uploader: Send + Sync {
    /// Open a streamed upload; `on_commit` fires once the stream is committed
    fn init_streamed_upload(&self, on_commit: UploadCallback) -> Result<Arc<UploadStreamHandle>>;

    /// Queue `buffer` for appending to the stream
    fn schedule_upload(
        &self,
        handle: &Arc<UploadStreamHandle>,
        buffer: Bytes,
        callback: UploadCallback,
    );

    /// Queue the commit of the stream under `digest`
    ///
    /// A bulk commit also stores the content as a whole-file object.
    fn schedule_commit(&self, handle: &Arc<UploadStreamHandle>, digest: ContentHash, bulk: bool);

    /// Block until every scheduled operation has completed
    ///
    /// Fails if the uploader stopped before draining its queue.
    fn wait_for_upload(&self) -> Result<()>;

    /// Record the root hash transition of a publish
    fn finalize_session(&self, _old_root_hash: &str, _new_root_hash: &str) -> Result<()> {
        Ok(())
    }

    fn respond(&self, callback: UploadCallback, results: UploaderResults) {
        types::respond(callback, results)
    }
}
