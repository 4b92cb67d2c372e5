use crate::error::{IngestError, Result};
use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tempfile::NamedTempFile;

/// Which kind of operation a result belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    BufferUpload,
    ChunkCommit,
}

/// Outcome handed to a completion callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploaderResults {
    pub kind: UploadKind,
    /// Zero on success
    pub return_code: i32,
    /// Names of the objects stored by a successful commit
    pub objects: Vec<String>,
}

impl UploaderResults {
    pub fn success(kind: UploadKind) -> Self {
        Self {
            kind,
            return_code: 0,
            objects: Vec::new(),
        }
    }

    pub fn failure(kind: UploadKind, return_code: i32) -> Self {
        Self {
            kind,
            return_code,
            objects: Vec::new(),
        }
    }

    pub fn committed(objects: Vec<String>) -> Self {
        Self {
            kind: UploadKind::ChunkCommit,
            return_code: 0,
            objects,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.return_code == 0
    }
}

/// A single-use completion callback
pub type UploadCallback = Box<dyn FnOnce(UploaderResults) + Send + 'static>;

/// Invoke a completion callback, consuming it
pub fn respond(callback: UploadCallback, results: UploaderResults) {
    callback(results)
}

/// Where the bytes of a streamed upload go until it is committed
pub enum StreamTarget {
    /// A temporary file in the spooler's scratch directory
    TempFile(NamedTempFile),
    /// An in-memory buffer
    Buffer(Vec<u8>),
    /// The stream has been committed
    Closed,
}

impl StreamTarget {
    pub fn buffer() -> Self {
        StreamTarget::Buffer(Vec::new())
    }

    /// Append bytes to the stream
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        match self {
            StreamTarget::TempFile(file) => file.write_all(data)?,
            StreamTarget::Buffer(buf) => buf.extend_from_slice(data),
            StreamTarget::Closed => {
                return Err(IngestError::contract_violation(
                    "write to an already committed stream",
                ))
            }
        }
        Ok(())
    }
}

impl fmt::Debug for StreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamTarget::TempFile(file) => f
                .debug_tuple("TempFile")
                .field(&PathBuf::from(file.path()))
                .finish(),
            StreamTarget::Buffer(buf) => f.debug_tuple("Buffer").field(&buf.len()).finish(),
            StreamTarget::Closed => f.write_str("Closed"),
        }
    }
}

/// An open streamed upload
///
/// Created by [`Uploader::init_streamed_upload`](super::Uploader::init_streamed_upload)
/// together with the callback that fires once the stream is committed.
pub struct UploadStreamHandle {
    id: u64,
    on_commit: Mutex<Option<UploadCallback>>,
    target: Mutex<StreamTarget>,
}

impl UploadStreamHandle {
    pub fn new(id: u64, on_commit: UploadCallback, target: StreamTarget) -> Self {
        Self {
            id,
            on_commit: Mutex::new(Some(on_commit)),
            target: Mutex::new(target),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Take the commit callback; `None` once it has been taken
    pub fn take_commit_callback(&self) -> Option<UploadCallback> {
        self.on_commit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Run `f` with exclusive access to the stream target
    pub fn with_target<R>(&self, f: impl FnOnce(&mut StreamTarget) -> R) -> R {
        let mut target = self.target.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut target)
    }

    /// Replace the target with `Closed`, returning what was there
    pub fn close_target(&self) -> StreamTarget {
        self.with_target(|target| std::mem::replace(target, StreamTarget::Closed))
    }
}

impl fmt::Debug for UploadStreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadStreamHandle")
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_results() {
        assert!(UploaderResults::success(UploadKind::BufferUpload).is_ok());
        assert!(!UploaderResults::failure(UploadKind::ChunkCommit, 5).is_ok());

        let committed = UploaderResults::committed(vec!["abcP".to_string()]);
        assert_eq!(committed.kind, UploadKind::ChunkCommit);
        assert_eq!(committed.objects, vec!["abcP".to_string()]);
    }

    #[test]
    fn test_commit_callback_taken_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let handle = UploadStreamHandle::new(
            1,
            Box::new(move |_| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            }),
            StreamTarget::buffer(),
        );

        let callback = handle.take_commit_callback().unwrap();
        assert!(handle.take_commit_callback().is_none());

        respond(callback, UploaderResults::committed(vec![]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_target() {
        let handle = UploadStreamHandle::new(2, Box::new(|_| {}), StreamTarget::buffer());
        handle
            .with_target(|target| target.append(b"da"))
            .unwrap();
        handle
            .with_target(|target| target.append(b"ta"))
            .unwrap();

        match handle.close_target() {
            StreamTarget::Buffer(buf) => assert_eq!(buf, b"data"),
            other => panic!("Expected Buffer, got: {:?}", other),
        }
        assert!(matches!(handle.close_target(), StreamTarget::Closed));
        assert!(handle
            .with_target(|target| target.append(b"late"))
            .is_err());
    }

    #[test]
    fn test_append_temp_file() {
        let mut target = StreamTarget::TempFile(NamedTempFile::new().unwrap());
        target.append(b"spooled").unwrap();
        if let StreamTarget::TempFile(file) = target {
            assert_eq!(std::fs::read(file.path()).unwrap(), b"spooled");
        }
    }
}
