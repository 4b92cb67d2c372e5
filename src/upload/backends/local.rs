//! Content-addressed directory tree
//!
//! Streams are spooled into temporary files below the scratch directory and
//! moved to `<root>/data/<hh>/<rest>` when committed.

use crate::error::{IngestError, Result};
use crate::hash::ObjectId;
use crate::upload::types::StreamTarget;
use log::debug;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

#[derive(Debug)]
pub struct LocalBackend {
    temp_dir: PathBuf,
    root: PathBuf,
}

impl LocalBackend {
    /// Create the backend, creating both directories if needed
    pub fn new(temp_dir: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Result<Self> {
        let backend = Self {
            temp_dir: temp_dir.into(),
            root: root.into(),
        };
        fs::create_dir_all(&backend.temp_dir)?;
        fs::create_dir_all(backend.root.join("data"))?;
        Ok(backend)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute location of a stored object
    pub fn object_path(&self, object: &ObjectId) -> PathBuf {
        self.root.join(object.relative_path())
    }

    pub(crate) fn open_target(&self) -> Result<StreamTarget> {
        let file = tempfile::Builder::new()
            .prefix("chunk.")
            .tempfile_in(&self.temp_dir)
            .map_err(|e| {
                IngestError::resource_unavailable(
                    format!("spool file in {}", self.temp_dir.display()),
                    e.to_string(),
                )
            })?;
        Ok(StreamTarget::TempFile(file))
    }

    pub(crate) fn commit(&self, target: StreamTarget, objects: &[ObjectId]) -> Result<()> {
        let mut file = match target {
            StreamTarget::TempFile(file) => file,
            StreamTarget::Buffer(content) => {
                let mut file = NamedTempFile::new_in(&self.temp_dir)?;
                file.write_all(&content)?;
                file
            }
            StreamTarget::Closed => {
                return Err(IngestError::contract_violation("commit of a closed stream"))
            }
        };
        file.flush()?;

        let Some((first, rest)) = objects.split_first() else {
            return Ok(());
        };
        for object in rest {
            let path = self.prepare(object)?;
            fs::copy(file.path(), &path)?;
            debug!("local: stored {}", path.display());
        }

        let path = self.prepare(first)?;
        if let Err(e) = file.persist(&path) {
            // rename fails across filesystems
            fs::copy(e.file.path(), &path)?;
        }
        debug!("local: stored {}", path.display());
        Ok(())
    }

    fn prepare(&self, object: &ObjectId) -> Result<PathBuf> {
        let path = self.object_path(object);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::ContentHash;
    use crate::upload::backends::committed_objects;
    use tempfile::tempdir;

    #[test]
    fn test_local_layout() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::new(dir.path().join("tmp"), dir.path().join("repo")).unwrap();

        let mut target = backend.open_target().unwrap();
        target.append(b"hello world").unwrap();
        let digest = ContentHash::compute(b"hello world");
        backend
            .commit(target, &committed_objects(&digest, false))
            .unwrap();

        let hex = digest.to_hex();
        let expected = dir
            .path()
            .join("repo/data")
            .join(&hex[..2])
            .join(format!("{}P", &hex[2..]));
        assert_eq!(fs::read(&expected).unwrap(), b"hello world");
        assert!(!backend.object_path(&ObjectId::bulk(digest)).exists());
        assert_eq!(fs::read_dir(dir.path().join("tmp")).unwrap().count(), 0);
    }

    #[test]
    fn test_local_bulk_copy() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::new(dir.path().join("tmp"), dir.path().join("repo")).unwrap();

        let mut target = backend.open_target().unwrap();
        target.append(b"sole").unwrap();
        let digest = ContentHash::compute(b"sole");
        backend
            .commit(target, &committed_objects(&digest, true))
            .unwrap();

        assert_eq!(
            fs::read(backend.object_path(&ObjectId::partial(digest))).unwrap(),
            b"sole"
        );
        assert_eq!(
            fs::read(backend.object_path(&ObjectId::bulk(digest))).unwrap(),
            b"sole"
        );
    }
}
