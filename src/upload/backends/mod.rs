//! Storage backends behind the upload facility
//!
//! The set of backends is closed; a [`SpoolerDefinition`] selects one by its
//! scheme.

pub mod gateway;
pub mod local;
pub mod memory;

pub use gateway::GatewayBackend;
pub use local::LocalBackend;
pub use memory::MemoryBackend;

use crate::config::IngestConfig;
use crate::error::{FailurePolicy, IngestError, Result};
use crate::hash::{ContentHash, ObjectId};
use crate::session::context::SessionContext;
use crate::session::remote::GatewayClient;
use crate::upload::definition::{BackendKind, SpoolerDefinition};
use crate::upload::types::StreamTarget;
use std::sync::Arc;

/// The objects a commit stores: the partial chunk object and, for a bulk
/// chunk, the whole-file object with the same content
pub(crate) fn committed_objects(digest: &ContentHash, bulk: bool) -> Vec<ObjectId> {
    let mut objects = vec![ObjectId::partial(*digest)];
    if bulk {
        objects.push(ObjectId::bulk(*digest));
    }
    objects
}

pub enum Backend {
    Local(LocalBackend),
    Gateway(GatewayBackend),
    Memory(MemoryBackend),
}

impl Backend {
    /// Build the backend a spooler definition names
    ///
    /// The gateway backend starts its publish session against the
    /// definition's API URL with the credentials from `config`.
    pub fn from_definition(
        definition: &SpoolerDefinition,
        config: &IngestConfig,
        failure: FailurePolicy,
    ) -> Result<Self> {
        match definition.kind {
            BackendKind::Local => Ok(Backend::Local(LocalBackend::new(
                &definition.temp_dir,
                &definition.upstream,
            )?)),
            BackendKind::Memory => Ok(Backend::Memory(MemoryBackend::new())),
            BackendKind::Gateway => {
                let credentials = config.credentials(&definition.upstream)?;
                let session = SessionContext::new(Arc::new(GatewayClient::new()?))
                    .failure_policy(failure)
                    .queue_capacity(config.queue_capacity);
                session.initialize(credentials, config.max_pack_size)?;
                Ok(Backend::Gateway(GatewayBackend::new(Arc::new(session))))
            }
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Local(_) => BackendKind::Local,
            Backend::Gateway(_) => BackendKind::Gateway,
            Backend::Memory(_) => BackendKind::Memory,
        }
    }

    pub fn as_memory(&self) -> Option<&MemoryBackend> {
        match self {
            Backend::Memory(backend) => Some(backend),
            _ => None,
        }
    }

    pub fn as_gateway(&self) -> Option<&GatewayBackend> {
        match self {
            Backend::Gateway(backend) => Some(backend),
            _ => None,
        }
    }

    pub(crate) fn open_target(&self) -> Result<StreamTarget> {
        match self {
            Backend::Local(backend) => backend.open_target(),
            Backend::Gateway(_) | Backend::Memory(_) => Ok(StreamTarget::buffer()),
        }
    }

    /// Store a closed stream, returning the names of the stored objects
    pub(crate) fn commit(
        &self,
        target: StreamTarget,
        digest: &ContentHash,
        bulk: bool,
    ) -> Result<Vec<String>> {
        let objects = committed_objects(digest, bulk);
        match (self, target) {
            (_, StreamTarget::Closed) => {
                return Err(IngestError::contract_violation(format!(
                    "stream for {} committed twice",
                    digest
                )))
            }
            (Backend::Local(backend), target) => backend.commit(target, &objects)?,
            (Backend::Gateway(backend), StreamTarget::Buffer(content)) => {
                backend.commit(content, &objects)?
            }
            (Backend::Memory(backend), StreamTarget::Buffer(content)) => {
                backend.commit(content, &objects)
            }
            (backend, StreamTarget::TempFile(_)) => {
                return Err(IngestError::contract_violation(format!(
                    "{} backend cannot commit a spooled file",
                    backend.kind()
                )))
            }
        }
        Ok(objects.iter().map(ToString::to_string).collect())
    }

    pub(crate) fn wait_for_upload(&self) {
        if let Backend::Gateway(backend) = self {
            backend.session().wait_for_upload();
        }
    }

    pub(crate) fn finalize_session(&self, old_root_hash: &str, new_root_hash: &str) -> Result<()> {
        match self {
            Backend::Gateway(backend) => backend.session().finalize(old_root_hash, new_root_hash),
            Backend::Local(_) | Backend::Memory(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_committed_objects() {
        let digest = ContentHash::compute(b"chunk");
        let partial = committed_objects(&digest, false);
        assert_eq!(partial, vec![ObjectId::partial(digest)]);

        let bulk = committed_objects(&digest, true);
        assert_eq!(bulk.len(), 2);
        assert_eq!(bulk[1].to_string(), digest.to_hex());
    }

    #[test]
    fn test_from_definition() {
        let config = IngestConfig::new();
        let backend =
            Backend::from_definition(&SpoolerDefinition::memory(), &config, FailurePolicy::Panic)
                .unwrap();
        assert_eq!(backend.kind(), BackendKind::Memory);
        assert!(backend.as_memory().is_some());

        let gw = SpoolerDefinition::gateway("/tmp", "http://localhost:4929/api/v1");
        assert!(matches!(
            Backend::from_definition(&gw, &config, FailurePolicy::Panic),
            Err(IngestError::ConfigError { .. })
        ));
    }

    #[test]
    fn test_commit_closed_stream_fails() {
        let backend = Backend::Memory(MemoryBackend::new());
        let digest = ContentHash::compute(b"");
        assert!(backend
            .commit(StreamTarget::Closed, &digest, false)
            .is_err());
        assert!(backend
            .commit(StreamTarget::buffer(), &digest, false)
            .is_ok());
    }
}
