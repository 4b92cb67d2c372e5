//! Publishing a set of files in one go
//!
//! [`Publisher`] owns the uploader selected by the configuration, runs every
//! input through a fresh [`IngestionPipeline`] and, for the gateway backend,
//! commits the session's root hash transition at the end.

use crate::config::IngestConfig;
use crate::error::{FailurePolicy, Result};
use crate::hash::ContentHash;
use crate::ingest::{FileItem, IngestionPipeline};
use crate::upload::{UploadFacility, Uploader};
use bytesize::ByteSize;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedChunk {
    pub digest: String,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedFile {
    pub path: PathBuf,
    pub size: u64,
    /// Whole-file digest, present when the file fit into a single chunk
    #[serde(rename = "bulk-hash", skip_serializing_if = "Option::is_none")]
    pub bulk_hash: Option<String>,
    pub chunks: Vec<PublishedChunk>,
}

impl From<&FileItem> for PublishedFile {
    fn from(file: &FileItem) -> Self {
        Self {
            path: file.path().to_path_buf(),
            size: file.size(),
            bulk_hash: file.bulk_hash().map(|digest| digest.to_hex()),
            chunks: file
                .chunks()
                .into_iter()
                .map(|chunk| PublishedChunk {
                    digest: chunk.digest.to_hex(),
                    offset: chunk.offset,
                    size: chunk.size,
                })
                .collect(),
        }
    }
}

/// The outcome of one publish run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReport {
    pub files: Vec<PublishedFile>,
}

impl PublishReport {
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    pub fn chunk_count(&self) -> usize {
        self.files.iter().map(|f| f.chunks.len()).sum()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Digest of the report, usable as the new root hash of a publish
    pub fn manifest_digest(&self) -> Result<ContentHash> {
        Ok(ContentHash::compute(&serde_json::to_vec(self)?))
    }
}

pub struct Publisher {
    config: IngestConfig,
    uploader: Arc<UploadFacility>,
    failure: FailurePolicy,
}

impl Publisher {
    /// Build the uploader the configuration selects
    pub fn new(config: IngestConfig, failure: FailurePolicy) -> Result<Self> {
        config.validate()?;
        let definition = config.spooler_definition()?;
        let uploader = UploadFacility::from_definition(&definition, &config, failure.clone())?;
        Ok(Self::with_uploader(config, Arc::new(uploader), failure))
    }

    pub fn with_uploader(
        config: IngestConfig,
        uploader: Arc<UploadFacility>,
        failure: FailurePolicy,
    ) -> Self {
        Self {
            config,
            uploader,
            failure,
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn uploader(&self) -> &Arc<UploadFacility> {
        &self.uploader
    }

    /// Ingest every file below `paths` and wait until all are stored
    pub fn publish<P: AsRef<Path>>(&self, paths: &[P]) -> Result<PublishReport> {
        let mut inputs = Vec::new();
        for path in paths {
            collect_files(path.as_ref(), &mut inputs)?;
        }

        let pipeline =
            IngestionPipeline::new(&self.config, self.uploader.clone(), self.failure.clone())?;
        for input in &inputs {
            pipeline.process_file(input)?;
        }
        let processed = pipeline.finish()?;

        let mut report = PublishReport {
            files: processed.iter().map(|f| PublishedFile::from(f.as_ref())).collect(),
        };
        report.files.sort_by(|a, b| a.path.cmp(&b.path));
        info!(
            "published {} files ({} chunks, {})",
            report.files.len(),
            report.chunk_count(),
            ByteSize(report.total_size())
        );
        Ok(report)
    }

    /// Commit the root hash transition of this publish
    pub fn commit(&self, old_root_hash: &str, new_root_hash: &str) -> Result<()> {
        self.uploader.finalize_session(old_root_hash, new_root_hash)
    }
}

/// Regular files at or below `path`, in directory order
fn collect_files(path: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    if fs::metadata(path)?.is_dir() {
        let mut entries = fs::read_dir(path)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<Vec<_>>>()?;
        entries.sort();
        for entry in entries {
            collect_files(&entry, out)?;
        }
    } else {
        out.push(path.to_path_buf());
    }
    Ok(())
}
