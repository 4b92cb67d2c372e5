pub mod completion;
pub mod config;
pub mod error;
pub mod hash;

pub mod ingest;
pub mod publish;
pub mod session;
pub mod upload;

pub use completion::{completion, CompletionFuture, CompletionResolver};

pub use config::{IngestConfig, LogLevel};

pub use error::{FailureLatch, FailurePolicy, IngestError, Result};

pub use hash::{ContentHash, ObjectId};

pub use ingest::{Block, BlockKind, ChunkItem, FileChunk, FileItem, IngestionPipeline};

pub use publish::{PublishReport, Publisher};

pub use session::{
    Bucket, BucketContentType, CommitRequest, GatewayClient, ObjectPack, SessionContext,
    SessionCredentials, SessionRemote,
};

pub use upload::{
    Backend, BackendKind, SpoolerDefinition, UploadFacility, UploadStreamHandle, Uploader,
    UploaderResults,
};
