//! Uploading chunk streams to a storage backend
//!
//! The [`Uploader`] trait is what the ingestion stages talk to;
//! [`UploadFacility`] implements it for every [`Backend`].

pub mod backends;
pub mod definition;
pub mod facility;
pub mod types;
pub mod uploader;

pub use backends::{Backend, GatewayBackend, LocalBackend, MemoryBackend};
pub use definition::{BackendKind, SpoolerDefinition};
pub use facility::UploadFacility;
pub use types::{
    respond, StreamTarget, UploadCallback, UploadKind, UploadStreamHandle, UploaderResults,
};
pub use uploader::Uploader;
