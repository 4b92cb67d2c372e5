//! Batched uploads through a gateway session
//!
//! Small objects are collected into size-bounded packs which a single
//! background worker uploads; finalizing the session commits the new root
//! hash once every pack has landed.

pub mod context;
pub mod pack;
pub mod remote;

pub use context::{SessionContext, SessionState, SessionStats, DEFAULT_QUEUE_CAPACITY};
pub use pack::{
    Bucket, BucketContentType, ObjectPack, PackEntry, DEFAULT_PACK_LIMIT, MAX_OBJECTS_PER_PACK,
};
pub use remote::{
    CommitRequest, GatewayClient, GatewayReply, PayloadMessage, SessionCredentials, SessionRemote,
};
