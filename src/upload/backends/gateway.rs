use crate::error::Result;
use crate::hash::ObjectId;
use crate::session::context::SessionContext;
use crate::session::pack::BucketContentType;
use std::sync::Arc;

/// Batches committed chunks into the packs of a publish session
pub struct GatewayBackend {
    session: Arc<SessionContext>,
}

impl GatewayBackend {
    /// Wrap an initialized session
    pub fn new(session: Arc<SessionContext>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<SessionContext> {
        &self.session
    }

    /// One bucket per object; every object carries the same content
    pub(crate) fn commit(&self, content: Vec<u8>, objects: &[ObjectId]) -> Result<()> {
        for object in objects {
            let mut bucket = self.session.new_bucket()?;
            bucket.write(&content);
            self.session
                .commit_bucket(BucketContentType::Cas, *object, bucket, None, false)?;
        }
        Ok(())
    }
}
