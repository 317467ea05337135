//! Directory enumeration used by bulk status.

use afscm_rpc::{Credential, FileId};
use async_trait::async_trait;

/// Reads the (name, fid) pairs of a directory. The listing format itself is
/// owned by whoever implements this.
#[async_trait]
pub trait DirectoryLister: Send + Sync {
    async fn list(
        &self,
        dir: FileId,
        credential: &Credential,
    ) -> afscm_rpc::Result<Vec<(String, FileId)>>;
}

/// Knows no directories; bulk status always falls back to single fetches.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoListing;

#[async_trait]
impl DirectoryLister for NoListing {
    async fn list(
        &self,
        _dir: FileId,
        _credential: &Credential,
    ) -> afscm_rpc::Result<Vec<(String, FileId)>> {
        Ok(Vec::new())
    }
}
