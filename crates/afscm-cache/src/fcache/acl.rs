//! Access control lists and volume status.

use super::{EntryGuard, FileCache};
use crate::error::Result;
use afscm_rpc::{Credential, StoreVolumeStatus, VolumeStatus};
use bytes::Bytes;
use tracing::{debug, info};

impl FileCache {
    /// Reads the access control list of a directory. The status that comes
    /// with it refreshes the entry.
    pub async fn get_acl(&self, guard: &EntryGuard, credential: &Credential) -> Result<Bytes> {
        let fid = guard.fid();
        let mut ctx = self.fanout(&fid, credential).await?;
        let (reply, handle) = ctx
            .call(|server| async move { server.fetch_acl(fid).await })
            .await?;
        self.apply(guard, &reply.reply, Some(handle.host()), credential, false)?;
        debug!("{} acl: {} bytes", fid, reply.acl.len());
        Ok(reply.acl)
    }

    /// Replaces the access control list of a directory. Rights cached for
    /// other principals are forgotten; the new list may change any of them.
    pub async fn set_acl(
        &self,
        guard: &EntryGuard,
        acl: Bytes,
        credential: &Credential,
    ) -> Result<()> {
        let fid = guard.fid();
        let mut ctx = self.fanout(&fid, credential).await?;
        let (reply, handle) = ctx
            .call(|server| {
                let acl = acl.clone();
                async move { server.store_acl(fid, acl).await }
            })
            .await?;
        guard.with_mut(|e| e.access.clear());
        self.apply(guard, &reply, Some(handle.host()), credential, false)?;
        info!("stored acl of {}", fid);
        Ok(())
    }

    /// Asks the server holding the entry's volume for its quota and state.
    pub async fn get_volume_status(
        &self,
        guard: &EntryGuard,
        credential: &Credential,
    ) -> Result<VolumeStatus> {
        let fid = guard.fid();
        let mut ctx = self.fanout(&fid, credential).await?;
        let (status, _) = ctx
            .call(|server| async move { server.get_volume_status(fid.volume).await })
            .await?;
        Ok(status)
    }

    pub async fn set_volume_status(
        &self,
        guard: &EntryGuard,
        status: &StoreVolumeStatus,
        credential: &Credential,
    ) -> Result<()> {
        if status.is_empty() {
            return Ok(());
        }
        let fid = guard.fid();
        let mut ctx = self.fanout(&fid, credential).await?;
        ctx.call(|server| {
            let status = status.clone();
            async move { server.set_volume_status(fid.volume, &status).await }
        })
        .await?;
        info!("updated status of volume {} in cell {}", fid.volume, fid.cell);
        Ok(())
    }
}
