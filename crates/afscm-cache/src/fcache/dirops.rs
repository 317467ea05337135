//! Directory-changing calls. The server answers with the new status of the
//! directory, which goes through the usual update path: a changed data
//! version drops the cached listing and returns its bytes to the budget.

use super::{EntryGuard, FileCache};
use crate::error::Result;
use afscm_rpc::{CreateReply, Credential, FetchStatus, StatusReply, StoreStatus};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::debug;

impl FileCache {
    pub async fn create_file(
        self: &Arc<Self>,
        dir: &EntryGuard,
        name: &str,
        status: &StoreStatus,
        credential: &Credential,
    ) -> Result<EntryGuard> {
        let dir_fid = dir.fid();
        let mut ctx = self.fanout(&dir_fid, credential).await?;
        let (reply, handle) = ctx
            .call(|server| {
                let status = status.clone();
                async move { server.create_file(dir_fid, name, &status).await }
            })
            .await?;
        self.install_created(dir, reply, handle.host(), credential).await
    }

    pub async fn create_dir(
        self: &Arc<Self>,
        dir: &EntryGuard,
        name: &str,
        status: &StoreStatus,
        credential: &Credential,
    ) -> Result<EntryGuard> {
        let dir_fid = dir.fid();
        let mut ctx = self.fanout(&dir_fid, credential).await?;
        let (reply, handle) = ctx
            .call(|server| {
                let status = status.clone();
                async move { server.make_dir(dir_fid, name, &status).await }
            })
            .await?;
        self.install_created(dir, reply, handle.host(), credential).await
    }

    pub async fn create_symlink(
        self: &Arc<Self>,
        dir: &EntryGuard,
        name: &str,
        target: &str,
        status: &StoreStatus,
        credential: &Credential,
    ) -> Result<EntryGuard> {
        let dir_fid = dir.fid();
        let mut ctx = self.fanout(&dir_fid, credential).await?;
        let (reply, handle) = ctx
            .call(|server| {
                let status = status.clone();
                async move { server.symlink(dir_fid, name, target, &status).await }
            })
            .await?;
        self.install_created(dir, reply, handle.host(), credential).await
    }

    /// Hard link to `existing` named `name` in `dir`.
    pub async fn create_link(
        &self,
        dir: &EntryGuard,
        name: &str,
        existing: &EntryGuard,
        credential: &Credential,
    ) -> Result<()> {
        let dir_fid = dir.fid();
        let existing_fid = existing.fid();
        let mut ctx = self.fanout(&dir_fid, credential).await?;
        let (reply, handle) = ctx
            .call(|server| async move { server.link(dir_fid, name, existing_fid).await })
            .await?;
        let host = Some(handle.host());
        self.apply(dir, &reply.dir, host, credential, false)?;
        self.apply(existing, &refreshed(reply.existing, &reply.dir), host, credential, false)
    }

    pub async fn remove_file(&self, dir: &EntryGuard, name: &str, credential: &Credential) -> Result<()> {
        let dir_fid = dir.fid();
        let mut ctx = self.fanout(&dir_fid, credential).await?;
        let (reply, handle) = ctx
            .call(|server| async move { server.remove_file(dir_fid, name).await })
            .await?;
        debug!("removed {} from {}", name, dir_fid);
        self.apply(dir, &reply, Some(handle.host()), credential, false)
    }

    pub async fn remove_dir(&self, dir: &EntryGuard, name: &str, credential: &Credential) -> Result<()> {
        let dir_fid = dir.fid();
        let mut ctx = self.fanout(&dir_fid, credential).await?;
        let (reply, handle) = ctx
            .call(|server| async move { server.remove_dir(dir_fid, name).await })
            .await?;
        debug!("removed directory {} from {}", name, dir_fid);
        self.apply(dir, &reply, Some(handle.host()), credential, false)
    }

    /// Moves `old_name` in `old_dir` to `new_name` in `new_dir`, or within
    /// `old_dir` when no target directory is given.
    pub async fn rename(
        &self,
        old_dir: &EntryGuard,
        old_name: &str,
        new_dir: Option<&EntryGuard>,
        new_name: &str,
        credential: &Credential,
    ) -> Result<()> {
        let old_fid = old_dir.fid();
        let new_fid = new_dir.map_or(old_fid, |d| d.fid());
        let mut ctx = self.fanout(&old_fid, credential).await?;
        let (reply, handle) = ctx
            .call(|server| async move { server.rename(old_fid, old_name, new_fid, new_name).await })
            .await?;
        let host = Some(handle.host());

        let status_reply = |status: FetchStatus| StatusReply {
            status,
            callback: None,
            vol_sync: reply.vol_sync,
        };
        match new_dir {
            Some(new_dir) if new_fid != old_fid => {
                self.apply(old_dir, &status_reply(reply.old_dir.clone()), host, credential, false)?;
                self.apply(new_dir, &status_reply(reply.new_dir.clone()), host, credential, false)
            }
            _ => self.apply(old_dir, &status_reply(reply.new_dir.clone()), host, credential, false),
        }
    }

    async fn install_created(
        self: &Arc<Self>,
        dir: &EntryGuard,
        reply: CreateReply,
        host: Ipv4Addr,
        credential: &Credential,
    ) -> Result<EntryGuard> {
        self.apply(dir, &reply.dir, Some(host), credential, false)?;
        let child = self.get(reply.fid, credential).await?;
        self.apply(&child, &refreshed(reply.child, &reply.dir), Some(host), credential, false)?;
        debug!("created {} in {}", reply.fid, dir.fid());
        Ok(child)
    }
}

/// Status of a second object carried by a directory reply. It comes with
/// no callback of its own.
fn refreshed(status: FetchStatus, dir: &StatusReply) -> StatusReply {
    StatusReply {
        status,
        callback: None,
        vol_sync: dir.vol_sync,
    }
}
