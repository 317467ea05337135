//! The file-server call surface and how connections to it are made.
//!
//! The wire protocol lives outside this crate; an implementation of
//! [`Connector`] hands back [`FileServer`] objects that perform the calls.

use crate::error::Result;
use crate::types::{
    AclReply, CallbackGrant, CreateReply, Credential, DataReply, FileId, LinkReply, RenameReply,
    StatusReply, StoreStatus, StoreVolumeStatus, VolumeStatus,
};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Service {
    FileServer,
    VolumeLocation,
}

/// Calls one authenticated (or anonymous) connection can make.
#[async_trait]
pub trait FileServer: Send + Sync {
    fn host(&self) -> Ipv4Addr;

    async fn fetch_status(&self, fid: FileId) -> Result<StatusReply>;

    /// Status for several objects in one round trip. Objects the server could
    /// not stat are left out of the reply.
    async fn bulk_status(&self, fids: &[FileId]) -> Result<Vec<(FileId, StatusReply)>>;

    async fn fetch_data(&self, fid: FileId, offset: u64, len: u64) -> Result<DataReply>;

    async fn store_data(
        &self,
        fid: FileId,
        offset: u64,
        data: Bytes,
        file_length: u64,
    ) -> Result<StatusReply>;

    async fn store_status(&self, fid: FileId, status: &StoreStatus) -> Result<StatusReply>;

    async fn create_file(
        &self,
        dir: FileId,
        name: &str,
        status: &StoreStatus,
    ) -> Result<CreateReply>;

    async fn make_dir(&self, dir: FileId, name: &str, status: &StoreStatus)
        -> Result<CreateReply>;

    async fn symlink(
        &self,
        dir: FileId,
        name: &str,
        target: &str,
        status: &StoreStatus,
    ) -> Result<CreateReply>;

    async fn link(&self, dir: FileId, name: &str, existing: FileId) -> Result<LinkReply>;

    async fn remove_file(&self, dir: FileId, name: &str) -> Result<StatusReply>;

    async fn remove_dir(&self, dir: FileId, name: &str) -> Result<StatusReply>;

    async fn rename(
        &self,
        old_dir: FileId,
        old_name: &str,
        new_dir: FileId,
        new_name: &str,
    ) -> Result<RenameReply>;

    async fn fetch_acl(&self, fid: FileId) -> Result<AclReply>;

    async fn store_acl(&self, fid: FileId, acl: Bytes) -> Result<StatusReply>;

    async fn get_volume_status(&self, volume: u32) -> Result<VolumeStatus>;

    async fn set_volume_status(&self, volume: u32, status: &StoreVolumeStatus) -> Result<()>;

    async fn give_up_callbacks(&self, fids: &[(FileId, CallbackGrant)]) -> Result<()>;

    /// Cheapest possible call, used for liveness probes.
    async fn get_time(&self) -> Result<()>;
}

/// Builds connections. Establishing one must not block on the network.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        host: Ipv4Addr,
        port: u16,
        service: Service,
        credential: &Credential,
    ) -> Result<Arc<dyn FileServer>>;
}

/// Liveness check run by the prober against a probed connection.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, server: &dyn FileServer) -> Result<()>;
}

/// Probes a file server with a time request.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimeProbe;

#[async_trait]
impl Probe for TimeProbe {
    async fn probe(&self, server: &dyn FileServer) -> Result<()> {
        server.get_time().await
    }
}
