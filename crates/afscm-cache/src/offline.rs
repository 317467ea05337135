//! Collaborators for a daemon with no network attached. Every call fails
//! with "not connected", so the cache serves only what it already holds.

use afscm_rpc::{
    Connector, Credential, ErrorClass, FileServer, Replica, RpcError, Service, VolumeEntry,
    VolumeLocator,
};
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::sync::Arc;

#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineConnector;

impl Connector for OfflineConnector {
    fn connect(
        &self,
        _host: Ipv4Addr,
        _port: u16,
        _service: Service,
        _credential: &Credential,
    ) -> afscm_rpc::Result<Arc<dyn FileServer>> {
        Err(RpcError::NotConnected)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineLocator;

#[async_trait]
impl VolumeLocator for OfflineLocator {
    async fn resolve(
        &self,
        _cell: i32,
        _volume: u32,
        _credential: &Credential,
    ) -> afscm_rpc::Result<VolumeEntry> {
        Err(RpcError::NotConnected)
    }

    async fn resolve_by_name(
        &self,
        _cell: i32,
        _name: &str,
        _credential: &Credential,
    ) -> afscm_rpc::Result<VolumeEntry> {
        Err(RpcError::NotConnected)
    }

    fn mark_replica_down(&self, _cell: i32, _volume: u32, _replica: &Replica, _class: ErrorClass) {}

    fn invalidate(&self, _cell: i32, _volume: u32) {}
}
