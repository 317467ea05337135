//! Volume-location collaborator interface.

use crate::error::{ErrorClass, Result};
use crate::types::{Credential, VolSync};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeKind {
    ReadWrite,
    ReadOnly,
    Backup,
}

impl VolumeKind {
    pub const ALL: [VolumeKind; 3] = [
        VolumeKind::ReadWrite,
        VolumeKind::ReadOnly,
        VolumeKind::Backup,
    ];

    fn index(self) -> usize {
        match self {
            VolumeKind::ReadWrite => 0,
            VolumeKind::ReadOnly => 1,
            VolumeKind::Backup => 2,
        }
    }
}

/// Per-server flags from the location database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplicaFlags {
    pub read_write: bool,
    pub read_only: bool,
    pub backup: bool,
    /// Set by the locator after a volume-scope failure.
    pub unreliable: bool,
}

impl ReplicaFlags {
    pub fn serves(&self, kind: VolumeKind) -> bool {
        match kind {
            VolumeKind::ReadWrite => self.read_write,
            VolumeKind::ReadOnly => self.read_only,
            VolumeKind::Backup => self.backup,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    pub addr: Ipv4Addr,
    pub partition: u32,
    pub flags: ReplicaFlags,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeEntry {
    pub name: String,
    /// Volume ids indexed by kind; `None` when that clone does not exist.
    pub ids: [Option<u32>; 3],
    pub replicas: Vec<Replica>,
    pub vol_sync: VolSync,
}

impl VolumeEntry {
    pub fn id(&self, kind: VolumeKind) -> Option<u32> {
        self.ids[kind.index()]
    }

    /// Which clone of the volume `volume` names.
    pub fn kind_of(&self, volume: u32) -> Option<VolumeKind> {
        VolumeKind::ALL
            .into_iter()
            .find(|kind| self.id(*kind) == Some(volume))
    }

    /// Replica indexes able to serve `kind`.
    pub fn replicas_for(&self, kind: VolumeKind) -> Vec<usize> {
        self.replicas
            .iter()
            .enumerate()
            .filter(|(_, r)| r.flags.serves(kind))
            .map(|(i, _)| i)
            .collect()
    }
}

/// Resolves volumes to the servers that host them.
#[async_trait]
pub trait VolumeLocator: Send + Sync {
    async fn resolve(&self, cell: i32, volume: u32, credential: &Credential)
        -> Result<VolumeEntry>;

    async fn resolve_by_name(
        &self,
        cell: i32,
        name: &str,
        credential: &Credential,
    ) -> Result<VolumeEntry>;

    /// Remember that `replica` failed with `class` for this volume.
    fn mark_replica_down(&self, cell: i32, volume: u32, replica: &Replica, class: ErrorClass);

    fn mark_replica_up(&self, _cell: i32, _volume: u32, _replica: &Replica) {}

    /// Drop any cached location for the volume.
    fn invalidate(&self, cell: i32, volume: u32);

    fn update_vol_sync(&self, _cell: i32, _volume: u32, _vol_sync: VolSync) {}

    /// Current freshness token, if the locator caches one.
    fn vol_sync(&self, _cell: i32, _volume: u32) -> Option<VolSync> {
        None
    }

    /// Numeric id of a cell known by name.
    fn cell_id(&self, _name: &str) -> Option<i32> {
        None
    }
}
