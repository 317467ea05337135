//! Values exchanged with file servers.
//!
//! These mirror what a file server returns for a status or data call, without
//! committing to any particular wire encoding.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Identity of one filesystem object: (cell, volume, vnode, uniquifier).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId {
    pub cell: i32,
    pub volume: u32,
    pub vnode: u32,
    pub unique: u32,
}

impl FileId {
    pub fn new(cell: i32, volume: u32, vnode: u32, unique: u32) -> Self {
        Self {
            cell,
            volume,
            vnode,
            unique,
        }
    }

    /// Root directory of a volume.
    pub fn volume_root(cell: i32, volume: u32) -> Self {
        Self::new(cell, volume, 1, 1)
    }

    pub fn is_dir_vnode(&self) -> bool {
        self.vnode & 1 == 1
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {}, {})",
            self.cell, self.volume, self.vnode, self.unique
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FileType {
    #[default]
    File,
    Directory,
    Symlink,
}

/// Access rights bit set granted to a principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AccessRights(pub u32);

impl AccessRights {
    pub const NONE: AccessRights = AccessRights(0);
    pub const READ: AccessRights = AccessRights(0x01);
    pub const WRITE: AccessRights = AccessRights(0x02);
    pub const INSERT: AccessRights = AccessRights(0x04);
    pub const LOOKUP: AccessRights = AccessRights(0x08);
    pub const DELETE: AccessRights = AccessRights(0x10);
    pub const LOCK: AccessRights = AccessRights(0x20);
    pub const ADMINISTER: AccessRights = AccessRights(0x40);
    pub const ALL: AccessRights = AccessRights(0x7f);

    pub fn contains(&self, other: AccessRights) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: AccessRights) -> AccessRights {
        AccessRights(self.0 | other.0)
    }
}

/// Status block returned by every status-bearing call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FetchStatus {
    pub file_type: FileType,
    pub link_count: u32,
    pub length: u64,
    pub data_version: u64,
    pub owner: u32,
    pub group: u32,
    pub mode: u32,
    pub mtime_secs: u64,
    pub caller_access: AccessRights,
    pub anon_access: AccessRights,
    pub parent_vnode: u32,
    pub parent_unique: u32,
}

/// Attribute changes sent with a store call; `None` leaves the field alone.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StoreStatus {
    pub mode: Option<u32>,
    pub owner: Option<u32>,
    pub group: Option<u32>,
    pub mtime_secs: Option<u64>,
}

impl StoreStatus {
    pub fn is_empty(&self) -> bool {
        self.mode.is_none()
            && self.owner.is_none()
            && self.group.is_none()
            && self.mtime_secs.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LeaseKind {
    /// Whole-volume promise, only good while the volume's sync token matches.
    Volume,
    Exclusive,
    #[default]
    Shared,
    /// No promise held.
    Dropped,
}

/// A callback promise as granted by the server, relative to receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackGrant {
    pub kind: LeaseKind,
    pub expires_in: Duration,
}

impl CallbackGrant {
    pub fn new(kind: LeaseKind, expires_in: Duration) -> Self {
        Self { kind, expires_in }
    }
}

/// Freshness token for a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VolSync {
    pub creation_date: u32,
    pub update_token: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReply {
    pub status: FetchStatus,
    pub callback: Option<CallbackGrant>,
    pub vol_sync: Option<VolSync>,
}

impl StatusReply {
    pub fn new(status: FetchStatus) -> Self {
        Self {
            status,
            callback: None,
            vol_sync: None,
        }
    }

    pub fn with_callback(mut self, callback: CallbackGrant) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn with_vol_sync(mut self, vol_sync: VolSync) -> Self {
        self.vol_sync = Some(vol_sync);
        self
    }
}

#[derive(Debug, Clone)]
pub struct DataReply {
    pub data: Bytes,
    pub reply: StatusReply,
}

/// Result of creating a directory entry.
#[derive(Debug, Clone)]
pub struct CreateReply {
    pub fid: FileId,
    pub child: FetchStatus,
    pub dir: StatusReply,
}

#[derive(Debug, Clone)]
pub struct LinkReply {
    pub existing: FetchStatus,
    pub dir: StatusReply,
}

#[derive(Debug, Clone)]
pub struct RenameReply {
    pub old_dir: FetchStatus,
    pub new_dir: FetchStatus,
    pub vol_sync: Option<VolSync>,
}

/// Access control list of a directory, in the server's text form.
#[derive(Debug, Clone)]
pub struct AclReply {
    pub acl: Bytes,
    pub reply: StatusReply,
}

/// Quota and state of a volume as its server reports them.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VolumeStatus {
    pub volume: u32,
    pub name: String,
    pub online: bool,
    pub in_service: bool,
    /// Kilobyte blocks; zero means no quota.
    pub max_quota: u32,
    pub min_quota: u32,
    pub blocks_in_use: u32,
    pub part_blocks_avail: u32,
    pub part_max_blocks: u32,
    pub offline_message: String,
    pub motd: String,
}

/// Volume settings to change; `None` leaves the field alone.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StoreVolumeStatus {
    pub name: Option<String>,
    pub max_quota: Option<u32>,
    pub min_quota: Option<u32>,
    pub offline_message: Option<String>,
    pub motd: Option<String>,
}

impl StoreVolumeStatus {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.max_quota.is_none()
            && self.min_quota.is_none()
            && self.offline_message.is_none()
            && self.motd.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SecurityIndex {
    None,
    Kerberos,
}

/// Opaque credential handed to us by the token collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub principal: u64,
    pub cell: i32,
    pub security: SecurityIndex,
    pub token: Option<Bytes>,
}

impl Credential {
    pub const ANONYMOUS_PRINCIPAL: u64 = 0;

    pub fn anonymous(cell: i32) -> Self {
        Self {
            principal: Self::ANONYMOUS_PRINCIPAL,
            cell,
            security: SecurityIndex::None,
            token: None,
        }
    }

    pub fn authenticated(principal: u64, cell: i32, token: Bytes) -> Self {
        Self {
            principal,
            cell,
            security: SecurityIndex::Kerberos,
            token: Some(token),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.security == SecurityIndex::None
    }

    /// Same principal, re-targeted at another cell.
    pub fn for_cell(&self, cell: i32) -> Self {
        Self {
            cell,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fid_display() {
        let fid = FileId::new(1, 100, 5, 5);
        assert_eq!(fid.to_string(), "(1, 100, 5, 5)");
    }

    #[test]
    fn test_volume_root() {
        let fid = FileId::volume_root(3, 42);
        assert_eq!(fid.vnode, 1);
        assert_eq!(fid.unique, 1);
        assert!(fid.is_dir_vnode());
    }

    #[test]
    fn test_access_rights_contains() {
        let rights = AccessRights::READ.union(AccessRights::LOOKUP);
        assert!(rights.contains(AccessRights::READ));
        assert!(rights.contains(AccessRights::LOOKUP));
        assert!(!rights.contains(AccessRights::WRITE));
        assert!(AccessRights::ALL.contains(rights));
    }

    #[test]
    fn test_store_volume_status_empty() {
        assert!(StoreVolumeStatus::default().is_empty());
        let s = StoreVolumeStatus {
            motd: Some("maintenance at noon".to_string()),
            ..Default::default()
        };
        assert!(!s.is_empty());
    }

    #[test]
    fn test_store_status_empty() {
        assert!(StoreStatus::default().is_empty());
        let s = StoreStatus {
            mode: Some(0o600),
            ..Default::default()
        };
        assert!(!s.is_empty());
    }

    #[test]
    fn test_anonymous_credential() {
        let cred = Credential::anonymous(1);
        assert!(cred.is_anonymous());
        let auth = Credential::authenticated(1001, 1, Bytes::from_static(b"tkt"));
        assert!(!auth.is_anonymous());
        assert_eq!(auth.for_cell(2).cell, 2);
    }

    #[test]
    fn test_lease_kind_serde() {
        for kind in [
            LeaseKind::Volume,
            LeaseKind::Exclusive,
            LeaseKind::Shared,
            LeaseKind::Dropped,
        ] {
            let s = serde_json::to_string(&kind).unwrap();
            let back: LeaseKind = serde_json::from_str(&s).unwrap();
            assert_eq!(kind, back);
        }
    }
}
