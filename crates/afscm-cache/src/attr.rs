use afscm_rpc::{AccessRights, FetchStatus, FileId, FileType};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Mode a symlink carries when it is really a volume mount point.
pub const MOUNTPOINT_MODE: u32 = 0o644;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CachedAttr {
    pub kind: FileType,
    pub length: u64,
    pub data_version: u64,
    pub mode: u32,
    pub link_count: u32,
    pub owner: u32,
    pub group: u32,
    pub mtime_secs: u64,
    pub parent_vnode: u32,
    pub parent_unique: u32,
}

impl CachedAttr {
    pub fn mtime(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(self.mtime_secs)
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileType::Directory
    }

    /// Symlinks with this mode may be mount points; the content decides.
    pub fn may_be_mountpoint(&self) -> bool {
        self.kind == FileType::Symlink && self.mode & 0o7777 == MOUNTPOINT_MODE
    }

    /// Parent directory, when the server reported one.
    pub fn parent_fid(&self, fid: &FileId) -> Option<FileId> {
        if self.parent_vnode == 0 {
            return None;
        }
        Some(FileId::new(
            fid.cell,
            fid.volume,
            self.parent_vnode,
            self.parent_unique,
        ))
    }
}

impl From<&FetchStatus> for CachedAttr {
    fn from(status: &FetchStatus) -> Self {
        CachedAttr {
            kind: status.file_type,
            length: status.length,
            data_version: status.data_version,
            mode: status.mode,
            link_count: status.link_count,
            owner: status.owner,
            group: status.group,
            mtime_secs: status.mtime_secs,
            parent_vnode: status.parent_vnode,
            parent_unique: status.parent_unique,
        }
    }
}

/// What the kernel side gets to see of an entry when it installs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallView {
    pub fid: FileId,
    pub attr: CachedAttr,
    pub caller_rights: AccessRights,
    pub anon_rights: AccessRights,
    pub cache_file: PathBuf,
    pub data_valid: bool,
    pub mountpoint: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_fetch_status() {
        let status = FetchStatus {
            file_type: FileType::Directory,
            length: 2048,
            data_version: 7,
            mode: 0o755,
            link_count: 2,
            parent_vnode: 1,
            parent_unique: 1,
            ..Default::default()
        };
        let attr = CachedAttr::from(&status);
        assert!(attr.is_dir());
        assert_eq!(attr.length, 2048);
        assert_eq!(attr.data_version, 7);
    }

    #[test]
    fn test_mountpoint_mode() {
        let attr = CachedAttr {
            kind: FileType::Symlink,
            mode: 0o120644,
            ..Default::default()
        };
        assert!(attr.may_be_mountpoint());
        let attr = CachedAttr {
            kind: FileType::Symlink,
            mode: 0o755,
            ..Default::default()
        };
        assert!(!attr.may_be_mountpoint());
    }

    #[test]
    fn test_parent_fid() {
        let fid = FileId::new(1, 100, 5, 5);
        let attr = CachedAttr {
            parent_vnode: 1,
            parent_unique: 1,
            ..Default::default()
        };
        assert_eq!(attr.parent_fid(&fid), Some(FileId::volume_root(1, 100)));
        assert_eq!(CachedAttr::default().parent_fid(&fid), None);
    }
}
