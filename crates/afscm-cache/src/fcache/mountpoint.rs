//! Volume mount points.
//!
//! A mount point is a symlink with mode `0644` whose content names a volume:
//! `#[cell:]volume.` follows the kind of the volume it sits in, while
//! `%[cell:]volume.` always leads to the read-write clone.

use super::{volume_error, EntryGuard, FileCache};
use crate::error::{CacheError, Result};
use afscm_rpc::{Credential, FileId, FileType, VolumeEntry, VolumeKind};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountTarget {
    pub cell: Option<String>,
    pub volume: String,
    /// `%` mount point.
    pub read_write: bool,
    /// Kind named by a `.readonly` or `.backup` suffix.
    pub forced: Option<VolumeKind>,
}

/// Parses symlink content; `None` when it is an ordinary link.
pub fn parse_mountpoint(content: &[u8]) -> Option<MountTarget> {
    let text = std::str::from_utf8(content).ok()?;
    let text = text.trim_end_matches(['\n', '\0']);
    let read_write = match text.chars().next()? {
        '#' => false,
        '%' => true,
        _ => return None,
    };
    let body = text[1..].strip_suffix('.')?;
    let (cell, name) = match body.split_once(':') {
        Some((cell, name)) => (Some(cell.to_string()), name),
        None => (None, body),
    };
    if name.is_empty() || cell.as_deref() == Some("") {
        return None;
    }
    let (volume, forced) = if let Some(base) = name.strip_suffix(".readonly") {
        (base, Some(VolumeKind::ReadOnly))
    } else if let Some(base) = name.strip_suffix(".backup") {
        (base, Some(VolumeKind::Backup))
    } else {
        (name, None)
    };
    Some(MountTarget {
        cell,
        volume: volume.to_string(),
        read_write,
        forced,
    })
}

/// Picks the clone to mount. A missing read-only clone falls back to the
/// read-write one; a missing backup does not.
fn pick_volume(entry: &VolumeEntry, kind: VolumeKind) -> Option<u32> {
    match kind {
        VolumeKind::ReadOnly => entry.id(kind).or_else(|| entry.id(VolumeKind::ReadWrite)),
        _ => entry.id(kind),
    }
}

impl FileCache {
    /// Sets the mount point flag when a freshly fetched symlink names a
    /// volume.
    pub(crate) fn detect_mountpoint(&self, guard: &EntryGuard) -> Result<()> {
        let (candidate, fetched) = guard.with(|e| (e.attr.may_be_mountpoint(), e.fetched));
        if !candidate || fetched == 0 {
            return Ok(());
        }
        let head = self.store.read_at(guard.slot(), 0, 1)?;
        if matches!(head.first(), Some(b'#') | Some(b'%')) {
            guard.with_mut(|e| e.flags.mountpoint = true);
            debug!("{} is a mount point", guard.fid());
        }
        Ok(())
    }

    /// If `guard` is a mount point, trades it for the root of the volume it
    /// names. Anything else is handed back unchanged. `parent` is the
    /// directory holding the mount point.
    pub async fn follow_mountpoint(
        self: &Arc<Self>,
        guard: EntryGuard,
        parent: FileId,
        credential: &Credential,
    ) -> Result<EntryGuard> {
        let fid = guard.fid();
        let attr = self.verify_attr(&guard, None, None, credential).await?;
        if attr.kind != FileType::Symlink {
            return Ok(guard);
        }
        self.verify_data(&guard, credential, None).await?;
        let content = self.store.read_at(guard.slot(), 0, attr.length)?;
        let target = match parse_mountpoint(&content) {
            Some(target) => target,
            None if matches!(content.first(), Some(b'#') | Some(b'%')) => {
                return Err(CacheError::NotMountpoint { fid });
            }
            None => return Ok(guard),
        };

        let cell = match &target.cell {
            Some(name) => self
                .locator
                .cell_id(name)
                .ok_or_else(|| CacheError::UnknownCell { name: name.clone() })?,
            None => fid.cell,
        };
        let credential = if cell == credential.cell {
            credential.clone()
        } else {
            credential.for_cell(cell)
        };

        let kind = match (target.read_write, target.forced) {
            (true, _) => VolumeKind::ReadWrite,
            (false, Some(kind)) => kind,
            (false, None) => self
                .locator
                .resolve(fid.cell, fid.volume, &credential)
                .await
                .ok()
                .and_then(|e| e.kind_of(fid.volume))
                .unwrap_or(VolumeKind::ReadWrite),
        };
        let entry = self
            .locator
            .resolve_by_name(cell, &target.volume, &credential)
            .await
            .map_err(|e| volume_error(&fid, e))?;
        let volume = pick_volume(&entry, kind).ok_or(CacheError::NoSuchVolume {
            cell,
            volume: fid.volume,
        })?;
        debug!("{} mounts {} ({:?}) as volume {}", fid, target.volume, kind, volume);

        drop(guard);
        let root = self.get(FileId::volume_root(cell, volume), &credential).await?;
        root.with_mut(|e| {
            e.real_fid = Some(fid);
            e.parent = Some(parent);
        });
        Ok(root)
    }

    /// Root directory of a volume named `name`, read-only clone preferred.
    pub async fn get_root(
        self: &Arc<Self>,
        cell: i32,
        name: &str,
        credential: &Credential,
    ) -> Result<EntryGuard> {
        let entry = self
            .locator
            .resolve_by_name(cell, name, credential)
            .await
            .map_err(|e| match e {
                afscm_rpc::RpcError::NoSuchVolume { volume } => {
                    CacheError::NoSuchVolume { cell, volume }
                }
                other => other.into(),
            })?;
        let volume = pick_volume(&entry, VolumeKind::ReadOnly).ok_or(CacheError::NoSuchVolume {
            cell,
            volume: 0,
        })?;
        self.get(FileId::volume_root(cell, volume), credential).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_mountpoint() {
        let target = parse_mountpoint(b"#root.cell.").unwrap();
        assert_eq!(target.cell, None);
        assert_eq!(target.volume, "root.cell");
        assert!(!target.read_write);
        assert_eq!(target.forced, None);
    }

    #[test]
    fn test_parse_cross_cell_rw() {
        let target = parse_mountpoint(b"%example.org:user.alice.").unwrap();
        assert_eq!(target.cell.as_deref(), Some("example.org"));
        assert_eq!(target.volume, "user.alice");
        assert!(target.read_write);
    }

    #[test]
    fn test_parse_forced_kind() {
        let target = parse_mountpoint(b"#proj.backup.").unwrap();
        assert_eq!(target.volume, "proj");
        assert_eq!(target.forced, Some(VolumeKind::Backup));
        let target = parse_mountpoint(b"#proj.readonly.").unwrap();
        assert_eq!(target.forced, Some(VolumeKind::ReadOnly));
    }

    #[test]
    fn test_parse_rejects_ordinary_links() {
        assert!(parse_mountpoint(b"../lib/foo").is_none());
        assert!(parse_mountpoint(b"#missing-dot").is_none());
        assert!(parse_mountpoint(b"#.").is_none());
        assert!(parse_mountpoint(b"#:vol.").is_none());
        assert!(parse_mountpoint(b"").is_none());
    }

    #[test]
    fn test_parse_tolerates_trailing_newline() {
        let target = parse_mountpoint(b"#root.afs.\n").unwrap();
        assert_eq!(target.volume, "root.afs");
    }

    #[test]
    fn test_pick_volume_falls_back_to_rw() {
        let entry = VolumeEntry {
            name: "v".to_string(),
            ids: [Some(10), None, None],
            replicas: Vec::new(),
            vol_sync: Default::default(),
        };
        assert_eq!(pick_volume(&entry, VolumeKind::ReadOnly), Some(10));
        assert_eq!(pick_volume(&entry, VolumeKind::ReadWrite), Some(10));
    }

    #[test]
    fn test_pick_volume_missing_backup() {
        let entry = VolumeEntry {
            name: "v".to_string(),
            ids: [Some(10), Some(11), None],
            replicas: Vec::new(),
            vol_sync: Default::default(),
        };
        assert_eq!(pick_volume(&entry, VolumeKind::Backup), None);
        assert_eq!(pick_volume(&entry, VolumeKind::ReadOnly), Some(11));
    }
}
