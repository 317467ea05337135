//! Cache state across restarts.
//!
//! The in-use entries are written as JSON to `fcache.new` in the cache
//! directory and renamed over `fcache`. Leases and rights are not saved:
//! recovered entries come back stale and are revalidated on first use,
//! keeping their resident bytes if the data version has not moved.

use crate::attr::CachedAttr;
use crate::entry::{EntryFlags, JournalChain, SlotId};
use crate::error::{CacheError, Result};
use crate::fcache::FileCache;
use afscm_rpc::{FileId, VolSync};
use serde::{Deserialize, Serialize};
use std::fs;
use tracing::{info, warn};

pub const STATE_FILE: &str = "fcache";
const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SavedEntry {
    fid: FileId,
    slot: SlotId,
    attr: CachedAttr,
    fetched: u64,
    flags: EntryFlags,
    vol_sync: Option<VolSync>,
    parent: Option<FileId>,
    real_fid: Option<FileId>,
    journal: JournalChain,
}

#[derive(Debug, Serialize, Deserialize)]
struct SavedState {
    version: u32,
    /// Coldest first.
    entries: Vec<SavedEntry>,
}

impl FileCache {
    /// Writes the in-use entries to disk. Returns how many were saved.
    pub fn store_state(&self) -> Result<usize> {
        let entries: Vec<SavedEntry> = {
            let st = self.state.lock();
            st.table
                .cold_to_hot()
                .into_iter()
                .map(|slot| st.table.get(slot))
                .filter(|e| e.flags.in_use)
                .map(|e| SavedEntry {
                    fid: e.fid,
                    slot: e.slot,
                    attr: e.attr.clone(),
                    fetched: e.fetched,
                    flags: e.flags,
                    vol_sync: e.vol_sync,
                    parent: e.parent,
                    real_fid: e.real_fid,
                    journal: e.journal,
                })
                .collect()
        };
        let count = entries.len();
        let state = SavedState {
            version: STATE_VERSION,
            entries,
        };
        let root = self.store.root();
        let tmp = root.join(format!("{}.new", STATE_FILE));
        fs::write(&tmp, serde_json::to_vec_pretty(&state)?)?;
        fs::rename(&tmp, root.join(STATE_FILE))?;
        info!("saved {} cache entries", count);
        Ok(count)
    }

    /// Loads what `store_state` wrote into an empty cache. A missing state
    /// file recovers nothing.
    pub fn recover_state(&self) -> Result<usize> {
        let path = self.store.root().join(STATE_FILE);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let state: SavedState = serde_json::from_slice(&raw)?;
        if state.version != STATE_VERSION {
            return Err(CacheError::InvalidArgument {
                msg: format!("state file version {}", state.version),
            });
        }

        // file sizes first, the table lock is not held across disk access
        let mut on_disk = Vec::with_capacity(state.entries.len());
        for saved in &state.entries {
            on_disk.push(self.store.len(saved.slot)?);
        }

        let mut st = self.state.lock();
        if st.used_nodes != 0 {
            return Err(CacheError::InvalidArgument {
                msg: "cache already populated".to_string(),
            });
        }
        let mut recovered = 0;
        for (saved, disk_len) in state.entries.into_iter().zip(on_disk) {
            if saved.slot.index() >= st.table.len() {
                warn!("saved slot {} beyond the arena, dropping {}", saved.slot, saved.fid);
                continue;
            }
            if st.table.lookup(&saved.fid).is_some() || st.table.get(saved.slot).flags.in_use {
                warn!("duplicate saved entry {} in slot {}", saved.fid, saved.slot);
                continue;
            }
            let fetched = saved.fetched.min(disk_len);
            let e = st.table.get_mut(saved.slot);
            e.reset(saved.fid);
            e.attr = saved.attr;
            e.fetched = fetched;
            e.vol_sync = saved.vol_sync;
            e.parent = saved.parent;
            e.real_fid = saved.real_fid;
            e.journal = saved.journal;
            e.flags = EntryFlags {
                in_use: true,
                stale: true,
                mountpoint: saved.flags.mountpoint,
                silly: saved.flags.silly,
                pinned: saved.flags.pinned,
                ..Default::default()
            };
            st.table.hash(saved.fid, saved.slot);
            st.table.touch(saved.slot);
            st.used_nodes += 1;
            st.used_bytes += fetched;
            recovered += 1;
        }
        info!("recovered {} cache entries, {} bytes", recovered, st.used_bytes);
        Ok(recovered)
    }
}
