use crate::access::AccessMap;
use crate::attr::CachedAttr;
use afscm_rpc::{AccessRights, CallbackGrant, FileId, LeaseKind, VolSync};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::time::Instant;

/// Stable index of an entry in the arena; also names its cache file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotId(pub u16);

impl SlotId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

/// Opaque handle into the disconnected-operation journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JournalChain(pub Option<u64>);

/// Callback promise held for an entry, with an absolute expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub kind: LeaseKind,
    pub expires: Option<Instant>,
}

impl Lease {
    pub fn dropped() -> Self {
        Self {
            kind: LeaseKind::Dropped,
            expires: None,
        }
    }

    pub fn granted(grant: &CallbackGrant, now: Instant) -> Self {
        Self {
            kind: grant.kind,
            expires: Some(now + grant.expires_in),
        }
    }

    pub fn is_dropped(&self) -> bool {
        self.kind == LeaseKind::Dropped || self.expires.is_none()
    }

    pub fn is_live(&self, now: Instant) -> bool {
        !self.is_dropped() && self.expires.map(|t| now < t).unwrap_or(false)
    }

    /// Grant to hand back to the server, relative to `now`.
    pub fn remaining(&self, now: Instant) -> Option<CallbackGrant> {
        if self.is_dropped() {
            return None;
        }
        let expires = self.expires?;
        Some(CallbackGrant::new(
            self.kind,
            expires.saturating_duration_since(now),
        ))
    }
}

impl Default for Lease {
    fn default() -> Self {
        Self::dropped()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EntryFlags {
    pub in_use: bool,
    pub attr_valid: bool,
    pub data_valid: bool,
    /// The kernel holds a reference built from this entry.
    pub exposed: bool,
    /// Removed while open; deleted once released.
    pub silly: bool,
    pub mountpoint: bool,
    /// A locally converted directory listing sits next to the cache file.
    pub local_dir: bool,
    pub pinned: bool,
    /// Locked when it was invalidated; stale it on release.
    pub sentenced: bool,
    /// The sentence came from the server. A fresh reply does not lift it.
    #[serde(default)]
    pub broken: bool,
    /// Attributes were valid once and have been invalidated since.
    pub stale: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryState {
    Free,
    Allocated,
    AttrValid,
    DataValid,
    Stale,
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntryState::Free => "free",
            EntryState::Allocated => "allocated",
            EntryState::AttrValid => "attr",
            EntryState::DataValid => "attr+data",
            EntryState::Stale => "stale",
        };
        f.write_str(s)
    }
}

pub struct CacheEntry {
    pub fid: FileId,
    pub slot: SlotId,
    pub attr: CachedAttr,
    pub access: AccessMap,
    pub anon_access: AccessRights,
    pub lease: Lease,
    /// Bytes resident in the cache file and charged to the byte budget.
    pub fetched: u64,
    /// Bytes the current caller asked for.
    pub wanted: u64,
    pub flags: EntryFlags,
    pub refcount: u32,
    /// File server whose callback we hold.
    pub host: Option<Ipv4Addr>,
    pub vol_sync: Option<VolSync>,
    pub journal: JournalChain,
    /// For a volume root reached through a mount point: the mount point.
    pub real_fid: Option<FileId>,
    pub parent: Option<FileId>,
    pub(crate) lock: Arc<tokio::sync::Mutex<()>>,
}

impl CacheEntry {
    pub(crate) fn new(slot: SlotId, access_slots: usize) -> Self {
        Self {
            fid: FileId::new(0, 0, 0, 0),
            slot,
            attr: CachedAttr::default(),
            access: AccessMap::new(access_slots),
            anon_access: AccessRights::NONE,
            lease: Lease::dropped(),
            fetched: 0,
            wanted: 0,
            flags: EntryFlags::default(),
            refcount: 0,
            host: None,
            vol_sync: None,
            journal: JournalChain::default(),
            real_fid: None,
            parent: None,
            lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Wipes everything but the slot, the lock and the refcount.
    pub(crate) fn reset(&mut self, fid: FileId) {
        self.fid = fid;
        self.attr = CachedAttr::default();
        self.access.clear();
        self.anon_access = AccessRights::NONE;
        self.lease = Lease::dropped();
        self.fetched = 0;
        self.wanted = 0;
        self.flags = EntryFlags::default();
        self.host = None;
        self.vol_sync = None;
        self.journal = JournalChain::default();
        self.real_fid = None;
        self.parent = None;
    }

    pub fn length(&self) -> u64 {
        self.attr.length
    }

    pub fn state(&self) -> EntryState {
        let f = &self.flags;
        if !f.in_use {
            EntryState::Free
        } else if f.attr_valid && f.data_valid {
            EntryState::DataValid
        } else if f.attr_valid {
            EntryState::AttrValid
        } else if f.stale {
            EntryState::Stale
        } else {
            EntryState::Allocated
        }
    }

    /// True when cached attributes can be trusted without asking a server.
    /// `volume_sync` is the volume's current token.
    pub fn is_uptodate(&self, now: Instant, volume_sync: Option<VolSync>) -> bool {
        if !self.flags.attr_valid || !self.lease.is_live(now) {
            return false;
        }
        self.lease.kind != LeaseKind::Volume
            || (self.vol_sync.is_some() && self.vol_sync == volume_sync)
    }

    pub fn rights_for(&self, principal: u64) -> Option<AccessRights> {
        self.access.get(principal)
    }

    pub fn is_locked(&self) -> bool {
        self.lock.try_lock().is_err()
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("fid", &self.fid)
            .field("slot", &self.slot)
            .field("state", &self.state())
            .field("length", &self.attr.length)
            .field("fetched", &self.fetched)
            .field("refcount", &self.refcount)
            .field("flags", &self.flags)
            .finish()
    }
}
