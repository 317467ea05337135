//! The file cache.
//!
//! Entries live in a fixed arena guarded by one coarse lock, together with
//! the hash index, the LRU list, the invalidation heap and the budget
//! counters. That lock is only ever held for short, non-blocking sections.
//! Multi-step work on one entry (an RPC followed by an update) is serialized
//! by the entry's own async lock, which [`EntryGuard`] holds.

mod acl;
mod dirops;
mod mountpoint;
mod purge;
mod update;
mod verify;
mod write;

pub use mountpoint::{parse_mountpoint, MountTarget};

use crate::attr::{CachedAttr, InstallView};
use crate::config::{CacheConfig, MAX_NODES};
use crate::dirlist::DirectoryLister;
use crate::entry::{CacheEntry, EntryFlags, EntryState, JournalChain, Lease, SlotId};
use crate::error::{CacheError, Result};
use crate::heap::InvalidationHeap;
use crate::notify::KernelNotifier;
use crate::store::SlotStore;
use crate::table::SlotTable;
use afscm_rpc::{
    CallbackGrant, ConnectionCache, Credential, FanoutContext, FileId, RpcError, Service,
    TimeProbe, VolumeLocator,
};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// `verify_attr` answered from the cache.
    pub attr_hits: u64,
    pub fetches: u64,
    pub data_fetches: u64,
    pub bulk_fetches: u64,
    pub evictions: u64,
    pub discards: u64,
    pub stales: u64,
    pub give_ups: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Limits {
    pub low_nodes: u32,
    pub high_nodes: u32,
    pub low_bytes: u64,
    pub high_bytes: u64,
}

pub(crate) struct CacheState {
    pub(crate) table: SlotTable,
    pub(crate) heap: InvalidationHeap,
    pub(crate) used_bytes: u64,
    pub(crate) used_nodes: u32,
    pub(crate) limits: Limits,
    pub(crate) stats: CacheStats,
    /// Accesses per parent directory, for the bulk status heuristic.
    pub(crate) parents: LruCache<FileId, u32>,
}

/// What is left to do for an entry that just left the index.
/// Why a held entry is to be staled on release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Sentence {
    /// Its lease ran out; a fresh lease lifts it.
    Expired,
    /// The server broke the callback or an administrator purged it.
    Broken,
}

#[derive(Debug)]
pub(crate) struct Evicted {
    pub fid: FileId,
    pub slot: SlotId,
    pub host: Option<Ipv4Addr>,
    pub grant: Option<CallbackGrant>,
}

impl CacheState {
    fn new(config: &CacheConfig) -> Self {
        let tracking = NonZeroUsize::new(config.parent_tracking.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            table: SlotTable::new(config.high_nodes as usize, config.access_slots),
            heap: InvalidationHeap::new(),
            used_bytes: 0,
            used_nodes: 0,
            limits: Limits {
                low_nodes: config.low_nodes,
                high_nodes: config.high_nodes,
                low_bytes: config.low_bytes,
                high_bytes: config.high_bytes,
            },
            stats: CacheStats::default(),
            parents: LruCache::new(tracking),
        }
    }

    /// Sets the resident byte count of an entry, moving the difference
    /// in or out of the budget.
    pub(crate) fn charge(&mut self, slot: SlotId, fetched: u64) {
        let e = self.table.get_mut(slot);
        self.used_bytes = self.used_bytes - e.fetched + fetched;
        e.fetched = fetched;
    }

    /// Drops the resident bytes of an entry but keeps it hashed. Returns the
    /// bytes released; the caller truncates the cache file.
    pub(crate) fn discard_data(&mut self, slot: SlotId) -> u64 {
        let e = self.table.get_mut(slot);
        let freed = e.fetched;
        e.fetched = 0;
        e.wanted = 0;
        e.flags.data_valid = false;
        e.flags.local_dir = false;
        self.used_bytes -= freed;
        if freed > 0 {
            self.stats.discards += 1;
        }
        freed
    }

    pub(crate) fn install(&mut self, slot: SlotId, fid: FileId) {
        let e = self.table.get_mut(slot);
        e.reset(fid);
        e.flags.in_use = true;
        e.refcount += 1;
        self.table.hash(fid, slot);
        self.table.touch(slot);
        self.used_nodes += 1;
        self.stats.misses += 1;
    }

    pub(crate) fn unhash(&mut self, slot: SlotId, now: Instant) -> Evicted {
        let e = self.table.get_mut(slot);
        let fid = e.fid;
        let grant = e.lease.remaining(now);
        let host = e.host.take();
        let freed = e.fetched;
        e.fetched = 0;
        e.wanted = 0;
        e.flags = EntryFlags::default();
        e.lease = Lease::dropped();
        e.access.clear();
        self.used_bytes -= freed;
        self.used_nodes -= 1;
        self.table.unhash(&fid);
        self.heap.remove(slot);
        self.table.demote(slot);
        self.stats.evictions += 1;
        trace!("evicted {} from slot {}", fid, slot);
        Evicted {
            fid,
            slot,
            host,
            grant,
        }
    }

    /// Drops the lease and validity of an entry, telling the kernel if it
    /// holds the entry.
    pub(crate) fn apply_stale(&mut self, slot: SlotId, notifier: &dyn KernelNotifier) {
        let e = self.table.get_mut(slot);
        e.flags.sentenced = false;
        e.flags.broken = false;
        e.lease = Lease::dropped();
        if e.flags.attr_valid || e.flags.data_valid {
            e.flags.stale = true;
        }
        e.flags.attr_valid = false;
        e.flags.data_valid = false;
        if e.flags.exposed {
            notifier.invalidate(e.fid);
            e.flags.exposed = false;
        }
        trace!("staled {}", e.fid);
        self.heap.remove(slot);
        self.stats.stales += 1;
    }

    /// Stales the entry now, or marks it to be staled when its holder lets
    /// go. Returns true if it was staled immediately.
    pub(crate) fn stale_or_sentence(
        &mut self,
        slot: SlotId,
        notifier: &dyn KernelNotifier,
        cause: Sentence,
    ) -> bool {
        let e = self.table.get_mut(slot);
        if !e.flags.in_use {
            return false;
        }
        if e.is_locked() {
            e.flags.sentenced = true;
            if cause == Sentence::Broken {
                e.flags.broken = true;
            }
            self.heap.remove(slot);
            debug!("{} busy, sentenced ({:?})", e.fid, cause);
            return false;
        }
        self.apply_stale(slot, notifier);
        true
    }

    /// Finds a slot for a new entry: free slots first, then unreferenced
    /// entries the kernel does not hold, then ones it does.
    fn take_slot(
        &mut self,
        notifier: &dyn KernelNotifier,
        now: Instant,
    ) -> Option<(SlotId, OwnedMutexGuard<()>, Option<Evicted>)> {
        for pass in 0..3 {
            let mut cur = self.table.coldest();
            while let Some(slot) = cur {
                cur = self.table.hotter(slot);
                let e = self.table.get(slot);
                if e.refcount != 0 || e.flags.pinned {
                    continue;
                }
                let (in_use, exposed, fid) = (e.flags.in_use, e.flags.exposed, e.fid);
                let eligible = match pass {
                    0 => !in_use,
                    1 => in_use && !exposed,
                    _ => in_use,
                };
                if !eligible {
                    continue;
                }
                let Ok(lock) = e.lock.clone().try_lock_owned() else {
                    continue;
                };
                let evicted = if in_use {
                    if exposed {
                        notifier.invalidate(fid);
                    }
                    Some(self.unhash(slot, now))
                } else {
                    None
                };
                return Some((slot, lock, evicted));
            }
        }
        None
    }

    pub(crate) fn resident_sum(&self) -> u64 {
        self.table.in_use().map(|e| e.fetched).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lookup {
    /// Wait for the entry lock, allocate on a miss.
    Get,
    /// Wait for the entry lock, never allocate.
    Find,
    /// Never wait, allocate on a miss if a slot is at hand.
    TryGet,
}

pub struct FileCache {
    config: CacheConfig,
    pub(crate) state: Mutex<CacheState>,
    pub(crate) store: SlotStore,
    pub(crate) conns: Arc<ConnectionCache>,
    pub(crate) locator: Arc<dyn VolumeLocator>,
    pub(crate) lister: Arc<dyn DirectoryLister>,
    pub(crate) notifier: Arc<dyn KernelNotifier>,
    pub(crate) cleaner_wake: Notify,
    pub(crate) invalidator_wake: Notify,
    disconnected: AtomicBool,
}

impl FileCache {
    pub fn new(
        config: CacheConfig,
        conns: Arc<ConnectionCache>,
        locator: Arc<dyn VolumeLocator>,
        lister: Arc<dyn DirectoryLister>,
        notifier: Arc<dyn KernelNotifier>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let store = SlotStore::new(&config.cache_dir)?;
        let state = CacheState::new(&config);
        info!(
            "file cache at {} with {} nodes, {} bytes",
            config.cache_dir.display(),
            config.high_nodes,
            config.high_bytes
        );
        Ok(Arc::new(Self {
            config,
            state: Mutex::new(state),
            store,
            conns,
            locator,
            lister,
            notifier,
            cleaner_wake: Notify::new(),
            invalidator_wake: Notify::new(),
            disconnected: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn connections(&self) -> &Arc<ConnectionCache> {
        &self.conns
    }

    pub fn store(&self) -> &SlotStore {
        &self.store
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    pub fn set_disconnected(&self, disconnected: bool) {
        let was = self.disconnected.swap(disconnected, Ordering::SeqCst);
        if was != disconnected {
            info!(
                "switching to {} mode",
                if disconnected { "disconnected" } else { "connected" }
            );
        }
    }

    pub fn limits(&self) -> Limits {
        self.state.lock().limits
    }

    pub fn used_bytes(&self) -> u64 {
        self.state.lock().used_bytes
    }

    pub fn used_nodes(&self) -> u32 {
        self.state.lock().used_nodes
    }

    pub fn is_hashed(&self, fid: &FileId) -> bool {
        self.state.lock().table.lookup(fid).is_some()
    }

    pub fn wake_cleaner(&self) {
        self.cleaner_wake.notify_one();
    }

    /// Returns the locked entry for `fid`, allocating one on a miss.
    pub async fn get(self: &Arc<Self>, fid: FileId, credential: &Credential) -> Result<EntryGuard> {
        if !self.is_hashed(&fid) {
            if self.is_disconnected() {
                return Err(CacheError::NotConnected);
            }
            self.locator
                .resolve(fid.cell, fid.volume, credential)
                .await
                .map_err(|e| volume_error(&fid, e))?;
        }
        self.lookup(fid, Lookup::Get)
            .await?
            .ok_or(CacheError::NoNodes)
    }

    /// Returns the locked entry for `fid` if it is cached.
    pub async fn find(self: &Arc<Self>, fid: FileId) -> Option<EntryGuard> {
        self.lookup(fid, Lookup::Find).await.ok().flatten()
    }

    /// Like `get`, but gives up instead of waiting for a busy entry or
    /// evicting under pressure.
    pub(crate) async fn try_get(self: &Arc<Self>, fid: FileId) -> Option<EntryGuard> {
        self.lookup(fid, Lookup::TryGet).await.ok().flatten()
    }

    async fn lookup(self: &Arc<Self>, fid: FileId, how: Lookup) -> Result<Option<EntryGuard>> {
        let mut retried = false;
        loop {
            enum Found {
                Hit(SlotId, Arc<tokio::sync::Mutex<()>>),
                Alloc(SlotId, OwnedMutexGuard<()>, Option<Evicted>),
                Full,
            }

            let found = {
                let mut st = self.state.lock();
                if let Some(slot) = st.table.lookup(&fid) {
                    let e = st.table.get_mut(slot);
                    if how == Lookup::TryGet {
                        let Ok(lock) = e.lock.clone().try_lock_owned() else {
                            return Ok(None);
                        };
                        e.refcount += 1;
                        st.table.touch(slot);
                        st.stats.hits += 1;
                        return Ok(Some(EntryGuard::new(self, slot, fid, Some(lock))));
                    }
                    e.refcount += 1;
                    let lock = e.lock.clone();
                    st.table.touch(slot);
                    st.stats.hits += 1;
                    Found::Hit(slot, lock)
                } else if how == Lookup::Find {
                    return Ok(None);
                } else if self.is_disconnected() {
                    return Err(CacheError::NotConnected);
                } else {
                    match st.take_slot(self.notifier.as_ref(), Instant::now()) {
                        Some((slot, lock, evicted)) => {
                            st.install(slot, fid);
                            Found::Alloc(slot, lock, evicted)
                        }
                        None => Found::Full,
                    }
                }
            };

            match found {
                Found::Hit(slot, lock) => {
                    let mut guard = EntryGuard::new(self, slot, fid, None);
                    guard.lock = Some(lock.lock_owned().await);
                    if guard.with(|e| e.flags.in_use && e.fid == fid) {
                        return Ok(Some(guard));
                    }
                    trace!("{} left slot {} while we waited", fid, slot);
                }
                Found::Alloc(slot, lock, evicted) => {
                    let guard = EntryGuard::new(self, slot, fid, Some(lock));
                    if let Some(evicted) = evicted {
                        self.wake_cleaner();
                        self.finish_evict(evicted).await;
                    }
                    debug!("{} allocated slot {}", fid, slot);
                    return Ok(Some(guard));
                }
                Found::Full => {
                    if how == Lookup::TryGet {
                        return Ok(None);
                    }
                    if retried {
                        warn!("no free node for {}", fid);
                        return Err(CacheError::NoNodes);
                    }
                    retried = true;
                    self.wake_cleaner();
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    fn release_slot(&self, slot: SlotId, locked: bool) {
        let mut st = self.state.lock();
        let e = st.table.get_mut(slot);
        debug_assert!(e.refcount > 0, "slot {} released too often", slot);
        e.refcount = e.refcount.saturating_sub(1);
        if locked && e.flags.in_use && e.flags.sentenced {
            st.apply_stale(slot, self.notifier.as_ref());
        }
    }

    /// Lets go of an entry.
    pub fn release(&self, guard: EntryGuard) {
        drop(guard);
    }

    /// Throws the entry out of the cache: its lease is handed back to the
    /// server on a best-effort basis and its bytes are released.
    pub async fn evict(&self, guard: EntryGuard) {
        let evicted = {
            let mut st = self.state.lock();
            if !st.table.get(guard.slot).flags.in_use {
                return;
            }
            st.unhash(guard.slot, Instant::now())
        };
        self.finish_evict(evicted).await;
        drop(guard);
    }

    /// Disk and network side of an eviction. The slot's lock must be held.
    pub(crate) async fn finish_evict(&self, evicted: Evicted) {
        if let Err(e) = self.store.truncate(evicted.slot, 0) {
            warn!("cannot truncate cache file {}: {}", evicted.slot, e);
        }
        if let Err(e) = self.store.remove_dir_listing(evicted.slot) {
            warn!("cannot remove listing {}: {}", evicted.slot, e);
        }
        if let (Some(host), Some(grant)) = (evicted.host, evicted.grant) {
            self.give_up_callback(evicted.fid, host, grant).await;
        }
    }

    /// Hands a callback back to its server. Never retried.
    pub(crate) async fn give_up_callback(&self, fid: FileId, host: Ipv4Addr, grant: CallbackGrant) {
        if self.is_disconnected() {
            return;
        }
        let handle = match self.conns.acquire(
            fid.cell,
            host,
            self.conns.config().fs_port,
            Service::FileServer,
            Arc::new(TimeProbe),
            &Credential::anonymous(fid.cell),
        ) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("no connection to {} to give up {}: {}", host, fid, e);
                return;
            }
        };
        if !handle.is_alive() {
            debug!("{} is down, not giving up {}", host, fid);
            return;
        }
        self.state.lock().stats.give_ups += 1;
        if let Err(e) = handle.server().give_up_callbacks(&[(fid, grant)]).await {
            warn!("giving up callback for {} to {} failed: {}", fid, host, e);
            if e.is_host_down() {
                self.conns.mark_dead(&handle);
            }
        }
    }

    pub(crate) async fn fanout(&self, fid: &FileId, credential: &Credential) -> Result<FanoutContext> {
        if self.is_disconnected() {
            return Err(CacheError::NotConnected);
        }
        FanoutContext::build(
            &self.conns,
            Arc::clone(&self.locator),
            fid.cell,
            fid.volume,
            credential,
        )
        .await
        .map_err(|e| volume_error(fid, e))
    }

    /// Server-initiated callback break. Unknown fids are ignored.
    pub fn stale_entry(&self, fid: FileId) -> bool {
        let mut st = self.state.lock();
        match st.table.lookup(&fid) {
            Some(slot) => st.stale_or_sentence(slot, self.notifier.as_ref(), Sentence::Broken),
            None => {
                debug!("callback break for uncached {}", fid);
                false
            }
        }
    }

    /// Verifies that the resident bytes of all in-use entries add up to the
    /// used-bytes counter.
    pub fn check_accounting(&self) -> Result<()> {
        let st = self.state.lock();
        let sum = st.resident_sum();
        if sum != st.used_bytes {
            return Err(CacheError::AccountingViolation {
                counter: st.used_bytes,
                sum,
            });
        }
        Ok(())
    }

    /// Verifies LRU linkage and that exactly the in-use entries are hashed.
    pub fn check_index(&self) -> std::result::Result<(), String> {
        self.state.lock().table.check()
    }

    pub fn entry_state(&self, fid: &FileId) -> Option<EntryState> {
        let st = self.state.lock();
        st.table.lookup(fid).map(|slot| st.table.get(slot).state())
    }

    /// The kernel now holds a reference built from this entry.
    pub fn mark_exposed(&self, guard: &EntryGuard) {
        guard.with_mut(|e| e.flags.exposed = true);
    }

    pub fn set_pinned(&self, guard: &EntryGuard, pinned: bool) {
        guard.with_mut(|e| e.flags.pinned = pinned);
    }

    pub fn mark_silly(&self, guard: &EntryGuard) {
        guard.with_mut(|e| e.flags.silly = true);
    }

    pub fn mark_local_dir(&self, guard: &EntryGuard) {
        guard.with_mut(|e| e.flags.local_dir = true);
    }

    pub fn journal_chain(&self, guard: &EntryGuard) -> JournalChain {
        guard.with(|e| e.journal)
    }

    pub fn set_journal_chain(&self, guard: &EntryGuard, chain: JournalChain) {
        guard.with_mut(|e| e.journal = chain);
    }

    /// Read-only projection handed to the kernel side.
    pub fn install_view(&self, guard: &EntryGuard, credential: &Credential) -> InstallView {
        let path = self.store.path(guard.slot);
        guard.with(|e| InstallView {
            fid: e.fid,
            attr: e.attr.clone(),
            caller_rights: e.rights_for(credential.principal).unwrap_or(e.anon_access),
            anon_rights: e.anon_access,
            cache_file: path,
            data_valid: e.flags.data_valid,
            mountpoint: e.flags.mountpoint,
        })
    }

    /// Changes the budgets. Zero keeps a value; the arena only grows.
    pub fn reinit(&self, low_nodes: u32, high_nodes: u32, low_bytes: u64, high_bytes: u64) -> Result<()> {
        let mut st = self.state.lock();
        let mut limits = st.limits;
        if low_nodes != 0 {
            limits.low_nodes = low_nodes;
        }
        if high_nodes != 0 {
            limits.high_nodes = high_nodes;
        }
        if low_bytes != 0 {
            limits.low_bytes = low_bytes;
        }
        if high_bytes != 0 {
            limits.high_bytes = high_bytes;
        }
        let invalid = |msg: &str| CacheError::InvalidArgument {
            msg: msg.to_string(),
        };
        if limits.high_nodes < st.limits.high_nodes {
            return Err(invalid("cannot shrink the node arena"));
        }
        if limits.high_nodes > MAX_NODES {
            return Err(invalid("more nodes than slot ids"));
        }
        if limits.low_nodes >= limits.high_nodes || limits.low_bytes >= limits.high_bytes {
            return Err(invalid("low water mark must be below high water mark"));
        }
        let grow = (limits.high_nodes - st.limits.high_nodes) as usize;
        st.table.grow(grow);
        st.limits = limits;
        info!(
            "reinit: nodes {}-{}, bytes {}-{}",
            limits.low_nodes, limits.high_nodes, limits.low_bytes, limits.high_bytes
        );
        Ok(())
    }
}

pub(crate) fn volume_error(fid: &FileId, err: RpcError) -> CacheError {
    match err {
        RpcError::NoSuchVolume { .. } | RpcError::NoReplicas { .. } => CacheError::NoSuchVolume {
            cell: fid.cell,
            volume: fid.volume,
        },
        other => other.into(),
    }
}

/// A locked, referenced cache entry. Dropping it releases both.
pub struct EntryGuard {
    cache: Arc<FileCache>,
    slot: SlotId,
    fid: FileId,
    lock: Option<OwnedMutexGuard<()>>,
}

impl EntryGuard {
    fn new(
        cache: &Arc<FileCache>,
        slot: SlotId,
        fid: FileId,
        lock: Option<OwnedMutexGuard<()>>,
    ) -> Self {
        Self {
            cache: Arc::clone(cache),
            slot,
            fid,
            lock,
        }
    }

    pub fn fid(&self) -> FileId {
        self.fid
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn with<R>(&self, f: impl FnOnce(&CacheEntry) -> R) -> R {
        let st = self.cache.state.lock();
        f(st.table.get(self.slot))
    }

    pub(crate) fn with_mut<R>(&self, f: impl FnOnce(&mut CacheEntry) -> R) -> R {
        debug_assert!(self.lock.is_some(), "mutating {} without its lock", self.fid);
        let mut st = self.cache.state.lock();
        let e = st.table.get_mut(self.slot);
        debug_assert!(e.is_locked());
        f(e)
    }

    pub fn attr(&self) -> CachedAttr {
        self.with(|e| e.attr.clone())
    }

    pub fn flags(&self) -> EntryFlags {
        self.with(|e| e.flags)
    }

    pub fn state(&self) -> EntryState {
        self.with(|e| e.state())
    }

    pub fn fetched(&self) -> u64 {
        self.with(|e| e.fetched)
    }

    pub fn length(&self) -> u64 {
        self.with(|e| e.attr.length)
    }

    pub fn refcount(&self) -> u32 {
        self.with(|e| e.refcount)
    }
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        self.cache.release_slot(self.slot, self.lock.is_some());
    }
}

impl fmt::Debug for EntryGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryGuard")
            .field("fid", &self.fid)
            .field("slot", &self.slot)
            .finish()
    }
}
