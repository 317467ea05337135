//! Budget enforcement.
//!
//! The cleaner walks the LRU list from the cold end and throws out entries
//! nobody holds until the cache is back under its low water marks. Entries
//! the kernel does not know about go first; exposed ones are only touched in
//! a second phase, after the kernel has been told.

use crate::entry::SlotId;
use crate::error::{CacheError, Result};
use crate::fcache::FileCache;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanReport {
    /// Entries that lost their data but stayed cached.
    pub discarded: usize,
    pub evicted: usize,
    /// Exposed entries taken away from the kernel.
    pub forced: usize,
    pub freed_bytes: u64,
}

impl CleanReport {
    pub fn is_empty(&self) -> bool {
        self.discarded == 0 && self.evicted == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Unexposed,
    Exposed,
}

impl FileCache {
    /// One full cleaning pass down to the low water marks. An accounting
    /// violation is reported before anything is touched.
    pub async fn clean(&self) -> Result<CleanReport> {
        if let Err(e) = self.check_accounting() {
            error!("cache accounting is broken: {}", e);
            return Err(e);
        }
        let limits = self.limits();
        let report = self.shrink(limits.low_bytes, limits.low_nodes).await;
        if !report.is_empty() {
            debug!(
                "cleaner: {} discarded, {} evicted ({} forced), {} bytes freed",
                report.discarded, report.evicted, report.forced, report.freed_bytes
            );
        }
        Ok(report)
    }

    /// Frees enough for `bytes` more resident bytes and `nodes` more entries
    /// right now, for callers that cannot wait for the background pass.
    pub async fn reclaim(&self, bytes: u64, nodes: u32) -> Result<CleanReport> {
        let limits = self.limits();
        if bytes > limits.high_bytes {
            return Err(CacheError::NoSpace { needed: bytes });
        }
        let report = self
            .shrink(
                limits.high_bytes - bytes,
                limits.high_nodes.saturating_sub(nodes),
            )
            .await;
        let st = self.state.lock();
        if st.used_bytes + bytes > st.limits.high_bytes {
            warn!("cannot free {} bytes, {} in use", bytes, st.used_bytes);
            return Err(CacheError::NoSpace { needed: bytes });
        }
        if st.used_nodes + nodes > st.limits.high_nodes {
            return Err(CacheError::NoNodes);
        }
        Ok(report)
    }

    async fn shrink(&self, target_bytes: u64, target_nodes: u32) -> CleanReport {
        let mut report = CleanReport::default();
        for phase in [Phase::Unexposed, Phase::Exposed] {
            self.discard_pass(phase, target_bytes, &mut report);
            self.evict_pass(phase, target_bytes, target_nodes, &mut report)
                .await;
        }
        report
    }

    fn over(&self, target_bytes: u64, target_nodes: u32) -> (bool, bool) {
        let st = self.state.lock();
        (st.used_bytes > target_bytes, st.used_nodes > target_nodes)
    }

    /// Drops resident bytes of idle entries, keeping their attributes.
    fn discard_pass(&self, phase: Phase, target_bytes: u64, report: &mut CleanReport) {
        let order = self.state.lock().table.cold_to_hot();
        for slot in order {
            if !self.over(target_bytes, u32::MAX).0 {
                return;
            }
            let Some((lock, forced)) = self.claim(slot, phase, true) else {
                continue;
            };
            let freed = self.state.lock().discard_data(slot);
            if let Err(e) = self.store.truncate(slot, 0) {
                warn!("cannot truncate cache file {}: {}", slot, e);
            }
            if let Err(e) = self.store.remove_dir_listing(slot) {
                warn!("cannot remove listing {}: {}", slot, e);
            }
            drop(lock);
            report.discarded += 1;
            report.forced += usize::from(forced);
            report.freed_bytes += freed;
        }
    }

    async fn evict_pass(
        &self,
        phase: Phase,
        target_bytes: u64,
        target_nodes: u32,
        report: &mut CleanReport,
    ) {
        let order = self.state.lock().table.cold_to_hot();
        for slot in order {
            let (bytes, nodes) = self.over(target_bytes, target_nodes);
            if !bytes && !nodes {
                return;
            }
            let Some((lock, forced)) = self.claim(slot, phase, false) else {
                continue;
            };
            let evicted = {
                let mut st = self.state.lock();
                let freed = st.table.get(slot).fetched;
                report.freed_bytes += freed;
                st.unhash(slot, Instant::now())
            };
            self.finish_evict(evicted).await;
            drop(lock);
            report.evicted += 1;
            report.forced += usize::from(forced);
        }
    }

    /// Locks an idle in-use entry the phase allows touching. In the exposed
    /// phase the kernel is told to let go first.
    fn claim(
        &self,
        slot: SlotId,
        phase: Phase,
        needs_data: bool,
    ) -> Option<(tokio::sync::OwnedMutexGuard<()>, bool)> {
        let mut st = self.state.lock();
        let e = st.table.get_mut(slot);
        if !e.flags.in_use || e.refcount != 0 || e.flags.pinned {
            return None;
        }
        if needs_data && e.fetched == 0 {
            return None;
        }
        if phase == Phase::Unexposed && e.flags.exposed {
            return None;
        }
        let lock = e.lock.clone().try_lock_owned().ok()?;
        let forced = e.flags.exposed;
        if forced {
            self.notifier.invalidate(e.fid);
            e.flags.exposed = false;
        }
        Some((lock, forced))
    }
}

/// Background task running [`FileCache::clean`] on an interval or when
/// woken.
pub struct Cleaner {
    cache: Arc<FileCache>,
}

impl Cleaner {
    pub fn new(cache: Arc<FileCache>) -> Self {
        Self { cache }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run(shutdown))
    }

    /// Returns an error only for an accounting violation, after a best
    /// effort to save the cache state.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("cleaner started");
        let mut ticker = interval(self.cache.config().cleaner_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = ticker.tick() => {}
                _ = self.cache.cleaner_wake.notified() => {}
            }
            match self.cache.clean().await {
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    if let Err(save) = self.cache.store_state() {
                        error!("cannot save cache state: {}", save);
                    }
                    return Err(e);
                }
                Err(e) => warn!("cleaner pass failed: {}", e),
            }
        }
        info!("cleaner stopped");
        Ok(())
    }
}
