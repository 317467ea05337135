//! Creates the cache files of free slots ahead of time so the first fetch
//! into a slot does not pay for it.

use crate::entry::SlotId;
use crate::error::Result;
use crate::fcache::FileCache;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

impl FileCache {
    /// Creates the cache file of `slot` if it is free and has none yet.
    /// Returns true if a file was created.
    pub fn prealloc_slot(&self, slot: SlotId) -> Result<bool> {
        let _lock = {
            let st = self.state.lock();
            if slot.index() >= st.table.len() {
                return Ok(false);
            }
            let e = st.table.get(slot);
            if e.flags.in_use {
                return Ok(false);
            }
            match e.lock.clone().try_lock_owned() {
                Ok(lock) => lock,
                Err(_) => return Ok(false),
            }
        };
        if self.store.exists(slot) {
            return Ok(false);
        }
        self.store.create(slot)?;
        Ok(true)
    }

    pub fn arena_len(&self) -> usize {
        self.state.lock().table.len()
    }
}

pub struct Preallocator {
    cache: Arc<FileCache>,
}

impl Preallocator {
    pub fn new(cache: Arc<FileCache>) -> Self {
        Self { cache }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<usize> {
        tokio::spawn(self.run(shutdown))
    }

    /// Walks the arena once. Returns the number of files created.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> usize {
        let delay = self.cache.config().prealloc_delay();
        let total = self.cache.arena_len();
        let mut created = 0;
        for idx in 0..total {
            if *shutdown.borrow() {
                break;
            }
            match self.cache.prealloc_slot(SlotId(idx as u16)) {
                Ok(true) => created += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("cannot create cache file {}: {}", SlotId(idx as u16), e);
                    break;
                }
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!("preallocated {} of {} cache files", created, total);
        info!("preallocator done");
        created
    }
}
