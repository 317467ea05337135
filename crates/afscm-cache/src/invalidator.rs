//! Lease expiry.

use crate::fcache::{FileCache, Sentence};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

impl FileCache {
    /// Stales every entry whose lease ran out at or before `now`. Entries
    /// somebody holds are sentenced instead. Returns how many were hit.
    pub fn expire_leases(&self, now: Instant) -> usize {
        let mut st = self.state.lock();
        let expired = st.heap.pop_expired(now);
        for slot in &expired {
            st.stale_or_sentence(*slot, self.notifier.as_ref(), Sentence::Expired);
        }
        expired.len()
    }

    pub fn next_expiry(&self) -> Option<Instant> {
        self.state.lock().heap.peek().map(|(at, _)| at)
    }
}

/// Sleeps until the earliest lease expiry and stales what has lapsed.
/// Leases are never renewed here; the next access revalidates.
pub struct Invalidator {
    cache: Arc<FileCache>,
}

impl Invalidator {
    pub fn new(cache: Arc<FileCache>) -> Self {
        Self { cache }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("invalidator started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let next = self.cache.next_expiry();
            let deadline = async move {
                match next {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = self.cache.invalidator_wake.notified() => {}
                _ = deadline => {
                    let expired = self.cache.expire_leases(Instant::now());
                    if expired > 0 {
                        debug!("{} leases expired", expired);
                    }
                }
            }
        }
        info!("invalidator stopped");
    }
}
