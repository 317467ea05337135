//! Background liveness prober for dead hosts.
//!
//! Dead root connections sit in a deadline queue. The prober sleeps until the
//! earliest deadline, probes, and either revives the host or backs off. Queue
//! entries are validated lazily: a deadline that no longer matches the
//! connection's current one is skipped.

use crate::conn::{ConnId, ConnectionCache};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace};

pub(crate) struct ProbeQueue {
    heap: Mutex<BinaryHeap<Reverse<(Instant, ConnId)>>>,
    wake: Notify,
}

impl ProbeQueue {
    pub(crate) fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            wake: Notify::new(),
        }
    }

    pub(crate) fn schedule(&self, due: Instant, id: ConnId) {
        let mut heap = self.heap.lock();
        let earlier = heap.peek().map(|Reverse((d, _))| due < *d).unwrap_or(true);
        heap.push(Reverse((due, id)));
        drop(heap);
        if earlier {
            self.wake.notify_one();
        }
    }

    pub(crate) fn wake(&self) {
        self.wake.notify_one();
    }

    fn next_due(&self) -> Option<Instant> {
        self.heap.lock().peek().map(|Reverse((due, _))| *due)
    }

    fn pop_due(&self, now: Instant) -> Vec<(Instant, ConnId)> {
        let mut heap = self.heap.lock();
        let mut due = Vec::new();
        while let Some(Reverse((at, _))) = heap.peek() {
            if *at > now {
                break;
            }
            if let Some(Reverse(item)) = heap.pop() {
                due.push(item);
            }
        }
        due
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.lock().len()
    }
}

pub struct Prober {
    cache: Arc<ConnectionCache>,
}

impl Prober {
    pub fn new(cache: Arc<ConnectionCache>) -> Self {
        Self { cache }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("prober started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let next = self.cache.probes.next_due();
            let deadline = async move {
                match next {
                    Some(due) => sleep_until(due).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = self.cache.probes.wake.notified() => {}
                _ = deadline => {
                    self.probe_due().await;
                }
            }
        }
        info!("prober stopped");
    }

    /// Probes every connection whose deadline has passed. Returns how many
    /// probes were sent.
    pub async fn probe_due(&self) -> usize {
        let mut sent = 0;
        for (due, id) in self.cache.probes.pop_due(Instant::now()) {
            let Some((handle, probe)) = self.cache.checkout_probe(id, due) else {
                trace!("skipping stale probe entry {:?}", id);
                continue;
            };
            sent += 1;
            let server = handle.server();
            match probe.probe(server.as_ref()).await {
                Ok(()) => self.cache.mark_alive(&handle),
                Err(e) => {
                    debug!("probe of {} failed: {}", handle.host(), e);
                    self.cache.probe_failed(id);
                }
            }
        }
        sent
    }
}
