//! Connection cache.
//!
//! Connections are keyed by (cell, host, port, service, principal, security)
//! so that each principal gets its own authenticated connection. Every
//! authenticated connection is linked to the unauthenticated connection for
//! the same host; only that parent is probed, and its liveness is mirrored to
//! all of its children.
//!
//! Storage is a growable arena. A connection whose refcount drops to zero stays
//! hashed so it can be reused; when the freelist runs dry a sweep reclaims all
//! unreferenced hashed connections before any new storage is allocated.

use crate::config::RpcConfig;
use crate::error::{Result, RpcError};
use crate::prober::ProbeQueue;
use crate::server::{Connector, FileServer, Probe, Service};
use crate::types::{Credential, SecurityIndex};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnKey {
    pub cell: i32,
    pub host: Ipv4Addr,
    pub port: u16,
    pub service: Service,
    pub principal: u64,
    pub security: SecurityIndex,
}

impl ConnKey {
    pub fn new(
        cell: i32,
        host: Ipv4Addr,
        port: u16,
        service: Service,
        credential: &Credential,
    ) -> Self {
        Self {
            cell,
            host,
            port,
            service,
            principal: credential.principal,
            security: credential.security,
        }
    }

    /// Key of the unauthenticated connection to the same endpoint.
    pub fn anonymous(&self) -> Self {
        Self {
            principal: Credential::ANONYMOUS_PRINCIPAL,
            security: SecurityIndex::None,
            ..*self
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.security == SecurityIndex::None
    }
}

impl fmt::Display for ConnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}/{:?} cell {} principal {}",
            self.host, self.port, self.service, self.cell, self.principal
        )
    }
}

struct ConnEntry {
    key: Option<ConnKey>,
    server: Option<Arc<dyn FileServer>>,
    probe: Option<Arc<dyn Probe>>,
    refcount: u32,
    alive: bool,
    parent: Option<ConnId>,
    rtt_us: u64,
    backoff: Duration,
    probe_due: Option<Instant>,
}

impl ConnEntry {
    fn vacant() -> Self {
        Self {
            key: None,
            server: None,
            probe: None,
            refcount: 0,
            alive: true,
            parent: None,
            rtt_us: 0,
            backoff: Duration::ZERO,
            probe_due: None,
        }
    }

    fn is_hashed(&self) -> bool {
        self.key.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnStatus {
    pub allocated: usize,
    pub hashed: usize,
    pub free: usize,
    pub referenced: usize,
    pub dead: usize,
    pub probes_pending: usize,
    pub sweeps: u64,
    pub reclaimed: u64,
}

struct ConnTable {
    entries: Vec<ConnEntry>,
    index: HashMap<ConnKey, ConnId>,
    free: Vec<ConnId>,
    sweeps: u64,
    reclaimed: u64,
}

impl ConnTable {
    fn root_of(&self, id: ConnId) -> ConnId {
        self.entries[id.0].parent.unwrap_or(id)
    }

    fn set_liveness(&mut self, root: ConnId, alive: bool) {
        self.entries[root.0].alive = alive;
        for entry in self.entries.iter_mut() {
            if entry.parent == Some(root) {
                entry.alive = alive;
            }
        }
    }

    /// Reclaim every hashed connection nobody references. Reclaiming a child
    /// releases its hold on the parent, so repeat until nothing changes.
    fn sweep(&mut self) -> usize {
        let mut total = 0;
        loop {
            let mut reclaimed = 0;
            for idx in 0..self.entries.len() {
                let entry = &self.entries[idx];
                if !entry.is_hashed() || entry.refcount != 0 {
                    continue;
                }
                let parent = entry.parent;
                if let Some(key) = entry.key {
                    self.index.remove(&key);
                }
                self.entries[idx] = ConnEntry::vacant();
                if let Some(parent) = parent {
                    let p = &mut self.entries[parent.0];
                    p.refcount = p.refcount.saturating_sub(1);
                }
                self.free.push(ConnId(idx));
                reclaimed += 1;
            }
            if reclaimed == 0 {
                break;
            }
            total += reclaimed;
        }
        self.sweeps += 1;
        self.reclaimed += total as u64;
        total
    }

    fn grow(&mut self, n: usize) {
        let start = self.entries.len();
        for idx in start..start + n.max(1) {
            self.entries.push(ConnEntry::vacant());
            self.free.push(ConnId(idx));
        }
    }
}

pub struct ConnectionCache {
    config: RpcConfig,
    connector: Arc<dyn Connector>,
    table: Mutex<ConnTable>,
    pub(crate) probes: ProbeQueue,
}

impl ConnectionCache {
    pub fn new(config: RpcConfig, connector: Arc<dyn Connector>) -> Arc<Self> {
        let mut table = ConnTable {
            entries: Vec::new(),
            index: HashMap::new(),
            free: Vec::new(),
            sweeps: 0,
            reclaimed: 0,
        };
        table.grow(config.conn_batch);
        Arc::new(Self {
            config,
            connector,
            table: Mutex::new(table),
            probes: ProbeQueue::new(),
        })
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Returns a referenced connection for the tuple, creating it (and its
    /// unauthenticated parent) on demand.
    pub fn acquire(
        self: &Arc<Self>,
        cell: i32,
        host: Ipv4Addr,
        port: u16,
        service: Service,
        probe: Arc<dyn Probe>,
        credential: &Credential,
    ) -> Result<ConnHandle> {
        let key = ConnKey::new(cell, host, port, service, credential);
        let mut table = self.table.lock();

        if let Some(&id) = table.index.get(&key) {
            let entry = &mut table.entries[id.0];
            let server = entry.server.clone().ok_or(RpcError::NotConnected)?;
            entry.refcount += 1;
            trace!("reusing connection {}", key);
            return Ok(self.handle(id, key, server));
        }

        let parent = if key.is_anonymous() {
            None
        } else {
            let parent_key = key.anonymous();
            let pid = match table.index.get(&parent_key) {
                Some(&pid) => pid,
                None => self.create(
                    &mut table,
                    parent_key,
                    &Credential::anonymous(cell),
                    probe.clone(),
                )?,
            };
            table.entries[pid.0].refcount += 1;
            Some(pid)
        };

        let id = match self.create(&mut table, key, credential, probe) {
            Ok(id) => id,
            Err(e) => {
                if let Some(pid) = parent {
                    let p = &mut table.entries[pid.0];
                    p.refcount = p.refcount.saturating_sub(1);
                }
                return Err(e);
            }
        };

        let alive = parent.map(|p| table.entries[p.0].alive).unwrap_or(true);
        let entry = &mut table.entries[id.0];
        entry.parent = parent;
        entry.alive = alive;
        entry.refcount = 1;
        let server = entry.server.clone().ok_or(RpcError::NotConnected)?;
        debug!("new connection {} (parent {:?})", key, parent);
        Ok(self.handle(id, key, server))
    }

    fn handle(self: &Arc<Self>, id: ConnId, key: ConnKey, server: Arc<dyn FileServer>) -> ConnHandle {
        ConnHandle {
            cache: Arc::clone(self),
            id,
            key,
            server,
        }
    }

    fn create(
        &self,
        table: &mut ConnTable,
        key: ConnKey,
        credential: &Credential,
        probe: Arc<dyn Probe>,
    ) -> Result<ConnId> {
        if table.free.is_empty() {
            let reclaimed = table.sweep();
            debug!("connection freelist empty, sweep reclaimed {}", reclaimed);
        }
        if table.free.is_empty() {
            table.grow(self.config.conn_batch);
            info!(
                "grew connection pool to {} entries",
                table.entries.len()
            );
        }

        let server = self
            .connector
            .connect(key.host, key.port, key.service, credential)?;
        let id = table.free.pop().ok_or(RpcError::NotConnected)?;
        let entry = &mut table.entries[id.0];
        *entry = ConnEntry::vacant();
        entry.key = Some(key);
        entry.server = Some(server);
        entry.probe = Some(probe);
        entry.rtt_us = self.config.initial_rtt_us;
        table.index.insert(key, id);
        Ok(id)
    }

    fn retain(&self, id: ConnId) {
        let mut table = self.table.lock();
        table.entries[id.0].refcount += 1;
    }

    fn release(&self, id: ConnId) {
        let mut table = self.table.lock();
        let entry = &mut table.entries[id.0];
        debug_assert!(entry.refcount > 0, "connection released too often");
        entry.refcount = entry.refcount.saturating_sub(1);
    }

    pub fn is_alive(&self, id: ConnId) -> bool {
        self.table.lock().entries[id.0].alive
    }

    /// Marks the probed connection for this endpoint dead (mirrored to every
    /// child) and queues it for probing.
    pub fn mark_dead(&self, handle: &ConnHandle) {
        let due = {
            let mut table = self.table.lock();
            let root = table.root_of(handle.id);
            let was_alive = table.entries[root.0].alive;
            table.set_liveness(root, false);
            let entry = &mut table.entries[root.0];
            if was_alive {
                warn!("host {} marked dead", handle.key.host);
            }
            if entry.probe_due.is_some() {
                None
            } else {
                entry.backoff = self.config.probe_interval();
                let due = Instant::now() + entry.backoff;
                entry.probe_due = Some(due);
                Some((due, root))
            }
        };
        if let Some((due, root)) = due {
            self.probes.schedule(due, root);
        }
    }

    pub fn mark_alive(&self, handle: &ConnHandle) {
        self.mark_alive_id(handle.id);
    }

    pub(crate) fn mark_alive_id(&self, id: ConnId) {
        let mut table = self.table.lock();
        let root = table.root_of(id);
        let was_alive = table.entries[root.0].alive;
        table.set_liveness(root, true);
        let entry = &mut table.entries[root.0];
        entry.probe_due = None;
        entry.backoff = Duration::ZERO;
        if !was_alive {
            if let Some(key) = entry.key {
                info!("host {} is back", key.host);
            }
        }
    }

    /// Asks the prober to check this endpoint now.
    pub fn probe_soon(&self, handle: &ConnHandle) {
        let now = Instant::now();
        let root = {
            let mut table = self.table.lock();
            let root = table.root_of(handle.id);
            let entry = &mut table.entries[root.0];
            if entry.backoff.is_zero() {
                entry.backoff = self.config.probe_interval();
            }
            entry.probe_due = Some(now);
            root
        };
        self.probes.schedule(now, root);
        self.probes.wake();
    }

    /// Hands out a reference plus the probe for a due entry, or `None` if
    /// the queued deadline is stale.
    pub(crate) fn checkout_probe(
        self: &Arc<Self>,
        id: ConnId,
        due: Instant,
    ) -> Option<(ConnHandle, Arc<dyn Probe>)> {
        let mut table = self.table.lock();
        let entry = &mut table.entries[id.0];
        if entry.probe_due != Some(due) {
            return None;
        }
        let key = entry.key?;
        let server = entry.server.clone()?;
        let probe = entry.probe.clone()?;
        entry.refcount += 1;
        Some((self.handle(id, key, server), probe))
    }

    /// Reschedules a probe with doubled backoff, capped.
    pub(crate) fn probe_failed(&self, id: ConnId) {
        let due = {
            let mut table = self.table.lock();
            let entry = &mut table.entries[id.0];
            entry.backoff = self.config.next_probe_backoff(entry.backoff);
            let due = Instant::now() + entry.backoff;
            entry.probe_due = Some(due);
            debug!(
                "probe of {:?} failed, next in {:?}",
                entry.key.map(|k| k.host),
                entry.backoff
            );
            due
        };
        self.probes.schedule(due, id);
    }

    pub fn backoff(&self, handle: &ConnHandle) -> Duration {
        let table = self.table.lock();
        let root = table.root_of(handle.id);
        table.entries[root.0].backoff
    }

    /// Folds a measured round trip into the host estimate.
    pub fn record_rtt(&self, handle: &ConnHandle, sample: Duration) {
        let mut table = self.table.lock();
        let root = table.root_of(handle.id);
        let entry = &mut table.entries[root.0];
        let sample_us = sample.as_micros().min(u64::MAX as u128) as u64;
        entry.rtt_us = (7 * entry.rtt_us + sample_us) / 8;
    }

    pub fn rtt_us(&self, handle: &ConnHandle) -> u64 {
        let table = self.table.lock();
        let root = table.root_of(handle.id);
        table.entries[root.0].rtt_us
    }

    pub fn refcount(&self, handle: &ConnHandle) -> u32 {
        self.table.lock().entries[handle.id.0].refcount
    }

    /// Reclaims every unreferenced connection now.
    pub fn sweep(&self) -> usize {
        self.table.lock().sweep()
    }

    pub fn status(&self) -> ConnStatus {
        let table = self.table.lock();
        let mut status = ConnStatus {
            allocated: table.entries.len(),
            free: table.free.len(),
            sweeps: table.sweeps,
            reclaimed: table.reclaimed,
            probes_pending: self.probes.len(),
            ..Default::default()
        };
        for entry in table.entries.iter().filter(|e| e.is_hashed()) {
            status.hashed += 1;
            if entry.refcount > 0 {
                status.referenced += 1;
            }
            if !entry.alive {
                status.dead += 1;
            }
        }
        status
    }
}

/// A referenced connection. Dropping it releases the reference.
pub struct ConnHandle {
    cache: Arc<ConnectionCache>,
    id: ConnId,
    key: ConnKey,
    server: Arc<dyn FileServer>,
}

impl ConnHandle {
    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn key(&self) -> &ConnKey {
        &self.key
    }

    pub fn host(&self) -> Ipv4Addr {
        self.key.host
    }

    pub fn server(&self) -> Arc<dyn FileServer> {
        Arc::clone(&self.server)
    }

    pub fn is_alive(&self) -> bool {
        self.cache.is_alive(self.id)
    }

    pub fn cache(&self) -> &Arc<ConnectionCache> {
        &self.cache
    }
}

impl Clone for ConnHandle {
    fn clone(&self) -> Self {
        self.cache.retain(self.id);
        Self {
            cache: Arc::clone(&self.cache),
            id: self.id,
            key: self.key,
            server: Arc::clone(&self.server),
        }
    }
}

impl Drop for ConnHandle {
    fn drop(&mut self) {
        self.cache.release(self.id);
    }
}

impl fmt::Debug for ConnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnHandle")
            .field("id", &self.id)
            .field("key", &self.key)
            .finish()
    }
}
