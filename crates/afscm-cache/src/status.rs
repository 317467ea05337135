//! Introspection of the file cache.

use crate::entry::{EntryState, SlotId};
use crate::fcache::{CacheStats, FileCache, Limits};
use afscm_rpc::FileId;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Serialize)]
pub struct EntrySummary {
    pub fid: FileId,
    pub slot: SlotId,
    pub state: EntryState,
    pub length: u64,
    pub fetched: u64,
    pub refcount: u32,
    pub exposed: bool,
    pub pinned: bool,
    pub mountpoint: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub used_nodes: u32,
    pub used_bytes: u64,
    pub limits: Limits,
    /// Slots in the arena, free or not.
    pub arena: usize,
    pub leases: usize,
    pub disconnected: bool,
    pub stats: CacheStats,
    /// Hottest first.
    pub entries: Vec<EntrySummary>,
}

impl CacheStatus {
    pub fn over_high_water(&self) -> bool {
        self.used_bytes > self.limits.high_bytes || self.used_nodes >= self.limits.high_nodes
    }
}

impl FileCache {
    pub fn status(&self) -> CacheStatus {
        let st = self.state.lock();
        let entries = st
            .table
            .cold_to_hot()
            .into_iter()
            .rev()
            .map(|slot| st.table.get(slot))
            .filter(|e| e.flags.in_use)
            .map(|e| EntrySummary {
                fid: e.fid,
                slot: e.slot,
                state: e.state(),
                length: e.attr.length,
                fetched: e.fetched,
                refcount: e.refcount,
                exposed: e.flags.exposed,
                pinned: e.flags.pinned,
                mountpoint: e.flags.mountpoint,
            })
            .collect();
        CacheStatus {
            used_nodes: st.used_nodes,
            used_bytes: st.used_bytes,
            limits: st.limits,
            arena: st.table.len(),
            leases: st.heap.len(),
            disconnected: self.is_disconnected(),
            stats: st.stats,
            entries,
        }
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "nodes: {} ({}-{}), arena {}",
            self.used_nodes, self.limits.low_nodes, self.limits.high_nodes, self.arena
        )?;
        writeln!(
            f,
            "bytes: {} ({}-{})",
            self.used_bytes, self.limits.low_bytes, self.limits.high_bytes
        )?;
        writeln!(
            f,
            "hits {} misses {} fetches {} data {} bulk {} evictions {} stales {}",
            self.stats.hits,
            self.stats.misses,
            self.stats.fetches,
            self.stats.data_fetches,
            self.stats.bulk_fetches,
            self.stats.evictions,
            self.stats.stales
        )?;
        if self.disconnected {
            writeln!(f, "disconnected")?;
        }
        for e in &self.entries {
            write!(
                f,
                "{} {} {} {}/{} ref {}",
                e.slot, e.fid, e.state, e.fetched, e.length, e.refcount
            )?;
            if e.exposed {
                write!(f, " exposed")?;
            }
            if e.pinned {
                write!(f, " pinned")?;
            }
            if e.mountpoint {
                write!(f, " mountpoint")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
