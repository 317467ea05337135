use super::{FileCache, Sentence};
use crate::entry::SlotId;
use std::net::Ipv4Addr;
use tracing::info;

impl FileCache {
    /// Forgets what `principal` may do. Entries that held rights for it are
    /// staled so the next access asks the server again.
    pub fn purge_cred(&self, principal: u64, cell: Option<i32>) -> usize {
        let mut st = self.state.lock();
        let slots: Vec<SlotId> = st
            .table
            .in_use()
            .filter(|e| cell.map_or(true, |c| e.fid.cell == c))
            .filter(|e| e.access.get(principal).is_some())
            .map(|e| e.slot)
            .collect();
        for slot in &slots {
            st.table.get_mut(*slot).access.remove(principal);
            st.stale_or_sentence(*slot, self.notifier.as_ref(), Sentence::Broken);
        }
        info!("purged principal {}: {} entries", principal, slots.len());
        slots.len()
    }

    /// Stales everything cached from one volume.
    pub fn purge_volume(&self, cell: i32, volume: u32) -> usize {
        self.locator.invalidate(cell, volume);
        let mut st = self.state.lock();
        let slots: Vec<SlotId> = st
            .table
            .in_use()
            .filter(|e| e.fid.cell == cell && e.fid.volume == volume)
            .map(|e| e.slot)
            .collect();
        for slot in &slots {
            st.stale_or_sentence(*slot, self.notifier.as_ref(), Sentence::Broken);
        }
        info!("purged volume {} in cell {}: {} entries", volume, cell, slots.len());
        slots.len()
    }

    /// Stales entries whose lease came from `host`. Busy entries are left
    /// alone.
    pub fn purge_host(&self, host: Ipv4Addr) -> usize {
        let mut st = self.state.lock();
        let slots: Vec<SlotId> = st
            .table
            .in_use()
            .filter(|e| e.host == Some(host) && !e.is_locked())
            .map(|e| e.slot)
            .collect();
        for slot in &slots {
            st.apply_stale(*slot, self.notifier.as_ref());
            st.table.get_mut(*slot).host = None;
        }
        info!("purged host {}: {} entries", host, slots.len());
        slots.len()
    }
}
