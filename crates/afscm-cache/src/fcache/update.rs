use super::{EntryGuard, FileCache};
use crate::attr::CachedAttr;
use crate::entry::Lease;
use crate::error::Result;
use afscm_rpc::{Credential, StatusReply};
use std::net::Ipv4Addr;
use tokio::time::Instant;
use tracing::{debug, trace};

impl FileCache {
    /// Folds a server's answer about this entry into the cache. Every RPC
    /// that returns a status for a cached object ends up here.
    pub fn apply_server_response(
        &self,
        guard: &EntryGuard,
        reply: &StatusReply,
        host: Option<Ipv4Addr>,
        credential: &Credential,
    ) -> Result<()> {
        self.apply(guard, reply, host, credential, false)
    }

    /// `keep_data` says the resident bytes already belong to the version in
    /// `reply`, so a version change must not discard them.
    pub(crate) fn apply(
        &self,
        guard: &EntryGuard,
        reply: &StatusReply,
        host: Option<Ipv4Addr>,
        credential: &Credential,
        keep_data: bool,
    ) -> Result<()> {
        let now = Instant::now();
        let fid = guard.fid();
        let slot = guard.slot();

        let (truncate, new_minimum) = {
            let mut st = self.state.lock();
            let e = st.table.get_mut(slot);
            debug_assert!(e.is_locked(), "updating {} without its lock", fid);

            let known = e.flags.attr_valid || e.flags.stale || e.fetched > 0;
            let version_changed = known && e.attr.data_version != reply.status.data_version;

            e.attr = CachedAttr::from(&reply.status);
            e.access.set(credential.principal, reply.status.caller_access);
            e.anon_access = reply.status.anon_access;
            // a volume root keeps the directory it was mounted from
            if e.real_fid.is_none() {
                if let Some(parent) = e.attr.parent_fid(&fid) {
                    e.parent = Some(parent);
                }
            }
            if !e.attr.may_be_mountpoint() {
                e.flags.mountpoint = false;
            }
            if let Some(host) = host {
                e.host = Some(host);
            }
            if let Some(vol_sync) = reply.vol_sync {
                e.vol_sync = Some(vol_sync);
            }
            if let Some(grant) = &reply.callback {
                e.lease = Lease::granted(grant, now);
            }
            e.flags.attr_valid = true;
            e.flags.stale = false;
            // a reply may predate a break that raced it
            if !e.flags.broken {
                e.flags.sentenced = false;
            }

            let expires = (!e.lease.is_dropped()).then_some(e.lease.expires).flatten();
            let new_minimum = match expires {
                Some(at) => st.heap.insert(slot, at),
                None => {
                    st.heap.remove(slot);
                    false
                }
            };

            let truncate = if version_changed && !keep_data {
                debug!("{} changed to version {}", fid, reply.status.data_version);
                st.discard_data(slot);
                true
            } else {
                let e = st.table.get_mut(slot);
                e.flags.data_valid = e.fetched > 0 || e.attr.length == 0;
                false
            };
            (truncate, new_minimum)
        };

        if new_minimum {
            self.invalidator_wake.notify_one();
        }
        if let Some(vol_sync) = reply.vol_sync {
            self.locator.update_vol_sync(fid.cell, fid.volume, vol_sync);
        }
        if truncate {
            self.store.truncate(slot, 0)?;
            self.store.remove_dir_listing(slot)?;
        }
        trace!("applied status for {}", fid);
        Ok(())
    }
}
