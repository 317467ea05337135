use super::{EntryGuard, FileCache};
use crate::attr::CachedAttr;
use crate::error::{CacheError, Result};
use afscm_rpc::{Credential, FileId, RpcError};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Fetch attempts before a file that keeps changing under us is reported
/// busy.
const VERSION_RACE_RETRIES: u32 = 3;

impl FileCache {
    /// Returns attributes the caller may trust, fetching them when the
    /// lease has lapsed or the principal has no cached rights.
    pub async fn verify_attr(
        self: &Arc<Self>,
        guard: &EntryGuard,
        parent: Option<FileId>,
        name: Option<&str>,
        credential: &Credential,
    ) -> Result<CachedAttr> {
        let fid = guard.fid();
        let now = Instant::now();
        let volume_sync = self.locator.vol_sync(fid.cell, fid.volume);
        let cached = guard.with(|e| {
            let known = e.rights_for(credential.principal).is_some();
            (known && e.is_uptodate(now, volume_sync)).then(|| e.attr.clone())
        });
        if let Some(attr) = cached {
            self.state.lock().stats.attr_hits += 1;
            trace!("attributes of {} are current", fid);
            return Ok(attr);
        }

        if self.is_disconnected() {
            return guard.with(|e| {
                if e.flags.attr_valid || e.flags.stale {
                    Ok(e.attr.clone())
                } else {
                    Err(CacheError::NotConnected)
                }
            });
        }

        if let Some(parent) = parent {
            if self.should_bulk(parent) && self.bulk_status(guard, parent, name, credential).await? {
                return Ok(guard.attr());
            }
        }
        self.fetch_status(guard, credential).await?;
        Ok(guard.attr())
    }

    /// Counts an access below `parent` and says whether it is time to
    /// amortize status fetches over its children.
    fn should_bulk(&self, parent: FileId) -> bool {
        if !self.config().bulkstatus_enabled {
            return false;
        }
        let threshold = self.config().bulkstatus_threshold;
        let mut st = self.state.lock();
        let count = st.parents.get_or_insert_mut(parent, || 0);
        *count = count.saturating_add(1);
        *count >= threshold
    }

    /// One bulk status call for the target and the stale siblings listed
    /// next to it. Returns false when the caller should fall back to a
    /// single fetch.
    async fn bulk_status(
        self: &Arc<Self>,
        guard: &EntryGuard,
        parent: FileId,
        name: Option<&str>,
        credential: &Credential,
    ) -> Result<bool> {
        let fid = guard.fid();
        let listing = match self.lister.list(parent, credential).await {
            Ok(listing) => listing,
            Err(e) => {
                debug!("cannot list {}: {}", parent, e);
                return Ok(false);
            }
        };
        let listed = listing
            .iter()
            .any(|(n, f)| *f == fid && name.map_or(true, |name| name == n));
        if !listed {
            trace!("{} not listed in {}", fid, parent);
            return Ok(false);
        }

        let now = Instant::now();
        let volume_sync = self.locator.vol_sync(fid.cell, fid.volume);
        let mut fids = vec![fid];
        {
            let st = self.state.lock();
            for (_, sibling) in &listing {
                if fids.len() >= self.config().bulkstatus_max {
                    break;
                }
                if sibling.cell != fid.cell || sibling.volume != fid.volume || fids.contains(sibling) {
                    continue;
                }
                let current = st
                    .table
                    .lookup(sibling)
                    .map(|slot| st.table.get(slot).is_uptodate(now, volume_sync))
                    .unwrap_or(false);
                if !current {
                    fids.push(*sibling);
                }
            }
        }

        let mut ctx = self.fanout(&fid, credential).await?;
        let (replies, handle) = ctx
            .call(|server| {
                let request = fids.clone();
                async move { server.bulk_status(&request).await }
            })
            .await?;
        self.state.lock().stats.bulk_fetches += 1;
        debug!("bulk status for {} objects below {}", fids.len(), parent);

        let host = handle.host();
        let Some((_, target)) = replies.iter().find(|(f, _)| *f == fid) else {
            return Ok(false);
        };
        self.apply(guard, target, Some(host), credential, false)?;

        for (sibling, reply) in replies.iter().filter(|(f, _)| *f != fid) {
            let Some(other) = self.try_get(*sibling).await else {
                continue;
            };
            if let Err(e) = self.apply(&other, reply, Some(host), credential, false) {
                warn!("cannot apply bulk status for {}: {}", sibling, e);
            }
        }
        Ok(true)
    }

    pub(crate) async fn fetch_status(&self, guard: &EntryGuard, credential: &Credential) -> Result<()> {
        let fid = guard.fid();
        let mut ctx = self.fanout(&fid, credential).await?;
        let (reply, handle) = ctx
            .call(|server| async move { server.fetch_status(fid).await })
            .await?;
        self.state.lock().stats.fetches += 1;
        self.apply(guard, &reply, Some(handle.host()), credential, false)
    }

    /// Makes bytes `[0, wanted)` resident; `None` asks for the whole file.
    pub async fn verify_data(
        self: &Arc<Self>,
        guard: &EntryGuard,
        credential: &Credential,
        wanted: Option<u64>,
    ) -> Result<()> {
        let fid = guard.fid();
        let slot = guard.slot();
        self.verify_attr(guard, None, None, credential).await?;

        let mut races = 0;
        loop {
            let (length, fetched, version) =
                guard.with(|e| (e.attr.length, e.fetched, e.attr.data_version));
            let want = wanted.map_or(length, |w| w.min(length));
            guard.with_mut(|e| e.wanted = want);
            if fetched >= want {
                guard.with_mut(|e| e.flags.data_valid = true);
                return Ok(());
            }
            if self.is_disconnected() {
                return Err(CacheError::NotConnected);
            }

            let block = self.config().block_size;
            let end = want.div_ceil(block).saturating_mul(block).min(length);
            let len = end - fetched;
            self.reserve(len).await?;

            let mut ctx = self.fanout(&fid, credential).await?;
            let (reply, handle) = ctx
                .call(|server| async move { server.fetch_data(fid, fetched, len).await })
                .await?;
            self.state.lock().stats.data_fetches += 1;
            let host = handle.host();

            if reply.reply.status.data_version != version {
                races += 1;
                debug!(
                    "{} changed while fetching ({} -> {})",
                    fid, version, reply.reply.status.data_version
                );
                self.apply(guard, &reply.reply, Some(host), credential, false)?;
                if races >= VERSION_RACE_RETRIES {
                    return Err(RpcError::Busy.into());
                }
                continue;
            }

            self.store.write_at(slot, fetched, &reply.data)?;
            let resident = fetched + reply.data.len() as u64;
            self.state.lock().charge(slot, resident);
            self.apply(guard, &reply.reply, Some(host), credential, true)?;
            self.detect_mountpoint(guard)?;
            trace!("{} holds {} of {} bytes", fid, resident, length);

            if reply.data.is_empty() {
                // server has nothing past what we hold
                guard.with_mut(|e| e.flags.data_valid = true);
                return Ok(());
            }
        }
    }

    /// Makes room for `bytes` more resident bytes.
    pub(crate) async fn reserve(&self, bytes: u64) -> Result<()> {
        let over = {
            let st = self.state.lock();
            st.used_bytes + bytes > st.limits.high_bytes
        };
        if over {
            self.wake_cleaner();
            self.reclaim(bytes, 0).await?;
        }
        Ok(())
    }
}
