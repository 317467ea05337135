use super::{EntryGuard, FileCache};
use crate::error::Result;
use afscm_rpc::{Credential, StoreStatus};
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

impl FileCache {
    /// Writes into the cache file without telling the server. Bytes in
    /// front of `offset` are fetched first so the file never has holes the
    /// server would not agree with.
    pub async fn write_local(
        self: &Arc<Self>,
        guard: &EntryGuard,
        credential: &Credential,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        let slot = guard.slot();
        let (length, fetched) = guard.with(|e| (e.attr.length, e.fetched));
        if offset > fetched && fetched < length {
            self.verify_data(guard, credential, Some(offset.min(length))).await?;
        }

        let end = offset + data.len() as u64;
        let fetched = guard.fetched();
        if end > fetched {
            self.reserve(end - fetched).await?;
        }
        self.store.write_at(slot, offset, data)?;

        let mut st = self.state.lock();
        st.charge(slot, fetched.max(end));
        let e = st.table.get_mut(slot);
        debug_assert!(e.is_locked());
        e.attr.length = e.attr.length.max(end);
        e.flags.data_valid = true;
        Ok(())
    }

    /// Reads resident bytes; never goes to the network.
    pub fn read(&self, guard: &EntryGuard, offset: u64, len: u64) -> Result<Bytes> {
        let fetched = guard.fetched();
        let avail = fetched.saturating_sub(offset).min(len);
        if avail == 0 {
            return Ok(Bytes::new());
        }
        let data = self.store.read_at(guard.slot(), offset, avail)?;
        Ok(Bytes::from(data))
    }

    /// Stores the whole cache file back to the server.
    pub async fn write_data(&self, guard: &EntryGuard, credential: &Credential) -> Result<()> {
        let fid = guard.fid();
        let (length, fetched) = guard.with(|e| (e.attr.length, e.fetched));
        let data = Bytes::from(self.store.read_at(guard.slot(), 0, fetched)?);

        let mut ctx = self.fanout(&fid, credential).await?;
        let (reply, handle) = ctx
            .call(|server| {
                let data = data.clone();
                async move { server.store_data(fid, 0, data, length).await }
            })
            .await?;
        debug!("stored {} bytes of {}", data.len(), fid);
        self.apply(guard, &reply, Some(handle.host()), credential, true)
    }

    /// Cuts the file to `len` locally and on the server.
    pub async fn truncate(&self, guard: &EntryGuard, credential: &Credential, len: u64) -> Result<()> {
        let fid = guard.fid();
        let slot = guard.slot();
        if guard.fetched() > len {
            self.store.truncate(slot, len)?;
            self.state.lock().charge(slot, len);
        }
        guard.with_mut(|e| e.attr.length = len);

        let mut ctx = self.fanout(&fid, credential).await?;
        let (reply, handle) = ctx
            .call(|server| async move { server.store_data(fid, len, Bytes::new(), len).await })
            .await?;
        self.apply(guard, &reply, Some(handle.host()), credential, true)
    }

    /// Changes mode, owner, group or mtime on the server.
    pub async fn write_attr(
        &self,
        guard: &EntryGuard,
        credential: &Credential,
        status: &StoreStatus,
    ) -> Result<()> {
        if status.is_empty() {
            return Ok(());
        }
        let fid = guard.fid();
        let mut ctx = self.fanout(&fid, credential).await?;
        let (reply, handle) = ctx
            .call(|server| {
                let status = status.clone();
                async move { server.store_status(fid, &status).await }
            })
            .await?;
        self.apply(guard, &reply, Some(handle.host()), credential, false)
    }
}
