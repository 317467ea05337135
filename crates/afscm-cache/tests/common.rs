//! Common test utilities: an in-memory file server world, a volume locator
//! over it, and a cache wired to both.

#![allow(dead_code)]

use afscm_cache::{CacheConfig, DirectoryLister, FileCache, KernelNotifier};
use afscm_rpc::{
    AccessRights, AclReply, CallbackGrant, ConnectionCache, Connector, CreateReply, Credential,
    DataReply, ErrorClass, FetchStatus, FileId, FileServer, FileType, LeaseKind, LinkReply,
    RenameReply, Replica, ReplicaFlags, RpcConfig, RpcError, Service, StatusReply, StoreStatus,
    StoreVolumeStatus, VolSync, VolumeEntry, VolumeLocator, VolumeStatus,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const CELL: i32 = 1;
pub const VOLUME: u32 = 100;
pub const RO_VOLUME: u32 = 101;
pub const LEASE: Duration = Duration::from_secs(3600);

pub fn host(n: u8) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, n)
}

pub fn fid(vnode: u32) -> FileId {
    FileId::new(CELL, VOLUME, vnode, vnode)
}

pub fn root() -> FileId {
    FileId::volume_root(CELL, VOLUME)
}

pub fn cred() -> Credential {
    Credential::authenticated(1001, CELL, Bytes::from_static(b"ticket"))
}

#[derive(Debug, Clone)]
pub struct MockFile {
    pub status: FetchStatus,
    pub data: Vec<u8>,
}

/// Server-side truth shared by every mock server.
pub struct World {
    pub files: Mutex<HashMap<FileId, MockFile>>,
    pub names: Mutex<HashMap<(FileId, String), FileId>>,
    /// (host, call, fid) in call order.
    pub calls: Mutex<Vec<(Ipv4Addr, &'static str, FileId)>>,
    pub down: Mutex<HashSet<Ipv4Addr>>,
    pub grant: Mutex<Option<CallbackGrant>>,
    pub vol_sync: Mutex<Option<VolSync>>,
    pub given_up: Mutex<Vec<(Ipv4Addr, FileId)>>,
    pub acls: Mutex<HashMap<FileId, Bytes>>,
    pub volumes: Mutex<HashMap<u32, VolumeStatus>>,
    next_vnode: Mutex<u32>,
}

impl World {
    pub fn new() -> Arc<Self> {
        let world = Arc::new(Self {
            files: Mutex::new(HashMap::new()),
            names: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            down: Mutex::new(HashSet::new()),
            grant: Mutex::new(Some(CallbackGrant::new(LeaseKind::Shared, LEASE))),
            vol_sync: Mutex::new(None),
            given_up: Mutex::new(Vec::new()),
            acls: Mutex::new(HashMap::new()),
            volumes: Mutex::new(HashMap::new()),
            next_vnode: Mutex::new(1000),
        });
        world.add_dir(root());
        world
    }

    pub fn add_dir(&self, fid: FileId) {
        self.files.lock().insert(
            fid,
            MockFile {
                status: FetchStatus {
                    file_type: FileType::Directory,
                    link_count: 2,
                    length: 2048,
                    data_version: 1,
                    mode: 0o755,
                    caller_access: AccessRights::ALL,
                    anon_access: AccessRights::LOOKUP,
                    ..Default::default()
                },
                data: vec![0; 2048],
            },
        );
    }

    pub fn add_file(&self, fid: FileId, data: &[u8]) {
        self.files.lock().insert(
            fid,
            MockFile {
                status: FetchStatus {
                    file_type: FileType::File,
                    link_count: 1,
                    length: data.len() as u64,
                    data_version: 1,
                    mode: 0o644,
                    caller_access: AccessRights::READ.union(AccessRights::WRITE),
                    anon_access: AccessRights::READ,
                    parent_vnode: 1,
                    parent_unique: 1,
                    ..Default::default()
                },
                data: data.to_vec(),
            },
        );
    }

    pub fn add_symlink(&self, fid: FileId, target: &str, mode: u32) {
        self.add_file(fid, target.as_bytes());
        let mut files = self.files.lock();
        if let Some(file) = files.get_mut(&fid) {
            file.status.file_type = FileType::Symlink;
            file.status.mode = mode;
        }
    }

    /// Rewrites a file as another client would.
    pub fn modify(&self, fid: FileId, data: &[u8]) {
        let mut files = self.files.lock();
        if let Some(file) = files.get_mut(&fid) {
            file.data = data.to_vec();
            file.status.length = data.len() as u64;
            file.status.data_version += 1;
        }
    }

    pub fn set_down(&self, host: Ipv4Addr, down: bool) {
        let mut set = self.down.lock();
        if down {
            set.insert(host);
        } else {
            set.remove(&host);
        }
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.lock().iter().filter(|(_, c, _)| *c == call).count()
    }

    pub fn count_for(&self, call: &str, fid: FileId) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|(_, c, f)| *c == call && *f == fid)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().iter().filter(|(_, c, _)| *c != "get_time").count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    fn reply(&self, status: FetchStatus) -> StatusReply {
        let mut reply = StatusReply::new(status);
        if let Some(grant) = *self.grant.lock() {
            reply = reply.with_callback(grant);
        }
        if let Some(vol_sync) = *self.vol_sync.lock() {
            reply = reply.with_vol_sync(vol_sync);
        }
        reply
    }

    fn status_of(&self, fid: FileId) -> afscm_rpc::Result<FetchStatus> {
        self.files
            .lock()
            .get(&fid)
            .map(|f| f.status.clone())
            .ok_or(RpcError::NoSuchObject)
    }

    fn touch_dir(&self, dir: FileId, delta: i64) -> afscm_rpc::Result<FetchStatus> {
        let mut files = self.files.lock();
        let file = files.get_mut(&dir).ok_or(RpcError::NoSuchObject)?;
        file.status.data_version += 1;
        file.status.length = (file.status.length as i64 + delta).max(0) as u64;
        file.data.resize(file.status.length as usize, 0);
        Ok(file.status.clone())
    }

    fn create(&self, dir: FileId, name: &str, kind: FileType, data: &[u8]) -> afscm_rpc::Result<CreateReply> {
        if self.names.lock().contains_key(&(dir, name.to_string())) {
            return Err(RpcError::Exists);
        }
        let vnode = {
            let mut next = self.next_vnode.lock();
            *next += 2;
            *next
        };
        let vnode = if kind == FileType::Directory { vnode + 1 } else { vnode };
        let child = FileId::new(dir.cell, dir.volume, vnode, 1);
        match kind {
            FileType::Directory => self.add_dir(child),
            FileType::File => self.add_file(child, data),
            FileType::Symlink => self.add_symlink(child, std::str::from_utf8(data).unwrap_or(""), 0o755),
        }
        self.names.lock().insert((dir, name.to_string()), child);
        let dir_status = self.touch_dir(dir, 32)?;
        Ok(CreateReply {
            fid: child,
            child: self.status_of(child)?,
            dir: self.reply(dir_status),
        })
    }
}

pub struct MockServer {
    host: Ipv4Addr,
    world: Arc<World>,
}

impl MockServer {
    fn enter(&self, call: &'static str, fid: FileId) -> afscm_rpc::Result<()> {
        self.world.calls.lock().push((self.host, call, fid));
        if self.world.down.lock().contains(&self.host) {
            return Err(RpcError::CallDead { host: self.host });
        }
        Ok(())
    }
}

#[async_trait]
impl FileServer for MockServer {
    fn host(&self) -> Ipv4Addr {
        self.host
    }

    async fn fetch_status(&self, fid: FileId) -> afscm_rpc::Result<StatusReply> {
        self.enter("fetch_status", fid)?;
        Ok(self.world.reply(self.world.status_of(fid)?))
    }

    async fn bulk_status(&self, fids: &[FileId]) -> afscm_rpc::Result<Vec<(FileId, StatusReply)>> {
        self.enter("bulk_status", fids[0])?;
        Ok(fids
            .iter()
            .filter_map(|f| self.world.status_of(*f).ok().map(|s| (*f, self.world.reply(s))))
            .collect())
    }

    async fn fetch_data(&self, fid: FileId, offset: u64, len: u64) -> afscm_rpc::Result<DataReply> {
        self.enter("fetch_data", fid)?;
        let files = self.world.files.lock();
        let file = files.get(&fid).ok_or(RpcError::NoSuchObject)?;
        let start = (offset as usize).min(file.data.len());
        let end = ((offset + len) as usize).min(file.data.len());
        Ok(DataReply {
            data: Bytes::copy_from_slice(&file.data[start..end]),
            reply: self.world.reply(file.status.clone()),
        })
    }

    async fn store_data(
        &self,
        fid: FileId,
        offset: u64,
        data: Bytes,
        file_length: u64,
    ) -> afscm_rpc::Result<StatusReply> {
        self.enter("store_data", fid)?;
        let status = {
            let mut files = self.world.files.lock();
            let file = files.get_mut(&fid).ok_or(RpcError::NoSuchObject)?;
            let end = offset as usize + data.len();
            if file.data.len() < end {
                file.data.resize(end, 0);
            }
            file.data[offset as usize..end].copy_from_slice(&data);
            file.data.resize(file_length as usize, 0);
            file.status.length = file_length;
            file.status.data_version += 1;
            file.status.clone()
        };
        Ok(self.world.reply(status))
    }

    async fn store_status(&self, fid: FileId, status: &StoreStatus) -> afscm_rpc::Result<StatusReply> {
        self.enter("store_status", fid)?;
        let new = {
            let mut files = self.world.files.lock();
            let file = files.get_mut(&fid).ok_or(RpcError::NoSuchObject)?;
            if let Some(mode) = status.mode {
                file.status.mode = mode;
            }
            if let Some(owner) = status.owner {
                file.status.owner = owner;
            }
            if let Some(group) = status.group {
                file.status.group = group;
            }
            if let Some(mtime) = status.mtime_secs {
                file.status.mtime_secs = mtime;
            }
            file.status.clone()
        };
        Ok(self.world.reply(new))
    }

    async fn create_file(&self, dir: FileId, name: &str, _status: &StoreStatus) -> afscm_rpc::Result<CreateReply> {
        self.enter("create_file", dir)?;
        self.world.create(dir, name, FileType::File, b"")
    }

    async fn make_dir(&self, dir: FileId, name: &str, _status: &StoreStatus) -> afscm_rpc::Result<CreateReply> {
        self.enter("make_dir", dir)?;
        self.world.create(dir, name, FileType::Directory, b"")
    }

    async fn symlink(
        &self,
        dir: FileId,
        name: &str,
        target: &str,
        _status: &StoreStatus,
    ) -> afscm_rpc::Result<CreateReply> {
        self.enter("symlink", dir)?;
        self.world.create(dir, name, FileType::Symlink, target.as_bytes())
    }

    async fn link(&self, dir: FileId, name: &str, existing: FileId) -> afscm_rpc::Result<LinkReply> {
        self.enter("link", dir)?;
        let existing_status = {
            let mut files = self.world.files.lock();
            let file = files.get_mut(&existing).ok_or(RpcError::NoSuchObject)?;
            file.status.link_count += 1;
            file.status.clone()
        };
        self.world.names.lock().insert((dir, name.to_string()), existing);
        let dir_status = self.world.touch_dir(dir, 32)?;
        Ok(LinkReply {
            existing: existing_status,
            dir: self.world.reply(dir_status),
        })
    }

    async fn remove_file(&self, dir: FileId, name: &str) -> afscm_rpc::Result<StatusReply> {
        self.enter("remove_file", dir)?;
        let child = self
            .world
            .names
            .lock()
            .remove(&(dir, name.to_string()))
            .ok_or(RpcError::NoSuchObject)?;
        self.world.files.lock().remove(&child);
        Ok(self.world.reply(self.world.touch_dir(dir, -32)?))
    }

    async fn remove_dir(&self, dir: FileId, name: &str) -> afscm_rpc::Result<StatusReply> {
        self.enter("remove_dir", dir)?;
        let key = (dir, name.to_string());
        let child = *self.world.names.lock().get(&key).ok_or(RpcError::NoSuchObject)?;
        if self.world.names.lock().keys().any(|(d, _)| *d == child) {
            return Err(RpcError::NotEmpty);
        }
        self.world.names.lock().remove(&key);
        self.world.files.lock().remove(&child);
        Ok(self.world.reply(self.world.touch_dir(dir, -32)?))
    }

    async fn rename(
        &self,
        old_dir: FileId,
        old_name: &str,
        new_dir: FileId,
        new_name: &str,
    ) -> afscm_rpc::Result<RenameReply> {
        self.enter("rename", old_dir)?;
        let child = self
            .world
            .names
            .lock()
            .remove(&(old_dir, old_name.to_string()))
            .ok_or(RpcError::NoSuchObject)?;
        self.world.names.lock().insert((new_dir, new_name.to_string()), child);
        let (old_status, new_status) = if old_dir == new_dir {
            let s = self.world.touch_dir(old_dir, 0)?;
            (s.clone(), s)
        } else {
            (self.world.touch_dir(old_dir, -32)?, self.world.touch_dir(new_dir, 32)?)
        };
        Ok(RenameReply {
            old_dir: old_status,
            new_dir: new_status,
            vol_sync: None,
        })
    }

    async fn fetch_acl(&self, fid: FileId) -> afscm_rpc::Result<AclReply> {
        self.enter("fetch_acl", fid)?;
        let status = self.world.status_of(fid)?;
        let acl = self.world.acls.lock().get(&fid).cloned().unwrap_or_default();
        Ok(AclReply {
            acl,
            reply: self.world.reply(status),
        })
    }

    async fn store_acl(&self, fid: FileId, acl: Bytes) -> afscm_rpc::Result<StatusReply> {
        self.enter("store_acl", fid)?;
        let status = self.world.status_of(fid)?;
        if status.file_type != FileType::Directory {
            return Err(RpcError::NotDirectory);
        }
        self.world.acls.lock().insert(fid, acl);
        Ok(self.world.reply(status))
    }

    async fn get_volume_status(&self, volume: u32) -> afscm_rpc::Result<VolumeStatus> {
        self.enter("get_volume_status", FileId::volume_root(CELL, volume))?;
        self.world
            .volumes
            .lock()
            .get(&volume)
            .cloned()
            .ok_or(RpcError::NoSuchVolume { volume })
    }

    async fn set_volume_status(&self, volume: u32, status: &StoreVolumeStatus) -> afscm_rpc::Result<()> {
        self.enter("set_volume_status", FileId::volume_root(CELL, volume))?;
        let mut volumes = self.world.volumes.lock();
        let current = volumes.get_mut(&volume).ok_or(RpcError::NoSuchVolume { volume })?;
        if let Some(name) = &status.name {
            current.name = name.clone();
        }
        if let Some(quota) = status.max_quota {
            current.max_quota = quota;
        }
        if let Some(quota) = status.min_quota {
            current.min_quota = quota;
        }
        if let Some(message) = &status.offline_message {
            current.offline_message = message.clone();
        }
        if let Some(motd) = &status.motd {
            current.motd = motd.clone();
        }
        Ok(())
    }

    async fn give_up_callbacks(&self, fids: &[(FileId, CallbackGrant)]) -> afscm_rpc::Result<()> {
        self.enter("give_up", fids[0].0)?;
        let mut given = self.world.given_up.lock();
        for (fid, _) in fids {
            given.push((self.host, *fid));
        }
        Ok(())
    }

    async fn get_time(&self) -> afscm_rpc::Result<()> {
        self.enter("get_time", FileId::new(0, 0, 0, 0))
    }
}

pub struct MockConnector {
    world: Arc<World>,
}

impl Connector for MockConnector {
    fn connect(
        &self,
        host: Ipv4Addr,
        _port: u16,
        _service: Service,
        _credential: &Credential,
    ) -> afscm_rpc::Result<Arc<dyn FileServer>> {
        Ok(Arc::new(MockServer {
            host,
            world: Arc::clone(&self.world),
        }))
    }
}

pub struct MockLocator {
    pub volumes: Mutex<Vec<VolumeEntry>>,
    pub down: Mutex<Vec<(Ipv4Addr, ErrorClass)>>,
    pub cells: Mutex<HashMap<String, i32>>,
    pub syncs: Mutex<HashMap<u32, VolSync>>,
    pub resolves: Mutex<u32>,
}

impl MockLocator {
    pub fn new(hosts: &[u8]) -> Arc<Self> {
        let replicas = hosts
            .iter()
            .map(|n| Replica {
                addr: host(*n),
                partition: 0,
                flags: ReplicaFlags {
                    read_write: true,
                    read_only: true,
                    ..Default::default()
                },
            })
            .collect();
        Arc::new(Self {
            volumes: Mutex::new(vec![VolumeEntry {
                name: "root.cell".to_string(),
                ids: [Some(VOLUME), Some(RO_VOLUME), None],
                replicas,
                vol_sync: VolSync::default(),
            }]),
            down: Mutex::new(Vec::new()),
            cells: Mutex::new(HashMap::new()),
            syncs: Mutex::new(HashMap::new()),
            resolves: Mutex::new(0),
        })
    }

    pub fn add_volume(&self, entry: VolumeEntry) {
        self.volumes.lock().push(entry);
    }
}

#[async_trait]
impl VolumeLocator for MockLocator {
    async fn resolve(&self, _cell: i32, volume: u32, _credential: &Credential) -> afscm_rpc::Result<VolumeEntry> {
        *self.resolves.lock() += 1;
        self.volumes
            .lock()
            .iter()
            .find(|v| v.kind_of(volume).is_some())
            .cloned()
            .ok_or(RpcError::NoSuchVolume { volume })
    }

    async fn resolve_by_name(&self, _cell: i32, name: &str, _credential: &Credential) -> afscm_rpc::Result<VolumeEntry> {
        self.volumes
            .lock()
            .iter()
            .find(|v| v.name == name)
            .cloned()
            .ok_or(RpcError::NoSuchVolume { volume: 0 })
    }

    fn mark_replica_down(&self, _cell: i32, _volume: u32, replica: &Replica, class: ErrorClass) {
        self.down.lock().push((replica.addr, class));
    }

    fn invalidate(&self, _cell: i32, _volume: u32) {}

    fn update_vol_sync(&self, _cell: i32, volume: u32, vol_sync: VolSync) {
        self.syncs.lock().insert(volume, vol_sync);
    }

    fn vol_sync(&self, _cell: i32, volume: u32) -> Option<VolSync> {
        self.syncs.lock().get(&volume).copied()
    }

    fn cell_id(&self, name: &str) -> Option<i32> {
        self.cells.lock().get(name).copied()
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub notices: Mutex<Vec<FileId>>,
}

impl KernelNotifier for RecordingNotifier {
    fn invalidate(&self, fid: FileId) {
        self.notices.lock().push(fid);
    }
}

#[derive(Default)]
pub struct MockLister {
    pub dirs: Mutex<HashMap<FileId, Vec<(String, FileId)>>>,
}

#[async_trait]
impl DirectoryLister for MockLister {
    async fn list(&self, dir: FileId, _credential: &Credential) -> afscm_rpc::Result<Vec<(String, FileId)>> {
        Ok(self.dirs.lock().get(&dir).cloned().unwrap_or_default())
    }
}

pub struct Harness {
    pub cache: Arc<FileCache>,
    pub conns: Arc<ConnectionCache>,
    pub world: Arc<World>,
    pub locator: Arc<MockLocator>,
    pub notifier: Arc<RecordingNotifier>,
    pub lister: Arc<MockLister>,
    pub dir: TempDir,
}

pub fn small_config(dir: &TempDir) -> CacheConfig {
    CacheConfig {
        cache_dir: dir.path().join("cache"),
        low_nodes: 6,
        high_nodes: 8,
        low_bytes: 4_000,
        high_bytes: 8_000,
        block_size: 1024,
        cleaner_interval_secs: 3600,
        ..Default::default()
    }
}

pub fn harness() -> Harness {
    harness_with(&[1, 2, 3], |_| {})
}

pub fn harness_with(hosts: &[u8], tweak: impl FnOnce(&mut CacheConfig)) -> Harness {
    let dir = TempDir::new().unwrap();
    let mut config = small_config(&dir);
    tweak(&mut config);

    let world = World::new();
    let rpc = RpcConfig {
        rtt_jitter_us: 0,
        busy_retry_delay_ms: 10,
        ..Default::default()
    };
    let conns = ConnectionCache::new(
        rpc,
        Arc::new(MockConnector {
            world: Arc::clone(&world),
        }),
    );
    let locator = MockLocator::new(hosts);
    let notifier = Arc::new(RecordingNotifier::default());
    let lister = Arc::new(MockLister::default());
    let cache = FileCache::new(
        config,
        Arc::clone(&conns),
        locator.clone(),
        lister.clone(),
        notifier.clone(),
    )
    .unwrap();
    Harness {
        cache,
        conns,
        world,
        locator,
        notifier,
        lister,
        dir,
    }
}
