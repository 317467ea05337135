//! On-disk cache files, one per slot.
//!
//! Slot `0xHHLL` lives at `<root>/HH/LL`; a locally converted directory
//! listing for the same slot at `<root>/HH/LL.dir`.

use crate::entry::SlotId;
use crate::error::Result;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::trace;

#[derive(Debug, Clone)]
pub struct SlotStore {
    root: PathBuf,
}

impl SlotStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, slot: SlotId) -> PathBuf {
        let [hi, lo] = slot.0.to_be_bytes();
        self.root.join(format!("{:02X}", hi)).join(format!("{:02X}", lo))
    }

    pub fn dir_path(&self, slot: SlotId) -> PathBuf {
        let mut path = self.path(slot).into_os_string();
        path.push(".dir");
        PathBuf::from(path)
    }

    fn open(&self, slot: SlotId, truncate: bool) -> Result<File> {
        let path = self.path(slot);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(truncate)
            .open(&path)?;
        Ok(file)
    }

    /// Creates an empty cache file for the slot.
    pub fn create(&self, slot: SlotId) -> Result<()> {
        self.open(slot, true)?;
        trace!("created cache file {}", slot);
        Ok(())
    }

    pub fn exists(&self, slot: SlotId) -> bool {
        self.path(slot).exists()
    }

    pub fn write_at(&self, slot: SlotId, offset: u64, data: &[u8]) -> Result<()> {
        let mut file = self.open(slot, false)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    /// Reads up to `len` bytes; shorter when the file ends first.
    pub fn read_at(&self, slot: SlotId, offset: u64, len: u64) -> Result<Vec<u8>> {
        let mut file = match File::open(self.path(slot)) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::new();
        file.take(len).read_to_end(&mut buf)?;
        Ok(buf)
    }

    pub fn len(&self, slot: SlotId) -> Result<u64> {
        match fs::metadata(self.path(slot)) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    pub fn truncate(&self, slot: SlotId, len: u64) -> Result<()> {
        let file = self.open(slot, false)?;
        file.set_len(len)?;
        Ok(())
    }

    pub fn remove_dir_listing(&self, slot: SlotId) -> Result<()> {
        match fs::remove_file(self.dir_path(slot)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_path_layout() {
        let store = SlotStore {
            root: PathBuf::from("/cache"),
        };
        assert_eq!(store.path(SlotId(0x012f)), PathBuf::from("/cache/01/2F"));
        assert_eq!(
            store.dir_path(SlotId(0xff00)),
            PathBuf::from("/cache/FF/00.dir")
        );
    }

    #[test]
    fn test_write_read_truncate() {
        let dir = TempDir::new().unwrap();
        let store = SlotStore::new(dir.path()).unwrap();
        let slot = SlotId(258);
        store.write_at(slot, 0, b"hello world").unwrap();
        assert_eq!(store.len(slot).unwrap(), 11);
        assert_eq!(store.read_at(slot, 6, 100).unwrap(), b"world");
        store.truncate(slot, 5).unwrap();
        assert_eq!(store.read_at(slot, 0, 100).unwrap(), b"hello");
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = TempDir::new().unwrap();
        let store = SlotStore::new(dir.path()).unwrap();
        assert!(store.read_at(SlotId(9), 0, 10).unwrap().is_empty());
        assert_eq!(store.len(SlotId(9)).unwrap(), 0);
        store.remove_dir_listing(SlotId(9)).unwrap();
    }

    #[test]
    fn test_create_truncates() {
        let dir = TempDir::new().unwrap();
        let store = SlotStore::new(dir.path()).unwrap();
        store.write_at(SlotId(1), 0, b"old").unwrap();
        store.create(SlotId(1)).unwrap();
        assert!(store.exists(SlotId(1)));
        assert_eq!(store.len(SlotId(1)).unwrap(), 0);
    }
}
