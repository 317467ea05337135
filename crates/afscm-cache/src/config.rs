use crate::error::{CacheError, Result};
use afscm_rpc::RpcConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest arena a 16-bit slot index can address.
pub const MAX_NODES: u32 = 1 << 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub cache_dir: PathBuf,
    /// Node count the cleaner shrinks to.
    pub low_nodes: u32,
    /// Arena size; allocation beyond it fails with out-of-nodes.
    pub high_nodes: u32,
    pub low_bytes: u64,
    pub high_bytes: u64,
    /// Data fetches are rounded up to a multiple of this.
    pub block_size: u64,
    /// Principals whose rights are remembered per entry.
    pub access_slots: usize,
    pub bulkstatus_enabled: bool,
    /// Accesses to a parent directory before siblings are fetched in bulk.
    pub bulkstatus_threshold: u32,
    /// Objects per bulk status call, target included.
    pub bulkstatus_max: usize,
    /// Parent directories whose access counts are tracked.
    pub parent_tracking: usize,
    pub cleaner_interval_secs: u64,
    /// Pause between two pre-created cache files.
    pub prealloc_delay_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("/var/cache/afscm"),
            low_nodes: 3_000,
            high_nodes: 4_000,
            low_bytes: 30 * 1024 * 1024,
            high_bytes: 40 * 1024 * 1024,
            block_size: 64 * 1024,
            access_slots: 4,
            bulkstatus_enabled: true,
            bulkstatus_threshold: 2,
            bulkstatus_max: 15,
            parent_tracking: 256,
            cleaner_interval_secs: 30,
            prealloc_delay_ms: 1,
        }
    }
}

impl CacheConfig {
    pub fn cleaner_interval(&self) -> Duration {
        Duration::from_secs(self.cleaner_interval_secs)
    }

    pub fn prealloc_delay(&self) -> Duration {
        Duration::from_millis(self.prealloc_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| {
            Err(CacheError::InvalidConfig {
                msg: msg.to_string(),
            })
        };
        if self.high_nodes == 0 || self.high_nodes > MAX_NODES {
            return invalid("high_nodes must be between 1 and 65536");
        }
        if self.low_nodes >= self.high_nodes {
            return invalid("low_nodes must be below high_nodes");
        }
        if self.low_bytes >= self.high_bytes {
            return invalid("low_bytes must be below high_bytes");
        }
        if self.block_size == 0 {
            return invalid("block_size must be non-zero");
        }
        if self.access_slots == 0 {
            return invalid("access_slots must be non-zero");
        }
        if self.bulkstatus_enabled && self.bulkstatus_max < 2 {
            return invalid("bulkstatus_max must leave room for siblings");
        }
        Ok(())
    }
}

/// Everything the daemon reads from its config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub cache: CacheConfig,
    pub rpc: RpcConfig,
    /// Cell the daemon considers home.
    pub this_cell: i32,
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: DaemonConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.cache.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_is_valid() {
        CacheConfig::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_inverted_node_marks() {
        let config = CacheConfig {
            low_nodes: 10,
            high_nodes: 10,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(CacheError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_rejects_inverted_byte_marks() {
        let config = CacheConfig {
            low_bytes: 100,
            high_bytes: 50,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_too_many_nodes() {
        let config = CacheConfig {
            high_nodes: MAX_NODES + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = CacheConfig {
            low_nodes: 1,
            high_nodes: MAX_NODES,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_block_and_slots() {
        let config = CacheConfig {
            block_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = CacheConfig {
            access_slots: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
this_cell = 3

[cache]
cache_dir = "/tmp/afscm"
low_nodes = 10
high_nodes = 20

[rpc]
fs_port = 7100
"#
        )
        .unwrap();

        let config = DaemonConfig::from_file(file.path()).unwrap();
        assert_eq!(config.this_cell, 3);
        assert_eq!(config.cache.cache_dir, PathBuf::from("/tmp/afscm"));
        assert_eq!(config.cache.high_nodes, 20);
        assert_eq!(config.cache.block_size, 64 * 1024);
        assert_eq!(config.rpc.fs_port, 7100);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{"cache": {{"low_bytes": 1024, "high_bytes": 4096}}}}"#
        )
        .unwrap();
        let config = DaemonConfig::from_file(file.path()).unwrap();
        assert_eq!(config.cache.high_bytes, 4096);
    }

    #[test]
    fn test_from_file_rejects_invalid_values() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(file, r#"{{"cache": {{"block_size": 0}}}}"#).unwrap();
        assert!(DaemonConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_from_file_unknown_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(DaemonConfig::from_file(file.path()).is_err());
    }
}
