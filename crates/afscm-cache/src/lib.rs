#![warn(missing_docs)]

//! afscm file cache: entry table, callback consistency, budget cleaner, cache manager daemon

pub mod access;
pub mod attr;
pub mod cleaner;
pub mod cli;
pub mod config;
pub mod dirlist;
pub mod entry;
pub mod error;
pub mod fcache;
pub mod health;
pub mod heap;
pub mod invalidator;
pub mod notify;
pub mod offline;
pub mod persist;
pub mod prealloc;
pub mod status;
pub mod store;
pub mod table;
pub mod tasks;

pub use attr::{CachedAttr, InstallView};
pub use cleaner::{CleanReport, Cleaner};
pub use config::{CacheConfig, DaemonConfig};
pub use dirlist::{DirectoryLister, NoListing};
pub use entry::{EntryFlags, EntryState, JournalChain, SlotId};
pub use error::{CacheError, Result};
pub use fcache::{parse_mountpoint, CacheStats, EntryGuard, FileCache, Limits, MountTarget};
pub use health::{ComponentHealth, HealthReport, HealthStatus};
pub use invalidator::Invalidator;
pub use notify::{ChannelNotifier, KernelNotifier, NullNotifier};
pub use prealloc::Preallocator;
pub use status::{CacheStatus, EntrySummary};
pub use tasks::BackgroundTasks;
