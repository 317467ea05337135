//! The engine's background tasks and their shared shutdown signal.

use crate::cleaner::Cleaner;
use crate::error::Result;
use crate::fcache::FileCache;
use crate::invalidator::Invalidator;
use crate::prealloc::Preallocator;
use afscm_rpc::Prober;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{info, warn};

pub struct BackgroundTasks {
    shutdown: watch::Sender<bool>,
    cleaner: Option<JoinHandle<Result<()>>>,
    invalidator: JoinHandle<()>,
    prealloc: JoinHandle<usize>,
    prober: JoinHandle<()>,
}

impl FileCache {
    /// Spawns the cleaner, the invalidator, the cache file preallocator and
    /// the connection prober.
    pub fn start(self: &Arc<Self>) -> BackgroundTasks {
        let (shutdown, rx) = watch::channel(false);
        let tasks = BackgroundTasks {
            cleaner: Some(Cleaner::new(Arc::clone(self)).spawn(rx.clone())),
            invalidator: Invalidator::new(Arc::clone(self)).spawn(rx.clone()),
            prealloc: Preallocator::new(Arc::clone(self)).spawn(rx.clone()),
            prober: Prober::new(Arc::clone(&self.conns)).spawn(rx),
            shutdown,
        };
        info!("background tasks started");
        tasks
    }
}

impl BackgroundTasks {
    /// Resolves when the cleaner stops on its own, which only happens on an
    /// accounting violation.
    pub async fn cleaner_exit(&mut self) -> Result<()> {
        let Some(handle) = self.cleaner.as_mut() else {
            return std::future::pending::<Result<()>>().await;
        };
        let res = handle.await;
        self.cleaner = None;
        joined("cleaner", res).unwrap_or(Ok(()))
    }

    /// Signals every task and waits for them.
    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        let cleaner = match self.cleaner {
            Some(handle) => joined("cleaner", handle.await).unwrap_or(Ok(())),
            None => Ok(()),
        };
        joined("invalidator", self.invalidator.await);
        joined("preallocator", self.prealloc.await);
        joined("prober", self.prober.await);
        info!("background tasks stopped");
        cleaner
    }
}

fn joined<T>(name: &str, res: std::result::Result<T, JoinError>) -> Option<T> {
    match res {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("{} task failed: {}", name, e);
            None
        }
    }
}
