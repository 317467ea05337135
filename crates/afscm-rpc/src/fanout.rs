//! Replica fanout.
//!
//! A [`FanoutContext`] orders the servers of one volume by synthetic RTT and
//! walks them as call outcomes are reported through [`FanoutContext::advance`].
//! Every RPC site either drives `advance` itself or goes through the generic
//! [`FanoutContext::call`] loop.

use crate::conn::{ConnHandle, ConnectionCache};
use crate::error::{ErrorClass, Result, RpcError};
use crate::server::{FileServer, Probe, Service, TimeProbe};
use crate::types::Credential;
use crate::volume::{Replica, VolumeLocator};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// One server able to serve the volume.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub handle: ConnHandle,
    pub replica: Replica,
    pub rtt_us: u64,
}

/// What happened on the current candidate.
#[derive(Debug)]
pub enum Outcome<'a> {
    Success(Duration),
    Failed(&'a RpcError),
}

/// What the caller should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The call succeeded.
    Done,
    /// Call again on [`FanoutContext::current`].
    Retry,
    /// Give the error to the caller as is.
    Surface,
    /// No candidate left.
    Exhausted,
}

pub struct FanoutContext {
    conns: Arc<ConnectionCache>,
    locator: Arc<dyn VolumeLocator>,
    probe: Arc<dyn Probe>,
    cell: i32,
    volume: u32,
    credential: Credential,
    candidates: Vec<Candidate>,
    cursor: usize,
    busy_tries: u32,
    rebuilt: bool,
}

impl FanoutContext {
    pub async fn build(
        conns: &Arc<ConnectionCache>,
        locator: Arc<dyn VolumeLocator>,
        cell: i32,
        volume: u32,
        credential: &Credential,
    ) -> Result<Self> {
        let mut ctx = Self {
            conns: Arc::clone(conns),
            locator,
            probe: Arc::new(TimeProbe),
            cell,
            volume,
            credential: credential.clone(),
            candidates: Vec::new(),
            cursor: 0,
            busy_tries: 0,
            rebuilt: false,
        };
        ctx.candidates = ctx.resolve_candidates().await?;
        Ok(ctx)
    }

    async fn resolve_candidates(&self) -> Result<Vec<Candidate>> {
        let entry = self
            .locator
            .resolve(self.cell, self.volume, &self.credential)
            .await?;
        let kind = entry
            .kind_of(self.volume)
            .ok_or(RpcError::NoSuchVolume {
                volume: self.volume,
            })?;
        let config = self.conns.config();

        let mut candidates = Vec::new();
        for idx in entry.replicas_for(kind) {
            let replica = entry.replicas[idx].clone();
            let handle = match self.conns.acquire(
                self.cell,
                replica.addr,
                config.fs_port,
                Service::FileServer,
                Arc::clone(&self.probe),
                &self.credential,
            ) {
                Ok(handle) => handle,
                Err(e) => {
                    warn!("cannot connect to {}: {}", replica.addr, e);
                    continue;
                }
            };
            let mut rtt_us = self.conns.rtt_us(&handle);
            if config.rtt_jitter_us > 0 {
                rtt_us += rand::thread_rng().gen_range(0..config.rtt_jitter_us);
            }
            if !handle.is_alive() {
                rtt_us = rtt_us.saturating_add(config.dead_penalty_us);
            }
            if replica.flags.unreliable {
                rtt_us = rtt_us.saturating_add(config.unreliable_penalty_us);
            }
            candidates.push(Candidate {
                handle,
                replica,
                rtt_us,
            });
        }

        if candidates.is_empty() {
            return Err(RpcError::NoReplicas {
                cell: self.cell,
                volume: self.volume,
            });
        }
        candidates.sort_by_key(|c| c.rtt_us);
        trace!(
            "volume {} candidates: {:?}",
            self.volume,
            candidates
                .iter()
                .map(|c| (c.replica.addr, c.rtt_us))
                .collect::<Vec<_>>()
        );
        Ok(candidates)
    }

    pub fn current(&self) -> Option<&Candidate> {
        self.candidates.get(self.cursor)
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn volume(&self) -> u32 {
        self.volume
    }

    fn next(&mut self) -> Step {
        self.cursor += 1;
        self.busy_tries = 0;
        if self.cursor < self.candidates.len() {
            Step::Retry
        } else {
            Step::Exhausted
        }
    }

    /// Reports the outcome of a call on the current candidate. Fails only if
    /// the location refresh after a stale-location error fails.
    pub async fn advance(&mut self, outcome: Outcome<'_>) -> Result<Step> {
        let Some(current) = self.candidates.get(self.cursor) else {
            return Ok(Step::Exhausted);
        };

        let err = match outcome {
            Outcome::Success(rtt) => {
                self.conns.mark_alive(&current.handle);
                self.conns.record_rtt(&current.handle, rtt);
                self.locator
                    .mark_replica_up(self.cell, self.volume, &current.replica);
                return Ok(Step::Done);
            }
            Outcome::Failed(err) => err,
        };

        let class = err.class();
        match class {
            ErrorClass::Transient => {
                warn!(
                    "{} failed for volume {}: {}",
                    current.replica.addr, self.volume, err
                );
                self.conns.mark_dead(&current.handle);
                Ok(self.next())
            }
            ErrorClass::StaleLocation => {
                self.locator
                    .mark_replica_down(self.cell, self.volume, &current.replica, class);
                if self.rebuilt {
                    return Ok(self.next());
                }
                self.rebuilt = true;
                debug!("refreshing location of volume {}: {}", self.volume, err);
                self.locator.invalidate(self.cell, self.volume);
                self.candidates = self.resolve_candidates().await?;
                self.cursor = 0;
                self.busy_tries = 0;
                Ok(Step::Retry)
            }
            ErrorClass::VolumeScope => {
                debug!(
                    "{} cannot serve volume {}: {}",
                    current.replica.addr, self.volume, err
                );
                self.locator
                    .mark_replica_down(self.cell, self.volume, &current.replica, class);
                Ok(self.next())
            }
            ErrorClass::Busy => {
                let config = self.conns.config();
                if self.busy_tries >= config.busy_retries {
                    debug!("{} still busy, giving up", current.replica.addr);
                    return Ok(Step::Surface);
                }
                self.busy_tries += 1;
                let delay = config.busy_retry_delay();
                debug!(
                    "{} busy, retry {} in {:?}",
                    current.replica.addr, self.busy_tries, delay
                );
                tokio::time::sleep(delay).await;
                Ok(Step::Retry)
            }
            ErrorClass::Semantic | ErrorClass::Local => Ok(Step::Surface),
        }
    }

    /// Runs `op` against the candidates until one succeeds, an error has to
    /// be surfaced, or every replica has failed. Returns the value and the
    /// connection that produced it.
    pub async fn call<T, F, Fut>(&mut self, mut op: F) -> Result<(T, ConnHandle)>
    where
        F: FnMut(Arc<dyn FileServer>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        loop {
            let Some(current) = self.current() else {
                return Err(self.exhausted());
            };
            let handle = current.handle.clone();
            let started = Instant::now();
            match op(handle.server()).await {
                Ok(value) => {
                    self.advance(Outcome::Success(started.elapsed())).await?;
                    return Ok((value, handle));
                }
                Err(err) => match self.advance(Outcome::Failed(&err)).await? {
                    Step::Retry => continue,
                    Step::Exhausted => return Err(self.exhausted()),
                    Step::Surface | Step::Done => return Err(err),
                },
            }
        }
    }

    fn exhausted(&self) -> RpcError {
        RpcError::AllReplicasDown {
            cell: self.cell,
            volume: self.volume,
        }
    }
}
