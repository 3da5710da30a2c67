//! Collector scheduler.
//!
//! A single async loop wakes every `tick`, finds registered fragments that are neither fresh
//! nor being pulled, and hands each one to the collection pool. Collections run on blocking
//! threads; at most `pool_size` of them run at once and the rest wait for a permit. The loop
//! only keeps a map of fragment id to job handle, so it never blocks on a collection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::collector::{CollectReport, CollectState, FragmentCollector};
use crate::error::{CuratorError, CuratorResult};
use crate::keys::FragmentKeys;
use crate::lock::LockManager;
use crate::storage::KvStore;

type Job = JoinHandle<CuratorResult<CollectReport>>;

pub struct Scheduler {
    kv: KvStore,
    keys: FragmentKeys,
    locks: LockManager,
    collector: Arc<FragmentCollector>,
    pool: Arc<Semaphore>,
    pool_size: usize,
    tick: Duration,
    in_flight: HashMap<String, Job>,
}

impl Scheduler {
    pub fn new(
        kv: KvStore,
        keys: FragmentKeys,
        locks: LockManager,
        collector: Arc<FragmentCollector>,
        tick: Duration,
        pool_size: usize,
    ) -> Self {
        let pool_size = pool_size.max(1);
        Self {
            kv,
            keys,
            locks,
            collector,
            pool: Arc::new(Semaphore::new(pool_size)),
            pool_size,
            tick,
            in_flight: HashMap::new(),
        }
    }

    /// Log registered vs. fresh fragments and drop locks and pulling flags left by a previous run.
    pub fn startup(&self) -> (usize, usize) {
        let registered = self.kv.smembers(self.keys.registry());
        let synced = registered.iter().filter(|fid| self.kv.exists(&self.keys.sync(fid))).count();
        info!(target: "scheduler", "Fragments: {} registered, {} synced", registered.len(), synced);
        let (locks, pullings) = self.locks.clear_all();
        if locks + pullings > 0 {
            info!(target: "scheduler", "Removed {} stale locks and {} stale pulling flags", locks, pullings);
        }
        (locks, pullings)
    }

    /// Registered fragments with no sync key and no pulling flag.
    pub fn due_fragments(&self) -> Vec<String> {
        self.kv.transaction(|t| {
            t.smembers(self.keys.registry())
                .into_iter()
                .filter(|fid| !t.exists(&self.keys.sync(fid)) && !t.exists(&self.keys.pulling(fid)))
                .collect()
        })
    }

    /// Fragment ids with a tracked job, finished or not.
    pub fn in_flight(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.in_flight.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn pool_size(&self) -> usize { self.pool_size }

    /// One scheduling pass. Returns the number of collections dispatched.
    pub async fn tick(&mut self) -> usize {
        self.reap().await;
        let mut dispatched = 0;
        for fid in self.due_fragments() {
            if self.in_flight.contains_key(&fid) {
                continue;
            }
            debug!(target: "scheduler", fid = %fid, "dispatching collection");
            let job = self.dispatch(fid.clone());
            self.in_flight.insert(fid, job);
            dispatched += 1;
        }
        dispatched
    }

    /// Drive ticks until `shutdown` flips to true, then wait for running collections.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            target: "scheduler",
            "Scheduler running: tick={:?}, pool_size={}", self.tick, self.pool_size
        );
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        let pending = self.in_flight.len();
        if pending > 0 {
            info!(target: "scheduler", "Waiting for {} collections to finish...", pending);
        }
        self.drain().await;
        info!(target: "scheduler", "Scheduler stopped");
    }

    /// Await every tracked job. Collections are never cancelled.
    pub async fn drain(&mut self) -> Vec<CollectReport> {
        let mut reports = Vec::new();
        for (fid, job) in std::mem::take(&mut self.in_flight) {
            if let Some(r) = Self::settle(&fid, job).await {
                reports.push(r);
            }
        }
        reports
    }

    fn dispatch(&self, fid: String) -> Job {
        let pool = self.pool.clone();
        let collector = self.collector.clone();
        tokio::spawn(async move {
            let permit = pool
                .acquire_owned()
                .await
                .map_err(|e| CuratorError::internal(format!("collection pool closed: {}", e)))?;
            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                collector.collect(&fid)
            })
            .await
            .map_err(|e| CuratorError::internal(format!("collection task failed: {}", e)))
        })
    }

    /// Forget finished jobs, logging the ones that failed.
    async fn reap(&mut self) {
        let done: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, job)| job.is_finished())
            .map(|(fid, _)| fid.clone())
            .collect();
        for fid in done {
            if let Some(job) = self.in_flight.remove(&fid) {
                Self::settle(&fid, job).await;
            }
        }
    }

    async fn settle(fid: &str, job: Job) -> Option<CollectReport> {
        match job.await {
            Ok(Ok(report)) => {
                if report.state == CollectState::Failed {
                    warn!(
                        target: "scheduler", fid = %fid,
                        "collection failed: {}", report.error.as_deref().unwrap_or("unknown")
                    );
                } else {
                    debug!(target: "scheduler", fid = %fid, rows = report.rows_appended, "collection finished in {:?}", report.elapsed);
                }
                Some(report)
            }
            Ok(Err(e)) => {
                error!(target: "scheduler", fid = %fid, "collection job lost: {}", e);
                None
            }
            Err(e) => {
                error!(target: "scheduler", fid = %fid, "collection job aborted: {}", e);
                None
            }
        }
    }
}
