//! Fragment collector: one fragment's full collection lifecycle.
//!
//! ```text
//! IDLE -> LOCKING -> PULLING -> FINALIZING -> DONE
//!            |                      |
//!            +-------> FAILED <-----+
//! ```
//!
//! The destructive clear, every row append and the final flag update each happen under the
//! fragment lock; the lock is released between them so other lock users are never blocked for a
//! whole stream. A stream that breaks mid-way still finalizes with the rows that arrived: there
//! is no rollback. `collect` never returns an error; every failure is logged and reported in the
//! [`CollectReport`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::CuratorConfig;
use crate::error::CuratorResult;
use crate::keys::FragmentKeys;
use crate::lock::{FragmentLock, LockManager};
use crate::metrics;
use crate::plugin::PluginSet;
use crate::query::{QueryClient, RowStream};
use crate::sink::{notify_completion, SinkMap, SinkRegistry};
use crate::storage::{FragmentStore, KvStore, KvValue, Row};

const PROGRESS_LOG_BYTES: usize = 10_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollectState {
    Idle,
    Locking,
    Pulling,
    Finalizing,
    Done,
    Failed,
}

#[derive(Debug)]
pub struct CollectReport {
    pub fid: String,
    pub state: CollectState,
    pub rows_appended: usize,
    pub row_failures: usize,
    /// Set when the row stream broke before its end.
    pub stream_error: Option<String>,
    /// Freshness granted to the fragment; `None` in on-demand mode or when not finalized.
    pub sync_ttl: Option<Duration>,
    pub on_demand: bool,
    pub notified: usize,
    /// The executor had no plan, so the fragment was removed instead of collected.
    pub removed: bool,
    /// State the run was in when it failed.
    pub failed_from: Option<CollectState>,
    pub error: Option<String>,
    pub elapsed: Duration,
}

impl CollectReport {
    fn new(fid: &str) -> Self {
        Self {
            fid: fid.to_string(),
            state: CollectState::Idle,
            rows_appended: 0,
            row_failures: 0,
            stream_error: None,
            sync_ttl: None,
            on_demand: false,
            notified: 0,
            removed: false,
            failed_from: None,
            error: None,
            elapsed: Duration::ZERO,
        }
    }

    fn enter(&mut self, next: CollectState) {
        debug!(target: "collector", fid = %self.fid, "{:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn fail(mut self, started: Instant, error: String) -> Self {
        warn!(target: "collector", fid = %self.fid, "collection failed in {:?}: {}", self.state, error);
        self.failed_from = Some(self.state);
        self.enter(CollectState::Failed);
        self.error = Some(error);
        self.elapsed = started.elapsed();
        metrics::inc_collections_failed();
        self
    }
}

/// Collection tunables taken from [`CuratorConfig`].
#[derive(Clone, Debug)]
pub struct CollectorSettings {
    pub min_sync: Duration,
    pub rows_per_lock: usize,
    pub throttling: Option<Duration>,
    pub on_demand_threshold: Option<Duration>,
    pub requests_refresh_every: usize,
}

impl From<&CuratorConfig> for CollectorSettings {
    fn from(c: &CuratorConfig) -> Self {
        Self {
            min_sync: c.min_sync(),
            rows_per_lock: c.rows_per_lock.max(1),
            throttling: c.throttling_time(),
            on_demand_threshold: c.on_demand_threshold_secs.filter(|s| *s > 0.0).map(Duration::from_secs_f64),
            requests_refresh_every: c.requests_refresh_every,
        }
    }
}

/// Sinks of one run. A request dropped by a failing plugin stays out of every later reload.
struct RunSinks {
    map: SinkMap,
    dropped: BTreeSet<String>,
}

impl RunSinks {
    fn load(registry: &SinkRegistry, fid: &str) -> Self {
        Self { map: registry.load(fid), dropped: BTreeSet::new() }
    }

    /// Reload when the fragment's request set no longer matches what this run has seen.
    fn refresh(&mut self, registry: &SinkRegistry, fid: &str) {
        if registry.request_count(fid) == self.map.len() + self.dropped.len() {
            return;
        }
        self.map = registry.load(fid);
        self.map.retain(|rid, _| !self.dropped.contains(rid));
    }
}

/// Pick a sync TTL uniformly from `[min_sync, 2 * min_sync]` (millisecond resolution).
pub fn jittered_sync_ttl<R: Rng>(min_sync: Duration, rng: &mut R) -> Duration {
    let lo = min_sync.as_millis() as u64;
    Duration::from_millis(rng.gen_range(lo..=lo.saturating_mul(2)))
}

pub struct FragmentCollector {
    kv: KvStore,
    keys: FragmentKeys,
    locks: LockManager,
    store: Arc<dyn FragmentStore>,
    sinks: SinkRegistry,
    query: Arc<dyn QueryClient>,
    plugins: PluginSet,
    settings: CollectorSettings,
}

impl FragmentCollector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kv: KvStore,
        keys: FragmentKeys,
        locks: LockManager,
        store: Arc<dyn FragmentStore>,
        sinks: SinkRegistry,
        query: Arc<dyn QueryClient>,
        plugins: PluginSet,
        settings: CollectorSettings,
    ) -> Self {
        Self { kv, keys, locks, store, sinks, query, plugins, settings }
    }

    pub fn settings(&self) -> &CollectorSettings { &self.settings }

    /// Run one full collection of `fid`. Blocks on locks, the row stream and store calls.
    pub fn collect(&self, fid: &str) -> CollectReport {
        let started = Instant::now();
        let mut report = CollectReport::new(fid);
        metrics::inc_collections_started();

        // IDLE -> LOCKING: nothing is mutated until the executor answers
        report.enter(CollectState::Locking);
        let tps: Vec<String> = self.kv.smembers(&self.keys.graph_pattern(fid)).into_iter().collect();
        let mut sinks = RunSinks::load(&self.sinks, fid);
        info!(
            target: "collector",
            "Starting collection of fragment {}: gp={:?}, supporting ({}) {:?}",
            fid, tps, sinks.map.len(), sinks.map.keys().collect::<Vec<_>>()
        );
        let (meta, stream) = match self.query.open(&tps) {
            Ok(opened) => opened,
            Err(e) => return report.fail(started, e.to_string()),
        };

        if !meta.plan {
            info!(target: "collector", "There is no search plan for fragment {}. Removing...", fid);
            report.notified = notify_completion(fid, &sinks.map);
            self.plugins.complete(fid, &sinks.map);
            if let Err(e) = self.remove_fragment(fid) {
                return report.fail(started, e.to_string());
            }
            report.removed = true;
            report.enter(CollectState::Done);
            report.elapsed = started.elapsed();
            metrics::inc_collections_completed();
            return report;
        }

        let lock = self.locks.lock(fid);
        match lock.acquire() {
            Ok(guard) => {
                self.kv.set(self.keys.pulling(fid), KvValue::Int(1), None);
                let cleared = self.store.clear(fid);
                guard.release();
                if let Err(e) = cleared {
                    self.kv.delete(&self.keys.pulling(fid));
                    return report.fail(started, format!("cannot clear rows: {}", e));
                }
            }
            Err(e) => return report.fail(started, e.to_string()),
        }

        // LOCKING -> PULLING
        report.enter(CollectState::Pulling);
        info!(target: "collector", "Collecting fragment {}...", fid);
        let weight = self.pull(fid, &lock, stream, &mut sinks, &mut report);
        let elapsed = started.elapsed();
        info!(
            target: "collector",
            "{} rows retrieved for fragment {} in {:.3} s [{} kB]",
            report.rows_appended, fid, elapsed.as_secs_f64(), weight as f64 / 1000.0
        );

        // PULLING -> FINALIZING
        report.enter(CollectState::Finalizing);
        let guard = match lock.acquire() {
            Ok(g) => g,
            Err(e) => {
                // leave the fragment unsynced so a later tick retries it
                self.kv.delete(&self.keys.pulling(fid));
                return report.fail(started, e.to_string());
            }
        };
        self.finalize(fid, elapsed, &mut report);
        sinks.refresh(&self.sinks, fid);
        guard.release();

        // FINALIZING -> DONE
        report.notified = notify_completion(fid, &sinks.map);
        self.plugins.complete(fid, &sinks.map);
        report.enter(CollectState::Done);
        report.elapsed = started.elapsed();
        metrics::inc_collections_completed();
        info!(target: "collector", "Fragment {} collection is complete!", fid);
        report
    }

    /// Stream rows into the store. Returns the collected weight in bytes.
    fn pull(&self, fid: &str, lock: &FragmentLock, stream: RowStream, sinks: &mut RunSinks, report: &mut CollectReport) -> usize {
        let mut batch: Vec<Row> = Vec::with_capacity(self.settings.rows_per_lock);
        let mut weight = 0usize;
        let mut delta = 0usize;
        let mut seen = 0usize;

        for item in stream {
            let row_started = Instant::now();
            let row = match item {
                Ok(row) => row,
                Err(e) => {
                    warn!(target: "collector", fid = %fid, "row stream broke after {} rows: {}", seen, e);
                    report.stream_error = Some(e.to_string());
                    break;
                }
            };
            seen += 1;
            let w = serde_json::to_string(&row).map(|s| s.len()).unwrap_or(0);
            weight += w;
            delta += w;
            batch.push(row);
            if batch.len() >= self.settings.rows_per_lock {
                self.flush(fid, lock, &mut batch, sinks, report);
            }

            if delta > PROGRESS_LOG_BYTES {
                delta = 0;
                info!(target: "collector", "Pulling fragment {} [{} kB]", fid, weight as f64 / 1000.0);
            }

            let every = self.settings.requests_refresh_every;
            if every > 0 && seen % every == 0 {
                sinks.refresh(&self.sinks, fid);
            }

            if let Some(min_row_time) = self.settings.throttling {
                let spent = row_started.elapsed();
                if spent < min_row_time { std::thread::sleep(min_row_time - spent); }
            }
        }
        self.flush(fid, lock, &mut batch, sinks, report);
        weight
    }

    /// Append a batch of rows under one lock acquisition. Single-row failures are logged and skipped.
    fn flush(&self, fid: &str, lock: &FragmentLock, batch: &mut Vec<Row>, sinks: &mut RunSinks, report: &mut CollectReport) {
        if batch.is_empty() { return; }
        let rows = std::mem::take(batch);
        let guard = match lock.acquire() {
            Ok(g) => g,
            Err(e) => {
                warn!(target: "collector", fid = %fid, "skipping {} rows: {}", rows.len(), e);
                report.row_failures += rows.len();
                for _ in 0..rows.len() { metrics::inc_row_failures(); }
                return;
            }
        };
        let mut stored: Vec<Row> = Vec::with_capacity(rows.len());
        for row in rows {
            match self.store.append(fid, &row) {
                Ok(()) => {
                    report.rows_appended += 1;
                    metrics::inc_rows_appended();
                    stored.push(row);
                }
                Err(e) => {
                    warn!(target: "collector", fid = %fid, "cannot store row: {}", e);
                    report.row_failures += 1;
                    metrics::inc_row_failures();
                }
            }
        }
        guard.release();
        if !self.plugins.is_empty() {
            for row in &stored {
                sinks.dropped.extend(self.plugins.consume_row(fid, row, &mut sinks.map));
            }
        }
    }

    /// Mark the fragment synced with a jittered TTL (or on-demand), stamp `updated`, drop `pulling`.
    /// Caller holds the fragment lock.
    fn finalize(&self, fid: &str, elapsed: Duration, report: &mut CollectReport) {
        let mut rng = rand::thread_rng();
        let on_demand = match self.settings.on_demand_threshold {
            Some(th) => elapsed < th && elapsed.as_secs_f64() * rng.gen::<f64>() < th.as_secs_f64() / 4.0,
            None => false,
        };
        let ttl = if on_demand { None } else { Some(jittered_sync_ttl(self.settings.min_sync, &mut rng)) };
        let now = Utc::now();
        let synced_until = ttl
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| (now + d).to_rfc3339())
            .unwrap_or_else(|| "on_demand".to_string());

        self.kv.transaction(|t| {
            t.set(self.keys.sync(fid), KvValue::Str(synced_until.clone()), ttl);
            if on_demand {
                t.set(self.keys.on_demand(fid), KvValue::Int(1), None);
            } else {
                t.delete(&self.keys.on_demand(fid));
            }
            t.set(self.keys.updated(fid), KvValue::Str(now.to_rfc3339()), None);
            t.delete(&self.keys.pulling(fid));
        });

        match ttl {
            Some(d) => info!(target: "collector", "Fragment {} is considered synced for {:.3} s (until {})", fid, d.as_secs_f64(), synced_until),
            None => info!(target: "collector", "Fragment {} has been switched to on-demand mode", fid),
        }
        report.sync_ttl = ttl;
        report.on_demand = on_demand;
    }

    /// Remove a fragment entirely after notifying its known requests.
    ///
    /// Deletes every per-fragment key (the lock key included), its rows, and its registry entry.
    /// Returns the number of shared-store keys removed.
    pub fn remove_fragment(&self, fid: &str) -> CuratorResult<usize> {
        let lock = self.locks.lock(fid);
        debug!(target: "collector", "Waiting to remove fragment {} on {}...", fid, lock.key());
        let guard = lock.acquire()?;

        let sinks = self.sinks.load(fid);
        notify_completion(fid, &sinks);
        self.plugins.complete(fid, &sinks);

        let prefix = format!("{}:", self.keys.fragment(fid));
        let removed = self.kv.transaction(|t| {
            let ks = t.keys_matching(&prefix, "");
            let n = ks.iter().filter(|k| t.delete(k)).count();
            t.srem(self.keys.registry(), fid);
            n
        });
        if let Err(e) = self.store.clear(fid) {
            warn!(target: "collector", fid = %fid, "cannot drop rows of removed fragment: {}", e);
        }
        // the lock key went away with the rest of the fragment
        guard.disarm();
        metrics::inc_fragments_removed();
        info!(target: "collector", "Fragment {} has been removed", fid);
        Ok(removed)
    }
}

#[cfg(test)]
#[path = "collector_tests.rs"]
mod collector_tests;
