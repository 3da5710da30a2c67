//! The coordinator owns one agent's collaborators: the shared store, the fragment lock manager,
//! the row store and the collector built over them. It is constructed once per process and
//! hands out the [`Scheduler`] that drives collections.
//!
//! Fragment and request registration normally belongs to request-handling code; the helpers
//! here write the same shared-store sets that code would.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::collector::{CollectorSettings, FragmentCollector};
use crate::config::CuratorConfig;
use crate::error::CuratorResult;
use crate::keys::FragmentKeys;
use crate::lock::LockManager;
use crate::plugin::PluginSet;
use crate::query::QueryClient;
use crate::scheduler::Scheduler;
use crate::sink::{DeliveryBackend, SinkRegistry};
use crate::storage::{FragmentStore, KvStore, Row};

pub struct Coordinator {
    config: CuratorConfig,
    kv: KvStore,
    keys: FragmentKeys,
    locks: LockManager,
    store: Arc<dyn FragmentStore>,
    collector: Arc<FragmentCollector>,
}

impl Coordinator {
    pub fn new(
        config: CuratorConfig,
        kv: KvStore,
        store: Arc<dyn FragmentStore>,
        query: Arc<dyn QueryClient>,
        delivery: Arc<dyn DeliveryBackend>,
        plugins: PluginSet,
    ) -> CuratorResult<Self> {
        config.validate()?;
        let keys = FragmentKeys::new(&config.agent_id);
        let locks = LockManager::new(kv.clone(), keys.clone())
            .with_poll(config.lock_poll())
            .with_timeout(config.lock_timeout())
            .with_lease(config.lock_lease());
        let sinks = SinkRegistry::new(kv.clone(), keys.clone(), delivery);
        let collector = FragmentCollector::new(
            kv.clone(),
            keys.clone(),
            locks.clone(),
            store.clone(),
            sinks,
            query,
            plugins,
            CollectorSettings::from(&config),
        );
        Ok(Self { config, kv, keys, locks, store, collector: Arc::new(collector) })
    }

    pub fn config(&self) -> &CuratorConfig { &self.config }
    pub fn kv(&self) -> &KvStore { &self.kv }
    pub fn keys(&self) -> &FragmentKeys { &self.keys }
    pub fn collector(&self) -> &Arc<FragmentCollector> { &self.collector }

    /// Scheduler over this coordinator's collector. Call [`Scheduler::startup`] before running it.
    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.kv.clone(),
            self.keys.clone(),
            self.locks.clone(),
            self.collector.clone(),
            self.config.tick(),
            self.config.pool_size(),
        )
    }

    /// Register `fid` with its triple patterns. Returns false if it was already registered.
    pub fn register_fragment(&self, fid: &str, graph_pattern: &[String]) -> bool {
        let added = self.kv.transaction(|t| {
            t.sadd(&self.keys.graph_pattern(fid), graph_pattern.iter().map(String::as_str));
            t.sadd(self.keys.registry(), [fid]) == 1
        });
        if added {
            info!(target: "coordinator", fid = %fid, "Registered fragment with {} triple patterns", graph_pattern.len());
        }
        added
    }

    pub fn fragment_ids(&self) -> BTreeSet<String> { self.kv.smembers(self.keys.registry()) }

    pub fn graph_pattern(&self, fid: &str) -> BTreeSet<String> { self.kv.smembers(&self.keys.graph_pattern(fid)) }

    pub fn add_request(&self, fid: &str, rid: &str) -> bool {
        self.kv.sadd(&self.keys.requests(fid), [rid]) == 1
    }

    pub fn remove_request(&self, fid: &str, rid: &str) -> bool {
        self.kv.srem(&self.keys.requests(fid), rid)
    }

    pub fn requests(&self, fid: &str) -> BTreeSet<String> { self.kv.smembers(&self.keys.requests(fid)) }

    /// Notify the fragment's requests and delete all of its state. Blocks on the fragment lock.
    pub fn remove_fragment(&self, fid: &str) -> CuratorResult<usize> {
        self.collector.remove_fragment(fid)
    }

    /// Time of the last completed collection.
    pub fn updated_on(&self, fid: &str) -> Option<DateTime<Utc>> {
        self.kv
            .get_str(&self.keys.updated(fid))
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|d| d.with_timezone(&Utc))
    }

    pub fn is_pulling(&self, fid: &str) -> bool { self.kv.exists(&self.keys.pulling(fid)) }

    /// True once the fragment has completed at least one collection.
    pub fn is_synced(&self, fid: &str) -> bool { self.kv.exists(&self.keys.updated(fid)) }

    /// True while the last collection's freshness window is open.
    pub fn is_fresh(&self, fid: &str) -> bool { self.kv.exists(&self.keys.sync(fid)) }

    pub fn on_demand(&self, fid: &str) -> bool { self.kv.exists(&self.keys.on_demand(fid)) }

    /// Stored rows of `fid`. Partial while a collection is pulling.
    pub fn rows(&self, fid: &str) -> CuratorResult<Vec<Row>> { self.store.rows(fid) }
}
