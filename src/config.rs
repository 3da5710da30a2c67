//! Curator configuration.
//!
//! Defaults mirror the settings the fragment daemon has always shipped with; every field can be
//! overridden from the environment with a `CURATOR_` prefixed variable (see [`CuratorConfig::from_env`]).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CuratorError, CuratorResult};

/// Hard cap on the collection worker pool regardless of `max_concurrent_fragments`.
pub const MAX_COLLECTION_WORKERS: usize = 8;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self { Self { host: host.into(), port } }
    pub fn base_url(&self) -> String { format!("http://{}:{}", self.host, self.port) }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CuratorConfig {
    /// Namespace for every shared-store key this coordinator touches.
    pub agent_id: String,
    /// Scheduler polling interval in milliseconds.
    pub tick_ms: u64,
    /// Lower bound of the sync TTL in seconds; the upper bound is twice this value.
    pub min_sync_secs: u64,
    pub max_concurrent_fragments: usize,
    /// Worker hint forwarded to the fragment generator.
    pub collectors: usize,
    /// Row rate cap in rows per millisecond; 0 disables throttling.
    pub collect_throttling: u64,
    /// Rows appended per lock acquisition while pulling.
    pub rows_per_lock: usize,
    /// None blocks forever on a held lock.
    pub lock_timeout_ms: Option<u64>,
    pub lock_poll_ms: u64,
    /// Optional expiry on the lock key itself so a crashed holder cannot wedge a fragment.
    pub lock_lease_ms: Option<u64>,
    /// Enables on-demand mode for fragments collected faster than this many seconds.
    pub on_demand_threshold_secs: Option<f64>,
    pub requests_refresh_every: usize,
    pub agora: Endpoint,
    pub provider: Endpoint,
    pub data_dir: String,
    pub kv_snapshot_interval_ms: Option<u64>,
}

impl Default for CuratorConfig {
    fn default() -> Self {
        Self {
            agent_id: "curator".to_string(),
            tick_ms: 1_000,
            min_sync_secs: 10,
            max_concurrent_fragments: 8,
            collectors: 1,
            collect_throttling: 30,
            rows_per_lock: 1,
            lock_timeout_ms: None,
            lock_poll_ms: 100,
            lock_lease_ms: None,
            on_demand_threshold_secs: None,
            requests_refresh_every: 100,
            agora: Endpoint::new("localhost", 9002),
            provider: Endpoint::new("localhost", 5007),
            data_dir: "curator-data".to_string(),
            kv_snapshot_interval_ms: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse::<T>().ok())
}

impl CuratorConfig {
    /// Defaults overridden by `CURATOR_*` environment variables. Unparseable values are ignored.
    pub fn from_env() -> CuratorResult<Self> {
        let mut c = Self::default();
        if let Ok(v) = std::env::var("CURATOR_AGENT_ID") { c.agent_id = v; }
        if let Some(v) = env_parse("CURATOR_TICK_MS") { c.tick_ms = v; }
        if let Some(v) = env_parse("CURATOR_MIN_SYNC_SECS") { c.min_sync_secs = v; }
        if let Some(v) = env_parse("CURATOR_MAX_CONCURRENT_FRAGMENTS") { c.max_concurrent_fragments = v; }
        if let Some(v) = env_parse("CURATOR_COLLECTORS") { c.collectors = v; }
        if let Some(v) = env_parse("CURATOR_COLLECT_THROTTLING") { c.collect_throttling = v; }
        if let Some(v) = env_parse("CURATOR_ROWS_PER_LOCK") { c.rows_per_lock = v; }
        if let Some(v) = env_parse("CURATOR_LOCK_TIMEOUT_MS") { c.lock_timeout_ms = Some(v); }
        if let Some(v) = env_parse("CURATOR_LOCK_POLL_MS") { c.lock_poll_ms = v; }
        if let Some(v) = env_parse("CURATOR_LOCK_LEASE_MS") { c.lock_lease_ms = Some(v); }
        if let Some(v) = env_parse("CURATOR_ON_DEMAND_THRESHOLD_SECS") { c.on_demand_threshold_secs = Some(v); }
        if let Some(v) = env_parse("CURATOR_REQUESTS_REFRESH_EVERY") { c.requests_refresh_every = v; }
        if let Ok(v) = std::env::var("CURATOR_AGORA_HOST") { c.agora.host = v; }
        if let Some(v) = env_parse("CURATOR_AGORA_PORT") { c.agora.port = v; }
        if let Ok(v) = std::env::var("CURATOR_PROVIDER_HOST") { c.provider.host = v; }
        if let Some(v) = env_parse("CURATOR_PROVIDER_PORT") { c.provider.port = v; }
        if let Ok(v) = std::env::var("CURATOR_DATA_DIR") { c.data_dir = v; }
        if let Some(v) = env_parse("CURATOR_KV_SNAPSHOT_INTERVAL_MS") { c.kv_snapshot_interval_ms = Some(v); }
        c.validate()?;
        Ok(c)
    }

    pub fn validate(&self) -> CuratorResult<()> {
        if self.agent_id.is_empty() { return Err(CuratorError::config("agent_id must not be empty")); }
        if self.tick_ms == 0 { return Err(CuratorError::config("tick_ms must be > 0")); }
        if self.min_sync_secs == 0 { return Err(CuratorError::config("min_sync_secs must be > 0")); }
        if self.max_concurrent_fragments == 0 { return Err(CuratorError::config("max_concurrent_fragments must be > 0")); }
        if self.rows_per_lock == 0 { return Err(CuratorError::config("rows_per_lock must be > 0")); }
        if self.lock_poll_ms == 0 { return Err(CuratorError::config("lock_poll_ms must be > 0")); }
        Ok(())
    }

    pub fn tick(&self) -> Duration { Duration::from_millis(self.tick_ms) }
    pub fn min_sync(&self) -> Duration { Duration::from_secs(self.min_sync_secs) }
    pub fn lock_timeout(&self) -> Option<Duration> { self.lock_timeout_ms.map(Duration::from_millis) }
    pub fn lock_poll(&self) -> Duration { Duration::from_millis(self.lock_poll_ms) }
    pub fn lock_lease(&self) -> Option<Duration> { self.lock_lease_ms.map(Duration::from_millis) }

    /// Size of the collection worker pool.
    pub fn pool_size(&self) -> usize { self.max_concurrent_fragments.clamp(1, MAX_COLLECTION_WORKERS) }

    /// Minimum wall time spent per collected row, if throttling is enabled.
    pub fn throttling_time(&self) -> Option<Duration> {
        if self.collect_throttling == 0 { return None; }
        Some(Duration::from_secs_f64(1.0 / (self.collect_throttling as f64 * 1000.0)))
    }
}
