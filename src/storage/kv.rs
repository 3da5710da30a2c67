use std::collections::{BTreeSet, HashMap as StdHashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Value variants supported by the in-memory KV store.
#[derive(Clone, Debug, PartialEq)]
pub enum KvValue {
    Str(String),
    Int(i64),
    Json(JsonValue),
    /// Unordered string set (fragment registry, graph patterns, request ids).
    Set(BTreeSet<String>),
}

impl KvValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            KvValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

#[derive(Clone)]
struct Entry {
    value: KvValue,
    /// Optional expiry time
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool { self.expires_at.map(|e| now >= e).unwrap_or(false) }
}

/// Shared key-value store with per-key expiry.
///
/// Every mutation of the coordinator's shared state (locks, sync/pulling flags, registries)
/// goes through this type. Cloning is cheap and all clones see the same map.
#[derive(Clone, Default)]
pub struct KvStore {
    map: Arc<parking_lot::RwLock<StdHashMap<String, Entry>>>,
    snapshot_path: Option<PathBuf>,
    /// Guard to ensure we only spawn one persistence thread
    persist_started: Arc<parking_lot::Mutex<bool>>,
}

/// A batch of operations applied while holding the store's write lock.
///
/// Expired keys are treated as absent and pruned on first touch.
pub struct KvTxn<'a> {
    map: &'a mut StdHashMap<String, Entry>,
    now: Instant,
}

impl<'a> KvTxn<'a> {
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        if self.map.get(key).map(|e| e.expired(self.now)).unwrap_or(false) {
            self.map.remove(key);
            return None;
        }
        self.map.get_mut(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: KvValue, ttl: Option<Duration>) {
        let expires_at = ttl.map(|d| self.now + d);
        self.map.insert(key.into(), Entry { value, expires_at });
    }

    /// Set only if the key is absent (or expired). Returns true if the value was written.
    pub fn set_nx(&mut self, key: impl Into<String>, value: KvValue, ttl: Option<Duration>) -> bool {
        let key = key.into();
        if self.live(&key).is_some() { return false; }
        self.set(key, value, ttl);
        true
    }

    pub fn get(&mut self, key: &str) -> Option<KvValue> { self.live(key).map(|e| e.value.clone()) }

    pub fn exists(&mut self, key: &str) -> bool { self.live(key).is_some() }

    pub fn delete(&mut self, key: &str) -> bool {
        let existed = self.live(key).is_some();
        self.map.remove(key);
        existed
    }

    /// Delete `key` only if it currently holds `expected`.
    pub fn compare_and_delete(&mut self, key: &str, expected: &KvValue) -> bool {
        match self.live(key) {
            Some(e) if &e.value == expected => { self.map.remove(key); true }
            _ => false,
        }
    }

    /// Remaining time to live. `None` if the key is absent or has no expiry.
    pub fn ttl(&mut self, key: &str) -> Option<Duration> {
        let now = self.now;
        self.live(key).and_then(|e| e.expires_at).map(|exp| exp.saturating_duration_since(now))
    }

    /// Add members to a set, creating it if needed. Returns the number of new members.
    pub fn sadd<I, S>(&mut self, key: &str, members: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if !matches!(self.live(key).map(|e| &e.value), Some(KvValue::Set(_))) {
            self.map.insert(key.to_string(), Entry { value: KvValue::Set(BTreeSet::new()), expires_at: None });
        }
        match self.map.get_mut(key).map(|e| &mut e.value) {
            Some(KvValue::Set(set)) => {
                let mut added = 0;
                for m in members {
                    if set.insert(m.into()) { added += 1; }
                }
                added
            }
            _ => 0,
        }
    }

    /// Remove a member from a set; an emptied set is deleted.
    pub fn srem(&mut self, key: &str, member: &str) -> bool {
        let (removed, now_empty) = match self.live(key).map(|e| &mut e.value) {
            Some(KvValue::Set(set)) => (set.remove(member), set.is_empty()),
            _ => return false,
        };
        if now_empty { self.map.remove(key); }
        removed
    }

    pub fn smembers(&mut self, key: &str) -> BTreeSet<String> {
        match self.live(key).map(|e| &e.value) {
            Some(KvValue::Set(set)) => set.clone(),
            _ => BTreeSet::new(),
        }
    }

    pub fn scard(&mut self, key: &str) -> usize {
        match self.live(key).map(|e| &e.value) {
            Some(KvValue::Set(set)) => set.len(),
            _ => 0,
        }
    }

    /// Live keys that start with `prefix` and end with `suffix`.
    pub fn keys_matching(&mut self, prefix: &str, suffix: &str) -> Vec<String> {
        let now = self.now;
        let mut out: Vec<String> = self.map.iter()
            .filter(|(k, e)| !e.expired(now) && k.starts_with(prefix) && k.ends_with(suffix) && k.len() >= prefix.len() + suffix.len())
            .map(|(k, _)| k.clone())
            .collect();
        out.sort();
        out
    }
}

impl KvStore {
    pub fn new() -> Self { Self::default() }

    /// A store that loads `snapshot_path` if present and, when `interval` is set, rewrites it periodically.
    pub fn persistent(snapshot_path: PathBuf, interval: Option<Duration>) -> anyhow::Result<Self> {
        if let Some(parent) = snapshot_path.parent() { std::fs::create_dir_all(parent)?; }
        let s = Self { snapshot_path: Some(snapshot_path), ..Self::default() };
        s.load_snapshot()?;
        if let Some(interval) = interval { s.ensure_persistence_loop(interval); }
        Ok(s)
    }

    /// Run `f` against the store with the write lock held; all of its operations are atomic.
    pub fn transaction<R>(&self, f: impl FnOnce(&mut KvTxn<'_>) -> R) -> R {
        let mut w = self.map.write();
        let mut txn = KvTxn { map: &mut w, now: Instant::now() };
        f(&mut txn)
    }

    pub fn set(&self, key: impl Into<String>, value: KvValue, ttl: Option<Duration>) {
        self.transaction(|t| t.set(key, value, ttl))
    }

    pub fn set_nx(&self, key: impl Into<String>, value: KvValue, ttl: Option<Duration>) -> bool {
        self.transaction(|t| t.set_nx(key, value, ttl))
    }

    /// Get a key. If expired, removes it and returns None.
    pub fn get(&self, key: &str) -> Option<KvValue> {
        {
            let r = self.map.read();
            match r.get(key) {
                None => return None,
                Some(ent) if !ent.expired(Instant::now()) => return Some(ent.value.clone()),
                Some(_) => {}
            }
        }
        self.transaction(|t| t.get(key))
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn exists(&self, key: &str) -> bool { self.get(key).is_some() }
    pub fn delete(&self, key: &str) -> bool { self.transaction(|t| t.delete(key)) }
    pub fn compare_and_delete(&self, key: &str, expected: &KvValue) -> bool { self.transaction(|t| t.compare_and_delete(key, expected)) }
    pub fn ttl(&self, key: &str) -> Option<Duration> { self.transaction(|t| t.ttl(key)) }

    pub fn sadd<I, S>(&self, key: &str, members: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.transaction(|t| t.sadd(key, members))
    }

    pub fn srem(&self, key: &str, member: &str) -> bool { self.transaction(|t| t.srem(key, member)) }
    pub fn smembers(&self, key: &str) -> BTreeSet<String> { self.transaction(|t| t.smembers(key)) }
    pub fn scard(&self, key: &str) -> usize { self.transaction(|t| t.scard(key)) }
    pub fn keys_matching(&self, prefix: &str, suffix: &str) -> Vec<String> { self.transaction(|t| t.keys_matching(prefix, suffix)) }

    pub fn len(&self) -> usize { self.map.read().len() }
    pub fn is_empty(&self) -> bool { self.map.read().is_empty() }

    /// Remove expired keys. Returns number removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut w = self.map.write();
        let before = w.len();
        w.retain(|_, e| !e.expired(now));
        before - w.len()
    }

    fn ensure_persistence_loop(&self, interval: Duration) {
        let mut started = self.persist_started.lock();
        if *started { return; }
        *started = true;
        drop(started);
        let this = self.clone();
        std::thread::spawn(move || {
            loop {
                std::thread::sleep(interval);
                if let Err(e) = this.save_snapshot() {
                    tracing::warn!(target: "kv", "snapshot failed: {:#}", e);
                }
            }
        });
    }

    /// Write every live key to the snapshot file (no-op for a purely in-memory store).
    pub fn save_snapshot(&self) -> anyhow::Result<()> {
        let Some(path) = self.snapshot_path.as_ref() else { return Ok(()); };
        let now = Instant::now();
        let created_ms = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0);
        let entries: Vec<SnapEntry> = self.map.read().iter()
            .filter(|(_, e)| !e.expired(now))
            .map(|(k, e)| SnapEntry {
                key: k.clone(),
                val: SnapVal::from(&e.value),
                remaining_ms: e.expires_at.map(|exp| exp.saturating_duration_since(now).as_millis() as u64),
            })
            .collect();
        let snap = Snapshot { version: 1, created_ms, entries };
        let bytes = bincode::serialize(&snap)?;
        let tmp = path.with_extension("bin.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(tmp, path)?;
        Ok(())
    }

    /// Load snapshot from disk into memory, replacing the current contents.
    pub fn load_snapshot(&self) -> anyhow::Result<()> {
        let Some(path) = self.snapshot_path.as_ref() else { return Ok(()); };
        if !path.exists() { return Ok(()); }
        let bytes = std::fs::read(path)?;
        let snap: Snapshot = bincode::deserialize(&bytes)?;
        let now = Instant::now();
        let mut w = self.map.write();
        w.clear();
        for e in snap.entries.into_iter() {
            let expires_at = e.remaining_ms.map(|ms| now + Duration::from_millis(ms));
            w.insert(e.key, Entry { value: e.val.into_value(), expires_at });
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
enum SnapVal { Str(String), Int(i64), Json(Vec<u8>), Set(Vec<String>) }

#[derive(Serialize, Deserialize)]
struct SnapEntry { key: String, val: SnapVal, remaining_ms: Option<u64> }

#[derive(Serialize, Deserialize)]
struct Snapshot { version: u32, created_ms: i64, entries: Vec<SnapEntry> }

impl From<&KvValue> for SnapVal {
    fn from(v: &KvValue) -> Self {
        match v {
            KvValue::Str(s) => SnapVal::Str(s.clone()),
            KvValue::Int(i) => SnapVal::Int(*i),
            // bincode cannot round-trip serde_json::Value directly
            KvValue::Json(j) => SnapVal::Json(serde_json::to_vec(j).unwrap_or_default()),
            KvValue::Set(s) => SnapVal::Set(s.iter().cloned().collect()),
        }
    }
}

impl SnapVal {
    fn into_value(self) -> KvValue {
        match self {
            SnapVal::Str(s) => KvValue::Str(s),
            SnapVal::Int(i) => KvValue::Int(i),
            SnapVal::Json(b) => KvValue::Json(serde_json::from_slice(&b).unwrap_or(JsonValue::Null)),
            SnapVal::Set(v) => KvValue::Set(v.into_iter().collect()),
        }
    }
}

#[cfg(test)]
#[path = "kv_tests.rs"]
mod kv_tests;
