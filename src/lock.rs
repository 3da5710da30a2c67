//! Named per-fragment mutual exclusion backed by the shared KV store.
//!
//! A lock is held while `{agent}:fragments:{fid}:lock` contains the holder's token, so every
//! process sharing the store observes it. Acquisition polls the key; without a configured
//! timeout it blocks until the holder releases.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{CuratorError, CuratorResult};
use crate::keys::FragmentKeys;
use crate::storage::{KvStore, KvValue};

#[derive(Clone)]
pub struct LockManager {
    kv: KvStore,
    keys: FragmentKeys,
    poll: Duration,
    timeout: Option<Duration>,
    lease: Option<Duration>,
}

impl LockManager {
    pub fn new(kv: KvStore, keys: FragmentKeys) -> Self {
        Self { kv, keys, poll: Duration::from_millis(100), timeout: None, lease: None }
    }

    pub fn with_poll(mut self, poll: Duration) -> Self { self.poll = poll; self }
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self { self.timeout = timeout; self }
    pub fn with_lease(mut self, lease: Option<Duration>) -> Self { self.lease = lease; self }

    /// Lock handle for `fid`. Nothing is taken until [`FragmentLock::acquire`].
    pub fn lock(&self, fid: &str) -> FragmentLock {
        FragmentLock {
            kv: self.kv.clone(),
            key: self.keys.lock(fid),
            poll: self.poll,
            timeout: self.timeout,
            lease: self.lease,
        }
    }

    /// Unconditionally delete every lock key and pulling flag in this namespace.
    ///
    /// Only valid at startup: a fresh coordinator assumes no earlier holder is still running.
    /// Returns `(locks, pulling_flags)` removed.
    pub fn clear_all(&self) -> (usize, usize) {
        let prefix = self.keys.fragments_prefix();
        info!(target: "lock", "Cleaning fragment locks...");
        let locks = self.kv.transaction(|t| {
            let ks = t.keys_matching(&prefix, ":lock");
            ks.iter().filter(|k| t.delete(k)).count()
        });
        info!(target: "lock", "Cleaning fragment pulling flags...");
        let pullings = self.kv.transaction(|t| {
            let ks = t.keys_matching(&prefix, ":pulling");
            ks.iter().filter(|k| t.delete(k)).count()
        });
        (locks, pullings)
    }
}

pub struct FragmentLock {
    kv: KvStore,
    key: String,
    poll: Duration,
    timeout: Option<Duration>,
    lease: Option<Duration>,
}

impl FragmentLock {
    pub fn key(&self) -> &str { &self.key }

    /// Block until the lock is held by this caller. Fails only when a timeout is configured.
    pub fn acquire(&self) -> CuratorResult<LockGuard<'_>> {
        let token = KvValue::Str(Uuid::new_v4().to_string());
        let started = Instant::now();
        let mut waited_logged = false;
        loop {
            if self.kv.set_nx(self.key.as_str(), token.clone(), self.lease) {
                return Ok(LockGuard { lock: self, token: Some(token) });
            }
            let waited = started.elapsed();
            if let Some(limit) = self.timeout {
                if waited >= limit {
                    return Err(CuratorError::LockTimeout { key: self.key.clone(), waited });
                }
            }
            if !waited_logged && waited >= Duration::from_secs(5) {
                debug!(target: "lock", key = %self.key, "still waiting for lock after {:?}", waited);
                waited_logged = true;
            }
            std::thread::sleep(self.poll);
        }
    }
}

/// Held lock; released on drop.
pub struct LockGuard<'a> {
    lock: &'a FragmentLock,
    token: Option<KvValue>,
}

impl LockGuard<'_> {
    pub fn release(mut self) { self.release_inner(); }

    /// Give up the guard without touching the key, for when the key was deleted while held.
    pub fn disarm(mut self) { self.token = None; }

    fn release_inner(&mut self) {
        if let Some(token) = self.token.take() {
            if !self.lock.kv.compare_and_delete(&self.lock.key, &token) {
                // lease expired or the key was removed along with its fragment
                warn!(target: "lock", key = %self.lock.key, "lock was no longer held at release");
            }
        }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) { self.release_inner(); }
}
