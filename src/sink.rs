//! Request sinks: the notification handles of requests waiting on a fragment.
//!
//! Sinks belong to the request-delivery subsystem. The curator discovers them through the
//! fragment's request set and only ever moves a sink from `accepted` to `ready`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{CuratorError, CuratorResult};
use crate::keys::FragmentKeys;
use crate::metrics;
use crate::storage::{KvStore, KvValue};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryState {
    Accepted,
    Ready,
    Responding,
    Sent,
    /// Any state owned by the delivery subsystem that the curator does not interpret.
    Other(String),
}

impl DeliveryState {
    pub fn as_str(&self) -> &str {
        match self {
            DeliveryState::Accepted => "accepted",
            DeliveryState::Ready => "ready",
            DeliveryState::Responding => "responding",
            DeliveryState::Sent => "sent",
            DeliveryState::Other(s) => s.as_str(),
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "accepted" => DeliveryState::Accepted,
            "ready" => DeliveryState::Ready,
            "responding" => DeliveryState::Responding,
            "sent" => DeliveryState::Sent,
            other => DeliveryState::Other(other.to_string()),
        }
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Notification handle for one pending request.
pub trait Sink: Send + Sync {
    fn request_id(&self) -> &str;

    /// Sink flavour, used by plugins to pick the sinks they understand.
    fn kind(&self) -> &str { "default" }

    fn delivery_state(&self) -> CuratorResult<DeliveryState>;

    fn set_delivery_state(&self, state: DeliveryState) -> CuratorResult<()>;
}

/// Builds sinks from request ids.
pub trait DeliveryBackend: Send + Sync {
    /// Fails when the request vanished or cannot be materialized.
    fn build_sink(&self, request_id: &str) -> CuratorResult<Arc<dyn Sink>>;
}

pub type SinkMap = BTreeMap<String, Arc<dyn Sink>>;

/// Delivery backend keeping each request's state at `{agent}:requests:{rid}:delivery`.
#[derive(Clone)]
pub struct KvDelivery {
    kv: KvStore,
    keys: FragmentKeys,
}

impl KvDelivery {
    pub fn new(kv: KvStore, keys: FragmentKeys) -> Self { Self { kv, keys } }

    /// Record a new request in `accepted` state.
    pub fn accept(&self, request_id: &str) {
        self.kv.set(self.keys.delivery(request_id), KvValue::Str(DeliveryState::Accepted.as_str().to_string()), None);
    }
}

impl DeliveryBackend for KvDelivery {
    fn build_sink(&self, request_id: &str) -> CuratorResult<Arc<dyn Sink>> {
        let key = self.keys.delivery(request_id);
        if !self.kv.exists(&key) {
            return Err(CuratorError::SinkLoad { request_id: request_id.to_string(), message: "request not found".into() });
        }
        Ok(Arc::new(KvSink { kv: self.kv.clone(), key, request_id: request_id.to_string() }))
    }
}

struct KvSink {
    kv: KvStore,
    key: String,
    request_id: String,
}

impl Sink for KvSink {
    fn request_id(&self) -> &str { &self.request_id }

    fn delivery_state(&self) -> CuratorResult<DeliveryState> {
        self.kv.get_str(&self.key)
            .map(|s| DeliveryState::parse(&s))
            .ok_or_else(|| CuratorError::SinkLoad { request_id: self.request_id.clone(), message: "request vanished".into() })
    }

    fn set_delivery_state(&self, state: DeliveryState) -> CuratorResult<()> {
        self.kv.set(self.key.as_str(), KvValue::Str(state.as_str().to_string()), None);
        Ok(())
    }
}

/// Loads the sinks of a fragment's registered requests, pruning the ones that cannot be built.
#[derive(Clone)]
pub struct SinkRegistry {
    kv: KvStore,
    keys: FragmentKeys,
    delivery: Arc<dyn DeliveryBackend>,
}

impl SinkRegistry {
    pub fn new(kv: KvStore, keys: FragmentKeys, delivery: Arc<dyn DeliveryBackend>) -> Self {
        Self { kv, keys, delivery }
    }

    /// Number of request ids currently registered against `fid`.
    pub fn request_count(&self, fid: &str) -> usize { self.kv.scard(&self.keys.requests(fid)) }

    /// Build a sink per registered request id.
    ///
    /// A request id whose sink fails to build is logged and removed from the fragment's request
    /// set, so later loads never retry it. Individual failures never fail the load.
    pub fn load(&self, fid: &str) -> SinkMap {
        let requests_key = self.keys.requests(fid);
        let mut sinks = SinkMap::new();
        for rid in self.kv.smembers(&requests_key) {
            match self.delivery.build_sink(&rid) {
                Ok(sink) => { sinks.insert(rid, sink); }
                Err(e) => {
                    warn!(target: "sinks", fid = %fid, rid = %rid, "dropping request: {}", e);
                    self.kv.srem(&requests_key, &rid);
                    metrics::inc_sinks_pruned();
                }
            }
        }
        sinks
    }
}

/// Move every `accepted` sink to `ready`; other states are left alone. Returns how many moved.
pub fn notify_completion(fid: &str, sinks: &SinkMap) -> usize {
    let mut notified = 0;
    for (rid, sink) in sinks {
        match sink.delivery_state() {
            Ok(DeliveryState::Accepted) => match sink.set_delivery_state(DeliveryState::Ready) {
                Ok(()) => notified += 1,
                Err(e) => warn!(target: "sinks", fid = %fid, rid = %rid, "cannot mark ready: {}", e),
            },
            Ok(state) => debug!(target: "sinks", fid = %fid, rid = %rid, "left in state {}", state),
            Err(e) => warn!(target: "sinks", fid = %fid, rid = %rid, "cannot read delivery state: {}", e),
        }
    }
    metrics::add_sinks_notified(notified as u64);
    notified
}
