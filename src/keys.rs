//! Shared-store key layout, namespaced by agent id:
//!
//! ```text
//! {agent}:fragments                    set of registered fragment ids
//! {agent}:fragments:{fid}:gp           set of triple patterns
//! {agent}:fragments:{fid}:requests     set of request ids waiting on the fragment
//! {agent}:fragments:{fid}:lock         fragment lock (holder token)
//! {agent}:fragments:{fid}:pulling      present while a collection is in flight
//! {agent}:fragments:{fid}:sync         present (with TTL) while the fragment is fresh
//! {agent}:fragments:{fid}:updated      RFC 3339 timestamp of the last completed collection
//! {agent}:fragments:{fid}:on_demand    present while the fragment is in on-demand mode
//! {agent}:requests:{rid}:delivery      delivery state of a request (KvDelivery)
//! ```

#[derive(Clone, Debug)]
pub struct FragmentKeys {
    fragments: String,
    requests: String,
}

impl FragmentKeys {
    pub fn new(agent_id: &str) -> Self {
        Self { fragments: format!("{}:fragments", agent_id), requests: format!("{}:requests", agent_id) }
    }

    /// Registered fragment ids.
    pub fn registry(&self) -> &str { &self.fragments }

    /// Prefix shared by every key of one fragment.
    pub fn fragment(&self, fid: &str) -> String { format!("{}:{}", self.fragments, fid) }

    /// Prefix shared by the per-fragment keys of all fragments.
    pub fn fragments_prefix(&self) -> String { format!("{}:", self.fragments) }

    pub fn graph_pattern(&self, fid: &str) -> String { format!("{}:{}:gp", self.fragments, fid) }
    pub fn requests(&self, fid: &str) -> String { format!("{}:{}:requests", self.fragments, fid) }
    pub fn lock(&self, fid: &str) -> String { format!("{}:{}:lock", self.fragments, fid) }
    pub fn pulling(&self, fid: &str) -> String { format!("{}:{}:pulling", self.fragments, fid) }
    pub fn sync(&self, fid: &str) -> String { format!("{}:{}:sync", self.fragments, fid) }
    pub fn updated(&self, fid: &str) -> String { format!("{}:{}:updated", self.fragments, fid) }
    pub fn on_demand(&self, fid: &str) -> String { format!("{}:{}:on_demand", self.fragments, fid) }

    pub fn delivery(&self, rid: &str) -> String { format!("{}:{}:delivery", self.requests, rid) }
}
