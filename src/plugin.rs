//! Collection event hooks.
//!
//! A plugin is told about every newly stored row and about the end of each collection. A
//! sink-aware plugin (one that names a sink kind) is called once per matching sink; a generic
//! plugin is called once with no sink. Plugin failures never affect the collection itself.

use std::sync::Arc;

use tracing::warn;

use crate::error::CuratorResult;
use crate::sink::{Sink, SinkMap};
use crate::storage::Row;

pub trait FragmentPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Kind of sink this plugin serves. `None` makes it a generic plugin.
    fn sink_kind(&self) -> Option<&str> { None }

    fn consume(&self, fid: &str, row: &Row, sink: Option<&dyn Sink>) -> CuratorResult<()>;

    fn complete(&self, fid: &str, sink: Option<&dyn Sink>) -> CuratorResult<()>;
}

#[derive(Clone, Default)]
pub struct PluginSet {
    plugins: Vec<Arc<dyn FragmentPlugin>>,
}

impl PluginSet {
    pub fn new() -> Self { Self::default() }

    /// Plugins are notified in registration order.
    pub fn register(&mut self, plugin: Arc<dyn FragmentPlugin>) { self.plugins.push(plugin); }

    pub fn is_empty(&self) -> bool { self.plugins.is_empty() }

    /// Forward a stored row. A sink that makes a sink-aware plugin fail is completed for that
    /// plugin and removed from `sinks`. Returns the request ids removed.
    pub fn consume_row(&self, fid: &str, row: &Row, sinks: &mut SinkMap) -> Vec<String> {
        let mut dropped: Vec<String> = Vec::new();
        for plugin in &self.plugins {
            let Some(kind) = plugin.sink_kind() else {
                if let Err(e) = plugin.consume(fid, row, None) {
                    warn!(target: "plugins", plugin = plugin.name(), fid = %fid, "consume failed: {}", e);
                }
                continue;
            };
            let mut invalid: Vec<String> = Vec::new();
            for (rid, sink) in sinks.iter().filter(|(_, s)| s.kind() == kind) {
                if let Err(e) = plugin.consume(fid, row, Some(sink.as_ref())) {
                    warn!(target: "plugins", plugin = plugin.name(), fid = %fid, rid = %rid, "consume failed, dropping sink: {}", e);
                    if let Err(e) = plugin.complete(fid, Some(sink.as_ref())) {
                        warn!(target: "plugins", plugin = plugin.name(), fid = %fid, rid = %rid, "complete failed: {}", e);
                    }
                    invalid.push(rid.clone());
                }
            }
            for rid in invalid {
                sinks.remove(&rid);
                dropped.push(rid);
            }
        }
        dropped
    }

    pub fn complete(&self, fid: &str, sinks: &SinkMap) {
        for plugin in &self.plugins {
            match plugin.sink_kind() {
                Some(kind) => {
                    for (rid, sink) in sinks.iter().filter(|(_, s)| s.kind() == kind) {
                        if let Err(e) = plugin.complete(fid, Some(sink.as_ref())) {
                            warn!(target: "plugins", plugin = plugin.name(), fid = %fid, rid = %rid, "complete failed: {}", e);
                        }
                    }
                }
                None => {
                    if let Err(e) = plugin.complete(fid, None) {
                        warn!(target: "plugins", plugin = plugin.name(), fid = %fid, "complete failed: {}", e);
                    }
                }
            }
        }
    }
}
