//! Fragment generator client.
//!
//! Given a fragment's triple patterns, the executor returns search-plan metadata plus a lazy,
//! one-shot stream of result rows. Failing to open is an `ExecutorUnavailable` error; a stream
//! item error means the executor broke mid-stream.

use std::io::{BufRead, BufReader};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::config::Endpoint;
use crate::error::{CuratorError, CuratorResult};
use crate::storage::Row;

pub type RowStream = Box<dyn Iterator<Item = CuratorResult<Row>> + Send>;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct QueryMetadata {
    /// False when the executor found no search plan for the pattern.
    #[serde(default = "default_plan")]
    pub plan: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_plan() -> bool { true }

pub trait QueryClient: Send + Sync {
    fn open(&self, graph_pattern: &[String]) -> CuratorResult<(QueryMetadata, RowStream)>;
}

/// Join triple patterns into a basic graph pattern: `{ tp1 . tp2 }`.
pub fn bgp(graph_pattern: &[String]) -> String {
    format!("{{ {} }}", graph_pattern.join(" . "))
}

/// Executor reached over HTTP.
///
/// `POST http://{agora}/fragment` with `{"gp", "workers", "provider"}`; the body comes back as
/// newline-delimited JSON: one metadata object, then one object per row.
pub struct HttpQueryClient {
    agora: Endpoint,
    provider: Endpoint,
    workers: usize,
    // built on first use: the blocking client must not be created on an async runtime thread
    client: OnceLock<reqwest::blocking::Client>,
}

impl HttpQueryClient {
    pub fn new(agora: Endpoint, provider: Endpoint, workers: usize) -> Self {
        Self { agora, provider, workers: workers.max(1), client: OnceLock::new() }
    }

    fn client(&self) -> CuratorResult<&reqwest::blocking::Client> {
        if let Some(c) = self.client.get() { return Ok(c); }
        let c = reqwest::blocking::Client::builder()
            .timeout(None::<std::time::Duration>)
            .build()
            .map_err(|e| CuratorError::executor(e.to_string()))?;
        Ok(self.client.get_or_init(|| c))
    }
}

impl QueryClient for HttpQueryClient {
    fn open(&self, graph_pattern: &[String]) -> CuratorResult<(QueryMetadata, RowStream)> {
        let url = format!("{}/fragment", self.agora.base_url());
        let body = json!({
            "gp": bgp(graph_pattern),
            "workers": self.workers,
            "provider": { "host": self.provider.host, "port": self.provider.port },
        });
        debug!(target: "query", "POST {} gp={}", url, body["gp"]);
        let resp = self.client()?
            .post(&url)
            .json(&body)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| CuratorError::executor(e.to_string()))?;
        read_stream(BufReader::new(resp))
    }
}

/// Split an NDJSON body into metadata and a lazy row stream.
pub fn read_stream<R: BufRead + Send + 'static>(reader: R) -> CuratorResult<(QueryMetadata, RowStream)> {
    let mut lines = reader.lines();
    let first = match lines.next() {
        Some(Ok(l)) => l,
        Some(Err(e)) => return Err(CuratorError::executor(e.to_string())),
        None => return Err(CuratorError::executor("empty response")),
    };
    let meta: QueryMetadata = serde_json::from_str(&first)
        .map_err(|e| CuratorError::executor(format!("bad metadata line: {}", e)))?;
    let rows = lines
        .filter(|l| l.as_ref().map(|s| !s.trim().is_empty()).unwrap_or(true))
        .map(|l| {
            let line = l.map_err(|e| CuratorError::stream(e.to_string()))?;
            match serde_json::from_str::<serde_json::Value>(&line) {
                Ok(serde_json::Value::Object(row)) => Ok(row),
                Ok(other) => Err(CuratorError::stream(format!("row is not an object: {}", other))),
                Err(e) => Err(CuratorError::stream(e.to_string())),
            }
        });
    Ok((meta, Box::new(rows)))
}
