//!
//! curator storage module
//! ----------------------
//! Two stores back the coordinator:
//!
//! - [`kv::KvStore`]: the shared key-value store holding locks, sync/pulling flags and the
//!   fragment/request registries. Keys may carry an expiry.
//! - [`FragmentStore`]: the per-fragment append-only row store. A collection run clears a
//!   fragment's rows and then appends one row per streamed result; rows are never patched.
//!
//! Fragment stores provide no internal locking across clear/append sequences; callers
//! serialize access through the fragment lock.

use crate::error::CuratorResult;

mod paths;
pub mod kv;
pub mod rows;

pub use kv::{KvStore, KvTxn, KvValue};
pub use rows::{FileFragmentStore, MemoryFragmentStore};

/// One result row of a fragment query: variable name -> bound value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Row storage addressed by fragment id.
pub trait FragmentStore: Send + Sync {
    /// Drop all rows of `fid`. Succeeds when nothing is stored.
    fn clear(&self, fid: &str) -> CuratorResult<()>;

    fn append(&self, fid: &str, row: &Row) -> CuratorResult<()>;

    /// All rows currently stored for `fid`, in insertion order.
    fn rows(&self, fid: &str) -> CuratorResult<Vec<Row>>;
}
