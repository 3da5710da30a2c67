use std::sync::atomic::{AtomicU64, Ordering};

static COLLECTIONS_STARTED: AtomicU64 = AtomicU64::new(0);
static COLLECTIONS_COMPLETED: AtomicU64 = AtomicU64::new(0);
static COLLECTIONS_FAILED: AtomicU64 = AtomicU64::new(0);
static ROWS_APPENDED: AtomicU64 = AtomicU64::new(0);
static ROW_FAILURES: AtomicU64 = AtomicU64::new(0);
static SINKS_PRUNED: AtomicU64 = AtomicU64::new(0);
static SINKS_NOTIFIED: AtomicU64 = AtomicU64::new(0);
static FRAGMENTS_REMOVED: AtomicU64 = AtomicU64::new(0);

pub fn inc_collections_started() { COLLECTIONS_STARTED.fetch_add(1, Ordering::Relaxed); }
pub fn inc_collections_completed() { COLLECTIONS_COMPLETED.fetch_add(1, Ordering::Relaxed); }
pub fn inc_collections_failed() { COLLECTIONS_FAILED.fetch_add(1, Ordering::Relaxed); }
pub fn inc_rows_appended() { ROWS_APPENDED.fetch_add(1, Ordering::Relaxed); }
pub fn inc_row_failures() { ROW_FAILURES.fetch_add(1, Ordering::Relaxed); }
pub fn inc_sinks_pruned() { SINKS_PRUNED.fetch_add(1, Ordering::Relaxed); }
pub fn add_sinks_notified(n: u64) { SINKS_NOTIFIED.fetch_add(n, Ordering::Relaxed); }
pub fn inc_fragments_removed() { FRAGMENTS_REMOVED.fetch_add(1, Ordering::Relaxed); }

#[derive(Clone, Copy, Debug, Default)]
pub struct Snapshot {
    pub collections_started: u64,
    pub collections_completed: u64,
    pub collections_failed: u64,
    pub rows_appended: u64,
    pub row_failures: u64,
    pub sinks_pruned: u64,
    pub sinks_notified: u64,
    pub fragments_removed: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        collections_started: COLLECTIONS_STARTED.load(Ordering::Relaxed),
        collections_completed: COLLECTIONS_COMPLETED.load(Ordering::Relaxed),
        collections_failed: COLLECTIONS_FAILED.load(Ordering::Relaxed),
        rows_appended: ROWS_APPENDED.load(Ordering::Relaxed),
        row_failures: ROW_FAILURES.load(Ordering::Relaxed),
        sinks_pruned: SINKS_PRUNED.load(Ordering::Relaxed),
        sinks_notified: SINKS_NOTIFIED.load(Ordering::Relaxed),
        fragments_removed: FRAGMENTS_REMOVED.load(Ordering::Relaxed),
    }
}
