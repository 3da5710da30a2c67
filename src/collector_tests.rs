use super::*;
use crate::error::CuratorError;
use crate::query::QueryMetadata;
use crate::plugin::FragmentPlugin;
use crate::sink::{DeliveryState, KvDelivery, Sink};
use crate::storage::MemoryFragmentStore;
use parking_lot::Mutex;
use rand::{rngs::StdRng, SeedableRng};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

fn row(s: &str) -> Row {
    json!({ "s": s }).as_object().cloned().unwrap()
}

/// Executor returning a fixed list of rows, optionally breaking after `fail_after` rows.
#[derive(Default)]
struct ScriptedQuery {
    rows: Vec<Row>,
    fail_after: Option<usize>,
    unreachable: bool,
    no_plan: bool,
    /// Called before each row is yielded, with the row index.
    on_row: Option<Arc<dyn Fn(usize) + Send + Sync>>,
}

impl QueryClient for ScriptedQuery {
    fn open(&self, _gp: &[String]) -> CuratorResult<(QueryMetadata, RowStream)> {
        if self.unreachable {
            return Err(CuratorError::executor("connection refused"));
        }
        let meta = QueryMetadata { plan: !self.no_plan, ..Default::default() };
        let fail_after = self.fail_after;
        let hook = self.on_row.clone();
        let items: Vec<CuratorResult<Row>> = self.rows.iter().cloned().enumerate()
            .map(|(i, r)| if Some(i) == fail_after { Err(CuratorError::stream("reset by peer")) } else { Ok(r) })
            .collect();
        let stream = items.into_iter().enumerate().map(move |(i, r)| {
            if let Some(h) = &hook { h(i); }
            r
        });
        Ok((meta, Box::new(stream)))
    }
}

/// Store recording every call and the number of concurrent callers per fragment.
#[derive(Default)]
struct RecordingStore {
    inner: MemoryFragmentStore,
    calls: Mutex<Vec<String>>,
    fail_appends: Mutex<Vec<usize>>,
    appends: AtomicUsize,
    inside: Mutex<HashMap<String, usize>>,
    max_inside: AtomicUsize,
    dwell: Option<Duration>,
}

impl RecordingStore {
    fn enter(&self, fid: &str) {
        let mut m = self.inside.lock();
        let n = m.entry(fid.to_string()).or_default();
        *n += 1;
        self.max_inside.fetch_max(*n, Ordering::SeqCst);
    }

    fn leave(&self, fid: &str) {
        if let Some(n) = self.inside.lock().get_mut(fid) { *n -= 1; }
    }

    fn dwell(&self) {
        if let Some(d) = self.dwell { std::thread::sleep(d); }
    }
}

impl FragmentStore for RecordingStore {
    fn clear(&self, fid: &str) -> CuratorResult<()> {
        self.enter(fid);
        self.calls.lock().push(format!("clear:{}", fid));
        self.dwell();
        let r = self.inner.clear(fid);
        self.leave(fid);
        r
    }

    fn append(&self, fid: &str, row: &Row) -> CuratorResult<()> {
        self.enter(fid);
        let n = self.appends.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().push(format!("append:{}", fid));
        self.dwell();
        let r = if self.fail_appends.lock().contains(&n) {
            Err(CuratorError::store("disk full"))
        } else {
            self.inner.append(fid, row)
        };
        self.leave(fid);
        r
    }

    fn rows(&self, fid: &str) -> CuratorResult<Vec<Row>> { self.inner.rows(fid) }
}

struct Harness {
    kv: KvStore,
    keys: FragmentKeys,
    delivery: KvDelivery,
    store: Arc<RecordingStore>,
    collector: FragmentCollector,
}

fn settings() -> CollectorSettings {
    CollectorSettings {
        min_sync: Duration::from_secs(10),
        rows_per_lock: 1,
        throttling: None,
        on_demand_threshold: None,
        requests_refresh_every: 100,
    }
}

fn harness_with(query: ScriptedQuery, store: RecordingStore, settings: CollectorSettings, lock_timeout: Option<Duration>) -> Harness {
    harness_with_plugins(query, store, settings, lock_timeout, PluginSet::new())
}

fn harness_with_plugins(
    query: ScriptedQuery,
    store: RecordingStore,
    settings: CollectorSettings,
    lock_timeout: Option<Duration>,
    plugins: PluginSet,
) -> Harness {
    let kv = KvStore::new();
    let keys = FragmentKeys::new("t");
    let delivery = KvDelivery::new(kv.clone(), keys.clone());
    let store = Arc::new(store);
    let locks = LockManager::new(kv.clone(), keys.clone())
        .with_poll(Duration::from_millis(1))
        .with_timeout(lock_timeout);
    let registry = SinkRegistry::new(kv.clone(), keys.clone(), Arc::new(delivery.clone()));
    let collector = FragmentCollector::new(
        kv.clone(), keys.clone(), locks, store.clone(), registry, Arc::new(query), plugins, settings,
    );
    Harness { kv, keys, delivery, store, collector }
}

/// Sink-aware plugin for `default` sinks that refuses rows for one request id.
#[derive(Default)]
struct SinkRecorder {
    fail_for: Option<String>,
    events: Mutex<Vec<String>>,
}

impl SinkRecorder {
    fn count(&self, event: &str) -> usize {
        self.events.lock().iter().filter(|e| e.as_str() == event).count()
    }
}

impl FragmentPlugin for SinkRecorder {
    fn name(&self) -> &str { "sink-recorder" }
    fn sink_kind(&self) -> Option<&str> { Some("default") }
    fn consume(&self, _fid: &str, _row: &Row, sink: Option<&dyn Sink>) -> CuratorResult<()> {
        let rid = sink.map(|s| s.request_id().to_string()).unwrap_or_default();
        self.events.lock().push(format!("consume:{}", rid));
        if self.fail_for.as_deref() == Some(rid.as_str()) {
            return Err(CuratorError::internal("sink rejected row"));
        }
        Ok(())
    }
    fn complete(&self, _fid: &str, sink: Option<&dyn Sink>) -> CuratorResult<()> {
        let rid = sink.map(|s| s.request_id().to_string()).unwrap_or_default();
        self.events.lock().push(format!("complete:{}", rid));
        Ok(())
    }
}

fn plugin_set(plugin: &Arc<SinkRecorder>) -> PluginSet {
    let mut set = PluginSet::new();
    set.register(plugin.clone());
    set
}

fn harness(query: ScriptedQuery) -> Harness {
    harness_with(query, RecordingStore::default(), settings(), None)
}

impl Harness {
    fn register(&self, fid: &str, requests: &[&str]) {
        self.kv.sadd(self.keys.registry(), [fid]);
        self.kv.sadd(&self.keys.graph_pattern(fid), ["?s ?p ?o"]);
        for rid in requests {
            self.delivery.accept(rid);
            self.kv.sadd(&self.keys.requests(fid), [*rid]);
        }
    }

    fn state_of(&self, rid: &str) -> DeliveryState {
        use crate::sink::DeliveryBackend;
        self.delivery.build_sink(rid).unwrap().delivery_state().unwrap()
    }
}

#[test]
fn collects_rows_syncs_and_notifies() {
    let h = harness(ScriptedQuery { rows: vec![row("a"), row("b"), row("c")], ..Default::default() });
    h.register("f1", &["r1", "r2"]);

    let report = h.collector.collect("f1");
    assert_eq!(report.state, CollectState::Done);
    assert_eq!(report.rows_appended, 3);
    assert_eq!(report.notified, 2);
    assert_eq!(h.store.rows("f1").unwrap(), vec![row("a"), row("b"), row("c")]);

    let ttl = report.sync_ttl.unwrap();
    assert!(ttl >= Duration::from_secs(10) && ttl <= Duration::from_secs(20), "ttl {:?}", ttl);
    let remaining = h.kv.ttl(&h.keys.sync("f1")).unwrap();
    assert!(remaining <= Duration::from_secs(20));
    assert!(h.kv.exists(&h.keys.updated("f1")));
    assert!(!h.kv.exists(&h.keys.pulling("f1")));
    assert!(!h.kv.exists(&h.keys.lock("f1")));
    assert_eq!(h.state_of("r1"), DeliveryState::Ready);
    assert_eq!(h.state_of("r2"), DeliveryState::Ready);
}

#[test]
fn clear_precedes_appends() {
    let h = harness(ScriptedQuery { rows: vec![row("a"), row("b")], ..Default::default() });
    h.register("f1", &[]);
    h.store.inner.append("f1", &row("stale")).unwrap();

    h.collector.collect("f1");
    assert_eq!(*h.store.calls.lock(), vec!["clear:f1", "append:f1", "append:f1"]);
    assert_eq!(h.store.rows("f1").unwrap().len(), 2);
}

#[test]
fn broken_stream_keeps_collected_rows_and_still_syncs() {
    let h = harness(ScriptedQuery { rows: vec![row("a"), row("b"), row("c"), row("d")], fail_after: Some(2), ..Default::default() });
    h.register("f1", &["r1"]);

    let report = h.collector.collect("f1");
    assert_eq!(report.state, CollectState::Done);
    assert!(report.stream_error.is_some());
    assert_eq!(h.store.rows("f1").unwrap(), vec![row("a"), row("b")]);
    assert!(h.kv.exists(&h.keys.sync("f1")));
    assert_eq!(h.state_of("r1"), DeliveryState::Ready);
}

#[test]
fn unreachable_executor_mutates_nothing() {
    let h = harness(ScriptedQuery { unreachable: true, ..Default::default() });
    h.register("f1", &["r1"]);
    h.store.inner.append("f1", &row("old")).unwrap();

    let report = h.collector.collect("f1");
    assert_eq!(report.state, CollectState::Failed);
    assert_eq!(report.failed_from, Some(CollectState::Locking));
    assert!(report.error.unwrap().contains("connection refused"));
    assert!(h.store.calls.lock().is_empty());
    assert_eq!(h.store.rows("f1").unwrap(), vec![row("old")]);
    assert!(!h.kv.exists(&h.keys.pulling("f1")));
    assert!(!h.kv.exists(&h.keys.sync("f1")));
    assert_eq!(h.state_of("r1"), DeliveryState::Accepted);
}

#[test]
fn failed_row_insert_is_skipped() {
    let store = RecordingStore::default();
    store.fail_appends.lock().push(1);
    let h = harness_with(ScriptedQuery { rows: vec![row("a"), row("b"), row("c")], ..Default::default() }, store, settings(), None);
    h.register("f1", &[]);

    let report = h.collector.collect("f1");
    assert_eq!(report.state, CollectState::Done);
    assert_eq!((report.rows_appended, report.row_failures), (2, 1));
    assert_eq!(h.store.rows("f1").unwrap(), vec![row("a"), row("c")]);
}

#[test]
fn lock_timeout_fails_before_any_mutation() {
    let h = harness_with(ScriptedQuery { rows: vec![row("a")], ..Default::default() }, RecordingStore::default(), settings(), Some(Duration::from_millis(20)));
    h.register("f1", &[]);
    h.kv.set(h.keys.lock("f1"), KvValue::Str("someone-else".into()), None);

    let report = h.collector.collect("f1");
    assert_eq!(report.state, CollectState::Failed);
    assert_eq!(report.failed_from, Some(CollectState::Locking));
    assert!(report.error.unwrap().contains("timed out"));
    assert!(h.store.calls.lock().is_empty());
    assert!(!h.kv.exists(&h.keys.pulling("f1")));
}

#[test]
fn batches_rows_per_lock() {
    let mut s = settings();
    s.rows_per_lock = 2;
    let rows: Vec<Row> = ["a", "b", "c", "d", "e"].iter().map(|s| row(s)).collect();
    let h = harness_with(ScriptedQuery { rows: rows.clone(), ..Default::default() }, RecordingStore::default(), s, None);
    h.register("f1", &[]);

    let report = h.collector.collect("f1");
    assert_eq!(report.rows_appended, 5);
    assert_eq!(h.store.rows("f1").unwrap(), rows);
}

#[test]
fn missing_plan_removes_fragment() {
    let h = harness(ScriptedQuery { no_plan: true, ..Default::default() });
    h.register("f1", &["r1"]);
    h.register("f10", &[]);

    let report = h.collector.collect("f1");
    assert_eq!(report.state, CollectState::Done);
    assert!(report.removed);
    assert_eq!(h.state_of("r1"), DeliveryState::Ready);
    assert!(!h.kv.smembers(h.keys.registry()).contains("f1"));
    assert!(h.kv.keys_matching(&format!("{}:", h.keys.fragment("f1")), "").is_empty());
    // a fragment whose id shares the prefix is untouched
    assert!(h.kv.exists(&h.keys.graph_pattern("f10")));
}

#[test]
fn requests_arriving_mid_collection_are_notified() {
    let kv_slot: Arc<Mutex<Option<(KvStore, FragmentKeys, KvDelivery)>>> = Arc::new(Mutex::new(None));
    let slot = kv_slot.clone();
    let hook: Arc<dyn Fn(usize) + Send + Sync> = Arc::new(move |i: usize| {
        if i == 1 {
            if let Some((kv, keys, delivery)) = slot.lock().as_ref() {
                delivery.accept("late");
                kv.sadd(&keys.requests("f1"), ["late"]);
            }
        }
    });
    let h = harness(ScriptedQuery { rows: vec![row("a"), row("b"), row("c")], on_row: Some(hook), ..Default::default() });
    *kv_slot.lock() = Some((h.kv.clone(), h.keys.clone(), h.delivery.clone()));
    h.register("f1", &["r1"]);

    let report = h.collector.collect("f1");
    assert_eq!(report.notified, 2);
    assert_eq!(h.state_of("r1"), DeliveryState::Ready);
    assert_eq!(h.state_of("late"), DeliveryState::Ready);
}

#[test]
fn late_request_reaches_plugins_before_finalize() {
    let slot: Arc<Mutex<Option<(KvStore, FragmentKeys, KvDelivery)>>> = Arc::new(Mutex::new(None));
    let hook_slot = slot.clone();
    let hook: Arc<dyn Fn(usize) + Send + Sync> = Arc::new(move |i: usize| {
        if i == 1 {
            if let Some((kv, keys, delivery)) = hook_slot.lock().as_ref() {
                delivery.accept("late");
                kv.sadd(&keys.requests("f1"), ["late"]);
            }
        }
    });
    let mut s = settings();
    s.requests_refresh_every = 1;
    let plugin = Arc::new(SinkRecorder::default());
    let h = harness_with_plugins(
        ScriptedQuery { rows: vec![row("a"), row("b"), row("c")], on_row: Some(hook), ..Default::default() },
        RecordingStore::default(),
        s,
        None,
        plugin_set(&plugin),
    );
    *slot.lock() = Some((h.kv.clone(), h.keys.clone(), h.delivery.clone()));
    h.register("f1", &["r1"]);

    h.collector.collect("f1");
    // "b" is stored before the refresh that follows it, so only "c" reaches the late sink
    assert_eq!(plugin.count("consume:r1"), 3);
    assert_eq!(plugin.count("consume:late"), 1);
    let events = plugin.events.lock();
    let first_complete = events.iter().position(|e| e.starts_with("complete:")).unwrap();
    let late_consume = events.iter().position(|e| e == "consume:late").unwrap();
    assert!(late_consume < first_complete, "{:?}", *events);
}

#[test]
fn sink_dropped_by_plugin_stays_dropped_across_refreshes() {
    let mut s = settings();
    s.requests_refresh_every = 1;
    let plugin = Arc::new(SinkRecorder { fail_for: Some("r2".into()), ..Default::default() });
    let h = harness_with_plugins(
        ScriptedQuery { rows: vec![row("a"), row("b"), row("c")], ..Default::default() },
        RecordingStore::default(),
        s,
        None,
        plugin_set(&plugin),
    );
    h.register("f1", &["r1", "r2"]);

    let report = h.collector.collect("f1");
    assert_eq!(report.state, CollectState::Done);
    assert_eq!((plugin.count("consume:r2"), plugin.count("complete:r2")), (1, 1));
    assert_eq!((plugin.count("consume:r1"), plugin.count("complete:r1")), (3, 1));
    // the request itself stays registered; only this run stops serving it
    assert!(h.kv.smembers(&h.keys.requests("f1")).contains("r2"));
    assert_eq!(report.notified, 1);
    assert_eq!(h.state_of("r1"), DeliveryState::Ready);
    assert_eq!(h.state_of("r2"), DeliveryState::Accepted);
}

#[test]
fn throttling_spaces_out_rows() {
    let mut s = settings();
    s.throttling = Some(Duration::from_millis(15));
    let rows: Vec<Row> = ["a", "b", "c", "d"].iter().map(|s| row(s)).collect();
    let h = harness_with(ScriptedQuery { rows, ..Default::default() }, RecordingStore::default(), s, None);
    h.register("f1", &[]);

    let started = Instant::now();
    let report = h.collector.collect("f1");
    assert_eq!(report.rows_appended, 4);
    assert!(started.elapsed() >= Duration::from_millis(60), "elapsed {:?}", started.elapsed());
}

#[test]
fn on_demand_mode_skips_expiry() {
    let mut s = settings();
    s.on_demand_threshold = Some(Duration::from_secs(60));
    let h = harness_with(ScriptedQuery { rows: vec![row("a")], ..Default::default() }, RecordingStore::default(), s, None);
    h.register("f1", &[]);

    let report = h.collector.collect("f1");
    assert!(report.on_demand);
    assert!(report.sync_ttl.is_none());
    assert!(h.kv.exists(&h.keys.sync("f1")));
    assert!(h.kv.ttl(&h.keys.sync("f1")).is_none());
    assert!(h.kv.exists(&h.keys.on_demand("f1")));
}

#[test]
fn concurrent_runs_never_overlap_inside_the_lock() {
    let store = RecordingStore { dwell: Some(Duration::from_millis(2)), ..Default::default() };
    let rows: Vec<Row> = (0..10).map(|i| row(&i.to_string())).collect();
    let h = Arc::new(harness_with(ScriptedQuery { rows, ..Default::default() }, store, settings(), None));
    h.register("f1", &[]);

    let runs: Vec<_> = (0..3).map(|_| {
        let h = h.clone();
        std::thread::spawn(move || h.collector.collect("f1"))
    }).collect();
    for r in runs { assert_eq!(r.join().unwrap().state, CollectState::Done); }
    assert_eq!(h.store.max_inside.load(Ordering::SeqCst), 1);
}

#[test]
fn sync_ttl_stays_within_jitter_bounds() {
    let mut rng = StdRng::seed_from_u64(0xF4A6);
    let m = Duration::from_secs(10);
    for _ in 0..1_000 {
        let ttl = jittered_sync_ttl(m, &mut rng);
        assert!(ttl >= m && ttl <= m * 2, "ttl {:?}", ttl);
    }
}

#[test]
fn notify_step_is_idempotent() {
    let h = harness(ScriptedQuery::default());
    h.register("f1", &["r1"]);
    let sinks = crate::sink::SinkRegistry::new(h.kv.clone(), h.keys.clone(), Arc::new(h.delivery.clone())).load("f1");
    assert_eq!(notify_completion("f1", &sinks), 1);
    assert_eq!(notify_completion("f1", &sinks), 0);
    assert_eq!(sinks["r1"].delivery_state().unwrap(), DeliveryState::Ready);
}
