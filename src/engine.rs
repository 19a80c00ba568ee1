//! Run controller for proximity queries.
//!
//! One run at a time moves `Idle -> Running -> {Completed | Cancelled | Failed}`.
//! Chunks of entities are fetched strictly one after another; inside a chunk
//! the distance filter fans out over the blocking pool and joins before the
//! next chunk starts. Cancellation is cooperative and only observed at chunk
//! boundaries, including right after a chunk's fetch returns (that chunk is
//! then discarded).

use std::collections::HashSet;
use std::ops::Range;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::errors::{ProximityError, Result};
use crate::fetcher::{BatchFetcher, EntityBatch};
use crate::filter::{DistanceFilter, Within};
use crate::metrics::get_metrics_collector;
use crate::model::{EntityDirectory, LocationRecord, ProximityHit, QuerySpec, RunSummary};
use crate::report::ReportSink;
use crate::source::{RemoteSource, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed(RunSummary),
    Cancelled(RunSummary),
    Failed { message: String },
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn state(&self) -> EngineState {
        match self {
            RunStatus::Running => EngineState::Running,
            RunStatus::Completed(_) => EngineState::Completed,
            RunStatus::Cancelled(_) => EngineState::Cancelled,
            RunStatus::Failed { .. } => EngineState::Failed,
        }
    }
}

/// Hits emitted so far plus the live feed. Both are updated under one lock so
/// a subscriber sees every hit exactly once.
struct HitLog {
    hits: Vec<ProximityHit>,
    tx: Option<broadcast::Sender<ProximityHit>>,
}

/// Caller's view of one run. Cheap to clone.
#[derive(Clone)]
pub struct RunHandle {
    id: Uuid,
    cancel: CancellationToken,
    status: watch::Receiver<RunStatus>,
    log: Arc<Mutex<HitLog>>,
}

impl RunHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Idempotent. Takes effect at the next chunk boundary.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            tracing::info!(run_id = %self.id, "Cancellation requested");
            self.cancel.cancel();
        }
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn status(&self) -> RunStatus {
        self.status.borrow().clone()
    }

    pub fn hits(&self) -> Vec<ProximityHit> {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).hits.clone()
    }

    /// Hits emitted so far and a receiver for the rest. The receiver closes
    /// once the run is over.
    pub fn subscribe(&self) -> (Vec<ProximityHit>, broadcast::Receiver<ProximityHit>) {
        let log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        let rx = match &log.tx {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        };
        (log.hits.clone(), rx)
    }

    pub async fn wait(&self) -> Result<RunSummary> {
        let mut status = self.status.clone();
        let terminal = status
            .wait_for(RunStatus::is_terminal)
            .await
            .map_err(|_| ProximityError::RunAborted)?
            .clone();
        match terminal {
            RunStatus::Completed(summary) | RunStatus::Cancelled(summary) => Ok(summary),
            RunStatus::Failed { message } => Err(ProximityError::RunFailed(message)),
            RunStatus::Running => Err(ProximityError::RunAborted),
        }
    }
}

struct ActiveRun {
    handle: RunHandle,
    task: JoinHandle<()>,
}

pub struct ProximityEngine {
    source: Arc<dyn RemoteSource>,
    session: Session,
    sink: Arc<dyn ReportSink>,
    config: EngineConfig,
    active: tokio::sync::Mutex<Option<ActiveRun>>,
}

impl ProximityEngine {
    pub fn new(
        source: Arc<dyn RemoteSource>,
        session: Session,
        sink: Arc<dyn ReportSink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            source,
            session,
            sink,
            config,
            active: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn source(&self) -> &Arc<dyn RemoteSource> {
        &self.source
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Validates `spec` and starts a run. An invalid spec is rejected before
    /// anything else happens. A run still in flight is cancelled first, and
    /// this waits for it to reach `Cancelled`.
    pub async fn start_run(&self, spec: QuerySpec, directory: EntityDirectory) -> Result<RunHandle> {
        let spec = spec.validated()?;

        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            if !previous.handle.status().is_terminal() {
                tracing::warn!(run_id = %previous.handle.id(), "Superseding active run");
                previous.handle.cancel();
            }
            if let Err(e) = previous.task.await {
                tracing::warn!(run_id = %previous.handle.id(), error = %e, "Run ended abnormally");
            }
        }

        self.sink.reset();

        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(RunStatus::Running);
        let (hits_tx, _) = broadcast::channel(self.config.progress_capacity.max(1));
        let log = Arc::new(Mutex::new(HitLog {
            hits: Vec::new(),
            tx: Some(hits_tx),
        }));

        let controller = RunController {
            id,
            fetcher: BatchFetcher::new(
                Arc::clone(&self.source),
                self.session.clone(),
                spec.record_cap,
                spec.chunk_size,
            ),
            filter: DistanceFilter::new(spec.center, spec.radius_m),
            workers: self.config.workers.max(1),
            spec,
            directory,
            sink: Arc::clone(&self.sink),
            cancel: cancel.clone(),
            log: Arc::clone(&log),
            state: RunState::default(),
        };

        let task = tokio::spawn(async move {
            let status = controller.run().await;
            status_tx.send_replace(status);
        });

        let handle = RunHandle {
            id,
            cancel,
            status: status_rx,
            log,
        };
        *active = Some(ActiveRun {
            handle: handle.clone(),
            task,
        });
        Ok(handle)
    }

    pub fn cancel(&self, handle: &RunHandle) {
        handle.cancel();
    }

    /// Calls `callback` for every hit of the run, including ones emitted
    /// before the call. The returned task ends when the run does.
    pub fn on_progress<F>(&self, handle: &RunHandle, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut(ProximityHit) + Send + 'static,
    {
        let (backlog, mut rx) = handle.subscribe();
        let handle = handle.clone();
        tokio::spawn(async move {
            // Hits handed to `callback` so far, and the log index of the next
            // hit `rx` will yield. They differ only after a lag.
            let mut delivered = backlog.len();
            let mut next = backlog.len();
            for hit in backlog {
                callback(hit);
            }
            loop {
                match rx.recv().await {
                    Ok(hit) => {
                        if next >= delivered {
                            callback(hit);
                            delivered = next + 1;
                        }
                        next += 1;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        next += skipped as usize;
                        tracing::debug!(
                            run_id = %handle.id(),
                            skipped,
                            "Progress listener lagged; replaying from the hit log"
                        );
                        for hit in handle.hits().into_iter().take(next).skip(delivered) {
                            callback(hit);
                        }
                        delivered = delivered.max(next);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub async fn await_completion(&self, handle: &RunHandle) -> Result<RunSummary> {
        handle.wait().await
    }

    /// State of the most recent run, `Idle` if there never was one.
    pub async fn state(&self) -> EngineState {
        match self.active.lock().await.as_ref() {
            Some(run) => run.handle.status().state(),
            None => EngineState::Idle,
        }
    }

    pub async fn current(&self) -> Option<RunHandle> {
        self.active.lock().await.as_ref().map(|run| run.handle.clone())
    }
}

/// Mutable bookkeeping for one run, touched only by its controller.
#[derive(Default)]
struct RunState {
    total_hits: usize,
    hit_entities: HashSet<String>,
    truncated: Vec<String>,
    chunks_completed: usize,
    records_scanned: usize,
}

struct RunController {
    id: Uuid,
    spec: QuerySpec,
    directory: EntityDirectory,
    fetcher: BatchFetcher,
    filter: DistanceFilter,
    workers: usize,
    sink: Arc<dyn ReportSink>,
    cancel: CancellationToken,
    log: Arc<Mutex<HitLog>>,
    state: RunState,
}

impl RunController {
    async fn run(mut self) -> RunStatus {
        let _measurement = crate::measure_operation!("engine.run");
        let entity_ids = std::mem::take(&mut self.spec.entity_ids);
        tracing::info!(
            run_id = %self.id,
            entities = entity_ids.len(),
            chunks = entity_ids.len().div_ceil(self.spec.chunk_size),
            radius_m = self.spec.radius_m,
            "Run started"
        );

        let outcome = self.drive(&entity_ids).await;
        self.close_progress();

        match outcome {
            Ok(cancelled) => {
                let summary = self.summary(cancelled);
                tracing::info!(
                    run_id = %self.id,
                    cancelled,
                    hits = summary.total_hits,
                    truncated = summary.truncated_entity_names.len(),
                    chunks = summary.chunks_completed,
                    "Run finished"
                );
                if cancelled {
                    RunStatus::Cancelled(summary)
                } else {
                    RunStatus::Completed(summary)
                }
            }
            Err(e) => {
                tracing::error!(run_id = %self.id, error = %e, "Run failed");
                RunStatus::Failed {
                    message: e.to_string(),
                }
            }
        }
    }

    /// Returns whether the run was cancelled.
    async fn drive(&mut self, entity_ids: &[String]) -> Result<bool> {
        for (index, chunk) in self.fetcher.chunks(entity_ids).enumerate() {
            if self.cancel.is_cancelled() {
                tracing::info!(run_id = %self.id, chunk = index, "Run stopping before chunk");
                return Ok(true);
            }

            tracing::debug!(run_id = %self.id, chunk = index, entities = chunk.len(), "Fetching chunk");
            let batches = self.fetcher.fetch_chunk(chunk, &self.spec.window).await?;

            if self.cancel.is_cancelled() {
                tracing::info!(run_id = %self.id, chunk = index, "Discarding chunk after cancellation");
                return Ok(true);
            }

            self.absorb(batches).await?;
            self.state.chunks_completed += 1;
        }
        Ok(false)
    }

    async fn absorb(&mut self, batches: Vec<EntityBatch>) -> Result<()> {
        let mut records = Vec::new();
        let mut spans = Vec::with_capacity(batches.len());
        let mut entity_ids = Vec::with_capacity(batches.len());

        for batch in batches {
            if batch.truncated {
                let name = self.directory.name_of(&batch.entity_id).to_string();
                tracing::warn!(
                    run_id = %self.id,
                    entity = %name,
                    record_cap = self.fetcher.record_cap(),
                    "Record cap reached; history may be incomplete"
                );
                self.sink.on_truncated(&name);
                self.state.truncated.push(name);
            }
            let start = records.len();
            records.extend(batch.records);
            spans.push(start..records.len());
            entity_ids.push(batch.entity_id);
        }

        self.state.records_scanned += records.len();
        get_metrics_collector().track_metric("engine.chunk_records", records.len() as f64);

        let records: Arc<[LocationRecord]> = records.into();
        let within = self
            .filter
            .filter_partitioned(Arc::clone(&records), self.workers)
            .await?;

        let mut chunk_hits = 0;
        for (entity_id, first) in entity_ids.into_iter().zip(first_per_span(&spans, within)) {
            let Some(first) = first else { continue };
            if !self.state.hit_entities.insert(entity_id.clone()) {
                continue;
            }
            self.state.total_hits += 1;
            chunk_hits += 1;
            self.emit(ProximityHit {
                record: records[first.index].clone(),
                entity_name: self.directory.name_of(&entity_id).to_string(),
                distance_m: first.distance_m,
            });
        }
        get_metrics_collector().track_metric("engine.chunk_hits", chunk_hits as f64);
        Ok(())
    }

    fn emit(&self, hit: ProximityHit) {
        self.sink.on_hit(&hit);
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = &log.tx {
            // No receivers is fine.
            let _ = tx.send(hit.clone());
        }
        log.hits.push(hit);
    }

    fn close_progress(&self) {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).tx.take();
    }

    fn summary(&self, cancelled: bool) -> RunSummary {
        RunSummary {
            run_id: self.id,
            total_hits: self.state.total_hits,
            truncated_entity_names: self.state.truncated.clone(),
            cancelled,
            chunks_completed: self.state.chunks_completed,
            records_scanned: self.state.records_scanned,
        }
    }
}

/// For each span (one entity's records), the passing point with the lowest
/// index. Independent of the order `within` arrives in.
fn first_per_span(spans: &[Range<usize>], within: Vec<Within>) -> Vec<Option<Within>> {
    let mut first: Vec<Option<Within>> = vec![None; spans.len()];
    for w in within {
        let slot = spans.partition_point(|span| span.end <= w.index);
        if let Some(current) = first.get_mut(slot) {
            if current.map_or(true, |c| w.index < c.index) {
                *current = Some(w);
            }
        }
    }
    first
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Coordinate, Entity, TimeWindow};
    use crate::report::NullSink;
    use crate::source::{DeviceFilter, HistoryRequest};
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone, Utc};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    const METERS_PER_DEGREE_LAT: f64 = 111_194.93;

    fn center() -> Coordinate {
        Coordinate::new(43.4345, -79.7094)
    }

    fn window() -> TimeWindow {
        TimeWindow::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 1, 23, 59, 0).unwrap(),
        )
    }

    /// A record `meters` due north of the center, `minute` minutes into the window.
    fn record_at(entity: &str, meters: f64, minute: i64) -> LocationRecord {
        LocationRecord {
            entity_id: entity.to_string(),
            latitude: center().latitude + meters / METERS_PER_DEGREE_LAT,
            longitude: center().longitude,
            date_time: window().from + Duration::minutes(minute),
        }
    }

    #[derive(Default)]
    struct ScriptedSource {
        history: HashMap<String, Vec<LocationRecord>>,
        calls: AtomicUsize,
        batches: Mutex<Vec<Vec<String>>>,
        pause_on_call: Option<usize>,
        fail_on_call: Option<usize>,
        reached: Notify,
        release: Notify,
    }

    impl ScriptedSource {
        fn with(history: Vec<(&str, Vec<LocationRecord>)>) -> Self {
            Self {
                history: history.into_iter().map(|(id, r)| (id.to_string(), r)).collect(),
                ..Self::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RemoteSource for ScriptedSource {
        async fn fetch_location_history(
            &self,
            requests: &[HistoryRequest],
            _session: &Session,
        ) -> Result<Vec<Vec<LocationRecord>>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.batches
                .lock()
                .unwrap()
                .push(requests.iter().map(|r| r.entity_id.clone()).collect());
            if self.fail_on_call == Some(call) {
                return Err(ProximityError::Transport("HTTP 503 Service Unavailable".into()));
            }
            if self.pause_on_call == Some(call) {
                self.reached.notify_one();
                self.release.notified().await;
            }
            Ok(requests
                .iter()
                .map(|r| {
                    self.history
                        .get(&r.entity_id)
                        .map(|records| records.iter().take(r.results_limit).cloned().collect())
                        .unwrap_or_default()
                })
                .collect())
        }

        async fn fetch_devices(&self, _filter: &DeviceFilter, _session: &Session) -> Result<Vec<Entity>> {
            Ok(Vec::new())
        }

        async fn geocode(&self, _address: &str, _session: &Session) -> Result<Option<Coordinate>> {
            Ok(None)
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        resets: AtomicUsize,
        hits: Mutex<Vec<ProximityHit>>,
        truncated: Mutex<Vec<String>>,
    }

    impl ReportSink for RecordingSink {
        fn reset(&self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
            self.hits.lock().unwrap().clear();
        }

        fn on_hit(&self, hit: &ProximityHit) {
            self.hits.lock().unwrap().push(hit.clone());
        }

        fn on_truncated(&self, entity_name: &str) {
            self.truncated.lock().unwrap().push(entity_name.to_string());
        }
    }

    fn engine(source: Arc<ScriptedSource>, sink: Arc<dyn ReportSink>, workers: usize) -> ProximityEngine {
        ProximityEngine::new(
            source,
            Session::new("test-session"),
            sink,
            EngineConfig::default().with_workers(workers),
        )
    }

    fn directory(names: &[(&str, &str)]) -> EntityDirectory {
        EntityDirectory::new(names.iter().map(|(id, name)| Entity {
            id: id.to_string(),
            name: name.to_string(),
        }))
    }

    fn spec(ids: &[&str]) -> QuerySpec {
        QuerySpec::new(center(), window(), ids.iter().map(|s| s.to_string()).collect())
            .with_radius(1250.0)
    }

    /// Six entities, each with one record inside the radius.
    fn six_nearby() -> ScriptedSource {
        ScriptedSource::with(
            ["e1", "e2", "e3", "e4", "e5", "e6"]
                .iter()
                .enumerate()
                .map(|(i, id)| (*id, vec![record_at(id, 100.0 * (i + 1) as f64, i as i64)]))
                .collect(),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_end_to_end_single_hit() {
        let source = Arc::new(ScriptedSource::with(vec![
            ("A", vec![record_at("A", 800.0, 5), record_at("A", 2000.0, 10)]),
            ("B", vec![record_at("B", 5000.0, 7)]),
        ]));
        let sink = Arc::new(RecordingSink::default());
        let engine = engine(source.clone(), sink.clone(), 4);

        let handle = engine
            .start_run(spec(&["A", "B"]), directory(&[("A", "Truck A"), ("B", "Truck B")]))
            .await
            .unwrap();
        let summary = engine.await_completion(&handle).await.unwrap();

        assert_eq!(summary.total_hits, 1);
        assert!(!summary.cancelled);
        assert!(summary.truncated_entity_names.is_empty());
        assert_eq!(summary.records_scanned, 3);
        assert_eq!(source.calls(), 1);
        assert_eq!(sink.resets.load(Ordering::SeqCst), 1);

        let hits = sink.hits.lock().unwrap().clone();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entity_name, "Truck A");
        assert!((hits[0].distance_m - 800.0).abs() < 1.0, "got {}", hits[0].distance_m);
        assert_eq!(handle.hits(), hits);
        assert_eq!(engine.state().await, EngineState::Completed);
    }

    #[tokio::test]
    async fn test_first_qualifying_record_is_reported_once() {
        let source = Arc::new(ScriptedSource::with(vec![(
            "A",
            vec![
                record_at("A", 2000.0, 0),
                record_at("A", 900.0, 1),
                record_at("A", 300.0, 2),
            ],
        )]));
        let engine = engine(source, Arc::new(NullSink), 3);

        let handle = engine.start_run(spec(&["A", "A"]), EntityDirectory::default()).await.unwrap();
        let summary = handle.wait().await.unwrap();

        assert_eq!(summary.total_hits, 1);
        let hits = handle.hits();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entity_name, "A");
        assert!((hits[0].distance_m - 900.0).abs() < 1.0);
    }

    #[tokio::test]
    async fn test_outcome_independent_of_worker_count() {
        let mut summaries = Vec::new();
        for workers in [1, 2, 7] {
            let source = Arc::new(six_nearby());
            let engine = engine(source, Arc::new(NullSink), workers);
            let ids = ["e1", "e2", "e3", "e4", "e5", "e6"];
            let handle = engine
                .start_run(spec(&ids).with_limits(100, 4), EntityDirectory::default())
                .await
                .unwrap();
            let summary = handle.wait().await.unwrap();
            let names: Vec<String> = handle.hits().into_iter().map(|h| h.entity_name).collect();
            summaries.push((summary.total_hits, summary.chunks_completed, names));
        }
        assert!(summaries.iter().all(|s| *s == summaries[0]));
        assert_eq!(summaries[0].0, 6);
        assert_eq!(summaries[0].1, 2);
        assert_eq!(summaries[0].2, vec!["e1", "e2", "e3", "e4", "e5", "e6"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_truncation_at_cap() {
        let mut capped: Vec<LocationRecord> = (0..50_000).map(|i| record_at("A", 9000.0, i % 1000)).collect();
        capped[42] = record_at("A", 100.0, 3);
        let below: Vec<LocationRecord> = (0..49_999).map(|i| record_at("B", 9000.0, i % 1000)).collect();
        let source = Arc::new(ScriptedSource::with(vec![("A", capped), ("B", below)]));
        let sink = Arc::new(RecordingSink::default());
        let engine = engine(source, sink.clone(), 4);

        let handle = engine
            .start_run(spec(&["A", "B"]), directory(&[("A", "Truck A"), ("B", "Truck B")]))
            .await
            .unwrap();
        let summary = handle.wait().await.unwrap();

        assert_eq!(summary.truncated_entity_names, vec!["Truck A".to_string()]);
        assert_eq!(*sink.truncated.lock().unwrap(), vec!["Truck A".to_string()]);
        assert_eq!(summary.total_hits, 1);
        assert_eq!(summary.records_scanned, 99_999);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_after_first_chunk() {
        let mut source = six_nearby();
        source.pause_on_call = Some(2);
        let source = Arc::new(source);
        let engine = engine(source.clone(), Arc::new(NullSink), 2);

        let ids = ["e1", "e2", "e3", "e4", "e5", "e6"];
        let handle = engine
            .start_run(spec(&ids).with_limits(100, 2), EntityDirectory::default())
            .await
            .unwrap();

        // Chunk 1 is done once chunk 2's fetch is in flight.
        source.reached.notified().await;
        engine.cancel(&handle);
        handle.cancel();
        source.release.notify_one();

        let summary = handle.wait().await.unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.total_hits, 2);
        assert_eq!(summary.chunks_completed, 1);
        assert_eq!(source.calls(), 2);
        assert!(matches!(handle.status(), RunStatus::Cancelled(_)));
        assert_eq!(engine.state().await, EngineState::Cancelled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_transport_failure_keeps_emitted_hits() {
        let mut source = six_nearby();
        source.fail_on_call = Some(2);
        let source = Arc::new(source);
        let sink = Arc::new(RecordingSink::default());
        let engine = engine(source.clone(), sink.clone(), 2);

        let ids = ["e1", "e2", "e3", "e4", "e5", "e6"];
        let handle = engine
            .start_run(spec(&ids).with_limits(100, 2), EntityDirectory::default())
            .await
            .unwrap();

        match handle.wait().await {
            Err(ProximityError::RunFailed(message)) => assert!(message.contains("503")),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(source.calls(), 2);
        assert_eq!(handle.hits().len(), 2);
        assert_eq!(sink.hits.lock().unwrap().len(), 2);
        assert_eq!(engine.state().await, EngineState::Failed);
    }

    #[tokio::test]
    async fn test_validation_error_leaves_engine_idle() {
        let source = Arc::new(six_nearby());
        let sink = Arc::new(RecordingSink::default());
        let engine = engine(source.clone(), sink.clone(), 2);

        let err = engine.start_run(spec(&[]), EntityDirectory::default()).await.err();
        assert!(matches!(err, Some(ProximityError::Validation(_))));
        assert_eq!(engine.state().await, EngineState::Idle);
        assert!(engine.current().await.is_none());
        assert_eq!(source.calls(), 0);
        assert_eq!(sink.resets.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_progress_sees_every_hit_in_chunk_order() {
        let source = Arc::new(six_nearby());
        let engine = engine(source, Arc::new(NullSink), 2);
        let ids = ["e1", "e2", "e3", "e4", "e5", "e6"];
        let handle = engine
            .start_run(spec(&ids).with_limits(100, 2), EntityDirectory::default())
            .await
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener = engine.on_progress(&handle, move |hit| sink.lock().unwrap().push(hit.entity_name));

        let summary = handle.wait().await.unwrap();
        listener.await.unwrap();
        assert_eq!(summary.total_hits, 6);
        assert_eq!(*seen.lock().unwrap(), vec!["e1", "e2", "e3", "e4", "e5", "e6"]);

        // Subscribing after the run still yields the full backlog.
        let (backlog, mut rx) = handle.subscribe();
        assert_eq!(backlog.len(), 6);
        assert!(rx.recv().await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_progress_listener_gets_every_hit() {
        let mut source = six_nearby();
        source.pause_on_call = Some(1);
        let source = Arc::new(source);
        let config = EngineConfig {
            progress_capacity: 1,
            ..EngineConfig::default().with_workers(2)
        };
        let engine = ProximityEngine::new(source.clone(), Session::anonymous(), Arc::new(NullSink), config);
        let ids = ["e1", "e2", "e3", "e4", "e5", "e6"];
        let handle = engine
            .start_run(spec(&ids).with_limits(100, 3), EntityDirectory::default())
            .await
            .unwrap();

        source.reached.notified().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener = engine.on_progress(&handle, move |hit| {
            std::thread::sleep(std::time::Duration::from_millis(20));
            sink.lock().unwrap().push(hit.entity_name);
        });
        source.release.notify_one();

        let summary = handle.wait().await.unwrap();
        listener.await.unwrap();
        assert_eq!(summary.total_hits, 6);
        assert_eq!(*seen.lock().unwrap(), vec!["e1", "e2", "e3", "e4", "e5", "e6"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panicking_progress_callback_surfaces_as_join_error() {
        let source = Arc::new(six_nearby());
        let engine = engine(source, Arc::new(NullSink), 2);
        let handle = engine
            .start_run(spec(&["e1", "e2"]), EntityDirectory::default())
            .await
            .unwrap();
        let listener = engine.on_progress(&handle, |_hit| panic!("caption renderer failed"));

        let summary = handle.wait().await.unwrap();
        assert_eq!(summary.total_hits, 2);
        assert!(listener.await.unwrap_err().is_panic());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_new_run_supersedes_active_run() {
        let mut source = six_nearby();
        source.pause_on_call = Some(1);
        let source = Arc::new(source);
        let sink = Arc::new(RecordingSink::default());
        let engine = Arc::new(engine(source.clone(), sink.clone(), 2));

        let first = engine.start_run(spec(&["e1", "e2"]), EntityDirectory::default()).await.unwrap();
        source.reached.notified().await;

        let next = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.start_run(spec(&["e3"]), EntityDirectory::default()).await })
        };
        while !first.is_cancel_requested() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        source.release.notify_one();
        let second = next.await.unwrap().unwrap();

        let first_summary = first.wait().await.unwrap();
        assert!(first_summary.cancelled);
        assert_eq!(first_summary.total_hits, 0);

        let second_summary = second.wait().await.unwrap();
        assert!(!second_summary.cancelled);
        assert_eq!(second_summary.total_hits, 1);
        assert_eq!(sink.resets.load(Ordering::SeqCst), 2);
        assert_eq!(engine.current().await.map(|h| h.id()), Some(second.id()));
    }

    #[test]
    fn test_first_per_span_picks_lowest_index() {
        let spans = vec![0..3, 3..3, 3..5];
        let within = vec![
            Within { index: 4, distance_m: 1.0 },
            Within { index: 2, distance_m: 2.0 },
            Within { index: 1, distance_m: 3.0 },
            Within { index: 3, distance_m: 4.0 },
        ];
        let first = first_per_span(&spans, within);
        assert_eq!(first[0].map(|w| w.index), Some(1));
        assert_eq!(first[1], None);
        assert_eq!(first[2].map(|w| w.index), Some(3));
    }
}
