use std::sync::Arc;

use crate::errors::{ProximityError, Result};
use crate::metrics::get_metrics_collector;
use crate::model::{LocationRecord, TimeWindow};
use crate::source::{HistoryRequest, RemoteSource, Session};

/// One entity's slice of a batched fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityBatch {
    pub entity_id: String,
    pub records: Vec<LocationRecord>,
    /// Heuristic: set when exactly `record_cap` records came back. The remote
    /// source has no "has more" flag, so this means "may have been cut off",
    /// not "definitely incomplete".
    pub truncated: bool,
}

/// Pages entity history from the remote source, one batched call per chunk.
pub struct BatchFetcher {
    source: Arc<dyn RemoteSource>,
    session: Session,
    record_cap: usize,
    chunk_size: usize,
}

impl BatchFetcher {
    pub fn new(source: Arc<dyn RemoteSource>, session: Session, record_cap: usize, chunk_size: usize) -> Self {
        Self {
            source,
            session,
            record_cap: record_cap.max(1),
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn record_cap(&self) -> usize {
        self.record_cap
    }

    /// `ceil(len / chunk_size)` chunks, in list order.
    pub fn chunks<'a>(&self, entity_ids: &'a [String]) -> std::slice::Chunks<'a, String> {
        entity_ids.chunks(self.chunk_size)
    }

    /// Issues a single batched call for `entity_ids`. Transport failures abort
    /// the whole chunk; there is no per-entity error.
    pub async fn fetch_chunk(&self, entity_ids: &[String], window: &TimeWindow) -> Result<Vec<EntityBatch>> {
        let _measurement = crate::measure_operation!("fetcher.fetch_chunk");
        let requests: Vec<HistoryRequest> = entity_ids
            .iter()
            .map(|id| HistoryRequest::new(id.clone(), window, self.record_cap))
            .collect();
        get_metrics_collector().track_metric("fetcher.batch_size", requests.len() as f64);

        let results = self
            .source
            .fetch_location_history(&requests, &self.session)
            .await?;
        if results.len() != requests.len() {
            return Err(ProximityError::MisalignedBatch {
                expected: requests.len(),
                actual: results.len(),
            });
        }

        let batches: Vec<EntityBatch> = requests
            .into_iter()
            .zip(results)
            .map(|(request, records)| self.to_batch(request.entity_id, records))
            .collect();

        let truncated = batches.iter().filter(|b| b.truncated).count();
        get_metrics_collector().track_metric("fetcher.truncated", truncated as f64);
        Ok(batches)
    }

    /// Single-entity convenience over [`fetch_chunk`](Self::fetch_chunk).
    pub async fn fetch(&self, entity_id: &str, window: &TimeWindow) -> Result<EntityBatch> {
        let mut batches = self.fetch_chunk(&[entity_id.to_string()], window).await?;
        batches.pop().ok_or(ProximityError::MisalignedBatch { expected: 1, actual: 0 })
    }

    fn to_batch(&self, entity_id: String, mut records: Vec<LocationRecord>) -> EntityBatch {
        if records.len() > self.record_cap {
            tracing::warn!(
                entity = %entity_id,
                returned = records.len(),
                record_cap = self.record_cap,
                "Source exceeded the record cap; dropping the excess"
            );
            records.truncate(self.record_cap);
        }
        let truncated = records.len() == self.record_cap;
        EntityBatch {
            entity_id,
            records,
            truncated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Coordinate, Entity};
    use crate::source::DeviceFilter;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone, Utc};
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Returns `per_entity` records for every request (clamped to the limit)
    /// and remembers each batch it was asked for.
    struct Recording {
        per_entity: usize,
        calls: Mutex<Vec<Vec<String>>>,
        short_by: usize,
    }

    impl Recording {
        fn new(per_entity: usize) -> Self {
            Self { per_entity, calls: Mutex::new(Vec::new()), short_by: 0 }
        }
    }

    #[async_trait]
    impl RemoteSource for Recording {
        async fn fetch_location_history(
            &self,
            requests: &[HistoryRequest],
            _session: &Session,
        ) -> Result<Vec<Vec<LocationRecord>>> {
            self.calls
                .lock()
                .unwrap()
                .push(requests.iter().map(|r| r.entity_id.clone()).collect());
            let results = requests
                .iter()
                .map(|r| {
                    (0..self.per_entity.min(r.results_limit))
                        .map(|i| LocationRecord {
                            entity_id: r.entity_id.clone(),
                            latitude: 43.0,
                            longitude: -79.0,
                            date_time: r.from + Duration::seconds(i as i64),
                        })
                        .collect()
                })
                .collect::<Vec<_>>();
            Ok(results[..results.len() - self.short_by.min(results.len())].to_vec())
        }

        async fn fetch_devices(&self, _filter: &DeviceFilter, _session: &Session) -> Result<Vec<Entity>> {
            Ok(Vec::new())
        }

        async fn geocode(&self, _address: &str, _session: &Session) -> Result<Option<Coordinate>> {
            Ok(None)
        }
    }

    fn window() -> TimeWindow {
        TimeWindow::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap(),
        )
    }

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("b{i}")).collect()
    }

    #[test]
    fn test_chunk_count_and_coverage() {
        let fetcher = BatchFetcher::new(Arc::new(Recording::new(0)), Session::anonymous(), 10, 400);
        for len in [1, 399, 400, 401, 1200, 1201] {
            let list = ids(len);
            let chunks: Vec<_> = fetcher.chunks(&list).collect();
            assert_eq!(chunks.len(), len.div_ceil(400));
            let flattened: Vec<String> = chunks.concat();
            assert_eq!(flattened, list);
            assert_eq!(flattened.iter().collect::<HashSet<_>>().len(), len);
        }
    }

    #[tokio::test]
    async fn test_one_batched_call_per_chunk() {
        let source = Arc::new(Recording::new(3));
        let fetcher = BatchFetcher::new(source.clone(), Session::anonymous(), 10, 2);
        let list = ids(5);
        for chunk in fetcher.chunks(&list) {
            let batches = fetcher.fetch_chunk(chunk, &window()).await.unwrap();
            assert_eq!(batches.len(), chunk.len());
        }
        let calls = source.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2], vec!["b4".to_string()]);
    }

    #[tokio::test]
    async fn test_truncation_is_count_equals_cap() {
        let fetcher = BatchFetcher::new(Arc::new(Recording::new(5)), Session::anonymous(), 5, 400);
        let at_cap = fetcher.fetch("b1", &window()).await.unwrap();
        assert_eq!(at_cap.records.len(), 5);
        assert!(at_cap.truncated);

        let fetcher = BatchFetcher::new(Arc::new(Recording::new(4)), Session::anonymous(), 5, 400);
        let below_cap = fetcher.fetch("b1", &window()).await.unwrap();
        assert_eq!(below_cap.records.len(), 4);
        assert!(!below_cap.truncated);
    }

    #[tokio::test]
    async fn test_misaligned_batch_is_an_error() {
        let mut source = Recording::new(1);
        source.short_by = 1;
        let fetcher = BatchFetcher::new(Arc::new(source), Session::anonymous(), 5, 400);
        let err = fetcher.fetch_chunk(&ids(3), &window()).await.unwrap_err();
        assert_eq!(err, ProximityError::MisalignedBatch { expected: 3, actual: 2 });
    }
}
