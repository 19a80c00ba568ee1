use std::ops::Range;
use std::sync::Arc;

use crate::errors::{ProximityError, Result};
use crate::geo::distance;
use crate::metrics::get_metrics_collector;
use crate::model::{Coordinate, LocationRecord};

/// Anything with a position the filter can measure.
pub trait Located {
    fn coordinate(&self) -> Coordinate;
}

impl Located for Coordinate {
    fn coordinate(&self) -> Coordinate {
        *self
    }
}

impl Located for LocationRecord {
    fn coordinate(&self) -> Coordinate {
        LocationRecord::coordinate(self)
    }
}

/// A point that passed the filter: its index in the input and its distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Within {
    pub index: usize,
    pub distance_m: f64,
}

/// Keeps points strictly closer than `radius_m` to `center`.
#[derive(Debug, Clone, Copy)]
pub struct DistanceFilter {
    center: Coordinate,
    radius_m: f64,
}

impl DistanceFilter {
    pub fn new(center: Coordinate, radius_m: f64) -> Self {
        Self { center, radius_m }
    }

    /// Distance to `point` if it is inside the radius. NaN never passes.
    pub fn measure(&self, point: Coordinate) -> Option<f64> {
        let d = distance(self.center, point);
        (d < self.radius_m).then_some(d)
    }

    /// Sequential filter, output in input order.
    pub fn filter<T: Located>(&self, points: &[T]) -> Vec<Within> {
        self.filter_range(points, 0..points.len())
    }

    fn filter_range<T: Located>(&self, points: &[T], range: Range<usize>) -> Vec<Within> {
        points[range.clone()]
            .iter()
            .zip(range)
            .filter_map(|(point, index)| {
                self.measure(point.coordinate())
                    .map(|distance_m| Within { index, distance_m })
            })
            .collect()
    }

    /// Splits `points` into at most `workers` contiguous partitions, filters
    /// each on the blocking pool and concatenates the results. Every point is
    /// measured exactly once; callers must not rely on output order.
    pub async fn filter_partitioned<T>(&self, points: Arc<[T]>, workers: usize) -> Result<Vec<Within>>
    where
        T: Located + Send + Sync + 'static,
    {
        let _measurement = crate::measure_operation!("filter.partitioned");
        let partitions = partition(points.len(), workers);
        get_metrics_collector().track_metric("filter.partitions", partitions.len() as f64);

        if partitions.len() <= 1 {
            return Ok(self.filter(&points[..]));
        }

        let tasks = partitions.into_iter().map(|range| {
            let filter = *self;
            let points = Arc::clone(&points);
            tokio::task::spawn_blocking(move || filter.filter_range(&points[..], range))
        });

        let parts = futures::future::try_join_all(tasks)
            .await
            .map_err(|e| ProximityError::Worker(e.to_string()))?;

        Ok(parts.into_iter().flatten().collect())
    }
}

/// Contiguous, non-overlapping ranges covering `0..len`, at most `workers` of them.
pub fn partition(len: usize, workers: usize) -> Vec<Range<usize>> {
    let parts = workers.max(1).min(len);
    if parts == 0 {
        return Vec::new();
    }
    let base = len / parts;
    let extra = len % parts;
    let mut start = 0;
    (0..parts)
        .map(|i| {
            let size = base + usize::from(i < extra);
            let range = start..start + size;
            start += size;
            range
        })
        .collect()
}
