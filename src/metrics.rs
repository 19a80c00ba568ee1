use std::collections::BTreeMap;
use std::sync::{Mutex, OnceLock};

use serde::Serialize;

/// Last value and running total for one named metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MetricValue {
    pub last: f64,
    pub total: f64,
    pub samples: u64,
}

/// Thread-safe collector for engine counters and timings
#[derive(Default)]
pub struct MetricsCollector {
    values: Mutex<BTreeMap<String, MetricValue>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a simple metric value
    pub fn track_metric(&self, name: &str, value: f64) {
        tracing::debug!("Metric {}: {}", name, value);
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        let entry = values.entry(name.to_string()).or_default();
        entry.last = value;
        entry.total += value;
        entry.samples += 1;
    }

    pub fn get(&self, name: &str) -> Option<MetricValue> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.get(name).copied()
    }

    pub fn snapshot(&self) -> BTreeMap<String, MetricValue> {
        self.values.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn clear(&self) {
        self.values.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// Global metrics collector instance
pub static METRICS_COLLECTOR: OnceLock<MetricsCollector> = OnceLock::new();

/// Get the global metrics collector
pub fn get_metrics_collector() -> &'static MetricsCollector {
    METRICS_COLLECTOR.get_or_init(MetricsCollector::new)
}

/// Records `<name>_duration_ms` when the returned guard is dropped.
#[macro_export]
macro_rules! measure_operation {
    ($operation_name:expr) => {{
        struct OperationTimer {
            start: std::time::Instant,
            name: &'static str,
        }

        impl Drop for OperationTimer {
            fn drop(&mut self) {
                let duration = self.start.elapsed().as_secs_f64() * 1000.0;
                $crate::metrics::get_metrics_collector()
                    .track_metric(&format!("{}_duration_ms", self.name), duration);
            }
        }

        OperationTimer {
            start: std::time::Instant::now(),
            name: $operation_name,
        }
    }};
}
