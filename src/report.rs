use std::sync::Mutex;

use crate::defaults::RECORD_CAP;
use crate::geo::DistanceUnit;
use crate::model::{ProximityHit, RunSummary};

const CSV_HEADER: &str = "DeviceID, Date, Time, Latitude, Longitude\n";

/// Receives engine output as it happens. Called only from the run controller.
pub trait ReportSink: Send + Sync {
    /// A new run is starting; drop anything from the previous one.
    fn reset(&self);

    fn on_hit(&self, hit: &ProximityHit);

    fn on_truncated(&self, _entity_name: &str) {}
}

/// Discards everything.
pub struct NullSink;

impl ReportSink for NullSink {
    fn reset(&self) {}

    fn on_hit(&self, _hit: &ProximityHit) {}
}

#[derive(Default)]
struct ReportState {
    rows: Vec<String>,
    truncated: Vec<String>,
}

/// Collects hits into CSV rows and renders the end-of-run message.
pub struct ReportBuilder {
    unit: DistanceUnit,
    record_cap: usize,
    state: Mutex<ReportState>,
}

impl ReportBuilder {
    pub fn new(unit: DistanceUnit) -> Self {
        Self {
            unit,
            record_cap: RECORD_CAP,
            state: Mutex::new(ReportState::default()),
        }
    }

    pub fn with_record_cap(mut self, record_cap: usize) -> Self {
        self.record_cap = record_cap;
        self
    }

    pub fn csv(&self) -> String {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = String::from(CSV_HEADER);
        for row in &state.rows {
            out.push_str(row);
            out.push('\n');
        }
        out
    }

    /// Names flagged as possibly truncated during the current run.
    pub fn truncated(&self) -> Vec<String> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).truncated.clone()
    }

    pub fn row_count(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).rows.len()
    }

    /// "Truck 1 was 800 m away on 2026-03-01 at 10:15:00". Whole meters or
    /// yards, rounded down; never switched to km or mi.
    pub fn hit_caption(&self, hit: &ProximityHit) -> String {
        format!(
            "{} was {} {} away on {} at {}",
            hit.entity_name,
            self.unit.convert(hit.distance_m).floor(),
            self.unit.short_label(),
            hit.record.date_time.format("%Y-%m-%d"),
            hit.record.date_time.format("%H:%M:%S"),
        )
    }

    pub fn summary_message(&self, summary: &RunSummary, address: &str) -> String {
        let mut message = if summary.cancelled {
            "The operation was cancelled.".to_string()
        } else if summary.total_hits > 0 {
            format!(
                "There were {} locations recorded nearby to {}.",
                summary.total_hits, address
            )
        } else {
            "There was no one near this area during this time frame.".to_string()
        };
        if !summary.truncated_entity_names.is_empty() {
            message.push_str(&format!(
                "\n* {} was limited to {} GPS positions, try narrowing date range to see all positions.",
                summary.truncated_entity_names.join(","),
                self.record_cap
            ));
        }
        message
    }
}

impl ReportSink for ReportBuilder {
    fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.rows.clear();
        state.truncated.clear();
    }

    fn on_hit(&self, hit: &ProximityHit) {
        let row = [
            csv_field(&hit.entity_name),
            hit.record.date_time.format("%Y-%m-%d").to_string(),
            hit.record.date_time.format("%H:%M:%S").to_string(),
            hit.record.latitude.to_string(),
            hit.record.longitude.to_string(),
        ]
        .join(", ");
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .rows
            .push(row);
    }

    fn on_truncated(&self, entity_name: &str) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .truncated
            .push(entity_name.to_string());
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
