use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::defaults::{BAND_COUNT, CHUNK_SIZE, RECORD_CAP, UNIT_RADIUS_M};
use crate::errors::{ProximityError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// A tracked device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub name: String,
}

/// Display names for the entities of one query, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct EntityDirectory {
    entities: HashMap<String, Entity>,
}

impl EntityDirectory {
    pub fn new(entities: impl IntoIterator<Item = Entity>) -> Self {
        Self {
            entities: entities.into_iter().map(|e| (e.id.clone(), e)).collect(),
        }
    }

    /// Falls back to the id when the entity is unknown.
    pub fn name_of<'a>(&'a self, id: &'a str) -> &'a str {
        self.entities.get(id).map(|e| e.name.as_str()).unwrap_or(id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    #[serde(rename = "device")]
    pub entity_id: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(rename = "dateTime")]
    pub date_time: DateTime<Utc>,
}

impl LocationRecord {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProximityHit {
    pub record: LocationRecord,
    pub entity_name: String,
    pub distance_m: f64,
}

/// Half-open `[from, to)` time window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    pub fn contains(&self, at: &DateTime<Utc>) -> bool {
        self.from <= *at && *at < self.to
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySpec {
    pub center: Coordinate,
    /// Filter radius in meters; display bands are derived from it.
    pub radius_m: f64,
    pub window: TimeWindow,
    pub entity_ids: Vec<String>,
    pub record_cap: usize,
    pub chunk_size: usize,
}

impl QuerySpec {
    pub fn new(center: Coordinate, window: TimeWindow, entity_ids: Vec<String>) -> Self {
        Self {
            center,
            radius_m: UNIT_RADIUS_M * BAND_COUNT as f64,
            window,
            entity_ids,
            record_cap: RECORD_CAP,
            chunk_size: CHUNK_SIZE,
        }
    }

    pub fn with_radius(mut self, radius_m: f64) -> Self {
        self.radius_m = radius_m;
        self
    }

    pub fn with_unit_radius(self, unit_m: f64) -> Self {
        self.with_radius(unit_m * BAND_COUNT as f64)
    }

    pub fn with_limits(mut self, record_cap: usize, chunk_size: usize) -> Self {
        self.record_cap = record_cap;
        self.chunk_size = chunk_size;
        self
    }

    /// Checks every field and returns the spec with duplicate entity ids
    /// removed (first occurrence wins). All problems are reported together.
    pub fn validated(mut self) -> Result<Self> {
        let mut problems = Vec::new();
        if !self.center.is_valid() {
            problems.push("Please input an address".to_string());
        }
        if !(self.radius_m.is_finite() && self.radius_m > 0.0) {
            problems.push("Radius must be a positive number of meters".to_string());
        }
        if self.entity_ids.is_empty() {
            problems.push("Select at least one vehicle to display".to_string());
        }
        if self.window.from > self.window.to {
            problems.push("From date cannot be more than To date".to_string());
        }
        if self.record_cap == 0 {
            problems.push("Record cap must be at least 1".to_string());
        }
        if self.chunk_size == 0 {
            problems.push("Chunk size must be at least 1".to_string());
        }
        if !problems.is_empty() {
            return Err(ProximityError::Validation(problems));
        }

        let mut seen = HashSet::with_capacity(self.entity_ids.len());
        self.entity_ids.retain(|id| seen.insert(id.clone()));
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: Uuid,
    pub total_hits: usize,
    pub truncated_entity_names: Vec<String>,
    pub cancelled: bool,
    pub chunks_completed: usize,
    pub records_scanned: usize,
}
