use std::fmt;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{ProximityError, Result};
use crate::model::{Coordinate, Entity, LocationRecord, TimeWindow};

/// Opaque credentials handed to every remote call. The engine never looks inside.
#[derive(Clone)]
pub struct Session {
    token: Arc<str>,
}

impl Session {
    pub fn new(token: impl Into<String>) -> Self {
        let token: String = token.into();
        Self { token: Arc::from(token) }
    }

    pub fn anonymous() -> Self {
        Self::new("")
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Session(..)")
    }
}

/// One sub-request of a batched location-history call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRequest {
    pub entity_id: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub results_limit: usize,
}

impl HistoryRequest {
    pub fn new(entity_id: impl Into<String>, window: &TimeWindow, results_limit: usize) -> Self {
        Self {
            entity_id: entity_id.into(),
            from: window.from,
            to: window.to,
            results_limit,
        }
    }

    pub fn window(&self) -> TimeWindow {
        TimeWindow::new(self.from, self.to)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceFilter {
    /// Case-insensitive substring of the device name.
    #[serde(default)]
    pub name: Option<String>,
}

impl DeviceFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self { name: Some(name.into()) }
    }

    pub fn matches(&self, entity: &Entity) -> bool {
        match self.name.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(needle) => entity.name.to_lowercase().contains(&needle.to_lowercase()),
        }
    }
}

/// The remote location-history service.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Multi-call: one network round trip carrying every sub-request. The
    /// result is aligned 1:1 with `requests`; each entry is in time order and
    /// holds at most that request's `results_limit` records.
    async fn fetch_location_history(
        &self,
        requests: &[HistoryRequest],
        session: &Session,
    ) -> Result<Vec<Vec<LocationRecord>>>;

    async fn fetch_devices(&self, filter: &DeviceFilter, session: &Session) -> Result<Vec<Entity>>;

    async fn geocode(&self, address: &str, session: &Session) -> Result<Option<Coordinate>>;
}

fn coordinate_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^\s*(-?\d+(?:\.\d+)?)\s*,\s*(-?\d+(?:\.\d+)?)\s*$").ok())
        .as_ref()
}

/// Parses `"lat, lon"`. Zero components are rejected, as are out-of-range values.
pub fn parse_coordinate(input: &str) -> Option<Coordinate> {
    let captures = coordinate_pattern()?.captures(input)?;
    let latitude: f64 = captures.get(1)?.as_str().parse().ok()?;
    let longitude: f64 = captures.get(2)?.as_str().parse().ok()?;
    let coordinate = Coordinate::new(latitude, longitude);
    (latitude != 0.0 && longitude != 0.0 && coordinate.is_valid()).then_some(coordinate)
}

/// Turns user input into a query center: literal coordinates first, then the
/// remote geocoder.
pub async fn resolve_center(
    source: &dyn RemoteSource,
    session: &Session,
    address: &str,
) -> Result<Coordinate> {
    let address = address.trim();
    if address.is_empty() {
        return Err(ProximityError::validation("Please input an address"));
    }
    if let Some(coordinate) = parse_coordinate(address) {
        tracing::debug!("Using literal coordinates {:?}", coordinate);
        return Ok(coordinate);
    }
    match source.geocode(address, session).await? {
        Some(coordinate) => Ok(coordinate),
        None => Err(ProximityError::AddressNotFound(address.to_string())),
    }
}
