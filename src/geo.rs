use serde::{Deserialize, Serialize};

use crate::defaults::{BAND_COUNT, EARTH_RADIUS_M};
use crate::model::Coordinate;

const YARDS_PER_METER: f64 = 1.09361;
const METERS_PER_KM: f64 = 1000.0;
const YARDS_PER_MILE: f64 = 1760.0;

/// Great-circle distance in meters (haversine, spherical Earth).
///
/// Invalid coordinates propagate as NaN.
pub fn distance(center: Coordinate, point: Coordinate) -> f64 {
    let lat1 = center.latitude.to_radians();
    let lat2 = point.latitude.to_radians();
    let d_lat = (center.latitude - point.latitude).to_radians();
    let d_lon = (center.longitude - point.longitude).to_radians();

    let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// Concentric display rings around the center. Purely cosmetic: the filter
/// only ever uses the outermost radius.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RadiusBands {
    pub unit_m: f64,
    pub count: u32,
}

impl RadiusBands {
    pub fn from_radius(radius_m: f64) -> Self {
        Self {
            unit_m: radius_m / BAND_COUNT as f64,
            count: BAND_COUNT,
        }
    }

    pub fn radii(&self) -> Vec<f64> {
        (1..=self.count).map(|i| self.unit_m * i as f64).collect()
    }

    pub fn outer(&self) -> f64 {
        self.unit_m * self.count as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceUnit {
    #[default]
    Metric,
    Imperial,
}

impl DistanceUnit {
    /// Meters to m or yd.
    pub fn convert(&self, meters: f64) -> f64 {
        match self {
            DistanceUnit::Metric => meters,
            DistanceUnit::Imperial => meters * YARDS_PER_METER,
        }
    }

    pub fn short_label(&self) -> &'static str {
        match self {
            DistanceUnit::Metric => "m",
            DistanceUnit::Imperial => "yd",
        }
    }
}

/// Human label for a distance: "1.3 km", "800 m", "1.5 mi", "400 yd".
pub fn format_distance(meters: f64, unit: DistanceUnit) -> String {
    let value = unit.convert(meters);
    match unit {
        DistanceUnit::Metric if value >= METERS_PER_KM => {
            format!("{:.1} km", value / METERS_PER_KM)
        }
        DistanceUnit::Imperial if value >= YARDS_PER_MILE => {
            format!("{:.1} mi", value / YARDS_PER_MILE)
        }
        _ => format!("{} {}", value.round(), unit.short_label()),
    }
}
