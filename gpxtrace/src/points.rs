//! Storage representation of track points and bounding boxes.
//!
//! Coordinates are persisted as `i32` fixed-point degrees scaled by 10^7 so
//! MIN/MAX aggregates never see floating-point drift.

use crate::gpx::DecodedPoint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fixed-point scale for stored coordinates.
pub const SCALE: f64 = 10_000_000.0;

/// Convert degrees to fixed-point storage units.
#[inline]
pub fn to_fixed(degrees: f64) -> i32 {
    (degrees * SCALE).round() as i32
}

/// Convert fixed-point storage units back to degrees.
#[inline]
pub fn from_fixed(fixed: i32) -> f64 {
    fixed as f64 / SCALE
}

/// A point ready for bulk insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredPoint {
    pub trace_id: i64,
    pub latitude: i32,
    pub longitude: i32,
    pub altitude: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub segment: u32,
    /// QuadTile index used for spatial lookups.
    pub tile: u32,
}

impl StoredPoint {
    /// Pure transform from a decoded point. Runs every derived-field rule.
    pub fn from_decoded(trace_id: i64, point: &DecodedPoint) -> Self {
        Self {
            trace_id,
            latitude: to_fixed(point.latitude),
            longitude: to_fixed(point.longitude),
            altitude: point.altitude,
            timestamp: point.timestamp,
            segment: point.segment,
            tile: tile_for_point(point.latitude, point.longitude),
        }
    }

    pub fn lat(&self) -> f64 {
        from_fixed(self.latitude)
    }

    pub fn lon(&self) -> f64 {
        from_fixed(self.longitude)
    }
}

// ============================================================================
// QuadTile
// ============================================================================

/// QuadTile index of a coordinate: 16-bit x/y grid cells, bits interleaved.
pub fn tile_for_point(lat: f64, lon: f64) -> u32 {
    let x = ((lon + 180.0) * 65535.0 / 360.0).round() as u32;
    let y = ((lat + 90.0) * 65535.0 / 180.0).round() as u32;
    tile_for_xy(x, y)
}

fn tile_for_xy(x: u32, y: u32) -> u32 {
    let mut tile = 0u32;
    for i in (0..16).rev() {
        tile = (tile << 1) | ((x >> i) & 1);
        tile = (tile << 1) | ((y >> i) & 1);
    }
    tile
}

// ============================================================================
// Bounds
// ============================================================================

/// Bounding box in fixed-point storage units, as returned by aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedBounds {
    pub min_lat: i32,
    pub min_lon: i32,
    pub max_lat: i32,
    pub max_lon: i32,
}

impl FixedBounds {
    pub fn to_degrees(&self) -> Bounds {
        Bounds {
            min_lat: from_fixed(self.min_lat),
            min_lon: from_fixed(self.min_lon),
            max_lat: from_fixed(self.max_lat),
            max_lon: from_fixed(self.max_lon),
        }
    }
}

/// Bounding box in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

impl Bounds {
    /// In-memory equivalent of the storage aggregate, after fixed-point rounding.
    pub fn from_points(points: &[DecodedPoint]) -> Option<Self> {
        let mut iter = points
            .iter()
            .map(|p| (to_fixed(p.latitude), to_fixed(p.longitude)));
        let (lat, lon) = iter.next()?;
        let fixed = iter.fold(
            FixedBounds {
                min_lat: lat,
                min_lon: lon,
                max_lat: lat,
                max_lon: lon,
            },
            |b, (lat, lon)| FixedBounds {
                min_lat: b.min_lat.min(lat),
                min_lon: b.min_lon.min(lon),
                max_lat: b.max_lat.max(lat),
                max_lon: b.max_lon.max(lon),
            },
        );
        Some(fixed.to_degrees())
    }

    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        (self.min_lat..=self.max_lat).contains(&lat) && (self.min_lon..=self.max_lon).contains(&lon)
    }
}
