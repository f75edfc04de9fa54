//! Zone geometry and deterministic spatial sampling.
//!
//! A zone polygon is turned into a rectangular lattice over its bounding box,
//! filtered by point-in-polygon containment. The same polygon and resolution
//! always yield the same grid, in the same order.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

use crate::error::{CoreError, CoreResult};

/// A WGS84 coordinate in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// A simple closed ring with at least three distinct vertices.
///
/// The ring is stored open: a repeated closing vertex is dropped on
/// construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<GeoPoint>", into = "Vec<GeoPoint>")]
pub struct GeoPolygon {
    vertices: Vec<GeoPoint>,
}

impl GeoPolygon {
    pub fn new(mut vertices: Vec<GeoPoint>) -> CoreResult<Self> {
        if vertices.iter().any(|p| !p.lat.is_finite() || !p.lon.is_finite()) {
            return Err(CoreError::InvalidPolygon("non-finite coordinate".into()));
        }

        if vertices.len() > 1 && vertices.first() == vertices.last() {
            vertices.pop();
        }

        let mut distinct: Vec<GeoPoint> = Vec::with_capacity(vertices.len());
        for v in &vertices {
            if !distinct.contains(v) {
                distinct.push(*v);
            }
        }
        if distinct.len() < 3 {
            return Err(CoreError::InvalidPolygon(format!(
                "need at least 3 distinct vertices, got {}",
                distinct.len()
            )));
        }

        Ok(Self { vertices })
    }

    pub fn vertices(&self) -> &[GeoPoint] {
        &self.vertices
    }

    /// `(min, max)` corners of the bounding box.
    pub fn bounding_box(&self) -> (GeoPoint, GeoPoint) {
        let mut min = GeoPoint::new(f64::INFINITY, f64::INFINITY);
        let mut max = GeoPoint::new(f64::NEG_INFINITY, f64::NEG_INFINITY);
        for v in &self.vertices {
            min.lat = min.lat.min(v.lat);
            min.lon = min.lon.min(v.lon);
            max.lat = max.lat.max(v.lat);
            max.lon = max.lon.max(v.lon);
        }
        (min, max)
    }

    /// Even-odd ray casting. Points exactly on an edge may fall either way.
    pub fn contains(&self, point: GeoPoint) -> bool {
        let n = self.vertices.len();
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let a = self.vertices[i];
            let b = self.vertices[j];
            if (a.lat > point.lat) != (b.lat > point.lat) {
                let lon_at = a.lon + (point.lat - a.lat) * (b.lon - a.lon) / (b.lat - a.lat);
                if point.lon < lon_at {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }

    /// Area-weighted centroid; falls back to the vertex mean for rings with
    /// (near) zero area.
    pub fn centroid(&self) -> GeoPoint {
        // Work relative to the first vertex to keep the cross products small.
        let origin = self.vertices[0];
        let n = self.vertices.len();
        let mut twice_area = 0.0;
        let mut cx = 0.0;
        let mut cy = 0.0;
        for i in 0..n {
            let a = self.vertices[i];
            let b = self.vertices[(i + 1) % n];
            let (ax, ay) = (a.lon - origin.lon, a.lat - origin.lat);
            let (bx, by) = (b.lon - origin.lon, b.lat - origin.lat);
            let cross = ax * by - bx * ay;
            twice_area += cross;
            cx += (ax + bx) * cross;
            cy += (ay + by) * cross;
        }

        if twice_area.abs() < 1e-14 {
            let len = n as f64;
            let lat = self.vertices.iter().map(|v| v.lat).sum::<f64>() / len;
            let lon = self.vertices.iter().map(|v| v.lon).sum::<f64>() / len;
            return GeoPoint::new(lat, lon);
        }

        GeoPoint::new(
            origin.lat + cy / (3.0 * twice_area),
            origin.lon + cx / (3.0 * twice_area),
        )
    }

    /// Identity used for caching: vertices rounded to `precision` decimals.
    pub fn cache_key(&self, precision: u32) -> String {
        let precision = precision as usize;
        let mut key = String::new();
        for (i, v) in self.vertices.iter().enumerate() {
            if i > 0 {
                key.push(';');
            }
            // Normalise -0.0 so that equal polygons share a key.
            let lat = v.lat + 0.0;
            let lon = v.lon + 0.0;
            let _ = write!(key, "{lat:.precision$},{lon:.precision$}");
        }
        key
    }
}

impl TryFrom<Vec<GeoPoint>> for GeoPolygon {
    type Error = CoreError;

    fn try_from(value: Vec<GeoPoint>) -> Result<Self, Self::Error> {
        GeoPolygon::new(value)
    }
}

impl From<GeoPolygon> for Vec<GeoPoint> {
    fn from(value: GeoPolygon) -> Self {
        value.vertices
    }
}

/// Interior sample points of a polygon. Never empty.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleGrid {
    points: Vec<GeoPoint>,
    centroid_fallback: bool,
}

impl SampleGrid {
    pub fn points(&self) -> &[GeoPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// True when the lattice was empty and the centroid stands in for it.
    pub fn is_centroid_fallback(&self) -> bool {
        self.centroid_fallback
    }

    /// Keep at most `max` points, evenly strided so the cover stays spread
    /// over the polygon. Deterministic.
    pub fn thin(mut self, max: usize) -> Self {
        let max = max.max(1);
        if self.points.len() > max {
            let len = self.points.len();
            self.points = (0..max).map(|i| self.points[i * len / max]).collect();
        }
        self
    }
}

/// Lattice over the bounding box at `resolution` degrees, filtered by
/// containment. Falls back to the centroid when no lattice point is inside.
pub fn sample_grid(polygon: &GeoPolygon, resolution: f64) -> CoreResult<SampleGrid> {
    if !resolution.is_finite() || resolution <= 0.0 {
        return Err(CoreError::InsufficientSamples);
    }

    let (min, max) = polygon.bounding_box();
    let cols = lattice_len(min.lon, max.lon, resolution)?;
    let rows = lattice_len(min.lat, max.lat, resolution)?;

    let mut points = Vec::new();
    for i in 0..cols {
        let lon = min.lon + i as f64 * resolution;
        for j in 0..rows {
            let candidate = GeoPoint::new(min.lat + j as f64 * resolution, lon);
            if polygon.contains(candidate) {
                points.push(candidate);
            }
        }
    }

    if points.is_empty() {
        return Ok(SampleGrid { points: vec![polygon.centroid()], centroid_fallback: true });
    }

    Ok(SampleGrid { points, centroid_fallback: false })
}

const MAX_LATTICE_SIDE: f64 = 10_000.0;

/// Number of steps `start + k * step < end`, like a half-open arange.
fn lattice_len(start: f64, end: f64, step: f64) -> CoreResult<usize> {
    let n = ((end - start) / step).ceil();
    if !n.is_finite() || n > MAX_LATTICE_SIDE {
        return Err(CoreError::InsufficientSamples);
    }
    Ok(n.max(0.0) as usize)
}
