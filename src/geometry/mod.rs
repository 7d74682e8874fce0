//! Parcel geometry: well-known-text parsing, centroids, and great-circle
//! distance. Reprojection between coordinate reference systems lives in
//! [`crs`].

pub mod crs;

pub use crs::{Crs, LinearUnit};

use thiserror::Error;

/// A coordinate pair in whatever reference system the containing geometry
/// uses. `x` is easting/longitude, `y` is northing/latitude.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Xy {
    pub x: f64,
    pub y: f64,
}

/// A geographic WGS84 coordinate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

/// Parcel geometry in its source's native reference system.
#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Point(Xy),
    /// First ring is the exterior; any further rings are holes.
    Polygon(Vec<Vec<Xy>>),
    MultiPolygon(Vec<Vec<Vec<Xy>>>),
}

#[derive(Debug, Error)]
pub enum WktError {
    #[error("empty geometry text")]
    Empty,
    #[error("unsupported geometry type: {0}")]
    UnsupportedType(String),
    #[error("malformed geometry text: {0}")]
    Malformed(String),
}

impl Geometry {
    /// Parse a WKT string. Supports POINT, POLYGON, and MULTIPOLYGON.
    pub fn parse_wkt(text: &str) -> Result<Geometry, WktError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(WktError::Empty);
        }
        let open = trimmed
            .find('(')
            .ok_or_else(|| WktError::Malformed("no coordinate list".to_string()))?;
        let keyword = trimmed[..open].trim().to_uppercase();
        let body = trimmed[open..].trim();

        match keyword.as_str() {
            "POINT" => {
                let inner = strip_parens(body)?;
                Ok(Geometry::Point(parse_pair(inner)?))
            }
            "POLYGON" => Ok(Geometry::Polygon(parse_rings(strip_parens(body)?)?)),
            "MULTIPOLYGON" => {
                let inner = strip_parens(body)?;
                let mut polygons = Vec::new();
                for group in split_groups(inner)? {
                    polygons.push(parse_rings(strip_parens(group.trim())?)?);
                }
                Ok(Geometry::MultiPolygon(polygons))
            }
            other => Err(WktError::UnsupportedType(other.to_string())),
        }
    }

    /// Centroid in the geometry's native reference system.
    ///
    /// Polygons use the shoelace centroid of the exterior ring; degenerate
    /// rings fall back to the vertex mean. Multi-polygons area-weight their
    /// parts.
    pub fn centroid(&self) -> Xy {
        match self {
            Geometry::Point(p) => *p,
            Geometry::Polygon(rings) => ring_centroid(rings.first().map(|r| r.as_slice()).unwrap_or(&[])),
            Geometry::MultiPolygon(polygons) => {
                let mut weighted = Xy { x: 0.0, y: 0.0 };
                let mut total_area = 0.0;
                for rings in polygons {
                    let ring = match rings.first() {
                        Some(r) => r.as_slice(),
                        None => continue,
                    };
                    let area = ring_area(ring).abs();
                    let c = ring_centroid(ring);
                    weighted.x += c.x * area;
                    weighted.y += c.y * area;
                    total_area += area;
                }
                if total_area > f64::EPSILON {
                    Xy {
                        x: weighted.x / total_area,
                        y: weighted.y / total_area,
                    }
                } else {
                    // All parts degenerate: mean of every vertex.
                    let vertices: Vec<Xy> = polygons
                        .iter()
                        .flat_map(|rings| rings.iter().flatten().copied())
                        .collect();
                    vertex_mean(&vertices)
                }
            }
        }
    }
}

fn strip_parens(s: &str) -> Result<&str, WktError> {
    let s = s.trim();
    if !s.starts_with('(') || !s.ends_with(')') {
        return Err(WktError::Malformed(format!("expected parenthesized list, got {s:?}")));
    }
    Ok(&s[1..s.len() - 1])
}

/// Split a parenthesized list on top-level commas: `(a),(b)` -> `["(a)", "(b)"]`.
fn split_groups(s: &str) -> Result<Vec<&str>, WktError> {
    let mut groups = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, ch) in s.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| WktError::Malformed("unbalanced parentheses".to_string()))?;
            }
            ',' if depth == 0 => {
                groups.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(WktError::Malformed("unbalanced parentheses".to_string()));
    }
    groups.push(&s[start..]);
    Ok(groups)
}

fn parse_rings(inner: &str) -> Result<Vec<Vec<Xy>>, WktError> {
    let mut rings = Vec::new();
    for group in split_groups(inner)? {
        let ring_text = strip_parens(group.trim())?;
        let mut ring = Vec::new();
        for pair in ring_text.split(',') {
            ring.push(parse_pair(pair)?);
        }
        if ring.len() < 3 {
            return Err(WktError::Malformed(format!(
                "ring with {} point(s)",
                ring.len()
            )));
        }
        rings.push(ring);
    }
    if rings.is_empty() {
        return Err(WktError::Malformed("polygon with no rings".to_string()));
    }
    Ok(rings)
}

fn parse_pair(pair: &str) -> Result<Xy, WktError> {
    let mut parts = pair.split_whitespace();
    let x = parts
        .next()
        .and_then(|v| v.parse::<f64>().ok())
        .ok_or_else(|| WktError::Malformed(format!("bad coordinate pair {pair:?}")))?;
    let y = parts
        .next()
        .and_then(|v| v.parse::<f64>().ok())
        .ok_or_else(|| WktError::Malformed(format!("bad coordinate pair {pair:?}")))?;
    Ok(Xy { x, y })
}

fn ring_area(ring: &[Xy]) -> f64 {
    if ring.len() < 3 {
        return 0.0;
    }
    let mut sum = 0.0;
    for i in 0..ring.len() {
        let a = ring[i];
        let b = ring[(i + 1) % ring.len()];
        sum += a.x * b.y - b.x * a.y;
    }
    sum / 2.0
}

fn ring_centroid(ring: &[Xy]) -> Xy {
    let area = ring_area(ring);
    if area.abs() < f64::EPSILON {
        return vertex_mean(ring);
    }
    let mut cx = 0.0;
    let mut cy = 0.0;
    for i in 0..ring.len() {
        let a = ring[i];
        let b = ring[(i + 1) % ring.len()];
        let cross = a.x * b.y - b.x * a.y;
        cx += (a.x + b.x) * cross;
        cy += (a.y + b.y) * cross;
    }
    Xy {
        x: cx / (6.0 * area),
        y: cy / (6.0 * area),
    }
}

fn vertex_mean(points: &[Xy]) -> Xy {
    if points.is_empty() {
        return Xy { x: 0.0, y: 0.0 };
    }
    let n = points.len() as f64;
    Xy {
        x: points.iter().map(|p| p.x).sum::<f64>() / n,
        y: points.iter().map(|p| p.y).sum::<f64>() / n,
    }
}

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two WGS84 coordinates, in meters.
pub fn haversine_m(a: Coordinate, b: Coordinate) -> f64 {
    let (phi1, phi2) = (a.latitude.to_radians(), b.latitude.to_radians());
    let delta_phi = (b.latitude - a.latitude).to_radians();
    let delta_lambda = (b.longitude - a.longitude).to_radians();
    let h = (delta_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (delta_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}
