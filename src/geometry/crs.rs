//! Coordinate reference systems and reprojection.
//!
//! Geometry sources arrive in regional grid systems (state plane feet, UTM
//! meters) while geocoded points are WGS84. Comparing coordinates across
//! mismatched reference systems silently produces distances that are wrong by
//! orders of magnitude, so every spatial comparison goes through
//! [`Crs::to_wgs84`] first. Projection math follows the standard ellipsoidal
//! formulas on GRS80; forward projections exist for tests and synthetic data.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{Coordinate, Xy};

// GRS80 ellipsoid.
const A: f64 = 6_378_137.0;
const INV_F: f64 = 298.257_222_101;

fn e2() -> f64 {
    let f = 1.0 / INV_F;
    f * (2.0 - f)
}

/// Linear unit of a projected system's easting/northing axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinearUnit {
    Meter,
    /// US survey foot (1200/3937 m), used by state plane zones.
    UsFoot,
}

impl LinearUnit {
    pub fn to_meters(&self) -> f64 {
        match self {
            LinearUnit::Meter => 1.0,
            LinearUnit::UsFoot => 1200.0 / 3937.0,
        }
    }
}

/// Lambert conformal conic with two standard parallels. Angles in degrees,
/// false origin in the zone's native unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LambertParams {
    pub lat_origin: f64,
    pub lon_origin: f64,
    pub standard_parallel_1: f64,
    pub standard_parallel_2: f64,
    pub false_easting: f64,
    pub false_northing: f64,
    pub unit: LinearUnit,
}

/// Transverse Mercator. Angles in degrees, false origin in the zone's native
/// unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransverseMercatorParams {
    pub lat_origin: f64,
    pub lon_origin: f64,
    pub scale_factor: f64,
    pub false_easting: f64,
    pub false_northing: f64,
    pub unit: LinearUnit,
}

/// A coordinate reference system a region's geometry source may use.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "projection", rename_all = "snake_case")]
pub enum Crs {
    /// Geographic coordinates; x is longitude, y is latitude.
    Geographic,
    LambertConformalConic(LambertParams),
    TransverseMercator(TransverseMercatorParams),
}

#[derive(Debug, Error)]
#[error("unknown CRS code '{0}'")]
pub struct UnknownCrsCode(pub String);

impl Crs {
    /// Resolve a CRS code from the built-in registry.
    pub fn from_code(code: &str) -> Result<Crs, UnknownCrsCode> {
        match code.to_uppercase().as_str() {
            "EPSG:4326" | "WGS84" => Ok(Crs::Geographic),
            // NAD83 / Connecticut state plane, US survey feet.
            "EPSG:2234" => Ok(Crs::LambertConformalConic(LambertParams {
                lat_origin: 40.0 + 50.0 / 60.0,
                lon_origin: -(72.0 + 45.0 / 60.0),
                standard_parallel_1: 41.2,
                standard_parallel_2: 41.0 + 52.0 / 60.0,
                false_easting: 1_000_000.0,
                false_northing: 500_000.0,
                unit: LinearUnit::UsFoot,
            })),
            // NAD83 / UTM zone 18N, meters.
            "EPSG:26918" => Ok(Crs::TransverseMercator(TransverseMercatorParams {
                lat_origin: 0.0,
                lon_origin: -75.0,
                scale_factor: 0.9996,
                false_easting: 500_000.0,
                false_northing: 0.0,
                unit: LinearUnit::Meter,
            })),
            other => Err(UnknownCrsCode(other.to_string())),
        }
    }

    /// Reproject a native-system coordinate into WGS84.
    pub fn to_wgs84(&self, p: Xy) -> Coordinate {
        match self {
            Crs::Geographic => Coordinate {
                latitude: p.y,
                longitude: p.x,
            },
            Crs::LambertConformalConic(params) => lcc_inverse(params, p),
            Crs::TransverseMercator(params) => tm_inverse(params, p),
        }
    }

    /// Project a WGS84 coordinate into the native system. Exists so tests and
    /// synthetic fixtures can construct grid coordinates with known geography.
    pub fn from_wgs84(&self, c: Coordinate) -> Xy {
        match self {
            Crs::Geographic => Xy {
                x: c.longitude,
                y: c.latitude,
            },
            Crs::LambertConformalConic(params) => lcc_forward(params, c),
            Crs::TransverseMercator(params) => tm_forward(params, c),
        }
    }
}

fn lcc_m(e: f64, phi: f64) -> f64 {
    phi.cos() / (1.0 - e * e * phi.sin().powi(2)).sqrt()
}

fn lcc_t(e: f64, phi: f64) -> f64 {
    let sin_phi = phi.sin();
    (std::f64::consts::FRAC_PI_4 - phi / 2.0).tan()
        / ((1.0 - e * sin_phi) / (1.0 + e * sin_phi)).powf(e / 2.0)
}

struct LccDerived {
    n: f64,
    f: f64,
    rho0: f64,
    lon0: f64,
}

fn lcc_derive(params: &LambertParams) -> LccDerived {
    let e = e2().sqrt();
    let phi0 = params.lat_origin.to_radians();
    let phi1 = params.standard_parallel_1.to_radians();
    let phi2 = params.standard_parallel_2.to_radians();

    let m1 = lcc_m(e, phi1);
    let m2 = lcc_m(e, phi2);
    let t0 = lcc_t(e, phi0);
    let t1 = lcc_t(e, phi1);
    let t2 = lcc_t(e, phi2);

    let n = (m1.ln() - m2.ln()) / (t1.ln() - t2.ln());
    let f = m1 / (n * t1.powf(n));
    let rho0 = A * f * t0.powf(n);

    LccDerived {
        n,
        f,
        rho0,
        lon0: params.lon_origin.to_radians(),
    }
}

fn lcc_forward(params: &LambertParams, c: Coordinate) -> Xy {
    let e = e2().sqrt();
    let d = lcc_derive(params);
    let unit = params.unit.to_meters();

    let t = lcc_t(e, c.latitude.to_radians());
    let rho = A * d.f * t.powf(d.n);
    let theta = d.n * (c.longitude.to_radians() - d.lon0);

    Xy {
        x: params.false_easting + (rho * theta.sin()) / unit,
        y: params.false_northing + (d.rho0 - rho * theta.cos()) / unit,
    }
}

fn lcc_inverse(params: &LambertParams, p: Xy) -> Coordinate {
    let e = e2().sqrt();
    let d = lcc_derive(params);
    let unit = params.unit.to_meters();

    let x = (p.x - params.false_easting) * unit;
    let y = d.rho0 - (p.y - params.false_northing) * unit;

    let sign = if d.n >= 0.0 { 1.0 } else { -1.0 };
    let rho = sign * (x * x + y * y).sqrt();
    let theta = (sign * x).atan2(sign * y);
    let lon = theta / d.n + d.lon0;

    if rho.abs() < f64::EPSILON {
        let lat = if d.n >= 0.0 { 90.0 } else { -90.0 };
        return Coordinate {
            latitude: lat,
            longitude: lon.to_degrees(),
        };
    }

    let t = (rho / (A * d.f)).powf(1.0 / d.n);
    let mut phi = std::f64::consts::FRAC_PI_2 - 2.0 * t.atan();
    for _ in 0..10 {
        let sin_phi = phi.sin();
        phi = std::f64::consts::FRAC_PI_2
            - 2.0 * (t * ((1.0 - e * sin_phi) / (1.0 + e * sin_phi)).powf(e / 2.0)).atan();
    }

    Coordinate {
        latitude: phi.to_degrees(),
        longitude: lon.to_degrees(),
    }
}

/// Meridional arc length from the equator.
fn tm_meridian_arc(phi: f64) -> f64 {
    let e2 = e2();
    let e4 = e2 * e2;
    let e6 = e4 * e2;
    A * ((1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0) * phi
        - (3.0 * e2 / 8.0 + 3.0 * e4 / 32.0 + 45.0 * e6 / 1024.0) * (2.0 * phi).sin()
        + (15.0 * e4 / 256.0 + 45.0 * e6 / 1024.0) * (4.0 * phi).sin()
        - (35.0 * e6 / 3072.0) * (6.0 * phi).sin())
}

fn tm_forward(params: &TransverseMercatorParams, c: Coordinate) -> Xy {
    let e2 = e2();
    let ep2 = e2 / (1.0 - e2);
    let unit = params.unit.to_meters();
    let k0 = params.scale_factor;

    let phi = c.latitude.to_radians();
    let lam = c.longitude.to_radians();
    let lam0 = params.lon_origin.to_radians();

    let sin_phi = phi.sin();
    let cos_phi = phi.cos();
    let n = A / (1.0 - e2 * sin_phi * sin_phi).sqrt();
    let t = (phi.tan()).powi(2);
    let cc = ep2 * cos_phi * cos_phi;
    let a_term = (lam - lam0) * cos_phi;

    let m = tm_meridian_arc(phi);
    let m0 = tm_meridian_arc(params.lat_origin.to_radians());

    let x = k0
        * n
        * (a_term
            + (1.0 - t + cc) * a_term.powi(3) / 6.0
            + (5.0 - 18.0 * t + t * t + 72.0 * cc - 58.0 * ep2) * a_term.powi(5) / 120.0);
    let y = k0
        * (m - m0
            + n * phi.tan()
                * (a_term.powi(2) / 2.0
                    + (5.0 - t + 9.0 * cc + 4.0 * cc * cc) * a_term.powi(4) / 24.0
                    + (61.0 - 58.0 * t + t * t + 600.0 * cc - 330.0 * ep2) * a_term.powi(6)
                        / 720.0));

    Xy {
        x: params.false_easting + x / unit,
        y: params.false_northing + y / unit,
    }
}

fn tm_inverse(params: &TransverseMercatorParams, p: Xy) -> Coordinate {
    let e2 = e2();
    let ep2 = e2 / (1.0 - e2);
    let unit = params.unit.to_meters();
    let k0 = params.scale_factor;

    let x = (p.x - params.false_easting) * unit;
    let y = (p.y - params.false_northing) * unit;

    let m0 = tm_meridian_arc(params.lat_origin.to_radians());
    let m = m0 + y / k0;
    let e4 = e2 * e2;
    let e6 = e4 * e2;
    let mu = m / (A * (1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0));

    let e1 = (1.0 - (1.0 - e2).sqrt()) / (1.0 + (1.0 - e2).sqrt());
    let phi1 = mu
        + (3.0 * e1 / 2.0 - 27.0 * e1.powi(3) / 32.0) * (2.0 * mu).sin()
        + (21.0 * e1 * e1 / 16.0 - 55.0 * e1.powi(4) / 32.0) * (4.0 * mu).sin()
        + (151.0 * e1.powi(3) / 96.0) * (6.0 * mu).sin()
        + (1097.0 * e1.powi(4) / 512.0) * (8.0 * mu).sin();

    let sin_phi1 = phi1.sin();
    let cos_phi1 = phi1.cos();
    let c1 = ep2 * cos_phi1 * cos_phi1;
    let t1 = phi1.tan().powi(2);
    let n1 = A / (1.0 - e2 * sin_phi1 * sin_phi1).sqrt();
    let r1 = A * (1.0 - e2) / (1.0 - e2 * sin_phi1 * sin_phi1).powf(1.5);
    let d = x / (n1 * k0);

    let phi = phi1
        - (n1 * phi1.tan() / r1)
            * (d * d / 2.0
                - (5.0 + 3.0 * t1 + 10.0 * c1 - 4.0 * c1 * c1 - 9.0 * ep2) * d.powi(4) / 24.0
                + (61.0 + 90.0 * t1 + 298.0 * c1 + 45.0 * t1 * t1 - 252.0 * ep2 - 3.0 * c1 * c1)
                    * d.powi(6)
                    / 720.0);
    let lam = params.lon_origin.to_radians()
        + (d - (1.0 + 2.0 * t1 + c1) * d.powi(3) / 6.0
            + (5.0 - 2.0 * c1 + 28.0 * t1 - 3.0 * c1 * c1 + 8.0 * ep2 + 24.0 * t1 * t1)
                * d.powi(5)
                / 120.0)
            / cos_phi1;

    Coordinate {
        latitude: phi.to_degrees(),
        longitude: lam.to_degrees(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::haversine_m;

    const CT: &str = "EPSG:2234";
    const UTM18: &str = "EPSG:26918";

    #[test]
    fn test_unknown_code() {
        assert!(Crs::from_code("EPSG:99999").is_err());
    }

    #[test]
    fn test_geographic_passthrough() {
        let crs = Crs::from_code("EPSG:4326").unwrap();
        let c = crs.to_wgs84(Xy { x: -72.8, y: 41.8 });
        assert_eq!(c.latitude, 41.8);
        assert_eq!(c.longitude, -72.8);
    }

    #[test]
    fn test_lcc_false_origin_maps_to_projection_origin() {
        let crs = Crs::from_code(CT).unwrap();
        let c = crs.to_wgs84(Xy {
            x: 1_000_000.0,
            y: 500_000.0,
        });
        assert!((c.latitude - (40.0 + 50.0 / 60.0)).abs() < 1e-7, "{c:?}");
        assert!((c.longitude - (-72.75)).abs() < 1e-7, "{c:?}");
    }

    #[test]
    fn test_lcc_round_trip() {
        let crs = Crs::from_code(CT).unwrap();
        let original = Coordinate {
            latitude: 41.789,
            longitude: -72.846,
        };
        let projected = crs.from_wgs84(original);
        let back = crs.to_wgs84(projected);
        assert!((back.latitude - original.latitude).abs() < 1e-8, "{back:?}");
        assert!((back.longitude - original.longitude).abs() < 1e-8, "{back:?}");
    }

    #[test]
    fn test_tm_round_trip() {
        let crs = Crs::from_code(UTM18).unwrap();
        let original = Coordinate {
            latitude: 40.25,
            longitude: -74.1,
        };
        let projected = crs.from_wgs84(original);
        let back = crs.to_wgs84(projected);
        assert!((back.latitude - original.latitude).abs() < 1e-8, "{back:?}");
        assert!((back.longitude - original.longitude).abs() < 1e-8, "{back:?}");
    }

    #[test]
    fn test_tm_central_meridian_has_no_easting_offset() {
        let crs = Crs::from_code(UTM18).unwrap();
        let p = crs.from_wgs84(Coordinate {
            latitude: 43.0,
            longitude: -75.0,
        });
        assert!((p.x - 500_000.0).abs() < 1e-6, "{p:?}");
    }

    #[test]
    fn test_reprojected_distance_is_sane() {
        // A grid coordinate built from a known geographic point must land
        // within meters of that point after reprojection; treating the raw
        // grid numbers as degrees is wrong by orders of magnitude.
        let crs = Crs::from_code(CT).unwrap();
        let known = Coordinate {
            latitude: 41.81,
            longitude: -72.83,
        };
        let grid = crs.from_wgs84(known);

        let reprojected = crs.to_wgs84(grid);
        assert!(haversine_m(known, reprojected) < 1.0);

        let naive = Coordinate {
            latitude: grid.y,
            longitude: grid.x,
        };
        // Clamp-free haversine still shows the naive reading as absurd.
        assert!(haversine_m(known, naive).is_nan() || haversine_m(known, naive) > 100_000.0);
    }
}
