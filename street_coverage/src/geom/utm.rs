//! Forward UTM (transverse Mercator) projection on the WGS84 ellipsoid.
//!
//! Everything downstream that needs planar meters — segment lengths, buffer
//! tests, arc-length cuts, graph weights — goes through one projector picked
//! from the area centroid, so there is never a mixed-CRS comparison.

const WGS84_A: f64 = 6_378_137.0;
const WGS84_F: f64 = 1.0 / 298.257_223_563;
const K0: f64 = 0.9996;
const FALSE_EASTING: f64 = 500_000.0;
const FALSE_NORTHING_SOUTH: f64 = 10_000_000.0;

/// UTM zone number and hemisphere for a WGS84 coordinate.
pub fn utm_zone_for(lat: f64, lon: f64) -> (u8, bool) {
    let zone = (((lon + 180.0) / 6.0).floor() as i32 + 1).clamp(1, 60) as u8;
    (zone, lat >= 0.0)
}

/// A cached forward transform for one UTM zone.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UtmProjector {
    pub zone: u8,
    pub northern: bool,
    central_meridian: f64,
}

impl UtmProjector {
    pub fn for_zone(zone: u8, northern: bool) -> Self {
        let central_meridian = (f64::from(zone) - 1.0) * 6.0 - 180.0 + 3.0;
        Self {
            zone,
            northern,
            central_meridian,
        }
    }

    /// Projector for whatever zone contains the given point (typically an
    /// area or trace centroid).
    pub fn for_centroid(lon: f64, lat: f64) -> Self {
        let (zone, northern) = utm_zone_for(lat, lon);
        Self::for_zone(zone, northern)
    }

    /// Project `[lon, lat]` degrees to (easting, northing) meters.
    pub fn project(&self, lon: f64, lat: f64) -> (f64, f64) {
        let e2 = WGS84_F * (2.0 - WGS84_F);
        let ep2 = e2 / (1.0 - e2);

        let phi = lat.to_radians();
        let lambda = (lon - self.central_meridian).to_radians();

        let sin_phi = phi.sin();
        let cos_phi = phi.cos();
        let tan_phi = phi.tan();

        let n = WGS84_A / (1.0 - e2 * sin_phi * sin_phi).sqrt();
        let t = tan_phi * tan_phi;
        let c = ep2 * cos_phi * cos_phi;
        let a = lambda * cos_phi;

        let e4 = e2 * e2;
        let e6 = e4 * e2;
        let m = WGS84_A
            * ((1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0) * phi
                - (3.0 * e2 / 8.0 + 3.0 * e4 / 32.0 + 45.0 * e6 / 1024.0) * (2.0 * phi).sin()
                + (15.0 * e4 / 256.0 + 45.0 * e6 / 1024.0) * (4.0 * phi).sin()
                - (35.0 * e6 / 3072.0) * (6.0 * phi).sin());

        let a2 = a * a;
        let a3 = a2 * a;
        let a4 = a3 * a;
        let a5 = a4 * a;
        let a6 = a5 * a;

        let x = K0
            * n
            * (a + (1.0 - t + c) * a3 / 6.0
                + (5.0 - 18.0 * t + t * t + 72.0 * c - 58.0 * ep2) * a5 / 120.0)
            + FALSE_EASTING;
        let mut y = K0
            * (m + n
                * tan_phi
                * (a2 / 2.0
                    + (5.0 - t + 9.0 * c + 4.0 * c * c) * a4 / 24.0
                    + (61.0 - 58.0 * t + t * t + 600.0 * c - 330.0 * ep2) * a6 / 720.0));
        if !self.northern {
            y += FALSE_NORTHING_SOUTH;
        }
        (x, y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_derivation() {
        assert_eq!(utm_zone_for(32.78, -96.8), (14, true));
        assert_eq!(utm_zone_for(52.37, 4.9), (31, true));
        assert_eq!(utm_zone_for(-33.87, 151.2), (56, false));
    }

    #[test]
    fn projects_zone_origin_near_false_easting() {
        // The central meridian of zone 14 is -99. A point on it should sit
        // exactly at the false easting.
        let proj = UtmProjector::for_zone(14, true);
        let (x, _) = proj.project(-99.0, 32.0);
        assert!((x - 500_000.0).abs() < 1e-6);
    }

    #[test]
    fn one_degree_of_latitude_is_about_111km() {
        let proj = UtmProjector::for_centroid(-96.8, 32.5);
        let (_, y0) = proj.project(-96.8, 32.0);
        let (_, y1) = proj.project(-96.8, 33.0);
        let d = y1 - y0;
        assert!((d - 110_860.0).abs() < 500.0, "got {d}");
    }

    #[test]
    fn southern_hemisphere_offset() {
        let proj = UtmProjector::for_centroid(151.2, -33.87);
        let (_, y) = proj.project(151.2, -33.87);
        assert!(y > 6_000_000.0 && y < 10_000_000.0);
    }
}
