//! Spherical Lambert azimuthal equal-area projection.

use serde::{Deserialize, Serialize};

/// Authalic radius of the GRS80 ellipsoid, in metres.
pub const AUTHALIC_RADIUS: f64 = 6_371_007.181;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LambertAzimuthal {
    /// Projection centre, degrees.
    pub lat0: f64,
    pub lon0: f64,
    pub radius: f64,
}

impl LambertAzimuthal {
    pub fn new(lat0: f64, lon0: f64) -> Self {
        Self {
            lat0,
            lon0,
            radius: AUTHALIC_RADIUS,
        }
    }

    /// Geographic degrees to projected metres. `None` at the antipode.
    pub fn forward(&self, lon: f64, lat: f64) -> Option<(f64, f64)> {
        let (phi1, phi) = (self.lat0.to_radians(), lat.to_radians());
        let dlambda = (lon - self.lon0).to_radians();
        let denom = 1.0 + phi1.sin() * phi.sin() + phi1.cos() * phi.cos() * dlambda.cos();
        if denom <= 1e-15 {
            return None;
        }
        let k = (2.0 / denom).sqrt();
        let x = self.radius * k * phi.cos() * dlambda.sin();
        let y = self.radius * k * (phi1.cos() * phi.sin() - phi1.sin() * phi.cos() * dlambda.cos());
        Some((x, y))
    }

    /// Projected metres to geographic degrees `(lon, lat)`.
    ///
    /// Points farther than `2R` from the centre lie outside the projected disc.
    pub fn inverse(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let rho = x.hypot(y);
        if rho > 2.0 * self.radius {
            return None;
        }
        if rho == 0.0 {
            return Some((self.lon0, self.lat0));
        }
        let phi1 = self.lat0.to_radians();
        let c = 2.0 * (rho / (2.0 * self.radius)).asin();
        let (sin_c, cos_c) = c.sin_cos();
        let lat = (cos_c * phi1.sin() + y * sin_c * phi1.cos() / rho)
            .clamp(-1.0, 1.0)
            .asin();
        let lon = self.lon0.to_radians()
            + (x * sin_c).atan2(rho * phi1.cos() * cos_c - y * phi1.sin() * sin_c);
        let lon = (lon.to_degrees() + 540.0).rem_euclid(360.0) - 180.0;
        Some((lon, lat.to_degrees()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn centre_maps_to_origin() {
        let laea = LambertAzimuthal::new(5.0, 20.0);
        let (x, y) = laea.forward(20.0, 5.0).unwrap();
        assert_abs_diff_eq!(x, 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(y, 0.0, epsilon = 1e-6);
        assert_eq!(laea.inverse(0.0, 0.0), Some((20.0, 5.0)));
    }

    #[test]
    fn inverse_undoes_forward_over_east_africa() {
        let laea = LambertAzimuthal::new(5.0, 20.0);
        for &(lon, lat) in &[(32.5, 0.3), (29.6, -1.4), (34.9, 4.2), (-5.0, 40.0)] {
            let (x, y) = laea.forward(lon, lat).unwrap();
            let (lon2, lat2) = laea.inverse(x, y).unwrap();
            assert_abs_diff_eq!(lon2, lon, epsilon = 1e-9);
            assert_abs_diff_eq!(lat2, lat, epsilon = 1e-9);
        }
    }

    #[test]
    fn eastward_points_have_positive_x() {
        let laea = LambertAzimuthal::new(5.0, 20.0);
        let (x, y) = laea.forward(32.5, 0.3).unwrap();
        assert!(x > 1.2e6 && x < 1.5e6, "x = {x}");
        assert!(y < 0.0);
        assert!(laea.inverse(3.0 * AUTHALIC_RADIUS, 0.0).is_none());
    }
}
