// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Handling of Earth Coordinates (Latitude/Longitude/Height)

use std::fmt::Display;

use erfa::Ellipsoid;

use super::ErfaError;

#[derive(Clone, Copy, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
/// An earth position: Latitude, Longitude and Height [radians, meters]
pub struct LatLngHeight {
    /// Longitude \[radians\]
    pub longitude_rad: f64,
    /// Latitude \[radians\]
    pub latitude_rad: f64,
    /// Height above ellipsoid \[meters\]
    pub height_metres: f64,
}

impl LatLngHeight {
    /// Make a new [`LatLngHeight`] from a longitude and latitude in degrees.
    pub fn from_degrees(longitude_deg: f64, latitude_deg: f64, height_metres: f64) -> LatLngHeight {
        Self {
            longitude_rad: longitude_deg.to_radians(),
            latitude_rad: latitude_deg.to_radians(),
            height_metres,
        }
    }

    /// Convert to a geocentric (ITRF-like) vector \[metres\] via
    /// [`erfa::transform::geodetic_to_geocentric`] with the specified
    /// [`Ellipsoid`].
    pub fn to_geocentric(self, ellipsoid: Ellipsoid) -> Result<[f64; 3], ErfaError> {
        erfa::transform::geodetic_to_geocentric(
            ellipsoid,
            self.longitude_rad,
            self.latitude_rad,
            self.height_metres,
        )
        .map_err(|_| ErfaError {
            source_file: file!(),
            source_line: line!(),
            status: -1,
            function: "geodetic_to_geocentric",
        })
    }

    /// Convert to geocentric via the default [`Ellipsoid::WGS84`].
    pub fn to_geocentric_wgs84(self) -> Result<[f64; 3], ErfaError> {
        self.to_geocentric(Ellipsoid::WGS84)
    }

    /// Convert a WGS84 geocentric vector \[metres\] (e.g. a measurement set
    /// ANTENNA `POSITION`) to geodetic coordinates. Iterates to sub-millimetre
    /// height accuracy away from the poles.
    pub fn from_geocentric_wgs84(xyz: [f64; 3]) -> LatLngHeight {
        const A: f64 = 6_378_137.0;
        const F: f64 = 1.0 / 298.257_223_563;
        let e2 = F * (2.0 - F);

        let [x, y, z] = xyz;
        let longitude_rad = y.atan2(x);
        let p = x.hypot(y);
        if p == 0.0 {
            let b = A * (1.0 - F);
            return LatLngHeight {
                longitude_rad,
                latitude_rad: std::f64::consts::FRAC_PI_2.copysign(z),
                height_metres: z.abs() - b,
            };
        }

        let mut latitude_rad = z.atan2(p * (1.0 - e2));
        let mut height_metres = 0.0;
        for _ in 0..6 {
            let sin_lat = latitude_rad.sin();
            let n = A / (1.0 - e2 * sin_lat * sin_lat).sqrt();
            height_metres = p / latitude_rad.cos() - n;
            latitude_rad = z.atan2(p * (1.0 - e2 * n / (n + height_metres)));
        }
        LatLngHeight {
            longitude_rad,
            latitude_rad,
            height_metres,
        }
    }
}

impl Display for LatLngHeight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{ longitude: {:.4}°, latitude: {:.4}°, height: {}m }}",
            self.longitude_rad.to_degrees(),
            self.latitude_rad.to_degrees(),
            self.height_metres
        )
    }
}

#[cfg(any(test, feature = "approx"))]
impl approx::AbsDiffEq for LatLngHeight {
    type Epsilon = f64;

    fn default_epsilon() -> f64 {
        f64::EPSILON
    }

    fn abs_diff_eq(&self, other: &Self, epsilon: f64) -> bool {
        f64::abs_diff_eq(&self.longitude_rad, &other.longitude_rad, epsilon)
            && f64::abs_diff_eq(&self.latitude_rad, &other.latitude_rad, epsilon)
            && f64::abs_diff_eq(&self.height_metres, &other.height_metres, epsilon)
    }
}
