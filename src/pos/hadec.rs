// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Handle (hour angle, declination) coordinates.

use std::f64::consts::TAU;

use super::azel::AzEl;

/// A struct containing an Hour Angle and Declination. All units are in radians.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[allow(clippy::upper_case_acronyms)]
pub struct HADec {
    /// Hour angle \[radians\]
    pub ha: f64,
    /// Declination \[radians\]
    pub dec: f64,
}

impl HADec {
    /// Make a new [`HADec`] struct from values in radians.
    pub fn from_radians(ha: f64, dec: f64) -> HADec {
        Self { ha, dec }
    }

    /// Make a new [`HADec`] struct from values in degrees.
    pub fn from_degrees(ha: f64, dec: f64) -> HADec {
        Self {
            ha: ha.to_radians(),
            dec: dec.to_radians(),
        }
    }

    /// Convert the equatorial coordinates to horizon coordinates (azimuth and
    /// elevation), given the local latitude on Earth.
    ///
    /// Follows ERFA's `eraHd2ae`.
    pub fn to_azel(self, latitude_rad: f64) -> AzEl {
        let (sh, ch) = self.ha.sin_cos();
        let (sd, cd) = self.dec.sin_cos();
        let (sp, cp) = latitude_rad.sin_cos();

        let x = -ch * cd * sp + sd * cp;
        let y = -sh * cd;
        let z = ch * cd * cp + sd * sp;

        let r = x.hypot(y);
        let mut az = if r != 0.0 { y.atan2(x) } else { 0.0 };
        if az < 0.0 {
            az += TAU;
        }
        AzEl::from_radians(az, z.atan2(r))
    }

    /// Get the [parallactic
    /// angle](https://en.wikipedia.org/wiki/Parallactic_angle) at a latitude.
    ///
    /// Follows ERFA's `eraHd2pa`.
    pub fn get_parallactic_angle(self, latitude_rad: f64) -> f64 {
        let cp = latitude_rad.cos();
        let sqsz = cp * self.ha.sin();
        let cqsz = latitude_rad.sin() * self.dec.cos() - cp * self.dec.sin() * self.ha.cos();
        if sqsz != 0.0 || cqsz != 0.0 {
            sqsz.atan2(cqsz)
        } else {
            0.0
        }
    }
}

impl std::fmt::Display for HADec {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "({}°, {}°)", self.ha.to_degrees(), self.dec.to_degrees())
    }
}

#[cfg(any(test, feature = "approx"))]
impl approx::AbsDiffEq for HADec {
    type Epsilon = f64;

    fn default_epsilon() -> f64 {
        f64::EPSILON
    }

    fn abs_diff_eq(&self, other: &Self, epsilon: f64) -> bool {
        f64::abs_diff_eq(&self.ha, &other.ha, epsilon)
            && f64::abs_diff_eq(&self.dec, &other.dec, epsilon)
    }
}
