// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Useful constants.

use std::f64::consts::PI;

/// Speed of light \[metres/second\]
pub const VEL_C: f64 = 299_792_458.0;

/// Seconds per day (86400)
pub const DAYSEC: f64 = erfa::constants::ERFA_DAYSEC;
/// Seconds of time to radians (7.272205216643039903848712e-5).
pub const DS2R: f64 = 2.0 * PI / DAYSEC;
/// Hour angle to radians (15 / 180 * PI).
pub const DH2R: f64 = 15.0 / 180.0 * PI;
/// Ratio of a solar day to a sidereal day (24/23.9344696 = 1.002737909).
pub const SOLAR2SIDEREAL: f64 = 24.0 / 23.9344696;
/// Earth's rotation rate \[radians/second\]
pub const EARTH_ROTATION_RATE: f64 = DS2R * SOLAR2SIDEREAL;
/// One astronomical unit \[metres\]
pub const AU_M: f64 = erfa::constants::ERFA_AULT * VEL_C;

/// The default size of one side of a convolution function \[pixels\]
pub const CONVSIZE: usize = 2048;
/// The default convolution function oversampling factor.
pub const OVERSAMPLING: usize = 20;
/// Convolution function values below this fraction of the peak are outside
/// the support.
pub const CF_SUPPORT_THRESHOLD: f64 = 1e-3;
/// An average primary beam whose peak is below this is unusable.
pub const MIN_AVG_PB_PEAK: f32 = 1e-4;
/// If the peak of an average primary beam is within this of 1, it is
/// already normalised.
pub const AVG_PB_UNITY_TOLERANCE: f32 = 1e-3;

/// The default parallactic angle tolerance \[degrees\]
pub const DEFAULT_PA_TOLERANCE_DEG: f64 = 5.0;
/// The default primary beam floor.
pub const DEFAULT_PB_LIMIT: f32 = 5e-2;
/// The default in-memory grid budget \[bytes\]
pub const DEFAULT_CACHE_SIZE_BYTES: u64 = 1024 * 1024 * 1024;
/// The default side length of a disk-backed grid tile \[pixels\]
pub const DEFAULT_TILE_SIZE: usize = 64;

/// Speed of the Sun with respect to the kinematic local standard of rest
/// \[metres/second\]
pub const LSRK_SOLAR_SPEED: f64 = 20_000.0;
/// J2000 right ascension of the LSRK solar apex \[radians\]
/// (18h03m50.29s)
pub const LSRK_APEX_RA_RAD: f64 = (18.0 + 3.0 / 60.0 + 50.29 / 3600.0) * DH2R;
/// J2000 declination of the LSRK solar apex \[radians\] (+30°00'16.8")
pub const LSRK_APEX_DEC_RAD: f64 = (30.0 + 16.8 / 3600.0) * PI / 180.0;
