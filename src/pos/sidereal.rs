// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Sidereal time and casacore timestamp helpers.

use std::f64::consts::TAU;

use erfa::{aliases::eraGmst06, constants::ERFA_DJM0};
use hifitime::{Duration, Epoch};

use crate::constants::DAYSEC;

/// Greenwich mean sidereal time (IAU 2006) for a UT1 MJD \[radians\].
pub fn gmst(ut1_mjd: f64) -> f64 {
    eraGmst06(ERFA_DJM0, ut1_mjd, ERFA_DJM0, ut1_mjd)
}

/// Get the local mean sidereal time. `time` should be in the UTC frame, and
/// `dut1` (i.e. UT1 - UTC) provides a better estimate of the LMST. If DUT1
/// isn't known, then a [`Duration`] of 0 seconds can be used; the results are
/// wrong by up to 0.9 seconds.
pub fn get_lmst(array_longitude_rad: f64, time: Epoch, dut1: Duration) -> f64 {
    let ut1 = (time + dut1).to_mjd_utc_days();
    (gmst(ut1) + array_longitude_rad).rem_euclid(TAU)
}

/// Convert a casacore `TIME` value (MJD UTC seconds) to an [`Epoch`].
pub fn casacore_time_to_epoch(mjd_utc_seconds: f64) -> Epoch {
    Epoch::from_mjd_utc(mjd_utc_seconds / DAYSEC)
}

/// The TT MJD of an [`Epoch`]. Good enough as a TDB stand-in for Earth
/// velocities.
pub(crate) fn mjd_tt_days(time: Epoch) -> f64 {
    time.to_mjd_tai_days() + 32.184 / DAYSEC
}
