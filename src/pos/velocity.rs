// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Observatory velocities in the reference frames used for velocity channel
//! selection, and the Doppler conventions that map velocities to frequencies.

use erfa::aliases::{eraEpv00, eraPdp, eraS2c};
use hifitime::{Duration, Epoch};
use serde::{Deserialize, Serialize};

use super::{earth::LatLngHeight, radec::RADec, sidereal, ErfaError};
use crate::constants::{
    AU_M, DAYSEC, EARTH_ROTATION_RATE, LSRK_APEX_DEC_RAD, LSRK_APEX_RA_RAD, LSRK_SOLAR_SPEED,
    VEL_C,
};

/// The rest frame in which a velocity grid is specified.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VelocityFrame {
    /// Topocentric; the observatory is at rest.
    Topo,
    /// Geocentric; removes the Earth's rotation.
    Geo,
    /// Barycentric; also removes the Earth's orbit.
    Bary,
    /// Kinematic local standard of rest.
    Lsrk,
}

/// How a radial velocity maps to an observed frequency.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DopplerConvention {
    /// `f = f0 (1 - v/c)`
    Radio,
    /// `f = f0 / (1 + v/c)`
    Optical,
    /// `f = f0 sqrt((1 - v/c) / (1 + v/c))`
    Relativistic,
}

impl DopplerConvention {
    /// The frequency observed from a source receding at `velocity_ms`.
    pub fn frequency(self, rest_freq_hz: f64, velocity_ms: f64) -> f64 {
        let beta = velocity_ms / VEL_C;
        match self {
            DopplerConvention::Radio => rest_freq_hz * (1.0 - beta),
            DopplerConvention::Optical => rest_freq_hz / (1.0 + beta),
            DopplerConvention::Relativistic => rest_freq_hz * ((1.0 - beta) / (1.0 + beta)).sqrt(),
        }
    }

    /// The inverse of [`DopplerConvention::frequency`].
    pub fn velocity(self, rest_freq_hz: f64, freq_hz: f64) -> f64 {
        let r = freq_hz / rest_freq_hz;
        match self {
            DopplerConvention::Radio => VEL_C * (1.0 - r),
            DopplerConvention::Optical => VEL_C * (1.0 / r - 1.0),
            DopplerConvention::Relativistic => VEL_C * (1.0 - r * r) / (1.0 + r * r),
        }
    }
}

/// The velocity vector of the observatory with respect to `frame`, in J2000
/// equatorial coordinates \[metres/second\].
pub fn observatory_velocity(
    frame: VelocityFrame,
    time: Epoch,
    array_pos: LatLngHeight,
    dut1: Duration,
) -> Result<[f64; 3], ErfaError> {
    let mut vel = [0.0; 3];
    if frame == VelocityFrame::Topo {
        return Ok(vel);
    }

    // Earth rotation: the site moves eastward at omega * rho.
    let xyz = array_pos.to_geocentric_wgs84()?;
    let rho = xyz[0].hypot(xyz[1]);
    let last = sidereal::get_lmst(array_pos.longitude_rad, time, dut1);
    let speed = EARTH_ROTATION_RATE * rho;
    vel[0] = -speed * last.sin();
    vel[1] = speed * last.cos();
    if frame == VelocityFrame::Geo {
        return Ok(vel);
    }

    // Earth orbit. The status is only a warning for dates outside 1900-2100.
    let (_, _, pvb) = eraEpv00(2400000.5, sidereal::mjd_tt_days(time));
    for (v, b) in vel.iter_mut().zip(pvb[1]) {
        *v += b * AU_M / DAYSEC;
    }
    if frame == VelocityFrame::Bary {
        return Ok(vel);
    }

    let apex = eraS2c(LSRK_APEX_RA_RAD, LSRK_APEX_DEC_RAD);
    for (v, a) in vel.iter_mut().zip(apex) {
        *v += LSRK_SOLAR_SPEED * a;
    }
    Ok(vel)
}

/// The component of the observatory's velocity toward `direction`
/// \[metres/second\]. Positive values mean the observatory approaches the
/// source.
pub fn radial_velocity(
    frame: VelocityFrame,
    time: Epoch,
    array_pos: LatLngHeight,
    dut1: Duration,
    direction: RADec,
) -> Result<f64, ErfaError> {
    let vel = observatory_velocity(frame, time, array_pos, dut1)?;
    Ok(eraPdp(vel, direction.to_unit_vector()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn site() -> LatLngHeight {
        LatLngHeight::from_degrees(-107.6184, 34.0784, 2124.0)
    }

    fn epoch() -> Epoch {
        Epoch::from_gregorian_utc_hms(2021, 6, 1, 4, 0, 0)
    }

    #[test]
    fn topo_is_at_rest() {
        let v = observatory_velocity(VelocityFrame::Topo, epoch(), site(), Duration::from_seconds(0.0))
            .unwrap();
        assert_eq!(v, [0.0; 3]);
    }

    #[test]
    fn geo_speed_is_diurnal() {
        let v = observatory_velocity(VelocityFrame::Geo, epoch(), site(), Duration::from_seconds(0.0))
            .unwrap();
        let speed = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
        // ~465 m/s at the equator, scaled by cos(latitude).
        assert!(speed > 350.0 && speed < 400.0, "{speed}");
        assert_abs_diff_eq!(v[2], 0.0);
    }

    #[test]
    fn bary_speed_is_orbital() {
        let v = observatory_velocity(VelocityFrame::Bary, epoch(), site(), Duration::from_seconds(0.0))
            .unwrap();
        let speed = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
        assert!(speed > 29_000.0 && speed < 31_000.0, "{speed}");
    }

    #[test]
    fn lsrk_adds_solar_motion() {
        let dut1 = Duration::from_seconds(0.0);
        let bary = observatory_velocity(VelocityFrame::Bary, epoch(), site(), dut1).unwrap();
        let lsrk = observatory_velocity(VelocityFrame::Lsrk, epoch(), site(), dut1).unwrap();
        let apex = RADec::from_radians(LSRK_APEX_RA_RAD, LSRK_APEX_DEC_RAD);
        let d = eraPdp(
            [lsrk[0] - bary[0], lsrk[1] - bary[1], lsrk[2] - bary[2]],
            apex.to_unit_vector(),
        );
        assert_abs_diff_eq!(d, LSRK_SOLAR_SPEED, epsilon = 1e-6);
    }

    #[test]
    fn doppler_conventions_invert() {
        let f0 = 1.420405752e9;
        for conv in [
            DopplerConvention::Radio,
            DopplerConvention::Optical,
            DopplerConvention::Relativistic,
        ] {
            let f = conv.frequency(f0, 150_000.0);
            assert!(f < f0);
            assert_abs_diff_eq!(conv.velocity(f0, f), 150_000.0, epsilon = 1e-4);
        }
        assert_abs_diff_eq!(
            DopplerConvention::Radio.frequency(f0, 0.0),
            f0,
            epsilon = 1e-6
        );
    }
}
