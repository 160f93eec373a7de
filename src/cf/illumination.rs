// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Aperture illumination models.
//!
//! An [`Illumination`] gives the complex aperture field of one feed at a
//! point in the aperture plane. Convolution functions are built by sampling
//! it on a parallactic-angle rotated grid, so any model that is not
//! circularly symmetric yields convolution functions that depend on the
//! parallactic angle.

use std::f64::consts::{LN_10, TAU};

use crate::{c64, constants::VEL_C};

/// A receptor of an antenna.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Feed {
    R,
    L,
    X,
    Y,
}

pub trait Illumination: Send + Sync {
    /// The aperture field of `feed` at `(u_m, v_m)` metres from the centre
    /// of the aperture, in the antenna frame, at `freq_hz`.
    fn evaluate(&self, u_m: f64, v_m: f64, freq_hz: f64, feed: Feed) -> c64;

    /// Used in log messages.
    fn name(&self) -> &'static str;
}

fn in_annulus(u_m: f64, v_m: f64, diameter: f64, blockage: f64) -> bool {
    let r = u_m.hypot(v_m);
    r <= diameter / 2.0 && r >= blockage / 2.0
}

/// A uniformly illuminated dish with a central blockage.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UniformDisk {
    /// \[metres\]
    pub diameter: f64,
    /// The diameter of the central blockage \[metres\]
    pub blockage: f64,
}

impl Illumination for UniformDisk {
    fn evaluate(&self, u_m: f64, v_m: f64, _freq_hz: f64, _feed: Feed) -> c64 {
        if in_annulus(u_m, v_m, self.diameter, self.blockage) {
            c64::new(1.0, 0.0)
        } else {
            c64::new(0.0, 0.0)
        }
    }

    fn name(&self) -> &'static str {
        "uniform disk"
    }
}

/// A uniformly illuminated dish whose R and L beams point `squint` radians
/// either side of the optical axis, along the antenna's v axis.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SquintedDisk {
    pub diameter: f64,
    pub blockage: f64,
    /// \[radians\]
    pub squint: f64,
}

impl Illumination for SquintedDisk {
    fn evaluate(&self, u_m: f64, v_m: f64, freq_hz: f64, feed: Feed) -> c64 {
        if !in_annulus(u_m, v_m, self.diameter, self.blockage) {
            return c64::new(0.0, 0.0);
        }
        let offset = match feed {
            Feed::R => self.squint,
            Feed::L => -self.squint,
            Feed::X | Feed::Y => return c64::new(1.0, 0.0),
        };
        // A pointing offset is a phase gradient across the aperture.
        let v_lambda = v_m * freq_hz / VEL_C;
        c64::from_polar(1.0, TAU * v_lambda * offset)
    }

    fn name(&self) -> &'static str {
        "squinted disk"
    }
}

/// A dish whose illumination falls off as a Gaussian, reaching
/// `edge_taper_db` below the centre at the rim.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TaperedDisk {
    pub diameter: f64,
    pub blockage: f64,
    pub edge_taper_db: f64,
}

impl Illumination for TaperedDisk {
    fn evaluate(&self, u_m: f64, v_m: f64, _freq_hz: f64, _feed: Feed) -> c64 {
        if !in_annulus(u_m, v_m, self.diameter, self.blockage) {
            return c64::new(0.0, 0.0);
        }
        let r2 = (u_m * u_m + v_m * v_m) / (self.diameter / 2.0).powi(2);
        // Field amplitude at the rim is 10^(-dB/20).
        let a = self.edge_taper_db / 20.0 * LN_10;
        c64::new((-a * r2).exp(), 0.0)
    }

    fn name(&self) -> &'static str {
        "tapered disk"
    }
}
