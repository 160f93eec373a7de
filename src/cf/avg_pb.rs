// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The average primary beam (sensitivity pattern) accumulated over
//! parallactic angle steps.

use log::debug;
use ndarray::prelude::*;

use super::CfError;
use crate::constants::{AVG_PB_UNITY_TOLERANCE, MIN_AVG_PB_PEAK};

/// An `(nx, ny, npol, 1)` power pattern accumulator.
#[derive(Clone, Debug, PartialEq)]
pub struct AveragePrimaryBeam {
    data: Array4<f32>,
    pa_steps: usize,
    normalized: bool,
}

impl AveragePrimaryBeam {
    pub fn new(nx: usize, ny: usize, npol: usize) -> AveragePrimaryBeam {
        AveragePrimaryBeam {
            data: Array4::zeros((nx, ny, npol, 1)),
            pa_steps: 0,
            normalized: false,
        }
    }

    pub(crate) fn from_parts(data: Array4<f32>, pa_steps: usize, normalized: bool) -> Self {
        AveragePrimaryBeam {
            data,
            pa_steps,
            normalized,
        }
    }

    pub fn data(&self) -> ArrayView4<f32> {
        self.data.view()
    }

    pub fn dim(&self) -> (usize, usize, usize, usize) {
        self.data.dim()
    }

    pub fn pa_steps(&self) -> usize {
        self.pa_steps
    }

    pub fn is_normalized(&self) -> bool {
        self.normalized
    }

    /// The largest value over all planes.
    pub fn peak(&self) -> f32 {
        self.data.iter().copied().fold(f32::MIN, f32::max)
    }

    /// Whether the beam can be divided out of an image.
    pub fn is_ready(&self) -> bool {
        !self.data.is_empty() && self.peak() >= MIN_AVG_PB_PEAK
    }

    /// Add the power pattern of one parallactic angle step.
    pub fn accumulate(&mut self, contribution: ArrayView4<f32>) -> Result<(), CfError> {
        if contribution.dim() != self.data.dim() {
            return Err(CfError::BadArrayShape {
                argument: "contribution".to_string(),
                function: "AveragePrimaryBeam::accumulate".to_string(),
                expected: format!("{:?}", self.data.shape()),
                received: format!("{:?}", contribution.shape()),
            });
        }
        self.data += &contribution;
        self.pa_steps += 1;
        self.normalized = false;
        Ok(())
    }

    /// Scale each polarisation plane to a unit peak, then share the mean of
    /// the first two planes between them. Does nothing when already
    /// normalised.
    pub fn normalize(&mut self) {
        if self.normalized {
            return;
        }
        if (self.peak() - 1.0).abs() > AVG_PB_UNITY_TOLERANCE {
            for mut plane in self.data.axis_iter_mut(Axis(2)) {
                // The value with the largest magnitude, sign included.
                let peak = plane
                    .iter()
                    .copied()
                    .fold(0.0f32, |acc, v| if v.abs() > acc.abs() { v } else { acc });
                if peak != 0.0 {
                    plane.mapv_inplace(|v| v / peak);
                }
            }
        }
        if self.data.len_of(Axis(2)) >= 2 {
            let mean = (&self.data.index_axis(Axis(2), 0) + &self.data.index_axis(Axis(2), 1)) / 2.0;
            self.data.index_axis_mut(Axis(2), 0).assign(&mean);
            self.data.index_axis_mut(Axis(2), 1).assign(&mean);
        }
        debug!(
            "Normalised the average primary beam over {} parallactic angle steps",
            self.pa_steps
        );
        self.normalized = true;
    }
}
