// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Deciding when the parallactic angle has moved far enough to need a new
//! convolution function.

use std::f64::consts::TAU;

/// The separation of two angles, in `[0, π]` \[radians\].
pub fn angular_distance(a: f64, b: f64) -> f64 {
    let d = (a - b).rem_euclid(TAU);
    d.min(TAU - d)
}

/// Tracks the parallactic angle of the last convolution function used.
///
/// A negative tolerance switches aperture rotation off: only the very first
/// angle seen counts as a change.
#[derive(Clone, Debug)]
pub struct ParAngleChangeDetector {
    tolerance: f64,
    last: Option<f64>,
}

impl ParAngleChangeDetector {
    /// `tolerance` is in radians.
    pub fn new(tolerance: f64) -> ParAngleChangeDetector {
        ParAngleChangeDetector {
            tolerance,
            last: None,
        }
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    pub fn rotation_enabled(&self) -> bool {
        self.tolerance >= 0.0
    }

    /// The angle recorded by the last [`Self::update`], if any.
    pub fn last(&self) -> Option<f64> {
        self.last
    }

    pub fn changed(&self, pa: f64) -> bool {
        match self.last {
            None => true,
            Some(_) if !self.rotation_enabled() => false,
            Some(last) => angular_distance(pa, last) > self.tolerance,
        }
    }

    pub fn update(&mut self, pa: f64) {
        self.last = Some(pa);
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn test_angular_distance_wraps() {
        assert_abs_diff_eq!(
            angular_distance(359_f64.to_radians(), 1_f64.to_radians()),
            2_f64.to_radians(),
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(
            angular_distance(-179_f64.to_radians(), 179_f64.to_radians()),
            2_f64.to_radians(),
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(angular_distance(0.3, 0.3), 0.0);
    }

    #[test]
    fn test_change_detection() {
        let mut d = ParAngleChangeDetector::new(1_f64.to_radians());
        assert!(d.changed(0.0));
        d.update(10_f64.to_radians());
        assert!(!d.changed(10.5_f64.to_radians()));
        assert!(d.changed(11.5_f64.to_radians()));
        assert!(d.changed(8.5_f64.to_radians()));
        d.reset();
        assert!(d.last().is_none());
        assert!(d.changed(10_f64.to_radians()));
    }

    #[test]
    fn test_negative_tolerance_disables_rotation() {
        let mut d = ParAngleChangeDetector::new(-1.0);
        assert!(!d.rotation_enabled());
        assert!(d.changed(0.0));
        d.update(0.0);
        assert!(!d.changed(3.0));
    }
}
