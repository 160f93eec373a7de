// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Image-plane corrections: the gridding function taper and the average
//! primary beam.

use std::f64::consts::PI;

use ndarray::prelude::*;
use rayon::prelude::*;

use crate::c32;

/// The image-plane response of an `n`-pixel axis gridded with a convolution
/// function oversampled `sampling` times. Exactly 1 at pixel `n / 2`.
pub fn sinc_conv(n: usize, sampling: usize) -> Array1<f64> {
    Array1::from_shape_fn(n, |i| {
        let x = PI * (i as f64 - (n / 2) as f64) / (n as f64 * sampling as f64);
        if x == 0.0 {
            1.0
        } else {
            x.sin() / x
        }
    })
}

/// The primary beam value to divide by: `a` itself, unless it is below
/// `limit`, where it's 1.
pub fn pb_func(a: f32, limit: f32) -> f32 {
    if a.abs() >= limit {
        a
    } else {
        1.0
    }
}

/// The divisor of pixel `(ix, iy)` of polarisation `pol`.
fn divisor(
    sinc_x: &Array1<f64>,
    sinc_y: &Array1<f64>,
    avg_pb: Option<&ArrayView4<f32>>,
    pb_limit: f32,
    (ix, iy, pol): (usize, usize, usize),
) -> f64 {
    let taper = sinc_x[ix] * sinc_y[iy];
    match avg_pb {
        Some(pb) => {
            let pb_pol = pol.min(pb.len_of(Axis(2)).saturating_sub(1));
            pb_func(pb[(ix, iy, pb_pol, 0)], pb_limit) as f64 * taper
        }
        None => taper,
    }
}

/// Turn an inverse-transformed `(nx, ny, npol, nchan)` grid into an image.
///
/// Each plane with a positive weight sum is divided by
/// `pb_func(avg_pb) · sinc · sinc` (only `sinc · sinc` without a beam) and
/// scaled by `nx·ny / sum_weight`, or by `nx·ny` when `normalize` is false.
/// Planes without weight are zeroed.
pub fn normalize_image(
    image: &mut Array4<c32>,
    sum_weight: ArrayView2<f64>,
    avg_pb: Option<ArrayView4<f32>>,
    pb_limit: f32,
    sampling: usize,
    normalize: bool,
) {
    let (nx, ny, _, _) = image.dim();
    let sinc_x = sinc_conv(nx, sampling);
    let sinc_y = sinc_conv(ny, sampling);
    let npix = (nx * ny) as f64;

    image
        .axis_iter_mut(Axis(2))
        .into_par_iter()
        .enumerate()
        .for_each(|(pol, mut cube)| {
            for (chan, mut plane) in cube.axis_iter_mut(Axis(2)).enumerate() {
                let wt = sum_weight.get((pol, chan)).copied().unwrap_or(0.0);
                if wt <= 0.0 {
                    plane.fill(c32::default());
                    continue;
                }
                let scale = if normalize { npix / wt } else { npix };
                plane.indexed_iter_mut().for_each(|((ix, iy), v)| {
                    let d = divisor(&sinc_x, &sinc_y, avg_pb.as_ref(), pb_limit, (ix, iy, pol));
                    *v *= (scale / d) as f32;
                });
            }
        });
}

/// Prepare a model image for transforming to the uv plane: divide by
/// `pb_func(avg_pb) · sinc · sinc` when a beam is given, otherwise multiply by
/// `sinc · sinc`.
pub fn grid_correct(
    model: &mut Array4<c32>,
    avg_pb: Option<ArrayView4<f32>>,
    pb_limit: f32,
    sampling: usize,
) {
    let (nx, ny, _, _) = model.dim();
    let sinc_x = sinc_conv(nx, sampling);
    let sinc_y = sinc_conv(ny, sampling);
    model
        .axis_iter_mut(Axis(2))
        .into_par_iter()
        .enumerate()
        .for_each(|(pol, mut cube)| {
            cube.indexed_iter_mut().for_each(|((ix, iy, _), v)| match avg_pb.as_ref() {
                Some(_) => {
                    let d = divisor(&sinc_x, &sinc_y, avg_pb.as_ref(), pb_limit, (ix, iy, pol));
                    *v /= d as f32;
                }
                None => *v *= (sinc_x[ix] * sinc_y[iy]) as f32,
            });
        });
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn test_sinc_conv() {
        let s = sinc_conv(8, 2);
        assert_eq!(s[4], 1.0);
        let x = PI * -4.0 / 16.0;
        assert_abs_diff_eq!(s[0], x.sin() / x, epsilon = 1e-15);
        assert_abs_diff_eq!(s[3], s[5], epsilon = 1e-15);
        assert!(s.iter().all(|&v| v > 0.0 && v <= 1.0));
    }

    #[test]
    fn test_pb_func() {
        assert_eq!(pb_func(0.5, 0.05), 0.5);
        assert_eq!(pb_func(0.01, 0.05), 1.0);
        assert_eq!(pb_func(-0.5, 0.05), -0.5);
    }

    #[test]
    fn test_weight_guarded_division() {
        let mut image = Array4::from_elem((4, 4, 2, 1), c32::new(2.0, 0.0));
        let sum_weight = array![[4.0], [0.0]];
        normalize_image(&mut image, sum_weight.view(), None, 0.05, 1, true);
        // Centre pixel: no taper, scaled by 16 / 4.
        assert_abs_diff_eq!(image[(2, 2, 0, 0)], c32::new(8.0, 0.0));
        // The zero-weight plane is zeroed rather than divided.
        assert!(image.slice(s![.., .., 1, 0]).iter().all(|v| *v == c32::default()));
        assert!(image.iter().all(|v| v.re.is_finite()));
    }

    #[test]
    fn test_beam_division_respects_limit() {
        let mut pb = Array4::from_elem((4, 4, 1, 1), 0.5f32);
        pb[(0, 0, 0, 0)] = 0.01;
        let mut image = Array4::from_elem((4, 4, 1, 1), c32::new(1.0, 0.0));
        normalize_image(&mut image, array![[16.0]].view(), Some(pb.view()), 0.05, 1, true);
        assert_abs_diff_eq!(image[(2, 2, 0, 0)], c32::new(2.0, 0.0));
        // Below the limit: the beam isn't divided out, only the taper.
        let taper = (sinc_conv(4, 1)[0] * sinc_conv(4, 1)[0]) as f32;
        assert_abs_diff_eq!(image[(0, 0, 0, 0)].re, 1.0 / taper, epsilon = 1e-6);

        // Without normalisation, only nx·ny.
        let mut image = Array4::from_elem((4, 4, 1, 1), c32::new(1.0, 0.0));
        normalize_image(&mut image, array![[16.0]].view(), None, 0.05, 1, false);
        assert_abs_diff_eq!(image[(2, 2, 0, 0)], c32::new(16.0, 0.0));
    }

    #[test]
    fn test_grid_correct() {
        let mut model = Array4::from_elem((4, 4, 1, 1), c32::new(1.0, 0.0));
        let pb = Array4::from_elem((4, 4, 1, 1), 0.5f32);
        grid_correct(&mut model, Some(pb.view()), 0.05, 1);
        assert_abs_diff_eq!(model[(2, 2, 0, 0)], c32::new(2.0, 0.0));

        let mut model = Array4::from_elem((4, 4, 1, 1), c32::new(1.0, 0.0));
        grid_correct(&mut model, None, 0.05, 1);
        let taper = (sinc_conv(4, 1)[1] * sinc_conv(4, 1)[2]) as f32;
        assert_abs_diff_eq!(model[(1, 2, 0, 0)].re, taper, epsilon = 1e-6);
    }
}
