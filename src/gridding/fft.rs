// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Centred 2D FFTs of ndarray planes.

use ndarray::prelude::*;
use num_complex::Complex;
use rayon::prelude::*;
use rustfft::{FftNum, FftPlanner};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FftDirection {
    /// Unnormalised.
    Forward,
    /// Scaled by `1 / (nx * ny)`.
    Inverse,
}

/// Move the element at `n/2` to 0, along both axes.
fn ifftshift<T: Copy>(plane: &mut ArrayViewMut2<T>) {
    let (nx, ny) = plane.dim();
    let copy = plane.to_owned();
    plane.indexed_iter_mut().for_each(|((i, j), v)| {
        *v = copy[((i + nx / 2) % nx, (j + ny / 2) % ny)];
    });
}

/// Move the element at 0 to `n/2`, along both axes.
fn fftshift<T: Copy>(plane: &mut ArrayViewMut2<T>) {
    let (nx, ny) = plane.dim();
    let copy = plane.to_owned();
    plane.indexed_iter_mut().for_each(|((i, j), v)| {
        *v = copy[((i + nx - nx / 2) % nx, (j + ny - ny / 2) % ny)];
    });
}

/// FFT a plane whose origin is at pixel `(nx/2, ny/2)`, leaving the origin of
/// the result there too.
pub fn fft2_centred<T: FftNum>(mut plane: ArrayViewMut2<Complex<T>>, direction: FftDirection) {
    let (nx, ny) = plane.dim();
    if nx == 0 || ny == 0 {
        return;
    }
    ifftshift(&mut plane);

    let mut planner = FftPlanner::<T>::new();
    for (axis, n) in [(Axis(0), nx), (Axis(1), ny)] {
        let fft = match direction {
            FftDirection::Forward => planner.plan_fft_forward(n),
            FftDirection::Inverse => planner.plan_fft_inverse(n),
        };
        let mut buffer = vec![Complex::new(T::zero(), T::zero()); n];
        for mut lane in plane.lanes_mut(axis) {
            buffer
                .iter_mut()
                .zip(lane.iter())
                .for_each(|(b, l)| *b = *l);
            fft.process(&mut buffer);
            lane.iter_mut().zip(buffer.iter()).for_each(|(l, b)| *l = *b);
        }
    }

    fftshift(&mut plane);
    if direction == FftDirection::Inverse {
        let scale = T::from_usize(nx * ny).map(|n| T::one() / n).unwrap_or_else(T::one);
        plane.mapv_inplace(|v| v * scale);
    }
}

/// FFT every `(nx, ny)` plane of an `(nx, ny, npol, nchan)` cube, in
/// parallel over polarisations.
pub fn fft_planes<T: FftNum>(cube: &mut Array4<Complex<T>>, direction: FftDirection) {
    cube.axis_iter_mut(Axis(2))
        .into_par_iter()
        .for_each(|mut pol| {
            for plane in pol.axis_iter_mut(Axis(2)) {
                fft2_centred(plane, direction);
            }
        });
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::c64;

    #[test]
    fn test_centred_delta_is_flat() {
        let mut a = Array2::<c64>::zeros((8, 6));
        a[(4, 3)] = c64::new(1.0, 0.0);
        fft2_centred(a.view_mut(), FftDirection::Forward);
        assert_abs_diff_eq!(a, Array2::from_elem((8, 6), c64::new(1.0, 0.0)), epsilon = 1e-12);
    }

    #[test]
    fn test_forward_then_inverse() {
        let orig = Array2::from_shape_fn((7, 4), |(i, j)| c64::new(i as f64, j as f64 * 0.5));
        let mut a = orig.clone();
        fft2_centred(a.view_mut(), FftDirection::Forward);
        fft2_centred(a.view_mut(), FftDirection::Inverse);
        assert_abs_diff_eq!(a, orig, epsilon = 1e-10);
    }

    #[test]
    fn test_cube() {
        let mut cube = Array4::<Complex<f32>>::zeros((4, 4, 2, 3));
        cube[(2, 2, 1, 2)] = Complex::new(16.0, 0.0);
        fft_planes(&mut cube, FftDirection::Inverse);
        assert_abs_diff_eq!(cube[(0, 3, 1, 2)], Complex::new(1.0, 0.0), epsilon = 1e-6);
        assert_abs_diff_eq!(cube[(0, 3, 0, 2)], Complex::new(0.0, 0.0));
    }
}
