// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Building convolution functions from an aperture illumination.
//!
//! The aperture of each feed is sampled on an oversampled uv grid, rotated
//! by the parallactic angle, and transformed into a voltage pattern. For each
//! correlation the product of the two voltage patterns (times a w-screen for
//! each w-plane) is transformed back to the uv plane; that is the
//! convolution function. The weight function is built the same way from the
//! squared magnitude of the product, and the average primary beam
//! contribution is the unrotated power pattern on the image grid.

use std::collections::HashMap;
use std::f64::consts::TAU;

use log::{info, warn};
use ndarray::prelude::*;
use rayon::prelude::*;

use super::{CfCoordSys, CfEntry, CfError, Feed, Illumination};
use crate::{
    c32, c64,
    constants::{CF_SUPPORT_THRESHOLD, VEL_C},
    gridding::{
        fft::{fft2_centred, FftDirection},
        CorrType, ImageGeometry,
    },
};

pub struct ConvFuncBuilder<'a> {
    illumination: &'a dyn Illumination,
    conv_size: usize,
    sampling: usize,
    w_planes: usize,
}

impl<'a> ConvFuncBuilder<'a> {
    pub fn new(
        illumination: &'a dyn Illumination,
        conv_size: usize,
        sampling: usize,
        w_planes: usize,
    ) -> ConvFuncBuilder<'a> {
        ConvFuncBuilder {
            illumination,
            conv_size,
            sampling,
            w_planes,
        }
    }

    /// The uv spacing of the oversampled grid, per axis \[wavelengths\].
    fn uv_spacing(&self, geometry: &ImageGeometry) -> (f64, f64) {
        let s = self.sampling as f64;
        (geometry.du() / s, geometry.dv() / s)
    }

    /// The voltage pattern of `feed`, with its origin at `conv_size / 2`.
    fn voltage_pattern(&self, geometry: &ImageGeometry, feed: Feed, pa: f64) -> Array2<c64> {
        let n = self.conv_size;
        let (du, dv) = self.uv_spacing(geometry);
        let lambda = VEL_C / geometry.ref_freq;
        let (s_pa, c_pa) = pa.sin_cos();
        let mut aperture = Array2::from_shape_fn((n, n), |(i, j)| {
            let u = (i as f64 - (n / 2) as f64) * du * lambda;
            let v = (j as f64 - (n / 2) as f64) * dv * lambda;
            // Into the antenna frame.
            let u_ant = u * c_pa + v * s_pa;
            let v_ant = -u * s_pa + v * c_pa;
            self.illumination
                .evaluate(u_ant, v_ant, geometry.ref_freq, feed)
        });
        fft2_centred(aperture.view_mut(), FftDirection::Forward);
        aperture
    }

    fn voltage_patterns(
        &self,
        geometry: &ImageGeometry,
        pa: f64,
    ) -> HashMap<Feed, Array2<c64>> {
        let mut feeds: Vec<Feed> = geometry
            .pol_planes
            .iter()
            .flat_map(|c| {
                let (a, b) = c.feeds();
                [a, b]
            })
            .collect();
        feeds.sort_by_key(|f| *f as u8);
        feeds.dedup();
        feeds
            .into_par_iter()
            .map(|f| (f, self.voltage_pattern(geometry, f, pa)))
            .collect()
    }

    /// `(l, m)` of pixel `(i, j)` of a voltage pattern \[direction cosines\].
    fn lm(&self, geometry: &ImageGeometry, i: usize, j: usize) -> (f64, f64) {
        let n = self.conv_size as f64;
        let (du, dv) = self.uv_spacing(geometry);
        (
            (i as f64 - (self.conv_size / 2) as f64) / (n * du),
            (j as f64 - (self.conv_size / 2) as f64) / (n * dv),
        )
    }

    /// Build the convolution and weight functions for the image polarisation
    /// planes of `geometry` at parallactic angle `pa` \[radians\].
    pub fn build(&self, geometry: &ImageGeometry, pa: f64, w_scale: f64) -> Result<CfEntry, CfError> {
        let n = self.conv_size;
        let npol = geometry.pol_planes.len();
        info!(
            "Making a {n}x{n}x{}x{npol} convolution function from a {} at parallactic angle {:.2}°",
            self.w_planes,
            self.illumination.name(),
            pa.to_degrees()
        );
        let patterns = self.voltage_patterns(geometry, pa);
        let mut kernel = Array4::<c32>::zeros((n, n, self.w_planes, npol));
        let mut weight = Array4::<c32>::zeros((n, n, self.w_planes, npol));
        let mut support = vec![0usize; self.w_planes];

        for (ip, &corr) in geometry.pol_planes.iter().enumerate() {
            let (fa, fb) = corr.feeds();
            let (ea, eb) = match (patterns.get(&fa), patterns.get(&fb)) {
                (Some(a), Some(b)) => (a, b),
                _ => return Err(CfError::EmptyAperture { corr: corr.to_string() }),
            };
            let product = Array2::from_shape_fn((n, n), |ij| ea[ij] * eb[ij].conj());

            let planes: Vec<Array2<c64>> = (0..self.w_planes)
                .into_par_iter()
                .map(|iw| {
                    let mut plane = self.w_screened(geometry, &product, iw, w_scale);
                    fft2_centred(plane.view_mut(), FftDirection::Inverse);
                    plane
                })
                .collect();
            let area = sampled_area(&planes[0], self.sampling);
            if area == 0.0 || !area.is_finite() {
                return Err(CfError::EmptyAperture { corr: corr.to_string() });
            }
            for (iw, plane) in planes.iter().enumerate() {
                let r = find_support(plane.view(), CF_SUPPORT_THRESHOLD);
                support[iw] = support[iw].max(r);
                kernel
                    .slice_mut(s![.., .., iw, ip])
                    .zip_mut_with(plane, |k, p| *k = to_c32(*p / area));
            }

            let mut power = product.mapv(|p| c64::new(p.norm_sqr(), 0.0));
            fft2_centred(power.view_mut(), FftDirection::Inverse);
            let wt_area = sampled_area(&power, self.sampling);
            let wt_area = if wt_area > 0.0 { wt_area } else { 1.0 };
            for iw in 0..self.w_planes {
                weight
                    .slice_mut(s![.., .., iw, ip])
                    .zip_mut_with(&power, |k, p| *k = to_c32(*p / wt_area));
            }
        }

        // Radius in oversampled pixels to grid pixels.
        let max_support = (n / 2) / self.sampling;
        let support = support
            .into_iter()
            .map(|r| {
                let s = (0.5 + r as f64 / self.sampling as f64).floor() as usize + 1;
                if s > max_support {
                    warn!(
                        "Convolution function support of {s} pixels is larger than the {max_support} available; clamping"
                    );
                    max_support
                } else {
                    s
                }
            })
            .collect::<Vec<_>>();
        if support.iter().any(|&s| s == 0) {
            return Err(CfError::ZeroSupport {
                pa_deg: pa.to_degrees(),
            });
        }
        info!("Convolution support = {:?} pixels in the Fourier plane", support);

        Ok(CfEntry {
            kernel,
            weight,
            support,
            sampling: self.sampling,
            pa,
            w_scale,
            coord_sys: CfCoordSys {
                ref_freq: geometry.ref_freq,
                uv_cell: [geometry.du(), geometry.dv()],
                pol_planes: geometry.pol_planes.clone(),
                pa,
            },
        })
    }

    /// Multiply a voltage pattern product by the w-screen of plane `iw`.
    fn w_screened(
        &self,
        geometry: &ImageGeometry,
        product: &Array2<c64>,
        iw: usize,
        w_scale: f64,
    ) -> Array2<c64> {
        if iw == 0 || w_scale <= 0.0 {
            return product.clone();
        }
        let w = (iw * iw) as f64 / w_scale;
        Array2::from_shape_fn(product.dim(), |(i, j)| {
            let (l, m) = self.lm(geometry, i, j);
            let r2 = l * l + m * m;
            if r2 >= 1.0 {
                return c64::new(0.0, 0.0);
            }
            let phase = TAU * w * ((1.0 - r2).sqrt() - 1.0);
            product[(i, j)] * c64::from_polar(1.0, phase)
        })
    }

    /// The unrotated power pattern of each image polarisation plane on the
    /// image grid, shaped `(nx, ny, npol, 1)`.
    pub fn power_pattern(&self, geometry: &ImageGeometry) -> Result<Array4<f32>, CfError> {
        let patterns = self.voltage_patterns(geometry, 0.0);
        let n = self.conv_size as f64;
        let (nx, ny) = (geometry.nx, geometry.ny);
        // Image pixels per voltage pattern pixel.
        let (du, dv) = self.uv_spacing(geometry);
        let step_x = n * du * geometry.cell;
        let step_y = n * dv * geometry.cell;
        let centre = (self.conv_size / 2) as f64;

        let mut out = Array4::zeros((nx, ny, geometry.pol_planes.len(), 1));
        for (ip, corr) in geometry.pol_planes.iter().enumerate() {
            let (fa, fb) = corr.feeds();
            let (ea, eb) = match (patterns.get(&fa), patterns.get(&fb)) {
                (Some(a), Some(b)) => (a, b),
                _ => return Err(CfError::EmptyAperture { corr: corr.to_string() }),
            };
            out.slice_mut(s![.., .., ip, 0])
                .indexed_iter_mut()
                .for_each(|((ix, iy), v)| {
                    let i = (centre + (ix as f64 - (nx / 2) as f64) * step_x).round();
                    let j = (centre + (iy as f64 - (ny / 2) as f64) * step_y).round();
                    if i >= 0.0 && j >= 0.0 && i < n && j < n {
                        let ij = (i as usize, j as usize);
                        *v = (ea[ij] * eb[ij].conj()).norm() as f32;
                    }
                });
        }
        Ok(out)
    }
}

fn to_c32(c: c64) -> c32 {
    c32::new(c.re as f32, c.im as f32)
}

/// The magnitude of the sum of an oversampled function, in grid pixels.
fn sampled_area(plane: &Array2<c64>, sampling: usize) -> f64 {
    plane.sum().norm() / (sampling * sampling) as f64
}

/// The largest radius (in oversampled pixels, about the centre) at which some
/// sample on a circle exceeds `threshold` of the peak magnitude. 0 if none
/// does.
pub(crate) fn find_support(plane: ArrayView2<c64>, threshold: f64) -> usize {
    let (nx, ny) = plane.dim();
    let peak = plane.iter().map(|v| v.norm()).fold(0.0, f64::max);
    if peak == 0.0 {
        return 0;
    }
    let cut = peak * threshold;
    let (cx, cy) = ((nx / 2) as f64, (ny / 2) as f64);
    let r_max = (nx.min(ny) / 2).saturating_sub(2);
    for r in (1..=r_max).rev() {
        let steps = ((TAU * r as f64).ceil() as usize).max(8);
        let found = (0..steps).any(|k| {
            let theta = TAU * k as f64 / steps as f64;
            let i = (cx + r as f64 * theta.sin()).round();
            let j = (cy + r as f64 * theta.cos()).round();
            i >= 0.0
                && j >= 0.0
                && (i as usize) < nx
                && (j as usize) < ny
                && plane[(i as usize, j as usize)].norm() > cut
        });
        if found {
            return r;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::cf::{SquintedDisk, UniformDisk};

    fn geometry(pols: Vec<CorrType>) -> ImageGeometry {
        ImageGeometry {
            nx: 32,
            ny: 32,
            // 2 degrees per pixel.
            cell: 2_f64.to_radians(),
            pol_planes: pols,
            chan_freqs: vec![1.5e8],
            ref_freq: 1.5e8,
        }
    }

    #[test]
    fn test_find_support() {
        let mut plane = Array2::<c64>::zeros((32, 32));
        plane[(16, 16)] = c64::new(1.0, 0.0);
        assert_eq!(find_support(plane.view(), 1e-3), 0);
        plane[(16, 21)] = c64::new(0.01, 0.0);
        assert_eq!(find_support(plane.view(), 1e-3), 5);
        assert_eq!(find_support(Array2::zeros((8, 8)).view(), 1e-3), 0);
    }

    #[test]
    fn test_build_uniform_disk() {
        let illum = UniformDisk {
            diameter: 7.0,
            blockage: 0.0,
        };
        let g = geometry(vec![CorrType::RR, CorrType::LL]);
        let b = ConvFuncBuilder::new(&illum, 64, 4, 1);
        let cf = b.build(&g, 0.3, 0.0).unwrap();
        assert_eq!(cf.kernel.dim(), (64, 64, 1, 2));
        assert_eq!(cf.weight.dim(), cf.kernel.dim());
        assert_eq!(cf.support.len(), 1);
        assert!(cf.support[0] >= 1 && cf.support[0] <= 8);
        assert_eq!(cf.sampling, 4);
        assert_abs_diff_eq!(cf.pa, 0.3);

        // Unit sampled area.
        let area: c32 = cf.kernel.slice(s![.., .., 0, 0]).sum() / 16.0;
        assert_abs_diff_eq!(area.norm(), 1.0, epsilon = 1e-4);
        // A symmetric aperture has the same function for both hands.
        assert_abs_diff_eq!(
            cf.kernel.slice(s![.., .., 0, 0]),
            cf.kernel.slice(s![.., .., 0, 1]),
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_squint_depends_on_pa() {
        let illum = SquintedDisk {
            diameter: 7.0,
            blockage: 0.0,
            squint: 2_f64.to_radians(),
        };
        let g = geometry(vec![CorrType::RR]);
        let b = ConvFuncBuilder::new(&illum, 64, 4, 1);
        let a = b.build(&g, 0.0, 0.0).unwrap();
        let c = b.build(&g, 1.0, 0.0).unwrap();
        let diff = (&a.kernel - &c.kernel).mapv(|v| v.norm()).sum();
        assert!(diff > 1e-3, "{diff}");
    }

    #[test]
    fn test_w_planes() {
        let illum = UniformDisk {
            diameter: 7.0,
            blockage: 0.0,
        };
        let g = geometry(vec![CorrType::XX]);
        let b = ConvFuncBuilder::new(&illum, 64, 4, 3);
        let cf = b.build(&g, 0.0, 4.0 / 50.0).unwrap();
        assert_eq!(cf.support.len(), 3);
        assert!(cf.support[2] >= cf.support[0]);
        // The weight function is the same on every plane.
        assert_abs_diff_eq!(
            cf.weight.slice(s![.., .., 0, 0]),
            cf.weight.slice(s![.., .., 2, 0])
        );
    }

    #[test]
    fn test_power_pattern_peaks_at_centre() {
        let illum = UniformDisk {
            diameter: 7.0,
            blockage: 0.0,
        };
        let g = geometry(vec![CorrType::XX, CorrType::YY]);
        let b = ConvFuncBuilder::new(&illum, 64, 4, 1);
        let p = b.power_pattern(&g).unwrap();
        assert_eq!(p.dim(), (32, 32, 2, 1));
        let peak = p.iter().copied().fold(0.0f32, f32::max);
        assert_abs_diff_eq!(p[(16, 16, 0, 0)], peak);
        assert!(p[(0, 0, 0, 0)] < peak);
    }
}
