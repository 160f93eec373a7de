// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The gridding and degridding inner loops.

use std::f64::consts::TAU;
use std::ops::Range;

use ndarray::prelude::*;

use super::grid::Grid;
use crate::{c32, cf::CfEntry, constants::VEL_C, vi::VisBuffer};

/// Where a sample lands on the grid.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Footprint {
    /// The nearest grid pixel.
    pub(crate) loc: [usize; 2],
    /// Offset into the oversampled convolution function.
    pub(crate) off: [isize; 2],
    pub(crate) w_plane: usize,
    /// Negative w uses the conjugate function.
    pub(crate) conj: bool,
    pub(crate) support: usize,
}

/// Everything the loops need besides the data.
pub(crate) struct Kernel<'a> {
    pub(crate) cf: &'a CfEntry,
    pub(crate) pol_map: &'a [Option<usize>],
    pub(crate) conj_pol_map: &'a [Option<usize>],
    pub(crate) chan_map: &'a [Option<usize>],
    pub(crate) nx: usize,
    pub(crate) ny: usize,
    /// \[wavelengths\]
    pub(crate) du: f64,
    pub(crate) dv: f64,
    pub(crate) use_autocorrelations: bool,
}

impl<'a> Kernel<'a> {
    /// The footprint of a sample at `uvw` metres and `freq_hz`, or `None` if
    /// its support would fall off the grid. The grid is filled at `(-u, -v)`.
    pub(crate) fn footprint(&self, uvw: [f64; 3], freq_hz: f64) -> Option<Footprint> {
        let scale = freq_hz / VEL_C;
        let (u, v, w) = (-uvw[0] * scale, -uvw[1] * scale, uvw[2] * scale);
        let s = self.cf.sampling as f64;
        let w_plane = self.cf.w_plane(w);
        let support = self.cf.support.get(w_plane).copied().unwrap_or(1);

        let pos = [
            u / self.du + (self.nx / 2) as f64,
            v / self.dv + (self.ny / 2) as f64,
        ];
        let loc = [pos[0].round(), pos[1].round()];
        let sup = support as f64;
        if loc[0] - sup < 0.0
            || loc[1] - sup < 0.0
            || loc[0] + sup >= self.nx as f64
            || loc[1] + sup >= self.ny as f64
        {
            return None;
        }
        Some(Footprint {
            loc: [loc[0] as usize, loc[1] as usize],
            off: [
                ((loc[0] - pos[0]) * s).round() as isize,
                ((loc[1] - pos[1]) * s).round() as isize,
            ],
            w_plane,
            conj: w < 0.0,
            support,
        })
    }

    /// The grid pixels of a footprint with their convolution function
    /// indices.
    fn taps(&self, fp: Footprint) -> impl Iterator<Item = ([usize; 2], [usize; 2])> {
        let n = self.cf.conv_size() as isize;
        let centre = n / 2;
        let s = self.cf.sampling as isize;
        let sup = fp.support as isize;
        (-sup..=sup).flat_map(move |iy| {
            (-sup..=sup).filter_map(move |ix| {
                let cx = centre + ix * s + fp.off[0];
                let cy = centre + iy * s + fp.off[1];
                if cx < 0 || cy < 0 || cx >= n || cy >= n {
                    return None;
                }
                let gx = (fp.loc[0] as isize + ix) as usize;
                let gy = (fp.loc[1] as isize + iy) as usize;
                Some(([gx, gy], [cx as usize, cy as usize]))
            })
        })
    }

    fn cf_value(kernel: &Array4<c32>, c: [usize; 2], fp: Footprint, cf_pol: usize) -> c32 {
        let v = kernel[(c[0], c[1], fp.w_plane, cf_pol)];
        if fp.conj {
            v.conj()
        } else {
            v
        }
    }

    fn skip_row(&self, vb: &VisBuffer, row: usize) -> bool {
        vb.row_flagged(row)
            || (!self.use_autocorrelations && vb.antenna1.get(row) == vb.antenna2.get(row))
    }

    fn uvw(vb: &VisBuffer, row: usize) -> [f64; 3] {
        [vb.uvw[(0, row)], vb.uvw[(1, row)], vb.uvw[(2, row)]]
    }

    /// Grid `rows` of `vis` (unit visibilities when `None`), accumulating
    /// weights into `sum_weight` and the weight function into `weight_grid`.
    pub(crate) fn grid(
        &self,
        vb: &VisBuffer,
        rows: Range<usize>,
        vis: Option<&Array3<c32>>,
        grid: &mut Grid,
        weight_grid: &mut Grid,
        sum_weight: &mut Array2<f64>,
    ) -> std::io::Result<()> {
        for row in rows {
            if self.skip_row(vb, row) {
                continue;
            }
            let uvw = Self::uvw(vb, row);
            for (chan, &freq) in vb.frequency.iter().enumerate() {
                let ichan = match self.chan_map.get(chan).copied().flatten() {
                    Some(c) => c,
                    None => continue,
                };
                let fp = match self.footprint(uvw, freq) {
                    Some(fp) => fp,
                    None => continue,
                };
                for (pol, plane) in self.pol_map.iter().enumerate() {
                    let plane = match plane {
                        Some(p) => *p,
                        None => continue,
                    };
                    if vb.is_flagged(pol, chan, row) {
                        continue;
                    }
                    let weight = vb.sample_weight(pol, chan, row);
                    let value = match vis {
                        Some(v) => v[(pol, chan, row)] * weight,
                        None => c32::new(weight, 0.0),
                    };
                    for (g, c) in self.taps(fp) {
                        let cf = Self::cf_value(&self.cf.kernel, c, fp, plane);
                        grid.add((g[0], g[1], plane, ichan), cf * value)?;
                        let wt = Self::cf_value(&self.cf.weight, c, fp, plane);
                        weight_grid.add((g[0], g[1], plane, ichan), wt * weight)?;
                    }
                    sum_weight[(plane, ichan)] += weight as f64;
                }
            }
        }
        Ok(())
    }

    /// Predict `rows` from `grid` into `model`, which is `(npol, nchan,
    /// nrow)`. With `gradients`, also the derivatives with respect to the
    /// direction cosines.
    pub(crate) fn degrid(
        &self,
        vb: &VisBuffer,
        rows: Range<usize>,
        grid: &mut Grid,
        model: &mut Array3<c32>,
        mut gradients: Option<(&mut Array3<c32>, &mut Array3<c32>)>,
    ) -> std::io::Result<()> {
        for row in rows {
            let uvw = Self::uvw(vb, row);
            for (chan, &freq) in vb.frequency.iter().enumerate() {
                let ichan = match self.chan_map.get(chan).copied().flatten() {
                    Some(c) => c,
                    None => continue,
                };
                let fp = match self.footprint(uvw, freq) {
                    Some(fp) => fp,
                    None => continue,
                };
                for (pol, (plane, cf_plane)) in
                    self.pol_map.iter().zip(self.conj_pol_map).enumerate()
                {
                    let (plane, cf_plane) = match (plane, cf_plane) {
                        (Some(p), Some(c)) => (*p, *c),
                        _ => continue,
                    };
                    let mut sum = c32::default();
                    let mut norm = c32::default();
                    let mut grad = [c32::default(); 2];
                    for (g, c) in self.taps(fp) {
                        let cf = Self::cf_value(&self.cf.kernel, c, fp, cf_plane);
                        let term = cf * grid.get((g[0], g[1], plane, ichan))?;
                        sum += term;
                        norm += cf;
                        if gradients.is_some() {
                            let du = (g[0] as f64 - (self.nx / 2) as f64) * self.du;
                            let dv = (g[1] as f64 - (self.ny / 2) as f64) * self.dv;
                            grad[0] += term * c32::new(0.0, (TAU * du) as f32);
                            grad[1] += term * c32::new(0.0, (TAU * dv) as f32);
                        }
                    }
                    if norm == c32::default() {
                        continue;
                    }
                    model[(pol, chan, row)] = sum / norm;
                    if let Some((gl, gm)) = gradients.as_mut() {
                        gl[(pol, chan, row)] = grad[0] / norm;
                        gm[(pol, chan, row)] = grad[1] / norm;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cf::CfCoordSys, gridding::CorrType};

    /// A 1-pixel-support box function oversampled twice.
    fn box_cf() -> CfEntry {
        let mut kernel = Array4::zeros((8, 8, 1, 1));
        kernel.slice_mut(s![2..7, 2..7, 0, 0]).fill(c32::new(1.0, 0.0));
        CfEntry {
            weight: kernel.clone(),
            kernel,
            support: vec![1],
            sampling: 2,
            pa: 0.0,
            w_scale: 0.0,
            coord_sys: CfCoordSys {
                ref_freq: VEL_C,
                uv_cell: [1.0, 1.0],
                pol_planes: vec![CorrType::XX],
                pa: 0.0,
            },
        }
    }

    fn kernel<'a>(cf: &'a CfEntry, pol_map: &'a [Option<usize>], chan_map: &'a [Option<usize>]) -> Kernel<'a> {
        Kernel {
            cf,
            pol_map,
            conj_pol_map: pol_map,
            chan_map,
            nx: 16,
            ny: 16,
            du: 1.0,
            dv: 1.0,
            use_autocorrelations: false,
        }
    }

    fn buffer(uvw: [f64; 3]) -> VisBuffer {
        let mut vb = VisBuffer::default();
        vb.antenna1 = array![0];
        vb.antenna2 = array![1];
        vb.uvw = Array2::from_shape_fn((3, 1), |(i, _)| uvw[i]);
        // One wavelength per metre.
        vb.frequency = array![VEL_C];
        vb.corr_type = vec![9];
        vb
    }

    #[test]
    fn test_footprint() {
        let cf = box_cf();
        let k = kernel(&cf, &[Some(0)], &[Some(0)]);
        let fp = k.footprint([2.25, -3.0, 1.0], VEL_C).unwrap();
        // (-u, -v) = (-2.25, 3) → pixel (5.75, 11)
        assert_eq!(fp.loc, [6, 11]);
        assert_eq!(fp.off, [1, 0]);
        assert!(!fp.conj);
        assert!(k.footprint([8.0, 0.0, 0.0], VEL_C).is_none());
        assert!(k.footprint([0.0, 0.0, -1.0], VEL_C).unwrap().conj);
    }

    #[test]
    fn test_grid_then_degrid_a_point() {
        let cf = box_cf();
        let k = kernel(&cf, &[Some(0)], &[Some(0)]);
        let mut vb = buffer([3.0, 2.0, 0.0]);
        let vis = Array3::from_elem((1, 1, 1), c32::new(2.0, 1.0));
        let mut grid = Grid::new((16, 16, 1, 1), u64::MAX, 4).unwrap();
        let mut wt_grid = Grid::new((16, 16, 1, 1), u64::MAX, 4).unwrap();
        let mut sum_weight = Array2::zeros((1, 1));
        k.grid(&vb, 0..1, Some(&vis), &mut grid, &mut wt_grid, &mut sum_weight)
            .unwrap();
        assert_eq!(sum_weight[(0, 0)], 1.0);
        let g = grid.to_array().unwrap();
        // 3x3 pixels around (5, 6), each with the box value.
        assert_eq!(g.iter().filter(|v| **v != c32::default()).count(), 9);
        assert_eq!(g[(5, 6, 0, 0)], c32::new(2.0, 1.0));

        let mut model = Array3::zeros((1, 1, 1));
        k.degrid(&vb, 0..1, &mut grid, &mut model, None).unwrap();
        assert_eq!(model[(0, 0, 0)], c32::new(2.0, 1.0));

        // Autocorrelations and flagged rows are skipped.
        vb.antenna2 = array![0];
        k.grid(&vb, 0..1, Some(&vis), &mut grid, &mut wt_grid, &mut sum_weight)
            .unwrap();
        vb.antenna2 = array![1];
        vb.flag_row = Some(array![true]);
        k.grid(&vb, 0..1, None, &mut grid, &mut wt_grid, &mut sum_weight)
            .unwrap();
        assert_eq!(sum_weight[(0, 0)], 1.0);
    }

    #[test]
    fn test_gradients() {
        let cf = box_cf();
        let k = kernel(&cf, &[Some(0)], &[Some(0)]);
        let vb = buffer([0.0, 0.0, 0.0]);
        let mut grid = Grid::new((16, 16, 1, 1), u64::MAX, 4).unwrap();
        // Constant grid: the derivatives are the mean cell offsets, which
        // vanish about the centre.
        for x in 0..16 {
            for y in 0..16 {
                grid.add((x, y, 0, 0), c32::new(1.0, 0.0)).unwrap();
            }
        }
        let mut model = Array3::zeros((1, 1, 1));
        let mut gl = Array3::zeros((1, 1, 1));
        let mut gm = Array3::zeros((1, 1, 1));
        k.degrid(&vb, 0..1, &mut grid, &mut model, Some((&mut gl, &mut gm)))
            .unwrap();
        assert_eq!(model[(0, 0, 0)], c32::new(1.0, 0.0));
        approx::assert_abs_diff_eq!(gl[(0, 0, 0)], c32::default(), epsilon = 1e-5);
        approx::assert_abs_diff_eq!(gm[(0, 0, 0)], c32::default(), epsilon = 1e-5);
    }
}
