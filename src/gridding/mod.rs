// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A-projection gridding and degridding.
//!
//! [`AWProjectFT`] grids visibilities with a convolution function that
//! depends on the parallactic angle of the data, found in (or added to) a
//! [`CfCache`]. The average primary beam accumulated while making
//! convolution functions is divided out of the resulting images.

mod correction;
mod error;
pub(crate) mod fft;
mod grid;
mod kernel;
mod polmap;

pub use correction::{grid_correct, normalize_image, pb_func, sinc_conv};
pub use error::GriddingError;
pub use grid::{Grid, GridDim};
pub use polmap::{chan_map, conj_pol_map, pol_map, CorrType};

use std::sync::Arc;

use log::{debug, error, info, trace, warn};
use ndarray::prelude::*;

use self::{
    fft::{fft_planes, FftDirection},
    kernel::Kernel,
};
use crate::{
    c32,
    cf::{
        AveragePrimaryBeam, CfCache, CfEntry, CfKey, CfSource, ConvFuncBuilder, Illumination,
        ParAngleChangeDetector,
    },
    config::GridderConfig,
    constants::{MIN_AVG_PB_PEAK, VEL_C},
    vi::{VisBuffer, VisComponent, VisKind},
};

/// The image being made or predicted from.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageGeometry {
    pub nx: usize,
    pub ny: usize,
    /// \[radians\]
    pub cell: f64,
    pub pol_planes: Vec<CorrType>,
    /// \[Hz\]
    pub chan_freqs: Vec<f64>,
    /// The frequency convolution functions are made at \[Hz\].
    pub ref_freq: f64,
}

impl ImageGeometry {
    /// The uv cell along x \[wavelengths\].
    pub fn du(&self) -> f64 {
        1.0 / (self.nx as f64 * self.cell)
    }

    /// The uv cell along y \[wavelengths\].
    pub fn dv(&self) -> f64 {
        1.0 / (self.ny as f64 * self.cell)
    }

    pub fn dim(&self) -> GridDim {
        (self.nx, self.ny, self.pol_planes.len(), self.chan_freqs.len())
    }

    pub fn validate(&self) -> Result<(), GriddingError> {
        let bad = |msg: &str| Err(GriddingError::BadGeometry(msg.to_string()));
        if self.nx == 0 || self.ny == 0 {
            return bad("the image must have at least one pixel on each axis");
        }
        if !(self.cell > 0.0) {
            return bad("the cell size must be positive");
        }
        if self.pol_planes.is_empty() {
            return bad("there must be at least one polarisation plane");
        }
        if self.chan_freqs.is_empty() {
            return bad("there must be at least one image channel");
        }
        if !(self.ref_freq > 0.0) {
            return bad("the reference frequency must be positive");
        }
        Ok(())
    }
}

/// The polarisation and channel maps, and the buffer layout they were made
/// for.
#[derive(Clone, Debug, Default)]
struct Maps {
    corr_type: Vec<i32>,
    frequency: Vec<f64>,
    pol: Vec<Option<usize>>,
    conj_pol: Vec<Option<usize>>,
    chan: Vec<Option<usize>>,
}

fn new_kernel<'a>(
    cf: &'a CfEntry,
    maps: &'a Maps,
    geometry: &ImageGeometry,
    config: &GridderConfig,
) -> Kernel<'a> {
    Kernel {
        cf,
        pol_map: &maps.pol,
        conj_pol_map: &maps.conj_pol,
        chan_map: &maps.chan,
        nx: geometry.nx,
        ny: geometry.ny,
        du: geometry.du(),
        dv: geometry.dv(),
        use_autocorrelations: config.use_autocorrelations,
    }
}

/// The A-projection gridder.
pub struct AWProjectFT {
    config: GridderConfig,
    geometry: ImageGeometry,
    illumination: Box<dyn Illumination>,
    cache: CfCache,
    /// What cached convolution functions must have been made for.
    cf_key: CfKey,
    pa_detector: ParAngleChangeDetector,
    cf: Option<Arc<CfEntry>>,
    last_source: Option<CfSource>,
    avg_pb: Option<AveragePrimaryBeam>,
    grid: Option<Grid>,
    weight_grid: Option<Grid>,
    /// `(npol, nchan)`
    sum_weight: Array2<f64>,
    maps: Maps,
    making_psf: bool,
}

impl AWProjectFT {
    pub fn new(
        config: GridderConfig,
        geometry: ImageGeometry,
        illumination: Box<dyn Illumination>,
    ) -> Result<AWProjectFT, GriddingError> {
        config.validate()?;
        geometry.validate()?;
        let cache = CfCache::new(config.cf_cache_dir.as_ref())?;
        let pa_detector = ParAngleChangeDetector::new(config.pa_tolerance_rad());
        let sum_weight = Array2::zeros((geometry.pol_planes.len(), geometry.chan_freqs.len()));
        let cf_key = CfKey {
            ref_freq: geometry.ref_freq,
            uv_cell: [geometry.du(), geometry.dv()],
            pol_planes: geometry.pol_planes.clone(),
            conv_size: config.conv_size,
            sampling: config.oversampling,
        };
        Ok(AWProjectFT {
            config,
            geometry,
            illumination,
            cache,
            cf_key,
            pa_detector,
            cf: None,
            last_source: None,
            avg_pb: None,
            grid: None,
            weight_grid: None,
            sum_weight,
            maps: Maps::default(),
            making_psf: false,
        })
    }

    pub fn config(&self) -> &GridderConfig {
        &self.config
    }

    pub fn geometry(&self) -> &ImageGeometry {
        &self.geometry
    }

    pub fn cache(&self) -> &CfCache {
        &self.cache
    }

    /// The convolution function in use.
    pub fn conv_function(&self) -> Option<&Arc<CfEntry>> {
        self.cf.as_ref()
    }

    /// Where the last lookup found its convolution function.
    pub fn last_cf_source(&self) -> Option<CfSource> {
        self.last_source
    }

    pub fn avg_pb(&self) -> Option<&AveragePrimaryBeam> {
        self.avg_pb.as_ref()
    }

    /// `(npol, nchan)`
    pub fn sum_weight(&self) -> ArrayView2<f64> {
        self.sum_weight.view()
    }

    pub fn is_grid_tiled(&self) -> bool {
        self.grid.as_ref().map(Grid::is_tiled).unwrap_or(false)
    }

    pub fn pol_map(&self) -> &[Option<usize>] {
        &self.maps.pol
    }

    pub fn conj_pol_map(&self) -> &[Option<usize>] {
        &self.maps.conj_pol
    }

    pub fn chan_map(&self) -> &[Option<usize>] {
        &self.maps.chan
    }

    /// How far the parallactic angle may move before a new convolution
    /// function is needed \[radians\]. Negative switches aperture rotation off.
    pub fn set_pa_increment(&mut self, angle: f64) {
        debug!("Parallactic angle increment set to {:.3}°", angle.to_degrees());
        self.pa_detector = ParAngleChangeDetector::new(angle);
    }

    fn init_maps(&mut self, vb: &VisBuffer) {
        if self.maps.corr_type == vb.corr_type
            && self.maps.frequency.as_slice() == vb.frequency.as_slice().unwrap_or(&[])
            && !self.maps.pol.is_empty()
        {
            return;
        }
        let frequency = vb.frequency.to_vec();
        self.maps = Maps {
            pol: pol_map(&vb.corr_type, &self.geometry.pol_planes),
            conj_pol: conj_pol_map(&vb.corr_type, &self.geometry.pol_planes),
            chan: chan_map(&frequency, &self.geometry.chan_freqs),
            corr_type: vb.corr_type.clone(),
            frequency,
        };
        trace!(
            "Polarisation map {:?}, conjugate map {:?}",
            self.maps.pol,
            self.maps.conj_pol
        );
    }

    fn new_grid(&self) -> Result<Grid, GriddingError> {
        Ok(Grid::new(
            self.geometry.dim(),
            self.config.cache_size_bytes,
            self.config.tile_size,
        )?)
    }

    /// Prepare to grid: clear the grids and weights and build the maps for
    /// the layout of `vb`.
    pub fn initialize_to_sky(&mut self, vb: &VisBuffer) -> Result<(), GriddingError> {
        self.grid = Some(self.new_grid()?);
        self.weight_grid = Some(self.new_grid()?);
        self.sum_weight.fill(0.0);
        self.making_psf = false;
        self.init_maps(vb);
        Ok(())
    }

    fn w_scale(&self, vb: &VisBuffer) -> f64 {
        if self.config.w_planes <= 1 || vb.uvw.nrows() < 3 {
            return 0.0;
        }
        let max_freq = vb.frequency.iter().copied().fold(0.0, f64::max);
        let max_w = vb
            .uvw
            .row(2)
            .iter()
            .fold(0.0f64, |acc, w| acc.max(w.abs()))
            * max_freq
            / VEL_C;
        if max_w > 0.0 {
            ((self.config.w_planes - 1) as f64).powi(2) / max_w
        } else {
            0.0
        }
    }

    fn builder(&self) -> ConvFuncBuilder<'_> {
        ConvFuncBuilder::new(
            self.illumination.as_ref(),
            self.config.conv_size,
            self.config.oversampling,
            self.config.w_planes,
        )
    }

    /// Make sure the convolution function matches the parallactic angle of
    /// `vb`, fetching or building one if the angle has moved too far.
    pub fn find_conv_function(&mut self, vb: &VisBuffer) -> Result<(), GriddingError> {
        let pa = if self.pa_detector.rotation_enabled() {
            vb.parallactic_angle
        } else {
            0.0
        };
        if self.cf.is_some() && !self.pa_detector.changed(pa) {
            return Ok(());
        }

        let (source, found) =
            self.cache
                .locate(&self.cf_key, self.config.w_planes, pa, self.pa_detector.tolerance())?;
        let cf = match found {
            Some(cf) => cf,
            None => {
                let builder = self.builder();
                let entry = builder.build(&self.geometry, pa, self.w_scale(vb))?;
                let contribution = builder.power_pattern(&self.geometry)?;
                let cf = self.cache.cache(entry)?;

                let (nx, ny, npol, _) = self.geometry.dim();
                let mut pb = match self.cache.load_avg_pb(&self.cf_key)? {
                    Some(pb) => pb,
                    None => AveragePrimaryBeam::new(nx, ny, npol),
                };
                pb.accumulate(contribution.view())?;
                self.cache.store_avg_pb(&self.cf_key, &pb)?;
                self.avg_pb = Some(pb);
                cf
            }
        };

        if self.avg_pb.is_none() {
            match self.cache.load_avg_pb(&self.cf_key)? {
                Some(pb) => self.avg_pb = Some(pb),
                None => {
                    warn!("No average primary beam was found in the cache; making one");
                    self.make_sensitivity_image()?;
                }
            }
        }
        self.verify_shapes(&cf)?;
        self.pa_detector.update(pa);

        if source != CfSource::MemoryHit {
            info!(
                "Memory used in gridding functions = {} KB",
                (self.cache.size_bytes() + 512) / 1024
            );
            info!("Convolution support = {:?} pixels in the Fourier plane", cf.support);
        }
        self.last_source = Some(source);
        self.cf = Some(cf);
        Ok(())
    }

    fn verify_shapes(&self, cf: &CfEntry) -> Result<(), GriddingError> {
        let (nx, ny, npol, _) = self.geometry.dim();
        if let Some(pb) = &self.avg_pb {
            let (pnx, pny, pnpol, _) = pb.dim();
            if (pnx, pny, pnpol) != (nx, ny, npol) {
                return Err(GriddingError::BadArrayShape {
                    argument: "avg_pb".to_string(),
                    function: "AWProjectFT::find_conv_function".to_string(),
                    expected: format!("{:?}", [nx, ny, npol, 1]),
                    received: format!("{:?}", pb.data().shape()),
                });
            }
        }
        if cf.n_pol() != npol {
            return Err(GriddingError::BadArrayShape {
                argument: "cf".to_string(),
                function: "AWProjectFT::find_conv_function".to_string(),
                expected: format!("{npol} polarisation planes"),
                received: format!("{:?}", cf.kernel.shape()),
            });
        }
        if !self.cf_key.matches_entry(cf) {
            return Err(GriddingError::IncompatibleCf {
                expected: format!("{:?}", self.cf_key),
                received: format!("{:?}", CfKey::of(cf)),
            });
        }
        Ok(())
    }

    fn rows(vb: &VisBuffer, row: Option<usize>) -> Result<std::ops::Range<usize>, GriddingError> {
        let num_rows = vb.n_row();
        match row {
            None => Ok(0..num_rows),
            Some(row) if row < num_rows => Ok(row..row + 1),
            Some(row) => Err(GriddingError::RowOutOfRange { row, num_rows }),
        }
    }

    /// Every per-sample array of `vb` (and `vis`) must agree with its
    /// `(npol, nchan, nrow)`, and `uvw` must be `(3, nrow)`.
    fn check_buffer(
        vb: &VisBuffer,
        vis: Option<&Array3<c32>>,
        function: &str,
    ) -> Result<(), GriddingError> {
        let (npol, nchan, nrow) = (vb.n_pol(), vb.n_chan(), vb.n_row());
        let cube = [npol, nchan, nrow];
        let shapes: [(&str, Option<&[usize]>, &[usize]); 8] = [
            ("vb.uvw", Some(vb.uvw.shape()), &[3, nrow]),
            ("vb.vis", vis.map(|v| v.shape()), &cube),
            ("vb.flag_cube", vb.flag_cube.as_ref().map(|f| f.shape()), &cube),
            ("vb.weight_spectrum", vb.weight_spectrum.as_ref().map(|w| w.shape()), &cube),
            ("vb.weight_mat", vb.weight_mat.as_ref().map(|w| w.shape()), &[npol, nrow]),
            ("vb.flag_row", vb.flag_row.as_ref().map(|f| f.shape()), &[nrow]),
            ("vb.antenna1", Some(vb.antenna1.shape()), &[nrow]),
            ("vb.antenna2", Some(vb.antenna2.shape()), &[nrow]),
        ];
        for (argument, received, expected) in shapes {
            match received {
                Some(received) if received != expected => {
                    return Err(GriddingError::BadArrayShape {
                        argument: argument.to_string(),
                        function: function.to_string(),
                        expected: format!("{:?}", expected),
                        received: format!("{:?}", received),
                    })
                }
                _ => (),
            }
        }
        Ok(())
    }

    /// Grid the `kind` visibilities of `vb` (of one row, or all of them).
    /// With `dopsf`, unit visibilities are gridded instead.
    pub fn put(
        &mut self,
        vb: &VisBuffer,
        row: Option<usize>,
        dopsf: bool,
        kind: VisKind,
    ) -> Result<(), GriddingError> {
        let rows = Self::rows(vb, row)?;
        let vis = if dopsf {
            None
        } else {
            Some(vb.vis(kind).ok_or_else(|| GriddingError::MissingVisibilities {
                kind: format!("{:?}", kind),
            })?)
        };
        Self::check_buffer(vb, vis, "AWProjectFT::put")?;
        self.find_conv_function(vb)?;
        self.init_maps(vb);
        self.making_psf = dopsf;

        let (grid, weight_grid, cf) = match (&mut self.grid, &mut self.weight_grid, &self.cf) {
            (Some(g), Some(w), Some(cf)) => (g, w, cf),
            _ => return Err(GriddingError::NotInitialized { function: "put" }),
        };
        let kernel = new_kernel(cf, &self.maps, &self.geometry, &self.config);
        trace!("Gridding rows {:?} of subchunk {:?}", rows, vb.subchunk);
        kernel.grid(vb, rows, vis, grid, weight_grid, &mut self.sum_weight)?;
        Ok(())
    }

    fn degrid(
        &mut self,
        vb: &mut VisBuffer,
        row: Option<usize>,
        with_gradients: bool,
    ) -> Result<Option<(Array3<c32>, Array3<c32>)>, GriddingError> {
        let rows = Self::rows(vb, row)?;
        Self::check_buffer(vb, None, "AWProjectFT::get")?;
        self.find_conv_function(vb)?;
        self.init_maps(vb);

        let shape = (vb.n_pol(), vb.n_chan(), vb.n_row());
        let mut model = match vb.vis(VisKind::Model) {
            Some(m) if m.dim() == shape => m.clone(),
            _ => Array3::zeros(shape),
        };
        model
            .slice_mut(s![.., .., rows.clone()])
            .fill(c32::default());
        let mut gradients = with_gradients.then(|| (Array3::zeros(shape), Array3::zeros(shape)));

        let (grid, cf) = match (&mut self.grid, &self.cf) {
            (Some(g), Some(cf)) => (g, cf),
            _ => return Err(GriddingError::NotInitialized { function: "get" }),
        };
        let kernel = new_kernel(cf, &self.maps, &self.geometry, &self.config);
        kernel.degrid(
            vb,
            rows,
            grid,
            &mut model,
            gradients.as_mut().map(|(l, m)| (l, m)),
        )?;
        vb.set_vis(VisKind::Model, model);
        vb.mark_dirty(VisComponent::Model);
        Ok(gradients)
    }

    /// Predict model visibilities into `vb` (one row, or all of them) from
    /// the grid made by [`Self::initialize_to_vis`].
    pub fn get(&mut self, vb: &mut VisBuffer, row: Option<usize>) -> Result<(), GriddingError> {
        self.degrid(vb, row, false).map(|_| ())
    }

    /// As [`Self::get`], also returning the derivatives of the model with
    /// respect to `l` and `m`, each `(npol, nchan, nrow)`.
    pub fn get_with_gradients(
        &mut self,
        vb: &mut VisBuffer,
        row: Option<usize>,
    ) -> Result<(Array3<c32>, Array3<c32>), GriddingError> {
        let shape = (vb.n_pol(), vb.n_chan(), vb.n_row());
        Ok(self
            .degrid(vb, row, true)?
            .unwrap_or_else(|| (Array3::zeros(shape), Array3::zeros(shape))))
    }

    pub fn finalize_to_sky(&mut self) -> Result<(), GriddingError> {
        for grid in [&mut self.grid, &mut self.weight_grid].into_iter().flatten() {
            grid.flush()?;
        }
        self.pa_detector.reset();
        self.cache.flush()?;
        Ok(())
    }

    pub fn finalize_to_vis(&mut self) -> Result<(), GriddingError> {
        if let Some(grid) = &mut self.grid {
            grid.flush()?;
        }
        self.pa_detector.reset();
        Ok(())
    }

    /// Prepare to predict from `model`, an `(nx, ny, npol, nchan)` image: find
    /// the convolution function, correct the model for the gridding taper and
    /// the average primary beam, and transform it to the uv plane.
    pub fn initialize_to_vis(
        &mut self,
        model: ArrayView4<c32>,
        vb: &VisBuffer,
    ) -> Result<(), GriddingError> {
        let dim = self.geometry.dim();
        if model.dim() != dim {
            return Err(GriddingError::BadArrayShape {
                argument: "model".to_string(),
                function: "AWProjectFT::initialize_to_vis".to_string(),
                expected: format!("{:?}", [dim.0, dim.1, dim.2, dim.3]),
                received: format!("{:?}", model.shape()),
            });
        }
        self.making_psf = false;
        self.init_maps(vb);
        self.find_conv_function(vb)?;
        self.normalize_avg_pb()?;
        let pb = match &self.avg_pb {
            Some(pb) if pb.is_ready() => pb,
            Some(pb) => return Err(GriddingError::NoSensitivity { peak: pb.peak() }),
            None => return Err(GriddingError::NoSensitivity { peak: 0.0 }),
        };

        let mut uv = model.to_owned();
        let pb_view = self.config.do_pb_correction.then(|| pb.data());
        grid_correct(&mut uv, pb_view, self.config.pb_limit, self.config.oversampling);
        fft_planes(&mut uv, FftDirection::Forward);
        self.grid = Some(Grid::from_array(
            uv,
            self.config.cache_size_bytes,
            self.config.tile_size,
        )?);
        Ok(())
    }

    /// The image made from everything gridded since
    /// [`Self::initialize_to_sky`], with the weight sums of each
    /// `(pol, chan)`. `normalize` divides by the weight sums.
    pub fn get_image(
        &mut self,
        normalize: bool,
    ) -> Result<(Array4<c32>, Array2<f64>), GriddingError> {
        let grid = self
            .grid
            .as_mut()
            .ok_or(GriddingError::NotInitialized { function: "get_image" })?;
        if self.sum_weight.iter().all(|&w| w == 0.0) {
            error!("No useful data in AWProjectFT: all weights are zero");
            return Ok((Array4::zeros(self.geometry.dim()), self.sum_weight.clone()));
        }
        let mut image = grid.to_array()?;
        fft_planes(&mut image, FftDirection::Inverse);

        let pb = if self.making_psf || !self.config.do_pb_correction {
            None
        } else {
            self.normalize_avg_pb()?;
            self.avg_pb.as_ref().map(|pb| pb.data())
        };
        normalize_image(
            &mut image,
            self.sum_weight.view(),
            pb,
            self.config.pb_limit,
            self.config.oversampling,
            normalize,
        );
        Ok((image, self.sum_weight.clone()))
    }

    /// The image of the gridded weight functions, scaled by
    /// `nx·ny / sum_weight`, with the first two polarisation planes averaged.
    pub fn get_weight_image(&mut self) -> Result<(Array4<f32>, Array2<f64>), GriddingError> {
        let (nx, ny, npol, nchan) = self.geometry.dim();
        let npix = (nx * ny) as f64;
        let mut out = Array4::<f32>::zeros((nx, ny, npol, nchan));
        match &mut self.weight_grid {
            Some(grid) => {
                let mut wt = grid.to_array()?;
                fft_planes(&mut wt, FftDirection::Inverse);
                for ((pol, chan), &sum) in self.sum_weight.indexed_iter() {
                    if sum > 0.0 {
                        let scale = (npix / sum) as f32;
                        out.slice_mut(s![.., .., pol, chan])
                            .zip_mut_with(&wt.slice(s![.., .., pol, chan]), |o, w| {
                                *o = w.re * scale
                            });
                    }
                }
            }
            None => {
                for ((pol, chan), &sum) in self.sum_weight.indexed_iter() {
                    out.slice_mut(s![.., .., pol, chan]).fill(sum as f32);
                }
            }
        }
        if npol >= 2 {
            let mean = (&out.index_axis(Axis(2), 0) + &out.index_axis(Axis(2), 1)) / 2.0;
            out.index_axis_mut(Axis(2), 0).assign(&mean);
            out.index_axis_mut(Axis(2), 1).assign(&mean);
        }
        Ok((out, self.sum_weight.clone()))
    }

    /// Replace the average primary beam with the unrotated power pattern of
    /// the illumination, and store it in the cache.
    pub fn make_sensitivity_image(&mut self) -> Result<(), GriddingError> {
        let (nx, ny, npol, _) = self.geometry.dim();
        let contribution = self.builder().power_pattern(&self.geometry)?;
        let mut pb = AveragePrimaryBeam::new(nx, ny, npol);
        pb.accumulate(contribution.view())?;
        self.cache.store_avg_pb(&self.cf_key, &pb)?;
        self.avg_pb = Some(pb);
        Ok(())
    }

    /// Normalise the average primary beam to a unit peak, once.
    pub fn normalize_avg_pb(&mut self) -> Result<(), GriddingError> {
        if let Some(pb) = &mut self.avg_pb {
            if !pb.is_normalized() {
                info!("Normalising the average PBs to unity");
                pb.normalize();
                if pb.peak() < MIN_AVG_PB_PEAK {
                    warn!("The average primary beam peaks at {}", pb.peak());
                }
                self.cache.store_avg_pb(&self.cf_key, pb)?;
            }
        }
        Ok(())
    }
}
