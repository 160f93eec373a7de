// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A snapshot of one subchunk, as handed to the gridder.

use std::collections::BTreeSet;

use ndarray::prelude::*;

use super::{SubChunkPair, VisComponent, VisIterReadImpl, VisKind, ViError};
use crate::{c32, table::VisTable};

/// The columns of one subchunk. A buffer attached to an iterator is marked
/// invalid whenever the iterator moves; components changed by the caller can
/// be marked dirty and written back with [`super::WriteBack`].
#[derive(Clone, Debug, Default)]
pub struct VisBuffer {
    /// Where the buffer was filled from.
    pub subchunk: Option<SubChunkPair>,
    valid: bool,

    pub antenna1: Array1<i32>,
    pub antenna2: Array1<i32>,
    /// \[MJD seconds, UTC\]
    pub time: Array1<f64>,
    /// `(3, nrow)` \[metres\]
    pub uvw: Array2<f64>,
    /// `(npol, nchan, nrow)`
    pub flag_cube: Option<Array3<bool>>,
    pub flag_row: Option<Array1<bool>>,
    pub flag_category: Option<Array4<bool>>,
    pub weight: Option<Array1<f32>>,
    pub weight_mat: Option<Array2<f32>>,
    pub weight_spectrum: Option<Array3<f32>>,
    pub sigma_mat: Option<Array2<f32>>,
    /// \[Hz\]
    pub frequency: Array1<f64>,
    /// Casacore Stokes codes.
    pub corr_type: Vec<i32>,
    /// At the array centre \[radians\]
    pub parallactic_angle: f64,

    vis: [Option<Array3<c32>>; 4],
    dirty: BTreeSet<VisComponent>,
}

/// A missing column leaves the component empty; other errors propagate.
fn optional<A: Clone>(result: Result<&A, ViError>) -> Result<Option<A>, ViError> {
    match result {
        Ok(a) => Ok(Some(a.clone())),
        Err(ViError::MissingColumn { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

impl VisBuffer {
    /// Copy the current subchunk out of `vi`, along with the visibilities of
    /// each of `kinds`. Dirty marks are cleared.
    pub fn fill_from<T: VisTable>(
        &mut self,
        vi: &mut VisIterReadImpl<T>,
        kinds: &[VisKind],
    ) -> Result<(), ViError> {
        self.antenna1 = vi.antenna1()?.clone();
        self.antenna2 = vi.antenna2()?.clone();
        self.time = vi.time()?.clone();
        self.uvw = vi.uvw()?.clone();
        self.flag_cube = optional(vi.flag_cube())?;
        self.flag_row = Some(vi.flag_row()?.clone());
        self.flag_category = optional(vi.flag_category())?;
        self.weight_mat = optional(vi.weight_mat())?;
        self.weight = optional(vi.weight())?;
        self.weight_spectrum = optional(vi.weight_spectrum())?;
        self.sigma_mat = optional(vi.sigma_mat())?;
        self.frequency = vi.frequency()?.clone();
        self.corr_type = vi.corr_type()?;
        self.parallactic_angle = vi.parallactic_angle()?;
        self.vis = Default::default();
        for &kind in kinds {
            self.vis[kind.index()] = Some(vi.visibility(kind)?.clone());
        }
        self.subchunk = Some(vi.subchunk_id());
        self.dirty.clear();
        self.valid = true;
        Ok(())
    }

    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    /// Whether the buffer still holds the iterator's current subchunk.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn n_row(&self) -> usize {
        self.uvw.len_of(Axis(1))
    }

    pub fn n_chan(&self) -> usize {
        self.frequency.len()
    }

    pub fn n_pol(&self) -> usize {
        self.corr_type.len()
    }

    pub fn vis(&self, kind: VisKind) -> Option<&Array3<c32>> {
        self.vis[kind.index()].as_ref()
    }

    pub fn vis_mut(&mut self, kind: VisKind) -> Option<&mut Array3<c32>> {
        self.vis[kind.index()].as_mut()
    }

    /// Set the `(npol, nchan, nrow)` visibilities of `kind`.
    pub fn set_vis(&mut self, kind: VisKind, vis: Array3<c32>) {
        self.vis[kind.index()] = Some(vis);
    }

    pub fn with_vis(mut self, kind: VisKind, vis: Array3<c32>) -> VisBuffer {
        self.set_vis(kind, vis);
        self
    }

    pub fn mark_dirty(&mut self, component: VisComponent) {
        self.dirty.insert(component);
    }

    /// Components changed since the buffer was filled, in a fixed order.
    pub fn dirty(&self) -> impl Iterator<Item = VisComponent> + '_ {
        self.dirty.iter().copied()
    }

    pub fn clear_dirty(&mut self, component: VisComponent) {
        self.dirty.remove(&component);
    }

    pub fn row_flagged(&self, row: usize) -> bool {
        self.flag_row
            .as_ref()
            .and_then(|f| f.get(row).copied())
            .unwrap_or(false)
    }

    pub fn is_flagged(&self, pol: usize, chan: usize, row: usize) -> bool {
        self.flag_cube
            .as_ref()
            .and_then(|f| f.get((pol, chan, row)).copied())
            .unwrap_or(false)
    }

    /// The weight of one sample: from the weight spectrum, else the weight
    /// matrix, else 1.
    pub fn sample_weight(&self, pol: usize, chan: usize, row: usize) -> f32 {
        if let Some(w) = self.weight_spectrum.as_ref().and_then(|w| w.get((pol, chan, row))) {
            return *w;
        }
        self.weight_mat
            .as_ref()
            .and_then(|w| w.get((pol, row)).copied())
            .unwrap_or(1.0)
    }
}
