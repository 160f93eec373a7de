// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The write side of visibility iteration.

use std::collections::HashMap;

use log::trace;
use ndarray::prelude::*;

use super::{VisBuffer, VisComponent, VisIterReadImpl, VisKind, ViError};
use crate::{
    c32,
    table::{Column, ColumnValue, Slicer, VisTable},
};

/// What a writer needs from the read side: where the current subchunk lives
/// and how to drop stale cached columns.
pub trait SelectionState {
    type Table: VisTable;

    fn current_table_mut(&mut self) -> Result<&mut Self::Table, ViError>;

    fn row_ids(&self) -> &[usize];

    fn slicer(&self) -> Slicer;

    fn n_pol(&mut self) -> Result<usize, ViError>;

    fn channel_group_size(&self) -> usize;

    fn invalidate_column(&mut self, column: Column);
}

impl<T: VisTable> SelectionState for VisIterReadImpl<T> {
    type Table = T;

    fn current_table_mut(&mut self) -> Result<&mut T, ViError> {
        VisIterReadImpl::current_table_mut(self)
    }

    fn row_ids(&self) -> &[usize] {
        VisIterReadImpl::row_ids(self)
    }

    fn slicer(&self) -> Slicer {
        VisIterReadImpl::slicer(self)
    }

    fn n_pol(&mut self) -> Result<usize, ViError> {
        VisIterReadImpl::n_pol(self)
    }

    fn channel_group_size(&self) -> usize {
        VisIterReadImpl::channel_group_size(self)
    }

    fn invalidate_column(&mut self, column: Column) {
        VisIterReadImpl::invalidate_column(self, column)
    }
}

/// Writes columns of the current subchunk, through the read side's rows and
/// channel slicer.
pub struct VisIterWriteImpl<'a, S: SelectionState> {
    state: &'a mut S,
}

fn check_shape(
    argument: &str,
    function: &str,
    expected: &[usize],
    received: &[usize],
) -> Result<(), ViError> {
    if expected == received {
        Ok(())
    } else {
        Err(ViError::BadArrayShape {
            argument: argument.to_string(),
            function: function.to_string(),
            expected: format!("{expected:?}"),
            received: format!("{received:?}"),
        })
    }
}

impl<'a, S: SelectionState> VisIterWriteImpl<'a, S> {
    pub fn new(state: &'a mut S) -> VisIterWriteImpl<'a, S> {
        VisIterWriteImpl { state }
    }

    /// `(npol, nchan, nrow)` of the current subchunk.
    fn cube_shape(&mut self) -> Result<[usize; 3], ViError> {
        Ok([
            self.state.n_pol()?,
            self.state.channel_group_size(),
            self.state.row_ids().len(),
        ])
    }

    fn put<V: ColumnValue, D: Dimension>(
        &mut self,
        column: Column,
        data: ArrayView<V, D>,
    ) -> Result<(), ViError> {
        let rows = self.state.row_ids().to_vec();
        let slicer = self.state.slicer();
        trace!("writing {} rows of {column}", rows.len());
        self.state
            .current_table_mut()?
            .put_column(column, &rows, Some(&slicer), data.into_dyn())?;
        self.state.invalidate_column(column);
        Ok(())
    }

    /// Write a `(npol, nchan, nrow)` flag cube.
    pub fn set_flag(&mut self, flag: ArrayView3<bool>) -> Result<(), ViError> {
        let expected = self.cube_shape()?;
        check_shape("flag", "set_flag", &expected, flag.shape())?;
        self.put(Column::Flag, flag)
    }

    /// Write `(nchan, nrow)` flags to every correlation.
    pub fn set_flag_matrix(&mut self, flag: ArrayView2<bool>) -> Result<(), ViError> {
        let [n_pol, n_chan, n_row] = self.cube_shape()?;
        check_shape("flag", "set_flag_matrix", &[n_chan, n_row], flag.shape())?;
        let cube = flag.broadcast((n_pol, n_chan, n_row)).ok_or_else(|| {
            ViError::BadArrayShape {
                argument: "flag".into(),
                function: "set_flag_matrix".into(),
                expected: format!("{:?}", [n_chan, n_row]),
                received: format!("{:?}", flag.shape()),
            }
        })?;
        self.put(Column::Flag, cube)
    }

    pub fn set_flag_row(&mut self, flag_row: ArrayView1<bool>) -> Result<(), ViError> {
        let n_row = self.state.row_ids().len();
        check_shape("flag_row", "set_flag_row", &[n_row], flag_row.shape())?;
        self.put(Column::FlagRow, flag_row)
    }

    /// Write `(ncat, npol, nchan, nrow)` flag categories.
    pub fn set_flag_category(&mut self, flag_category: ArrayView4<bool>) -> Result<(), ViError> {
        let [n_pol, n_chan, n_row] = self.cube_shape()?;
        let n_cat = flag_category.len_of(Axis(0));
        check_shape(
            "flag_category",
            "set_flag_category",
            &[n_cat, n_pol, n_chan, n_row],
            flag_category.shape(),
        )?;
        self.put(Column::FlagCategory, flag_category)
    }

    /// Write a `(npol, nchan, nrow)` visibility cube. Only real parts are
    /// written to FLOAT_DATA.
    pub fn set_vis(&mut self, vis: ArrayView3<c32>, kind: VisKind) -> Result<(), ViError> {
        let expected = self.cube_shape()?;
        check_shape("vis", "set_vis", &expected, vis.shape())?;
        match kind {
            VisKind::Float => {
                let re = vis.mapv(|v| v.re);
                self.put(Column::FloatData, re.view())
            }
            _ => self.put(kind.column(), vis),
        }
    }

    /// Write per-row weights to every correlation.
    pub fn set_weight(&mut self, weight: ArrayView1<f32>) -> Result<(), ViError> {
        let [n_pol, _, n_row] = self.cube_shape()?;
        check_shape("weight", "set_weight", &[n_row], weight.shape())?;
        let mat = Array2::from_shape_fn((n_pol, n_row), |(_, r)| weight[r]);
        self.put(Column::Weight, mat.view())
    }

    /// Write `(npol, nrow)` weights.
    pub fn set_weight_mat(&mut self, weight: ArrayView2<f32>) -> Result<(), ViError> {
        let [n_pol, _, n_row] = self.cube_shape()?;
        check_shape("weight", "set_weight_mat", &[n_pol, n_row], weight.shape())?;
        self.put(Column::Weight, weight)
    }

    /// Write `(npol, nchan, nrow)` weights.
    pub fn set_weight_spectrum(&mut self, weight: ArrayView3<f32>) -> Result<(), ViError> {
        let expected = self.cube_shape()?;
        check_shape("weight", "set_weight_spectrum", &expected, weight.shape())?;
        self.put(Column::WeightSpectrum, weight)
    }

    /// Write per-row sigmas to every correlation.
    pub fn set_sigma(&mut self, sigma: ArrayView1<f32>) -> Result<(), ViError> {
        let [n_pol, _, n_row] = self.cube_shape()?;
        check_shape("sigma", "set_sigma", &[n_row], sigma.shape())?;
        let mat = Array2::from_shape_fn((n_pol, n_row), |(_, r)| sigma[r]);
        self.put(Column::Sigma, mat.view())
    }

    /// Write `(npol, nrow)` sigmas.
    pub fn set_sigma_mat(&mut self, sigma: ArrayView2<f32>) -> Result<(), ViError> {
        let [n_pol, _, n_row] = self.cube_shape()?;
        check_shape("sigma", "set_sigma_mat", &[n_pol, n_row], sigma.shape())?;
        self.put(Column::Sigma, sigma)
    }
}

/// Writes one component of a buffer back to a table.
pub type WriteFn<S> = fn(&VisBuffer, &mut S) -> Result<(), ViError>;

fn missing(component: VisComponent) -> ViError {
    ViError::MissingBufferComponent {
        component: format!("{component:?}"),
    }
}

fn write_flag<S: SelectionState>(b: &VisBuffer, s: &mut S) -> Result<(), ViError> {
    let flag = b.flag_cube.as_ref().ok_or_else(|| missing(VisComponent::Flag))?;
    VisIterWriteImpl::new(s).set_flag(flag.view())
}

fn write_flag_row<S: SelectionState>(b: &VisBuffer, s: &mut S) -> Result<(), ViError> {
    let flag_row = b.flag_row.as_ref().ok_or_else(|| missing(VisComponent::FlagRow))?;
    VisIterWriteImpl::new(s).set_flag_row(flag_row.view())
}

fn write_flag_category<S: SelectionState>(b: &VisBuffer, s: &mut S) -> Result<(), ViError> {
    let fc = b
        .flag_category
        .as_ref()
        .ok_or_else(|| missing(VisComponent::FlagCategory))?;
    VisIterWriteImpl::new(s).set_flag_category(fc.view())
}

fn write_weight<S: SelectionState>(b: &VisBuffer, s: &mut S) -> Result<(), ViError> {
    let w = b.weight.as_ref().ok_or_else(|| missing(VisComponent::Weight))?;
    VisIterWriteImpl::new(s).set_weight(w.view())
}

fn write_weight_mat<S: SelectionState>(b: &VisBuffer, s: &mut S) -> Result<(), ViError> {
    let w = b
        .weight_mat
        .as_ref()
        .ok_or_else(|| missing(VisComponent::WeightMat))?;
    VisIterWriteImpl::new(s).set_weight_mat(w.view())
}

fn write_weight_spectrum<S: SelectionState>(b: &VisBuffer, s: &mut S) -> Result<(), ViError> {
    let w = b
        .weight_spectrum
        .as_ref()
        .ok_or_else(|| missing(VisComponent::WeightSpectrum))?;
    VisIterWriteImpl::new(s).set_weight_spectrum(w.view())
}

fn write_sigma<S: SelectionState>(b: &VisBuffer, s: &mut S) -> Result<(), ViError> {
    let sigma = b.sigma_mat.as_ref().ok_or_else(|| missing(VisComponent::Sigma))?;
    VisIterWriteImpl::new(s).set_sigma_mat(sigma.view())
}

fn write_vis<S: SelectionState, const K: usize>(b: &VisBuffer, s: &mut S) -> Result<(), ViError> {
    let kind = VisKind::ALL[K];
    let vis = b.vis(kind).ok_or_else(|| missing(kind.into()))?;
    VisIterWriteImpl::new(s).set_vis(vis.view(), kind)
}

/// Writes the dirty components of a [`VisBuffer`] back to a table.
pub struct WriteBack<S: SelectionState> {
    writers: HashMap<VisComponent, WriteFn<S>>,
}

impl<S: SelectionState> Default for WriteBack<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: SelectionState> WriteBack<S> {
    pub fn new() -> WriteBack<S> {
        let mut writers: HashMap<VisComponent, WriteFn<S>> = HashMap::new();
        writers.insert(VisComponent::Flag, write_flag::<S>);
        writers.insert(VisComponent::FlagRow, write_flag_row::<S>);
        writers.insert(VisComponent::FlagCategory, write_flag_category::<S>);
        writers.insert(VisComponent::Weight, write_weight::<S>);
        writers.insert(VisComponent::WeightMat, write_weight_mat::<S>);
        writers.insert(VisComponent::WeightSpectrum, write_weight_spectrum::<S>);
        writers.insert(VisComponent::Sigma, write_sigma::<S>);
        writers.insert(VisComponent::Observed, write_vis::<S, 0>);
        writers.insert(VisComponent::Corrected, write_vis::<S, 1>);
        writers.insert(VisComponent::Model, write_vis::<S, 2>);
        writers.insert(VisComponent::Float, write_vis::<S, 3>);
        WriteBack { writers }
    }

    /// Write every component `buffer` marks dirty, then clear the marks.
    /// Returns the components written, in order.
    pub fn write_back(
        &self,
        buffer: &mut VisBuffer,
        state: &mut S,
    ) -> Result<Vec<VisComponent>, ViError> {
        let dirty: Vec<VisComponent> = buffer.dirty().collect();
        for &component in &dirty {
            if let Some(write) = self.writers.get(&component) {
                write(buffer, state)?;
            }
            buffer.clear_dirty(component);
        }
        Ok(dirty)
    }
}
