// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Tables and contexts shared by tests.

use ndarray::prelude::*;

use crate::{c32, table::Column, LatLngHeight, MemoryTable, ObsContext, RADec};

/// Four circular correlations (RR, RL, LR, LL) over `nchan` channels from
/// 100 MHz in 1 MHz steps, at the MRO.
pub(crate) fn context(nchan: usize) -> ObsContext {
    ObsContext::single_spw(
        LatLngHeight::from_degrees(116.67081524, -26.70331940, 377.827),
        RADec::from_degrees(10.0, -30.0),
        (0..nchan).map(|i| 100e6 + i as f64 * 1e6).collect(),
        vec![5, 6, 7, 8],
    )
}

/// A table with `nrow` rows at one timestamp.
pub(crate) fn table(nrow: usize, nchan: usize) -> MemoryTable {
    table_with_times(&vec![1.0; nrow], nchan)
}

/// A table with one row per timestamp in `times`, cycling over the baselines
/// of three antennas. Visibilities encode their (pol, chan, row) index.
pub(crate) fn table_with_times(times: &[f64], nchan: usize) -> MemoryTable {
    let nrow = times.len();
    let baselines = [(0, 1), (0, 2), (1, 2)];
    let ant1 = Array1::from_shape_fn(nrow, |r| baselines[r % 3].0);
    let ant2 = Array1::from_shape_fn(nrow, |r| baselines[r % 3].1);
    let uvw = Array2::from_shape_fn((3, nrow), |(i, r)| match i {
        0 => 10.0 * (r + 1) as f64,
        1 => -5.0 * (r + 1) as f64,
        _ => 0.5,
    });
    let data = Array3::from_shape_fn((4, nchan, nrow), |(p, c, r)| {
        c32::new((p * 100 + c) as f32, r as f32)
    });
    MemoryTable::new("test", nrow)
        .with_column(Column::Time, Array1::from(times.to_vec()).into_dyn())
        .and_then(|t| t.with_column(Column::Interval, Array1::from_elem(nrow, 1.0).into_dyn()))
        .and_then(|t| t.with_column(Column::Antenna1, ant1.into_dyn()))
        .and_then(|t| t.with_column(Column::Antenna2, ant2.into_dyn()))
        .and_then(|t| t.with_column(Column::Uvw, uvw.into_dyn()))
        .and_then(|t| t.with_column(Column::Data, data.into_dyn()))
        .and_then(|t| {
            t.with_column(
                Column::Flag,
                Array3::from_elem((4, nchan, nrow), false).into_dyn(),
            )
        })
        .and_then(|t| t.with_column(Column::FlagRow, Array1::from_elem(nrow, false).into_dyn()))
        .and_then(|t| t.with_column(Column::Weight, Array2::<f32>::ones((4, nrow)).into_dyn()))
        .and_then(|t| t.with_column(Column::Sigma, Array2::<f32>::ones((4, nrow)).into_dyn()))
        .and_then(|t| t.with_column(Column::ScanNumber, Array1::from_elem(nrow, 1).into_dyn()))
        .unwrap()
}
