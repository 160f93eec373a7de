// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Column-oriented access to measurement-set-like visibility tables.
//!
//! Every column is presented with the row axis last. Data cubes are
//! `(npol, nchan, nrow)`, weights `(npol, nrow)`, UVWs `(3, nrow)`, flag
//! categories `(ncat, npol, nchan, nrow)` and scalar columns `(nrow)`. A
//! [`Slicer`] selects channels along the second-last axis of any column with
//! three or more axes.

mod error;
pub mod memory;

#[cfg(feature = "ms")]
pub mod casa;

pub use error::TableError;
pub use memory::MemoryTable;

#[cfg(feature = "ms")]
pub use casa::CasaTable;

use ndarray::{prelude::*, Slice};

use crate::c32;

/// The main-table columns a visibility iterator knows about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Column {
    Antenna1,
    Antenna2,
    Feed1,
    Feed2,
    Time,
    TimeCentroid,
    Exposure,
    Interval,
    Uvw,
    Data,
    FloatData,
    ModelData,
    CorrectedData,
    Flag,
    FlagRow,
    FlagCategory,
    Weight,
    WeightSpectrum,
    Sigma,
    ScanNumber,
    StateId,
    ObservationId,
    ProcessorId,
    DataDescId,
    FieldId,
}

impl Column {
    /// Every column, in table order.
    pub const ALL: [Column; 25] = [
        Column::Antenna1,
        Column::Antenna2,
        Column::Feed1,
        Column::Feed2,
        Column::Time,
        Column::TimeCentroid,
        Column::Exposure,
        Column::Interval,
        Column::Uvw,
        Column::Data,
        Column::FloatData,
        Column::ModelData,
        Column::CorrectedData,
        Column::Flag,
        Column::FlagRow,
        Column::FlagCategory,
        Column::Weight,
        Column::WeightSpectrum,
        Column::Sigma,
        Column::ScanNumber,
        Column::StateId,
        Column::ObservationId,
        Column::ProcessorId,
        Column::DataDescId,
        Column::FieldId,
    ];

    /// The casacore name of the column.
    pub fn name(self) -> &'static str {
        match self {
            Column::Antenna1 => "ANTENNA1",
            Column::Antenna2 => "ANTENNA2",
            Column::Feed1 => "FEED1",
            Column::Feed2 => "FEED2",
            Column::Time => "TIME",
            Column::TimeCentroid => "TIME_CENTROID",
            Column::Exposure => "EXPOSURE",
            Column::Interval => "INTERVAL",
            Column::Uvw => "UVW",
            Column::Data => "DATA",
            Column::FloatData => "FLOAT_DATA",
            Column::ModelData => "MODEL_DATA",
            Column::CorrectedData => "CORRECTED_DATA",
            Column::Flag => "FLAG",
            Column::FlagRow => "FLAG_ROW",
            Column::FlagCategory => "FLAG_CATEGORY",
            Column::Weight => "WEIGHT",
            Column::WeightSpectrum => "WEIGHT_SPECTRUM",
            Column::Sigma => "SIGMA",
            Column::ScanNumber => "SCAN_NUMBER",
            Column::StateId => "STATE_ID",
            Column::ObservationId => "OBSERVATION_ID",
            Column::ProcessorId => "PROCESSOR_ID",
            Column::DataDescId => "DATA_DESC_ID",
            Column::FieldId => "FIELD_ID",
        }
    }

    /// The number of axes in a single cell of this column.
    pub fn cell_ndim(self) -> usize {
        match self {
            Column::Uvw | Column::Weight | Column::Sigma => 1,
            Column::Data
            | Column::FloatData
            | Column::ModelData
            | Column::CorrectedData
            | Column::Flag
            | Column::WeightSpectrum => 2,
            Column::FlagCategory => 3,
            _ => 0,
        }
    }

    /// Whether this is one of the big array columns whose tile cache is worth
    /// tuning. SIGMA is included as the storage managers treat it alongside
    /// WEIGHT_SPECTRUM.
    pub fn is_large_array(self) -> bool {
        matches!(
            self,
            Column::Data
                | Column::FloatData
                | Column::ModelData
                | Column::CorrectedData
                | Column::Flag
                | Column::FlagCategory
                | Column::WeightSpectrum
                | Column::Sigma
        )
    }
}

impl std::fmt::Display for Column {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A strided selection of channels: `length` channels starting at `start`,
/// `stride` apart.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Slicer {
    pub start: usize,
    pub length: usize,
    pub stride: usize,
}

impl Slicer {
    pub fn new(start: usize, length: usize, stride: usize) -> Slicer {
        Slicer {
            start,
            length,
            stride,
        }
    }

    /// The last channel touched, or `None` for an empty slicer.
    pub fn last(&self) -> Option<usize> {
        self.length
            .checked_sub(1)
            .map(|n| self.start + n * self.stride)
    }

    /// The channel indices this slicer selects.
    pub fn indices(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.length).map(move |i| self.start + i * self.stride)
    }

    /// Check that this slicer fits an axis of `len` channels.
    pub(crate) fn check(&self, column: Column, len: usize) -> Result<(), TableError> {
        match self.last() {
            Some(last) if last < len && self.stride > 0 => Ok(()),
            _ => Err(TableError::SlicerOutOfRange {
                column: column.name(),
                slicer: format!("{self:?}"),
                len,
            }),
        }
    }

    /// The ndarray equivalent of this slicer.
    pub(crate) fn to_slice(self) -> Slice {
        let end = self.last().map(|l| l + 1).unwrap_or(self.start);
        Slice::new(self.start as isize, Some(end as isize), self.stride.max(1) as isize)
    }
}

impl std::fmt::Display for Slicer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "[{}:{}:{}]", self.start, self.length, self.stride)
    }
}

/// Type-erased storage for a whole column.
#[derive(Clone, Debug, PartialEq)]
pub enum ColumnData {
    Bool(ArrayD<bool>),
    Int(ArrayD<i32>),
    Float(ArrayD<f32>),
    Double(ArrayD<f64>),
    Complex(ArrayD<c32>),
}

impl ColumnData {
    pub fn type_name(&self) -> &'static str {
        match self {
            ColumnData::Bool(_) => bool::TYPE_NAME,
            ColumnData::Int(_) => i32::TYPE_NAME,
            ColumnData::Float(_) => f32::TYPE_NAME,
            ColumnData::Double(_) => f64::TYPE_NAME,
            ColumnData::Complex(_) => c32::TYPE_NAME,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            ColumnData::Bool(a) => a.shape(),
            ColumnData::Int(a) => a.shape(),
            ColumnData::Float(a) => a.shape(),
            ColumnData::Double(a) => a.shape(),
            ColumnData::Complex(a) => a.shape(),
        }
    }
}

/// A value type that can be stored in a table column. Accessors are generic
/// over this trait, so the element type is chosen once per call rather than
/// per element.
pub trait ColumnValue: Clone + Default + std::fmt::Debug + Send + Sync + 'static {
    /// A human-readable name for error messages.
    const TYPE_NAME: &'static str;

    fn into_data(array: ArrayD<Self>) -> ColumnData;

    fn from_data(data: &ColumnData) -> Option<&ArrayD<Self>>;

    fn from_data_mut(data: &mut ColumnData) -> Option<&mut ArrayD<Self>>;

    /// Read one cell from a casacore table, with the channel axis last.
    #[cfg(feature = "ms")]
    fn read_casa_cell(
        table: &mut rubbl_casatables::Table,
        column: Column,
        row: u64,
    ) -> Result<ArrayD<Self>, TableError>;

    /// Write one cell to a casacore table. `cell` has the channel axis last.
    #[cfg(feature = "ms")]
    fn write_casa_cell(
        table: &mut rubbl_casatables::Table,
        column: Column,
        row: u64,
        cell: ArrayViewD<Self>,
    ) -> Result<(), TableError>;
}

macro_rules! impl_column_value {
    ($t:ty, $variant:ident, $name:literal) => {
        impl ColumnValue for $t {
            const TYPE_NAME: &'static str = $name;

            fn into_data(array: ArrayD<Self>) -> ColumnData {
                ColumnData::$variant(array)
            }

            fn from_data(data: &ColumnData) -> Option<&ArrayD<Self>> {
                match data {
                    ColumnData::$variant(a) => Some(a),
                    _ => None,
                }
            }

            fn from_data_mut(data: &mut ColumnData) -> Option<&mut ArrayD<Self>> {
                match data {
                    ColumnData::$variant(a) => Some(a),
                    _ => None,
                }
            }

            #[cfg(feature = "ms")]
            fn read_casa_cell(
                table: &mut rubbl_casatables::Table,
                column: Column,
                row: u64,
            ) -> Result<ArrayD<Self>, TableError> {
                let name = column.name();
                // casacore cells come out channel-major; swap the last two
                // axes so polarisation precedes channel.
                let cell = match column.cell_ndim() {
                    0 => arr0(table.get_cell::<$t>(name, row)?).into_dyn(),
                    1 => Array1::from(table.get_cell_as_vec::<$t>(name, row)?).into_dyn(),
                    2 => table
                        .get_cell::<Array2<$t>>(name, row)?
                        .reversed_axes()
                        .into_dyn(),
                    _ => {
                        let a = table.get_cell::<Array3<$t>>(name, row)?;
                        a.permuted_axes([0, 2, 1]).into_dyn()
                    }
                };
                Ok(cell.as_standard_layout().into_owned())
            }

            #[cfg(feature = "ms")]
            fn write_casa_cell(
                table: &mut rubbl_casatables::Table,
                column: Column,
                row: u64,
                cell: ArrayViewD<Self>,
            ) -> Result<(), TableError> {
                let name = column.name();
                let received = format!("{:?}", cell.shape());
                let bad_shape = || TableError::BadArrayShape {
                    argument: "cell".into(),
                    function: "write_casa_cell".into(),
                    expected: format!("{} axes", column.cell_ndim()),
                    received: received.clone(),
                };
                match column.cell_ndim() {
                    0 => {
                        let v = cell.first().cloned().ok_or_else(bad_shape)?;
                        table.put_cell(name, row, &v)?;
                    }
                    1 => {
                        let v: Vec<$t> = cell.iter().cloned().collect();
                        table.put_cell(name, row, &v)?;
                    }
                    2 => {
                        let a = cell
                            .into_dimensionality::<Ix2>()
                            .map_err(|_| bad_shape())?
                            .reversed_axes()
                            .as_standard_layout()
                            .into_owned();
                        table.put_cell(name, row, &a)?;
                    }
                    _ => {
                        let a = cell
                            .into_dimensionality::<Ix3>()
                            .map_err(|_| bad_shape())?
                            .permuted_axes([0, 2, 1])
                            .as_standard_layout()
                            .into_owned();
                        table.put_cell(name, row, &a)?;
                    }
                }
                Ok(())
            }
        }
    };
}

impl_column_value!(bool, Bool, "bool");
impl_column_value!(i32, Int, "i32");
impl_column_value!(f32, Float, "f32");
impl_column_value!(f64, Double, "f64");
impl_column_value!(c32, Complex, "complex<f32>");

/// A row-ordered, column-oriented visibility table.
///
/// Reads take `&mut self` as casacore-backed tables keep per-column caches.
pub trait VisTable {
    /// A name for log messages.
    fn name(&self) -> &str;

    fn num_rows(&self) -> usize;

    fn has_column(&self, column: Column) -> bool;

    /// Read `rows` of `column`, with the row axis last. A slicer selects
    /// channels of array columns with a channel axis.
    fn get_column<T: ColumnValue>(
        &mut self,
        column: Column,
        rows: &[usize],
        slicer: Option<&Slicer>,
    ) -> Result<ArrayD<T>, TableError>;

    /// Write `data` (row axis last) into `rows` of `column`, through the
    /// optional channel slicer.
    fn put_column<T: ColumnValue>(
        &mut self,
        column: Column,
        rows: &[usize],
        slicer: Option<&Slicer>,
        data: ArrayViewD<T>,
    ) -> Result<(), TableError>;

    /// Whether `column` is backed by a tiled storage manager.
    fn uses_tiled_storage(&self, column: Column) -> bool;

    /// Set the number of tiles cached for `column`.
    fn set_tile_cache_size(&mut self, column: Column, tiles: usize) -> Result<(), TableError>;

    /// Whether the whole table lives in memory.
    fn is_memory_resident(&self) -> bool;
}

/// Apply an optional channel slicer to the channel axis of a column array
/// (second-last axis, when there are at least three).
pub(crate) fn slice_channels<T: Clone>(
    array: ArrayViewD<'_, T>,
    column: Column,
    slicer: Option<&Slicer>,
) -> Result<ArrayD<T>, TableError> {
    match slicer {
        Some(s) if array.ndim() >= 3 => {
            let axis = Axis(array.ndim() - 2);
            s.check(column, array.len_of(axis))?;
            Ok(array.slice_axis(axis, s.to_slice()).to_owned())
        }
        _ => Ok(array.to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slicer_last_and_indices() {
        let s = Slicer::new(2, 3, 4);
        assert_eq!(s.last(), Some(10));
        assert_eq!(s.indices().collect::<Vec<_>>(), vec![2, 6, 10]);
        assert_eq!(Slicer::new(5, 0, 1).last(), None);
    }

    #[test]
    fn test_slice_channels_uses_second_last_axis() {
        let a = Array3::from_shape_fn((2, 8, 3), |(p, c, r)| (p * 100 + c * 10 + r) as i32);
        let s = Slicer::new(1, 3, 2);
        let out = slice_channels(a.view().into_dyn(), Column::Data, Some(&s)).unwrap();
        assert_eq!(out.shape(), &[2, 3, 3]);
        assert_eq!(out[[1, 2, 2]], 100 + 50 + 2);
    }

    #[test]
    fn test_slice_channels_rejects_overrun() {
        let a = Array3::<f32>::zeros((1, 4, 1));
        let s = Slicer::new(1, 3, 2);
        let result = slice_channels(a.view().into_dyn(), Column::Data, Some(&s));
        assert!(matches!(result, Err(TableError::SlicerOutOfRange { len: 4, .. })));
    }

    #[test]
    fn test_slicer_ignored_for_row_columns() {
        let a = Array2::<f32>::ones((4, 5));
        let s = Slicer::new(0, 1, 1);
        let out = slice_channels(a.view().into_dyn(), Column::Weight, Some(&s)).unwrap();
        assert_eq!(out.shape(), &[4, 5]);
    }

    #[test]
    fn test_column_data_type_names() {
        let d = f32::into_data(ArrayD::zeros(IxDyn(&[2])));
        assert_eq!(d.type_name(), "f32");
        assert!(f32::from_data(&d).is_some());
        assert!(c32::from_data(&d).is_none());
    }
}
