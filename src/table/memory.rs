// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! An in-memory [`VisTable`], mostly for tests and small data sets.

use std::collections::{HashMap, HashSet};

use log::trace;
use ndarray::prelude::*;

use super::{slice_channels, Column, ColumnData, ColumnValue, Slicer, TableError, VisTable};

/// A visibility table held entirely in memory. Tiled storage can be emulated
/// per column so that tile cache tuning can be observed.
#[derive(Clone, Debug, Default)]
pub struct MemoryTable {
    name: String,
    num_rows: usize,
    columns: HashMap<Column, ColumnData>,
    tiled: HashSet<Column>,
    tile_cache: HashMap<Column, usize>,
    not_memory_resident: bool,
    fail_tile_tuning: bool,
}

impl MemoryTable {
    pub fn new(name: &str, num_rows: usize) -> MemoryTable {
        MemoryTable {
            name: name.to_string(),
            num_rows,
            ..Default::default()
        }
    }

    /// Add a column. The last axis of `data` must be the row axis.
    pub fn with_column<T: ColumnValue>(
        mut self,
        column: Column,
        data: ArrayD<T>,
    ) -> Result<MemoryTable, TableError> {
        self.insert_column(column, data)?;
        Ok(self)
    }

    /// Add a column that pretends to live in a tiled storage manager.
    pub fn with_tiled_column<T: ColumnValue>(
        mut self,
        column: Column,
        data: ArrayD<T>,
    ) -> Result<MemoryTable, TableError> {
        self.insert_column(column, data)?;
        self.tiled.insert(column);
        Ok(self)
    }

    /// Report the table as living on disk, so tile cache tuning applies.
    pub fn not_memory_resident(mut self) -> MemoryTable {
        self.not_memory_resident = true;
        self
    }

    /// Make every tile cache request fail.
    pub fn failing_tile_tuning(mut self) -> MemoryTable {
        self.fail_tile_tuning = true;
        self
    }

    pub fn insert_column<T: ColumnValue>(
        &mut self,
        column: Column,
        data: ArrayD<T>,
    ) -> Result<(), TableError> {
        let rows = data.shape().last().copied().unwrap_or(0);
        if data.ndim() != column.cell_ndim() + 1 || rows != self.num_rows {
            return Err(TableError::BadArrayShape {
                argument: "data".into(),
                function: "MemoryTable::insert_column".into(),
                expected: format!("{} axes with {} rows last", column.cell_ndim() + 1, self.num_rows),
                received: format!("{:?}", data.shape()),
            });
        }
        self.columns.insert(column, T::into_data(data));
        Ok(())
    }

    /// The tile cache size last set for `column`, if any.
    pub fn tile_cache_size(&self, column: Column) -> Option<usize> {
        self.tile_cache.get(&column).copied()
    }

    /// A copy of the whole column.
    pub fn column<T: ColumnValue>(&self, column: Column) -> Result<ArrayD<T>, TableError> {
        let data = self.data(column)?;
        T::from_data(data)
            .cloned()
            .ok_or_else(|| wrong_type::<T>(column, data))
    }

    fn data(&self, column: Column) -> Result<&ColumnData, TableError> {
        self.columns.get(&column).ok_or(TableError::NoSuchColumn {
            column: column.name(),
        })
    }

    fn check_rows(&self, rows: &[usize]) -> Result<(), TableError> {
        match rows.iter().find(|&&r| r >= self.num_rows) {
            Some(&row) => Err(TableError::RowOutOfRange {
                row,
                num_rows: self.num_rows,
            }),
            None => Ok(()),
        }
    }
}

fn wrong_type<T: ColumnValue>(column: Column, data: &ColumnData) -> TableError {
    TableError::WrongType {
        column: column.name(),
        expected: T::TYPE_NAME,
        found: data.type_name(),
    }
}

impl VisTable for MemoryTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn num_rows(&self) -> usize {
        self.num_rows
    }

    fn has_column(&self, column: Column) -> bool {
        self.columns.contains_key(&column)
    }

    fn get_column<T: ColumnValue>(
        &mut self,
        column: Column,
        rows: &[usize],
        slicer: Option<&Slicer>,
    ) -> Result<ArrayD<T>, TableError> {
        self.check_rows(rows)?;
        let data = self.data(column)?;
        let array = T::from_data(data).ok_or_else(|| wrong_type::<T>(column, data))?;
        let row_axis = Axis(array.ndim() - 1);
        let selected = array.select(row_axis, rows);
        trace!(
            "{}: read {} rows of {}{}",
            self.name,
            rows.len(),
            column,
            slicer.map(|s| s.to_string()).unwrap_or_default()
        );
        slice_channels(selected.view(), column, slicer)
    }

    fn put_column<T: ColumnValue>(
        &mut self,
        column: Column,
        rows: &[usize],
        slicer: Option<&Slicer>,
        data: ArrayViewD<T>,
    ) -> Result<(), TableError> {
        self.check_rows(rows)?;
        let stored = self
            .columns
            .get_mut(&column)
            .ok_or(TableError::NoSuchColumn {
                column: column.name(),
            })?;
        let found = stored.type_name();
        let array = T::from_data_mut(stored).ok_or(TableError::WrongType {
            column: column.name(),
            expected: T::TYPE_NAME,
            found,
        })?;

        // The incoming shape must match the stored shape with the rows (and
        // possibly channels) replaced.
        let mut expected = array.shape().to_vec();
        let ndim = expected.len();
        expected[ndim - 1] = rows.len();
        if let Some(s) = slicer.filter(|_| ndim >= 3) {
            s.check(column, expected[ndim - 2])?;
            expected[ndim - 2] = s.length;
        }
        if data.shape() != expected.as_slice() {
            return Err(TableError::BadArrayShape {
                argument: "data".into(),
                function: "MemoryTable::put_column".into(),
                expected: format!("{expected:?}"),
                received: format!("{:?}", data.shape()),
            });
        }

        let row_axis = Axis(ndim - 1);
        for (i_in, &row) in rows.iter().enumerate() {
            let src = data.index_axis(row_axis, i_in);
            let mut dst = array.index_axis_mut(row_axis, row);
            match slicer.filter(|_| ndim >= 3) {
                Some(s) => dst
                    .slice_axis_mut(Axis(ndim - 2), s.to_slice())
                    .assign(&src),
                None => dst.assign(&src),
            }
        }
        Ok(())
    }

    fn uses_tiled_storage(&self, column: Column) -> bool {
        self.tiled.contains(&column)
    }

    fn set_tile_cache_size(&mut self, column: Column, tiles: usize) -> Result<(), TableError> {
        if self.fail_tile_tuning || !self.tiled.contains(&column) {
            return Err(TableError::NotTiled {
                column: column.name(),
            });
        }
        self.tile_cache.insert(column, tiles);
        Ok(())
    }

    fn is_memory_resident(&self) -> bool {
        !self.not_memory_resident
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::c32;

    fn table() -> MemoryTable {
        let data = Array3::from_shape_fn((2, 4, 3), |(p, c, r)| {
            c32::new((p * 100 + c * 10 + r) as f32, 0.0)
        });
        MemoryTable::new("test", 3)
            .with_column(Column::Time, arr1(&[1.0, 1.0, 2.0]).into_dyn())
            .unwrap()
            .with_tiled_column(Column::Data, data.into_dyn())
            .unwrap()
    }

    #[test]
    fn test_get_rows_and_channels() {
        let mut t = table();
        let s = Slicer::new(1, 2, 2);
        let d: ArrayD<c32> = t.get_column(Column::Data, &[2, 0], Some(&s)).unwrap();
        assert_eq!(d.shape(), &[2, 2, 2]);
        assert_eq!(d[[1, 1, 0]].re, 132.0);
        assert_eq!(d[[0, 0, 1]].re, 10.0);
    }

    #[test]
    fn test_wrong_type() {
        let mut t = table();
        let result = t.get_column::<f32>(Column::Time, &[0], None);
        assert!(matches!(
            result,
            Err(TableError::WrongType {
                expected: "f32",
                found: "f64",
                ..
            })
        ));
    }

    #[test]
    fn test_put_through_slicer() {
        let mut t = table();
        let s = Slicer::new(0, 2, 3);
        let new = Array3::from_elem((2, 2, 1), c32::new(-1.0, 0.0));
        t.put_column(Column::Data, &[1], Some(&s), new.view().into_dyn())
            .unwrap();
        let d: ArrayD<c32> = t.column(Column::Data).unwrap();
        assert_eq!(d[[0, 0, 1]].re, -1.0);
        assert_eq!(d[[1, 3, 1]].re, -1.0);
        assert_eq!(d[[1, 1, 1]].re, 111.0);
        assert_eq!(d[[0, 0, 0]].re, 0.0);
    }

    #[test]
    fn test_put_bad_shape() {
        let mut t = table();
        let new = Array3::from_elem((2, 4, 2), c32::default());
        let result = t.put_column(Column::Data, &[1], None, new.view().into_dyn());
        assert!(matches!(result, Err(TableError::BadArrayShape { .. })));
    }

    #[test]
    fn test_tiling() {
        let mut t = table();
        assert!(t.uses_tiled_storage(Column::Data));
        assert!(!t.uses_tiled_storage(Column::Time));
        t.set_tile_cache_size(Column::Data, 1).unwrap();
        assert_eq!(t.tile_cache_size(Column::Data), Some(1));
        assert!(t.set_tile_cache_size(Column::Time, 1).is_err());
        assert!(t.is_memory_resident());
        assert!(!table().not_memory_resident().is_memory_resident());
    }

    #[test]
    fn test_row_out_of_range() {
        let mut t = table();
        let result = t.get_column::<f64>(Column::Time, &[3], None);
        assert!(matches!(
            result,
            Err(TableError::RowOutOfRange { row: 3, num_rows: 3 })
        ));
    }
}
