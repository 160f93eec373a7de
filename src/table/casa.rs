// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A [`VisTable`] over a casacore measurement set main table, via
//! `rubbl_casatables`.

use std::{collections::HashSet, path::Path};

use log::debug;
use ndarray::prelude::*;
use rubbl_casatables::{Table, TableOpenMode};

use super::{slice_channels, Column, ColumnValue, Slicer, TableError, VisTable};

pub struct CasaTable {
    name: String,
    table: Table,
    columns: HashSet<String>,
    num_rows: usize,
}

impl CasaTable {
    /// Open the main table of a measurement set.
    pub fn open<P: AsRef<Path>>(path: P, writable: bool) -> Result<CasaTable, TableError> {
        let mode = if writable {
            TableOpenMode::ReadWrite
        } else {
            TableOpenMode::Read
        };
        let mut table = Table::open(path.as_ref(), mode)?;
        let columns = table.column_names()?.into_iter().collect();
        let num_rows = table.n_rows() as usize;
        debug!("Opened {} with {num_rows} rows", path.as_ref().display());
        Ok(CasaTable {
            name: path.as_ref().display().to_string(),
            table,
            columns,
            num_rows,
        })
    }

    fn check(&self, column: Column, rows: &[usize]) -> Result<(), TableError> {
        if !self.has_column(column) {
            return Err(TableError::NoSuchColumn {
                column: column.name(),
            });
        }
        match rows.iter().find(|&&r| r >= self.num_rows) {
            Some(&row) => Err(TableError::RowOutOfRange {
                row,
                num_rows: self.num_rows,
            }),
            None => Ok(()),
        }
    }
}

impl VisTable for CasaTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn num_rows(&self) -> usize {
        self.num_rows
    }

    fn has_column(&self, column: Column) -> bool {
        self.columns.contains(column.name())
    }

    fn get_column<T: ColumnValue>(
        &mut self,
        column: Column,
        rows: &[usize],
        slicer: Option<&Slicer>,
    ) -> Result<ArrayD<T>, TableError> {
        self.check(column, rows)?;
        let mut cells = Vec::with_capacity(rows.len());
        for &row in rows {
            cells.push(T::read_casa_cell(&mut self.table, column, row as u64)?);
        }

        let cell_shape = match cells.first() {
            Some(c) => c.shape().to_vec(),
            None => vec![0; column.cell_ndim()],
        };
        let mut shape = cell_shape.clone();
        shape.push(rows.len());
        let mut out = ArrayD::<T>::default(IxDyn(&shape));
        let row_axis = Axis(shape.len() - 1);
        for (i, cell) in cells.iter().enumerate() {
            if cell.shape() != cell_shape.as_slice() {
                return Err(TableError::BadArrayShape {
                    argument: column.name().into(),
                    function: "CasaTable::get_column".into(),
                    expected: format!("{cell_shape:?}"),
                    received: format!("{:?}", cell.shape()),
                });
            }
            out.index_axis_mut(row_axis, i).assign(cell);
        }
        slice_channels(out.view(), column, slicer)
    }

    fn put_column<T: ColumnValue>(
        &mut self,
        column: Column,
        rows: &[usize],
        slicer: Option<&Slicer>,
        data: ArrayViewD<T>,
    ) -> Result<(), TableError> {
        self.check(column, rows)?;
        if data.ndim() != column.cell_ndim() + 1 || data.shape()[data.ndim() - 1] != rows.len() {
            return Err(TableError::BadArrayShape {
                argument: "data".into(),
                function: "CasaTable::put_column".into(),
                expected: format!("{} axes with {} rows last", column.cell_ndim() + 1, rows.len()),
                received: format!("{:?}", data.shape()),
            });
        }
        let row_axis = Axis(data.ndim() - 1);
        for (i, &row) in rows.iter().enumerate() {
            let src = data.index_axis(row_axis, i);
            match slicer.filter(|_| src.ndim() >= 2) {
                Some(s) => {
                    // Read-modify-write the cell through the slicer.
                    let mut cell = T::read_casa_cell(&mut self.table, column, row as u64)?;
                    let chan_axis = Axis(cell.ndim() - 1);
                    s.check(column, cell.len_of(chan_axis))?;
                    cell.slice_axis_mut(chan_axis, s.to_slice()).assign(&src);
                    T::write_casa_cell(&mut self.table, column, row as u64, cell.view())?;
                }
                None => T::write_casa_cell(&mut self.table, column, row as u64, src)?,
            }
        }
        Ok(())
    }

    fn uses_tiled_storage(&self, _column: Column) -> bool {
        // rubbl doesn't expose the storage manager; its tile caches stay at
        // casacore's defaults.
        false
    }

    fn set_tile_cache_size(&mut self, column: Column, _tiles: usize) -> Result<(), TableError> {
        Err(TableError::NotTiled {
            column: column.name(),
        })
    }

    fn is_memory_resident(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_table_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = CasaTable::open(dir.path().join("nothing.ms"), false);
        assert!(result.is_err());
    }
}
