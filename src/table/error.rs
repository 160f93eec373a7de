// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors from reading and writing visibility table columns.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TableError {
    #[error("column {column} does not exist in this table")]
    NoSuchColumn { column: &'static str },

    #[error("column {column} holds {found} values, but {expected} values were requested")]
    WrongType {
        column: &'static str,
        expected: &'static str,
        found: &'static str,
    },

    #[error("row {row} is out of range; the table has {num_rows} rows")]
    RowOutOfRange { row: usize, num_rows: usize },

    #[error("slicer {slicer} does not fit in column {column}, which has {len} channels")]
    SlicerOutOfRange {
        column: &'static str,
        slicer: String,
        len: usize,
    },

    #[error("bad array shape supplied to argument {argument} of function {function}. expected {expected}, received {received}")]
    BadArrayShape {
        argument: String,
        function: String,
        expected: String,
        received: String,
    },

    #[error("column {column} is not stored in a tiled storage manager")]
    NotTiled { column: &'static str },

    #[cfg(feature = "ms")]
    #[error("Error when trying to interface with measurement set: {0}")]
    Table(#[from] rubbl_casatables::TableError),

    #[cfg(feature = "ms")]
    #[error("Error from casacore: {0}")]
    Casacore(#[from] rubbl_casatables::CasacoreError),
}
