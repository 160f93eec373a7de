// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors from gridding and degridding.

use thiserror::Error;

use crate::{cf::CfError, config::ConfigError};

#[derive(Error, Debug)]
pub enum GriddingError {
    #[error("bad image geometry: {0}")]
    BadGeometry(String),

    #[error("{function} was called before the grid was initialised")]
    NotInitialized { function: &'static str },

    #[error("bad array shape supplied to argument {argument} of function {function}. expected {expected}, received {received}")]
    BadArrayShape {
        argument: String,
        function: String,
        expected: String,
        received: String,
    },

    #[error("the convolution function was made for {received}, but the image needs {expected}")]
    IncompatibleCf { expected: String, received: String },

    #[error("the average primary beam peaks at {peak}, which is too small to be divided out")]
    NoSensitivity { peak: f32 },

    #[error("the buffer has no {kind} visibilities to grid")]
    MissingVisibilities { kind: String },

    #[error("row {row} is out of range; the buffer has {num_rows} rows")]
    RowOutOfRange { row: usize, num_rows: usize },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cf(#[from] CfError),

    #[error(transparent)]
    IO(#[from] std::io::Error),
}
