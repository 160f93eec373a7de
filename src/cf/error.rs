// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors from building, caching and loading convolution functions.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CfError {
    #[error("the convolution function at parallactic angle {pa_deg}° has zero support; the oversampled grid is too small for the aperture")]
    ZeroSupport { pa_deg: f64 },

    #[error("the aperture illumination is zero everywhere for correlation {corr}")]
    EmptyAperture { corr: String },

    #[error("bad array shape supplied to argument {argument} of function {function}. expected {expected}, received {received}")]
    BadArrayShape {
        argument: String,
        function: String,
        expected: String,
        received: String,
    },

    #[error("convolution function cache file {} is corrupt: {reason}", file.display())]
    CorruptFile { file: PathBuf, reason: String },

    #[error("couldn't decode the cache index {}: {err}", file.display())]
    Index {
        file: PathBuf,
        err: serde_json::Error,
    },

    #[error(transparent)]
    IO(#[from] std::io::Error),
}
