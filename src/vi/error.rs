// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors from visibility iteration.

use thiserror::Error;

use crate::{pos::ErfaError, selection::SelectionError, table::TableError};

#[derive(Error, Debug)]
pub enum ViError {
    #[error("bad array shape supplied to argument {argument} of function {function}. expected {expected}, received {received}")]
    BadArrayShape {
        argument: String,
        function: String,
        expected: String,
        received: String,
    },

    #[error("{tables} tables were supplied with {contexts} observation contexts; there must be one context per table")]
    ContextCount { tables: usize, contexts: usize },

    #[error("the iterator has no current subchunk; call origin_chunks first or check more()")]
    NoCurrentSubchunk,

    #[error("measurement set {ms} has no spectral window for data description {ddid}")]
    UnknownDataDescription { ms: usize, ddid: usize },

    #[error("measurement set {ms} has no field {field}")]
    UnknownField { ms: usize, field: usize },

    #[error("column {column} is required but missing from measurement set {ms}")]
    MissingColumn { ms: usize, column: &'static str },

    #[error("the buffer has no {component} to write back")]
    MissingBufferComponent { component: String },

    #[error(transparent)]
    Table(#[from] TableError),

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Erfa(#[from] ErfaError),
}
