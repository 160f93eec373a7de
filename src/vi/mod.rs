// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Visibility iteration.
//!
//! [`VisIterReadImpl`] walks one or more tables in chunks (runs of rows with
//! one data description, field and scan) and subchunks (rows sharing a
//! timestamp, or fixed row blocks). Each chunk is visited once per selected
//! channel group. Columns of the current subchunk are read lazily and cached
//! until the iterator moves.
//!
//! [`VisIterWriteImpl`] writes columns of the current subchunk back through
//! the read side's row selection and channel slicer.

mod buffer;
mod cache;
mod chunk;
mod error;
mod read;
mod write;

pub use buffer::VisBuffer;
pub use error::ViError;
pub use read::VisIterReadImpl;
pub use write::{SelectionState, VisIterWriteImpl, WriteBack};

use crate::table::Column;

/// A (chunk, subchunk) position. Orders lexicographically.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubChunkPair {
    pub chunk: usize,
    pub subchunk: usize,
}

impl SubChunkPair {
    /// Returned once every table is exhausted.
    pub const NO_MORE_DATA: SubChunkPair = SubChunkPair {
        chunk: usize::MAX,
        subchunk: usize::MAX,
    };

    pub fn new(chunk: usize, subchunk: usize) -> SubChunkPair {
        SubChunkPair { chunk, subchunk }
    }

    pub fn is_no_more_data(&self) -> bool {
        *self == Self::NO_MORE_DATA
    }
}

impl std::fmt::Display for SubChunkPair {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "({},{})", self.chunk, self.subchunk)
    }
}

/// Where the iterator is in its walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IterState {
    Uninitialized,
    OriginOfChunks,
    OriginOfSubchunk,
    Advancing,
    EndOfChunk,
    NextChunk,
    Exhausted,
}

/// Which visibility column to read or write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VisKind {
    Observed,
    Corrected,
    Model,
    /// Real-valued single-dish data, promoted to complex.
    Float,
}

impl VisKind {
    pub const ALL: [VisKind; 4] = [
        VisKind::Observed,
        VisKind::Corrected,
        VisKind::Model,
        VisKind::Float,
    ];

    pub fn column(self) -> Column {
        match self {
            VisKind::Observed => Column::Data,
            VisKind::Corrected => Column::CorrectedData,
            VisKind::Model => Column::ModelData,
            VisKind::Float => Column::FloatData,
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// The parts of a [`VisBuffer`] that can be written back to a table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VisComponent {
    Flag,
    FlagRow,
    FlagCategory,
    Weight,
    WeightMat,
    WeightSpectrum,
    Sigma,
    Observed,
    Corrected,
    Model,
    Float,
}

impl VisComponent {
    pub const ALL: [VisComponent; 11] = [
        VisComponent::Flag,
        VisComponent::FlagRow,
        VisComponent::FlagCategory,
        VisComponent::Weight,
        VisComponent::WeightMat,
        VisComponent::WeightSpectrum,
        VisComponent::Sigma,
        VisComponent::Observed,
        VisComponent::Corrected,
        VisComponent::Model,
        VisComponent::Float,
    ];
}

impl From<VisKind> for VisComponent {
    fn from(kind: VisKind) -> Self {
        match kind {
            VisKind::Observed => VisComponent::Observed,
            VisKind::Corrected => VisComponent::Corrected,
            VisKind::Model => VisComponent::Model,
            VisKind::Float => VisComponent::Float,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_util;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subchunk_pair_ordering() {
        let a = SubChunkPair::new(0, 5);
        let b = SubChunkPair::new(1, 0);
        assert!(a < b);
        assert!(b < SubChunkPair::NO_MORE_DATA);
        assert_eq!(format!("{a}"), "(0,5)");
        assert!(SubChunkPair::NO_MORE_DATA.is_no_more_data());
    }
}
