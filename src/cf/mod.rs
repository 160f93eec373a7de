// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Convolution functions, keyed by parallactic angle and cached in memory and
//! on disk.

mod avg_pb;
mod builder;
mod cache;
mod disk;
mod error;
mod illumination;
mod pa;

pub use avg_pb::AveragePrimaryBeam;
pub use builder::ConvFuncBuilder;
pub use cache::CfCache;
pub use error::CfError;
pub use illumination::{Feed, Illumination, SquintedDisk, TaperedDisk, UniformDisk};
pub use pa::{angular_distance, ParAngleChangeDetector};

use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{c32, gridding::CorrType};

/// What a convolution function was made for.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CfCoordSys {
    /// \[Hz\]
    pub ref_freq: f64,
    /// The uv grid cell \[wavelengths\]
    pub uv_cell: [f64; 2],
    pub pol_planes: Vec<CorrType>,
    /// \[radians\]
    pub pa: f64,
}

/// What a cached convolution function must have been made for to be reused:
/// everything but the parallactic angle and the number of w-planes, which
/// the cache searches over.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CfKey {
    /// \[Hz\]
    pub ref_freq: f64,
    /// The uv grid cell \[wavelengths\]
    pub uv_cell: [f64; 2],
    pub pol_planes: Vec<CorrType>,
    pub conv_size: usize,
    pub sampling: usize,
}

/// Equal to within rounding.
fn close(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * a.abs().max(b.abs())
}

impl CfKey {
    pub fn matches(&self, coord_sys: &CfCoordSys, conv_size: usize, sampling: usize) -> bool {
        self.conv_size == conv_size
            && self.sampling == sampling
            && self.pol_planes == coord_sys.pol_planes
            && close(self.ref_freq, coord_sys.ref_freq)
            && close(self.uv_cell[0], coord_sys.uv_cell[0])
            && close(self.uv_cell[1], coord_sys.uv_cell[1])
    }

    pub fn matches_entry(&self, entry: &CfEntry) -> bool {
        self.matches(&entry.coord_sys, entry.conv_size(), entry.sampling)
    }

    /// The key `entry` was made for.
    pub fn of(entry: &CfEntry) -> CfKey {
        CfKey {
            ref_freq: entry.coord_sys.ref_freq,
            uv_cell: entry.coord_sys.uv_cell,
            pol_planes: entry.coord_sys.pol_planes.clone(),
            conv_size: entry.conv_size(),
            sampling: entry.sampling,
        }
    }
}

/// A convolution function and its weight function for every w-plane and
/// image polarisation plane. Entries are shared immutably once cached.
#[derive(Clone, Debug, PartialEq)]
pub struct CfEntry {
    /// `(conv_size, conv_size, w_planes, npol)`, origin at `conv_size / 2`.
    pub kernel: Array4<c32>,
    /// Same shape as `kernel`.
    pub weight: Array4<c32>,
    /// Per w-plane \[grid pixels\]
    pub support: Vec<usize>,
    /// Oversampling factor.
    pub sampling: usize,
    /// \[radians\]
    pub pa: f64,
    /// w-plane `iw` holds `w = iw² / w_scale` \[wavelengths\]. 0 when there is
    /// a single plane.
    pub w_scale: f64,
    pub coord_sys: CfCoordSys,
}

impl CfEntry {
    pub fn conv_size(&self) -> usize {
        self.kernel.len_of(Axis(0))
    }

    pub fn n_w_planes(&self) -> usize {
        self.kernel.len_of(Axis(2))
    }

    pub fn n_pol(&self) -> usize {
        self.kernel.len_of(Axis(3))
    }

    /// Memory held by the kernel and weight arrays.
    pub fn size_bytes(&self) -> usize {
        (self.kernel.len() + self.weight.len()) * std::mem::size_of::<c32>()
    }

    /// The w-plane of a sample at `w` \[wavelengths\], clamped to the
    /// available planes.
    pub fn w_plane(&self, w: f64) -> usize {
        let iw = (w.abs() * self.w_scale).sqrt().round() as usize;
        iw.min(self.n_w_planes().saturating_sub(1))
    }
}

/// Where a lookup found its convolution function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CfSource {
    MemoryHit,
    DiskHit,
    /// Not found; a new entry belongs at `insert_at` in the memory list.
    NotCached { insert_at: usize },
}
