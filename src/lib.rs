// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Visibility iteration over measurement-set-like tables, and A-projection
//! gridding with a parallactic-angle keyed convolution function cache.

#[allow(non_camel_case_types)]
pub type c32 = num_complex::Complex<f32>;
#[allow(non_camel_case_types)]
pub type c64 = num_complex::Complex<f64>;

pub mod cf;
pub mod config;
pub mod constants;
pub mod context;
pub mod gridding;
pub mod pos;
pub mod selection;
pub mod table;
pub mod vi;

pub(crate) mod built_info {
    // The file has been placed there by the build script.
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

// Re-exports.
pub use cf::{AveragePrimaryBeam, CfCache, CfEntry, CfSource, Illumination};
pub use config::{GridderConfig, IterConfig};
pub use context::ObsContext;
pub use gridding::{AWProjectFT, CorrType, ImageGeometry};
pub use pos::{
    azel::AzEl,
    earth::LatLngHeight,
    hadec::HADec,
    radec::RADec,
    velocity::{DopplerConvention, VelocityFrame},
};
pub use selection::{ChannelSelection, ChannelSelector, VelocitySelection};
pub use table::{Column, MemoryTable, Slicer, VisTable};
pub use vi::{SubChunkPair, VisBuffer, VisIterReadImpl, VisIterWriteImpl};

pub use erfa::Ellipsoid;
pub use hifitime;
pub use ndarray;
pub use num_complex;
pub use num_complex::Complex;
pub use num_traits;
pub use rayon;

// If "ms" is enabled, re-export rubbl_casatables here.
cfg_if::cfg_if! {
    if #[cfg(feature = "ms")] {
        pub use rubbl_casatables;
        pub use table::CasaTable;
    }
}

#[cfg(test)]
#[test]
fn hifitime_works_as_expected() {
    use hifitime::Epoch;

    let mjd_utc_s = 4_453_200_000.0;
    let epoch = pos::sidereal::casacore_time_to_epoch(mjd_utc_s);
    approx::assert_abs_diff_eq!(epoch.to_mjd_utc_seconds(), mjd_utc_s, epsilon = 1e-6);

    let jd_utc = 2444244.5;
    let epoch = Epoch::from_jde_utc(jd_utc);
    approx::assert_abs_diff_eq!(epoch.to_jde_utc_days(), jd_utc);
}
