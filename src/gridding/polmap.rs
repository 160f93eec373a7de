// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Mapping visibility polarisations and channels onto image planes.

use serde::{Deserialize, Serialize};

use crate::cf::Feed;

/// A casacore Stokes code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum CorrType {
    I = 1,
    Q = 2,
    U = 3,
    V = 4,
    RR = 5,
    RL = 6,
    LR = 7,
    LL = 8,
    XX = 9,
    XY = 10,
    YX = 11,
    YY = 12,
}

impl CorrType {
    pub fn from_code(code: i32) -> Option<CorrType> {
        use CorrType::*;
        Some(match code {
            1 => I,
            2 => Q,
            3 => U,
            4 => V,
            5 => RR,
            6 => RL,
            7 => LR,
            8 => LL,
            9 => XX,
            10 => XY,
            11 => YX,
            12 => YY,
            _ => return None,
        })
    }

    pub fn code(self) -> i32 {
        self as i32
    }

    /// The correlation with the two feeds swapped. Stokes parameters are
    /// their own conjugates.
    pub fn conjugate(self) -> CorrType {
        use CorrType::*;
        match self {
            RR => LL,
            LL => RR,
            RL => LR,
            LR => RL,
            XX => YY,
            YY => XX,
            XY => YX,
            YX => XY,
            s => s,
        }
    }

    /// The feeds correlated. Stokes parameters use an unsquinted linear feed.
    pub fn feeds(self) -> (Feed, Feed) {
        use CorrType::*;
        match self {
            RR => (Feed::R, Feed::R),
            RL => (Feed::R, Feed::L),
            LR => (Feed::L, Feed::R),
            LL => (Feed::L, Feed::L),
            XY => (Feed::X, Feed::Y),
            YX => (Feed::Y, Feed::X),
            YY => (Feed::Y, Feed::Y),
            XX | I | Q | U | V => (Feed::X, Feed::X),
        }
    }
}

impl std::fmt::Display for CorrType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// For each visibility correlation, the image plane it is gridded onto.
pub fn pol_map(vis_corrs: &[i32], planes: &[CorrType]) -> Vec<Option<usize>> {
    vis_corrs
        .iter()
        .map(|&code| planes.iter().position(|p| p.code() == code))
        .collect()
}

/// For each visibility correlation that is gridded, the plane of its
/// conjugate correlation.
///
/// For visibilities `[RR, RL, LR, LL]` and planes `[LL, RR]`, the polarisation
/// map is `[1, -, -, 0]` and the conjugate map is `[0, -, -, 1]`.
pub fn conj_pol_map(vis_corrs: &[i32], planes: &[CorrType]) -> Vec<Option<usize>> {
    let direct = pol_map(vis_corrs, planes);
    vis_corrs
        .iter()
        .zip(direct.iter())
        .map(|(&code, plane)| {
            plane.and_then(|_| {
                let conj = CorrType::from_code(code)?.conjugate();
                planes.iter().position(|&p| p == conj)
            })
        })
        .collect()
}

/// For each visibility channel, the image channel it is gridded onto. With a
/// single image channel everything goes there; otherwise a channel goes to
/// the nearest image channel within half an image channel width.
pub fn chan_map(vis_freqs: &[f64], image_freqs: &[f64]) -> Vec<Option<usize>> {
    match image_freqs {
        [] => vec![None; vis_freqs.len()],
        [_] => vec![Some(0); vis_freqs.len()],
        [f0, f1, ..] => {
            let half_width = (f1 - f0).abs() / 2.0;
            vis_freqs
                .iter()
                .map(|&f| {
                    image_freqs
                        .iter()
                        .enumerate()
                        .map(|(i, &im)| (i, (im - f).abs()))
                        .min_by(|a, b| a.1.total_cmp(&b.1))
                        .filter(|&(_, d)| d <= half_width)
                        .map(|(i, _)| i)
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CorrType::*;

    #[test]
    fn test_pol_maps_for_circular_feeds() {
        let vis = [5, 6, 7, 8];
        let planes = [LL, RR];
        assert_eq!(pol_map(&vis, &planes), vec![Some(1), None, None, Some(0)]);
        assert_eq!(
            conj_pol_map(&vis, &planes),
            vec![Some(0), None, None, Some(1)]
        );
    }

    #[test]
    fn test_full_pol_linear() {
        let vis = [9, 10, 11, 12];
        let planes = [XX, XY, YX, YY];
        assert_eq!(
            pol_map(&vis, &planes),
            vec![Some(0), Some(1), Some(2), Some(3)]
        );
        assert_eq!(
            conj_pol_map(&vis, &planes),
            vec![Some(3), Some(2), Some(1), Some(0)]
        );
    }

    #[test]
    fn test_codes() {
        for code in 1..=12 {
            let c = CorrType::from_code(code).unwrap();
            assert_eq!(c.code(), code);
            assert_eq!(c.conjugate().conjugate(), c);
        }
        assert!(CorrType::from_code(13).is_none());
        assert_eq!(I.conjugate(), I);
        assert_eq!(RL.feeds(), (Feed::R, Feed::L));
    }

    #[test]
    fn test_chan_map() {
        let vis = [100.0, 101.0, 102.0, 103.0, 110.0];
        assert_eq!(chan_map(&vis, &[150.0]), vec![Some(0); 5]);
        assert_eq!(
            chan_map(&vis, &[100.0, 102.0]),
            vec![Some(0), Some(0), Some(1), Some(1), None]
        );
    }
}
