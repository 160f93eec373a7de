// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Selecting channels of spectral windows for visibility iteration.
//!
//! A [`ChannelSelection`] picks `n_groups` groups of `width` channels from a
//! spectral window. Group `g` starts at channel `start + g * width` and steps
//! through the window `increment` channels at a time. The iterator visits one
//! channel group per pass over a chunk's rows.
//!
//! A selection is checked against the spectral window when it is made;
//! nothing is applied if it doesn't fit.
//!
//! # Examples
//!
//! ```rust
//! use visgrid::selection::ChannelSelector;
//!
//! // One measurement set with a single 64-channel spectral window.
//! let freqs: Vec<f64> = (0..64).map(|i| 1e9 + i as f64 * 1e6).collect();
//! let mut selector = ChannelSelector::new(vec![vec![freqs]]);
//!
//! selector.select_channel(0, 0, 4, 8, 2, 1).unwrap();
//! let sel = selector.channel_selection(0, 0).unwrap();
//! assert_eq!(sel.slicer(1).start, 10);
//!
//! // This one runs off the end of the window, and so is rejected.
//! assert!(selector.select_channel(0, 0, 4, 60, 2, 1).is_err());
//! ```

use std::collections::BTreeMap;

use log::debug;
use thiserror::Error;

use crate::table::Slicer;

pub use crate::pos::velocity::{DopplerConvention, VelocityFrame};

#[derive(Error, Debug, PartialEq)]
pub enum SelectionError {
    #[error("measurement set {ms} has no spectral window {spw}")]
    /// Error for a spectral window that the measurement set doesn't have
    UnknownSpw { ms: usize, spw: usize },

    #[error("{name} must be at least 1 in a channel selection")]
    /// Error for a zero group count, width or increment
    ZeroParameter { name: &'static str },

    #[error("channel selection of {n_groups} groups of width {width} starting at {start} with increment {increment} does not fit in spectral window {spw}, which has {num_chans} channels")]
    /// Error for a selection that runs past the end of the spectral window
    OutOfRange {
        spw: usize,
        n_groups: usize,
        start: usize,
        width: usize,
        increment: usize,
        num_chans: usize,
    },

    #[error("no channels of spectral window {spw} lie between {f_min} Hz and {f_max} Hz")]
    /// Error for a frequency range that selects nothing
    NoChannelsInRange { spw: usize, f_min: f64, f_max: f64 },

    #[error("a velocity selection needs at least one channel")]
    NoVelocityChannels,

    #[error("the rest frequency of a velocity selection must be positive, got {rest_freq_hz} Hz")]
    BadRestFrequency { rest_freq_hz: f64 },

    #[error("a velocity selection of {n_chan} channels can't describe a channel group of {group_size} channels")]
    /// Error for a velocity grid whose length differs from the data it labels
    VelocityChannelMismatch { n_chan: usize, group_size: usize },
}

/// `n_groups` groups of `width` channels, starting at `start`, stepping
/// `increment` channels within a group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChannelSelection {
    pub n_groups: usize,
    pub start: usize,
    pub width: usize,
    pub increment: usize,
}

impl ChannelSelection {
    pub fn new(n_groups: usize, start: usize, width: usize, increment: usize) -> ChannelSelection {
        ChannelSelection {
            n_groups,
            start,
            width,
            increment,
        }
    }

    /// A whole spectral window as a single group.
    pub fn whole_window(num_chans: usize) -> ChannelSelection {
        ChannelSelection::new(1, 0, num_chans, 1)
    }

    /// Check this selection against a spectral window with `num_chans`
    /// channels.
    pub fn validate(&self, spw: usize, num_chans: usize) -> Result<(), SelectionError> {
        for (name, value) in [
            ("n_groups", self.n_groups),
            ("width", self.width),
            ("increment", self.increment),
        ] {
            if value == 0 {
                return Err(SelectionError::ZeroParameter { name });
            }
        }
        let last_group_end = self.start + self.width * self.n_groups;
        let last_channel = self.start
            + (self.n_groups - 1) * self.width
            + (self.width - 1) * self.increment;
        if last_group_end > num_chans || last_channel >= num_chans {
            return Err(SelectionError::OutOfRange {
                spw,
                n_groups: self.n_groups,
                start: self.start,
                width: self.width,
                increment: self.increment,
                num_chans,
            });
        }
        Ok(())
    }

    /// The slicer for channel group `group`.
    pub fn slicer(&self, group: usize) -> Slicer {
        Slicer::new(self.start + group * self.width, self.width, self.increment)
    }

    /// The frequencies of channel group `group`.
    pub fn frequencies(&self, chan_freqs: &[f64], group: usize) -> Vec<f64> {
        self.slicer(group)
            .indices()
            .filter_map(|i| chan_freqs.get(i).copied())
            .collect()
    }
}

/// A grid of `n_chan` velocities starting at `v_start` and `v_inc` apart
/// \[metres/second\], in `frame`, converted to frequencies with `doppler`
/// about `rest_freq_hz`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VelocitySelection {
    pub n_chan: usize,
    pub v_start: f64,
    pub v_inc: f64,
    pub frame: VelocityFrame,
    pub doppler: DopplerConvention,
    pub rest_freq_hz: f64,
}

impl VelocitySelection {
    pub fn validate(&self) -> Result<(), SelectionError> {
        if self.n_chan == 0 {
            return Err(SelectionError::NoVelocityChannels);
        }
        if self.rest_freq_hz.is_nan() || self.rest_freq_hz <= 0.0 {
            return Err(SelectionError::BadRestFrequency {
                rest_freq_hz: self.rest_freq_hz,
            });
        }
        Ok(())
    }

    /// The velocity of each channel in the selection's own frame.
    pub fn velocities(&self) -> impl Iterator<Item = f64> + '_ {
        (0..self.n_chan).map(move |i| self.v_start + i as f64 * self.v_inc)
    }

    /// Frequencies of the velocity grid in the selection's frame.
    pub fn frame_frequencies(&self) -> Vec<f64> {
        self.velocities()
            .map(|v| self.doppler.frequency(self.rest_freq_hz, v))
            .collect()
    }

    /// Frequencies of the velocity grid as seen by an observatory moving
    /// toward the source at `obs_velocity` in the selection's frame.
    pub fn topo_frequencies(&self, obs_velocity: f64) -> Vec<f64> {
        self.velocities()
            .map(|v| self.doppler.frequency(self.rest_freq_hz, v - obs_velocity))
            .collect()
    }
}

/// Channel selections per (measurement set, spectral window), plus an
/// optional velocity selection shared by all measurement sets.
#[derive(Clone, Debug, Default)]
pub struct ChannelSelector {
    /// Channel frequencies per measurement set, per spectral window.
    chan_freqs: Vec<Vec<Vec<f64>>>,
    selections: BTreeMap<(usize, usize), ChannelSelection>,
    velocity: Option<VelocitySelection>,
    changed: bool,
}

impl ChannelSelector {
    pub fn new(chan_freqs: Vec<Vec<Vec<f64>>>) -> ChannelSelector {
        ChannelSelector {
            chan_freqs,
            ..Default::default()
        }
    }

    fn spw_freqs(&self, ms: usize, spw: usize) -> Result<&[f64], SelectionError> {
        self.chan_freqs
            .get(ms)
            .and_then(|spws| spws.get(spw))
            .map(|f| f.as_slice())
            .ok_or(SelectionError::UnknownSpw { ms, spw })
    }

    /// Select `n_groups` groups of `width` channels in `spw` of measurement
    /// set `ms`. This replaces any earlier selection for that window.
    pub fn select_channel(
        &mut self,
        ms: usize,
        spw: usize,
        n_groups: usize,
        start: usize,
        width: usize,
        increment: usize,
    ) -> Result<(), SelectionError> {
        let num_chans = self.spw_freqs(ms, spw)?.len();
        let sel = ChannelSelection::new(n_groups, start, width, increment);
        sel.validate(spw, num_chans)?;
        debug!("Selected channels {sel:?} of ms {ms} spw {spw}");
        self.selections.insert((ms, spw), sel);
        self.changed = true;
        Ok(())
    }

    /// Select the contiguous run of channels in `spw` whose centre
    /// frequencies are within `[f_min, f_max]`, as a single group.
    pub fn select_channel_by_frequency(
        &mut self,
        ms: usize,
        spw: usize,
        f_min: f64,
        f_max: f64,
    ) -> Result<(), SelectionError> {
        let (lo, hi) = if f_min <= f_max {
            (f_min, f_max)
        } else {
            (f_max, f_min)
        };
        let freqs = self.spw_freqs(ms, spw)?;
        let inside: Vec<usize> = freqs
            .iter()
            .enumerate()
            .filter(|(_, &f)| f >= lo && f <= hi)
            .map(|(i, _)| i)
            .collect();
        let (first, last) = match (inside.first(), inside.last()) {
            (Some(&a), Some(&b)) => (a, b),
            _ => {
                return Err(SelectionError::NoChannelsInRange {
                    spw,
                    f_min: lo,
                    f_max: hi,
                })
            }
        };
        self.select_channel(ms, spw, 1, first, last - first + 1, 1)
    }

    /// Select a velocity grid. Frequencies reported by the iterator then
    /// follow the grid rather than the spectral window.
    pub fn select_velocity(&mut self, selection: VelocitySelection) -> Result<(), SelectionError> {
        selection.validate()?;
        self.velocity = Some(selection);
        self.changed = true;
        Ok(())
    }

    pub fn clear_velocity(&mut self) {
        if self.velocity.take().is_some() {
            self.changed = true;
        }
    }

    pub fn velocity_selection(&self) -> Option<&VelocitySelection> {
        self.velocity.as_ref()
    }

    /// The selection made for `spw` of measurement set `ms`, if any.
    pub fn channel_selection(&self, ms: usize, spw: usize) -> Option<ChannelSelection> {
        self.selections.get(&(ms, spw)).copied()
    }

    /// The selection in effect for `spw`; the whole window if nothing was
    /// selected.
    pub fn effective_selection(&self, ms: usize, spw: usize) -> Option<ChannelSelection> {
        self.channel_selection(ms, spw).or_else(|| {
            self.spw_freqs(ms, spw)
                .ok()
                .map(|f| ChannelSelection::whole_window(f.len()))
        })
    }

    /// The spectral windows of `ms` that have a selection.
    pub fn selected_spws(&self, ms: usize) -> Vec<usize> {
        self.selections
            .keys()
            .filter(|(m, _)| *m == ms)
            .map(|&(_, spw)| spw)
            .collect()
    }

    /// Whether chunks in `spw` of `ms` should be visited. With no selections
    /// for `ms`, everything is.
    pub fn is_spw_selected(&self, ms: usize, spw: usize) -> bool {
        let selected = self.selected_spws(ms);
        selected.is_empty() || selected.contains(&spw)
    }

    pub fn slicer(&self, ms: usize, spw: usize, group: usize) -> Option<Slicer> {
        self.effective_selection(ms, spw).map(|s| s.slicer(group))
    }

    /// The channel frequencies of `spw` in `ms`.
    pub fn chan_freqs(&self, ms: usize, spw: usize) -> Option<&[f64]> {
        self.spw_freqs(ms, spw).ok()
    }

    /// Report and clear whether the selection changed since the last call.
    pub(crate) fn take_changed(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn selector() -> ChannelSelector {
        let spw0: Vec<f64> = (0..64).map(|i| 100e6 + i as f64 * 1e6).collect();
        let spw1: Vec<f64> = (0..16).map(|i| 200e6 + i as f64 * 1e6).collect();
        ChannelSelector::new(vec![vec![spw0, spw1]])
    }

    #[test]
    fn test_selection_round_trip() {
        let mut s = selector();
        for (n, st, w, inc) in [(64, 0, 1, 1), (4, 2, 8, 1), (2, 0, 16, 2), (1, 63, 1, 1)] {
            s.select_channel(0, 0, n, st, w, inc).unwrap();
            assert_eq!(
                s.channel_selection(0, 0),
                Some(ChannelSelection::new(n, st, w, inc))
            );
        }
    }

    #[test]
    fn test_out_of_range_is_not_applied() {
        let mut s = selector();
        s.select_channel(0, 1, 2, 0, 4, 1).unwrap();
        s.take_changed();
        let result = s.select_channel(0, 1, 4, 2, 4, 1);
        assert!(matches!(
            result,
            Err(SelectionError::OutOfRange { num_chans: 16, .. })
        ));
        assert_eq!(
            s.channel_selection(0, 1),
            Some(ChannelSelection::new(2, 0, 4, 1))
        );
        assert!(!s.take_changed());
    }

    #[test]
    fn test_increment_overrun_is_rejected() {
        // start + width * n_groups fits, but the stride runs off the end.
        let mut s = selector();
        let result = s.select_channel(0, 1, 1, 0, 8, 3);
        assert!(matches!(result, Err(SelectionError::OutOfRange { .. })));
    }

    #[test]
    fn test_zero_parameters() {
        let mut s = selector();
        assert_eq!(
            s.select_channel(0, 0, 0, 0, 1, 1),
            Err(SelectionError::ZeroParameter { name: "n_groups" })
        );
        assert_eq!(
            s.select_channel(0, 0, 1, 0, 1, 0),
            Err(SelectionError::ZeroParameter { name: "increment" })
        );
        assert_eq!(
            s.select_channel(1, 0, 1, 0, 1, 1),
            Err(SelectionError::UnknownSpw { ms: 1, spw: 0 })
        );
    }

    #[test]
    fn test_group_frequencies() {
        let s = ChannelSelection::new(2, 4, 3, 2);
        let freqs: Vec<f64> = (0..16).map(|i| i as f64).collect();
        assert_eq!(s.frequencies(&freqs, 0), vec![4.0, 6.0, 8.0]);
        assert_eq!(s.frequencies(&freqs, 1), vec![7.0, 9.0, 11.0]);
    }

    #[test]
    fn test_select_by_frequency() {
        let mut s = selector();
        s.select_channel_by_frequency(0, 0, 110.5e6, 104.5e6).unwrap();
        assert_eq!(
            s.channel_selection(0, 0),
            Some(ChannelSelection::new(1, 5, 6, 1))
        );
        assert!(matches!(
            s.select_channel_by_frequency(0, 0, 1e9, 2e9),
            Err(SelectionError::NoChannelsInRange { .. })
        ));
    }

    #[test]
    fn test_default_and_selected_spws() {
        let mut s = selector();
        assert!(s.is_spw_selected(0, 1));
        assert_eq!(
            s.effective_selection(0, 1),
            Some(ChannelSelection::whole_window(16))
        );
        s.select_channel(0, 0, 1, 0, 1, 1).unwrap();
        assert_eq!(s.selected_spws(0), vec![0]);
        assert!(!s.is_spw_selected(0, 1));
    }

    #[test]
    fn test_velocity_selection() {
        let mut s = selector();
        let bad = VelocitySelection {
            n_chan: 0,
            v_start: 0.0,
            v_inc: 1000.0,
            frame: VelocityFrame::Lsrk,
            doppler: DopplerConvention::Radio,
            rest_freq_hz: 1.42e9,
        };
        assert_eq!(s.select_velocity(bad), Err(SelectionError::NoVelocityChannels));
        let bad = VelocitySelection {
            n_chan: 3,
            rest_freq_hz: 0.0,
            ..bad
        };
        assert!(matches!(
            s.select_velocity(bad),
            Err(SelectionError::BadRestFrequency { .. })
        ));

        let good = VelocitySelection {
            rest_freq_hz: 1.0e9,
            ..bad
        };
        s.select_velocity(good).unwrap();
        let f = good.frame_frequencies();
        assert_eq!(f.len(), 3);
        assert_abs_diff_eq!(f[0], 1.0e9, epsilon = 1e-3);
        assert!(f[1] < f[0]);
        // Moving away from the source lowers the observed frequency.
        let topo = good.topo_frequencies(-1000.0);
        assert_abs_diff_eq!(topo[0], f[1], epsilon = 1e-3);
    }
}
