// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-subchunk column caches and single-slot angle caches.

use ndarray::prelude::*;

use super::ViError;
use crate::{c32, table::Column, AzEl};

/// Columns of the current subchunk that have been read so far. Everything is
/// dropped when the iterator moves.
#[derive(Debug, Default)]
pub(crate) struct SubChunkCache {
    pub(crate) antenna1: Option<Array1<i32>>,
    pub(crate) antenna2: Option<Array1<i32>>,
    pub(crate) feed1: Option<Array1<i32>>,
    pub(crate) feed2: Option<Array1<i32>>,
    pub(crate) scan: Option<Array1<i32>>,
    pub(crate) state_id: Option<Array1<i32>>,
    pub(crate) observation_id: Option<Array1<i32>>,
    pub(crate) processor_id: Option<Array1<i32>>,
    pub(crate) time: Option<Array1<f64>>,
    pub(crate) time_centroid: Option<Array1<f64>>,
    pub(crate) exposure: Option<Array1<f64>>,
    pub(crate) interval: Option<Array1<f64>>,
    pub(crate) uvw: Option<Array2<f64>>,
    pub(crate) flag_cube: Option<Array3<bool>>,
    pub(crate) flag: Option<Array2<bool>>,
    pub(crate) flag_row: Option<Array1<bool>>,
    pub(crate) flag_category: Option<Array4<bool>>,
    pub(crate) vis: [Option<Array3<c32>>; 4],
    pub(crate) weight: Option<Array1<f32>>,
    pub(crate) weight_mat: Option<Array2<f32>>,
    pub(crate) weight_spectrum: Option<Array3<f32>>,
    pub(crate) sigma: Option<Array1<f32>>,
    pub(crate) sigma_mat: Option<Array2<f32>>,
    pub(crate) frequency: Option<Array1<f64>>,
    pub(crate) lsr_frequency: Option<Array1<f64>>,
}

impl SubChunkCache {
    pub(crate) fn clear(&mut self) {
        *self = SubChunkCache::default();
    }

    /// Forget whatever was derived from `column`.
    pub(crate) fn invalidate(&mut self, column: Column) {
        match column {
            Column::Antenna1 => self.antenna1 = None,
            Column::Antenna2 => self.antenna2 = None,
            Column::Feed1 => self.feed1 = None,
            Column::Feed2 => self.feed2 = None,
            Column::ScanNumber => self.scan = None,
            Column::StateId => self.state_id = None,
            Column::ObservationId => self.observation_id = None,
            Column::ProcessorId => self.processor_id = None,
            Column::Time => self.time = None,
            Column::TimeCentroid => self.time_centroid = None,
            Column::Exposure => self.exposure = None,
            Column::Interval => self.interval = None,
            Column::Uvw => self.uvw = None,
            Column::Flag => {
                self.flag_cube = None;
                self.flag = None;
            }
            Column::FlagRow => self.flag_row = None,
            Column::FlagCategory => self.flag_category = None,
            Column::Data => self.vis[0] = None,
            Column::CorrectedData => self.vis[1] = None,
            Column::ModelData => self.vis[2] = None,
            Column::FloatData => self.vis[3] = None,
            Column::Weight | Column::WeightSpectrum => {
                self.weight = None;
                self.weight_mat = None;
                self.weight_spectrum = None;
            }
            Column::Sigma => {
                self.sigma = None;
                self.sigma_mat = None;
            }
            Column::DataDescId | Column::FieldId => {}
        }
    }
}

/// What an angle cache slot is valid for: a timestamp, within one table and
/// field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct AngleKey {
    pub(crate) time_bits: u64,
    pub(crate) ms: usize,
    pub(crate) field: usize,
}

impl AngleKey {
    pub(crate) fn new(time: f64, ms: usize, field: usize) -> AngleKey {
        AngleKey {
            time_bits: time.to_bits(),
            ms,
            field,
        }
    }
}

/// A single-slot cache. A new value is only computed when the key changes.
#[derive(Debug)]
pub(crate) struct AngleCache<V> {
    key: Option<AngleKey>,
    value: Option<V>,
    recomputes: usize,
}

impl<V> Default for AngleCache<V> {
    fn default() -> Self {
        AngleCache {
            key: None,
            value: None,
            recomputes: 0,
        }
    }
}

impl<V> AngleCache<V> {
    pub(crate) fn get_or_try_insert(
        &mut self,
        key: AngleKey,
        compute: impl FnOnce() -> Result<V, ViError>,
    ) -> Result<&V, ViError> {
        let value = match self.value.take() {
            Some(v) if self.key == Some(key) => v,
            _ => {
                self.recomputes += 1;
                compute()?
            }
        };
        self.key = Some(key);
        Ok(&*self.value.insert(value))
    }

    pub(crate) fn recomputes(&self) -> usize {
        self.recomputes
    }
}

/// All of the angle caches.
#[derive(Debug, Default)]
pub(crate) struct AngleCaches {
    pub(crate) parallactic_angle: AngleCache<f64>,
    pub(crate) feed_pa: AngleCache<Array1<f64>>,
    pub(crate) azel: AngleCache<Vec<AzEl>>,
    pub(crate) azel0: AngleCache<AzEl>,
    pub(crate) hour_angle: AngleCache<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_angle_cache_single_slot() {
        let mut cache = AngleCache::<f64>::default();
        let k1 = AngleKey::new(1.0, 0, 0);
        let k2 = AngleKey::new(2.0, 0, 0);
        assert_eq!(*cache.get_or_try_insert(k1, || Ok(10.0)).unwrap(), 10.0);
        assert_eq!(*cache.get_or_try_insert(k1, || Ok(99.0)).unwrap(), 10.0);
        assert_eq!(cache.recomputes(), 1);
        assert_eq!(*cache.get_or_try_insert(k2, || Ok(20.0)).unwrap(), 20.0);
        // Only one slot; going back recomputes.
        assert_eq!(*cache.get_or_try_insert(k1, || Ok(11.0)).unwrap(), 11.0);
        assert_eq!(cache.recomputes(), 3);
    }

    #[test]
    fn test_angle_cache_error_leaves_slot_empty() {
        let mut cache = AngleCache::<f64>::default();
        let k = AngleKey::new(1.0, 0, 0);
        assert!(cache
            .get_or_try_insert(k, || Err(ViError::NoCurrentSubchunk))
            .is_err());
        assert_eq!(*cache.get_or_try_insert(k, || Ok(3.0)).unwrap(), 3.0);
    }

    #[test]
    fn test_invalidate_flag() {
        let mut cache = SubChunkCache {
            flag_cube: Some(Array3::default((1, 1, 1))),
            flag: Some(Array2::default((1, 1))),
            time: Some(Array1::zeros(1)),
            ..Default::default()
        };
        cache.invalidate(Column::Flag);
        assert!(cache.flag_cube.is_none());
        assert!(cache.flag.is_none());
        assert!(cache.time.is_some());
    }
}
