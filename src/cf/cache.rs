// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The memory and disk cache of convolution functions.

use std::collections::BTreeMap;
use std::f64::consts::TAU;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, trace};

use super::{
    angular_distance,
    disk::{self, CfIndex},
    AveragePrimaryBeam, CfEntry, CfError, CfKey, CfSource,
};

/// Convolution functions, per number of w-planes, ordered by parallactic
/// angle. With a directory, every cached entry is also persisted there and
/// entries persisted by earlier runs are found. Only entries made for the
/// [`CfKey`] of a lookup are returned by it.
#[derive(Debug)]
pub struct CfCache {
    dir: Option<PathBuf>,
    memory: BTreeMap<usize, Vec<Arc<CfEntry>>>,
    index: CfIndex,
    avg_pb: Option<(CfKey, AveragePrimaryBeam)>,
}

/// An angle in `[0, 2π)`, for ordering.
fn wrapped(pa: f64) -> f64 {
    pa.rem_euclid(TAU)
}

/// The closest of `candidates` to `pa`, if within `tolerance`.
fn nearest<'a, T, I>(candidates: I, pa: f64, tolerance: f64) -> Option<&'a T>
where
    I: Iterator<Item = (f64, &'a T)>,
    T: 'a,
{
    let tolerance = tolerance.max(0.0);
    candidates
        .map(|(cand_pa, t)| (t, angular_distance(cand_pa, pa)))
        .filter(|&(_, d)| d <= tolerance)
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(t, _)| t)
}

impl CfCache {
    /// A memory-only cache.
    pub fn in_memory() -> CfCache {
        CfCache {
            dir: None,
            memory: BTreeMap::new(),
            index: CfIndex::default(),
            avg_pb: None,
        }
    }

    /// A cache backed by `dir`, which is created if needed. `None` gives a
    /// memory-only cache.
    pub fn new<P: AsRef<Path>>(dir: Option<P>) -> Result<CfCache, CfError> {
        let dir = match dir {
            None => return Ok(CfCache::in_memory()),
            Some(d) => d.as_ref().to_path_buf(),
        };
        std::fs::create_dir_all(&dir)?;
        let index = CfIndex::load(&dir)?;
        debug!(
            "Opened convolution function cache {} with {} entries",
            dir.display(),
            index.entries.len()
        );
        Ok(CfCache {
            dir: Some(dir),
            memory: BTreeMap::new(),
            index,
            avg_pb: None,
        })
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Find a convolution function made for `key` with `w_planes` planes
    /// within `tolerance` radians of `pa`: first in memory, then on disk
    /// (loading it into memory). Negative tolerances are treated as 0.
    pub fn locate(
        &mut self,
        key: &CfKey,
        w_planes: usize,
        pa: f64,
        tolerance: f64,
    ) -> Result<(CfSource, Option<Arc<CfEntry>>), CfError> {
        if let Some(list) = self.memory.get(&w_planes) {
            let candidates = list
                .iter()
                .filter(|e| key.matches_entry(e))
                .map(|e| (e.pa, e));
            if let Some(entry) = nearest(candidates, pa, tolerance) {
                trace!("CF for PA {:.3}° found in memory", pa.to_degrees());
                return Ok((CfSource::MemoryHit, Some(Arc::clone(entry))));
            }
        }

        if let Some(dir) = &self.dir {
            let on_disk = self
                .index
                .entries
                .iter()
                .filter(|e| e.w_planes == w_planes)
                .filter(|e| key.matches(&e.coord_sys, e.conv_size, e.sampling))
                .map(|e| (e.pa, e));
            if let Some(meta) = nearest(on_disk, pa, tolerance) {
                debug!(
                    "CF for PA {:.3}° found on disk in {}",
                    pa.to_degrees(),
                    meta.file
                );
                let entry = Arc::new(disk::read_entry(dir, meta)?);
                self.insert_in_memory(Arc::clone(&entry));
                return Ok((CfSource::DiskHit, Some(entry)));
            }
        }

        debug!("No CF cached for PA {:.3}°", pa.to_degrees());
        let insert_at = self.insert_index(w_planes, wrapped(pa));
        Ok((CfSource::NotCached { insert_at }, None))
    }

    fn insert_index(&self, w_planes: usize, pa: f64) -> usize {
        self.memory
            .get(&w_planes)
            .map(|list| list.partition_point(|e| wrapped(e.pa) < pa))
            .unwrap_or(0)
    }

    fn insert_in_memory(&mut self, entry: Arc<CfEntry>) {
        let w_planes = entry.n_w_planes();
        let at = self.insert_index(w_planes, wrapped(entry.pa));
        self.memory.entry(w_planes).or_default().insert(at, entry);
    }

    /// Keep `entry` in memory and, with a directory, on disk.
    pub fn cache(&mut self, entry: CfEntry) -> Result<Arc<CfEntry>, CfError> {
        if let Some(dir) = &self.dir {
            let file = self.index.file_name_for(&entry);
            let meta = disk::write_entry(dir, &entry, file)?;
            debug!("Wrote CF {} to the disk cache", meta.file);
            self.index.upsert(meta);
            self.index.save(dir)?;
        }
        let entry = Arc::new(entry);
        self.insert_in_memory(Arc::clone(&entry));
        Ok(entry)
    }

    /// The average primary beam accumulated for `key`, from memory or disk.
    pub fn load_avg_pb(&mut self, key: &CfKey) -> Result<Option<AveragePrimaryBeam>, CfError> {
        if let Some((held, pb)) = &self.avg_pb {
            if held == key {
                return Ok(Some(pb.clone()));
            }
        }
        if let (Some(dir), Some(record)) = (&self.dir, &self.index.avg_pb) {
            if record.key.as_ref() == Some(key) {
                debug!("Loading the average primary beam from {}", dir.display());
                let pb = disk::read_avg_pb(dir, record)?;
                self.avg_pb = Some((key.clone(), pb.clone()));
                return Ok(Some(pb));
            }
            debug!("The average primary beam on disk was made for another geometry");
        }
        Ok(None)
    }

    /// Keep `pb` as the average primary beam for `key`, replacing any other.
    pub fn store_avg_pb(&mut self, key: &CfKey, pb: &AveragePrimaryBeam) -> Result<(), CfError> {
        if let Some(dir) = &self.dir {
            self.index.avg_pb = Some(disk::write_avg_pb(dir, key, pb)?);
            self.index.save(dir)?;
        }
        self.avg_pb = Some((key.clone(), pb.clone()));
        Ok(())
    }

    /// Write the index to disk.
    pub fn flush(&self) -> Result<(), CfError> {
        match &self.dir {
            Some(dir) => self.index.save(dir),
            None => Ok(()),
        }
    }

    /// Memory held by cached convolution functions.
    pub fn size_bytes(&self) -> usize {
        self.memory
            .values()
            .flatten()
            .map(|e| e.size_bytes())
            .sum()
    }

    /// The number of entries held in memory.
    pub fn len(&self) -> usize {
        self.memory.values().map(|l| l.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything held in memory. Disk entries stay available.
    pub fn clear_memory(&mut self) {
        self.memory.clear();
        self.avg_pb = None;
    }
}

#[cfg(test)]
mod tests {
    use ndarray::prelude::*;

    use super::*;
    use crate::{c32, cf::CfCoordSys, gridding::CorrType};

    fn entry(pa_deg: f64) -> CfEntry {
        let pa = pa_deg.to_radians();
        CfEntry {
            kernel: Array4::from_elem((4, 4, 1, 1), c32::new(pa as f32, 0.0)),
            weight: Array4::from_elem((4, 4, 1, 1), c32::new(1.0, 0.0)),
            support: vec![1],
            sampling: 2,
            pa,
            w_scale: 0.0,
            coord_sys: CfCoordSys {
                ref_freq: 1e8,
                uv_cell: [1.0, 1.0],
                pol_planes: vec![CorrType::XX],
                pa,
            },
        }
    }

    /// The key `entry` makes.
    fn key() -> CfKey {
        CfKey {
            ref_freq: 1e8,
            uv_cell: [1.0, 1.0],
            pol_planes: vec![CorrType::XX],
            conv_size: 4,
            sampling: 2,
        }
    }

    #[test]
    fn test_memory_hit_within_tolerance() {
        let mut cache = CfCache::in_memory();
        cache.cache(entry(10.0)).unwrap();
        let (source, cf) = cache.locate(&key(), 1, 10.2_f64.to_radians(), 1_f64.to_radians()).unwrap();
        assert_eq!(source, CfSource::MemoryHit);
        approx::assert_abs_diff_eq!(cf.unwrap().pa, 10_f64.to_radians());

        // Another number of w-planes is a different key.
        let (source, cf) = cache.locate(&key(), 2, 10.0_f64.to_radians(), 1_f64.to_radians()).unwrap();
        assert_eq!(source, CfSource::NotCached { insert_at: 0 });
        assert!(cf.is_none());
    }

    #[test]
    fn test_ordering_and_insert_position() {
        let mut cache = CfCache::in_memory();
        for pa in [30.0, 10.0, 50.0] {
            cache.cache(entry(pa)).unwrap();
        }
        for (e, expected) in cache.memory[&1].iter().zip([10.0, 30.0, 50.0]) {
            approx::assert_abs_diff_eq!(e.pa.to_degrees(), expected, epsilon = 1e-9);
        }
        let (source, _) = cache.locate(&key(), 1, 40_f64.to_radians(), 1_f64.to_radians()).unwrap();
        assert_eq!(source, CfSource::NotCached { insert_at: 2 });
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.size_bytes(), 3 * 2 * 16 * 8);
    }

    #[test]
    fn test_angles_wrap() {
        let mut cache = CfCache::in_memory();
        cache.cache(entry(359.5)).unwrap();
        let (source, _) = cache.locate(&key(), 1, 0.3_f64.to_radians(), 1_f64.to_radians()).unwrap();
        assert_eq!(source, CfSource::MemoryHit);
        let (source, _) = cache.locate(&key(), 1, -0.2_f64.to_radians(), 1_f64.to_radians()).unwrap();
        assert_eq!(source, CfSource::MemoryHit);
    }

    #[test]
    fn test_nearest_is_chosen() {
        let mut cache = CfCache::in_memory();
        cache.cache(entry(10.0)).unwrap();
        cache.cache(entry(11.0)).unwrap();
        let (_, cf) = cache.locate(&key(), 1, 10.8_f64.to_radians(), 2_f64.to_radians()).unwrap();
        approx::assert_abs_diff_eq!(cf.unwrap().pa, 11_f64.to_radians());
    }

    #[test]
    fn test_not_cached_then_disk_hit() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = CfCache::new(Some(dir.path())).unwrap();
        let (source, _) = cache.locate(&key(), 1, 20_f64.to_radians(), 1_f64.to_radians()).unwrap();
        assert_eq!(source, CfSource::NotCached { insert_at: 0 });
        let stored = cache.cache(entry(20.0)).unwrap();
        assert!(dir.path().join("cfcache.json").exists());

        // A fresh cache over the same directory, as in a later run.
        let mut cache = CfCache::new(Some(dir.path())).unwrap();
        assert!(cache.is_empty());
        let (source, cf) = cache.locate(&key(), 1, 20.5_f64.to_radians(), 1_f64.to_radians()).unwrap();
        assert_eq!(source, CfSource::DiskHit);
        assert_eq!(*cf.unwrap(), *stored);
        // Now it's in memory.
        let (source, _) = cache.locate(&key(), 1, 20.5_f64.to_radians(), 1_f64.to_radians()).unwrap();
        assert_eq!(source, CfSource::MemoryHit);

        cache.clear_memory();
        let (source, _) = cache.locate(&key(), 1, 20.0_f64.to_radians(), 1_f64.to_radians()).unwrap();
        assert_eq!(source, CfSource::DiskHit);
    }

    #[test]
    fn test_rewriting_an_entry_replaces_it() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = CfCache::new(Some(dir.path())).unwrap();
        cache.cache(entry(20.0)).unwrap();
        let mut other = entry(20.0);
        other.support = vec![2];
        cache.cache(other).unwrap();
        cache.flush().unwrap();

        let mut cache = CfCache::new(Some(dir.path())).unwrap();
        assert_eq!(cache.index.entries.len(), 1);
        let (_, cf) = cache.locate(&key(), 1, 20.0_f64.to_radians(), 0.0).unwrap();
        assert_eq!(cf.unwrap().support, vec![2]);
    }

    #[test]
    fn test_avg_pb_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = CfCache::new(Some(dir.path())).unwrap();
        assert!(cache.load_avg_pb(&key()).unwrap().is_none());
        let mut pb = AveragePrimaryBeam::new(3, 2, 2);
        pb.accumulate(Array4::from_elem((3, 2, 2, 1), 4.0).view())
            .unwrap();
        pb.normalize();
        cache.store_avg_pb(&key(), &pb).unwrap();

        let mut cache = CfCache::new(Some(dir.path())).unwrap();
        let loaded = cache.load_avg_pb(&key()).unwrap().unwrap();
        assert_eq!(loaded, pb);
        assert!(loaded.is_normalized());
        assert_eq!(loaded.pa_steps(), 1);

        let mut memory_only = CfCache::new(None::<&Path>).unwrap();
        assert!(memory_only.dir().is_none());
        memory_only.store_avg_pb(&key(), &pb).unwrap();
        assert!(memory_only.load_avg_pb(&key()).unwrap().is_some());
        memory_only.clear_memory();
        assert!(memory_only.load_avg_pb(&key()).unwrap().is_none());
    }

    #[test]
    fn test_other_geometry_misses() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = CfCache::new(Some(dir.path())).unwrap();
        cache.cache(entry(20.0)).unwrap();
        let finer = CfKey {
            uv_cell: [4.0, 4.0],
            ..key()
        };
        let (source, cf) = cache.locate(&finer, 1, 20_f64.to_radians(), 1_f64.to_radians()).unwrap();
        assert_eq!(source, CfSource::NotCached { insert_at: 0 });
        assert!(cf.is_none());

        // Nor is the entry persisted on disk reused by a later run.
        let mut cache = CfCache::new(Some(dir.path())).unwrap();
        for other in [
            finer,
            CfKey {
                conv_size: 8,
                ..key()
            },
            CfKey {
                sampling: 4,
                ..key()
            },
            CfKey {
                pol_planes: vec![CorrType::XX, CorrType::YY],
                ..key()
            },
            CfKey {
                ref_freq: 2e8,
                ..key()
            },
        ] {
            let (source, cf) = cache.locate(&other, 1, 20_f64.to_radians(), 1_f64.to_radians()).unwrap();
            assert_eq!(source, CfSource::NotCached { insert_at: 0 });
            assert!(cf.is_none());
        }
        let (source, _) = cache.locate(&key(), 1, 20_f64.to_radians(), 1_f64.to_radians()).unwrap();
        assert_eq!(source, CfSource::DiskHit);

        // An entry for another key at the same angle goes in its own file.
        let mut other = entry(20.0);
        other.coord_sys.uv_cell = [4.0, 4.0];
        cache.cache(other).unwrap();
        assert_eq!(cache.index.entries.len(), 2);
        assert_ne!(cache.index.entries[0].file, cache.index.entries[1].file);
        let mut cache = CfCache::new(Some(dir.path())).unwrap();
        for k in [key(), CfKey { uv_cell: [4.0, 4.0], ..key() }] {
            let (source, cf) = cache.locate(&k, 1, 20_f64.to_radians(), 0.0).unwrap();
            assert_eq!(source, CfSource::DiskHit);
            assert_eq!(cf.unwrap().coord_sys.uv_cell, k.uv_cell);
        }
    }

    #[test]
    fn test_avg_pb_of_other_geometry_is_not_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = CfCache::new(Some(dir.path())).unwrap();
        let mut pb = AveragePrimaryBeam::new(3, 2, 1);
        pb.accumulate(Array4::from_elem((3, 2, 1, 1), 1.0).view())
            .unwrap();
        cache.store_avg_pb(&key(), &pb).unwrap();
        let coarser = CfKey {
            uv_cell: [0.5, 0.5],
            ..key()
        };
        assert!(cache.load_avg_pb(&coarser).unwrap().is_none());

        let mut cache = CfCache::new(Some(dir.path())).unwrap();
        assert!(cache.load_avg_pb(&coarser).unwrap().is_none());
        assert_eq!(cache.load_avg_pb(&key()).unwrap(), Some(pb));
    }
}
