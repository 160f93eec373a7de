// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The on-disk layout of a convolution function cache.
//!
//! A cache directory holds `cfcache.json`, an index of its entries, and one
//! little-endian binary file per entry. Every file is written to a temporary
//! file in the same directory and renamed into place, so readers never see a
//! partial file; with several writers the last rename wins.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

use super::{AveragePrimaryBeam, CfCoordSys, CfEntry, CfError, CfKey};
use crate::c32;

pub(super) const INDEX_FILE: &str = "cfcache.json";
const CF_MAGIC: &[u8; 4] = b"VGCF";
const PB_MAGIC: &[u8; 4] = b"VGPB";
const FORMAT_VERSION: u32 = 1;

/// The index description of one cached convolution function.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(super) struct IndexEntry {
    pub(super) file: String,
    pub(super) w_planes: usize,
    pub(super) pa: f64,
    pub(super) sampling: usize,
    /// 0 in indexes written before it was recorded, which matches nothing.
    #[serde(default)]
    pub(super) conv_size: usize,
    pub(super) w_scale: f64,
    pub(super) support: Vec<usize>,
    pub(super) coord_sys: CfCoordSys,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(super) struct AvgPbRecord {
    pub(super) file: String,
    pub(super) pa_steps: usize,
    pub(super) normalized: bool,
    /// What the beam was accumulated for.
    #[serde(default)]
    pub(super) key: Option<CfKey>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub(super) struct CfIndex {
    /// The package and version that last saved the index.
    #[serde(default)]
    pub(super) written_by: String,
    pub(super) entries: Vec<IndexEntry>,
    pub(super) avg_pb: Option<AvgPbRecord>,
}

impl CfIndex {
    /// An empty index if the directory has none yet.
    pub(super) fn load(dir: &Path) -> Result<CfIndex, CfError> {
        let path = dir.join(INDEX_FILE);
        if !path.exists() {
            return Ok(CfIndex::default());
        }
        let reader = BufReader::new(File::open(&path)?);
        serde_json::from_reader(reader).map_err(|err| CfError::Index { file: path, err })
    }

    pub(super) fn save(&self, dir: &Path) -> Result<(), CfError> {
        let path = dir.join(INDEX_FILE);
        let stamped = CfIndex {
            written_by: format!(
                "{} {}",
                crate::built_info::PKG_NAME,
                crate::built_info::PKG_VERSION
            ),
            ..self.clone()
        };
        let json = serde_json::to_vec_pretty(&stamped)
            .map_err(|err| CfError::Index { file: path.clone(), err })?;
        write_atomically(&path, |w| w.write_all(&json))
    }

    /// The file to store `entry` in: the file of an indexed entry it would
    /// replace, or one no entry made for another key uses.
    pub(super) fn file_name_for(&self, entry: &CfEntry) -> String {
        let key = CfKey::of(entry);
        let base = entry_file_name(entry.n_w_planes(), entry.pa);
        let mut suffix = 0;
        loop {
            let file = match suffix {
                0 => format!("{base}.bin"),
                n => format!("{base}_{n}.bin"),
            };
            let taken = self.entries.iter().any(|e| {
                e.file == file && !key.matches(&e.coord_sys, e.conv_size, e.sampling)
            });
            if !taken {
                return file;
            }
            suffix += 1;
        }
    }

    /// Replace the entry stored in the same file, or add it.
    pub(super) fn upsert(&mut self, entry: IndexEntry) {
        match self.entries.iter_mut().find(|e| e.file == entry.file) {
            Some(e) => *e = entry,
            None => self.entries.push(entry),
        }
    }
}

/// The stem of file names of entries for `w_planes` planes at `pa` radians.
fn entry_file_name(w_planes: usize, pa: f64) -> String {
    format!("CF_W{}_PA{:.4}", w_planes, pa.to_degrees())
}

pub(super) const AVG_PB_FILE: &str = "AVGPB.bin";

fn write_atomically<F>(path: &Path, write: F) -> Result<(), CfError>
where
    F: FnOnce(&mut BufWriter<&mut File>) -> std::io::Result<()>,
{
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    {
        let mut w = BufWriter::new(tmp.as_file_mut());
        write(&mut w)?;
        w.flush()?;
    }
    tmp.persist(path).map_err(|e| CfError::IO(e.error))?;
    Ok(())
}

fn write_c32s<W: Write>(w: &mut W, values: &Array4<c32>) -> std::io::Result<()> {
    for v in values.iter() {
        w.write_f32::<LittleEndian>(v.re)?;
        w.write_f32::<LittleEndian>(v.im)?;
    }
    Ok(())
}

/// The number of `f32`s in arrays of shape `dims` with `per_element` floats
/// per element, if `remaining` bytes can hold that many.
fn checked_len(
    dims: (usize, usize, usize, usize),
    per_element: usize,
    remaining: u64,
    file: &Path,
) -> Result<usize, CfError> {
    let (a, b, c, d) = dims;
    let len = [b, c, d, per_element]
        .into_iter()
        .try_fold(a, |acc, n| acc.checked_mul(n));
    match len {
        Some(len) if (len as u64).saturating_mul(4) <= remaining => Ok(len),
        _ => Err(CfError::CorruptFile {
            file: file.to_path_buf(),
            reason: format!(
                "dimensions {:?} don't fit in the {remaining} bytes left in the file",
                [a, b, c, d]
            ),
        }),
    }
}

/// Bytes after the header of a file of `file_len` bytes.
fn after_header(file_len: u64) -> u64 {
    // magic, version, 4 dimensions
    file_len.saturating_sub(4 + 4 + 16)
}

fn read_c32s<R: Read>(
    r: &mut R,
    shape: (usize, usize, usize, usize),
    remaining: u64,
    file: &Path,
) -> Result<Array4<c32>, CfError> {
    let len = checked_len(shape, 2, remaining, file)?;
    let mut floats = vec![0.0f32; len];
    r.read_f32_into::<LittleEndian>(&mut floats)?;
    let values = floats
        .chunks_exact(2)
        .map(|pair| c32::new(pair[0], pair[1]))
        .collect();
    Array4::from_shape_vec(shape, values).map_err(|e| CfError::CorruptFile {
        file: file.to_path_buf(),
        reason: e.to_string(),
    })
}

fn check_magic<R: Read>(r: &mut R, magic: &[u8; 4], file: &Path) -> Result<(), CfError> {
    let mut got = [0u8; 4];
    r.read_exact(&mut got)?;
    if &got != magic {
        return Err(CfError::CorruptFile {
            file: file.to_path_buf(),
            reason: format!("expected magic {:?}, found {:?}", magic, got),
        });
    }
    let version = r.read_u32::<LittleEndian>()?;
    if version != FORMAT_VERSION {
        return Err(CfError::CorruptFile {
            file: file.to_path_buf(),
            reason: format!("unsupported format version {version}"),
        });
    }
    Ok(())
}

fn read_dims<R: Read>(r: &mut R) -> std::io::Result<(usize, usize, usize, usize)> {
    Ok((
        r.read_u32::<LittleEndian>()? as usize,
        r.read_u32::<LittleEndian>()? as usize,
        r.read_u32::<LittleEndian>()? as usize,
        r.read_u32::<LittleEndian>()? as usize,
    ))
}

fn write_dims<W: Write>(w: &mut W, dims: (usize, usize, usize, usize)) -> std::io::Result<()> {
    for d in [dims.0, dims.1, dims.2, dims.3] {
        w.write_u32::<LittleEndian>(d as u32)?;
    }
    Ok(())
}

/// Write the kernel and weight of `entry` into `file` in `dir`, returning
/// its index description.
pub(super) fn write_entry(dir: &Path, entry: &CfEntry, file: String) -> Result<IndexEntry, CfError> {
    write_atomically(&dir.join(&file), |w| {
        w.write_all(CF_MAGIC)?;
        w.write_u32::<LittleEndian>(FORMAT_VERSION)?;
        write_dims(w, entry.kernel.dim())?;
        write_c32s(w, &entry.kernel)?;
        write_c32s(w, &entry.weight)
    })?;
    Ok(IndexEntry {
        file,
        w_planes: entry.n_w_planes(),
        pa: entry.pa,
        sampling: entry.sampling,
        conv_size: entry.conv_size(),
        w_scale: entry.w_scale,
        support: entry.support.clone(),
        coord_sys: entry.coord_sys.clone(),
    })
}

pub(super) fn read_entry(dir: &Path, meta: &IndexEntry) -> Result<CfEntry, CfError> {
    let path: PathBuf = dir.join(&meta.file);
    let f = File::open(&path)?;
    let remaining = after_header(f.metadata()?.len());
    let mut r = BufReader::new(f);
    check_magic(&mut r, CF_MAGIC, &path)?;
    let dims = read_dims(&mut r)?;
    if dims.2 != meta.w_planes {
        return Err(CfError::CorruptFile {
            file: path,
            reason: format!(
                "the index says {} w-planes, the file has {}",
                meta.w_planes, dims.2
            ),
        });
    }
    // The kernel and the weight, each taking half.
    let kernel = read_c32s(&mut r, dims, remaining / 2, &path)?;
    let weight = read_c32s(&mut r, dims, remaining / 2, &path)?;
    Ok(CfEntry {
        kernel,
        weight,
        support: meta.support.clone(),
        sampling: meta.sampling,
        pa: meta.pa,
        w_scale: meta.w_scale,
        coord_sys: meta.coord_sys.clone(),
    })
}

pub(super) fn write_avg_pb(
    dir: &Path,
    key: &CfKey,
    pb: &AveragePrimaryBeam,
) -> Result<AvgPbRecord, CfError> {
    write_atomically(&dir.join(AVG_PB_FILE), |w| {
        w.write_all(PB_MAGIC)?;
        w.write_u32::<LittleEndian>(FORMAT_VERSION)?;
        write_dims(w, pb.dim())?;
        for v in pb.data().iter() {
            w.write_f32::<LittleEndian>(*v)?;
        }
        Ok(())
    })?;
    Ok(AvgPbRecord {
        file: AVG_PB_FILE.to_string(),
        pa_steps: pb.pa_steps(),
        normalized: pb.is_normalized(),
        key: Some(key.clone()),
    })
}

pub(super) fn read_avg_pb(dir: &Path, record: &AvgPbRecord) -> Result<AveragePrimaryBeam, CfError> {
    let path = dir.join(&record.file);
    let f = File::open(&path)?;
    let remaining = after_header(f.metadata()?.len());
    let mut r = BufReader::new(f);
    check_magic(&mut r, PB_MAGIC, &path)?;
    let dims = read_dims(&mut r)?;
    let mut values = vec![0.0f32; checked_len(dims, 1, remaining, &path)?];
    r.read_f32_into::<LittleEndian>(&mut values)?;
    let data = Array4::from_shape_vec(dims, values).map_err(|e| CfError::CorruptFile {
        file: path.clone(),
        reason: e.to_string(),
    })?;
    Ok(AveragePrimaryBeam::from_parts(
        data,
        record.pa_steps,
        record.normalized,
    ))
}
