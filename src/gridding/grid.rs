// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The uv grid, held in memory or, when too large, in square tiles in a
//! temporary file.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, trace};
use ndarray::prelude::*;

use crate::c32;

/// `(nx, ny, npol, nchan)`
pub type GridDim = (usize, usize, usize, usize);

const BYTES_PER_PIXEL: u64 = std::mem::size_of::<c32>() as u64;

pub enum Grid {
    Memory(Array4<c32>),
    Tiled(TiledGrid),
}

impl Grid {
    /// A zeroed grid, in memory if it fits in `budget_bytes`.
    pub fn new(dim: GridDim, budget_bytes: u64, tile_size: usize) -> std::io::Result<Grid> {
        if fits(dim, budget_bytes) {
            Ok(Grid::Memory(Array4::zeros(dim)))
        } else {
            Ok(Grid::Tiled(TiledGrid::new(dim, tile_size, budget_bytes)?))
        }
    }

    /// A grid holding `array`.
    pub fn from_array(array: Array4<c32>, budget_bytes: u64, tile_size: usize) -> std::io::Result<Grid> {
        if fits(array.dim(), budget_bytes) {
            return Ok(Grid::Memory(array));
        }
        let mut tiled = TiledGrid::new(array.dim(), tile_size, budget_bytes)?;
        let (_, _, npol, nchan) = array.dim();
        for pol in 0..npol {
            for chan in 0..nchan {
                tiled.write_plane(pol, chan, array.slice(s![.., .., pol, chan]))?;
            }
        }
        Ok(Grid::Tiled(tiled))
    }

    pub fn dim(&self) -> GridDim {
        match self {
            Grid::Memory(a) => a.dim(),
            Grid::Tiled(t) => t.dim,
        }
    }

    pub fn is_tiled(&self) -> bool {
        matches!(self, Grid::Tiled(_))
    }

    pub fn add(&mut self, idx: (usize, usize, usize, usize), value: c32) -> std::io::Result<()> {
        match self {
            Grid::Memory(a) => {
                a[idx] += value;
                Ok(())
            }
            Grid::Tiled(t) => t.update(idx, |v| *v += value),
        }
    }

    pub fn get(&mut self, idx: (usize, usize, usize, usize)) -> std::io::Result<c32> {
        match self {
            Grid::Memory(a) => Ok(a[idx]),
            Grid::Tiled(t) => {
                let mut out = c32::default();
                t.update(idx, |v| out = *v)?;
                Ok(out)
            }
        }
    }

    pub fn read_plane(&mut self, pol: usize, chan: usize) -> std::io::Result<Array2<c32>> {
        match self {
            Grid::Memory(a) => Ok(a.slice(s![.., .., pol, chan]).to_owned()),
            Grid::Tiled(t) => t.read_plane(pol, chan),
        }
    }

    pub fn write_plane(&mut self, pol: usize, chan: usize, plane: ArrayView2<c32>) -> std::io::Result<()> {
        match self {
            Grid::Memory(a) => {
                a.slice_mut(s![.., .., pol, chan]).assign(&plane);
                Ok(())
            }
            Grid::Tiled(t) => t.write_plane(pol, chan, plane),
        }
    }

    /// The whole grid in memory.
    pub fn to_array(&mut self) -> std::io::Result<Array4<c32>> {
        match self {
            Grid::Memory(a) => Ok(a.clone()),
            Grid::Tiled(t) => {
                let mut out = Array4::zeros(t.dim);
                for pol in 0..t.dim.2 {
                    for chan in 0..t.dim.3 {
                        out.slice_mut(s![.., .., pol, chan])
                            .assign(&t.read_plane(pol, chan)?);
                    }
                }
                Ok(out)
            }
        }
    }

    /// Write any cached tiles to disk.
    pub fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Grid::Memory(_) => Ok(()),
            Grid::Tiled(t) => t.flush(),
        }
    }
}

fn fits(dim: GridDim, budget_bytes: u64) -> bool {
    let (nx, ny, npol, nchan) = dim;
    let bytes = (nx * ny * npol * nchan) as u64 * BYTES_PER_PIXEL;
    if bytes > budget_bytes {
        debug!(
            "A {:?} grid needs {bytes} bytes, more than the {budget_bytes} allowed; using a tiled grid on disk",
            dim
        );
    }
    bytes <= budget_bytes
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct TileKey {
    tx: usize,
    ty: usize,
    pol: usize,
    chan: usize,
}

struct Tile {
    data: Array2<c32>,
    dirty: bool,
}

/// A grid stored as `tile × tile` pixel tiles in a temporary file, with a
/// bounded number of tiles held in memory.
pub struct TiledGrid {
    dim: GridDim,
    tile: usize,
    tiles_x: usize,
    tiles_y: usize,
    file: File,
    resident: HashMap<TileKey, Tile>,
    max_resident: usize,
}

impl TiledGrid {
    fn new(dim: GridDim, tile: usize, budget_bytes: u64) -> std::io::Result<TiledGrid> {
        let tile = tile.max(1);
        let (nx, ny, npol, nchan) = dim;
        let tiles_x = (nx + tile - 1) / tile;
        let tiles_y = (ny + tile - 1) / tile;
        let tile_bytes = (tile * tile) as u64 * BYTES_PER_PIXEL;
        let file = tempfile::tempfile()?;
        // Unwritten regions read back as zeros.
        file.set_len(tile_bytes * (tiles_x * tiles_y * npol * nchan) as u64)?;
        let max_resident = (budget_bytes / tile_bytes).max(1) as usize;
        debug!("Tiled grid: {tiles_x}x{tiles_y} tiles of {tile} pixels, {max_resident} held in memory");
        Ok(TiledGrid {
            dim,
            tile,
            tiles_x,
            tiles_y,
            file,
            resident: HashMap::new(),
            max_resident,
        })
    }

    fn offset(&self, key: TileKey) -> u64 {
        let index = ((key.chan * self.dim.2 + key.pol) * self.tiles_y + key.ty) * self.tiles_x + key.tx;
        index as u64 * (self.tile * self.tile) as u64 * BYTES_PER_PIXEL
    }

    fn read_tile(&mut self, key: TileKey) -> std::io::Result<Array2<c32>> {
        self.file.seek(SeekFrom::Start(self.offset(key)))?;
        let mut floats = vec![0.0f32; 2 * self.tile * self.tile];
        self.file.read_f32_into::<LittleEndian>(&mut floats)?;
        let values: Vec<c32> = floats
            .chunks_exact(2)
            .map(|p| c32::new(p[0], p[1]))
            .collect();
        Ok(Array2::from_shape_vec((self.tile, self.tile), values)
            .unwrap_or_else(|_| Array2::zeros((self.tile, self.tile))))
    }

    fn write_tile(&mut self, key: TileKey, data: &Array2<c32>) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(self.offset(key)))?;
        let mut bytes = Vec::with_capacity(data.len() * BYTES_PER_PIXEL as usize);
        for v in data.iter() {
            bytes.write_f32::<LittleEndian>(v.re)?;
            bytes.write_f32::<LittleEndian>(v.im)?;
        }
        self.file.write_all(&bytes)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let dirty: Vec<TileKey> = self
            .resident
            .iter()
            .filter(|(_, t)| t.dirty)
            .map(|(k, _)| *k)
            .collect();
        trace!("Writing {} dirty tiles", dirty.len());
        for key in dirty {
            if let Some(tile) = self.resident.remove(&key) {
                self.write_tile(key, &tile.data)?;
                self.resident.insert(
                    key,
                    Tile {
                        data: tile.data,
                        dirty: false,
                    },
                );
            }
        }
        self.file.flush()
    }

    fn tile_mut(&mut self, key: TileKey) -> std::io::Result<&mut Tile> {
        if !self.resident.contains_key(&key) {
            if self.resident.len() >= self.max_resident {
                self.flush()?;
                self.resident.clear();
            }
            let data = self.read_tile(key)?;
            self.resident.insert(key, Tile { data, dirty: false });
        }
        self.resident
            .get_mut(&key)
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "tile vanished"))
    }

    fn update<F: FnOnce(&mut c32)>(
        &mut self,
        (x, y, pol, chan): (usize, usize, usize, usize),
        f: F,
    ) -> std::io::Result<()> {
        let key = TileKey {
            tx: x / self.tile,
            ty: y / self.tile,
            pol,
            chan,
        };
        let (ix, iy) = (x % self.tile, y % self.tile);
        let tile = self.tile_mut(key)?;
        let before = tile.data[(ix, iy)];
        f(&mut tile.data[(ix, iy)]);
        tile.dirty |= tile.data[(ix, iy)] != before;
        Ok(())
    }

    fn read_plane(&mut self, pol: usize, chan: usize) -> std::io::Result<Array2<c32>> {
        let (nx, ny, _, _) = self.dim;
        let mut out = Array2::zeros((nx, ny));
        for tx in 0..self.tiles_x {
            for ty in 0..self.tiles_y {
                let key = TileKey { tx, ty, pol, chan };
                let (x0, y0) = (tx * self.tile, ty * self.tile);
                let (x1, y1) = ((x0 + self.tile).min(nx), (y0 + self.tile).min(ny));
                let tile = self.tile_mut(key)?;
                out.slice_mut(s![x0..x1, y0..y1])
                    .assign(&tile.data.slice(s![..x1 - x0, ..y1 - y0]));
            }
        }
        Ok(out)
    }

    fn write_plane(&mut self, pol: usize, chan: usize, plane: ArrayView2<c32>) -> std::io::Result<()> {
        let (nx, ny, _, _) = self.dim;
        for tx in 0..self.tiles_x {
            for ty in 0..self.tiles_y {
                let key = TileKey { tx, ty, pol, chan };
                let (x0, y0) = (tx * self.tile, ty * self.tile);
                let (x1, y1) = ((x0 + self.tile).min(nx), (y0 + self.tile).min(ny));
                let tile = self.tile_mut(key)?;
                tile.data
                    .slice_mut(s![..x1 - x0, ..y1 - y0])
                    .assign(&plane.slice(s![x0..x1, y0..y1]));
                tile.dirty = true;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn test_budget_decides_storage() {
        let dim = (8, 8, 2, 1);
        assert!(!Grid::new(dim, 8 * 8 * 2 * 8, 4).unwrap().is_tiled());
        assert!(Grid::new(dim, 8 * 8 * 2 * 8 - 1, 4).unwrap().is_tiled());
    }

    #[test]
    fn test_tiled_matches_memory() {
        let dim = (10, 7, 2, 3);
        let mut mem = Grid::new(dim, u64::MAX, 4).unwrap();
        // Room for two tiles only, to force evictions.
        let mut tiled = Grid::new(dim, 2 * 4 * 4 * 8, 4).unwrap();
        assert!(tiled.is_tiled());
        for (i, idx) in [(0, 0, 0, 0), (9, 6, 1, 2), (4, 3, 0, 1), (9, 6, 1, 2), (5, 0, 1, 0)]
            .into_iter()
            .enumerate()
        {
            let v = c32::new(i as f32 + 1.0, -(i as f32));
            mem.add(idx, v).unwrap();
            tiled.add(idx, v).unwrap();
        }
        assert_abs_diff_eq!(tiled.get((9, 6, 1, 2)).unwrap(), c32::new(6.0, -4.0));
        tiled.flush().unwrap();
        assert_abs_diff_eq!(tiled.to_array().unwrap(), mem.to_array().unwrap());
    }

    #[test]
    fn test_planes() {
        let array = Array4::from_shape_fn((5, 6, 1, 2), |(x, y, _, c)| {
            c32::new(x as f32, (y + 10 * c) as f32)
        });
        let mut tiled = Grid::from_array(array.clone(), 0, 4).unwrap();
        assert!(tiled.is_tiled());
        assert_abs_diff_eq!(tiled.read_plane(0, 1).unwrap(), array.slice(s![.., .., 0, 1]));
        assert_abs_diff_eq!(tiled.to_array().unwrap(), array);
    }
}
