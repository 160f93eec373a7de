// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The read side of visibility iteration.

use std::{
    cell::RefCell,
    rc::{Rc, Weak},
};

use hifitime::{Duration, Epoch};
use log::{debug, trace};
use ndarray::prelude::*;

use super::{
    buffer::VisBuffer,
    cache::{AngleCaches, AngleKey, SubChunkCache},
    chunk::{plan_chunks, Chunk},
    IterState, SubChunkPair, ViError, VisKind,
};
use crate::{
    c32,
    config::IterConfig,
    constants::VEL_C,
    context::ObsContext,
    pos::{sidereal, velocity::radial_velocity},
    selection::{ChannelSelection, ChannelSelector, SelectionError, VelocitySelection},
    table::{Column, ColumnValue, Slicer, VisTable},
    AzEl, HADec, LatLngHeight, RADec, VelocityFrame,
};

/// Fill an empty subchunk cache slot with `$compute`, then hand out a
/// reference to the slot.
macro_rules! cached {
    ($self:ident, $slot:ident, $compute:expr) => {{
        let value = match $self.cache.$slot.take() {
            Some(v) => v,
            None => $compute?,
        };
        Ok(&*$self.cache.$slot.insert(value))
    }};
}

/// Where and when the current subchunk was observed.
struct Pointing {
    epoch: Epoch,
    dut1: Duration,
    field: RADec,
}

impl Pointing {
    fn hadec(&self, pos: LatLngHeight) -> HADec {
        let lst = sidereal::get_lmst(pos.longitude_rad, self.epoch, self.dut1);
        self.field.to_hadec(lst)
    }
}

/// Iterates over the chunks and subchunks of one or more tables.
///
/// Nothing is planned until [`VisIterReadImpl::origin_chunks`] is called.
pub struct VisIterReadImpl<T: VisTable> {
    tables: Vec<T>,
    contexts: Vec<ObsContext>,
    selector: ChannelSelector,
    config: IterConfig,

    chunks: Vec<Chunk>,
    plan_built: bool,
    chunk_pos: usize,
    chunk_id: usize,
    subchunk_id: usize,
    chan_group: usize,
    n_groups: usize,
    row_start: usize,
    row_end: usize,
    rows: Vec<usize>,
    slicer: Slicer,
    more: bool,
    at_chunk_origin: bool,
    state: IterState,

    cache: SubChunkCache,
    angles: AngleCaches,
    tile_key: Option<(usize, usize)>,
    buffer: Option<Weak<RefCell<VisBuffer>>>,
}

impl<T: VisTable> VisIterReadImpl<T> {
    /// Iterate over `tables` in order. Each table needs its own
    /// [`ObsContext`].
    pub fn new(
        tables: Vec<T>,
        contexts: Vec<ObsContext>,
        config: IterConfig,
    ) -> Result<VisIterReadImpl<T>, ViError> {
        if tables.len() != contexts.len() {
            return Err(ViError::ContextCount {
                tables: tables.len(),
                contexts: contexts.len(),
            });
        }
        let selector = ChannelSelector::new(contexts.iter().map(|c| c.all_chan_freqs()).collect());
        debug!(
            "Visibility iterator over {} tables; row blocking {}, locking {:?}, tile cache budget {} bytes",
            tables.len(),
            config.row_blocking,
            config.locking,
            config.tile_cache_budget_bytes,
        );
        Ok(VisIterReadImpl {
            tables,
            contexts,
            selector,
            config,
            chunks: vec![],
            plan_built: false,
            chunk_pos: 0,
            chunk_id: 0,
            subchunk_id: 0,
            chan_group: 0,
            n_groups: 0,
            row_start: 0,
            row_end: 0,
            rows: vec![],
            slicer: Slicer::new(0, 0, 1),
            more: false,
            at_chunk_origin: false,
            state: IterState::Uninitialized,
            cache: SubChunkCache::default(),
            angles: AngleCaches::default(),
            tile_key: None,
            buffer: None,
        })
    }

    /// Select channel groups of a spectral window. Takes effect at the next
    /// [`VisIterReadImpl::origin_chunks`].
    pub fn select_channel(
        &mut self,
        ms: usize,
        spw: usize,
        n_groups: usize,
        start: usize,
        width: usize,
        increment: usize,
    ) -> Result<(), ViError> {
        self.selector
            .select_channel(ms, spw, n_groups, start, width, increment)?;
        Ok(())
    }

    pub fn select_channel_by_frequency(
        &mut self,
        ms: usize,
        spw: usize,
        f_min: f64,
        f_max: f64,
    ) -> Result<(), ViError> {
        self.selector
            .select_channel_by_frequency(ms, spw, f_min, f_max)?;
        Ok(())
    }

    pub fn select_velocity(&mut self, selection: VelocitySelection) -> Result<(), ViError> {
        self.selector.select_velocity(selection)?;
        Ok(())
    }

    pub fn channel_selection(&self, ms: usize, spw: usize) -> Option<ChannelSelection> {
        self.selector.channel_selection(ms, spw)
    }

    pub fn selector(&self) -> &ChannelSelector {
        &self.selector
    }

    pub fn config(&self) -> &IterConfig {
        &self.config
    }

    pub fn tables(&self) -> &[T] {
        &self.tables
    }

    pub fn contexts(&self) -> &[ObsContext] {
        &self.contexts
    }

    pub fn into_tables(self) -> Vec<T> {
        self.tables
    }

    /// Attach a buffer that is invalidated whenever the iterator moves. Only
    /// a weak reference is kept.
    pub fn attach_buffer(&mut self, buffer: &Rc<RefCell<VisBuffer>>) {
        self.buffer = Some(Rc::downgrade(buffer));
    }

    pub fn detach_buffer(&mut self) {
        self.buffer = None;
    }

    fn notify_buffer(&self) {
        if let Some(buffer) = self.buffer.as_ref().and_then(Weak::upgrade) {
            // A buffer borrowed right now is being filled by the caller.
            if let Ok(mut b) = buffer.try_borrow_mut() {
                b.invalidate();
            }
        }
    }

    /// Go back to the first chunk of the first table, applying pending
    /// selection changes. Without `force_rewind`, nothing happens if the
    /// iterator is already there.
    pub fn origin_chunks(&mut self, force_rewind: bool) -> Result<(), ViError> {
        let changed = self.selector.take_changed();
        if !force_rewind && !changed && self.plan_built && self.at_chunk_origin {
            return Ok(());
        }

        let mut chunks = vec![];
        for (ms, (table, context)) in self.tables.iter_mut().zip(&self.contexts).enumerate() {
            chunks.extend(plan_chunks(table, ms, context, &self.selector)?);
        }
        debug!("Planned {} chunks over {} tables", chunks.len(), self.tables.len());
        self.chunks = chunks;
        self.plan_built = true;
        self.chunk_pos = 0;
        self.chunk_id = 0;
        self.tile_key = None;
        self.state = IterState::OriginOfChunks;
        self.apply_tile_sizing();
        self.origin()?;
        self.at_chunk_origin = true;
        Ok(())
    }

    /// Go back to the first subchunk of the current chunk.
    pub fn origin(&mut self) -> Result<(), ViError> {
        self.cache.clear();
        self.subchunk_id = 0;
        self.chan_group = 0;
        self.row_start = 0;
        let (ms, spw, ddid) = match self.chunks.get(self.chunk_pos) {
            Some(c) => (c.ms, c.spw, c.ddid),
            None => {
                self.more = false;
                self.rows.clear();
                self.state = IterState::Exhausted;
                self.notify_buffer();
                return Ok(());
            }
        };
        let selection = self
            .selector
            .effective_selection(ms, spw)
            .ok_or(ViError::UnknownDataDescription { ms, ddid })?;
        self.n_groups = selection.n_groups;
        self.slicer = selection.slicer(0);
        self.more = true;
        self.set_sel_table();
        self.state = IterState::OriginOfSubchunk;
        self.notify_buffer();
        Ok(())
    }

    /// Work out the row window starting at `row_start`.
    fn set_sel_table(&mut self) {
        match self.chunks.get(self.chunk_pos) {
            Some(chunk) => {
                self.row_end = chunk.window_end(self.row_start, self.config.row_blocking);
                self.rows = chunk.rows[self.row_start..self.row_end].to_vec();
            }
            None => {
                self.row_end = self.row_start;
                self.rows.clear();
            }
        }
        trace!(
            "subchunk {} rows {}..{} channels {}",
            self.subchunk_id(),
            self.row_start,
            self.row_end,
            self.slicer
        );
    }

    /// Move to the next subchunk. After the last row window of the last
    /// channel group, [`VisIterReadImpl::more`] turns false.
    pub fn advance(&mut self) -> Result<(), ViError> {
        if !self.more {
            return Ok(());
        }
        self.at_chunk_origin = false;
        self.cache.clear();
        let n_rows = self
            .chunks
            .get(self.chunk_pos)
            .map(|c| c.rows.len())
            .unwrap_or(0);
        self.row_start = self.row_end;
        if self.row_start >= n_rows {
            self.chan_group += 1;
            if self.chan_group < self.n_groups {
                self.row_start = 0;
                let chunk = &self.chunks[self.chunk_pos];
                if let Some(s) = self.selector.slicer(chunk.ms, chunk.spw, self.chan_group) {
                    self.slicer = s;
                }
            } else {
                self.more = false;
            }
        }
        self.subchunk_id += 1;
        if self.more {
            self.set_sel_table();
            self.state = IterState::Advancing;
        } else {
            self.rows.clear();
            self.state = IterState::EndOfChunk;
        }
        self.notify_buffer();
        Ok(())
    }

    /// Move to the next chunk, crossing into the next table if needed.
    pub fn next_chunk(&mut self) -> Result<(), ViError> {
        if self.chunk_pos >= self.chunks.len() {
            return Ok(());
        }
        self.at_chunk_origin = false;
        self.chunk_pos += 1;
        self.chunk_id += 1;
        self.subchunk_id = 0;
        if self.chunk_pos >= self.chunks.len() {
            self.more = false;
            self.rows.clear();
            self.cache.clear();
            self.state = IterState::Exhausted;
            self.notify_buffer();
            return Ok(());
        }
        self.state = IterState::NextChunk;
        self.apply_tile_sizing();
        self.origin()
    }

    pub fn more(&self) -> bool {
        self.more
    }

    pub fn more_chunks(&self) -> bool {
        self.plan_built && self.chunk_pos < self.chunks.len()
    }

    pub fn state(&self) -> IterState {
        self.state
    }

    /// The current position, or [`SubChunkPair::NO_MORE_DATA`] once every
    /// table is exhausted.
    pub fn subchunk_id(&self) -> SubChunkPair {
        if self.more_chunks() {
            SubChunkPair::new(self.chunk_id, self.subchunk_id)
        } else {
            SubChunkPair::NO_MORE_DATA
        }
    }

    /// Shrink the tile caches of large tiled columns on entering a new
    /// (table, data description). Failures are only logged.
    fn apply_tile_sizing(&mut self) {
        let (ms, ddid) = match self.chunks.get(self.chunk_pos) {
            Some(c) => (c.ms, c.ddid),
            None => return,
        };
        if self.tile_key == Some((ms, ddid)) {
            return;
        }
        self.tile_key = Some((ms, ddid));
        let table = &mut self.tables[ms];
        if table.is_memory_resident() {
            trace!("{} is memory resident; leaving tile caches alone", table.name());
            return;
        }
        for column in Column::ALL.into_iter().filter(|c| c.is_large_array()) {
            if !table.has_column(column) || !table.uses_tiled_storage(column) {
                continue;
            }
            match table.set_tile_cache_size(column, 1) {
                Ok(()) => trace!("{}: {column} tile cache set to 1 tile", table.name()),
                Err(e) => debug!("{}: ignoring tile cache error on {column}: {e}", table.name()),
            }
        }
    }

    fn current_chunk(&self) -> Result<&Chunk, ViError> {
        if !self.more {
            return Err(ViError::NoCurrentSubchunk);
        }
        self.chunks
            .get(self.chunk_pos)
            .ok_or(ViError::NoCurrentSubchunk)
    }

    /// The index of the table holding the current chunk.
    pub fn ms_id(&self) -> Result<usize, ViError> {
        Ok(self.current_chunk()?.ms)
    }

    pub fn spectral_window(&self) -> Result<usize, ViError> {
        Ok(self.current_chunk()?.spw)
    }

    pub fn data_desc_id(&self) -> Result<usize, ViError> {
        Ok(self.current_chunk()?.ddid)
    }

    pub fn field_id(&self) -> Result<usize, ViError> {
        Ok(self.current_chunk()?.field)
    }

    /// The table rows of the current subchunk.
    pub fn row_ids(&self) -> &[usize] {
        &self.rows
    }

    pub fn n_row(&self) -> usize {
        self.rows.len()
    }

    pub fn channel_group(&self) -> usize {
        self.chan_group
    }

    pub fn channel_group_size(&self) -> usize {
        self.slicer.length
    }

    pub fn slicer(&self) -> Slicer {
        self.slicer
    }

    /// The number of correlations, from the polarisation setup or else from
    /// the shape of FLAG.
    pub fn n_pol(&mut self) -> Result<usize, ViError> {
        let chunk = self.current_chunk()?;
        if let Some(c) = self.contexts[chunk.ms].corr_types(chunk.ddid) {
            return Ok(c.len());
        }
        Ok(self.flag_cube()?.len_of(Axis(0)))
    }

    /// Casacore Stokes codes of the correlations.
    pub fn corr_type(&self) -> Result<Vec<i32>, ViError> {
        let chunk = self.current_chunk()?;
        self.contexts[chunk.ms]
            .corr_types(chunk.ddid)
            .map(|c| c.to_vec())
            .ok_or(ViError::UnknownDataDescription {
                ms: chunk.ms,
                ddid: chunk.ddid,
            })
    }

    pub(crate) fn invalidate_column(&mut self, column: Column) {
        self.cache.invalidate(column);
    }

    pub(crate) fn current_table_mut(&mut self) -> Result<&mut T, ViError> {
        let ms = self.current_chunk()?.ms;
        Ok(&mut self.tables[ms])
    }

    fn has_column(&self, column: Column) -> Result<bool, ViError> {
        let ms = self.current_chunk()?.ms;
        Ok(self.tables[ms].has_column(column))
    }

    /// Read `column` for the current rows and channels.
    fn read<V: ColumnValue, D: Dimension>(&mut self, column: Column) -> Result<Array<V, D>, ViError> {
        let ms = self.current_chunk()?.ms;
        let table = &mut self.tables[ms];
        if !table.has_column(column) {
            return Err(ViError::MissingColumn {
                ms,
                column: column.name(),
            });
        }
        let data = table.get_column::<V>(column, &self.rows, Some(&self.slicer))?;
        let received = format!("{:?}", data.shape());
        data.into_dimensionality::<D>()
            .map_err(|_| ViError::BadArrayShape {
                argument: column.name().into(),
                function: "VisIterReadImpl::read".into(),
                expected: format!("{} axes", column.cell_ndim() + 1),
                received,
            })
    }

    /// Read `column`, or `fallback` if the table doesn't have it.
    fn read_or<V: ColumnValue, D: Dimension>(
        &mut self,
        column: Column,
        fallback: Column,
    ) -> Result<Array<V, D>, ViError> {
        if self.has_column(column)? {
            self.read(column)
        } else {
            self.read(fallback)
        }
    }

    /// Read an id column, or zeros if it is absent.
    fn read_ids(&mut self, column: Column) -> Result<Array1<i32>, ViError> {
        if self.has_column(column)? {
            self.read(column)
        } else {
            Ok(Array1::zeros(self.rows.len()))
        }
    }

    pub fn antenna1(&mut self) -> Result<&Array1<i32>, ViError> {
        cached!(self, antenna1, self.read(Column::Antenna1))
    }

    pub fn antenna2(&mut self) -> Result<&Array1<i32>, ViError> {
        cached!(self, antenna2, self.read(Column::Antenna2))
    }

    pub fn feed1(&mut self) -> Result<&Array1<i32>, ViError> {
        cached!(self, feed1, self.read_ids(Column::Feed1))
    }

    pub fn feed2(&mut self) -> Result<&Array1<i32>, ViError> {
        cached!(self, feed2, self.read_ids(Column::Feed2))
    }

    pub fn scan(&mut self) -> Result<&Array1<i32>, ViError> {
        cached!(self, scan, self.read_ids(Column::ScanNumber))
    }

    pub fn state_id(&mut self) -> Result<&Array1<i32>, ViError> {
        cached!(self, state_id, self.read_ids(Column::StateId))
    }

    pub fn observation_id(&mut self) -> Result<&Array1<i32>, ViError> {
        cached!(self, observation_id, self.read_ids(Column::ObservationId))
    }

    pub fn processor_id(&mut self) -> Result<&Array1<i32>, ViError> {
        cached!(self, processor_id, self.read_ids(Column::ProcessorId))
    }

    /// Row timestamps \[MJD seconds, UTC\].
    pub fn time(&mut self) -> Result<&Array1<f64>, ViError> {
        cached!(self, time, self.read(Column::Time))
    }

    /// TIME_CENTROID, or TIME when there are no centroids.
    pub fn time_centroid(&mut self) -> Result<&Array1<f64>, ViError> {
        cached!(
            self,
            time_centroid,
            self.read_or(Column::TimeCentroid, Column::Time)
        )
    }

    /// EXPOSURE, or INTERVAL when there are no exposures.
    pub fn exposure(&mut self) -> Result<&Array1<f64>, ViError> {
        cached!(self, exposure, self.read_or(Column::Exposure, Column::Interval))
    }

    pub fn interval(&mut self) -> Result<&Array1<f64>, ViError> {
        cached!(self, interval, self.read(Column::Interval))
    }

    /// `(3, nrow)` baseline coordinates \[metres\].
    pub fn uvw(&mut self) -> Result<&Array2<f64>, ViError> {
        cached!(self, uvw, self.read(Column::Uvw))
    }

    /// `(npol, nchan, nrow)` flags.
    pub fn flag_cube(&mut self) -> Result<&Array3<bool>, ViError> {
        cached!(self, flag_cube, self.read(Column::Flag))
    }

    /// `(nchan, nrow)` flags. A sample is flagged if any correlation is.
    pub fn flag(&mut self) -> Result<&Array2<bool>, ViError> {
        cached!(
            self,
            flag,
            self.flag_cube()
                .map(|cube| cube.fold_axis(Axis(0), false, |&acc, &f| acc || f))
        )
    }

    /// Whole-row flags. All false when the table has no FLAG_ROW.
    pub fn flag_row(&mut self) -> Result<&Array1<bool>, ViError> {
        cached!(self, flag_row, {
            if self.has_column(Column::FlagRow)? {
                self.read(Column::FlagRow)
            } else {
                Ok(Array1::from_elem(self.rows.len(), false))
            }
        })
    }

    /// `(ncat, npol, nchan, nrow)` flag categories.
    pub fn flag_category(&mut self) -> Result<&Array4<bool>, ViError> {
        cached!(self, flag_category, self.read(Column::FlagCategory))
    }

    /// `(npol, nchan, nrow)` visibilities. FLOAT_DATA comes back with zero
    /// imaginary parts.
    pub fn visibility(&mut self, kind: VisKind) -> Result<&Array3<c32>, ViError> {
        let i = kind.index();
        let value = match self.cache.vis[i].take() {
            Some(v) => v,
            None => match kind {
                VisKind::Float => self
                    .read::<f32, Ix3>(Column::FloatData)?
                    .mapv(|re| c32::new(re, 0.0)),
                _ => self.read::<c32, Ix3>(kind.column())?,
            },
        };
        Ok(&*self.cache.vis[i].insert(value))
    }

    /// Per-row weights: the mean over correlations.
    pub fn weight(&mut self) -> Result<&Array1<f32>, ViError> {
        cached!(self, weight, {
            let n_row = self.rows.len();
            self.weight_mat()
                .map(|w| w.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(n_row)))
        })
    }

    /// `(npol, nrow)` weights.
    pub fn weight_mat(&mut self) -> Result<&Array2<f32>, ViError> {
        cached!(self, weight_mat, self.read(Column::Weight))
    }

    /// `(npol, nchan, nrow)` weights. Without WEIGHT_SPECTRUM, the weight
    /// matrix is spread over the channels.
    pub fn weight_spectrum(&mut self) -> Result<&Array3<f32>, ViError> {
        cached!(self, weight_spectrum, {
            if self.has_column(Column::WeightSpectrum)? {
                self.read(Column::WeightSpectrum)
            } else {
                let n_chan = self.channel_group_size();
                self.weight_mat().map(|w| {
                    let (n_pol, n_row) = w.dim();
                    Array3::from_shape_fn((n_pol, n_chan, n_row), |(p, _, r)| w[[p, r]])
                })
            }
        })
    }

    pub fn sigma(&mut self) -> Result<&Array1<f32>, ViError> {
        cached!(self, sigma, {
            let n_row = self.rows.len();
            self.sigma_mat()
                .map(|s| s.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(n_row)))
        })
    }

    /// `(npol, nrow)` sigmas.
    pub fn sigma_mat(&mut self) -> Result<&Array2<f32>, ViError> {
        cached!(self, sigma_mat, self.read(Column::Sigma))
    }

    /// Channel frequencies of the subchunk \[Hz\]. With a velocity selection,
    /// these are the topocentric frequencies of the velocity grid at the
    /// subchunk's time.
    pub fn frequency(&mut self) -> Result<&Array1<f64>, ViError> {
        cached!(self, frequency, self.compute_frequency())
    }

    /// Frequencies in the velocity selection's frame, or the channel
    /// frequencies shifted to LSRK when there is no velocity selection \[Hz\].
    pub fn lsr_frequency(&mut self) -> Result<&Array1<f64>, ViError> {
        cached!(self, lsr_frequency, self.compute_lsr_frequency())
    }

    /// The velocity selection, if its channels label those of the current
    /// channel group one to one.
    fn checked_velocity_selection(&self) -> Result<Option<VelocitySelection>, ViError> {
        match self.selector.velocity_selection() {
            Some(vel) if vel.n_chan != self.channel_group_size() => {
                Err(SelectionError::VelocityChannelMismatch {
                    n_chan: vel.n_chan,
                    group_size: self.channel_group_size(),
                }
                .into())
            }
            vel => Ok(vel.copied()),
        }
    }

    fn compute_frequency(&mut self) -> Result<Array1<f64>, ViError> {
        if let Some(vel) = self.checked_velocity_selection()? {
            let v_obs = self.observatory_radial_velocity(vel.frame)?;
            return Ok(Array1::from(vel.topo_frequencies(v_obs)));
        }
        let chunk = self.current_chunk()?;
        let freqs = self.contexts[chunk.ms]
            .chan_freqs(chunk.spw)
            .ok_or(ViError::UnknownDataDescription {
                ms: chunk.ms,
                ddid: chunk.ddid,
            })?;
        Ok(self
            .slicer
            .indices()
            .filter_map(|i| freqs.get(i).copied())
            .collect())
    }

    fn compute_lsr_frequency(&mut self) -> Result<Array1<f64>, ViError> {
        if let Some(vel) = self.checked_velocity_selection()? {
            return Ok(Array1::from(vel.frame_frequencies()));
        }
        let beta = self.observatory_radial_velocity(VelocityFrame::Lsrk)? / VEL_C;
        let factor = ((1.0 - beta) / (1.0 + beta)).sqrt();
        Ok(self.frequency()?.mapv(|f| f * factor))
    }

    /// The observatory's velocity toward the current field \[metres/second\].
    fn observatory_radial_velocity(&mut self, frame: VelocityFrame) -> Result<f64, ViError> {
        let p = self.pointing()?;
        let array_pos = self.contexts[self.current_chunk()?.ms].array_pos;
        Ok(radial_velocity(frame, p.epoch, array_pos, p.dut1, p.field)?)
    }

    /// The subchunk's first timestamp and the phase centre of its field.
    fn pointing(&mut self) -> Result<Pointing, ViError> {
        let t = *self.time()?.first().ok_or(ViError::NoCurrentSubchunk)?;
        let chunk = self.current_chunk()?;
        let ctx = &self.contexts[chunk.ms];
        let field = ctx.phase_centre(chunk.field).ok_or(ViError::UnknownField {
            ms: chunk.ms,
            field: chunk.field,
        })?;
        Ok(Pointing {
            epoch: sidereal::casacore_time_to_epoch(t),
            dut1: ctx.dut1,
            field,
        })
    }

    fn angle_key(&mut self) -> Result<AngleKey, ViError> {
        let t = *self.time()?.first().ok_or(ViError::NoCurrentSubchunk)?;
        let chunk = self.current_chunk()?;
        Ok(AngleKey::new(t, chunk.ms, chunk.field))
    }

    /// How many antennas to report angles for: those in the context, or else
    /// enough to cover every antenna id in the subchunk.
    fn num_ants(&mut self) -> Result<usize, ViError> {
        let n = self.contexts[self.current_chunk()?.ms].num_ants();
        if n > 0 {
            return Ok(n);
        }
        let a1 = self.antenna1()?.fold(0, |m, &a| m.max(a));
        let a2 = self.antenna2()?.fold(0, |m, &a| m.max(a));
        Ok(a1.max(a2).max(0) as usize + 1)
    }

    /// The parallactic angle of the field at the array centre \[radians\].
    pub fn parallactic_angle(&mut self) -> Result<f64, ViError> {
        let key = self.angle_key()?;
        let p = self.pointing()?;
        let ctx = &self.contexts[self.current_chunk()?.ms];
        self.angles
            .parallactic_angle
            .get_or_try_insert(key, || {
                Ok(p.hadec(ctx.array_pos)
                    .get_parallactic_angle(ctx.array_pos.latitude_rad))
            })
            .copied()
    }

    /// Each antenna's feed position angle: its receptor angle plus the
    /// parallactic angle at its position \[radians\].
    pub fn feed_pa(&mut self) -> Result<&Array1<f64>, ViError> {
        let key = self.angle_key()?;
        let n_ants = self.num_ants()?;
        let p = self.pointing()?;
        let ctx = &self.contexts[self.current_chunk()?.ms];
        self.angles.feed_pa.get_or_try_insert(key, || {
            Ok(Array1::from_shape_fn(n_ants, |ant| {
                let pos = ctx.ant_position(ant);
                ctx.receptor_angle(ant) + p.hadec(pos).get_parallactic_angle(pos.latitude_rad)
            }))
        })
    }

    /// The azimuth and elevation of the field from each antenna.
    pub fn azel(&mut self) -> Result<&Vec<AzEl>, ViError> {
        let key = self.angle_key()?;
        let n_ants = self.num_ants()?;
        let p = self.pointing()?;
        let ctx = &self.contexts[self.current_chunk()?.ms];
        self.angles.azel.get_or_try_insert(key, || {
            Ok((0..n_ants)
                .map(|ant| {
                    let pos = ctx.ant_position(ant);
                    p.hadec(pos).to_azel(pos.latitude_rad)
                })
                .collect())
        })
    }

    /// The azimuth and elevation of the field from the array centre.
    pub fn azel0(&mut self) -> Result<AzEl, ViError> {
        let key = self.angle_key()?;
        let p = self.pointing()?;
        let ctx = &self.contexts[self.current_chunk()?.ms];
        self.angles
            .azel0
            .get_or_try_insert(key, || {
                Ok(p.hadec(ctx.array_pos).to_azel(ctx.array_pos.latitude_rad))
            })
            .copied()
    }

    /// The hour angle of the field at the array centre \[radians\].
    pub fn hour_angle(&mut self) -> Result<f64, ViError> {
        let key = self.angle_key()?;
        let p = self.pointing()?;
        let ctx = &self.contexts[self.current_chunk()?.ms];
        self.angles
            .hour_angle
            .get_or_try_insert(key, || Ok(p.hadec(ctx.array_pos).ha))
            .copied()
    }

    /// How often each angle has been computed, as
    /// `[pa, feed_pa, azel, azel0, hour_angle]`.
    pub fn angle_recomputes(&self) -> [usize; 5] {
        [
            self.angles.parallactic_angle.recomputes(),
            self.angles.feed_pa.recomputes(),
            self.angles.azel.recomputes(),
            self.angles.azel0.recomputes(),
            self.angles.hour_angle.recomputes(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::{
        vi::test_util::{context, table, table_with_times},
        DopplerConvention, MemoryTable,
    };

    fn iter_one(t: MemoryTable, nchan: usize) -> VisIterReadImpl<MemoryTable> {
        VisIterReadImpl::new(vec![t], vec![context(nchan)], IterConfig::default()).unwrap()
    }

    /// Walk everything, returning the position, rows and first channel of
    /// every subchunk.
    fn walk(vi: &mut VisIterReadImpl<MemoryTable>) -> Vec<(SubChunkPair, Vec<usize>, usize)> {
        let mut seen = vec![];
        vi.origin_chunks(true).unwrap();
        while vi.more_chunks() {
            vi.origin().unwrap();
            while vi.more() {
                seen.push((vi.subchunk_id(), vi.row_ids().to_vec(), vi.slicer().start));
                vi.advance().unwrap();
            }
            vi.next_chunk().unwrap();
        }
        seen
    }

    #[test]
    fn test_new_needs_one_context_per_table() {
        let result = VisIterReadImpl::new(vec![table(2, 4)], vec![], IterConfig::default());
        assert!(matches!(
            result,
            Err(ViError::ContextCount {
                tables: 1,
                contexts: 0
            })
        ));
    }

    #[test]
    fn test_64_groups_of_one_channel() {
        // One timestamp and 64 single-channel groups.
        let mut vi = iter_one(table_with_times(&[5.0, 5.0, 5.0], 64), 64);
        vi.select_channel(0, 0, 64, 0, 1, 1).unwrap();
        let seen = walk(&mut vi);
        assert_eq!(seen.len(), 64);
        for (i, (id, rows, start)) in seen.iter().enumerate() {
            assert_eq!(*id, SubChunkPair::new(0, i));
            assert_eq!(rows, &[0, 1, 2]);
            assert_eq!(*start, i);
        }
        assert!(vi.subchunk_id().is_no_more_data());
        assert_eq!(vi.state(), IterState::Exhausted);
    }

    #[test]
    fn test_every_row_is_visited_once_per_group() {
        let times = [2.0, 1.0, 1.0, 3.0, 2.0, 1.0];
        let mut vi = iter_one(table_with_times(&times, 8), 8);
        vi.select_channel(0, 0, 2, 0, 4, 1).unwrap();
        let seen = walk(&mut vi);
        for group_start in [0, 4] {
            let mut rows: Vec<usize> = seen
                .iter()
                .filter(|(_, _, s)| *s == group_start)
                .flat_map(|(_, r, _)| r.clone())
                .collect();
            rows.sort_unstable();
            assert_eq!(rows, vec![0, 1, 2, 3, 4, 5]);
        }
        // Three timestamps in each of two groups.
        assert_eq!(seen.len(), 6);
        assert_eq!(seen[0].1, vec![1, 2, 5]);
    }

    #[test]
    fn test_subchunk_ids_increase() {
        let mut vi = iter_one(table_with_times(&[1.0, 2.0, 3.0, 4.0], 4), 4);
        let seen = walk(&mut vi);
        assert_eq!(seen.len(), 4);
        for pair in seen.windows(2) {
            assert!(pair[0].0 < pair[1].0);
        }
        assert_eq!(vi.subchunk_id(), SubChunkPair::NO_MORE_DATA);
    }

    #[test]
    fn test_row_blocking() {
        let config = IterConfig {
            row_blocking: 2,
            ..Default::default()
        };
        let mut vi =
            VisIterReadImpl::new(vec![table_with_times(&[1.0; 5], 4)], vec![context(4)], config)
                .unwrap();
        let seen = walk(&mut vi);
        let sizes: Vec<usize> = seen.iter().map(|(_, r, _)| r.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn test_two_tables_in_order() {
        let mut vi = VisIterReadImpl::new(
            vec![table_with_times(&[1.0], 4), table_with_times(&[1.0, 2.0], 4)],
            vec![context(4), context(4)],
            IterConfig::default(),
        )
        .unwrap();
        vi.origin_chunks(true).unwrap();
        assert_eq!(vi.ms_id().unwrap(), 0);
        vi.next_chunk().unwrap();
        assert_eq!(vi.ms_id().unwrap(), 1);
        assert_eq!(vi.subchunk_id(), SubChunkPair::new(1, 0));
        assert_eq!(vi.state(), IterState::OriginOfSubchunk);
        vi.next_chunk().unwrap();
        assert!(!vi.more_chunks());
    }

    #[test]
    fn test_origin_chunks_without_force_is_noop_at_origin() {
        let mut vi = iter_one(table_with_times(&[1.0, 2.0], 4), 4);
        vi.origin_chunks(false).unwrap();
        vi.origin_chunks(false).unwrap();
        assert_eq!(vi.row_ids(), &[0]);
        assert_eq!(vi.state(), IterState::OriginOfSubchunk);

        // A new selection is applied even without force_rewind.
        vi.select_channel(0, 0, 2, 0, 2, 1).unwrap();
        vi.origin_chunks(false).unwrap();
        assert_eq!(vi.channel_group_size(), 2);
        assert_eq!(
            vi.channel_selection(0, 0),
            Some(ChannelSelection::new(2, 0, 2, 1))
        );
    }

    #[test]
    fn test_accessors_read_current_subchunk() {
        let mut vi = iter_one(table(3, 4), 4);
        vi.origin_chunks(true).unwrap();
        assert_eq!(vi.n_row(), 3);
        assert_eq!(vi.antenna1().unwrap(), &arr1(&[0, 0, 1]));
        assert_eq!(vi.antenna2().unwrap(), &arr1(&[1, 2, 2]));
        assert_eq!(vi.visibility(VisKind::Observed).unwrap().dim(), (4, 4, 3));
        assert_eq!(vi.uvw().unwrap().dim(), (3, 3));
        assert_eq!(vi.n_pol().unwrap(), 4);
        assert_eq!(vi.corr_type().unwrap(), vec![5, 6, 7, 8]);
        // No TIME_CENTROID, so TIME.
        assert_eq!(vi.time_centroid().unwrap(), &arr1(&[1.0, 1.0, 1.0]));
        // No STATE_ID, so zeros.
        assert_eq!(vi.state_id().unwrap(), &arr1(&[0, 0, 0]));
        assert_eq!(vi.spectral_window().unwrap(), 0);
        assert_eq!(vi.field_id().unwrap(), 0);
        assert_abs_diff_eq!(vi.frequency().unwrap()[1], 101e6);
    }

    #[test]
    fn test_flag_is_or_over_pols() {
        let mut t = table(1, 2);
        let mut flags = Array3::from_elem((4, 2, 1), false);
        flags[[2, 1, 0]] = true;
        t.insert_column(Column::Flag, flags.into_dyn()).unwrap();
        let mut vi = iter_one(t, 2);
        vi.origin_chunks(true).unwrap();
        assert_eq!(vi.flag().unwrap(), &arr2(&[[false], [true]]));
    }

    #[test]
    fn test_weight_is_pol_mean_and_spectrum_broadcasts() {
        let mut t = table(2, 3);
        t.insert_column(
            Column::Weight,
            arr2(&[[1.0f32, 4.0], [3.0, 4.0], [1.0, 4.0], [3.0, 4.0]]).into_dyn(),
        )
        .unwrap();
        let mut vi = iter_one(t, 3);
        vi.origin_chunks(true).unwrap();
        assert_abs_diff_eq!(vi.weight().unwrap(), &arr1(&[2.0f32, 4.0]));
        let ws = vi.weight_spectrum().unwrap();
        assert_eq!(ws.dim(), (4, 3, 2));
        assert_abs_diff_eq!(ws[[1, 2, 0]], 3.0);
    }

    #[test]
    fn test_float_data_is_promoted() {
        let mut t = table(1, 2);
        t.insert_column(Column::FloatData, Array3::from_elem((4, 2, 1), 2.5f32).into_dyn())
            .unwrap();
        let mut vi = iter_one(t, 2);
        vi.origin_chunks(true).unwrap();
        let v = vi.visibility(VisKind::Float).unwrap();
        assert_eq!(v[[0, 0, 0]], c32::new(2.5, 0.0));
    }

    #[test]
    fn test_tile_heuristic() {
        let t = table(2, 4)
            .with_tiled_column(Column::Data, Array3::<c32>::zeros((4, 4, 2)).into_dyn())
            .unwrap()
            .not_memory_resident();
        let mut vi = iter_one(t, 4);
        vi.origin_chunks(true).unwrap();
        assert_eq!(vi.tables()[0].tile_cache_size(Column::Data), Some(1));
        // FLAG isn't tiled in this table.
        assert_eq!(vi.tables()[0].tile_cache_size(Column::Flag), None);
    }

    #[test]
    fn test_tile_heuristic_skips_memory_tables_and_swallows_errors() {
        let t = table(2, 4)
            .with_tiled_column(Column::Data, Array3::<c32>::zeros((4, 4, 2)).into_dyn())
            .unwrap();
        let mut vi = iter_one(t, 4);
        vi.origin_chunks(true).unwrap();
        assert_eq!(vi.tables()[0].tile_cache_size(Column::Data), None);

        let t = table(2, 4)
            .with_tiled_column(Column::Data, Array3::<c32>::zeros((4, 4, 2)).into_dyn())
            .unwrap()
            .not_memory_resident()
            .failing_tile_tuning();
        let mut vi = iter_one(t, 4);
        assert!(vi.origin_chunks(true).is_ok());
        assert!(vi.more());
    }

    #[test]
    fn test_angle_caches_follow_time() {
        let t0 = 4.9e9;
        let mut vi = iter_one(table_with_times(&[t0, t0, t0 + 600.0], 2), 2);
        vi.origin_chunks(true).unwrap();
        let pa = vi.parallactic_angle().unwrap();
        assert_abs_diff_eq!(vi.parallactic_angle().unwrap(), pa);
        let ha = vi.hour_angle().unwrap();
        assert_eq!(vi.angle_recomputes(), [1, 0, 0, 0, 1]);

        // Column caches are dropped on advance; the angles are recomputed
        // only because the time changed.
        vi.advance().unwrap();
        let pa2 = vi.parallactic_angle().unwrap();
        let ha2 = vi.hour_angle().unwrap();
        assert_eq!(vi.angle_recomputes(), [2, 0, 0, 0, 2]);
        assert!((pa2 - pa).abs() > 1e-6);
        assert_abs_diff_eq!(
            (ha2 - ha).rem_euclid(std::f64::consts::TAU),
            600.0 * crate::constants::EARTH_ROTATION_RATE,
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_feed_pa_adds_receptor_angle() {
        let mut ctx = context(2);
        ctx.receptor_angles = vec![0.0, 0.5, 0.0];
        let mut vi = VisIterReadImpl::new(
            vec![table_with_times(&[4.9e9, 4.9e9], 2)],
            vec![ctx],
            IterConfig::default(),
        )
        .unwrap();
        vi.origin_chunks(true).unwrap();
        let pa = vi.parallactic_angle().unwrap();
        let feed_pa = vi.feed_pa().unwrap().clone();
        assert_eq!(feed_pa.len(), 3);
        assert_abs_diff_eq!(feed_pa[0], pa, epsilon = 1e-12);
        assert_abs_diff_eq!(feed_pa[1], pa + 0.5, epsilon = 1e-12);
        let azel = vi.azel().unwrap().clone();
        let azel0 = vi.azel0().unwrap();
        assert_abs_diff_eq!(azel[2], azel0, epsilon = 1e-12);
    }

    #[test]
    fn test_antenna_count_from_ids_without_context_antennas() {
        let mut vi = iter_one(table(3, 2), 2);
        vi.origin_chunks(true).unwrap();
        // Antenna ids go up to 2.
        assert_eq!(vi.feed_pa().unwrap().len(), 3);
    }

    #[test]
    fn test_frequencies_with_velocity_selection() {
        let mut vi = iter_one(table_with_times(&[4.9e9], 4), 4);
        vi.select_velocity(VelocitySelection {
            n_chan: 4,
            v_start: 0.0,
            v_inc: 1000.0,
            frame: VelocityFrame::Lsrk,
            doppler: DopplerConvention::Radio,
            rest_freq_hz: 1.420405752e9,
        })
        .unwrap();
        vi.origin_chunks(false).unwrap();
        let lsr = vi.lsr_frequency().unwrap().clone();
        assert_eq!(lsr.len(), 4);
        assert_abs_diff_eq!(lsr[0], 1.420405752e9, epsilon = 1e-3);
        let topo = vi.frequency().unwrap();
        assert_eq!(topo.len(), 4);
        assert!((topo[0] - lsr[0]).abs() > 1.0);
    }

    #[test]
    fn test_velocity_selection_must_fit_the_channel_group() {
        let mut vi = iter_one(table_with_times(&[4.9e9], 4), 4);
        vi.select_velocity(VelocitySelection {
            n_chan: 8,
            v_start: 0.0,
            v_inc: 1000.0,
            frame: VelocityFrame::Lsrk,
            doppler: DopplerConvention::Radio,
            rest_freq_hz: 1.420405752e9,
        })
        .unwrap();
        vi.origin_chunks(false).unwrap();
        for result in [vi.frequency().map(|f| f.len()), vi.lsr_frequency().map(|f| f.len())] {
            assert!(matches!(
                result,
                Err(ViError::Selection(SelectionError::VelocityChannelMismatch {
                    n_chan: 8,
                    group_size: 4
                }))
            ));
        }
    }

    #[test]
    fn test_attached_buffer_is_invalidated() {
        let buffer = Rc::new(RefCell::new(VisBuffer::default()));
        let mut vi = iter_one(table(2, 2), 2);
        vi.attach_buffer(&buffer);
        vi.origin_chunks(true).unwrap();
        buffer
            .borrow_mut()
            .fill_from(&mut vi, &[VisKind::Observed])
            .unwrap();
        assert!(buffer.borrow().is_valid());
        vi.origin().unwrap();
        assert!(!buffer.borrow().is_valid());

        buffer.borrow_mut().fill_from(&mut vi, &[]).unwrap();
        vi.detach_buffer();
        vi.origin().unwrap();
        assert!(buffer.borrow().is_valid());
    }

    #[test]
    fn test_accessors_fail_without_subchunk() {
        let mut vi = iter_one(table_with_times(&[1.0], 2), 2);
        assert!(matches!(vi.time(), Err(ViError::NoCurrentSubchunk)));
        vi.origin_chunks(true).unwrap();
        vi.advance().unwrap();
        assert!(!vi.more());
        assert!(matches!(vi.antenna1(), Err(ViError::NoCurrentSubchunk)));
    }
}
