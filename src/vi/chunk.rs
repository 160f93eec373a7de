// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Splitting tables into chunks.

use itertools::Itertools;
use ndarray::prelude::*;

use super::ViError;
use crate::{
    context::ObsContext,
    selection::ChannelSelector,
    table::{Column, ColumnValue, VisTable},
};

/// A run of rows of one table with a constant data description, field and
/// scan, sorted by time.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Chunk {
    pub(crate) ms: usize,
    pub(crate) ddid: usize,
    pub(crate) spw: usize,
    pub(crate) field: usize,
    pub(crate) scan: i32,
    pub(crate) rows: Vec<usize>,
    pub(crate) times: Vec<f64>,
}

impl Chunk {
    /// The end (exclusive) of the row window starting at `start`. Rows with
    /// identical times form one window unless `row_blocking` is positive.
    pub(crate) fn window_end(&self, start: usize, row_blocking: usize) -> usize {
        let n = self.rows.len();
        if start >= n {
            return n;
        }
        if row_blocking > 0 {
            return (start + row_blocking).min(n);
        }
        let t = self.times[start];
        start
            + self.times[start..]
                .iter()
                .take_while(|&&x| x == t)
                .count()
    }
}

fn read_all<T: VisTable, V: ColumnValue>(
    table: &mut T,
    column: Column,
    rows: &[usize],
) -> Result<Option<Array1<V>>, ViError> {
    if !table.has_column(column) {
        return Ok(None);
    }
    let a = table.get_column::<V>(column, rows, None)?;
    let a = a
        .into_dimensionality::<Ix1>()
        .map_err(|_| ViError::BadArrayShape {
            argument: column.name().into(),
            function: "plan_chunks".into(),
            expected: "[nrow]".into(),
            received: "more than one axis".into(),
        })?;
    Ok(Some(a))
}

/// Split table `ms` into chunks. Rows are stable-sorted by (DATA_DESC_ID,
/// FIELD_ID, SCAN_NUMBER, TIME); missing key columns read as 0. Chunks in
/// spectral windows that the selector excludes are dropped.
pub(crate) fn plan_chunks<T: VisTable>(
    table: &mut T,
    ms: usize,
    context: &ObsContext,
    selector: &ChannelSelector,
) -> Result<Vec<Chunk>, ViError> {
    let n = table.num_rows();
    let all: Vec<usize> = (0..n).collect();
    let zeros = || Array1::<i32>::zeros(n);
    let ddid = read_all::<T, i32>(table, Column::DataDescId, &all)?.unwrap_or_else(zeros);
    let field = read_all::<T, i32>(table, Column::FieldId, &all)?.unwrap_or_else(zeros);
    let scan = read_all::<T, i32>(table, Column::ScanNumber, &all)?.unwrap_or_else(zeros);
    let time = read_all::<T, f64>(table, Column::Time, &all)?.ok_or(ViError::MissingColumn {
        ms,
        column: Column::Time.name(),
    })?;

    let mut order = all;
    order.sort_by(|&a, &b| {
        (ddid[a], field[a], scan[a])
            .cmp(&(ddid[b], field[b], scan[b]))
            .then(time[a].total_cmp(&time[b]))
    });

    let mut chunks = vec![];
    for ((dd, fi, sc), group) in &order
        .into_iter()
        .group_by(|&r| (ddid[r], field[r], scan[r]))
    {
        let dd = dd.max(0) as usize;
        let spw = context.spw_of_ddid(dd).unwrap_or(dd);
        let rows: Vec<usize> = group.collect();
        if !selector.is_spw_selected(ms, spw) {
            continue;
        }
        let times = rows.iter().map(|&r| time[r]).collect();
        chunks.push(Chunk {
            ms,
            ddid: dd,
            spw,
            field: fi.max(0) as usize,
            scan: sc,
            rows,
            times,
        });
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::MemoryTable;

    #[test]
    fn test_plan_sorts_and_groups() {
        let mut t = MemoryTable::new("t", 6)
            .with_column(
                Column::Time,
                arr1(&[3.0, 1.0, 2.0, 1.0, 1.0, 2.0]).into_dyn(),
            )
            .unwrap()
            .with_column(Column::ScanNumber, arr1(&[1, 1, 1, 2, 2, 2]).into_dyn())
            .unwrap();
        let ctx = ObsContext::single_spw(
            Default::default(),
            Default::default(),
            vec![1e8],
            vec![9],
        );
        let selector = ChannelSelector::new(vec![ctx.all_chan_freqs()]);
        let chunks = plan_chunks(&mut t, 0, &ctx, &selector).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].rows, vec![1, 2, 0]);
        assert_eq!(chunks[0].times, vec![1.0, 2.0, 3.0]);
        assert_eq!(chunks[1].scan, 2);
        assert_eq!(chunks[1].rows, vec![3, 4, 5]);
        assert_eq!(chunks[1].window_end(0, 0), 2);
        assert_eq!(chunks[1].window_end(0, 1), 1);
        assert_eq!(chunks[1].window_end(2, 0), 3);
    }

    #[test]
    fn test_plan_requires_time() {
        let mut t = MemoryTable::new("t", 1);
        let ctx = ObsContext::default();
        let selector = ChannelSelector::default();
        assert!(matches!(
            plan_chunks(&mut t, 0, &ctx, &selector),
            Err(ViError::MissingColumn { column: "TIME", .. })
        ));
    }
}
