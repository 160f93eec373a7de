// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Observation metadata that the visibility iterator needs alongside a main
//! table: where the array is, what the fields, spectral windows and
//! polarisations are, and how each antenna's feeds are oriented.

use hifitime::Duration;
use thiserror::Error;

use crate::{table::TableError, LatLngHeight, RADec};

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("the measurement set has no antennas")]
    NoAntennas,

    #[error("cell {row} of {table}/{column} has too few values")]
    ShortCell {
        table: &'static str,
        column: &'static str,
        row: u64,
    },

    #[error(transparent)]
    Table(#[from] TableError),
}

/// One row of a SPECTRAL_WINDOW table.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SpectralWindow {
    /// Centre frequency of each channel \[Hz\]
    pub chan_freqs: Vec<f64>,
    /// A rest frequency for velocity conversions, if one is known \[Hz\]
    pub rest_freq_hz: Option<f64>,
}

/// One row of a DATA_DESCRIPTION table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DataDescription {
    pub spw: usize,
    pub pol: usize,
}

/// A container for the metadata of one measurement set.
#[derive(Clone, Debug, Default)]
pub struct ObsContext {
    /// The Earth position of the array centre.
    pub array_pos: LatLngHeight,

    /// UT1 - UTC.
    pub dut1: Duration,

    /// The phase centre of each field, indexed by FIELD_ID.
    pub phase_centres: Vec<RADec>,

    pub spectral_windows: Vec<SpectralWindow>,

    /// Casacore Stokes codes of each polarisation setup.
    pub polarizations: Vec<Vec<i32>>,

    /// Indexed by DATA_DESC_ID.
    pub data_descriptions: Vec<DataDescription>,

    /// Each antenna's position. Empty means everything is at `array_pos`.
    pub ant_positions: Vec<LatLngHeight>,

    /// The first receptor angle of each antenna's feed \[radians\]
    pub receptor_angles: Vec<f64>,

    pub ant_names: Vec<String>,
}

impl ObsContext {
    /// A context with one field, one spectral window and one polarisation
    /// setup, shared by a single data description.
    pub fn single_spw(
        array_pos: LatLngHeight,
        phase_centre: RADec,
        chan_freqs: Vec<f64>,
        corr_types: Vec<i32>,
    ) -> ObsContext {
        ObsContext {
            array_pos,
            dut1: Duration::from_seconds(0.0),
            phase_centres: vec![phase_centre],
            spectral_windows: vec![SpectralWindow {
                chan_freqs,
                rest_freq_hz: None,
            }],
            polarizations: vec![corr_types],
            data_descriptions: vec![DataDescription { spw: 0, pol: 0 }],
            ..Default::default()
        }
    }

    pub fn spw_of_ddid(&self, ddid: usize) -> Option<usize> {
        self.data_descriptions.get(ddid).map(|dd| dd.spw)
    }

    /// The correlation types of data description `ddid`.
    pub fn corr_types(&self, ddid: usize) -> Option<&[i32]> {
        self.data_descriptions
            .get(ddid)
            .and_then(|dd| self.polarizations.get(dd.pol))
            .map(|p| p.as_slice())
    }

    pub fn chan_freqs(&self, spw: usize) -> Option<&[f64]> {
        self.spectral_windows
            .get(spw)
            .map(|s| s.chan_freqs.as_slice())
    }

    /// Channel frequencies of every spectral window.
    pub fn all_chan_freqs(&self) -> Vec<Vec<f64>> {
        self.spectral_windows
            .iter()
            .map(|s| s.chan_freqs.clone())
            .collect()
    }

    pub fn phase_centre(&self, field: usize) -> Option<RADec> {
        self.phase_centres.get(field).copied()
    }

    /// The position of antenna `ant`, falling back to the array centre.
    pub fn ant_position(&self, ant: usize) -> LatLngHeight {
        self.ant_positions
            .get(ant)
            .copied()
            .unwrap_or(self.array_pos)
    }

    pub fn receptor_angle(&self, ant: usize) -> f64 {
        self.receptor_angles.get(ant).copied().unwrap_or(0.0)
    }

    pub fn num_ants(&self) -> usize {
        self.ant_positions
            .len()
            .max(self.receptor_angles.len())
            .max(self.ant_names.len())
    }

    /// Read the subtables of the measurement set at `path`.
    #[cfg(feature = "ms")]
    pub fn from_ms<P: AsRef<std::path::Path>>(path: P) -> Result<ObsContext, ContextError> {
        use log::debug;
        use rubbl_casatables::{Table, TableOpenMode};

        let path = path.as_ref();
        let open = |sub: &str| -> Result<Table, TableError> {
            Ok(Table::open(path.join(sub), TableOpenMode::Read)?)
        };

        let mut ant_table = open("ANTENNA")?;
        let n_ants = ant_table.n_rows() as usize;
        if n_ants == 0 {
            return Err(ContextError::NoAntennas);
        }
        let mut ant_positions = Vec::with_capacity(n_ants);
        let mut ant_names = Vec::with_capacity(n_ants);
        let mut centre = [0.0; 3];
        for row in 0..n_ants as u64 {
            let pos: Vec<f64> = ant_table.get_cell_as_vec("POSITION", row).map_err(TableError::from)?;
            let xyz = match pos.as_slice() {
                [x, y, z, ..] => [*x, *y, *z],
                _ => {
                    return Err(ContextError::ShortCell {
                        table: "ANTENNA",
                        column: "POSITION",
                        row,
                    })
                }
            };
            for (c, v) in centre.iter_mut().zip(xyz) {
                *c += v / n_ants as f64;
            }
            ant_positions.push(LatLngHeight::from_geocentric_wgs84(xyz));
            ant_names.push(ant_table.get_cell::<String>("NAME", row).map_err(TableError::from)?);
        }
        let array_pos = LatLngHeight::from_geocentric_wgs84(centre);

        let mut field_table = open("FIELD")?;
        let mut phase_centres = vec![];
        for row in 0..field_table.n_rows() {
            let dir: Vec<f64> = field_table
                .get_cell_as_vec("PHASE_DIR", row)
                .map_err(TableError::from)?;
            match dir.as_slice() {
                [ra, dec, ..] => phase_centres.push(RADec::from_radians(*ra, *dec)),
                _ => {
                    return Err(ContextError::ShortCell {
                        table: "FIELD",
                        column: "PHASE_DIR",
                        row,
                    })
                }
            }
        }

        // A SOURCE table is optional; only its first rest frequency is used.
        let rest_freq_hz = open("SOURCE").ok().and_then(|mut t| {
            t.get_cell_as_vec::<f64>("REST_FREQUENCY", 0)
                .ok()
                .and_then(|v| v.first().copied())
        });

        let mut spw_table = open("SPECTRAL_WINDOW")?;
        let mut spectral_windows = vec![];
        for row in 0..spw_table.n_rows() {
            let chan_freqs = spw_table
                .get_cell_as_vec("CHAN_FREQ", row)
                .map_err(TableError::from)?;
            spectral_windows.push(SpectralWindow {
                chan_freqs,
                rest_freq_hz,
            });
        }

        let mut pol_table = open("POLARIZATION")?;
        let mut polarizations = vec![];
        for row in 0..pol_table.n_rows() {
            polarizations.push(
                pol_table
                    .get_cell_as_vec::<i32>("CORR_TYPE", row)
                    .map_err(TableError::from)?,
            );
        }

        let mut dd_table = open("DATA_DESCRIPTION")?;
        let mut data_descriptions = vec![];
        for row in 0..dd_table.n_rows() {
            let spw: i32 = dd_table
                .get_cell("SPECTRAL_WINDOW_ID", row)
                .map_err(TableError::from)?;
            let pol: i32 = dd_table
                .get_cell("POLARIZATION_ID", row)
                .map_err(TableError::from)?;
            data_descriptions.push(DataDescription {
                spw: spw.max(0) as usize,
                pol: pol.max(0) as usize,
            });
        }

        let mut receptor_angles = vec![0.0; n_ants];
        if let Ok(mut feed_table) = open("FEED") {
            for row in 0..feed_table.n_rows() {
                let ant: i32 = feed_table
                    .get_cell("ANTENNA_ID", row)
                    .map_err(TableError::from)?;
                let angles: Vec<f64> = feed_table
                    .get_cell_as_vec("RECEPTOR_ANGLE", row)
                    .map_err(TableError::from)?;
                if let (Some(slot), Some(&a)) =
                    (receptor_angles.get_mut(ant.max(0) as usize), angles.first())
                {
                    *slot = a;
                }
            }
        }

        debug!(
            "{}: {n_ants} antennas, {} fields, {} spectral windows",
            path.display(),
            phase_centres.len(),
            spectral_windows.len()
        );

        Ok(ObsContext {
            array_pos,
            dut1: Duration::from_seconds(0.0),
            phase_centres,
            spectral_windows,
            polarizations,
            data_descriptions,
            ant_positions,
            receptor_angles,
            ant_names,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ObsContext {
        let mut ctx = ObsContext::single_spw(
            LatLngHeight::from_degrees(-107.6, 34.1, 2124.0),
            RADec::from_degrees(10.0, 20.0),
            vec![1e9, 1.1e9],
            vec![5, 6, 7, 8],
        );
        ctx.receptor_angles = vec![0.1, 0.2];
        ctx
    }

    #[test]
    fn test_lookups() {
        let ctx = context();
        assert_eq!(ctx.spw_of_ddid(0), Some(0));
        assert_eq!(ctx.spw_of_ddid(1), None);
        assert_eq!(ctx.corr_types(0), Some([5, 6, 7, 8].as_slice()));
        assert_eq!(ctx.chan_freqs(0).map(|f| f.len()), Some(2));
        assert_eq!(ctx.num_ants(), 2);
        assert_eq!(ctx.receptor_angle(1), 0.2);
        assert_eq!(ctx.receptor_angle(5), 0.0);
        assert_eq!(ctx.ant_position(3), ctx.array_pos);
    }

    #[cfg(feature = "ms")]
    #[test]
    fn test_from_ms_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ObsContext::from_ms(dir.path().join("missing.ms")).is_err());
    }
}
