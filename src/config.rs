// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Gridder and iterator settings. Both can be read from toml or json files.

use std::path::{Path, PathBuf};

use log::debug;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::constants::{
    CONVSIZE, DEFAULT_CACHE_SIZE_BYTES, DEFAULT_PA_TOLERANCE_DEG, DEFAULT_PB_LIMIT,
    DEFAULT_TILE_SIZE, OVERSAMPLING,
};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("conv_size must be positive and even, got {0}")]
    BadConvSize(usize),

    #[error("conv_size {conv_size} is not divisible by oversampling {oversampling}")]
    ConvSizeNotDivisible {
        conv_size: usize,
        oversampling: usize,
    },

    #[error("{name} must be positive")]
    Zero { name: &'static str },

    #[error("pb_limit must not be negative, got {0}")]
    NegativePbLimit(f32),

    #[error("config file '{}' doesn't have a recognised extension; valid extensions are toml and json", .0.display())]
    UnknownFileType(PathBuf),

    #[error("couldn't decode toml structure from {file}: {err}")]
    Toml { file: String, err: toml::de::Error },

    #[error("couldn't decode json structure from {file}: {err}")]
    Json {
        file: String,
        err: serde_json::Error,
    },

    #[error(transparent)]
    IO(#[from] std::io::Error),
}

/// How table locks are taken. Only recorded and reported.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockingMode {
    #[default]
    Auto,
    NoReadLocking,
    UserLocking,
}

/// Settings of a [`crate::VisIterReadImpl`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IterConfig {
    /// Rows per subchunk. 0 groups rows by timestamp instead.
    pub row_blocking: usize,

    pub locking: LockingMode,

    /// The memory budget for table tile caches \[bytes\].
    pub tile_cache_budget_bytes: u64,
}

impl Default for IterConfig {
    fn default() -> Self {
        IterConfig {
            row_blocking: 0,
            locking: LockingMode::Auto,
            tile_cache_budget_bytes: DEFAULT_CACHE_SIZE_BYTES,
        }
    }
}

/// Settings of an [`crate::AWProjectFT`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridderConfig {
    /// The side of the oversampled convolution function support grid
    /// \[pixels\].
    pub conv_size: usize,

    pub oversampling: usize,

    /// How far the parallactic angle may drift before a new convolution
    /// function is needed \[degrees\]. Negative disables aperture rotation.
    pub pa_tolerance_deg: f64,

    /// Primary beam values below this aren't divided out.
    pub pb_limit: f32,

    /// Grids bigger than this live on disk \[bytes\].
    pub cache_size_bytes: u64,

    /// The side of a tile of a disk-backed grid \[pixels\].
    pub tile_size: usize,

    /// Where convolution functions are persisted. `None` keeps them in
    /// memory only.
    pub cf_cache_dir: Option<PathBuf>,

    pub do_pb_correction: bool,

    pub w_planes: usize,

    pub use_autocorrelations: bool,
}

impl Default for GridderConfig {
    fn default() -> Self {
        GridderConfig {
            conv_size: CONVSIZE,
            oversampling: OVERSAMPLING,
            pa_tolerance_deg: DEFAULT_PA_TOLERANCE_DEG,
            pb_limit: DEFAULT_PB_LIMIT,
            cache_size_bytes: DEFAULT_CACHE_SIZE_BYTES,
            tile_size: DEFAULT_TILE_SIZE,
            cf_cache_dir: None,
            do_pb_correction: true,
            w_planes: 1,
            use_autocorrelations: false,
        }
    }
}

impl GridderConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.oversampling == 0 {
            return Err(ConfigError::Zero {
                name: "oversampling",
            });
        }
        if self.conv_size == 0 || self.conv_size % 2 != 0 {
            return Err(ConfigError::BadConvSize(self.conv_size));
        }
        if self.conv_size % self.oversampling != 0 {
            return Err(ConfigError::ConvSizeNotDivisible {
                conv_size: self.conv_size,
                oversampling: self.oversampling,
            });
        }
        if self.w_planes == 0 {
            return Err(ConfigError::Zero { name: "w_planes" });
        }
        if self.tile_size == 0 {
            return Err(ConfigError::Zero { name: "tile_size" });
        }
        if self.pb_limit < 0.0 {
            return Err(ConfigError::NegativePbLimit(self.pb_limit));
        }
        Ok(())
    }

    /// The parallactic angle tolerance \[radians\].
    pub fn pa_tolerance_rad(&self) -> f64 {
        self.pa_tolerance_deg.to_radians()
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        from_toml(s, "<string>")
    }

    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        from_json(s, "<string>")
    }

    /// Read a toml or json file, chosen by extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        from_file(path.as_ref())
    }
}

impl IterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        Ok(())
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        from_toml(s, "<string>")
    }

    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        from_json(s, "<string>")
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        from_file(path.as_ref())
    }
}

fn from_toml<T: DeserializeOwned>(s: &str, file: &str) -> Result<T, ConfigError> {
    toml::from_str(s).map_err(|err| ConfigError::Toml {
        file: file.to_string(),
        err,
    })
}

fn from_json<T: DeserializeOwned>(s: &str, file: &str) -> Result<T, ConfigError> {
    serde_json::from_str(s).map_err(|err| ConfigError::Json {
        file: file.to_string(),
        err,
    })
}

fn from_file<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    debug!("Attempting to parse config file {}", path.display());
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase());
    let parse: fn(&str, &str) -> Result<T, ConfigError> = match ext.as_deref() {
        Some("toml") => from_toml,
        Some("json") => from_json,
        _ => return Err(ConfigError::UnknownFileType(path.to_path_buf())),
    };
    let contents = std::fs::read_to_string(path)?;
    parse(&contents, &path.display().to_string())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(GridderConfig::default().validate().is_ok());
        assert!(IterConfig::default().validate().is_ok());
        assert_eq!(GridderConfig::default().conv_size, 2048);
        assert_eq!(GridderConfig::default().oversampling, 20);
    }

    #[test]
    fn test_validate_rejects() {
        let bad = |f: fn(&mut GridderConfig)| {
            let mut c = GridderConfig::default();
            f(&mut c);
            c.validate()
        };
        assert!(matches!(
            bad(|c| c.conv_size = 0),
            Err(ConfigError::BadConvSize(0))
        ));
        assert!(matches!(
            bad(|c| c.conv_size = 2047),
            Err(ConfigError::BadConvSize(2047))
        ));
        assert!(matches!(
            bad(|c| c.conv_size = 2050),
            Err(ConfigError::ConvSizeNotDivisible { .. })
        ));
        assert!(matches!(
            bad(|c| c.oversampling = 0),
            Err(ConfigError::Zero {
                name: "oversampling"
            })
        ));
        assert!(matches!(
            bad(|c| c.w_planes = 0),
            Err(ConfigError::Zero { name: "w_planes" })
        ));
        assert!(matches!(
            bad(|c| c.tile_size = 0),
            Err(ConfigError::Zero { name: "tile_size" })
        ));
        assert!(matches!(
            bad(|c| c.pb_limit = -0.1),
            Err(ConfigError::NegativePbLimit(_))
        ));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let c = GridderConfig::from_toml_str("conv_size = 64\noversampling = 4\n").unwrap();
        assert_eq!(c.conv_size, 64);
        assert_eq!(c.oversampling, 4);
        assert_eq!(c.w_planes, 1);
        assert!(c.do_pb_correction);

        let i = IterConfig::from_toml_str("locking = \"no_read_locking\"").unwrap();
        assert_eq!(i.locking, LockingMode::NoReadLocking);
        assert_eq!(i.row_blocking, 0);
    }

    #[test]
    fn test_json_and_files() {
        let c = GridderConfig::from_json_str(r#"{"pb_limit": 0.1, "cf_cache_dir": "/tmp/cf"}"#)
            .unwrap();
        assert_eq!(c.cf_cache_dir, Some(PathBuf::from("/tmp/cf")));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("iter.json");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(br#"{"row_blocking": 10}"#).unwrap();
        drop(f);
        assert_eq!(IterConfig::from_file(&path).unwrap().row_blocking, 10);

        let path = dir.path().join("gridder.yaml");
        std::fs::write(&path, "w_planes: 3").unwrap();
        assert!(matches!(
            GridderConfig::from_file(&path),
            Err(ConfigError::UnknownFileType(_))
        ));
    }

    #[test]
    fn test_bad_toml() {
        assert!(matches!(
            GridderConfig::from_toml_str("conv_size = \"big\""),
            Err(ConfigError::Toml { .. })
        ));
    }
}
