//! Pipeline configuration file.
//!
//! One TOML document with a section per stage. Every section and every field
//! is optional; anything left out takes its default.
//!
//! ```toml
//! [store]
//! covariates = ["ndvi_dry", "ndvi_wet", "slope", "dist_water"]
//!
//! [ensemble]
//! seed = 7
//! folds = 5
//!
//! [hierarchical]
//! delta_aic_threshold = 4.0
//!
//! [poststrat]
//! weighting = "area_weighted"
//! ```

use crate::calibrate::data::StoreConfig;
use crate::calibrate::ensemble::EnsembleConfig;
use crate::frame::FrameConfig;
use crate::mrp::hierarchical::HierarchicalConfig;
use crate::mrp::poststrat::PoststratConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub store: StoreConfig,
    pub ensemble: EnsembleConfig,
    pub hierarchical: HierarchicalConfig,
    pub poststrat: PoststratConfig,
    pub frame: FrameConfig,
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: display.clone(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: display.clone(),
            source,
        })?;
        config.validate()?;
        log::info!("Loaded configuration from '{display}'");
        Ok(config)
    }

    /// Defaults when no path is given.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let e = &self.ensemble;
        if e.folds < 2 {
            return Err(ConfigError::Invalid(format!("ensemble.folds must be at least 2, got {}", e.folds)));
        }
        if !(e.calibration_fraction > 0.0 && e.calibration_fraction < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "ensemble.calibration_fraction must lie in (0, 1), got {}",
                e.calibration_fraction
            )));
        }
        let level = self.poststrat.confidence_level;
        if !(level > 0.0 && level < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "poststrat.confidence_level must lie in (0, 1), got {level}"
            )));
        }
        let h = &self.hierarchical;
        if !(h.max_abs_correlation > 0.0 && h.max_abs_correlation <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "hierarchical.max_abs_correlation must lie in (0, 1], got {}",
                h.max_abs_correlation
            )));
        }
        crate::frame::gid::validate_resolutions(&self.frame.resolutions)
            .map_err(|e| ConfigError::Invalid(format!("frame.resolutions: {e}")))?;
        Ok(())
    }
}
