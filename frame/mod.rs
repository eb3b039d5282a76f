//! Spatially balanced sampling frames over a region-of-interest mask.

#![deny(dead_code)]
#![deny(unused_imports)]

pub mod cube;
pub mod gid;
pub mod projection;

use crate::map::grid::{Grid, RasterError};
use crate::map::mask::RoiMask;
use crate::shared::faer_ndarray::FaerLinalgError;
use crate::shared::files::{TableError, TsvWriter};
use ndarray::Array2;
use projection::LambertAzimuthal;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SamplingError {
    #[error("Requested {requested} samples but only {available} cells are eligible.")]
    SampleTooLarge { requested: usize, available: usize },

    #[error("Inclusion probability {0} is outside [0, 1].")]
    InvalidProbability(f64),

    #[error("{units} inclusion probabilities but {auxiliary_rows} rows of balancing variables.")]
    ShapeMismatch { units: usize, auxiliary_rows: usize },

    #[error("Grid resolution {0} must be positive and finite.")]
    InvalidResolution(f64),

    #[error("Resolution {fine} does not divide resolution {coarse}; identifiers would not nest.")]
    NonNestedResolutions { coarse: f64, fine: f64 },

    #[error("Projected point ({x}, {y}) lies outside the projection's domain.")]
    OutsideProjection { x: f64, y: f64 },

    #[error("The zone grid does not share the mask geometry.")]
    ZoneMismatch,

    #[error(transparent)]
    Linalg(#[from] FaerLinalgError),

    #[error(transparent)]
    Raster(#[from] RasterError),

    #[error(transparent)]
    Table(#[from] TableError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    pub seed: u64,
    /// Grid-identifier resolutions in projected metres, coarse to fine.
    pub resolutions: Vec<f64>,
    /// Centre of the equal-area projection of the mask grid, degrees.
    pub lat0: f64,
    pub lon0: f64,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            resolutions: vec![100_000.0, 50_000.0, 25_000.0, 12_500.0],
            lat0: 5.0,
            lon0: 20.0,
        }
    }
}

/// One selected location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRow {
    /// Row-major cell index in the mask grid.
    pub cell: usize,
    pub x: f64,
    pub y: f64,
    pub lon: f64,
    pub lat: f64,
    /// Zone code of the cell, when a zone grid was given.
    pub area: Option<String>,
    /// One identifier per configured resolution.
    pub gids: Vec<String>,
}

/// Draws `n` eligible cells of `mask`, balanced on their projected coordinates.
///
/// `n = 0` yields an empty frame; `n` above the eligible count is an error.
pub fn generate_frame(
    mask: &RoiMask,
    n: usize,
    zones: Option<&Grid>,
    config: &FrameConfig,
) -> Result<Vec<FrameRow>, SamplingError> {
    gid::validate_resolutions(&config.resolutions)?;
    let geometry = mask.geometry();
    if zones.is_some_and(|z| !z.geometry.same_layout(&geometry)) {
        return Err(SamplingError::ZoneMismatch);
    }
    let cells = mask.eligible_cells();
    let available = cells.len();
    if n > available {
        return Err(SamplingError::SampleTooLarge {
            requested: n,
            available,
        });
    }
    if n == 0 {
        log::info!("Sample size 0 requested; the frame is empty");
        return Ok(Vec::new());
    }

    let centers: Vec<(f64, f64)> = cells
        .iter()
        .map(|&(row, col)| geometry.cell_center(row, col))
        .collect();
    let coordinates = Array2::from_shape_fn((available, 2), |(k, j)| {
        if j == 0 { centers[k].0 } else { centers[k].1 }
    });
    let probabilities = vec![n as f64 / available as f64; available];
    log::info!(
        "Drawing {n} of {available} eligible cells (inclusion probability {:.6}, seed {})",
        probabilities[0],
        config.seed
    );
    let mut rng = StdRng::seed_from_u64(config.seed);
    let sample = cube::cube_sample(&probabilities, coordinates.view(), &mut rng)?;

    let laea = LambertAzimuthal::new(config.lat0, config.lon0);
    sample
        .selected
        .iter()
        .map(|&k| {
            let (row, col) = cells[k];
            let (x, y) = centers[k];
            let (lon, lat) = laea
                .inverse(x, y)
                .ok_or(SamplingError::OutsideProjection { x, y })?;
            let area = zones
                .map(|z| z.values[[row, col]])
                .filter(|v| !v.is_nan())
                .map(|v| (v.round() as i64).to_string());
            Ok(FrameRow {
                cell: row * geometry.ncols + col,
                x,
                y,
                lon,
                lat,
                area,
                gids: gid::grid_ids(x, y, &config.resolutions),
            })
        })
        .collect()
}

/// Writes the frame as a table with one `gid_<resolution>` column per level.
pub fn write_frame(path: &Path, rows: &[FrameRow], resolutions: &[f64]) -> Result<(), SamplingError> {
    let mut header: Vec<String> = ["cell", "area", "x", "y", "lon", "lat"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    header.extend(resolutions.iter().map(|r| format!("gid_{}", r.round() as i64)));
    let mut writer = TsvWriter::create(path, &header)?;
    for row in rows {
        let mut fields = vec![
            row.cell.to_string(),
            row.area.clone().unwrap_or_else(|| "NA".to_string()),
            format!("{:.3}", row.x),
            format!("{:.3}", row.y),
            format!("{:.6}", row.lon),
            format!("{:.6}", row.lat),
        ];
        fields.extend(row.gids.iter().cloned());
        writer.write_row(&fields)?;
    }
    writer.finish()?;
    log::info!("Wrote {} frame rows to '{}'", rows.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::grid::{DEFAULT_NODATA, GridGeometry};
    use tempfile::NamedTempFile;

    fn geometry() -> GridGeometry {
        GridGeometry {
            ncols: 20,
            nrows: 20,
            xll: 1_200_000.0,
            yll: -500_000.0,
            cellsize: 5_000.0,
            nodata: DEFAULT_NODATA,
        }
    }

    #[test]
    fn frame_rows_carry_nested_identifiers_and_zones() {
        let mask = RoiMask::full(geometry());
        let zones = Grid::filled(geometry(), 7.0);
        let frame = generate_frame(&mask, 25, Some(&zones), &FrameConfig::default()).unwrap();
        assert!((24..=26).contains(&frame.len()));
        for row in &frame {
            assert_eq!(row.gids.len(), 4);
            assert_eq!(row.area.as_deref(), Some("7"));
            assert!(row.gids.iter().all(|g| g.starts_with('E') && g.contains('S')));
            assert!(row.lon > 20.0 && row.lat < 5.0);
        }
    }

    #[test]
    fn zero_sample_is_empty_and_oversized_sample_fails() {
        let mask = RoiMask::full(geometry());
        assert!(generate_frame(&mask, 0, None, &FrameConfig::default()).unwrap().is_empty());
        assert!(matches!(
            generate_frame(&mask, 401, None, &FrameConfig::default()),
            Err(SamplingError::SampleTooLarge {
                requested: 401,
                available: 400
            })
        ));
    }

    #[test]
    fn frame_is_reproducible_and_written_with_gid_columns() {
        let mask = RoiMask::full(geometry());
        let config = FrameConfig {
            seed: 99,
            ..FrameConfig::default()
        };
        let a = generate_frame(&mask, 10, None, &config).unwrap();
        let b = generate_frame(&mask, 10, None, &config).unwrap();
        assert_eq!(a, b);

        let file = NamedTempFile::new().unwrap();
        write_frame(file.path(), &a, &config.resolutions).unwrap();
        let text = std::fs::read_to_string(file.path()).unwrap();
        let header = text.lines().next().unwrap();
        assert_eq!(
            header,
            "cell\tarea\tx\ty\tlon\tlat\tgid_100000\tgid_50000\tgid_25000\tgid_12500"
        );
        assert_eq!(text.lines().count(), a.len() + 1);
    }
}
