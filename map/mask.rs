//! Region-of-interest masks.

use crate::map::grid::{Grid, GridGeometry, RasterError, RasterStack};
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

/// Keeps cells where `band` lies within `[min, max]`; an absent bound is open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub band: String,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl ThresholdRule {
    fn admits(&self, value: f64) -> bool {
        !value.is_nan()
            && self.min.is_none_or(|lo| value >= lo)
            && self.max.is_none_or(|hi| value <= hi)
    }
}

/// Boolean grid of cells taking part in scoring, sampling and area totals.
#[derive(Debug, Clone)]
pub struct RoiMask {
    geometry: GridGeometry,
    cells: Array2<bool>,
}

impl RoiMask {
    /// Cells where every rule holds. A stack band that is no-data excludes the
    /// cell even when no rule names it.
    pub fn from_thresholds(stack: &RasterStack, rules: &[ThresholdRule]) -> Result<Self, RasterError> {
        let geometry = stack.geometry();
        let mut cells = Array2::from_elem((geometry.nrows, geometry.ncols), true);
        for name in stack.names() {
            let band = stack.band(name)?;
            Zip::from(&mut cells)
                .and(&band.values)
                .for_each(|keep, &v| *keep &= !v.is_nan());
        }
        for rule in rules {
            let band = stack.band(&rule.band)?;
            Zip::from(&mut cells)
                .and(&band.values)
                .for_each(|keep, &v| *keep &= rule.admits(v));
        }
        let mask = Self { geometry, cells };
        log::info!(
            "Region of interest: {} of {} cells eligible",
            mask.eligible_count(),
            geometry.cell_count()
        );
        Ok(mask)
    }

    /// Non-zero, non-missing cells of `grid` are eligible.
    pub fn from_grid(grid: &Grid) -> Self {
        Self {
            geometry: grid.geometry,
            cells: grid.values.mapv(|v| !v.is_nan() && v != 0.0),
        }
    }

    /// Every cell eligible.
    pub fn full(geometry: GridGeometry) -> Self {
        Self {
            geometry,
            cells: Array2::from_elem((geometry.nrows, geometry.ncols), true),
        }
    }

    pub fn geometry(&self) -> GridGeometry {
        self.geometry
    }

    pub fn is_eligible(&self, row: usize, col: usize) -> bool {
        self.cells.get((row, col)).copied().unwrap_or(false)
    }

    pub fn eligible_count(&self) -> usize {
        self.cells.iter().filter(|&&c| c).count()
    }

    /// Eligible `(row, col)` positions in row-major order.
    pub fn eligible_cells(&self) -> Vec<(usize, usize)> {
        self.cells
            .indexed_iter()
            .filter(|(_, keep)| **keep)
            .map(|(idx, _)| idx)
            .collect()
    }

    /// The mask as a 1/0 grid.
    pub fn to_grid(&self) -> Grid {
        Grid {
            geometry: self.geometry,
            values: self.cells.mapv(|c| if c { 1.0 } else { 0.0 }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::grid::DEFAULT_NODATA;
    use ndarray::array;

    fn geometry() -> GridGeometry {
        GridGeometry {
            ncols: 3,
            nrows: 2,
            xll: 0.0,
            yll: 0.0,
            cellsize: 1.0,
            nodata: DEFAULT_NODATA,
        }
    }

    #[test]
    fn thresholds_combine_and_exclude_missing_cells() {
        let ndvi = Grid::new(geometry(), array![[0.1, 0.5, 0.9], [0.6, f64::NAN, 0.7]]).unwrap();
        let slope = Grid::new(geometry(), array![[1.0, 2.0, 30.0], [4.0, 1.0, f64::NAN]]).unwrap();
        let stack =
            RasterStack::from_bands(vec![("ndvi".into(), ndvi), ("slope".into(), slope)]).unwrap();
        let rules = vec![
            ThresholdRule {
                band: "ndvi".into(),
                min: Some(0.3),
                max: None,
            },
            ThresholdRule {
                band: "slope".into(),
                min: None,
                max: Some(10.0),
            },
        ];
        let mask = RoiMask::from_thresholds(&stack, &rules).unwrap();
        assert_eq!(mask.eligible_cells(), vec![(0, 1), (1, 0)]);
        assert!(!mask.is_eligible(5, 5));
        assert_eq!(mask.to_grid().values, array![[0.0, 1.0, 0.0], [1.0, 0.0, 0.0]]);
    }

    #[test]
    fn unknown_rule_band_is_an_error() {
        let stack = RasterStack::from_bands(vec![("ndvi".into(), Grid::filled(geometry(), 1.0))]).unwrap();
        let rules = vec![ThresholdRule {
            band: "rain".into(),
            min: None,
            max: None,
        }];
        assert!(matches!(
            RoiMask::from_thresholds(&stack, &rules),
            Err(RasterError::UnknownBand(_))
        ));
    }

    #[test]
    fn grid_mask_treats_zero_and_nodata_as_outside() {
        let grid = Grid::new(geometry(), array![[1.0, 0.0, f64::NAN], [2.0, 1.0, 0.0]]).unwrap();
        let mask = RoiMask::from_grid(&grid);
        assert_eq!(mask.eligible_count(), 3);
        assert_eq!(RoiMask::full(geometry()).eligible_count(), 6);
    }
}
