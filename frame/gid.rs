//! Nested grid identifiers.
//!
//! A point at projected `(x, y)` falls in cell `ceil(|x| / r)` east or west of
//! the origin and `ceil(|y| / r)` north or south of it. The code reads
//! `E12N3`, `W4S17` and so on. When each resolution divides the next coarser
//! one, every fine cell lies inside exactly one coarse cell.

use crate::frame::SamplingError;

/// Cell index along one axis.
pub fn axis_index(coordinate: f64, resolution: f64) -> u64 {
    (coordinate.abs() / resolution).ceil() as u64
}

pub fn grid_id(x: f64, y: f64, resolution: f64) -> String {
    let east_west = if x < 0.0 { 'W' } else { 'E' };
    let north_south = if y < 0.0 { 'S' } else { 'N' };
    format!(
        "{east_west}{}{north_south}{}",
        axis_index(x, resolution),
        axis_index(y, resolution)
    )
}

/// One identifier per resolution, coarse to fine in the given order.
pub fn grid_ids(x: f64, y: f64, resolutions: &[f64]) -> Vec<String> {
    resolutions.iter().map(|&r| grid_id(x, y, r)).collect()
}

/// Resolutions must be positive and each must be a whole multiple of the next.
pub fn validate_resolutions(resolutions: &[f64]) -> Result<(), SamplingError> {
    if let Some(&bad) = resolutions.iter().find(|r| !(r.is_finite() && **r > 0.0)) {
        return Err(SamplingError::InvalidResolution(bad));
    }
    for pair in resolutions.windows(2) {
        let ratio = pair[0] / pair[1];
        if ratio < 1.0 || (ratio - ratio.round()).abs() > 1e-9 {
            return Err(SamplingError::NonNestedResolutions {
                coarse: pair[0],
                fine: pair[1],
            });
        }
    }
    Ok(())
}
