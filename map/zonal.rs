//! Per-zone area totals and mean scores.

use crate::map::grid::{Grid, RasterError};
use crate::map::mask::RoiMask;
use ahash::AHashMap;
use itertools::Itertools;

/// Totals for one small area, in the squared units of the grid cell size.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneSummary {
    pub zone: String,
    pub land_area: f64,
    pub cropland_area: f64,
    /// Mean surface value over scored cropland cells.
    pub mean_score: Option<f64>,
    pub irrigated_area: Option<f64>,
}

#[derive(Default)]
struct ZoneAccumulator {
    land_cells: usize,
    cropland_cells: usize,
    scored_cells: usize,
    score_sum: f64,
    irrigated_cells: usize,
}

/// Summarizes `surface` over each integer zone code of `zones`.
///
/// Cropland is the set of eligible `cropland` cells; `irrigated`, when given,
/// counts eligible cells within that cropland. Zones are returned in
/// ascending code order.
pub fn zonal_summary(
    zones: &Grid,
    cropland: &RoiMask,
    surface: &Grid,
    irrigated: Option<&RoiMask>,
) -> Result<Vec<ZoneSummary>, RasterError> {
    let geometry = zones.geometry;
    if !cropland.geometry().same_layout(&geometry) {
        return Err(RasterError::GeometryMismatch("cropland mask".to_string()));
    }
    if !surface.geometry.same_layout(&geometry) {
        return Err(RasterError::GeometryMismatch("score surface".to_string()));
    }
    if irrigated.is_some_and(|m| !m.geometry().same_layout(&geometry)) {
        return Err(RasterError::GeometryMismatch("irrigated mask".to_string()));
    }

    let mut totals: AHashMap<i64, ZoneAccumulator> = AHashMap::new();
    for ((row, col), &code) in zones.values.indexed_iter() {
        if code.is_nan() {
            continue;
        }
        let acc = totals.entry(code.round() as i64).or_default();
        acc.land_cells += 1;
        if !cropland.is_eligible(row, col) {
            continue;
        }
        acc.cropland_cells += 1;
        let score = surface.values[[row, col]];
        if !score.is_nan() {
            acc.scored_cells += 1;
            acc.score_sum += score;
        }
        if irrigated.is_some_and(|m| m.is_eligible(row, col)) {
            acc.irrigated_cells += 1;
        }
    }

    let cell_area = geometry.cell_area();
    let summaries = totals
        .into_iter()
        .sorted_by_key(|(code, _)| *code)
        .map(|(code, acc)| ZoneSummary {
            zone: code.to_string(),
            land_area: acc.land_cells as f64 * cell_area,
            cropland_area: acc.cropland_cells as f64 * cell_area,
            mean_score: (acc.scored_cells > 0).then(|| acc.score_sum / acc.scored_cells as f64),
            irrigated_area: irrigated.map(|_| acc.irrigated_cells as f64 * cell_area),
        })
        .collect_vec();
    log::info!("Summarized {} zones", summaries.len());
    Ok(summaries)
}
