//! # Poststratification
//!
//! Turns per-area rates into one region-wide proportion with a binomial
//! standard error and a normal-approximation confidence interval, plus the
//! matching cropland totals.
//!
//! Two per-area estimators are available. The direct ratio estimator
//! reweights the survey rate by `roi / sample`, which reproduces the raster
//! ratio exactly; it is kept as a documented baseline. The multilevel
//! estimator back-transforms each area's model logit at its mean spatial
//! score.
//!
//! Areas are never imputed. Anything that cannot be estimated is listed in
//! the report's omissions together with the reason.

use crate::calibrate::data::ObservationTable;
use crate::map::zonal::ZoneSummary;
use crate::mrp::hierarchical::FittedHierarchicalModel;
use crate::shared::files::{self, TableError, TsvWriter, format_value};
use ahash::{AHashMap, AHashSet};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use std::fmt;
use std::path::Path;
use thiserror::Error;

const REQUIRED_COLUMNS: [&str; 7] = [
    "area_id",
    "name",
    "land_area",
    "cropland_area",
    "mean_score",
    "irrigated",
    "not_irrigated",
];

#[derive(Error, Debug)]
pub enum PoststratError {
    #[error(transparent)]
    Table(#[from] TableError),

    #[error("Confidence level {0} is not in (0, 1).")]
    InvalidConfidenceLevel(f64),

    #[error("Area '{0}' appears more than once in the poststratification table.")]
    DuplicateArea(String),

    #[error("Area '{area_id}' has an invalid '{column}' value: {value}")]
    InvalidValue {
        area_id: String,
        column: &'static str,
        value: f64,
    },

    #[error("Observations name areas that match no zone: {}", .0.join(", "))]
    UnmatchedAreas(Vec<String>),

    #[error("The multilevel estimator needs a fitted hierarchical model.")]
    MissingModel,

    #[error("No area could be estimated; {0} areas were omitted.")]
    NoEstimableAreas(usize),

    #[error("Estimable areas have zero total cropland area; area weighting is undefined.")]
    ZeroCroplandArea,
}

/// One small area of the poststratification table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoststratRow {
    pub area_id: String,
    pub name: String,
    pub land_area: f64,
    pub cropland_area: f64,
    pub mean_score: f64,
    pub irrigated: usize,
    pub not_irrigated: usize,
    /// Irrigated cropland area from an external reference raster.
    pub irrigated_area: Option<f64>,
    /// Precomputed area-specific logit intercept.
    pub intercept: Option<f64>,
    /// Precomputed area-specific logit slope on the spatial score.
    pub slope: Option<f64>,
}

impl PoststratRow {
    pub fn surveyed(&self) -> usize {
        self.irrigated + self.not_irrigated
    }

    pub fn sample_rate(&self) -> Option<f64> {
        let n = self.surveyed();
        (n > 0).then(|| self.irrigated as f64 / n as f64)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PoststratTable {
    rows: Vec<PoststratRow>,
}

impl PoststratTable {
    pub fn new(rows: Vec<PoststratRow>) -> Result<Self, PoststratError> {
        let mut seen = AHashSet::new();
        for row in &rows {
            if !seen.insert(row.area_id.as_str()) {
                return Err(PoststratError::DuplicateArea(row.area_id.clone()));
            }
            let areas = [
                ("land_area", Some(row.land_area)),
                ("cropland_area", Some(row.cropland_area)),
                ("irrigated_area", row.irrigated_area),
            ];
            for (column, value) in areas {
                if let Some(v) = value.filter(|v| !(v.is_finite() && *v >= 0.0)) {
                    return Err(PoststratError::InvalidValue {
                        area_id: row.area_id.clone(),
                        column,
                        value: v,
                    });
                }
            }
            if !row.mean_score.is_finite() {
                return Err(PoststratError::InvalidValue {
                    area_id: row.area_id.clone(),
                    column: "mean_score",
                    value: row.mean_score,
                });
            }
        }
        Ok(Self { rows })
    }

    /// Builds the table from zonal summaries and per-area survey counts.
    ///
    /// Every observation `area_id` must equal one zone code. Zones without a
    /// mean score have no scored cropland and are left out.
    pub fn from_zones(
        summaries: &[ZoneSummary],
        observations: &ObservationTable,
    ) -> Result<Self, PoststratError> {
        let mut counts: AHashMap<&str, (usize, usize)> = AHashMap::new();
        for (area, &label) in observations.area_ids.iter().zip(observations.labels.iter()) {
            let entry = counts.entry(area.as_str()).or_default();
            if label == 1.0 {
                entry.0 += 1;
            } else {
                entry.1 += 1;
            }
        }
        let zone_codes: AHashSet<&str> = summaries.iter().map(|z| z.zone.as_str()).collect();
        let unmatched: Vec<String> = counts
            .keys()
            .filter(|area| !zone_codes.contains(*area))
            .map(|area| area.to_string())
            .sorted()
            .collect();
        if !unmatched.is_empty() {
            return Err(PoststratError::UnmatchedAreas(unmatched));
        }
        let mut skipped = 0;
        let mut skipped_units = 0;
        let rows = summaries
            .iter()
            .filter_map(|zone| {
                let (irrigated, not_irrigated) = counts.get(zone.zone.as_str()).copied().unwrap_or_default();
                let Some(mean_score) = zone.mean_score else {
                    skipped += 1;
                    skipped_units += irrigated + not_irrigated;
                    return None;
                };
                Some(PoststratRow {
                    area_id: zone.zone.clone(),
                    name: zone.zone.clone(),
                    land_area: zone.land_area,
                    cropland_area: zone.cropland_area,
                    mean_score,
                    irrigated,
                    not_irrigated,
                    irrigated_area: zone.irrigated_area,
                    intercept: None,
                    slope: None,
                })
            })
            .collect();
        if skipped > 0 {
            log::warn!(
                "{skipped} zones have no scored cropland and were left out of the table, with {skipped_units} surveyed units"
            );
        }
        Self::new(rows)
    }

    pub fn rows(&self) -> &[PoststratRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, area_id: &str) -> Option<&PoststratRow> {
        self.rows.iter().find(|r| r.area_id == area_id)
    }

    pub fn write(&self, path: &Path) -> Result<(), PoststratError> {
        let mut header: Vec<&str> = REQUIRED_COLUMNS.to_vec();
        header.extend(["irrigated_area", "intercept", "slope"]);
        let mut writer = TsvWriter::create(path, &header)?;
        for row in &self.rows {
            writer.write_row(&[
                row.area_id.clone(),
                row.name.clone(),
                format_value(Some(row.land_area)),
                format_value(Some(row.cropland_area)),
                format_value(Some(row.mean_score)),
                row.irrigated.to_string(),
                row.not_irrigated.to_string(),
                format_value(row.irrigated_area),
                format_value(row.intercept),
                format_value(row.slope),
            ])?;
        }
        writer.finish()?;
        Ok(())
    }
}

fn count_column(df: &polars::prelude::DataFrame, name: &str) -> Result<Vec<usize>, TableError> {
    files::numeric_column(df, name)?
        .into_iter()
        .map(|v| {
            if v >= 0.0 && v.fract() == 0.0 {
                Ok(v as usize)
            } else {
                Err(TableError::ColumnWrongType {
                    column_name: name.to_string(),
                    expected_type: "non-negative integer count",
                    found_type: v.to_string(),
                })
            }
        })
        .collect()
}

fn optional_column(df: &polars::prelude::DataFrame, name: &str) -> Result<Vec<Option<f64>>, TableError> {
    if files::has_column(df, name) {
        files::nullable_numeric_column(df, name)
    } else {
        Ok(vec![None; df.height()])
    }
}

/// Reads a tab-separated poststratification table, addressing columns by name.
pub fn load_poststrat_table(path: &Path) -> Result<PoststratTable, PoststratError> {
    let df = files::read_tsv(path)?;
    files::require_columns(&df, &REQUIRED_COLUMNS)?;
    let area_ids = files::string_column(&df, "area_id")?;
    let names = files::string_column(&df, "name")?;
    let land_area = files::numeric_column(&df, "land_area")?;
    let cropland_area = files::numeric_column(&df, "cropland_area")?;
    let mean_score = files::numeric_column(&df, "mean_score")?;
    let irrigated = count_column(&df, "irrigated")?;
    let not_irrigated = count_column(&df, "not_irrigated")?;
    let irrigated_area = optional_column(&df, "irrigated_area")?;
    let intercept = optional_column(&df, "intercept")?;
    let slope = optional_column(&df, "slope")?;

    let rows = (0..df.height())
        .map(|i| {
            let area_id = area_ids[i]
                .clone()
                .filter(|a| !a.is_empty())
                .ok_or_else(|| TableError::MissingValuesFound("area_id".to_string()))?;
            Ok(PoststratRow {
                name: names[i].clone().unwrap_or_else(|| area_id.clone()),
                area_id,
                land_area: land_area[i],
                cropland_area: cropland_area[i],
                mean_score: mean_score[i],
                irrigated: irrigated[i],
                not_irrigated: not_irrigated[i],
                irrigated_area: irrigated_area[i],
                intercept: intercept[i],
                slope: slope[i],
            })
        })
        .collect::<Result<Vec<_>, TableError>>()?;
    PoststratTable::new(rows)
}

/// Where the multilevel estimator takes its area coefficients from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoefficientSource {
    /// Fixed effects plus conditional modes of a fitted model.
    Model,
    /// The table's precomputed `intercept` and `slope` columns.
    Table,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentMethod {
    DirectRatio,
    Multilevel(CoefficientSource),
}

impl fmt::Display for AdjustmentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DirectRatio => f.write_str("direct ratio"),
            Self::Multilevel(CoefficientSource::Model) => f.write_str("multilevel (fitted model)"),
            Self::Multilevel(CoefficientSource::Table) => f.write_str("multilevel (table coefficients)"),
        }
    }
}

/// How per-area proportions are combined into the region-wide estimate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Weighting {
    /// Plain mean over estimable areas.
    #[default]
    Unweighted,
    /// Mean weighted by cropland area.
    AreaWeighted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoststratConfig {
    pub confidence_level: f64,
    pub weighting: Weighting,
}

impl Default for PoststratConfig {
    fn default() -> Self {
        Self {
            confidence_level: 0.95,
            weighting: Weighting::Unweighted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OmissionReason {
    /// No surveyed units in the area.
    NoSurveyedUnits,
    /// The model (or the table's coefficient columns) has no coefficients for the area.
    NotInModel,
    /// The direct-ratio weight cannot be formed (zero sample rate, zero cropland,
    /// or no irrigated-area reference).
    UndefinedWeight,
    /// The model has the area but the table does not.
    MissingFromTable,
}

impl fmt::Display for OmissionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NoSurveyedUnits => "no surveyed units",
            Self::NotInModel => "no model coefficients",
            Self::UndefinedWeight => "undefined ratio weight",
            Self::MissingFromTable => "absent from the poststratification table",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Omission {
    pub area_id: String,
    pub reason: OmissionReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaEstimate {
    pub area_id: String,
    pub name: String,
    pub surveyed: usize,
    pub cropland_area: f64,
    pub sample_rate: f64,
    /// Raster ratio, direct estimator only.
    pub roi_rate: Option<f64>,
    /// `roi / sample`, direct estimator only.
    pub weight: Option<f64>,
    /// Logit at the area's mean score, multilevel estimator only.
    pub logit: Option<f64>,
    pub adjusted: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoststratReport {
    pub method: AdjustmentMethod,
    pub weighting: Weighting,
    pub confidence_level: f64,
    pub estimate: f64,
    pub standard_error: f64,
    pub lower: f64,
    pub upper: f64,
    pub surveyed_units: usize,
    pub cropland_area: f64,
    pub total: f64,
    pub total_lower: f64,
    pub total_upper: f64,
    pub areas: Vec<AreaEstimate>,
    pub omissions: Vec<Omission>,
}

impl PoststratReport {
    /// Writes the per-area breakdown as a table.
    pub fn write_areas(&self, path: &Path) -> Result<(), PoststratError> {
        let mut writer = TsvWriter::create(
            path,
            &[
                "area_id",
                "name",
                "surveyed",
                "cropland_area",
                "sample_rate",
                "roi_rate",
                "weight",
                "logit",
                "adjusted",
            ],
        )?;
        for area in &self.areas {
            writer.write_row(&[
                area.area_id.clone(),
                area.name.clone(),
                area.surveyed.to_string(),
                format_value(Some(area.cropland_area)),
                format_value(Some(area.sample_rate)),
                format_value(area.roi_rate),
                format_value(area.weight),
                format_value(area.logit),
                format_value(Some(area.adjusted)),
            ])?;
        }
        writer.finish()?;
        Ok(())
    }
}

fn inv_logit(eta: f64) -> f64 {
    1.0 / (1.0 + (-eta).exp())
}

/// Normal quantile for a two-sided interval at `level`.
pub fn critical_value(level: f64) -> Result<f64, PoststratError> {
    if !(level > 0.0 && level < 1.0) {
        return Err(PoststratError::InvalidConfidenceLevel(level));
    }
    let standard = Normal::new(0.0, 1.0).map_err(|_| PoststratError::InvalidConfidenceLevel(level))?;
    Ok(standard.inverse_cdf(1.0 - (1.0 - level) / 2.0))
}

fn direct_ratio(row: &PoststratRow, sample_rate: f64) -> Result<AreaEstimate, OmissionReason> {
    let irrigated_area = row.irrigated_area.ok_or(OmissionReason::UndefinedWeight)?;
    if row.cropland_area <= 0.0 || sample_rate <= 0.0 {
        return Err(OmissionReason::UndefinedWeight);
    }
    let roi = irrigated_area / row.cropland_area;
    let weight = roi / sample_rate;
    Ok(AreaEstimate {
        area_id: row.area_id.clone(),
        name: row.name.clone(),
        surveyed: row.surveyed(),
        cropland_area: row.cropland_area,
        sample_rate,
        roi_rate: Some(roi),
        weight: Some(weight),
        logit: None,
        adjusted: sample_rate * weight,
    })
}

fn multilevel(row: &PoststratRow, sample_rate: f64, coefficients: Option<(f64, f64)>) -> Result<AreaEstimate, OmissionReason> {
    let (intercept, slope) = coefficients.ok_or(OmissionReason::NotInModel)?;
    let eta = intercept + slope * row.mean_score;
    Ok(AreaEstimate {
        area_id: row.area_id.clone(),
        name: row.name.clone(),
        surveyed: row.surveyed(),
        cropland_area: row.cropland_area,
        sample_rate,
        roi_rate: None,
        weight: None,
        logit: Some(eta),
        adjusted: inv_logit(eta),
    })
}

/// Poststratifies `table` with the chosen per-area estimator.
pub fn poststratify(
    table: &PoststratTable,
    method: AdjustmentMethod,
    model: Option<&FittedHierarchicalModel>,
    config: &PoststratConfig,
) -> Result<PoststratReport, PoststratError> {
    let z = critical_value(config.confidence_level)?;
    let model = match method {
        AdjustmentMethod::Multilevel(CoefficientSource::Model) => {
            Some(model.ok_or(PoststratError::MissingModel)?)
        }
        _ => None,
    };
    if method == AdjustmentMethod::DirectRatio {
        log::warn!(
            "Direct ratio adjustment multiplies the sample rate by roi/sample, so each adjusted rate equals the raster ratio"
        );
    }

    let mut areas = Vec::new();
    let mut omissions = Vec::new();
    for row in table.rows() {
        let Some(sample_rate) = row.sample_rate() else {
            omissions.push(Omission {
                area_id: row.area_id.clone(),
                reason: OmissionReason::NoSurveyedUnits,
            });
            continue;
        };
        let estimate = match method {
            AdjustmentMethod::DirectRatio => direct_ratio(row, sample_rate),
            AdjustmentMethod::Multilevel(CoefficientSource::Table) => {
                multilevel(row, sample_rate, row.intercept.zip(row.slope))
            }
            AdjustmentMethod::Multilevel(CoefficientSource::Model) => multilevel(
                row,
                sample_rate,
                model.and_then(|m| m.area_coefficients(&row.area_id)),
            ),
        };
        match estimate {
            Ok(area) => areas.push(area),
            Err(reason) => omissions.push(Omission {
                area_id: row.area_id.clone(),
                reason,
            }),
        }
    }
    if let Some(model) = model {
        for area in model.areas.iter().filter(|a| table.get(&a.area_id).is_none()) {
            omissions.push(Omission {
                area_id: area.area_id.clone(),
                reason: OmissionReason::MissingFromTable,
            });
        }
    }
    if areas.is_empty() {
        return Err(PoststratError::NoEstimableAreas(omissions.len()));
    }

    let cropland_area: f64 = areas.iter().map(|a| a.cropland_area).sum();
    let estimate = match config.weighting {
        Weighting::Unweighted => areas.iter().map(|a| a.adjusted).sum::<f64>() / areas.len() as f64,
        Weighting::AreaWeighted => {
            if cropland_area <= 0.0 {
                return Err(PoststratError::ZeroCroplandArea);
            }
            areas.iter().map(|a| a.adjusted * a.cropland_area).sum::<f64>() / cropland_area
        }
    };
    let surveyed_units: usize = areas.iter().map(|a| a.surveyed).sum();
    let standard_error = (estimate * (1.0 - estimate) / surveyed_units as f64).sqrt();
    let lower = estimate - z * standard_error;
    let upper = estimate + z * standard_error;

    if !omissions.is_empty() {
        let mut by_reason: AHashMap<OmissionReason, usize> = AHashMap::new();
        for omission in &omissions {
            *by_reason.entry(omission.reason).or_default() += 1;
        }
        let mut summary: Vec<String> = by_reason.iter().map(|(r, n)| format!("{n} {r}")).collect();
        summary.sort();
        log::warn!("Omitted {} areas from poststratification: {}", omissions.len(), summary.join(", "));
    }
    log::info!(
        "{method} estimate over {} areas: {estimate:.4} (SE {standard_error:.4}, {:.0}% CI [{lower:.4}, {upper:.4}])",
        areas.len(),
        config.confidence_level * 100.0
    );

    Ok(PoststratReport {
        method,
        weighting: config.weighting,
        confidence_level: config.confidence_level,
        estimate,
        standard_error,
        lower,
        upper,
        surveyed_units,
        cropland_area,
        total: estimate * cropland_area,
        total_lower: lower * cropland_area,
        total_upper: upper * cropland_area,
        areas,
        omissions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mrp::hierarchical::{AreaEffect, Estimate, FitReliability, RandomEffects};
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, Array2};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn row(id: &str, cropland: f64, irrigated_area: f64, irrigated: usize, not_irrigated: usize) -> PoststratRow {
        PoststratRow {
            area_id: id.to_string(),
            name: format!("District {id}"),
            land_area: cropland * 2.0,
            cropland_area: cropland,
            mean_score: 0.4,
            irrigated,
            not_irrigated,
            irrigated_area: Some(irrigated_area),
            intercept: None,
            slope: None,
        }
    }

    fn table() -> PoststratTable {
        PoststratTable::new(vec![
            row("a", 100.0, 10.0, 3, 7),
            row("b", 200.0, 50.0, 5, 15),
            row("c", 50.0, 5.0, 0, 0),
            row("d", 80.0, 8.0, 0, 12),
        ])
        .unwrap()
    }

    fn model() -> FittedHierarchicalModel {
        let effect = |id: &str, u: f64| AreaEffect {
            area_id: id.to_string(),
            units: 10,
            intercept_offset: Estimate {
                value: u,
                std_error: Some(0.1),
            },
            slope_offset: None,
        };
        FittedHierarchicalModel {
            effects: RandomEffects::Intercept,
            intercept: Estimate {
                value: -1.0,
                std_error: Some(0.2),
            },
            slope: Estimate {
                value: 2.0,
                std_error: Some(0.3),
            },
            random_intercept_sd: 0.5,
            random_slope_sd: None,
            correlation: None,
            log_likelihood: -50.0,
            aic: 106.0,
            bic: 110.0,
            n_units: 42,
            iterations: 10,
            reliability: FitReliability::Reliable,
            areas: vec![effect("a", 0.3), effect("c", 0.0), effect("z", 1.0)],
        }
    }

    #[test]
    fn direct_ratio_reproduces_raster_ratio() {
        let report = poststratify(&table(), AdjustmentMethod::DirectRatio, None, &PoststratConfig::default()).unwrap();
        for area in &report.areas {
            assert_abs_diff_eq!(area.adjusted, area.roi_rate.unwrap(), epsilon = 1e-12);
        }
        assert_abs_diff_eq!(report.estimate, (0.1 + 0.25) / 2.0, epsilon = 1e-12);
        assert_eq!(report.surveyed_units, 30);
        assert_eq!(
            report.omissions,
            vec![
                Omission {
                    area_id: "c".into(),
                    reason: OmissionReason::NoSurveyedUnits
                },
                Omission {
                    area_id: "d".into(),
                    reason: OmissionReason::UndefinedWeight
                },
            ]
        );
    }

    #[test]
    fn interval_is_symmetric_and_widens_with_level() {
        let narrow = poststratify(&table(), AdjustmentMethod::DirectRatio, None, &PoststratConfig::default()).unwrap();
        let wide = poststratify(
            &table(),
            AdjustmentMethod::DirectRatio,
            None,
            &PoststratConfig {
                confidence_level: 0.99,
                ..PoststratConfig::default()
            },
        )
        .unwrap();
        assert_abs_diff_eq!(narrow.estimate - narrow.lower, narrow.upper - narrow.estimate, epsilon = 1e-12);
        assert!(wide.lower < narrow.lower && wide.upper > narrow.upper);
        let p = narrow.estimate;
        assert_abs_diff_eq!(narrow.standard_error, (p * (1.0 - p) / 30.0).sqrt(), epsilon = 1e-12);
        assert_abs_diff_eq!(narrow.upper - p, 1.959964 * narrow.standard_error, epsilon = 1e-6);
        assert_abs_diff_eq!(narrow.total, p * 300.0, epsilon = 1e-9);
        assert_abs_diff_eq!(narrow.total_lower, narrow.lower * 300.0, epsilon = 1e-9);
    }

    #[test]
    fn multilevel_uses_area_intercepts_and_reports_omissions() {
        let m = model();
        let report = poststratify(
            &table(),
            AdjustmentMethod::Multilevel(CoefficientSource::Model),
            Some(&m),
            &PoststratConfig::default(),
        )
        .unwrap();
        assert_eq!(report.areas.len(), 1);
        let a = &report.areas[0];
        assert_abs_diff_eq!(a.logit.unwrap(), -1.0 + 0.3 + 2.0 * 0.4, epsilon = 1e-12);
        assert_abs_diff_eq!(report.estimate, inv_logit(0.1), epsilon = 1e-12);
        let reasons: Vec<(&str, OmissionReason)> = report
            .omissions
            .iter()
            .map(|o| (o.area_id.as_str(), o.reason))
            .collect();
        assert_eq!(
            reasons,
            vec![
                ("b", OmissionReason::NotInModel),
                ("c", OmissionReason::NoSurveyedUnits),
                ("d", OmissionReason::NotInModel),
                ("z", OmissionReason::MissingFromTable),
            ]
        );
    }

    #[test]
    fn multilevel_without_model_is_an_error() {
        assert!(matches!(
            poststratify(
                &table(),
                AdjustmentMethod::Multilevel(CoefficientSource::Model),
                None,
                &PoststratConfig::default()
            ),
            Err(PoststratError::MissingModel)
        ));
        assert!(matches!(critical_value(1.0), Err(PoststratError::InvalidConfidenceLevel(_))));
    }

    #[test]
    fn duplicate_or_negative_rows_are_rejected() {
        assert!(matches!(
            PoststratTable::new(vec![row("a", 1.0, 0.5, 1, 1), row("a", 1.0, 0.5, 1, 1)]),
            Err(PoststratError::DuplicateArea(_))
        ));
        assert!(matches!(
            PoststratTable::new(vec![PoststratRow {
                land_area: 10.0,
                ..row("a", -1.0, 0.5, 1, 1)
            }]),
            Err(PoststratError::InvalidValue { column: "cropland_area", .. })
        ));
    }

    fn observations(areas: &[&str], labels: &[f64]) -> ObservationTable {
        let n = areas.len();
        ObservationTable {
            ids: (0..n).map(|i| format!("u{i}")).collect(),
            lon: Array1::zeros(n),
            lat: Array1::zeros(n),
            x: Array1::zeros(n),
            y: Array1::zeros(n),
            labels: Array1::from_vec(labels.to_vec()),
            area_ids: areas.iter().map(|a| a.to_string()).collect(),
            covariates: Array2::zeros((n, 0)),
            covariate_names: Vec::new(),
            spatial_score: None,
            dropped_rows: 0,
        }
    }

    fn zone(code: &str, mean_score: Option<f64>) -> ZoneSummary {
        ZoneSummary {
            zone: code.to_string(),
            land_area: 400.0,
            cropland_area: 100.0,
            mean_score,
            irrigated_area: Some(20.0),
        }
    }

    #[test]
    fn zone_table_counts_units_per_area() {
        let obs = observations(&["1", "1", "2", "1"], &[1.0, 0.0, 1.0, 0.0]);
        let table = PoststratTable::from_zones(&[zone("1", Some(0.3)), zone("2", Some(0.6)), zone("3", None)], &obs)
            .unwrap();
        assert_eq!(table.len(), 2);
        let first = table.get("1").unwrap();
        assert_eq!((first.irrigated, first.not_irrigated), (1, 2));
        assert_eq!(table.get("2").unwrap().surveyed(), 1);
        assert!(table.get("3").is_none());
    }

    #[test]
    fn observations_outside_every_zone_are_rejected() {
        let obs = observations(&["1", "1", "01", "99"], &[1.0, 0.0, 1.0, 1.0]);
        match PoststratTable::from_zones(&[zone("1", Some(0.4))], &obs) {
            Err(PoststratError::UnmatchedAreas(ids)) => assert_eq!(ids, vec!["01", "99"]),
            other => panic!("expected UnmatchedAreas, got {other:?}"),
        }
    }

    #[test]
    fn repeated_runs_exclude_the_same_areas() {
        let table = table();
        let with_model = AdjustmentMethod::Multilevel(CoefficientSource::Model);
        let model = model();
        for (method, model) in [(AdjustmentMethod::DirectRatio, None), (with_model, Some(&model))] {
            let first = poststratify(&table, method, model, &PoststratConfig::default()).unwrap();
            let second = poststratify(&table, method, model, &PoststratConfig::default()).unwrap();
            assert!(!first.omissions.is_empty());
            assert_eq!(first.omissions, second.omissions);
            assert_eq!(first.areas, second.areas);
            assert_eq!(first, second);
        }
    }

    #[test]
    fn table_file_round_trip_keeps_optional_columns() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "area_id\tname\tland_area\tcropland_area\tmean_score\tirrigated\tnot_irrigated\tintercept\tslope").unwrap();
        writeln!(file, "101\tMbale\t500\t200\t0.35\t4\t16\t-1.2\t2.0").unwrap();
        writeln!(file, "102\tTororo\t400\t150\t0.25\t0\t0\tNA\tNA").unwrap();
        file.flush().unwrap();
        let table = load_poststrat_table(file.path()).unwrap();
        assert_eq!(table.len(), 2);
        let first = table.get("101").unwrap();
        assert_eq!(first.name, "Mbale");
        assert_eq!(first.surveyed(), 20);
        assert_eq!(first.intercept, Some(-1.2));
        assert_eq!(first.irrigated_area, None);
        assert_eq!(table.get("102").unwrap().slope, None);

        let out = NamedTempFile::new().unwrap();
        table.write(out.path()).unwrap();
        let again = load_poststrat_table(out.path()).unwrap();
        assert_eq!(again.get("101").unwrap().irrigated, 4);
        assert_abs_diff_eq!(again.get("101").unwrap().mean_score, 0.35, epsilon = 1e-6);
    }

    #[test]
    fn fractional_counts_are_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "area_id\tname\tland_area\tcropland_area\tmean_score\tirrigated\tnot_irrigated").unwrap();
        writeln!(file, "1\tx\t5\t2\t0.3\t1.5\t2").unwrap();
        file.flush().unwrap();
        assert!(matches!(
            load_poststrat_table(file.path()),
            Err(PoststratError::Table(TableError::ColumnWrongType { .. }))
        ));
    }
}
