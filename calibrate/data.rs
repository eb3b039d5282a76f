//! # Observation Loading and Validation
//!
//! This module is the only entry point for georeferenced survey observations.
//! It reads the observation table, validates it against the declared schema,
//! and hands back the column-oriented `ndarray` structures used by the
//! ensemble and the hierarchical estimator.
//!
//! - Named schema: columns are looked up by name (`id`, `lon`, `lat`, `x`,
//!   `y`, the label column, `area_id`, and every declared covariate). Column
//!   positions carry no meaning.
//! - Fail fast: malformed labels, empty small-area identifiers and non-numeric
//!   covariates abort ingestion.
//! - Incomplete records: rows whose covariates are missing are dropped before
//!   any model sees them, and the number dropped is reported.

use crate::shared::files::{self, TableError};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

const ID_COLUMN: &str = "id";
const AREA_COLUMN: &str = "area_id";
const SCORE_COLUMN: &str = "spatial_score";
const COORDINATE_COLUMNS: [&str; 4] = ["lon", "lat", "x", "y"];

/// Declared schema of the observation table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Raster-derived covariates, in the order the models will see them.
    pub covariates: Vec<String>,
    pub label_column: String,
    pub positive_label: String,
    pub negative_label: String,
    pub minimum_rows: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            covariates: Vec::new(),
            label_column: "irrigated".to_string(),
            positive_label: "Y".to_string(),
            negative_label: "N".to_string(),
            minimum_rows: 20,
        }
    }
}

#[derive(Error, Debug)]
pub enum DataError {
    #[error(transparent)]
    Table(#[from] TableError),

    #[error("No covariates were declared; at least one covariate column is required.")]
    NoCovariates,

    #[error(
        "Row {row} has label '{found}' in column '{column}', expected '{positive}' or '{negative}'."
    )]
    MalformedLabel {
        row: usize,
        column: String,
        found: String,
        positive: String,
        negative: String,
    },

    #[error("Row {row} has an empty small-area identifier.")]
    MissingAreaId { row: usize },

    #[error("Row {row} has an empty unit identifier.")]
    MissingUnitId { row: usize },

    #[error(
        "Only {found} complete observations remain, but at least {required} are required for a stable model."
    )]
    InsufficientRows { found: usize, required: usize },

    #[error("Invalid split fraction {0}; it must lie strictly between 0 and 1.")]
    InvalidFraction(f64),

    #[error("Cannot build {k} folds from {n} observations.")]
    InvalidFoldCount { k: usize, n: usize },

    #[error("Labels must contain both classes; found only '{0}'.")]
    SingleClass(String),

    #[error("Column lengths disagree: {0}")]
    ShapeMismatch(String),
}

/// A validated set of labeled units with their covariates.
#[derive(Debug, Clone)]
pub struct ObservationTable {
    pub ids: Vec<String>,
    pub lon: Array1<f64>,
    pub lat: Array1<f64>,
    pub x: Array1<f64>,
    pub y: Array1<f64>,
    /// 1.0 where irrigation is present, 0.0 where absent.
    pub labels: Array1<f64>,
    pub area_ids: Vec<String>,
    /// Shape: [n_units, covariate_names.len()].
    pub covariates: Array2<f64>,
    pub covariate_names: Vec<String>,
    /// Stacked probability at each unit, when the table carries one.
    pub spatial_score: Option<Array1<f64>>,
    /// Rows removed because at least one covariate was missing.
    pub dropped_rows: usize,
}

/// Feature matrix and labels for one partition of the observations.
#[derive(Debug, Clone)]
pub struct LabeledSet {
    pub features: Array2<f64>,
    pub labels: Array1<f64>,
    /// Row positions in the originating table.
    pub rows: Vec<usize>,
}

impl LabeledSet {
    pub fn from_rows(features: &Array2<f64>, labels: &Array1<f64>, rows: Vec<usize>) -> Self {
        Self {
            features: features.select(Axis(0), &rows),
            labels: labels.select(Axis(0), &rows),
            rows,
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

impl ObservationTable {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn positives(&self) -> usize {
        self.labels.iter().filter(|&&v| v > 0.5).count()
    }
}

/// Loads and validates the observation table at `path` against `config`.
pub fn load_observations(path: &Path, config: &StoreConfig) -> Result<ObservationTable, DataError> {
    if config.covariates.is_empty() {
        return Err(DataError::NoCovariates);
    }
    let df = files::read_tsv(path)?;

    let mut required: Vec<&str> = vec![ID_COLUMN, AREA_COLUMN, config.label_column.as_str()];
    required.extend(COORDINATE_COLUMNS);
    required.extend(config.covariates.iter().map(String::as_str));
    files::require_columns(&df, &required)?;
    log::info!("All required columns found: {required:?}");

    let raw_ids = files::string_column(&df, ID_COLUMN)?;
    let raw_areas = files::string_column(&df, AREA_COLUMN)?;
    let raw_labels = files::string_column(&df, &config.label_column)?;
    let coordinates = COORDINATE_COLUMNS
        .iter()
        .map(|name| files::numeric_column(&df, name))
        .collect::<Result<Vec<_>, _>>()?;
    let covariates = config
        .covariates
        .iter()
        .map(|name| files::nullable_numeric_column(&df, name))
        .collect::<Result<Vec<_>, _>>()?;
    let scores = if files::has_column(&df, SCORE_COLUMN) {
        Some(files::nullable_numeric_column(&df, SCORE_COLUMN)?)
    } else {
        None
    };

    let n_rows = df.height();
    let mut keep = Vec::with_capacity(n_rows);
    let mut ids = Vec::with_capacity(n_rows);
    let mut area_ids = Vec::with_capacity(n_rows);
    let mut labels = Vec::with_capacity(n_rows);
    for row in 0..n_rows {
        let label = parse_label(raw_labels[row].as_deref(), row + 1, config)?;
        let area = match raw_areas[row].as_deref() {
            Some(a) if !a.is_empty() => a.to_string(),
            _ => return Err(DataError::MissingAreaId { row: row + 1 }),
        };
        let id = match raw_ids[row].as_deref() {
            Some(a) if !a.is_empty() => a.to_string(),
            _ => return Err(DataError::MissingUnitId { row: row + 1 }),
        };
        let complete = covariates.iter().all(|column| column[row].is_some())
            && scores.as_ref().is_none_or(|s| s[row].is_some());
        if complete {
            keep.push(row);
            ids.push(id);
            area_ids.push(area);
            labels.push(label);
        }
    }

    let dropped_rows = n_rows - keep.len();
    if dropped_rows > 0 {
        log::warn!(
            "Dropped {dropped_rows} of {n_rows} observations with missing covariate values."
        );
    }
    if keep.len() < config.minimum_rows {
        return Err(DataError::InsufficientRows {
            found: keep.len(),
            required: config.minimum_rows,
        });
    }

    let pick = |column: &[f64]| Array1::from_iter(keep.iter().map(|&r| column[r]));
    let mut covariate_matrix = Array2::zeros((keep.len(), covariates.len()));
    for (j, column) in covariates.iter().enumerate() {
        for (i, &r) in keep.iter().enumerate() {
            covariate_matrix[[i, j]] = column[r].unwrap_or(f64::NAN);
        }
    }
    let spatial_score = scores
        .map(|s| Array1::from_iter(keep.iter().map(|&r| s[r].unwrap_or(f64::NAN))));

    let table = ObservationTable {
        ids,
        lon: pick(&coordinates[0]),
        lat: pick(&coordinates[1]),
        x: pick(&coordinates[2]),
        y: pick(&coordinates[3]),
        labels: Array1::from_vec(labels),
        area_ids,
        covariates: covariate_matrix,
        covariate_names: config.covariates.clone(),
        spatial_score,
        dropped_rows,
    };
    log::info!(
        "Observation table ready: {} units ({} present, {} absent) across {} covariates.",
        table.len(),
        table.positives(),
        table.len() - table.positives(),
        table.covariate_names.len()
    );
    Ok(table)
}

fn parse_label(raw: Option<&str>, row: usize, config: &StoreConfig) -> Result<f64, DataError> {
    match raw {
        Some(v) if v == config.positive_label => Ok(1.0),
        Some(v) if v == config.negative_label => Ok(0.0),
        other => Err(DataError::MalformedLabel {
            row,
            column: config.label_column.clone(),
            found: other.unwrap_or("").to_string(),
            positive: config.positive_label.clone(),
            negative: config.negative_label.clone(),
        }),
    }
}

/// Checks that `labels` is a 0/1 vector carrying both classes.
pub fn validate_binary_labels(labels: ArrayView1<f64>) -> Result<(usize, usize), DataError> {
    let mut positives = 0;
    let mut negatives = 0;
    for &v in labels {
        if v == 1.0 {
            positives += 1;
        } else if v == 0.0 {
            negatives += 1;
        } else {
            return Err(DataError::ShapeMismatch(format!(
                "label value {v} is neither 0 nor 1"
            )));
        }
    }
    match (positives, negatives) {
        (0, _) => Err(DataError::SingleClass("absent".to_string())),
        (_, 0) => Err(DataError::SingleClass("present".to_string())),
        counts => Ok(counts),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const HEADER: &str = "id\tlon\tlat\tx\ty\tirrigated\tarea_id\tndvi\tslope";

    fn config() -> StoreConfig {
        StoreConfig {
            covariates: vec!["ndvi".to_string(), "slope".to_string()],
            ..StoreConfig::default()
        }
    }

    fn create_table(rows: &[String]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{HEADER}").unwrap();
        for row in rows {
            writeln!(file, "{row}").unwrap();
        }
        file.flush().unwrap();
        file
    }

    fn generate_rows(n: usize) -> Vec<String> {
        (0..n)
            .map(|i| {
                format!(
                    "u{i}\t{:.3}\t{:.3}\t{:.1}\t{:.1}\t{}\tD{}\t{:.2}\t{:.1}",
                    32.0 + i as f64 * 0.01,
                    1.0 + i as f64 * 0.01,
                    1_000.0 * i as f64,
                    -500.0 * i as f64,
                    if i % 3 == 0 { "Y" } else { "N" },
                    i % 4,
                    0.1 + i as f64 / 100.0,
                    i as f64 / 2.0
                )
            })
            .collect()
    }

    #[test]
    fn loads_named_columns_in_declared_order() {
        let file = create_table(&generate_rows(30));
        let table = load_observations(file.path(), &config()).unwrap();
        assert_eq!(table.len(), 30);
        assert_eq!(table.covariates.shape(), &[30, 2]);
        assert_eq!(table.covariate_names, vec!["ndvi", "slope"]);
        assert_eq!(table.ids[4], "u4");
        assert_eq!(table.area_ids[5], "D1");
        assert_abs_diff_eq!(table.labels[0], 1.0);
        assert_abs_diff_eq!(table.labels[1], 0.0);
        assert_abs_diff_eq!(table.covariates[[10, 0]], 0.2, epsilon = 1e-9);
        assert_abs_diff_eq!(table.covariates[[10, 1]], 5.0, epsilon = 1e-9);
        assert_abs_diff_eq!(table.y[2], -1000.0, epsilon = 1e-9);
        assert_eq!(table.dropped_rows, 0);
        assert!(table.spatial_score.is_none());
    }

    #[test]
    fn rows_with_missing_covariates_are_dropped_and_counted() {
        let mut rows = generate_rows(30);
        rows[3] = "u3\t32.0\t1.0\t0.0\t0.0\tY\tD0\t\t1.0".to_string();
        rows[7] = "u7\t32.0\t1.0\t0.0\t0.0\tN\tD0\t0.3\tNA".to_string();
        let file = create_table(&rows);
        let table = load_observations(file.path(), &config()).unwrap();
        assert_eq!(table.len(), 28);
        assert_eq!(table.dropped_rows, 2);
        assert!(!table.ids.iter().any(|id| id == "u3" || id == "u7"));
        assert!(table.covariates.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn malformed_label_fails_fast() {
        let mut rows = generate_rows(30);
        rows[12] = "u12\t32.0\t1.0\t0.0\t0.0\tmaybe\tD0\t0.3\t1.0".to_string();
        let file = create_table(&rows);
        match load_observations(file.path(), &config()) {
            Err(DataError::MalformedLabel { row, found, .. }) => {
                assert_eq!(row, 13);
                assert_eq!(found, "maybe");
            }
            other => panic!("expected MalformedLabel, got {other:?}"),
        }
    }

    #[test]
    fn undeclared_covariate_column_is_rejected_by_name() {
        let file = create_table(&generate_rows(30));
        let mut cfg = config();
        cfg.covariates.push("rainfall".to_string());
        match load_observations(file.path(), &cfg) {
            Err(DataError::Table(TableError::ColumnNotFound(name))) => assert_eq!(name, "rainfall"),
            other => panic!("expected ColumnNotFound, got {other:?}"),
        }
    }

    #[test]
    fn too_few_complete_rows_is_an_error() {
        let file = create_table(&generate_rows(5));
        match load_observations(file.path(), &config()) {
            Err(DataError::InsufficientRows { found, required }) => {
                assert_eq!(found, 5);
                assert_eq!(required, 20);
            }
            other => panic!("expected InsufficientRows, got {other:?}"),
        }
    }

    #[test]
    fn binary_label_validation_requires_both_classes() {
        let labels = Array1::from_vec(vec![1.0, 1.0, 1.0]);
        assert!(matches!(
            validate_binary_labels(labels.view()),
            Err(DataError::SingleClass(_))
        ));
        let labels = Array1::from_vec(vec![1.0, 0.0, 0.0]);
        assert_eq!(validate_binary_labels(labels.view()).unwrap(), (1, 2));
    }
}
