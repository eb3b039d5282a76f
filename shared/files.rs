//! # Tabular File Access
//!
//! Every tab-separated input in the pipeline (survey observations, point
//! lists, poststratification tables) is read through this module so that
//! schema validation behaves identically everywhere: columns are addressed by
//! name only, types are checked on conversion, and non-finite numbers are
//! rejected instead of being carried into the statistical core.

use polars::prelude::*;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TableError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),

    #[error("Failed to open '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),

    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },

    #[error(
        "Missing or null values were found in the required column '{0}'. This column must be complete."
    )]
    MissingValuesFound(String),

    #[error("Non-finite values (NaN or Infinity) were found in the column '{0}'.")]
    NonFiniteValuesFound(String),

    #[error("Failed to write table '{path}': {source}")]
    WriteError {
        path: String,
        #[source]
        source: csv::Error,
    },
}

/// Reads a tab-separated file with a header row. `NA` and empty fields are nulls.
pub fn read_tsv(path: &Path) -> Result<DataFrame, TableError> {
    let file = File::open(path).map_err(|source| TableError::IoError {
        path: path.display().to_string(),
        source,
    })?;
    let df = CsvReader::new(file)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(
                    CsvParseOptions::default()
                        .with_separator(b'\t')
                        .with_null_values(Some(NullValues::AllColumnsSingle("NA".into()))),
                ),
        )
        .finish()?;
    log::info!(
        "Loaded '{}' ({} rows, {} columns)",
        path.display(),
        df.height(),
        df.width()
    );
    Ok(df)
}

pub fn has_column(df: &DataFrame, name: &str) -> bool {
    df.get_column_names().iter().any(|c| c.as_str() == name)
}

/// Fails with the first column in `names` that the frame does not carry.
pub fn require_columns<S: AsRef<str>>(df: &DataFrame, names: &[S]) -> Result<(), TableError> {
    for name in names {
        if !has_column(df, name.as_ref()) {
            return Err(TableError::ColumnNotFound(name.as_ref().to_string()));
        }
    }
    Ok(())
}

/// Numeric column where nulls are allowed and reported as `None`.
///
/// A value that is present but cannot be read as a number is a type error, as
/// is a present value that is NaN or infinite.
pub fn nullable_numeric_column(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>, TableError> {
    let column = df
        .column(name)
        .map_err(|_| TableError::ColumnNotFound(name.to_string()))?;
    let original_nulls = column.null_count();
    let casted = column
        .cast(&DataType::Float64)
        .map_err(|_| TableError::ColumnWrongType {
            column_name: name.to_string(),
            expected_type: "f64 (numeric)",
            found_type: format!("{:?}", column.dtype()),
        })?;
    if casted.null_count() > original_nulls {
        return Err(TableError::ColumnWrongType {
            column_name: name.to_string(),
            expected_type: "f64 (numeric)",
            found_type: format!("{:?}", column.dtype()),
        });
    }
    let values: Vec<Option<f64>> = casted.f64()?.into_iter().collect();
    if values.iter().flatten().any(|v| !v.is_finite()) {
        return Err(TableError::NonFiniteValuesFound(name.to_string()));
    }
    Ok(values)
}

/// Numeric column that must be complete.
pub fn numeric_column(df: &DataFrame, name: &str) -> Result<Vec<f64>, TableError> {
    nullable_numeric_column(df, name)?
        .into_iter()
        .map(|v| v.ok_or_else(|| TableError::MissingValuesFound(name.to_string())))
        .collect()
}

/// Text column; numeric columns are rendered through their string form.
pub fn string_column(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>, TableError> {
    let column = df
        .column(name)
        .map_err(|_| TableError::ColumnNotFound(name.to_string()))?;
    let casted = column
        .cast(&DataType::String)
        .map_err(|_| TableError::ColumnWrongType {
            column_name: name.to_string(),
            expected_type: "string",
            found_type: format!("{:?}", column.dtype()),
        })?;
    let values = casted
        .str()?
        .into_iter()
        .map(|v| v.map(|s| s.trim().to_string()))
        .collect();
    Ok(values)
}

/// Buffered tab-separated writer used for every tabular output.
pub struct TsvWriter {
    path: String,
    writer: csv::Writer<File>,
}

impl TsvWriter {
    pub fn create<S: AsRef<str>>(path: &Path, header: &[S]) -> Result<Self, TableError> {
        let display = path.display().to_string();
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_path(path)
            .map_err(|source| TableError::WriteError {
                path: display.clone(),
                source,
            })?;
        writer
            .write_record(header.iter().map(|h| h.as_ref()))
            .map_err(|source| TableError::WriteError {
                path: display.clone(),
                source,
            })?;
        Ok(Self {
            path: display,
            writer,
        })
    }

    pub fn write_row<S: AsRef<str>>(&mut self, fields: &[S]) -> Result<(), TableError> {
        self.writer
            .write_record(fields.iter().map(|f| f.as_ref()))
            .map_err(|source| TableError::WriteError {
                path: self.path.clone(),
                source,
            })
    }

    pub fn finish(mut self) -> Result<(), TableError> {
        self.writer.flush().map_err(|e| TableError::WriteError {
            path: self.path.clone(),
            source: e.into(),
        })
    }
}

/// Formats a float for table output; missing values are written as `NA`.
pub fn format_value(value: Option<f64>) -> String {
    match value {
        Some(v) if v.is_finite() => format!("{v:.6}"),
        _ => "NA".to_string(),
    }
}
