//! Raster grids, band stacks and streaming grid I/O.
//!
//! Files ending in `.tif` or `.tiff` are GeoTIFF; anything else is read and
//! written as an ESRI ASCII grid. No-data cells are carried as `NaN` in memory
//! and written back with the grid's declared no-data value.

use super::geotiff::{GeoTiffReader, GeoTiffWriter};
use ndarray::{Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Lines, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_NODATA: f64 = -9999.0;

#[derive(Debug, Error)]
pub enum RasterError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("malformed grid '{path}' at line {line}: {message}")]
    Parse {
        path: String,
        line: usize,
        message: String,
    },
    #[error("grid '{path}' is missing the '{key}' header")]
    MissingHeader { path: String, key: &'static str },
    #[error("grid '{path}' ended after {found} of {expected} rows")]
    Truncated {
        path: String,
        expected: usize,
        found: usize,
    },
    #[error("band '{0}' does not share the stack's grid geometry")]
    GeometryMismatch(String),
    #[error("no band named '{0}' in the raster stack")]
    UnknownBand(String),
    #[error("grid data has shape {found:?}, geometry expects {expected:?}")]
    ShapeMismatch {
        found: (usize, usize),
        expected: (usize, usize),
    },
    #[error("a raster stack needs at least one band")]
    EmptyStack,
    #[error("TIFF error in '{path}': {source}")]
    Tiff {
        path: String,
        #[source]
        source: tiff::TiffError,
    },
    #[error("unusable georeferencing in '{path}': {message}")]
    Georeference { path: String, message: String },
}

fn io_error(path: &str) -> impl FnOnce(io::Error) -> RasterError + '_ {
    move |source| RasterError::Io {
        path: path.to_string(),
        source,
    }
}

/// On-disk raster encodings, chosen by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RasterFormat {
    AsciiGrid,
    GeoTiff,
}

impl RasterFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("tif") || ext.eq_ignore_ascii_case("tiff") => {
                Self::GeoTiff
            }
            _ => Self::AsciiGrid,
        }
    }
}

/// Placement and size of a north-up grid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridGeometry {
    pub ncols: usize,
    pub nrows: usize,
    /// Lower-left corner of the lower-left cell.
    pub xll: f64,
    pub yll: f64,
    pub cellsize: f64,
    pub nodata: f64,
}

impl GridGeometry {
    pub fn cell_count(&self) -> usize {
        self.ncols * self.nrows
    }

    pub fn cell_area(&self) -> f64 {
        self.cellsize * self.cellsize
    }

    /// Centre of the cell at `(row, col)`; row 0 is the northern edge.
    pub fn cell_center(&self, row: usize, col: usize) -> (f64, f64) {
        (
            self.xll + (col as f64 + 0.5) * self.cellsize,
            self.yll + (self.nrows as f64 - row as f64 - 0.5) * self.cellsize,
        )
    }

    /// The cell containing `(x, y)`, if the point falls on the grid.
    pub fn cell_at(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        let col = ((x - self.xll) / self.cellsize).floor();
        let from_bottom = ((y - self.yll) / self.cellsize).floor();
        if !(col >= 0.0 && from_bottom >= 0.0) {
            return None;
        }
        let (col, from_bottom) = (col as usize, from_bottom as usize);
        if col >= self.ncols || from_bottom >= self.nrows {
            return None;
        }
        Some((self.nrows - 1 - from_bottom, col))
    }

    pub fn same_layout(&self, other: &GridGeometry) -> bool {
        let tol = 1e-9 * self.cellsize.abs().max(1.0);
        self.ncols == other.ncols
            && self.nrows == other.nrows
            && (self.xll - other.xll).abs() <= tol
            && (self.yll - other.yll).abs() <= tol
            && (self.cellsize - other.cellsize).abs() <= tol
    }
}

/// One raster band held in memory.
#[derive(Debug, Clone)]
pub struct Grid {
    pub geometry: GridGeometry,
    /// Shape: [nrows, ncols]; `NaN` marks no-data.
    pub values: Array2<f64>,
}

impl Grid {
    pub fn new(geometry: GridGeometry, values: Array2<f64>) -> Result<Self, RasterError> {
        if values.dim() != (geometry.nrows, geometry.ncols) {
            return Err(RasterError::ShapeMismatch {
                found: values.dim(),
                expected: (geometry.nrows, geometry.ncols),
            });
        }
        Ok(Self { geometry, values })
    }

    pub fn filled(geometry: GridGeometry, value: f64) -> Self {
        Self {
            geometry,
            values: Array2::from_elem((geometry.nrows, geometry.ncols), value),
        }
    }

    /// Nearest-cell value at a point; `None` off the grid or on no-data.
    pub fn value_at(&self, x: f64, y: f64) -> Option<f64> {
        let (row, col) = self.geometry.cell_at(x, y)?;
        let v = self.values[[row, col]];
        (!v.is_nan()).then_some(v)
    }

    /// Reads a grid in the format its extension names.
    pub fn read(path: &Path) -> Result<Self, RasterError> {
        let mut reader = BandReader::open(path)?;
        let geometry = reader.geometry();
        let mut values = Array2::zeros((geometry.nrows, geometry.ncols));
        for mut row in values.axis_iter_mut(Axis(0)) {
            let slice = row
                .as_slice_mut()
                .ok_or_else(|| RasterError::GeometryMismatch(path.display().to_string()))?;
            reader.next_row_into(slice)?;
        }
        log::debug!(
            "Read grid '{}' ({} x {} cells)",
            path.display(),
            geometry.nrows,
            geometry.ncols
        );
        Ok(Self { geometry, values })
    }

    /// Writes the grid in the format its extension names.
    pub fn write(&self, path: &Path) -> Result<(), RasterError> {
        let mut writer = BandWriter::create(path, self.geometry)?;
        for row in self.values.axis_iter(Axis(0)) {
            writer.write_row(row.iter().copied())?;
        }
        writer.finish()
    }
}

/// Named bands sharing one geometry.
#[derive(Debug, Clone)]
pub struct RasterStack {
    geometry: GridGeometry,
    names: Vec<String>,
    bands: Vec<Grid>,
}

impl RasterStack {
    pub fn from_bands(bands: Vec<(String, Grid)>) -> Result<Self, RasterError> {
        let geometry = bands.first().ok_or(RasterError::EmptyStack)?.1.geometry;
        let mut names = Vec::with_capacity(bands.len());
        let mut grids = Vec::with_capacity(bands.len());
        for (name, grid) in bands {
            if !grid.geometry.same_layout(&geometry) {
                return Err(RasterError::GeometryMismatch(name));
            }
            names.push(name);
            grids.push(grid);
        }
        Ok(Self {
            geometry,
            names,
            bands: grids,
        })
    }

    /// Reads one grid file per `(name, path)` pair.
    pub fn read(bands: &[(String, PathBuf)]) -> Result<Self, RasterError> {
        let grids = bands
            .iter()
            .map(|(name, path)| Ok((name.clone(), Grid::read(path)?)))
            .collect::<Result<Vec<_>, RasterError>>()?;
        Self::from_bands(grids)
    }

    pub fn geometry(&self) -> GridGeometry {
        self.geometry
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn band(&self, name: &str) -> Result<&Grid, RasterError> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| &self.bands[i])
            .ok_or_else(|| RasterError::UnknownBand(name.to_string()))
    }

    /// Nearest-cell values of every band at each point. Shape: [points, bands];
    /// off-grid points and no-data cells yield `NaN`.
    pub fn extract(&self, points: &[(f64, f64)]) -> Array2<f64> {
        let mut out = Array2::from_elem((points.len(), self.bands.len()), f64::NAN);
        for (i, &(x, y)) in points.iter().enumerate() {
            if let Some((row, col)) = self.geometry.cell_at(x, y) {
                for (j, band) in self.bands.iter().enumerate() {
                    out[[i, j]] = band.values[[row, col]];
                }
            }
        }
        out
    }
}

/// A block of whole grid rows, one matrix row per cell and one column per band.
#[derive(Debug, Clone)]
pub struct CellBlock {
    pub first_row: usize,
    pub rows: usize,
    /// Shape: [rows * ncols, bands], cells in row-major order.
    pub values: Array2<f64>,
}

/// Supplies a multi-band grid a few rows at a time.
pub trait RowBlockSource {
    fn geometry(&self) -> GridGeometry;
    fn band_names(&self) -> &[String];
    /// Returns `None` once every row has been delivered.
    fn next_block(&mut self, max_rows: usize) -> Result<Option<CellBlock>, RasterError>;
}

/// Receives per-cell outputs a few rows at a time.
pub trait RowBlockSink {
    /// `values` has shape [rows * ncols, outputs].
    fn write_block(&mut self, first_row: usize, values: ArrayView2<f64>) -> Result<(), RasterError>;
    fn finish(&mut self) -> Result<(), RasterError>;
}

/// Row blocks read from an in-memory stack.
pub struct StackSource<'a> {
    stack: &'a RasterStack,
    next_row: usize,
}

impl<'a> StackSource<'a> {
    pub fn new(stack: &'a RasterStack) -> Self {
        Self { stack, next_row: 0 }
    }
}

impl RowBlockSource for StackSource<'_> {
    fn geometry(&self) -> GridGeometry {
        self.stack.geometry
    }

    fn band_names(&self) -> &[String] {
        &self.stack.names
    }

    fn next_block(&mut self, max_rows: usize) -> Result<Option<CellBlock>, RasterError> {
        let geometry = self.stack.geometry;
        if self.next_row >= geometry.nrows {
            return Ok(None);
        }
        let rows = max_rows.max(1).min(geometry.nrows - self.next_row);
        let mut values = Array2::zeros((rows * geometry.ncols, self.stack.bands.len()));
        for (b, band) in self.stack.bands.iter().enumerate() {
            for r in 0..rows {
                for c in 0..geometry.ncols {
                    values[[r * geometry.ncols + c, b]] = band.values[[self.next_row + r, c]];
                }
            }
        }
        let block = CellBlock {
            first_row: self.next_row,
            rows,
            values,
        };
        self.next_row += rows;
        Ok(Some(block))
    }
}

/// Row-by-row reader over either on-disk format.
pub enum BandReader {
    Ascii(AsciiGridReader),
    GeoTiff(GeoTiffReader),
}

impl BandReader {
    pub fn open(path: &Path) -> Result<Self, RasterError> {
        Ok(match RasterFormat::from_path(path) {
            RasterFormat::AsciiGrid => Self::Ascii(AsciiGridReader::open(path)?),
            RasterFormat::GeoTiff => Self::GeoTiff(GeoTiffReader::open(path)?),
        })
    }

    pub fn geometry(&self) -> GridGeometry {
        match self {
            Self::Ascii(reader) => reader.geometry(),
            Self::GeoTiff(reader) => reader.geometry(),
        }
    }

    pub fn next_row_into(&mut self, row: &mut [f64]) -> Result<(), RasterError> {
        match self {
            Self::Ascii(reader) => reader.next_row_into(row),
            Self::GeoTiff(reader) => reader.next_row_into(row),
        }
    }
}

/// Row-by-row writer for either on-disk format.
pub enum BandWriter {
    Ascii(AsciiGridWriter),
    GeoTiff(GeoTiffWriter),
}

impl BandWriter {
    pub fn create(path: &Path, geometry: GridGeometry) -> Result<Self, RasterError> {
        Ok(match RasterFormat::from_path(path) {
            RasterFormat::AsciiGrid => Self::Ascii(AsciiGridWriter::create(path, geometry)?),
            RasterFormat::GeoTiff => Self::GeoTiff(GeoTiffWriter::create(path, geometry)?),
        })
    }

    fn geometry(&self) -> GridGeometry {
        match self {
            Self::Ascii(writer) => writer.geometry,
            Self::GeoTiff(writer) => writer.geometry(),
        }
    }

    pub fn write_row(&mut self, values: impl IntoIterator<Item = f64>) -> Result<(), RasterError> {
        match self {
            Self::Ascii(writer) => writer.write_row(values),
            Self::GeoTiff(writer) => writer.write_row(values),
        }
    }

    pub fn finish(&mut self) -> Result<(), RasterError> {
        match self {
            Self::Ascii(writer) => writer.finish(),
            Self::GeoTiff(writer) => writer.finish(),
        }
    }
}

/// Row blocks streamed from one grid file per band.
pub struct GridFileSource {
    geometry: GridGeometry,
    names: Vec<String>,
    readers: Vec<BandReader>,
    next_row: usize,
    row_buffer: Vec<f64>,
}

impl GridFileSource {
    pub fn open(bands: &[(String, PathBuf)]) -> Result<Self, RasterError> {
        let mut readers = Vec::with_capacity(bands.len());
        let mut names = Vec::with_capacity(bands.len());
        for (name, path) in bands {
            readers.push(BandReader::open(path)?);
            names.push(name.clone());
        }
        let geometry = readers.first().ok_or(RasterError::EmptyStack)?.geometry();
        for (name, reader) in names.iter().zip(&readers) {
            if !reader.geometry().same_layout(&geometry) {
                return Err(RasterError::GeometryMismatch(name.clone()));
            }
        }
        Ok(Self {
            geometry,
            names,
            readers,
            next_row: 0,
            row_buffer: vec![0.0; geometry.ncols],
        })
    }
}

impl RowBlockSource for GridFileSource {
    fn geometry(&self) -> GridGeometry {
        self.geometry
    }

    fn band_names(&self) -> &[String] {
        &self.names
    }

    fn next_block(&mut self, max_rows: usize) -> Result<Option<CellBlock>, RasterError> {
        let ncols = self.geometry.ncols;
        if self.next_row >= self.geometry.nrows {
            return Ok(None);
        }
        let rows = max_rows.max(1).min(self.geometry.nrows - self.next_row);
        let mut values = Array2::zeros((rows * ncols, self.readers.len()));
        for r in 0..rows {
            for (b, reader) in self.readers.iter_mut().enumerate() {
                reader.next_row_into(&mut self.row_buffer)?;
                for (c, &v) in self.row_buffer.iter().enumerate() {
                    values[[r * ncols + c, b]] = v;
                }
            }
        }
        let block = CellBlock {
            first_row: self.next_row,
            rows,
            values,
        };
        self.next_row += rows;
        Ok(Some(block))
    }
}

/// Writes each output column to its own grid file.
pub struct GridFileSet {
    writers: Vec<BandWriter>,
}

impl GridFileSet {
    pub fn create(paths: &[PathBuf], geometry: GridGeometry) -> Result<Self, RasterError> {
        let writers = paths
            .iter()
            .map(|p| BandWriter::create(p, geometry))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { writers })
    }
}

impl RowBlockSink for GridFileSet {
    fn write_block(&mut self, _: usize, values: ArrayView2<f64>) -> Result<(), RasterError> {
        for (j, writer) in self.writers.iter_mut().enumerate() {
            let ncols = writer.geometry().ncols;
            let column = values.column(j);
            for chunk in column.to_vec().chunks(ncols) {
                writer.write_row(chunk.iter().copied())?;
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), RasterError> {
        self.writers.iter_mut().try_for_each(BandWriter::finish)
    }
}

/// Collects each output column into an in-memory grid.
pub struct GridCollector {
    geometry: GridGeometry,
    outputs: Vec<Array2<f64>>,
}

impl GridCollector {
    pub fn new(geometry: GridGeometry, outputs: usize) -> Self {
        Self {
            geometry,
            outputs: (0..outputs)
                .map(|_| Array2::from_elem((geometry.nrows, geometry.ncols), f64::NAN))
                .collect(),
        }
    }

    pub fn into_grids(self) -> Vec<Grid> {
        let geometry = self.geometry;
        self.outputs
            .into_iter()
            .map(|values| Grid { geometry, values })
            .collect()
    }
}

impl RowBlockSink for GridCollector {
    fn write_block(&mut self, first_row: usize, values: ArrayView2<f64>) -> Result<(), RasterError> {
        let ncols = self.geometry.ncols;
        for (j, grid) in self.outputs.iter_mut().enumerate() {
            for (cell, &v) in values.column(j).iter().enumerate() {
                grid[[first_row + cell / ncols, cell % ncols]] = v;
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), RasterError> {
        Ok(())
    }
}

/// Row-by-row reader for ESRI ASCII grids.
pub struct AsciiGridReader {
    path: String,
    lines: Lines<BufReader<File>>,
    line_no: usize,
    pending: Vec<f64>,
    geometry: GridGeometry,
    rows_read: usize,
}

fn parse_number(path: &str, line: usize, token: &str) -> Result<f64, RasterError> {
    token.parse::<f64>().map_err(|e| RasterError::Parse {
        path: path.to_string(),
        line,
        message: format!("'{token}': {e}"),
    })
}

impl AsciiGridReader {
    pub fn open(path: &Path) -> Result<Self, RasterError> {
        let display = path.display().to_string();
        let file = File::open(path).map_err(io_error(&display))?;
        let mut lines = BufReader::new(file).lines();

        let mut ncols = None;
        let mut nrows = None;
        let mut xll = None;
        let mut yll = None;
        let mut cellsize = None;
        let mut nodata = DEFAULT_NODATA;
        let mut centered = (false, false);
        let mut line_no = 0;
        let mut pending = Vec::new();

        for line in lines.by_ref() {
            let line = line.map_err(io_error(&display))?;
            line_no += 1;
            let mut tokens = line.split_whitespace();
            let Some(key) = tokens.next() else { continue };
            if !key.starts_with(|c: char| c.is_ascii_alphabetic()) {
                for token in line.split_whitespace() {
                    pending.push(parse_number(&display, line_no, token)?);
                }
                break;
            }
            let value = tokens.next().ok_or_else(|| RasterError::Parse {
                path: display.clone(),
                line: line_no,
                message: format!("header '{key}' has no value"),
            })?;
            let value = parse_number(&display, line_no, value)?;
            match key.to_ascii_lowercase().as_str() {
                "ncols" => ncols = Some(value as usize),
                "nrows" => nrows = Some(value as usize),
                "xllcorner" => xll = Some(value),
                "xllcenter" => {
                    xll = Some(value);
                    centered.0 = true;
                }
                "yllcorner" => yll = Some(value),
                "yllcenter" => {
                    yll = Some(value);
                    centered.1 = true;
                }
                "cellsize" => cellsize = Some(value),
                "nodata_value" => nodata = value,
                other => {
                    return Err(RasterError::Parse {
                        path: display,
                        line: line_no,
                        message: format!("unknown header '{other}'"),
                    });
                }
            }
        }

        let missing = |key| RasterError::MissingHeader {
            path: display.clone(),
            key,
        };
        let cellsize = cellsize.ok_or_else(|| missing("cellsize"))?;
        let mut xll = xll.ok_or_else(|| missing("xllcorner"))?;
        let mut yll = yll.ok_or_else(|| missing("yllcorner"))?;
        if centered.0 {
            xll -= 0.5 * cellsize;
        }
        if centered.1 {
            yll -= 0.5 * cellsize;
        }
        let geometry = GridGeometry {
            ncols: ncols.ok_or_else(|| missing("ncols"))?,
            nrows: nrows.ok_or_else(|| missing("nrows"))?,
            xll,
            yll,
            cellsize,
            nodata,
        };
        Ok(Self {
            path: display,
            lines,
            line_no,
            pending,
            geometry,
            rows_read: 0,
        })
    }

    pub fn geometry(&self) -> GridGeometry {
        self.geometry
    }

    fn truncated(&self) -> RasterError {
        RasterError::Truncated {
            path: self.path.clone(),
            expected: self.geometry.nrows,
            found: self.rows_read,
        }
    }

    /// Fills `row` with the next grid row, mapping no-data to `NaN`.
    pub fn next_row_into(&mut self, row: &mut [f64]) -> Result<(), RasterError> {
        let ncols = self.geometry.ncols;
        if self.rows_read >= self.geometry.nrows || row.len() != ncols {
            return Err(self.truncated());
        }
        while self.pending.len() < ncols {
            let Some(line) = self.lines.next() else {
                return Err(self.truncated());
            };
            let line = line.map_err(io_error(&self.path))?;
            self.line_no += 1;
            for token in line.split_whitespace() {
                self.pending.push(parse_number(&self.path, self.line_no, token)?);
            }
        }
        for (dst, v) in row.iter_mut().zip(self.pending.drain(..ncols)) {
            *dst = if v == self.geometry.nodata { f64::NAN } else { v };
        }
        self.rows_read += 1;
        Ok(())
    }
}

/// Row-by-row writer for ESRI ASCII grids.
pub struct AsciiGridWriter {
    path: String,
    writer: BufWriter<File>,
    geometry: GridGeometry,
    rows_written: usize,
}

impl AsciiGridWriter {
    pub fn create(path: &Path, geometry: GridGeometry) -> Result<Self, RasterError> {
        let display = path.display().to_string();
        let file = File::create(path).map_err(io_error(&display))?;
        let mut writer = BufWriter::new(file);
        write!(
            writer,
            "ncols {}\nnrows {}\nxllcorner {}\nyllcorner {}\ncellsize {}\nNODATA_value {}\n",
            geometry.ncols, geometry.nrows, geometry.xll, geometry.yll, geometry.cellsize, geometry.nodata
        )
        .map_err(io_error(&display))?;
        Ok(Self {
            path: display,
            writer,
            geometry,
            rows_written: 0,
        })
    }

    /// Writes one row; `NaN` becomes the no-data value.
    pub fn write_row(&mut self, values: impl IntoIterator<Item = f64>) -> Result<(), RasterError> {
        let mut line = String::with_capacity(self.geometry.ncols * 10);
        for (i, v) in values.into_iter().enumerate() {
            if i > 0 {
                line.push(' ');
            }
            let v = if v.is_nan() { self.geometry.nodata } else { v };
            line.push_str(&v.to_string());
        }
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .map_err(io_error(&self.path))?;
        self.rows_written += 1;
        Ok(())
    }

    /// Flushes the file and checks that every row was written.
    pub fn finish(&mut self) -> Result<(), RasterError> {
        self.writer.flush().map_err(io_error(&self.path))?;
        if self.rows_written != self.geometry.nrows {
            return Err(RasterError::Truncated {
                path: self.path.clone(),
                expected: self.geometry.nrows,
                found: self.rows_written,
            });
        }
        Ok(())
    }
}
