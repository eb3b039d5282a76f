//! Single-band GeoTIFF rasters.
//!
//! Placement comes from the ModelPixelScale and ModelTiepoint tags and the
//! no-data value from GDAL_NODATA. Only north-up grids with square cells are
//! accepted. Striped files are decoded one strip at a time; tiled files are
//! decoded whole.

use super::grid::{DEFAULT_NODATA, GridGeometry, RasterError};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tiff::ColorType;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{TiffEncoder, colortype};
use tiff::tags::Tag;

const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const GEO_KEY_DIRECTORY: u16 = 34735;
const GDAL_NODATA: u16 = 42113;

/// GeoKey holding the raster type; value 1 is pixel-is-area, 2 pixel-is-point.
const GT_RASTER_TYPE: u32 = 1025;
const RASTER_PIXEL_IS_POINT: u32 = 2;

fn tag(code: u16) -> Tag {
    Tag::from_u16_exhaustive(code)
}

fn tiff_error(path: &str) -> impl FnOnce(tiff::TiffError) -> RasterError + '_ {
    move |source| RasterError::Tiff {
        path: path.to_string(),
        source,
    }
}

fn georeference_error(path: &str, message: impl Into<String>) -> RasterError {
    RasterError::Georeference {
        path: path.to_string(),
        message: message.into(),
    }
}

fn decoded_values(result: DecodingResult) -> Vec<f64> {
    match result {
        DecodingResult::U8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U64(v) => v.into_iter().map(|x| x as f64).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I64(v) => v.into_iter().map(|x| x as f64).collect(),
        DecodingResult::F32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::F64(v) => v,
    }
}

/// True when the GeoKey directory declares pixel-is-point.
fn pixel_is_point(keys: &[u32]) -> bool {
    // Header of four shorts, then (key, location, count, value) entries.
    keys.get(4..)
        .unwrap_or_default()
        .chunks_exact(4)
        .any(|entry| entry[0] == GT_RASTER_TYPE && entry[1] == 0 && entry[3] == RASTER_PIXEL_IS_POINT)
}

fn read_geometry(
    decoder: &mut Decoder<BufReader<File>>,
    path: &str,
) -> Result<GridGeometry, RasterError> {
    let (width, height) = decoder.dimensions().map_err(tiff_error(path))?;
    let scale = decoder
        .find_tag(tag(MODEL_PIXEL_SCALE))
        .map_err(tiff_error(path))?
        .ok_or_else(|| RasterError::MissingHeader {
            path: path.to_string(),
            key: "ModelPixelScale",
        })?
        .into_f64_vec()
        .map_err(tiff_error(path))?;
    let tiepoint = decoder
        .find_tag(tag(MODEL_TIEPOINT))
        .map_err(tiff_error(path))?
        .ok_or_else(|| RasterError::MissingHeader {
            path: path.to_string(),
            key: "ModelTiepoint",
        })?
        .into_f64_vec()
        .map_err(tiff_error(path))?;
    let keys = match decoder.find_tag(tag(GEO_KEY_DIRECTORY)).map_err(tiff_error(path))? {
        Some(value) => value.into_u32_vec().map_err(tiff_error(path))?,
        None => Vec::new(),
    };
    let nodata = match decoder.find_tag(tag(GDAL_NODATA)).map_err(tiff_error(path))? {
        Some(value) => {
            let text = value.into_string().map_err(tiff_error(path))?;
            let text = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
            text.parse::<f64>()
                .map_err(|e| georeference_error(path, format!("GDAL_NODATA '{text}': {e}")))?
        }
        None => DEFAULT_NODATA,
    };

    let &[sx, sy, ..] = scale.as_slice() else {
        return Err(georeference_error(path, "ModelPixelScale needs two values"));
    };
    let &[i, j, _, x, y, ..] = tiepoint.as_slice() else {
        return Err(georeference_error(path, "ModelTiepoint needs six values"));
    };
    if !(sx > 0.0 && sy > 0.0) {
        return Err(georeference_error(path, format!("pixel scale ({sx}, {sy}) is not positive")));
    }
    if (sx - sy).abs() > 1e-9 * sx.max(sy) {
        return Err(georeference_error(path, format!("cells are not square ({sx} x {sy})")));
    }
    let offset = if pixel_is_point(&keys) { 0.5 } else { 0.0 };
    let nrows = height as usize;
    let top = y + (j + offset) * sy;
    Ok(GridGeometry {
        ncols: width as usize,
        nrows,
        xll: x - (i + offset) * sx,
        yll: top - nrows as f64 * sy,
        cellsize: sx,
        nodata,
    })
}

/// Row-by-row reader for single-band GeoTIFF files.
pub struct GeoTiffReader {
    path: String,
    decoder: Decoder<BufReader<File>>,
    geometry: GridGeometry,
    striped: bool,
    /// Strips decoded so far; a tiled image counts as one.
    next_strip: u32,
    pending: VecDeque<f64>,
    rows_read: usize,
}

impl GeoTiffReader {
    pub fn open(path: &Path) -> Result<Self, RasterError> {
        let display = path.display().to_string();
        let file = File::open(path).map_err(|source| RasterError::Io {
            path: display.clone(),
            source,
        })?;
        let mut decoder = Decoder::new(BufReader::new(file)).map_err(tiff_error(&display))?;
        match decoder.colortype().map_err(tiff_error(&display))? {
            ColorType::Gray(_) => {}
            other => {
                return Err(georeference_error(
                    &display,
                    format!("expected one band per file, found {other:?}"),
                ));
            }
        }
        let geometry = read_geometry(&mut decoder, &display)?;
        let striped = decoder
            .find_tag(Tag::TileWidth)
            .map_err(tiff_error(&display))?
            .is_none();
        Ok(Self {
            path: display,
            decoder,
            geometry,
            striped,
            next_strip: 0,
            pending: VecDeque::new(),
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

    fn decode_more(&mut self) -> Result<(), RasterError> {
        let decoded = match (self.striped, self.next_strip) {
            (true, strip) => self.decoder.read_chunk(strip),
            (false, 0) => self.decoder.read_image(),
            (false, _) => return Err(self.truncated()),
        };
        self.next_strip += 1;
        let values = decoded_values(decoded.map_err(tiff_error(&self.path))?);
        if values.is_empty() {
            return Err(self.truncated());
        }
        self.pending.extend(values);
        Ok(())
    }

    /// Fills `row` with the next grid row, mapping no-data to `NaN`.
    pub fn next_row_into(&mut self, row: &mut [f64]) -> Result<(), RasterError> {
        let ncols = self.geometry.ncols;
        if self.rows_read >= self.geometry.nrows || row.len() != ncols {
            return Err(self.truncated());
        }
        while self.pending.len() < ncols {
            self.decode_more()?;
        }
        let nodata = self.geometry.nodata;
        for (dst, v) in row.iter_mut().zip(self.pending.drain(..ncols)) {
            *dst = if v == nodata { f64::NAN } else { v };
        }
        self.rows_read += 1;
        Ok(())
    }
}

/// Writes one band as a 64-bit float GeoTIFF.
///
/// Rows are held in memory and the file is encoded by `finish`.
pub struct GeoTiffWriter {
    path: String,
    geometry: GridGeometry,
    values: Vec<f64>,
    rows_written: usize,
}

impl GeoTiffWriter {
    pub fn create(path: &Path, geometry: GridGeometry) -> Result<Self, RasterError> {
        let display = path.display().to_string();
        // Created empty here; encoded by `finish`.
        File::create(path).map_err(|source| RasterError::Io {
            path: display.clone(),
            source,
        })?;
        Ok(Self {
            path: display,
            geometry,
            values: Vec::with_capacity(geometry.cell_count()),
            rows_written: 0,
        })
    }

    pub fn geometry(&self) -> GridGeometry {
        self.geometry
    }

    /// Appends one row; `NaN` becomes the no-data value.
    pub fn write_row(&mut self, values: impl IntoIterator<Item = f64>) -> Result<(), RasterError> {
        let nodata = self.geometry.nodata;
        let before = self.values.len();
        self.values
            .extend(values.into_iter().map(|v| if v.is_nan() { nodata } else { v }));
        if self.values.len() - before != self.geometry.ncols {
            return Err(RasterError::ShapeMismatch {
                found: (1, self.values.len() - before),
                expected: (1, self.geometry.ncols),
            });
        }
        self.rows_written += 1;
        Ok(())
    }

    /// Encodes the buffered rows into the file.
    pub fn finish(&mut self) -> Result<(), RasterError> {
        let g = self.geometry;
        if self.rows_written != g.nrows {
            return Err(RasterError::Truncated {
                path: self.path.clone(),
                expected: g.nrows,
                found: self.rows_written,
            });
        }
        let path = self.path.as_str();
        let file = File::create(path).map_err(|source| RasterError::Io {
            path: path.to_string(),
            source,
        })?;
        let mut encoder = TiffEncoder::new(BufWriter::new(file)).map_err(tiff_error(path))?;
        let mut image = encoder
            .new_image::<colortype::Gray64Float>(g.ncols as u32, g.nrows as u32)
            .map_err(tiff_error(path))?;
        let scale = [g.cellsize, g.cellsize, 0.0];
        let tiepoint = [0.0, 0.0, 0.0, g.xll, g.yll + g.nrows as f64 * g.cellsize, 0.0];
        let keys: [u16; 8] = [1, 1, 0, 1, GT_RASTER_TYPE as u16, 0, 1, 1];
        let nodata = g.nodata.to_string();
        let directory = image.encoder();
        directory
            .write_tag(tag(MODEL_PIXEL_SCALE), &scale[..])
            .map_err(tiff_error(path))?;
        directory
            .write_tag(tag(MODEL_TIEPOINT), &tiepoint[..])
            .map_err(tiff_error(path))?;
        directory
            .write_tag(tag(GEO_KEY_DIRECTORY), &keys[..])
            .map_err(tiff_error(path))?;
        directory
            .write_tag(tag(GDAL_NODATA), nodata.as_str())
            .map_err(tiff_error(path))?;
        image.write_data(&self.values).map_err(tiff_error(path))?;
        log::debug!("Wrote GeoTIFF '{path}' ({} x {} cells)", g.nrows, g.ncols);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::grid::Grid;
    use ndarray::{Array2, array};
    use tempfile::tempdir;

    fn geometry() -> GridGeometry {
        GridGeometry {
            ncols: 3,
            nrows: 2,
            xll: 500_000.0,
            yll: 4_100_000.0,
            cellsize: 30.0,
            nodata: -32768.0,
        }
    }

    #[test]
    fn geotiff_keeps_placement_and_no_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("band.tif");
        let grid = Grid::new(geometry(), array![[0.25, f64::NAN, 3.0], [4.0, 5.5, -1.0]]).unwrap();
        grid.write(&path).unwrap();

        let back = Grid::read(&path).unwrap();
        assert_eq!(back.geometry, grid.geometry);
        assert!(back.values[[0, 1]].is_nan());
        assert_eq!(back.values[[0, 0]], 0.25);
        assert_eq!(back.values[[1, 2]], -1.0);
        assert_eq!(back.value_at(500_075.0, 4_100_015.0), Some(-1.0));
    }

    #[test]
    fn reader_streams_rows_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seq.tif");
        let g = GridGeometry {
            ncols: 4,
            nrows: 7,
            ..geometry()
        };
        let values = Array2::from_shape_fn((7, 4), |(r, c)| (r * 4 + c) as f64);
        Grid::new(g, values.clone()).unwrap().write(&path).unwrap();

        let mut reader = GeoTiffReader::open(&path).unwrap();
        let mut row = vec![0.0; 4];
        for r in 0..7 {
            reader.next_row_into(&mut row).unwrap();
            assert_eq!(row, values.row(r).to_vec());
        }
        assert!(matches!(
            reader.next_row_into(&mut row),
            Err(RasterError::Truncated { expected: 7, found: 7, .. })
        ));
    }

    #[test]
    fn plain_tiff_without_georeference_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plain.tif");
        let file = File::create(&path).unwrap();
        let mut encoder = TiffEncoder::new(BufWriter::new(file)).unwrap();
        encoder
            .write_image::<colortype::Gray32Float>(2, 2, &[1.0, 2.0, 3.0, 4.0])
            .unwrap();
        drop(encoder);

        assert!(matches!(
            GeoTiffReader::open(&path),
            Err(RasterError::MissingHeader { key: "ModelPixelScale", .. })
        ));
    }

    #[test]
    fn pixel_is_point_shifts_by_half_a_cell() {
        assert!(pixel_is_point(&[1, 1, 0, 1, GT_RASTER_TYPE, 0, 1, 2]));
        assert!(!pixel_is_point(&[1, 1, 0, 1, GT_RASTER_TYPE, 0, 1, 1]));
        assert!(!pixel_is_point(&[]));
    }

    #[test]
    fn incomplete_writer_is_reported() {
        let dir = tempdir().unwrap();
        let mut writer = GeoTiffWriter::create(&dir.path().join("short.tif"), geometry()).unwrap();
        writer.write_row([1.0, 2.0, 3.0]).unwrap();
        assert!(matches!(
            writer.finish(),
            Err(RasterError::Truncated { expected: 2, found: 1, .. })
        ));
    }
}
