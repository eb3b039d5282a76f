pub mod geotiff;
pub mod grid;
pub mod mask;
pub mod progress;
pub mod scorer;
pub mod zonal;
pub use grid::{
    Grid, GridFileSet, GridFileSource, GridGeometry, RasterError, RasterFormat, RasterStack,
    RowBlockSink, RowBlockSource,
};
pub use mask::{RoiMask, ThresholdRule};
pub use scorer::{ScoreOptions, ScoreSummary, score_stack, score_stream};
