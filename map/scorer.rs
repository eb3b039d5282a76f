//! Applies a trained ensemble to every cell of a covariate stack.
//!
//! The stack is consumed in blocks of grid rows so the full covariate stack
//! never has to be resident. Within a block, complete cells are scored in
//! parallel chunks; a cell outside the mask or with any missing covariate
//! yields no-data in every output, never zero.

use crate::calibrate::model::{ModelError, TrainedEnsemble};
use crate::map::grid::{Grid, RasterError, RasterStack, RowBlockSink, RowBlockSource, GridCollector, StackSource};
use crate::map::mask::RoiMask;
use crate::map::progress::{ScoreProgressObserver, ScoreProgressStage};
use ndarray::{Array2, Axis, s};
use rayon::prelude::*;
use thiserror::Error;

pub const STACKED_OUTPUT: &str = "stacked";

#[derive(Debug, Error)]
pub enum ScoreError {
    #[error(transparent)]
    Raster(#[from] RasterError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("the region-of-interest mask does not share the covariate grid geometry")]
    MaskMismatch,
}

#[derive(Debug, Clone, Copy)]
pub struct ScoreOptions {
    /// Grid rows read per block.
    pub block_rows: usize,
    /// Cells per parallel scoring task.
    pub chunk_cells: usize,
}

impl Default for ScoreOptions {
    fn default() -> Self {
        Self {
            block_rows: 64,
            chunk_cells: 4096,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScoreSummary {
    pub scored_cells: usize,
    /// Cells with at least one missing covariate.
    pub nodata_cells: usize,
    /// Cells outside the region of interest.
    pub masked_cells: usize,
}

/// Output band names: one per base learner, then the stacked model.
pub fn output_names(ensemble: &TrainedEnsemble) -> Vec<String> {
    let mut names = ensemble.learner_names();
    names.push(STACKED_OUTPUT.to_string());
    names
}

/// Scores every block `source` yields and hands the outputs to `sink`.
pub fn score_stream<S, K>(
    ensemble: &TrainedEnsemble,
    source: &mut S,
    sink: &mut K,
    mask: Option<&RoiMask>,
    options: ScoreOptions,
    progress: &mut dyn ScoreProgressObserver,
) -> Result<ScoreSummary, ScoreError>
where
    S: RowBlockSource + ?Sized,
    K: RowBlockSink + ?Sized,
{
    let geometry = source.geometry();
    if mask.is_some_and(|m| !m.geometry().same_layout(&geometry)) {
        return Err(ScoreError::MaskMismatch);
    }
    let order = ensemble.column_order(source.band_names())?;
    let n_outputs = ensemble.base_learners.len() + 1;
    let ncols = geometry.ncols;
    let mut summary = ScoreSummary::default();

    progress.on_stage_start(ScoreProgressStage::Scoring, geometry.nrows);
    while let Some(block) = source.next_block(options.block_rows)? {
        let mut complete = Vec::with_capacity(block.values.nrows());
        for (cell, values) in block.values.axis_iter(Axis(0)).enumerate() {
            let (row, col) = (block.first_row + cell / ncols, cell % ncols);
            if mask.is_some_and(|m| !m.is_eligible(row, col)) {
                summary.masked_cells += 1;
            } else if order.iter().any(|&b| values[b].is_nan()) {
                summary.nodata_cells += 1;
            } else {
                complete.push(cell);
            }
        }

        let mut outputs = Array2::from_elem((block.values.nrows(), n_outputs), f64::NAN);
        if !complete.is_empty() {
            let features = block.values.select(Axis(0), &complete).select(Axis(1), &order);
            let chunks = features
                .axis_chunks_iter(Axis(0), options.chunk_cells.max(1))
                .into_par_iter()
                .map(|chunk| ensemble.predict(chunk))
                .collect::<Result<Vec<_>, ModelError>>()?;
            let mut at = 0;
            for prediction in chunks {
                let n = prediction.stacked.len();
                for (k, &cell) in complete[at..at + n].iter().enumerate() {
                    outputs
                        .slice_mut(s![cell, ..n_outputs - 1])
                        .assign(&prediction.base.row(k));
                    outputs[[cell, n_outputs - 1]] = prediction.stacked[k];
                }
                at += n;
            }
            summary.scored_cells += complete.len();
        }
        sink.write_block(block.first_row, outputs.view())?;
        progress.on_stage_advance(ScoreProgressStage::Scoring, block.first_row + block.rows);
    }
    sink.finish()?;
    progress.on_stage_finish(ScoreProgressStage::Scoring);

    log::info!(
        "Scored {} cells ({} with missing covariates, {} outside the region of interest)",
        summary.scored_cells,
        summary.nodata_cells,
        summary.masked_cells
    );
    Ok(summary)
}

/// Probability surfaces held in memory, named as [`output_names`].
#[derive(Debug, Clone)]
pub struct ProbabilitySurfaces {
    pub names: Vec<String>,
    pub grids: Vec<Grid>,
    pub summary: ScoreSummary,
}

impl ProbabilitySurfaces {
    pub fn stacked(&self) -> Option<&Grid> {
        self.names
            .iter()
            .position(|n| n == STACKED_OUTPUT)
            .map(|i| &self.grids[i])
    }
}

/// Scores an in-memory stack.
pub fn score_stack(
    ensemble: &TrainedEnsemble,
    stack: &RasterStack,
    mask: Option<&RoiMask>,
    options: ScoreOptions,
    progress: &mut dyn ScoreProgressObserver,
) -> Result<ProbabilitySurfaces, ScoreError> {
    let names = output_names(ensemble);
    let mut source = StackSource::new(stack);
    let mut collector = GridCollector::new(stack.geometry(), names.len());
    let summary = score_stream(ensemble, &mut source, &mut collector, mask, options, progress)?;
    Ok(ProbabilitySurfaces {
        names,
        grids: collector.into_grids(),
        summary,
    })
}
