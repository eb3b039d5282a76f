//! Bagged classification trees (random forest).

use super::tree::{RegressionTree, TreeParams, mean_leaf};
use super::{FittedLearner, LearnerError, ProbabilisticClassifier, ProbabilityModel};
use super::select_by_cross_validation;
use crate::calibrate::folds::Folds;
use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForestSpec {
    pub trees: usize,
    /// Candidate minimum leaf sizes, chosen by cross-validated log-loss.
    pub min_leaf_grid: Vec<usize>,
    pub max_depth: usize,
    /// Features tried per split; defaults to the square root of the feature count.
    pub max_features: Option<usize>,
}

impl Default for ForestSpec {
    fn default() -> Self {
        Self {
            trees: 200,
            min_leaf_grid: vec![1, 5, 10],
            max_depth: 32,
            max_features: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForestModel {
    pub min_leaf: usize,
    pub trees: Vec<RegressionTree>,
}

impl ProbabilityModel for ForestModel {
    fn predict_proba(&self, features: ArrayView2<f64>) -> Array1<f64> {
        let n_trees = self.trees.len().max(1) as f64;
        let rows: Vec<f64> = features
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|row| {
                let total: f64 = self.trees.iter().map(|t| t.predict_row(row)).sum();
                (total / n_trees).clamp(0.0, 1.0)
            })
            .collect();
        Array1::from_vec(rows)
    }
}

impl ForestSpec {
    fn grow(
        &self,
        features: ArrayView2<f64>,
        labels: ArrayView1<f64>,
        min_leaf: usize,
        seed: u64,
    ) -> Result<ForestModel, LearnerError> {
        let n = features.nrows();
        if n == 0 {
            return Err(LearnerError::InvalidInput("no training rows".to_string()));
        }
        let p = features.ncols();
        let mtry = self
            .max_features
            .unwrap_or_else(|| (p as f64).sqrt().round() as usize)
            .clamp(1, p.max(1));
        let params = TreeParams {
            max_depth: self.max_depth,
            min_leaf,
            max_features: Some(mtry),
        };
        let target = labels.to_vec();
        let leaf = mean_leaf(&target);

        let trees = (0..self.trees)
            .into_par_iter()
            .map(|t| {
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add((t as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)));
                let bootstrap: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
                RegressionTree::fit(features, &target, bootstrap, params, &mut rng, &leaf)
            })
            .collect();
        Ok(ForestModel { min_leaf, trees })
    }
}

impl ProbabilisticClassifier for ForestSpec {
    fn name(&self) -> &'static str {
        "bagged_trees"
    }

    fn fit(
        &self,
        features: ArrayView2<f64>,
        labels: ArrayView1<f64>,
        folds: &Folds,
        seed: u64,
    ) -> Result<FittedLearner, LearnerError> {
        let (min_leaf, loss) = select_by_cross_validation(
            self.name(),
            &self.min_leaf_grid,
            features,
            labels,
            folds,
            |min_leaf, x, y, held_out| Ok(self.grow(x, y, min_leaf, seed)?.predict_proba(held_out)),
        )?;
        log::info!(
            "{}: selected minimum leaf size {min_leaf} (CV log-loss {loss:.4})",
            self.name()
        );
        Ok(FittedLearner::BaggedTrees(self.grow(features, labels, min_leaf, seed)?))
    }
}
