//! Gradient-boosted trees on the Bernoulli deviance.
//!
//! Each round fits a shallow least-squares tree to the residuals `y - p` and
//! replaces its leaves by one Newton step, `sum(y - p) / sum(p (1 - p))`.

use super::tree::{RegressionTree, TreeParams};
use super::{FittedLearner, LearnerError, ProbabilisticClassifier, ProbabilityModel, sigmoid};
use super::select_by_cross_validation;
use crate::calibrate::folds::Folds;
use ndarray::{Array1, ArrayView1, ArrayView2, Zip};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index;
use serde::{Deserialize, Serialize};

const MAX_LEAF_STEP: f64 = 4.0;
const MIN_HESSIAN: f64 = 1e-12;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BoostingSpec {
    /// Candidate numbers of boosting rounds, chosen by cross-validated log-loss.
    pub rounds_grid: Vec<usize>,
    pub learning_rate: f64,
    pub max_depth: usize,
    pub min_leaf: usize,
    /// Fraction of rows drawn without replacement for each round.
    pub subsample: f64,
}

impl Default for BoostingSpec {
    fn default() -> Self {
        Self {
            rounds_grid: vec![50, 100, 200],
            learning_rate: 0.1,
            max_depth: 3,
            min_leaf: 5,
            subsample: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoostedTreesModel {
    pub initial_score: f64,
    pub learning_rate: f64,
    pub trees: Vec<RegressionTree>,
}

impl BoostedTreesModel {
    fn raw_scores(&self, features: ArrayView2<f64>) -> Array1<f64> {
        let mut scores = Array1::from_elem(features.nrows(), self.initial_score);
        Zip::from(&mut scores)
            .and(features.rows())
            .par_for_each(|s, row| {
                *s += self.learning_rate * self.trees.iter().map(|t| t.predict_row(row)).sum::<f64>();
            });
        scores
    }
}

impl ProbabilityModel for BoostedTreesModel {
    fn predict_proba(&self, features: ArrayView2<f64>) -> Array1<f64> {
        self.raw_scores(features).mapv(sigmoid)
    }
}

impl BoostingSpec {
    fn boost(
        &self,
        features: ArrayView2<f64>,
        labels: ArrayView1<f64>,
        rounds: usize,
        seed: u64,
    ) -> Result<BoostedTreesModel, LearnerError> {
        let n = features.nrows();
        if n == 0 {
            return Err(LearnerError::InvalidInput("no training rows".to_string()));
        }
        if !(self.subsample > 0.0 && self.subsample <= 1.0) {
            return Err(LearnerError::InvalidInput(format!(
                "subsample fraction {} is outside (0, 1]",
                self.subsample
            )));
        }
        let prevalence = labels.mean().unwrap_or(0.5).clamp(1e-6, 1.0 - 1e-6);
        let initial_score = (prevalence / (1.0 - prevalence)).ln();
        let params = TreeParams {
            max_depth: self.max_depth,
            min_leaf: self.min_leaf,
            max_features: None,
        };
        let sample_size = ((self.subsample * n as f64).round() as usize).clamp(1, n);
        let mut rng = StdRng::seed_from_u64(seed);

        let mut scores = Array1::from_elem(n, initial_score);
        let mut trees = Vec::with_capacity(rounds);
        for _ in 0..rounds {
            let probabilities = scores.mapv(sigmoid);
            let residuals: Vec<f64> = Zip::from(labels)
                .and(&probabilities)
                .map_collect(|&y, &p| y - p)
                .to_vec();
            let hessians: Vec<f64> = probabilities.iter().map(|p| p * (1.0 - p)).collect();
            let newton_leaf = |rows: &[usize]| {
                let g: f64 = rows.iter().map(|&r| residuals[r]).sum();
                let h: f64 = rows.iter().map(|&r| hessians[r]).sum();
                (g / h.max(MIN_HESSIAN)).clamp(-MAX_LEAF_STEP, MAX_LEAF_STEP)
            };
            let rows = if sample_size < n {
                index::sample(&mut rng, n, sample_size).into_vec()
            } else {
                (0..n).collect()
            };
            let tree = RegressionTree::fit(features, &residuals, rows, params, &mut rng, &newton_leaf);
            Zip::from(&mut scores)
                .and(features.rows())
                .for_each(|s, row| *s += self.learning_rate * tree.predict_row(row));
            trees.push(tree);
        }
        if scores.iter().any(|s| !s.is_finite()) {
            return Err(LearnerError::Unstable("boosted scores became non-finite".to_string()));
        }
        Ok(BoostedTreesModel {
            initial_score,
            learning_rate: self.learning_rate,
            trees,
        })
    }
}

impl ProbabilisticClassifier for BoostingSpec {
    fn name(&self) -> &'static str {
        "boosted_trees"
    }

    fn fit(
        &self,
        features: ArrayView2<f64>,
        labels: ArrayView1<f64>,
        folds: &Folds,
        seed: u64,
    ) -> Result<FittedLearner, LearnerError> {
        let (rounds, loss) = select_by_cross_validation(
            self.name(),
            &self.rounds_grid,
            features,
            labels,
            folds,
            |rounds, x, y, held_out| Ok(self.boost(x, y, rounds, seed)?.predict_proba(held_out)),
        )?;
        log::info!("{}: selected {rounds} rounds (CV log-loss {loss:.4})", self.name());
        Ok(FittedLearner::BoostedTrees(self.boost(features, labels, rounds, seed)?))
    }
}
