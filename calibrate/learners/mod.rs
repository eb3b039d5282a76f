//! # Probabilistic Binary Classifiers
//!
//! Every base learner, and the meta-learner that stacks them, is reached
//! through the same two traits:
//!
//! - [`ProbabilisticClassifier`] turns a learner specification plus training
//!   data into a fitted model, selecting the learner's own hyperparameters by
//!   k-fold cross-validation on the folds it is handed.
//! - [`ProbabilityModel`] scores a feature matrix, returning one probability in
//!   `[0, 1]` per row.
//!
//! Concrete learners are variants of [`LearnerSpec`] and [`FittedLearner`], so
//! the ensemble never needs to know which family it is talking to, and a
//! fitted ensemble can be serialized as a plain tagged structure.

pub mod boosting;
pub mod forest;
pub mod logistic;
pub mod tree;

use crate::calibrate::diagnostics::log_loss_sum;
use crate::calibrate::folds::Folds;
use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use thiserror::Error;

pub use boosting::{BoostedTreesModel, BoostingSpec};
pub use forest::{ForestModel, ForestSpec};
pub use logistic::{LogisticModel, LogisticSpec};

#[derive(Error, Debug)]
pub enum LearnerError {
    #[error("Fitting became numerically unstable: {0}")]
    Unstable(String),

    #[error("Fitting did not converge within {iterations} iterations ({detail}).")]
    DidNotConverge { iterations: usize, detail: String },

    #[error("The hyperparameter grid for '{0}' is empty.")]
    EmptyGrid(String),

    #[error("Training data is unusable: {0}")]
    InvalidInput(String),

    #[error("Linear algebra failure: {0}")]
    Linalg(#[from] crate::shared::faer_ndarray::FaerLinalgError),
}

/// Scores rows of a feature matrix.
pub trait ProbabilityModel {
    fn predict_proba(&self, features: ArrayView2<f64>) -> Array1<f64>;
}

/// Fits a probability model, choosing its hyperparameters on `folds`.
pub trait ProbabilisticClassifier: Sync {
    fn name(&self) -> &'static str;

    fn fit(
        &self,
        features: ArrayView2<f64>,
        labels: ArrayView1<f64>,
        folds: &Folds,
        seed: u64,
    ) -> Result<FittedLearner, LearnerError>;
}

/// Configured base learner, as written in the pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LearnerSpec {
    RegularizedLogistic(LogisticSpec),
    BaggedTrees(ForestSpec),
    BoostedTrees(BoostingSpec),
}

impl LearnerSpec {
    /// Regularized linear, bagged trees and boosted trees with their default grids.
    pub fn default_set() -> Vec<LearnerSpec> {
        vec![
            LearnerSpec::RegularizedLogistic(LogisticSpec::default()),
            LearnerSpec::BaggedTrees(ForestSpec::default()),
            LearnerSpec::BoostedTrees(BoostingSpec::default()),
        ]
    }

    fn classifier(&self) -> &dyn ProbabilisticClassifier {
        match self {
            LearnerSpec::RegularizedLogistic(spec) => spec,
            LearnerSpec::BaggedTrees(spec) => spec,
            LearnerSpec::BoostedTrees(spec) => spec,
        }
    }
}

impl ProbabilisticClassifier for LearnerSpec {
    fn name(&self) -> &'static str {
        self.classifier().name()
    }

    fn fit(
        &self,
        features: ArrayView2<f64>,
        labels: ArrayView1<f64>,
        folds: &Folds,
        seed: u64,
    ) -> Result<FittedLearner, LearnerError> {
        self.classifier().fit(features, labels, folds, seed)
    }
}

/// A trained base learner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FittedLearner {
    RegularizedLogistic(LogisticModel),
    BaggedTrees(ForestModel),
    BoostedTrees(BoostedTreesModel),
}

impl ProbabilityModel for FittedLearner {
    fn predict_proba(&self, features: ArrayView2<f64>) -> Array1<f64> {
        match self {
            FittedLearner::RegularizedLogistic(model) => model.predict_proba(features),
            FittedLearner::BaggedTrees(model) => model.predict_proba(features),
            FittedLearner::BoostedTrees(model) => model.predict_proba(features),
        }
    }
}

#[inline]
pub(crate) fn sigmoid(eta: f64) -> f64 {
    1.0 / (1.0 + (-eta.clamp(-700.0, 700.0)).exp())
}

/// Picks the grid value with the lowest pooled out-of-fold log-loss.
///
/// Folds are evaluated in parallel. `fit_predict` receives the candidate, the
/// training rows and the held-out features, and returns held-out
/// probabilities. Ties keep the earlier grid entry.
pub(crate) fn select_by_cross_validation<P, F>(
    learner: &str,
    grid: &[P],
    features: ArrayView2<f64>,
    labels: ArrayView1<f64>,
    folds: &Folds,
    fit_predict: F,
) -> Result<(P, f64), LearnerError>
where
    P: Copy + Send + Sync + Debug,
    F: Fn(P, ArrayView2<f64>, ArrayView1<f64>, ArrayView2<f64>) -> Result<Array1<f64>, LearnerError>
        + Sync,
{
    let mut best: Option<(P, f64)> = None;
    for &candidate in grid {
        let per_fold: Vec<Result<(f64, usize), LearnerError>> = (0..folds.k())
            .into_par_iter()
            .map(|fold| {
                let (train, test) = folds.split(fold);
                if test.is_empty() {
                    return Ok((0.0, 0));
                }
                let x_train = features.select(Axis(0), &train);
                let y_train = labels.select(Axis(0), &train);
                let x_test = features.select(Axis(0), &test);
                let y_test = labels.select(Axis(0), &test);
                let predicted = fit_predict(candidate, x_train.view(), y_train.view(), x_test.view())?;
                Ok((log_loss_sum(y_test.view(), predicted.view()), test.len()))
            })
            .collect();

        let mut total = 0.0;
        let mut count = 0;
        for outcome in per_fold {
            let (loss, n) = outcome?;
            total += loss;
            count += n;
        }
        let loss = total / count.max(1) as f64;
        log::debug!("{learner}: candidate {candidate:?} cross-validated log-loss {loss:.5}");
        if best.is_none_or(|(_, best_loss)| loss < best_loss) {
            best = Some((candidate, loss));
        }
    }
    best.ok_or_else(|| LearnerError::EmptyGrid(learner.to_string()))
}

#[cfg(test)]
pub(crate) mod test_support {
    use ndarray::{Array1, Array2};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Two Gaussian covariates; the label is 1 when a noisy linear score is positive.
    pub fn noisy_linear(n: usize, seed: u64) -> (Array2<f64>, Array1<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut x = Array2::zeros((n, 2));
        let mut y = Array1::zeros(n);
        for i in 0..n {
            let a: f64 = rng.gen_range(-2.0..2.0);
            let b: f64 = rng.gen_range(-2.0..2.0);
            let noise: f64 = rng.gen_range(-0.5..0.5);
            x[[i, 0]] = a;
            x[[i, 1]] = b;
            y[i] = if 1.5 * a - 0.5 * b + noise > 0.0 { 1.0 } else { 0.0 };
        }
        (x, y)
    }
}
