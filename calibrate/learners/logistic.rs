//! Ridge-penalized logistic regression fitted by iteratively reweighted least
//! squares with step halving.
//!
//! Features are standardized internally; the intercept is not penalized. The
//! same learner serves as the stacking meta-learner.

use super::{FittedLearner, LearnerError, ProbabilisticClassifier, ProbabilityModel, sigmoid};
use super::select_by_cross_validation;
use crate::calibrate::folds::Folds;
use crate::shared::faer_ndarray::FaerCholesky;
use faer::Side;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use serde::{Deserialize, Serialize};

const MIN_WEIGHT: f64 = 1e-6;
const PROB_EPS: f64 = 1e-8;
const MAX_STEP_HALVINGS: usize = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogisticSpec {
    /// Candidate ridge penalties, chosen by cross-validated log-loss.
    pub penalties: Vec<f64>,
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for LogisticSpec {
    fn default() -> Self {
        Self {
            penalties: vec![1e-4, 1e-3, 1e-2, 1e-1, 1.0, 10.0],
            max_iterations: 100,
            tolerance: 1e-8,
        }
    }
}

/// How the final IRLS loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IrlsStatus {
    Converged,
    /// Step halving could not reduce the objective further.
    StalledAtValidMinimum,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogisticModel {
    pub penalty: f64,
    pub intercept: f64,
    /// Coefficients on the standardized features.
    pub coefficients: Vec<f64>,
    pub means: Vec<f64>,
    pub scales: Vec<f64>,
    pub iterations: usize,
    pub status: IrlsStatus,
}

impl LogisticModel {
    /// Coefficients expressed on the original feature scale.
    pub fn raw_coefficients(&self) -> Vec<f64> {
        self.coefficients
            .iter()
            .zip(&self.scales)
            .map(|(b, s)| b / s)
            .collect()
    }

    fn linear_predictor(&self, features: ArrayView2<f64>) -> Array1<f64> {
        let mut eta = Array1::from_elem(features.nrows(), self.intercept);
        for (j, column) in features.axis_iter(Axis(1)).enumerate() {
            let (mean, scale, beta) = (self.means[j], self.scales[j], self.coefficients[j]);
            Zip::from(&mut eta)
                .and(&column)
                .for_each(|e, &x| *e += beta * (x - mean) / scale);
        }
        eta
    }
}

impl ProbabilityModel for LogisticModel {
    fn predict_proba(&self, features: ArrayView2<f64>) -> Array1<f64> {
        self.linear_predictor(features).mapv(sigmoid)
    }
}

impl LogisticSpec {
    /// Selects the penalty on `folds` and refits on all rows.
    pub fn fit_model(
        &self,
        features: ArrayView2<f64>,
        labels: ArrayView1<f64>,
        folds: &Folds,
    ) -> Result<LogisticModel, LearnerError> {
        let (penalty, loss) = select_by_cross_validation(
            "regularized_logistic",
            &self.penalties,
            features,
            labels,
            folds,
            |penalty, x, y, held_out| {
                let model = fit_ridge_logistic(x, y, penalty, self.max_iterations, self.tolerance)?;
                Ok(model.predict_proba(held_out))
            },
        )?;
        log::info!("regularized_logistic: selected penalty {penalty} (CV log-loss {loss:.4})");
        fit_ridge_logistic(features, labels, penalty, self.max_iterations, self.tolerance)
    }
}

impl ProbabilisticClassifier for LogisticSpec {
    fn name(&self) -> &'static str {
        "regularized_logistic"
    }

    fn fit(
        &self,
        features: ArrayView2<f64>,
        labels: ArrayView1<f64>,
        folds: &Folds,
        _: u64,
    ) -> Result<FittedLearner, LearnerError> {
        Ok(FittedLearner::RegularizedLogistic(self.fit_model(features, labels, folds)?))
    }
}

/// IRLS weights and working response for the current linear predictor.
fn glm_working_vectors(y: ArrayView1<f64>, eta: &Array1<f64>) -> (Array1<f64>, Array1<f64>) {
    let eta_clamped = eta.mapv(|e| e.clamp(-700.0, 700.0));
    let mu = eta_clamped.mapv(|e| sigmoid(e).clamp(PROB_EPS, 1.0 - PROB_EPS));
    let weights = (&mu * &mu.mapv(|m| 1.0 - m)).mapv(|v| v.max(MIN_WEIGHT));
    let z = &eta_clamped + &((&y - &mu) / &weights);
    (weights, z)
}

fn penalized_objective(y: ArrayView1<f64>, eta: &Array1<f64>, beta: &Array1<f64>, penalty: f64) -> f64 {
    let nll: f64 = Zip::from(y).and(eta).fold(0.0, |acc, &yi, &e| {
        let p = sigmoid(e).clamp(PROB_EPS, 1.0 - PROB_EPS);
        acc - (yi * p.ln() + (1.0 - yi) * (1.0 - p).ln())
    });
    let ridge: f64 = beta.iter().skip(1).map(|b| b * b).sum();
    nll + 0.5 * penalty * ridge
}

fn standardize(features: ArrayView2<f64>) -> (Array2<f64>, Vec<f64>, Vec<f64>) {
    let n = features.nrows();
    let p = features.ncols();
    let mut design = Array2::ones((n, p + 1));
    let mut means = Vec::with_capacity(p);
    let mut scales = Vec::with_capacity(p);
    for (j, column) in features.axis_iter(Axis(1)).enumerate() {
        let mean = column.mean().unwrap_or(0.0);
        let sd = column.std(0.0);
        let scale = if sd > 1e-12 { sd } else { 1.0 };
        design
            .column_mut(j + 1)
            .assign(&column.mapv(|x| (x - mean) / scale));
        means.push(mean);
        scales.push(scale);
    }
    (design, means, scales)
}

/// Fits a ridge logistic regression for one penalty value.
pub fn fit_ridge_logistic(
    features: ArrayView2<f64>,
    labels: ArrayView1<f64>,
    penalty: f64,
    max_iterations: usize,
    tolerance: f64,
) -> Result<LogisticModel, LearnerError> {
    let n = features.nrows();
    if n == 0 || labels.len() != n {
        return Err(LearnerError::InvalidInput(format!(
            "{n} feature rows against {} labels",
            labels.len()
        )));
    }
    let (design, means, scales) = standardize(features);
    let dim = design.ncols();

    let prevalence = labels.mean().unwrap_or(0.5).clamp(0.01, 0.99);
    let mut beta = Array1::<f64>::zeros(dim);
    beta[0] = (prevalence / (1.0 - prevalence)).ln();
    let mut eta = design.dot(&beta);
    let mut objective = penalized_objective(labels, &eta, &beta, penalty);

    let mut status = None;
    let mut iterations = 0;
    while iterations < max_iterations {
        iterations += 1;
        let (weights, z) = glm_working_vectors(labels, &eta);
        let weighted = &design * &weights.view().insert_axis(Axis(1));
        let mut gram = design.t().dot(&weighted);
        for j in 1..dim {
            gram[[j, j]] += penalty;
        }
        let rhs = weighted.t().dot(&z);
        let proposal = gram.cholesky(Side::Lower)?.solve_vec(&rhs);
        if proposal.iter().any(|v| !v.is_finite()) {
            return Err(LearnerError::Unstable(format!(
                "non-finite coefficients at iteration {iterations} (penalty {penalty})"
            )));
        }

        let direction = &proposal - &beta;
        let mut step = 1.0;
        let mut accepted = None;
        for _ in 0..MAX_STEP_HALVINGS {
            let candidate = &beta + &(&direction * step);
            let candidate_eta = design.dot(&candidate);
            let candidate_objective = penalized_objective(labels, &candidate_eta, &candidate, penalty);
            if candidate_objective.is_finite() && candidate_objective <= objective {
                accepted = Some((candidate, candidate_eta, candidate_objective));
                break;
            }
            step *= 0.5;
        }
        let Some((next_beta, next_eta, next_objective)) = accepted else {
            log::debug!("IRLS stalled at iteration {iterations} with objective {objective:.6}");
            status = Some(IrlsStatus::StalledAtValidMinimum);
            break;
        };

        let change = (objective - next_objective).abs() / (next_objective.abs() + 0.1);
        beta = next_beta;
        eta = next_eta;
        objective = next_objective;
        if change < tolerance {
            status = Some(IrlsStatus::Converged);
            break;
        }
    }

    let Some(status) = status else {
        log::warn!("IRLS reached {max_iterations} iterations without converging (penalty {penalty})");
        return Err(LearnerError::DidNotConverge {
            iterations: max_iterations,
            detail: format!("ridge penalty {penalty}"),
        });
    };

    Ok(LogisticModel {
        penalty,
        intercept: beta[0],
        coefficients: beta.iter().skip(1).copied().collect(),
        means,
        scales,
        iterations,
        status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibrate::learners::test_support::noisy_linear;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn recovers_known_coefficients() {
        let mut rng = StdRng::seed_from_u64(3);
        let n = 4000;
        let mut x = Array2::zeros((n, 1));
        let mut y = Array1::zeros(n);
        for i in 0..n {
            let v: f64 = rng.gen_range(-2.0..2.0);
            x[[i, 0]] = v;
            let p = sigmoid(-0.5 + 1.2 * v);
            y[i] = if rng.gen_range(0.0..1.0) < p { 1.0 } else { 0.0 };
        }
        let model = fit_ridge_logistic(x.view(), y.view(), 1e-6, 100, 1e-10).unwrap();
        assert_eq!(model.status, IrlsStatus::Converged);
        let slope = model.raw_coefficients()[0];
        let intercept = model.intercept - slope * model.means[0];
        assert_abs_diff_eq!(slope, 1.2, epsilon = 0.15);
        assert_abs_diff_eq!(intercept, -0.5, epsilon = 0.15);
    }

    #[test]
    fn separable_data_stays_finite_under_ridge() {
        let x = array![[-2.0], [-1.0], [1.0], [2.0]];
        let y = array![0.0, 0.0, 1.0, 1.0];
        let model = fit_ridge_logistic(x.view(), y.view(), 0.1, 100, 1e-8).unwrap();
        assert!(model.coefficients[0].is_finite());
        let p = model.predict_proba(x.view());
        assert!(p[0] < 0.5 && p[3] > 0.5);
    }

    #[test]
    fn larger_penalty_shrinks_the_slope() {
        let (x, y) = noisy_linear(200, 8);
        let weak = fit_ridge_logistic(x.view(), y.view(), 1e-4, 100, 1e-8).unwrap();
        let strong = fit_ridge_logistic(x.view(), y.view(), 10.0, 100, 1e-8).unwrap();
        assert!(strong.coefficients[0].abs() < weak.coefficients[0].abs());
    }

    #[test]
    fn exhausted_iterations_are_an_error() {
        let (x, y) = noisy_linear(120, 7);
        match fit_ridge_logistic(x.view(), y.view(), 1e-6, 1, 1e-10) {
            Err(LearnerError::DidNotConverge { iterations, .. }) => assert_eq!(iterations, 1),
            other => panic!("expected DidNotConverge, got {other:?}"),
        }
    }

    #[test]
    fn constant_feature_does_not_break_standardization() {
        let x = array![[1.0, 0.0], [1.0, 1.0], [1.0, 2.0], [1.0, 3.0]];
        let y = array![0.0, 1.0, 0.0, 1.0];
        let model = fit_ridge_logistic(x.view(), y.view(), 1.0, 50, 1e-8).unwrap();
        assert_eq!(model.scales[0], 1.0);
        assert!(model.predict_proba(x.view()).iter().all(|p| p.is_finite()));
    }
}
