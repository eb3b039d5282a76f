//! # Two-Level Binomial Regression
//!
//! Units are nested in small areas. For unit `j` in area `i`,
//!
//! ```text
//! logit P(y_ij = 1) = (β0 + u_i) + (β1 + v_i) · s_ij
//! ```
//!
//! where `s_ij` is the spatial score. With [`RandomEffects::Intercept`] only
//! `u_i ~ N(0, τ²)` is present; with [`RandomEffects::InterceptAndSlope`]
//! `(u_i, v_i) ~ MVN(0, Σ)`.
//!
//! The random effects are integrated out with a Laplace approximation around
//! each area's conditional mode, found by damped Newton iterations. The
//! resulting marginal likelihood is maximized with BFGS over an unconstrained
//! parameterization:
//!
//! - intercept only: `[β0, β1, log τ]`
//! - intercept and slope: `[β0, β1, log σ_u, log σ_v, atanh ρ]`
//!
//! Non-convergence of the optimizer is an error. A model that converged onto
//! a boundary (vanishing variance, correlation near ±1, flat likelihood) is
//! returned with [`FitReliability::Degenerate`] so the caller can fall back.

use crate::calibrate::data::ObservationTable;
use crate::calibrate::learners::logistic::fit_ridge_logistic;
use crate::mrp::posterior::PosteriorConfig;
use crate::shared::faer_ndarray::FaerCholesky;
use ahash::AHashMap;
use faer::Side;
use itertools::Itertools;
use ndarray::{Array1, Array2, ArrayView1, Axis, s};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;
use wolfe_bfgs::{Bfgs, BfgsSolution};

const LOG_SD_MIN: f64 = -12.0;
const LOG_SD_MAX: f64 = 5.0;
const ATANH_RHO_BOUND: f64 = 6.0;
const FAILED_COST: f64 = 1e10;
const NEWTON_MAX_ITERATIONS: usize = 100;
const NEWTON_TOLERANCE: f64 = 1e-10;

#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("Invalid input for the hierarchical model: {0}")]
    InvalidInput(String),

    #[error("No small area has surveyed units.")]
    NoAreas,

    #[error("The {effects} model did not converge: {message}")]
    DidNotConverge {
        effects: RandomEffects,
        message: String,
    },

    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RandomEffects {
    /// Random intercept, fixed slope.
    Intercept,
    /// Correlated random intercept and random slope.
    InterceptAndSlope,
}

impl RandomEffects {
    fn parameter_count(self) -> usize {
        match self {
            Self::Intercept => 3,
            Self::InterceptAndSlope => 5,
        }
    }
}

impl fmt::Display for RandomEffects {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Intercept => "random-intercept",
            Self::InterceptAndSlope => "random-slope",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HierarchicalConfig {
    /// Gradient-norm tolerance for the BFGS outer optimization.
    pub tolerance: f64,
    pub max_iterations: usize,
    /// Minimum AIC improvement before the random-slope model is preferred.
    pub delta_aic_threshold: f64,
    /// Largest |ρ| between random intercept and slope still considered identified.
    pub max_abs_correlation: f64,
    /// Random-effect standard deviations below this are treated as singular.
    ///
    /// SDs are searched on the log scale, where the gradient vanishes as the
    /// SD approaches zero, so a collapsing variance stops well above zero.
    /// On the logit scale 0.01 is already a negligible between-area spread.
    pub min_random_sd: f64,
    pub posterior: PosteriorConfig,
}

impl Default for HierarchicalConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-4,
            max_iterations: 500,
            delta_aic_threshold: 2.0,
            max_abs_correlation: 0.95,
            min_random_sd: 1e-2,
            posterior: PosteriorConfig::default(),
        }
    }
}

/// Why a converged fit should not be trusted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DegeneracyReason {
    /// A random-effect standard deviation collapsed to (near) zero.
    SingularCovariance { component: String, sd: f64 },
    /// Random intercept and slope are (nearly) perfectly correlated.
    PerfectCorrelation { rho: f64 },
    /// The marginal likelihood is flat or saddle-shaped at the optimum.
    HessianNotPositiveDefinite,
}

impl fmt::Display for DegeneracyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SingularCovariance { component, sd } => {
                write!(f, "random {component} SD {sd:.2e} is effectively zero")
            }
            Self::PerfectCorrelation { rho } => {
                write!(f, "random-effect correlation {rho:.3} signals overparameterization")
            }
            Self::HessianNotPositiveDefinite => {
                f.write_str("information matrix is not positive definite")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FitReliability {
    Reliable,
    Degenerate(DegeneracyReason),
}

impl FitReliability {
    pub fn is_reliable(&self) -> bool {
        matches!(self, Self::Reliable)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub std_error: Option<f64>,
}

/// Conditional mode of one area's random effects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaEffect {
    pub area_id: String,
    pub units: usize,
    pub intercept_offset: Estimate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slope_offset: Option<Estimate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FittedHierarchicalModel {
    pub effects: RandomEffects,
    pub intercept: Estimate,
    pub slope: Estimate,
    pub random_intercept_sd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub random_slope_sd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation: Option<f64>,
    pub log_likelihood: f64,
    pub aic: f64,
    pub bic: f64,
    pub n_units: usize,
    pub iterations: usize,
    pub reliability: FitReliability,
    pub areas: Vec<AreaEffect>,
}

impl FittedHierarchicalModel {
    pub fn area(&self, area_id: &str) -> Option<&AreaEffect> {
        self.areas.iter().find(|a| a.area_id == area_id)
    }

    /// Area-specific `(intercept, slope)` on the logit scale.
    pub fn area_coefficients(&self, area_id: &str) -> Option<(f64, f64)> {
        let area = self.area(area_id)?;
        let slope_offset = area.slope_offset.map_or(0.0, |e| e.value);
        Some((
            self.intercept.value + area.intercept_offset.value,
            self.slope.value + slope_offset,
        ))
    }

    /// Saves the model to a TOML file.
    pub fn save(&self, path: &Path) -> Result<(), EstimationError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, EstimationError> {
        let toml_string = fs::read_to_string(path)?;
        Ok(toml::from_str(&toml_string)?)
    }
}

/// Units grouped by small area, in ascending area-id order.
#[derive(Debug, Clone)]
pub struct AreaDesign {
    area_ids: Vec<String>,
    members: Vec<Vec<usize>>,
    labels: Array1<f64>,
    scores: Array1<f64>,
}

impl AreaDesign {
    pub fn new(
        area_ids: &[String],
        labels: ArrayView1<f64>,
        scores: ArrayView1<f64>,
    ) -> Result<Self, EstimationError> {
        let n = area_ids.len();
        if labels.len() != n || scores.len() != n {
            return Err(EstimationError::InvalidInput(format!(
                "{n} area ids, {} labels and {} scores",
                labels.len(),
                scores.len()
            )));
        }
        if let Some(bad) = labels.iter().find(|&&y| y != 0.0 && y != 1.0) {
            return Err(EstimationError::InvalidInput(format!(
                "label {bad} is neither 0 nor 1"
            )));
        }
        if scores.iter().any(|s| !s.is_finite()) {
            return Err(EstimationError::InvalidInput(
                "spatial scores must be finite".to_string(),
            ));
        }
        if let Some(row) = area_ids.iter().position(|a| a.is_empty()) {
            return Err(EstimationError::InvalidInput(format!(
                "unit at row {row} has no small-area id"
            )));
        }
        let mut groups: AHashMap<&str, Vec<usize>> = AHashMap::new();
        for (row, id) in area_ids.iter().enumerate() {
            groups.entry(id.as_str()).or_default().push(row);
        }
        let (area_ids, members) = groups
            .into_iter()
            .sorted_by(|a, b| a.0.cmp(b.0))
            .map(|(id, rows)| (id.to_string(), rows))
            .unzip();
        Ok(Self {
            area_ids,
            members,
            labels: labels.to_owned(),
            scores: scores.to_owned(),
        })
    }

    /// Uses the table's `spatial_score` column.
    pub fn from_observations(table: &ObservationTable) -> Result<Self, EstimationError> {
        let scores = table.spatial_score.as_ref().ok_or_else(|| {
            EstimationError::InvalidInput("observations carry no spatial_score".to_string())
        })?;
        Self::new(&table.area_ids, table.labels.view(), scores.view())
    }

    pub fn n_units(&self) -> usize {
        self.labels.len()
    }

    pub fn n_areas(&self) -> usize {
        self.area_ids.len()
    }

    pub fn area_ids(&self) -> &[String] {
        &self.area_ids
    }

    pub fn labels(&self) -> ArrayView1<'_, f64> {
        self.labels.view()
    }

    pub fn scores(&self) -> ArrayView1<'_, f64> {
        self.scores.view()
    }

    pub fn members(&self, area: usize) -> &[usize] {
        &self.members[area]
    }
}

/// Bernoulli log-likelihood of `y` at logit `eta`.
#[inline]
pub(crate) fn bernoulli_log_lik(y: f64, eta: f64) -> f64 {
    if eta > 0.0 {
        y * eta - eta - (-eta).exp().ln_1p()
    } else {
        y * eta - eta.exp().ln_1p()
    }
}

#[inline]
fn inv_logit(eta: f64) -> f64 {
    1.0 / (1.0 + (-eta.clamp(-700.0, 700.0)).exp())
}

/// Model parameters on their natural scale.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Parameters {
    pub beta0: f64,
    pub beta1: f64,
    pub sd_u: f64,
    pub sd_v: f64,
    pub rho: f64,
}

impl Parameters {
    fn from_vector(effects: RandomEffects, theta: &Array1<f64>) -> Self {
        let sd = |x: f64| x.clamp(LOG_SD_MIN, LOG_SD_MAX).exp();
        match effects {
            RandomEffects::Intercept => Self {
                beta0: theta[0],
                beta1: theta[1],
                sd_u: sd(theta[2]),
                sd_v: 0.0,
                rho: 0.0,
            },
            RandomEffects::InterceptAndSlope => Self {
                beta0: theta[0],
                beta1: theta[1],
                sd_u: sd(theta[2]),
                sd_v: sd(theta[3]),
                rho: theta[4].clamp(-ATANH_RHO_BOUND, ATANH_RHO_BOUND).tanh(),
            },
        }
    }
}

/// Gaussian prior on an area's random effects.
struct Prior {
    dim: usize,
    precision: [[f64; 2]; 2],
    log_det_covariance: f64,
}

impl Prior {
    fn new(effects: RandomEffects, p: &Parameters) -> Option<Self> {
        match effects {
            RandomEffects::Intercept => {
                let var = p.sd_u * p.sd_u;
                (var > 0.0).then(|| Self {
                    dim: 1,
                    precision: [[1.0 / var, 0.0], [0.0, 0.0]],
                    log_det_covariance: var.ln(),
                })
            }
            RandomEffects::InterceptAndSlope => {
                let (vu, vv) = (p.sd_u * p.sd_u, p.sd_v * p.sd_v);
                let cov = p.rho * p.sd_u * p.sd_v;
                let det = vu * vv - cov * cov;
                (det > 0.0 && det.is_finite()).then(|| Self {
                    dim: 2,
                    precision: [[vv / det, -cov / det], [-cov / det, vu / det]],
                    log_det_covariance: det.ln(),
                })
            }
        }
    }
}

/// Conditional mode of one area with its Laplace log-likelihood contribution.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AreaMode {
    pub effects: [f64; 2],
    /// Inverse of the negative Hessian at the mode.
    pub covariance: [[f64; 2]; 2],
    pub log_lik: f64,
}

struct LocalFit {
    value: f64,
    gradient: [f64; 2],
    /// Negative Hessian, positive definite.
    information: [[f64; 2]; 2],
}

fn local_fit(design: &AreaDesign, area: usize, p: &Parameters, prior: &Prior, b: [f64; 2]) -> LocalFit {
    let mut value = 0.0;
    let mut gradient = [0.0; 2];
    let mut information = [[0.0; 2]; 2];
    for &j in design.members(area) {
        let s = design.scores[j];
        let y = design.labels[j];
        let eta = p.beta0 + b[0] + (p.beta1 + b[1]) * s;
        let mu = inv_logit(eta);
        let w = mu * (1.0 - mu);
        value += bernoulli_log_lik(y, eta);
        gradient[0] += y - mu;
        gradient[1] += (y - mu) * s;
        information[0][0] += w;
        information[0][1] += w * s;
        information[1][1] += w * s * s;
    }
    information[1][0] = information[0][1];
    let pb = [
        prior.precision[0][0] * b[0] + prior.precision[0][1] * b[1],
        prior.precision[1][0] * b[0] + prior.precision[1][1] * b[1],
    ];
    value -= 0.5 * (b[0] * pb[0] + b[1] * pb[1]);
    for k in 0..2 {
        gradient[k] -= pb[k];
        for l in 0..2 {
            information[k][l] += prior.precision[k][l];
        }
    }
    LocalFit {
        value,
        gradient,
        information,
    }
}

fn solve(dim: usize, a: &[[f64; 2]; 2], g: [f64; 2]) -> Option<[f64; 2]> {
    if dim == 1 {
        return (a[0][0] > 0.0).then(|| [g[0] / a[0][0], 0.0]);
    }
    let det = a[0][0] * a[1][1] - a[0][1] * a[1][0];
    (det > 0.0).then(|| {
        [
            (a[1][1] * g[0] - a[0][1] * g[1]) / det,
            (a[0][0] * g[1] - a[1][0] * g[0]) / det,
        ]
    })
}

fn inverse(dim: usize, a: &[[f64; 2]; 2]) -> Option<([[f64; 2]; 2], f64)> {
    if dim == 1 {
        return (a[0][0] > 0.0).then(|| ([[1.0 / a[0][0], 0.0], [0.0, 0.0]], a[0][0].ln()));
    }
    let det = a[0][0] * a[1][1] - a[0][1] * a[1][0];
    (det > 0.0).then(|| {
        (
            [
                [a[1][1] / det, -a[0][1] / det],
                [-a[1][0] / det, a[0][0] / det],
            ],
            det.ln(),
        )
    })
}

fn conditional_mode(design: &AreaDesign, area: usize, p: &Parameters, prior: &Prior) -> Option<AreaMode> {
    let mut b = [0.0; 2];
    let mut fit = local_fit(design, area, p, prior, b);
    for _ in 0..NEWTON_MAX_ITERATIONS {
        let step = solve(prior.dim, &fit.information, fit.gradient)?;
        let mut t = 1.0;
        let mut moved = false;
        while t > 1e-8 {
            let candidate = [b[0] + t * step[0], b[1] + t * step[1]];
            let next = local_fit(design, area, p, prior, candidate);
            if next.value.is_finite() && next.value >= fit.value - 1e-12 {
                b = candidate;
                fit = next;
                moved = true;
                break;
            }
            t *= 0.5;
        }
        if !moved || (t * step[0]).abs().max((t * step[1]).abs()) < NEWTON_TOLERANCE {
            break;
        }
    }
    let (covariance, log_det_information) = inverse(prior.dim, &fit.information)?;
    let log_lik = fit.value - 0.5 * prior.log_det_covariance - 0.5 * log_det_information;
    log_lik.is_finite().then_some(AreaMode {
        effects: b,
        covariance,
        log_lik,
    })
}

/// Laplace-approximated marginal log-likelihood and the per-area modes.
pub(crate) fn marginal_fit(
    design: &AreaDesign,
    effects: RandomEffects,
    p: &Parameters,
) -> Option<(f64, Vec<AreaMode>)> {
    let prior = Prior::new(effects, p)?;
    let modes = (0..design.n_areas())
        .map(|area| conditional_mode(design, area, p, &prior))
        .collect::<Option<Vec<_>>>()?;
    let total: f64 = modes.iter().map(|m| m.log_lik).sum();
    total.is_finite().then_some((total, modes))
}

fn cost(design: &AreaDesign, effects: RandomEffects, theta: &Array1<f64>) -> f64 {
    let p = Parameters::from_vector(effects, theta);
    match marginal_fit(design, effects, &p) {
        Some((ll, _)) => -ll,
        None => FAILED_COST,
    }
}

fn step_size(x: f64) -> f64 {
    1e-5 * x.abs().max(1.0)
}

fn numerical_gradient(design: &AreaDesign, effects: RandomEffects, theta: &Array1<f64>) -> Array1<f64> {
    let mut grad = Array1::zeros(theta.len());
    let mut shifted = theta.clone();
    for k in 0..theta.len() {
        let h = step_size(theta[k]);
        shifted[k] = theta[k] + h;
        let up = cost(design, effects, &shifted);
        shifted[k] = theta[k] - h;
        let down = cost(design, effects, &shifted);
        shifted[k] = theta[k];
        grad[k] = (up - down) / (2.0 * h);
    }
    grad
}

fn numerical_hessian(design: &AreaDesign, effects: RandomEffects, theta: &Array1<f64>) -> Array2<f64> {
    let d = theta.len();
    let mut hessian = Array2::zeros((d, d));
    let mut shifted = theta.clone();
    let steps: Vec<f64> = theta.iter().map(|&x| 1e2 * step_size(x)).collect();
    for k in 0..d {
        for l in k..d {
            let mut corner = |dk: f64, dl: f64| {
                shifted.assign(theta);
                shifted[k] += dk * steps[k];
                shifted[l] += dl * steps[l];
                cost(design, effects, &shifted)
            };
            let value = (corner(1.0, 1.0) - corner(1.0, -1.0) - corner(-1.0, 1.0) + corner(-1.0, -1.0))
                / (4.0 * steps[k] * steps[l]);
            hessian[[k, l]] = value;
            hessian[[l, k]] = value;
        }
    }
    hessian
}

fn run_bfgs(
    design: &AreaDesign,
    effects: RandomEffects,
    start: Array1<f64>,
    config: &HierarchicalConfig,
) -> Result<(Array1<f64>, f64, usize), String> {
    let initial = cost(design, effects, &start);
    if initial >= FAILED_COST {
        return Err("marginal likelihood is not finite at the starting point".to_string());
    }
    let objective = |theta: &Array1<f64>| -> (f64, Array1<f64>) {
        let value = cost(design, effects, theta);
        let grad = if value >= FAILED_COST {
            Array1::zeros(theta.len())
        } else {
            numerical_gradient(design, effects, theta)
        };
        (value, grad)
    };
    let BfgsSolution {
        final_point,
        final_value,
        iterations,
        ..
    } = Bfgs::new(start, objective)
        .with_tolerance(config.tolerance)
        .with_max_iterations(config.max_iterations)
        .run()
        .map_err(|e| format!("BFGS failed: {e:?}"))?;
    if final_value >= FAILED_COST {
        return Err("optimizer ended in an infeasible region".to_string());
    }
    Ok((final_point, final_value, iterations))
}

/// Fixed-effect starting values from an ordinary logistic regression on the score.
fn fixed_effect_start(design: &AreaDesign) -> (f64, f64) {
    let x = design.scores.view().insert_axis(Axis(1));
    match fit_ridge_logistic(x, design.labels.view(), 1e-6, 100, 1e-10) {
        Ok(model) => {
            let slope = model.raw_coefficients()[0];
            (model.intercept - slope * model.means[0], slope)
        }
        Err(_) => {
            let prevalence = design.labels.mean().unwrap_or(0.5).clamp(0.01, 0.99);
            ((prevalence / (1.0 - prevalence)).ln(), 0.0)
        }
    }
}

fn starting_point(design: &AreaDesign, effects: RandomEffects, warm: Option<&FittedHierarchicalModel>) -> Array1<f64> {
    let (beta0, beta1, sd_u) = match warm {
        Some(model) => (model.intercept.value, model.slope.value, model.random_intercept_sd),
        None => {
            let (b0, b1) = fixed_effect_start(design);
            (b0, b1, 0.5)
        }
    };
    let log_sd_u = sd_u.max(0.05).ln();
    match effects {
        RandomEffects::Intercept => Array1::from_vec(vec![beta0, beta1, log_sd_u]),
        RandomEffects::InterceptAndSlope => {
            Array1::from_vec(vec![beta0, beta1, log_sd_u, 0.25_f64.ln(), 0.0])
        }
    }
}

/// Fits the hierarchical model by Laplace-approximated maximum marginal likelihood.
pub fn fit_hierarchical(
    design: &AreaDesign,
    effects: RandomEffects,
    config: &HierarchicalConfig,
) -> Result<FittedHierarchicalModel, EstimationError> {
    fit_from(design, effects, config, None)
}

pub(crate) fn fit_from(
    design: &AreaDesign,
    effects: RandomEffects,
    config: &HierarchicalConfig,
    warm: Option<&FittedHierarchicalModel>,
) -> Result<FittedHierarchicalModel, EstimationError> {
    if design.n_areas() == 0 {
        return Err(EstimationError::NoAreas);
    }
    let start = starting_point(design, effects, warm);
    log::info!(
        "Fitting {effects} model on {} units in {} areas",
        design.n_units(),
        design.n_areas()
    );

    let (theta, final_value, iterations) = match run_bfgs(design, effects, start.clone(), config) {
        Ok(solution) => solution,
        Err(first) => {
            log::warn!("{effects} fit failed ({first}); retrying from a perturbed start");
            let mut perturbed = start;
            perturbed[0] += 0.1;
            perturbed.slice_mut(s![2..]).mapv_inplace(|v| v + 0.5);
            run_bfgs(design, effects, perturbed, config).map_err(|message| {
                EstimationError::DidNotConverge { effects, message }
            })?
        }
    };

    let params = Parameters::from_vector(effects, &theta);
    let (log_likelihood, modes) = marginal_fit(design, effects, &params).ok_or_else(|| {
        EstimationError::DidNotConverge {
            effects,
            message: "area modes could not be recovered at the optimum".to_string(),
        }
    })?;
    log::info!(
        "{effects} fit converged in {iterations} iterations (negative log-likelihood {final_value:.4})"
    );
    Ok(assemble(design, effects, config, &theta, params, log_likelihood, modes, iterations))
}

/// Builds the model record, standard errors and reliability from an optimum.
#[allow(clippy::too_many_arguments)]
pub(crate) fn assemble(
    design: &AreaDesign,
    effects: RandomEffects,
    config: &HierarchicalConfig,
    theta: &Array1<f64>,
    params: Parameters,
    log_likelihood: f64,
    modes: Vec<AreaMode>,
    iterations: usize,
) -> FittedHierarchicalModel {
    let hessian = numerical_hessian(design, effects, theta);
    let full = hessian.cholesky(Side::Lower).map(|f| f.inverse());
    let fixed_se = match &full {
        Ok(inv) => Some((inv[[0, 0]].sqrt(), inv[[1, 1]].sqrt())),
        Err(_) => hessian
            .slice(s![..2, ..2])
            .to_owned()
            .cholesky(Side::Lower)
            .ok()
            .map(|f| {
                let inv = f.inverse();
                (inv[[0, 0]].sqrt(), inv[[1, 1]].sqrt())
            }),
    };

    let reliability = if params.sd_u < config.min_random_sd {
        FitReliability::Degenerate(DegeneracyReason::SingularCovariance {
            component: "intercept".to_string(),
            sd: params.sd_u,
        })
    } else if effects == RandomEffects::InterceptAndSlope && params.sd_v < config.min_random_sd {
        FitReliability::Degenerate(DegeneracyReason::SingularCovariance {
            component: "slope".to_string(),
            sd: params.sd_v,
        })
    } else if effects == RandomEffects::InterceptAndSlope
        && params.rho.abs() > config.max_abs_correlation
    {
        FitReliability::Degenerate(DegeneracyReason::PerfectCorrelation { rho: params.rho })
    } else if full.is_err() {
        FitReliability::Degenerate(DegeneracyReason::HessianNotPositiveDefinite)
    } else {
        FitReliability::Reliable
    };
    if let FitReliability::Degenerate(reason) = &reliability {
        log::warn!("{effects} fit is degenerate: {reason}");
    }

    let k = effects.parameter_count() as f64;
    let n = design.n_units() as f64;
    let areas = design
        .area_ids()
        .iter()
        .zip(&modes)
        .enumerate()
        .map(|(i, (id, mode))| AreaEffect {
            area_id: id.clone(),
            units: design.members(i).len(),
            intercept_offset: Estimate {
                value: mode.effects[0],
                std_error: Some(mode.covariance[0][0].sqrt()),
            },
            slope_offset: (effects == RandomEffects::InterceptAndSlope).then(|| Estimate {
                value: mode.effects[1],
                std_error: Some(mode.covariance[1][1].sqrt()),
            }),
        })
        .collect();

    let slope_model = effects == RandomEffects::InterceptAndSlope;
    FittedHierarchicalModel {
        effects,
        intercept: Estimate {
            value: params.beta0,
            std_error: fixed_se.map(|se| se.0).filter(|v| v.is_finite()),
        },
        slope: Estimate {
            value: params.beta1,
            std_error: fixed_se.map(|se| se.1).filter(|v| v.is_finite()),
        },
        random_intercept_sd: params.sd_u,
        random_slope_sd: slope_model.then_some(params.sd_v),
        correlation: slope_model.then_some(params.rho),
        log_likelihood,
        aic: 2.0 * k - 2.0 * log_likelihood,
        bic: k * n.ln() - 2.0 * log_likelihood,
        n_units: design.n_units(),
        iterations,
        reliability,
        areas,
    }
}

/// Re-evaluates the marginal likelihood at given natural-scale parameters.
pub(crate) fn evaluate_at(
    design: &AreaDesign,
    effects: RandomEffects,
    config: &HierarchicalConfig,
    params: Parameters,
) -> Option<FittedHierarchicalModel> {
    let theta = match effects {
        RandomEffects::Intercept => Array1::from_vec(vec![params.beta0, params.beta1, params.sd_u.ln()]),
        RandomEffects::InterceptAndSlope => Array1::from_vec(vec![
            params.beta0,
            params.beta1,
            params.sd_u.ln(),
            params.sd_v.ln(),
            params.rho.atanh(),
        ]),
    };
    let (log_likelihood, modes) = marginal_fit(design, effects, &params)?;
    Some(assemble(design, effects, config, &theta, params, log_likelihood, modes, 0))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::{Distribution, Normal};

    /// Simulated units with area intercepts `N(0, tau²)` and optional slope offsets.
    pub fn simulate(
        areas: usize,
        per_area: usize,
        beta: (f64, f64),
        tau: f64,
        slope_sd: f64,
        seed: u64,
    ) -> AreaDesign {
        let mut rng = StdRng::seed_from_u64(seed);
        let u_dist = Normal::new(0.0, tau).unwrap();
        let v_dist = Normal::new(0.0, slope_sd.max(1e-12)).unwrap();
        let mut ids = Vec::new();
        let mut labels = Vec::new();
        let mut scores = Vec::new();
        for a in 0..areas {
            let u = u_dist.sample(&mut rng);
            let v = if slope_sd > 0.0 { v_dist.sample(&mut rng) } else { 0.0 };
            for _ in 0..per_area {
                let s: f64 = rng.gen_range(0.0..1.0);
                let p = inv_logit(beta.0 + u + (beta.1 + v) * s);
                ids.push(format!("area{a:02}"));
                labels.push(if rng.gen_range(0.0..1.0) < p { 1.0 } else { 0.0 });
                scores.push(s);
            }
        }
        AreaDesign::new(&ids, Array1::from_vec(labels).view(), Array1::from_vec(scores).view()).unwrap()
    }
}
