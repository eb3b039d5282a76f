//! Bayesian variant of the random-intercept model.
//!
//! A seeded Metropolis-within-Gibbs sampler over the area intercepts `u_i`,
//! the fixed effects and `log τ`, with priors `β ~ N(0, 2.5²)` and
//! `τ ~ half-Normal(0, 1)`. Proposal scales adapt during burn-in toward an
//! acceptance rate near 0.44 and stay frozen afterwards.

use crate::mrp::hierarchical::{
    AreaDesign, EstimationError, Estimate, FittedHierarchicalModel, HierarchicalConfig,
    Parameters, RandomEffects, bernoulli_log_lik, evaluate_at,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

const TARGET_ACCEPTANCE: f64 = 0.44;
const ADAPT_EVERY: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PosteriorConfig {
    /// Retained draws after burn-in.
    pub draws: usize,
    pub burn_in: usize,
    pub seed: u64,
    pub credible_level: f64,
    pub prior_beta_sd: f64,
    pub prior_tau_scale: f64,
}

impl Default for PosteriorConfig {
    fn default() -> Self {
        Self {
            draws: 4000,
            burn_in: 1000,
            seed: 42,
            credible_level: 0.95,
            prior_beta_sd: 2.5,
            prior_tau_scale: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterSummary {
    pub mean: f64,
    pub sd: f64,
    /// Equal-tailed credible bounds at `credible_level`.
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaPosterior {
    pub area_id: String,
    pub offset: ParameterSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosteriorSummary {
    pub draws: usize,
    pub credible_level: f64,
    pub intercept: ParameterSummary,
    pub slope: ParameterSummary,
    pub tau: ParameterSummary,
    pub areas: Vec<AreaPosterior>,
    /// Acceptance rate of the fixed-effect updates after burn-in.
    pub acceptance_rate: f64,
}

impl PosteriorSummary {
    /// Expresses the posterior means as a fitted model so that poststratification
    /// can consume either estimator.
    pub fn to_model(
        &self,
        design: &AreaDesign,
        config: &HierarchicalConfig,
    ) -> Result<FittedHierarchicalModel, EstimationError> {
        let params = Parameters {
            beta0: self.intercept.mean,
            beta1: self.slope.mean,
            sd_u: self.tau.mean,
            sd_v: 0.0,
            rho: 0.0,
        };
        let mut model = evaluate_at(design, RandomEffects::Intercept, config, params).ok_or_else(|| {
            EstimationError::InvalidInput(
                "posterior means give a non-finite marginal likelihood".to_string(),
            )
        })?;
        model.intercept = Estimate {
            value: self.intercept.mean,
            std_error: Some(self.intercept.sd),
        };
        model.slope = Estimate {
            value: self.slope.mean,
            std_error: Some(self.slope.sd),
        };
        for (area, posterior) in model.areas.iter_mut().zip(&self.areas) {
            area.intercept_offset = Estimate {
                value: posterior.offset.mean,
                std_error: Some(posterior.offset.sd),
            };
        }
        Ok(model)
    }
}

struct Proposal {
    step: f64,
    accepted: usize,
    proposed: usize,
}

impl Proposal {
    fn new(step: f64) -> Self {
        Self {
            step,
            accepted: 0,
            proposed: 0,
        }
    }

    fn record(&mut self, accepted: bool) {
        self.proposed += 1;
        self.accepted += usize::from(accepted);
    }

    fn rate(&self) -> f64 {
        if self.proposed == 0 {
            0.0
        } else {
            self.accepted as f64 / self.proposed as f64
        }
    }

    fn adapt(&mut self) {
        if self.rate() > TARGET_ACCEPTANCE {
            self.step *= 1.2;
        } else {
            self.step /= 1.2;
        }
        self.accepted = 0;
        self.proposed = 0;
    }
}

struct Chain<'a> {
    design: &'a AreaDesign,
    beta0: f64,
    beta1: f64,
    log_tau: f64,
    offsets: Vec<f64>,
}

impl Chain<'_> {
    fn area_log_lik(&self, area: usize, beta0: f64, beta1: f64, offset: f64) -> f64 {
        let labels = self.design.labels();
        let scores = self.design.scores();
        self.design
            .members(area)
            .iter()
            .map(|&j| bernoulli_log_lik(labels[j], beta0 + offset + beta1 * scores[j]))
            .sum()
    }

    fn data_log_lik(&self, beta0: f64, beta1: f64) -> f64 {
        (0..self.design.n_areas())
            .map(|a| self.area_log_lik(a, beta0, beta1, self.offsets[a]))
            .sum()
    }

    fn tau_log_target(&self, log_tau: f64, prior_scale: f64) -> f64 {
        let tau = log_tau.exp();
        let spread: f64 = self.offsets.iter().map(|u| u * u).sum();
        -(self.offsets.len() as f64) * log_tau - spread / (2.0 * tau * tau)
            - tau * tau / (2.0 * prior_scale * prior_scale)
            + log_tau
    }
}

fn accept(rng: &mut StdRng, log_ratio: f64) -> bool {
    log_ratio.is_finite() && rng.gen_range(0.0_f64..1.0).ln() < log_ratio
}

fn summarize(mut draws: Vec<f64>, level: f64) -> ParameterSummary {
    let n = draws.len() as f64;
    let mean = draws.iter().sum::<f64>() / n;
    let var = draws.iter().map(|d| (d - mean) * (d - mean)).sum::<f64>() / (n - 1.0).max(1.0);
    draws.sort_by(f64::total_cmp);
    let quantile = |q: f64| {
        let pos = q * (draws.len() - 1) as f64;
        let lo = pos.floor() as usize;
        let hi = pos.ceil() as usize;
        draws[lo] + (pos - lo as f64) * (draws[hi] - draws[lo])
    };
    let tail = (1.0 - level) / 2.0;
    ParameterSummary {
        mean,
        sd: var.sqrt(),
        lower: quantile(tail),
        upper: quantile(1.0 - tail),
    }
}

/// Samples the random-intercept posterior, starting from a fitted model.
pub fn sample_posterior(
    design: &AreaDesign,
    start: &FittedHierarchicalModel,
    config: &PosteriorConfig,
) -> Result<PosteriorSummary, EstimationError> {
    if start.effects != RandomEffects::Intercept {
        return Err(EstimationError::InvalidInput(
            "posterior sampling supports the random-intercept model only".to_string(),
        ));
    }
    if config.draws < 2 {
        return Err(EstimationError::InvalidInput(format!(
            "at least 2 posterior draws are required, got {}",
            config.draws
        )));
    }
    if !(config.credible_level > 0.0 && config.credible_level < 1.0) {
        return Err(EstimationError::InvalidInput(format!(
            "credible level {} is not in (0, 1)",
            config.credible_level
        )));
    }
    if start.areas.len() != design.n_areas() {
        return Err(EstimationError::InvalidInput(format!(
            "starting model has {} areas, design has {}",
            start.areas.len(),
            design.n_areas()
        )));
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let standard = Normal::new(0.0, 1.0).map_err(|e| EstimationError::InvalidInput(e.to_string()))?;
    let mut chain = Chain {
        design,
        beta0: start.intercept.value,
        beta1: start.slope.value,
        log_tau: start.random_intercept_sd.max(0.05).ln(),
        offsets: start.areas.iter().map(|a| a.intercept_offset.value).collect(),
    };
    let beta_precision = 1.0 / (config.prior_beta_sd * config.prior_beta_sd);

    let mut area_steps: Vec<Proposal> = (0..design.n_areas()).map(|_| Proposal::new(0.5)).collect();
    let mut beta0_step = Proposal::new(0.2);
    let mut beta1_step = Proposal::new(0.2);
    let mut tau_step = Proposal::new(0.3);

    let mut beta0_draws = Vec::with_capacity(config.draws);
    let mut beta1_draws = Vec::with_capacity(config.draws);
    let mut tau_draws = Vec::with_capacity(config.draws);
    let mut offset_draws = vec![Vec::with_capacity(config.draws); design.n_areas()];

    log::info!(
        "Sampling random-intercept posterior: {} burn-in + {} draws (seed {})",
        config.burn_in,
        config.draws,
        config.seed
    );
    for iteration in 0..config.burn_in + config.draws {
        let tau = chain.log_tau.exp();
        for area in 0..design.n_areas() {
            let current = chain.offsets[area];
            let proposal = current + area_steps[area].step * standard.sample(&mut rng);
            let log_ratio = chain.area_log_lik(area, chain.beta0, chain.beta1, proposal)
                - chain.area_log_lik(area, chain.beta0, chain.beta1, current)
                - (proposal * proposal - current * current) / (2.0 * tau * tau);
            let accepted = accept(&mut rng, log_ratio);
            if accepted {
                chain.offsets[area] = proposal;
            }
            area_steps[area].record(accepted);
        }

        let current_lik = chain.data_log_lik(chain.beta0, chain.beta1);
        let proposal = chain.beta0 + beta0_step.step * standard.sample(&mut rng);
        let proposal_lik = chain.data_log_lik(proposal, chain.beta1);
        let log_ratio = proposal_lik - current_lik
            - 0.5 * beta_precision * (proposal * proposal - chain.beta0 * chain.beta0);
        let accepted = accept(&mut rng, log_ratio);
        let current_lik = if accepted {
            chain.beta0 = proposal;
            proposal_lik
        } else {
            current_lik
        };
        beta0_step.record(accepted);

        let proposal = chain.beta1 + beta1_step.step * standard.sample(&mut rng);
        let log_ratio = chain.data_log_lik(chain.beta0, proposal) - current_lik
            - 0.5 * beta_precision * (proposal * proposal - chain.beta1 * chain.beta1);
        let accepted = accept(&mut rng, log_ratio);
        if accepted {
            chain.beta1 = proposal;
        }
        beta1_step.record(accepted);

        let proposal = chain.log_tau + tau_step.step * standard.sample(&mut rng);
        let log_ratio = chain.tau_log_target(proposal, config.prior_tau_scale)
            - chain.tau_log_target(chain.log_tau, config.prior_tau_scale);
        let accepted = accept(&mut rng, log_ratio);
        if accepted {
            chain.log_tau = proposal;
        }
        tau_step.record(accepted);

        if iteration < config.burn_in {
            if (iteration + 1) % ADAPT_EVERY == 0 {
                area_steps.iter_mut().for_each(Proposal::adapt);
                beta0_step.adapt();
                beta1_step.adapt();
                tau_step.adapt();
            }
            if iteration + 1 == config.burn_in {
                // Counters restart so the reported rate covers retained draws only.
                for p in [&mut beta0_step, &mut beta1_step] {
                    p.accepted = 0;
                    p.proposed = 0;
                }
            }
            continue;
        }
        beta0_draws.push(chain.beta0);
        beta1_draws.push(chain.beta1);
        tau_draws.push(chain.log_tau.exp());
        for (draws, &u) in offset_draws.iter_mut().zip(&chain.offsets) {
            draws.push(u);
        }
    }

    let acceptance_rate = 0.5 * (beta0_step.rate() + beta1_step.rate());
    let level = config.credible_level;
    let summary = PosteriorSummary {
        draws: config.draws,
        credible_level: level,
        intercept: summarize(beta0_draws, level),
        slope: summarize(beta1_draws, level),
        tau: summarize(tau_draws, level),
        areas: design
            .area_ids()
            .iter()
            .zip(offset_draws)
            .map(|(id, draws)| AreaPosterior {
                area_id: id.clone(),
                offset: summarize(draws, level),
            })
            .collect(),
        acceptance_rate,
    };
    log::info!(
        "Posterior: β0 {:.3} ± {:.3}, β1 {:.3} ± {:.3}, τ {:.3} (fixed-effect acceptance {:.2})",
        summary.intercept.mean,
        summary.intercept.sd,
        summary.slope.mean,
        summary.slope.sd,
        summary.tau.mean,
        acceptance_rate
    );
    Ok(summary)
}
