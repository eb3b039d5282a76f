//! Choice between the fixed-slope and random-slope models.
//!
//! The random slope is kept only when it improves AIC by more than the
//! configured threshold, its fit is reliable, and the intercept/slope
//! correlation stays below the configured bound. Anything else falls back to
//! the random-intercept model.

use crate::mrp::hierarchical::{
    AreaDesign, EstimationError, FitReliability, FittedHierarchicalModel, HierarchicalConfig,
    RandomEffects, fit_from,
};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SelectionReason {
    /// The random slope improved AIC beyond the threshold with a reliable fit.
    MaterialImprovement,
    /// ΔAIC did not exceed the threshold.
    ImprovementBelowThreshold,
    /// The random-slope fit converged onto a degenerate solution.
    RandomSlopeDegenerate(String),
    /// The random-slope optimizer did not converge.
    RandomSlopeDidNotConverge(String),
}

impl fmt::Display for SelectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaterialImprovement => f.write_str("random slope improves AIC materially"),
            Self::ImprovementBelowThreshold => f.write_str("random slope does not improve AIC materially"),
            Self::RandomSlopeDegenerate(reason) => write!(f, "random slope fit is degenerate ({reason})"),
            Self::RandomSlopeDidNotConverge(message) => {
                write!(f, "random slope fit did not converge ({message})")
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionOutcome {
    pub chosen: FittedHierarchicalModel,
    /// The model that lost, when it could be fitted.
    pub alternative: Option<FittedHierarchicalModel>,
    pub reason: SelectionReason,
    /// `AIC(fixed slope) − AIC(random slope)`; positive favours the random slope.
    pub delta_aic: Option<f64>,
    pub lrt_statistic: Option<f64>,
    pub lrt_p_value: Option<f64>,
}

/// Fits both variants and applies the selection rule.
///
/// Fails only when the fixed-slope model itself cannot be fitted; there is no
/// simpler model to fall back to.
pub fn select_model(
    design: &AreaDesign,
    config: &HierarchicalConfig,
) -> Result<SelectionOutcome, EstimationError> {
    let fixed = fit_from(design, RandomEffects::Intercept, config, None)?;
    let random = match fit_from(design, RandomEffects::InterceptAndSlope, config, Some(&fixed)) {
        Ok(model) => model,
        Err(EstimationError::DidNotConverge { message, .. }) => {
            log::warn!("Random-slope model did not converge; keeping the random-intercept model");
            return Ok(SelectionOutcome {
                chosen: fixed,
                alternative: None,
                reason: SelectionReason::RandomSlopeDidNotConverge(message),
                delta_aic: None,
                lrt_statistic: None,
                lrt_p_value: None,
            });
        }
        Err(other) => return Err(other),
    };
    Ok(compare(fixed, random, config))
}

/// Applies the selection rule to two already fitted models.
pub fn compare(
    fixed: FittedHierarchicalModel,
    random: FittedHierarchicalModel,
    config: &HierarchicalConfig,
) -> SelectionOutcome {
    let delta_aic = fixed.aic - random.aic;
    let lrt = (2.0 * (random.log_likelihood - fixed.log_likelihood)).max(0.0);
    let p_value = ChiSquared::new(2.0).ok().map(|chi| chi.sf(lrt));
    let rho = random.correlation.unwrap_or(0.0);

    let reason = match &random.reliability {
        FitReliability::Degenerate(reason) => SelectionReason::RandomSlopeDegenerate(reason.to_string()),
        FitReliability::Reliable if rho.abs() > config.max_abs_correlation => {
            SelectionReason::RandomSlopeDegenerate(format!("|ρ| = {:.3} exceeds {}", rho.abs(), config.max_abs_correlation))
        }
        FitReliability::Reliable if delta_aic > config.delta_aic_threshold => {
            SelectionReason::MaterialImprovement
        }
        FitReliability::Reliable => SelectionReason::ImprovementBelowThreshold,
    };
    let (chosen, alternative) = if reason == SelectionReason::MaterialImprovement {
        (random, fixed)
    } else {
        (fixed, random)
    };
    log::info!(
        "Selected the {} model: {reason} (ΔAIC {delta_aic:.3}, LRT {lrt:.3}, ρ {rho:.3})",
        chosen.effects
    );
    SelectionOutcome {
        chosen,
        alternative: Some(alternative),
        reason,
        delta_aic: Some(delta_aic),
        lrt_statistic: Some(lrt),
        lrt_p_value: p_value,
    }
}
